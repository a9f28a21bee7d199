// 上传接口 HTTP 客户端
//
// 只负责收发请求：任何 HTTP 状态码都作为 Ok(HttpReply) 返回，
// 由调用方决定是否重试/如何分类；只有未收到响应的传输异常才返回 Err。

pub mod types;

pub use types::{
    HttpReply, ProcessingState, ProcessingStatus, ResourceId, ResumableParams,
    UploadResponseBody, UploadStatusEnvelope,
};

use anyhow::{Context, Result};
use futures::{StreamExt, TryStreamExt};
use reqwest::{multipart, Client};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// 已发送字节回调（参数为本次新发送的字节数）
pub type SentCallback = Arc<dyn Fn(u64) + Send + Sync>;

/// 流式请求体的分段大小
const STREAM_PIECE_SIZE: usize = 64 * 1024;

/// 上传客户端
#[derive(Debug, Clone)]
pub struct UploadClient {
    client: Client,
}

impl UploadClient {
    /// 创建客户端
    ///
    /// # 参数
    /// * `timeout` - 单个请求的超时时间
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }

    /// 探测分片是否已被服务器接收
    ///
    /// 200 表示已存在可跳过；409 表示整个文件已被接收；其他状态需要发送
    pub async fn test_chunk(&self, url: &str, params: &ResumableParams) -> Result<HttpReply> {
        let response = self
            .client
            .get(url)
            .query(&params.to_pairs())
            .send()
            .await
            .context("探测分片请求发送失败")?;

        let status = response.status().as_u16();
        let body = response.text().await.context("读取探测分片响应失败")?;

        debug!(
            "探测分片响应: id={}, chunk={}, status={}",
            params.resumable_identifier, params.resumable_chunk_number, status
        );

        Ok(HttpReply { status, body })
    }

    /// 上传一个分片（multipart，字节放在 `file` 字段）
    pub async fn upload_chunk(
        &self,
        url: &str,
        params: &ResumableParams,
        data: Vec<u8>,
        on_sent: SentCallback,
    ) -> Result<HttpReply> {
        let length = data.len() as u64;
        let pieces: Vec<Vec<u8>> = data
            .chunks(STREAM_PIECE_SIZE)
            .map(|piece| piece.to_vec())
            .collect();

        let stream = futures::stream::iter(pieces).map(move |piece| {
            on_sent(piece.len() as u64);
            Ok::<_, std::io::Error>(piece)
        });

        let part = multipart::Part::stream_with_length(reqwest::Body::wrap_stream(stream), length)
            .file_name(params.resumable_filename.clone())
            .mime_str("application/octet-stream")?;

        let mut form = multipart::Form::new();
        for (name, value) in params.to_pairs() {
            form = form.text(name, value);
        }
        let form = form.part("file", part);

        let response = self
            .client
            .post(url)
            .multipart(form)
            .send()
            .await
            .context("上传分片请求发送失败")?;

        let status = response.status().as_u16();
        let body = response.text().await.context("读取上传分片响应失败")?;

        debug!(
            "上传分片响应: id={}, chunk={}/{}, status={}, body={}",
            params.resumable_identifier,
            params.resumable_chunk_number,
            params.resumable_total_chunks,
            status,
            body
        );

        Ok(HttpReply { status, body })
    }

    /// 整文件上传（流式读取本地文件）
    pub async fn upload_file(
        &self,
        url: &str,
        field_name: &str,
        local_path: &Path,
        file_name: &str,
        on_sent: SentCallback,
    ) -> Result<HttpReply> {
        let file = tokio::fs::File::open(local_path)
            .await
            .with_context(|| format!("无法打开文件: {:?}", local_path))?;
        let size = file
            .metadata()
            .await
            .with_context(|| format!("无法读取文件信息: {:?}", local_path))?
            .len();

        let stream = tokio_util::io::ReaderStream::new(file)
            .inspect_ok(move |bytes| on_sent(bytes.len() as u64));

        let part = multipart::Part::stream_with_length(reqwest::Body::wrap_stream(stream), size)
            .file_name(file_name.to_string())
            .mime_str("application/octet-stream")?;

        let form = multipart::Form::new().part(field_name.to_string(), part);

        let response = self
            .client
            .post(url)
            .multipart(form)
            .send()
            .await
            .context("上传文件请求发送失败")?;

        let status = response.status().as_u16();
        let body = response.text().await.context("读取上传文件响应失败")?;

        debug!(
            "上传文件响应: file={}, size={}, status={}, body={}",
            file_name, size, status, body
        );

        Ok(HttpReply { status, body })
    }

    /// 查询服务器处理状态
    ///
    /// # 参数
    /// * `status_base` - 以 `/` 结尾的状态接口地址
    /// * `temp_name` - 上传响应中的关联令牌
    pub async fn fetch_upload_status(&self, status_base: &str, temp_name: &str) -> Result<HttpReply> {
        let url = format!("{}{}", status_base, urlencoding::encode(temp_name));

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("处理状态查询请求发送失败")?;

        let status = response.status().as_u16();
        let body = response.text().await.context("读取处理状态响应失败")?;

        debug!("处理状态响应: temp_name={}, status={}, body={}", temp_name, status, body);

        Ok(HttpReply { status, body })
    }
}
