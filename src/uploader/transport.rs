// 传输层抽象
//
// 会话控制器只消费传输层发出的四种文件级事件，
// 分片传输和整文件传输都实现同一个 trait，可以互相替换。

use crate::config::TransportMode;
use crate::uploader::target::UploadTarget;
use anyhow::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// 传输层事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// 文件进入传输队列
    FileQueued { identifier: String },
    /// 已发送字节数（单调不减）
    FileProgress {
        identifier: String,
        loaded: u64,
        total: u64,
    },
    /// 文件传输完成，附带最后一个请求的响应
    FileSuccess {
        identifier: String,
        status: u16,
        body: String,
    },
    /// 文件传输失败
    FileError {
        identifier: String,
        /// HTTP 状态码（未收到响应时为 None）
        status: Option<u16>,
        /// 传输异常描述
        error: Option<String>,
        body: String,
    },
}

/// 交给传输层的文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportFile {
    pub identifier: String,
    pub local_path: PathBuf,
    pub relative_path: String,
    pub file_name: String,
    pub size: u64,
}

impl From<&UploadTarget> for TransportFile {
    fn from(target: &UploadTarget) -> Self {
        let file_name = target
            .relative_path
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(&target.relative_path)
            .to_string();
        Self {
            identifier: target.identifier.clone(),
            local_path: target.local_path.clone(),
            relative_path: target.relative_path.clone(),
            file_name,
            size: target.size,
        }
    }
}

/// 传输层
///
/// `run` 在所有文件到达传输终态（成功或失败）或 `cancel` 触发后返回；
/// 每个文件恰好发出一个 FileSuccess 或 FileError（取消时可以都不发）。
#[async_trait]
pub trait UploadTransport: Send + Sync {
    fn mode(&self) -> TransportMode;

    async fn run(
        &self,
        files: Vec<TransportFile>,
        events: mpsc::UnboundedSender<TransportEvent>,
        cancel: CancellationToken,
    ) -> Result<()>;

    /// 是否支持暂停
    fn supports_pause(&self) -> bool {
        false
    }

    /// 暂停：中断正在传输的请求，保留队列
    fn pause(&self) {}

    fn resume(&self) {}
}
