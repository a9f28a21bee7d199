// 上传接口数据类型

use serde::{Deserialize, Serialize};

/// HTTP 响应（状态码 + 原始文本）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
}

impl HttpReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// resumable 分片协议参数
///
/// 字段名与服务器端解析的表单/查询参数一致
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumableParams {
    /// 分片序号（从 1 开始）
    pub resumable_chunk_number: u64,
    /// 标称分片大小
    pub resumable_chunk_size: u64,
    /// 当前分片实际大小
    pub resumable_current_chunk_size: u64,
    /// 文件总大小
    pub resumable_total_size: u64,
    /// MIME 类型
    pub resumable_type: String,
    /// 文件标识
    pub resumable_identifier: String,
    /// 文件名
    pub resumable_filename: String,
    /// 相对路径
    pub resumable_relative_path: String,
    /// 总分片数
    pub resumable_total_chunks: u64,
}

impl ResumableParams {
    /// 转为表单/查询参数列表
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        vec![
            ("resumableChunkNumber", self.resumable_chunk_number.to_string()),
            ("resumableChunkSize", self.resumable_chunk_size.to_string()),
            (
                "resumableCurrentChunkSize",
                self.resumable_current_chunk_size.to_string(),
            ),
            ("resumableTotalSize", self.resumable_total_size.to_string()),
            ("resumableType", self.resumable_type.clone()),
            ("resumableIdentifier", self.resumable_identifier.clone()),
            ("resumableFilename", self.resumable_filename.clone()),
            ("resumableRelativePath", self.resumable_relative_path.clone()),
            ("resumableTotalChunks", self.resumable_total_chunks.to_string()),
        ]
    }
}

/// 资源 ID（服务器可能返回数字或字符串）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResourceId {
    Number(i64),
    Text(String),
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceId::Number(n) => write!(f, "{}", n),
            ResourceId::Text(s) => write!(f, "{}", s),
        }
    }
}

/// 上传接口响应体
///
/// - `{submission_id}` / `{submission_ids: [...]}`：立即完成
/// - `{temp_name}`：服务器延后处理，需要轮询
/// - `{status, message}`：错误
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UploadResponseBody {
    #[serde(default)]
    pub submission_id: Option<ResourceId>,
    #[serde(default)]
    pub submission_ids: Option<Vec<ResourceId>>,
    #[serde(default)]
    pub temp_name: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl UploadResponseBody {
    /// 响应体是否带有完成信息（资源 ID 或处理令牌）
    pub fn carries_completion(body: &str) -> bool {
        serde_json::from_str::<UploadResponseBody>(body).map_or(false, |parsed| {
            parsed.submission_id.is_some()
                || parsed.submission_ids.is_some()
                || parsed.temp_name.is_some()
        })
    }
}

/// 服务器处理状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingState {
    Queued,
    Processing,
    Completed,
    Failed,
    /// 未知状态（不是终态）
    #[serde(other)]
    Unknown,
}

impl ProcessingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingState::Queued => "queued",
            ProcessingState::Processing => "processing",
            ProcessingState::Completed => "completed",
            ProcessingState::Failed => "failed",
            ProcessingState::Unknown => "unknown",
        }
    }
}

/// 处理状态详情
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProcessingStatus {
    pub status: ProcessingState,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub submission_id: Option<ResourceId>,
}

/// 处理状态查询响应 `{status: {status, message, submission_id}}`
#[derive(Debug, Clone, Deserialize)]
pub struct UploadStatusEnvelope {
    pub status: ProcessingStatus,
}
