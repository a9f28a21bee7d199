// 上传会话错误类型
//
// 文件级别的失败（409、5xx、网络异常）不会以 Err 形式返回，
// 而是体现在 UploadTarget 的 Failed 状态和 UploadEvent::Failed 事件中。
// 这里只描述会话级别的操作错误。

/// 会话操作错误
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    /// 选择的文件未通过校验（空选择 / 数量超限 / 扩展名不允许），未发起任何网络请求
    #[error("Error : {0}")]
    Validation(String),

    /// 仍有未结束的上传目标，拒绝重复启动
    #[error("upload session is still running")]
    AlreadyRunning,

    /// 当前传输模式不支持暂停（仅分片模式支持）
    #[error("pause is only supported in chunked mode")]
    PauseUnsupported,

    /// 会话尚未启动
    #[error("upload session is not running")]
    NotRunning,

    /// 配置错误
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl UploadError {
    /// 是否为校验错误（需要提示用户）
    pub fn is_validation(&self) -> bool {
        matches!(self, UploadError::Validation(_))
    }
}

pub type UploadResult<T> = std::result::Result<T, UploadError>;
