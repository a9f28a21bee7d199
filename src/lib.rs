// Submission Uploader Library
// 作业文件上传客户端核心库

// 配置管理模块
pub mod config;

// 错误类型
pub mod error;

// 日志系统
pub mod logging;

// HTTP 客户端
pub mod client;

// 会话事件
pub mod events;

// 上传编排模块
pub mod uploader;

// 命令行渲染
pub mod render;

// 测试用的本地上传服务
#[cfg(test)]
pub mod test_support;

// 导出常用类型
pub use client::UploadClient;
pub use config::{AppConfig, CompletionMode, TransportMode, UploadConfig};
pub use error::{UploadError, UploadResult};
pub use events::UploadEvent;
pub use uploader::{
    Classification, FailureCategory, SelectedFile, Severity, UploadSession, UploadTarget,
    UploadTargetState,
};
