// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

/// 默认配置文件路径
pub const DEFAULT_CONFIG_PATH: &str = "config/app.toml";

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 上传配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// 🔥 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
        }
    }
}

/// 传输模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// 分片断点续传（resumable 协议）
    Chunked,
    /// 整文件上传（不支持分片时的回退模式）
    Legacy,
}

/// 完成模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionMode {
    /// 上传响应即最终结果
    Immediate,
    /// 服务器返回 temp_name 时轮询处理状态
    Polling,
}

/// 上传配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// 上传接口地址
    #[serde(default = "default_target_url")]
    pub target_url: String,
    /// 处理状态查询接口（为空时使用上传地址的 origin + /api/upload-status/）
    #[serde(default)]
    pub status_url: Option<String>,
    /// 结果链接前缀
    #[serde(default = "default_link_prefix")]
    pub link_prefix: String,
    /// 最大同时上传数（分片模式为全局分片槽位数，整文件模式为通道数）
    #[serde(default = "default_max_simultaneous")]
    pub max_simultaneous: usize,
    /// 分片大小 (MB)
    #[serde(default = "default_chunk_size_mb")]
    pub chunk_size_mb: u64,
    /// 分片最大重试次数
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 允许的扩展名（后缀匹配），为空表示不限制
    #[serde(default)]
    pub allowed_extensions: Vec<String>,
    /// 单次最多选择的文件数，为空表示不限制
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_files: Option<usize>,
    /// 传输模式
    #[serde(default = "default_transport_mode")]
    pub transport_mode: TransportMode,
    /// 完成模式
    #[serde(default = "default_completion_mode")]
    pub completion_mode: CompletionMode,
    /// 处理状态轮询间隔（毫秒）
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// 上传分片前是否先探测服务器是否已有该分片
    #[serde(default = "default_test_chunks")]
    pub test_chunks: bool,
    /// 单个请求超时（秒）
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// 整文件上传时的表单字段名
    #[serde(default = "default_legacy_field_name")]
    pub legacy_field_name: String,
}

fn default_target_url() -> String {
    "http://127.0.0.1:8730/api/submission-receiver-resumable".to_string()
}

fn default_link_prefix() -> String {
    "/web".to_string()
}

fn default_max_simultaneous() -> usize {
    2
}

fn default_chunk_size_mb() -> u64 {
    16
}

fn default_max_retries() -> u32 {
    3
}

fn default_transport_mode() -> TransportMode {
    TransportMode::Chunked
}

fn default_completion_mode() -> CompletionMode {
    CompletionMode::Polling
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_test_chunks() -> bool {
    true
}

fn default_request_timeout_secs() -> u64 {
    600
}

fn default_legacy_field_name() -> String {
    "files".to_string()
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            target_url: default_target_url(),
            status_url: None,
            link_prefix: default_link_prefix(),
            max_simultaneous: default_max_simultaneous(),
            chunk_size_mb: default_chunk_size_mb(),
            max_retries: default_max_retries(),
            allowed_extensions: Vec::new(),
            max_files: None,
            transport_mode: default_transport_mode(),
            completion_mode: default_completion_mode(),
            poll_interval_ms: default_poll_interval_ms(),
            test_chunks: default_test_chunks(),
            request_timeout_secs: default_request_timeout_secs(),
            legacy_field_name: default_legacy_field_name(),
        }
    }
}

impl UploadConfig {
    /// 并发上限（至少为 1）
    pub fn concurrency_limit(&self) -> usize {
        self.max_simultaneous.max(1)
    }

    /// 分片大小（字节）
    pub fn chunk_size_bytes(&self) -> u64 {
        self.chunk_size_mb.max(1) * 1024 * 1024
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    /// 处理状态查询接口的基础地址（以 / 结尾）
    pub fn status_url_base(&self) -> Result<String> {
        if let Some(url) = &self.status_url {
            let mut url = url.clone();
            if !url.ends_with('/') {
                url.push('/');
            }
            return Ok(url);
        }

        let target = reqwest::Url::parse(&self.target_url)
            .with_context(|| format!("无效的上传地址: {}", self.target_url))?;
        let status = target
            .join("/api/upload-status/")
            .context("无法推导处理状态查询地址")?;
        Ok(status.to_string())
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        reqwest::Url::parse(&self.target_url)
            .with_context(|| format!("无效的上传地址: {}", self.target_url))?;
        if self.legacy_field_name.trim().is_empty() {
            anyhow::bail!("整文件上传表单字段名不能为空");
        }
        self.status_url_base()?;
        Ok(())
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;

        config
            .upload
            .validate()
            .context("配置文件中的上传配置验证失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        self.upload
            .validate()
            .context("保存配置失败：上传配置无效")?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create config directory")?;
            }
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {}", path);

        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                let default_config = Self::default();

                // 仅在文件不存在时写入默认配置，避免覆盖用户写错的配置
                if !std::path::Path::new(path).exists() {
                    if let Err(e) = default_config.save_to_file(path).await {
                        tracing::error!("保存默认配置失败: {}", e);
                    }
                }

                default_config
            }
        }
    }
}
