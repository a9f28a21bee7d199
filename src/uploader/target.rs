// 上传目标定义
//
// 每个被接受的文件对应一个 UploadTarget，由会话控制器独占。
// 状态转换：Queued → Uploading → {Succeeded | Failed | AwaitingProcessing} → {Succeeded | Failed}
// 所有 mark_* 方法都是幂等检查：非法转换返回 false 且不修改状态，
// 用于过滤重复或迟到的事件（例如分片重试在文件已失败后才返回成功）。

use crate::uploader::identity::identify;
use crate::uploader::status::Classification;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// 上传目标状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UploadTargetState {
    /// 等待上传
    Queued,
    /// 上传中
    Uploading,
    /// 上传完成，等待服务器处理
    AwaitingProcessing,
    /// 成功
    Succeeded,
    /// 失败
    Failed,
}

impl UploadTargetState {
    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadTargetState::Succeeded | UploadTargetState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UploadTargetState::Queued => "queued",
            UploadTargetState::Uploading => "uploading",
            UploadTargetState::AwaitingProcessing => "awaiting_processing",
            UploadTargetState::Succeeded => "succeeded",
            UploadTargetState::Failed => "failed",
        }
    }
}

/// 用户选择的文件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectedFile {
    /// 本地文件路径
    pub local_path: PathBuf,
    /// 相对路径或文件名（用于标识和展示）
    pub relative_path: String,
    /// 文件大小
    pub size: u64,
}

impl SelectedFile {
    pub fn new(local_path: PathBuf, relative_path: impl Into<String>, size: u64) -> Self {
        Self {
            local_path,
            relative_path: relative_path.into(),
            size,
        }
    }

    /// 从本地路径读取元数据创建，相对路径取文件名
    pub async fn from_path(path: &Path) -> Result<Self> {
        let metadata = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("无法读取文件信息: {:?}", path))?;
        if !metadata.is_file() {
            anyhow::bail!("不是普通文件: {:?}", path);
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        Ok(Self::new(path.to_path_buf(), name, metadata.len()))
    }

    /// 文件名部分（相对路径的最后一段）
    pub fn file_name(&self) -> &str {
        self.relative_path
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(&self.relative_path)
    }

    /// 是否匹配允许的扩展名（后缀匹配，列表为空时全部允许）
    pub fn has_allowed_extension(&self, allowed: &[String]) -> bool {
        allowed.is_empty()
            || allowed
                .iter()
                .any(|ext| self.relative_path.ends_with(ext.as_str()))
    }
}

/// 上传目标
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadTarget {
    /// 文件标识（见 identity::identify）
    pub identifier: String,
    /// 本地文件路径
    pub local_path: PathBuf,
    /// 相对路径或文件名
    pub relative_path: String,
    /// 文件大小
    pub size: u64,
    /// 所属通道（仅整文件模式）
    pub lane: Option<usize>,
    /// 状态
    pub state: UploadTargetState,
    /// 已传输字节数
    pub bytes_transferred: u64,
    /// 最近一次瞬时速度 (bytes/s)
    pub speed: u64,
    /// 创建时间 (Unix timestamp)
    pub created_at: i64,
    /// 开始上传时间 (Unix timestamp)
    pub started_at: Option<i64>,
    /// 结束时间 (Unix timestamp)
    pub completed_at: Option<i64>,
    /// 服务器分配的处理关联令牌
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_name: Option<String>,
    /// 服务器最近一次报告的处理状态
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_status: Option<String>,
    /// 创建的资源 ID
    #[serde(default)]
    pub resource_ids: Vec<String>,
    /// 资源链接（仅单个资源时存在）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    /// 附加说明（服务器消息或原始响应）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// 失败分类
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<Classification>,
}

impl UploadTarget {
    /// 创建新的上传目标（Queued 状态）
    pub fn new(file: &SelectedFile) -> Self {
        Self {
            identifier: identify(&file.relative_path, file.size),
            local_path: file.local_path.clone(),
            relative_path: file.relative_path.clone(),
            size: file.size,
            lane: None,
            state: UploadTargetState::Queued,
            bytes_transferred: 0,
            speed: 0,
            created_at: chrono::Utc::now().timestamp(),
            started_at: None,
            completed_at: None,
            temp_name: None,
            processing_status: None,
            resource_ids: Vec::new(),
            link: None,
            message: None,
            failure: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// 计算进度百分比
    pub fn progress(&self) -> f64 {
        crate::uploader::progress::percent_complete(self.bytes_transferred, self.size)
    }

    /// 标记为上传中（Queued → Uploading）
    pub fn mark_uploading(&mut self) -> bool {
        if self.state != UploadTargetState::Queued {
            return false;
        }
        self.state = UploadTargetState::Uploading;
        if self.started_at.is_none() {
            self.started_at = Some(chrono::Utc::now().timestamp());
        }
        true
    }

    /// 标记为等待服务器处理（Uploading → AwaitingProcessing）
    pub fn mark_awaiting_processing(&mut self, temp_name: String) -> bool {
        if self.state != UploadTargetState::Uploading {
            return false;
        }
        self.state = UploadTargetState::AwaitingProcessing;
        self.bytes_transferred = self.size;
        self.temp_name = Some(temp_name);
        true
    }

    /// 标记为成功（Uploading / AwaitingProcessing → Succeeded）
    pub fn mark_succeeded(&mut self, resource_ids: Vec<String>, link: Option<String>) -> bool {
        if !matches!(
            self.state,
            UploadTargetState::Uploading | UploadTargetState::AwaitingProcessing
        ) {
            return false;
        }
        self.state = UploadTargetState::Succeeded;
        self.bytes_transferred = self.size;
        self.resource_ids = resource_ids;
        self.link = link;
        self.completed_at = Some(chrono::Utc::now().timestamp());
        true
    }

    /// 标记为失败（Uploading / AwaitingProcessing → Failed）
    pub fn mark_failed(&mut self, failure: Option<Classification>, message: String) -> bool {
        if !matches!(
            self.state,
            UploadTargetState::Uploading | UploadTargetState::AwaitingProcessing
        ) {
            return false;
        }
        self.state = UploadTargetState::Failed;
        self.failure = failure;
        self.message = Some(message);
        self.completed_at = Some(chrono::Utc::now().timestamp());
        true
    }
}
