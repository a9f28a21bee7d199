//! 上传会话事件类型定义
//!
//! 会话控制器把传输层和轮询层的原始事件翻译为以下事件，推送给界面协作方

use crate::uploader::progress::TransferPhase;
use crate::uploader::status::Classification;
use serde::{Deserialize, Serialize};

/// 上传会话事件
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum UploadEvent {
    /// 文件被接受，显示为排队中的进度行
    Created {
        identifier: String,
        name: String,
        size: u64,
        /// 所属通道（仅整文件模式）
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lane: Option<usize>,
    },
    /// 状态变更
    StatusChanged {
        identifier: String,
        old_status: String,
        new_status: String,
    },
    /// 进度更新
    Progress {
        identifier: String,
        loaded: u64,
        total: u64,
        percent: f64,
        /// 瞬时速度 (bytes/s)
        #[serde(default)]
        speed: Option<u64>,
        phase: TransferPhase,
    },
    /// 服务器处理状态（轮询结果，非终态时显示忙碌指示）
    Processing {
        identifier: String,
        status: String,
        #[serde(default)]
        message: Option<String>,
    },
    /// 单次轮询失败（轮询继续）
    PollProblem {
        identifier: String,
        description: String,
    },
    /// 上传成功
    Succeeded {
        identifier: String,
        resource_ids: Vec<String>,
        #[serde(default)]
        link: Option<String>,
        #[serde(default)]
        message: Option<String>,
    },
    /// 上传失败
    Failed {
        identifier: String,
        classification: Classification,
    },
    /// 选择的文件未通过校验，会话没有启动
    ValidationFailed { message: String },
    /// 会话被取消，进度显示清空
    Reset,
    /// 所有文件都已到达终态
    AllSettled,
}

impl UploadEvent {
    /// 获取文件标识（会话级事件返回 None）
    pub fn identifier(&self) -> Option<&str> {
        match self {
            UploadEvent::Created { identifier, .. } => Some(identifier),
            UploadEvent::StatusChanged { identifier, .. } => Some(identifier),
            UploadEvent::Progress { identifier, .. } => Some(identifier),
            UploadEvent::Processing { identifier, .. } => Some(identifier),
            UploadEvent::PollProblem { identifier, .. } => Some(identifier),
            UploadEvent::Succeeded { identifier, .. } => Some(identifier),
            UploadEvent::Failed { identifier, .. } => Some(identifier),
            UploadEvent::ValidationFailed { .. } | UploadEvent::Reset | UploadEvent::AllSettled => {
                None
            }
        }
    }
}
