// 处理状态轮询
//
// 文件上传成功但服务器延后处理时，按固定间隔查询 `/api/upload-status/{temp_name}`：
// - 响应带非空 submission_id：完成，停止轮询
// - status 为 failed（即使没有 id）：失败，停止轮询
// - 单次查询失败（非 2xx / 响应无法解析 / 网络异常）：报告后继续轮询
//
// 取消令牌触发后立即退出，已发出但尚未返回的请求结果被丢弃。

use crate::client::{HttpReply, ProcessingState, UploadClient, UploadStatusEnvelope};
use crate::uploader::status::classify;
use anyhow::Result;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 单次轮询结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollUpdate {
    /// 非终态（queued / processing / 未知状态）
    Status {
        status: ProcessingState,
        message: Option<String>,
    },
    /// 单次查询失败，轮询继续
    Problem { description: String },
    /// 处理完成
    Completed {
        resource_id: String,
        message: Option<String>,
    },
    /// 处理失败
    Failed { message: Option<String> },
}

impl PollUpdate {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PollUpdate::Completed { .. } | PollUpdate::Failed { .. })
    }
}

/// 轮询报告（发给会话控制器）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollReport {
    pub identifier: String,
    pub update: PollUpdate,
}

/// 解析一次状态查询的结果
pub fn interpret(reply: Result<HttpReply>) -> PollUpdate {
    let reply = match reply {
        Ok(reply) => reply,
        Err(e) => {
            return PollUpdate::Problem {
                description: format!("Network error: {:#}", e),
            }
        }
    };

    if !reply.is_success() {
        let classification = classify(Some(reply.status), None, &reply.body);
        let status_line = classification
            .status_line()
            .unwrap_or_else(|| reply.status.to_string());
        return PollUpdate::Problem {
            description: format!(
                "Request status: {}. Server response: {}",
                status_line, classification.message
            ),
        };
    }

    let envelope: UploadStatusEnvelope = match serde_json::from_str(&reply.body) {
        Ok(envelope) => envelope,
        Err(_) => {
            return PollUpdate::Problem {
                description: format!("Malformed status response: {}", reply.body),
            }
        }
    };

    let status = envelope.status;
    if let Some(id) = status.submission_id {
        return PollUpdate::Completed {
            resource_id: id.to_string(),
            message: status.message,
        };
    }
    if status.status == ProcessingState::Failed {
        return PollUpdate::Failed {
            message: status.message,
        };
    }
    PollUpdate::Status {
        status: status.status,
        message: status.message,
    }
}

/// 轮询会话（每个等待处理的文件一个）
#[derive(Debug, Clone)]
pub struct PollingSession {
    pub file_identifier: String,
    pub temp_name: String,
    pub interval: Duration,
    /// 最近一次服务器报告的状态
    pub last_status: Option<ProcessingState>,
}

impl PollingSession {
    pub fn new(file_identifier: String, temp_name: String, interval: Duration) -> Self {
        Self {
            file_identifier,
            temp_name,
            interval,
            last_status: None,
        }
    }

    /// 启动轮询任务
    ///
    /// # 参数
    /// * `client` - 上传客户端
    /// * `status_base` - 以 `/` 结尾的状态接口地址
    /// * `cancel` - 取消令牌
    /// * `reports` - 轮询报告发送端
    pub fn spawn(
        self,
        client: UploadClient,
        status_base: String,
        cancel: CancellationToken,
        reports: mpsc::UnboundedSender<PollReport>,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(client, status_base, cancel, reports))
    }

    async fn run(
        mut self,
        client: UploadClient,
        status_base: String,
        cancel: CancellationToken,
        reports: mpsc::UnboundedSender<PollReport>,
    ) {
        info!(
            "开始轮询处理状态: id={}, temp_name={}",
            self.file_identifier, self.temp_name
        );

        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("轮询已取消: id={}", self.file_identifier);
                    return;
                }
                _ = ticker.tick() => {}
            }

            let reply = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("轮询已取消，丢弃在途请求: id={}", self.file_identifier);
                    return;
                }
                reply = client.fetch_upload_status(&status_base, &self.temp_name) => reply,
            };

            let update = interpret(reply);
            match &update {
                PollUpdate::Status { status, .. } => self.last_status = Some(*status),
                PollUpdate::Completed { .. } => self.last_status = Some(ProcessingState::Completed),
                PollUpdate::Failed { .. } => self.last_status = Some(ProcessingState::Failed),
                PollUpdate::Problem { description } => {
                    warn!(
                        "处理状态查询失败，继续轮询: id={}, {}",
                        self.file_identifier, description
                    );
                }
            }

            let terminal = update.is_terminal();
            let report = PollReport {
                identifier: self.file_identifier.clone(),
                update,
            };
            if reports.send(report).is_err() {
                return;
            }
            if terminal {
                info!(
                    "轮询结束: id={}, status={:?}",
                    self.file_identifier, self.last_status
                );
                return;
            }
        }
    }
}
