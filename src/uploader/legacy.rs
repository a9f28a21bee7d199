// 整文件传输（兼容模式）
//
// 固定 K 条通道，第 k 条通道依次上传下标 k, k+K, k+2K, ... 的文件，
// 通道内严格串行：上一个文件的请求结束（成功或失败）后才开始下一个。
// 不做分片，也不做整文件重试。

use crate::client::{SentCallback, UploadClient};
use crate::config::{TransportMode, UploadConfig};
use crate::events::{ProgressThrottler, DEFAULT_THROTTLE_INTERVAL_MS};
use crate::uploader::transport::{TransportEvent, TransportFile, UploadTransport};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// 计算文件所属通道
pub fn lane_for(index: usize, lanes: usize) -> usize {
    index % lanes.max(1)
}

/// 按通道划分文件下标
pub fn partition_lanes(count: usize, lanes: usize) -> Vec<Vec<usize>> {
    let lanes = lanes.max(1);
    let mut partition = vec![Vec::new(); lanes.min(count.max(1))];
    let width = partition.len();
    for index in 0..count {
        partition[index % width].push(index);
    }
    partition
}

/// 整文件传输
pub struct LegacyTransport {
    client: UploadClient,
    target_url: String,
    field_name: String,
    lanes: usize,
    throttle_interval: Duration,
}

impl LegacyTransport {
    pub fn new(client: UploadClient, config: &UploadConfig) -> Self {
        Self {
            client,
            target_url: config.target_url.clone(),
            field_name: config.legacy_field_name.clone(),
            lanes: config.concurrency_limit(),
            throttle_interval: Duration::from_millis(DEFAULT_THROTTLE_INTERVAL_MS),
        }
    }
}

/// 一条通道的上下文
struct LaneContext {
    lane: usize,
    client: UploadClient,
    target_url: String,
    field_name: String,
    throttle_interval: Duration,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl LaneContext {
    /// 串行上传本通道的所有文件
    async fn run(self, files: Vec<TransportFile>, cancel: CancellationToken) {
        for file in files {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("[整文件上传] 通道 {} 已取消", self.lane);
                    return;
                }
                _ = self.upload_one(&file) => {}
            }
        }
    }

    async fn upload_one(&self, file: &TransportFile) {
        info!(
            "[整文件上传] 通道 {} 开始上传: {} ({} bytes)",
            self.lane, file.relative_path, file.size
        );

        let total = file.size;
        let throttler = Arc::new(ProgressThrottler::new(self.throttle_interval));
        let loaded = Arc::new(AtomicU64::new(0));

        // 首个进度样本（0 字节），文件进入上传中
        throttler.force_emit();
        let _ = self.events.send(TransportEvent::FileProgress {
            identifier: file.identifier.clone(),
            loaded: 0,
            total,
        });

        let on_sent: SentCallback = {
            let events = self.events.clone();
            let identifier = file.identifier.clone();
            let throttler = throttler.clone();
            let loaded = loaded.clone();
            Arc::new(move |bytes| {
                let value = (loaded.fetch_add(bytes, Ordering::SeqCst) + bytes).min(total);
                if throttler.should_emit_progress(value, total) {
                    let _ = events.send(TransportEvent::FileProgress {
                        identifier: identifier.clone(),
                        loaded: value,
                        total,
                    });
                }
            })
        };

        let result = self
            .client
            .upload_file(
                &self.target_url,
                &self.field_name,
                &file.local_path,
                &file.file_name,
                on_sent,
            )
            .await;

        let event = match result {
            Ok(reply) if reply.is_success() => {
                info!(
                    "[整文件上传] 通道 {} 上传完成: {} status={}",
                    self.lane, file.relative_path, reply.status
                );
                TransportEvent::FileSuccess {
                    identifier: file.identifier.clone(),
                    status: reply.status,
                    body: reply.body,
                }
            }
            Ok(reply) => {
                warn!(
                    "[整文件上传] 通道 {} 服务器拒绝: {} status={}",
                    self.lane, file.relative_path, reply.status
                );
                TransportEvent::FileError {
                    identifier: file.identifier.clone(),
                    status: Some(reply.status),
                    error: None,
                    body: reply.body,
                }
            }
            Err(e) => {
                error!(
                    "[整文件上传] 通道 {} 请求失败: {}, 错误: {:#}",
                    self.lane, file.relative_path, e
                );
                TransportEvent::FileError {
                    identifier: file.identifier.clone(),
                    status: None,
                    error: Some(format!("{:#}", e)),
                    body: String::new(),
                }
            }
        };
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl UploadTransport for LegacyTransport {
    fn mode(&self) -> TransportMode {
        TransportMode::Legacy
    }

    async fn run(
        &self,
        files: Vec<TransportFile>,
        events: mpsc::UnboundedSender<TransportEvent>,
        cancel: CancellationToken,
    ) -> Result<()> {
        for file in &files {
            let _ = events.send(TransportEvent::FileQueued {
                identifier: file.identifier.clone(),
            });
        }

        let partition = partition_lanes(files.len(), self.lanes);
        info!(
            "[整文件上传] 开始上传 {} 个文件，通道数: {}",
            files.len(),
            partition.len()
        );

        let mut slots: Vec<Option<TransportFile>> = files.into_iter().map(Some).collect();
        let mut join_set = JoinSet::new();

        for (lane, indices) in partition.into_iter().enumerate() {
            let lane_files: Vec<TransportFile> = indices
                .into_iter()
                .filter_map(|i| slots.get_mut(i).and_then(Option::take))
                .collect();
            if lane_files.is_empty() {
                continue;
            }
            let ctx = LaneContext {
                lane,
                client: self.client.clone(),
                target_url: self.target_url.clone(),
                field_name: self.field_name.clone(),
                throttle_interval: self.throttle_interval,
                events: events.clone(),
            };
            join_set.spawn(ctx.run(lane_files, cancel.clone()));
        }

        while let Some(joined) = join_set.join_next().await {
            if let Err(e) = joined {
                error!("[整文件上传] 通道任务异常: {}", e);
            }
        }

        info!("[整文件上传] 所有通道结束");
        Ok(())
    }
}
