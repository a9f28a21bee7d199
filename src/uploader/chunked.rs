// 分片传输（resumable 协议）
//
// 调度策略：
// - 所有文件的分片按顺序进入同一个待上传队列
// - 使用 Semaphore 控制整个会话的并发分片数（不是每个文件）
// - 使用 JoinSet 管理并发任务
// - 单个分片失败先在任务内部指数退避重试，超过次数或遇到永久错误才升级为文件失败
// - 文件失败后丢弃其排队中的分片并中止在途分片，迟到的结果被忽略
//
// 暂停：正在上传的分片被中断并放回队首，已排队的分片保留，恢复后继续调度

use crate::client::{HttpReply, ResumableParams, SentCallback, UploadClient, UploadResponseBody};
use crate::config::{TransportMode, UploadConfig};
use crate::events::{ProgressThrottler, DEFAULT_THROTTLE_INTERVAL_MS};
use crate::uploader::chunk::{chunk_count, plan_chunks, ChunkDescriptor};
use crate::uploader::transport::{TransportEvent, TransportFile, UploadTransport};
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::{AbortHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// =====================================================
// 重试配置
// =====================================================

/// 初始退避延迟（毫秒）
const INITIAL_BACKOFF_MS: u64 = 100;

/// 最大退避延迟（毫秒）
const MAX_BACKOFF_MS: u64 = 5000;

/// 不重试的分片响应状态码
pub const PERMANENT_ERROR_STATUSES: [u16; 6] = [400, 404, 409, 415, 500, 501];

/// 分片请求中的文件类型
const CHUNK_MIME_TYPE: &str = "application/octet-stream";

/// 计算指数退避延迟
///
/// # 延迟序列
/// - retry_count=0: 100ms
/// - retry_count=1: 200ms
/// - retry_count=2: 400ms
/// - 最大: 5000ms
pub fn calculate_backoff_delay(retry_count: u32) -> u64 {
    INITIAL_BACKOFF_MS
        .saturating_mul(2u64.saturating_pow(retry_count))
        .min(MAX_BACKOFF_MS)
}

/// 是否为不可重试的状态码
pub fn is_permanent_status(status: u16) -> bool {
    PERMANENT_ERROR_STATUSES.contains(&status)
}

// =====================================================
// 分片传输
// =====================================================

/// 分片任务共享的只读配置
struct ChunkShared {
    client: UploadClient,
    target_url: String,
    chunk_size: u64,
    max_retries: u32,
    test_chunks: bool,
}

/// 分片传输
pub struct ChunkTransport {
    shared: Arc<ChunkShared>,
    /// 整个会话的最大并发分片数
    max_concurrent: usize,
    /// 进度事件节流间隔
    throttle_interval: Duration,
    /// 暂停标志（watch 通道，在途分片据此中断）
    paused: watch::Sender<bool>,
}

impl ChunkTransport {
    pub fn new(client: UploadClient, config: &UploadConfig) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            shared: Arc::new(ChunkShared {
                client,
                target_url: config.target_url.clone(),
                chunk_size: config.chunk_size_bytes(),
                max_retries: config.max_retries,
                test_chunks: config.test_chunks,
            }),
            max_concurrent: config.concurrency_limit(),
            throttle_interval: Duration::from_millis(DEFAULT_THROTTLE_INTERVAL_MS),
            paused,
        }
    }

    /// 处理一个分片任务的结果
    fn handle_report(
        &self,
        joined: std::result::Result<ChunkReport, tokio::task::JoinError>,
        states: &mut HashMap<String, FileState>,
        pending: &mut VecDeque<ChunkDescriptor>,
        events: &mpsc::UnboundedSender<TransportEvent>,
    ) {
        let report = match joined {
            Ok(report) => report,
            Err(e) if e.is_cancelled() => {
                debug!("分片任务已中止");
                return;
            }
            Err(e) => {
                error!("分片任务异常: {}", e);
                return;
            }
        };

        let identifier = report.chunk.file_identifier.clone();
        let Some(state) = states.get_mut(&identifier) else {
            return;
        };
        if state.failed {
            debug!(
                "忽略已失败文件的分片结果: id={}, chunk={}",
                identifier, report.chunk.index
            );
            return;
        }

        match report.outcome {
            ChunkOutcome::Done(reply) => {
                // 并发分片的完成顺序不确定，保留带完成信息的那个响应
                if state.completion.is_none() || UploadResponseBody::carries_completion(&reply.body) {
                    state.completion = Some(reply);
                }
                state.remaining = state.remaining.saturating_sub(1);
                debug!(
                    "分片完成: id={}, chunk={}/{}, 剩余={}",
                    identifier, report.chunk.index, state.total_chunks, state.remaining
                );
                if state.remaining == 0 {
                    state.progress.complete();
                    info!("文件传输完成: {} ({})", state.file.relative_path, identifier);
                    if let Some(reply) = state.completion.take() {
                        let _ = events.send(TransportEvent::FileSuccess {
                            identifier,
                            status: reply.status,
                            body: reply.body,
                        });
                    }
                }
            }
            ChunkOutcome::Interrupted => {
                debug!(
                    "分片被暂停中断，放回队首: id={}, chunk={}",
                    identifier, report.chunk.index
                );
                pending.push_front(report.chunk);
            }
            ChunkOutcome::Failed {
                status,
                error,
                body,
            } => {
                state.failed = true;
                for handle in state.handles.drain(..) {
                    handle.abort();
                }
                error!(
                    "文件传输失败: {} ({}), chunk={}, status={:?}, error={:?}",
                    state.file.relative_path, identifier, report.chunk.index, status, error
                );
                let _ = events.send(TransportEvent::FileError {
                    identifier,
                    status,
                    error,
                    body,
                });
            }
        }
    }
}

/// 单个文件的调度状态（只由调度循环访问）
struct FileState {
    file: Arc<TransportFile>,
    total_chunks: u64,
    remaining: u64,
    started: bool,
    failed: bool,
    progress: Arc<FileProgress>,
    handles: Vec<AbortHandle>,
    /// 作为文件结果的响应
    completion: Option<HttpReply>,
}

/// 单个文件的进度计数（分片任务和请求体流共享）
struct FileProgress {
    identifier: String,
    total: u64,
    /// 在途 + 已完成分片的已发送字节
    loaded: AtomicU64,
    /// 已上报的最大值，保证上报单调不减（加锁保证发送顺序）
    reported: Mutex<u64>,
    throttler: ProgressThrottler,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl FileProgress {
    fn add(&self, bytes: u64) {
        self.loaded.fetch_add(bytes, Ordering::SeqCst);
        self.emit(false);
    }

    /// 撤销一次失败/中断尝试已计入的字节
    fn rollback(&self, bytes: u64) {
        let _ = self
            .loaded
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                Some(v.saturating_sub(bytes))
            });
    }

    fn emit(&self, force: bool) {
        let mut reported = self.reported.lock();
        let current = self.loaded.load(Ordering::SeqCst).min(self.total);
        let value = (*reported).max(current);
        if force || self.throttler.should_emit_progress(value, self.total) {
            *reported = value;
            let _ = self.events.send(TransportEvent::FileProgress {
                identifier: self.identifier.clone(),
                loaded: value,
                total: self.total,
            });
        }
    }

    /// 所有分片完成：补发 100% 样本
    fn complete(&self) {
        self.loaded.store(self.total, Ordering::SeqCst);
        let behind = *self.reported.lock() < self.total;
        if behind {
            self.emit(true);
        }
    }
}

/// 分片任务
struct ChunkJob {
    chunk: ChunkDescriptor,
    file: Arc<TransportFile>,
    total_chunks: u64,
    progress: Arc<FileProgress>,
}

/// 分片任务结果
enum ChunkOutcome {
    /// 已上传（或探测发现已存在）
    Done(HttpReply),
    /// 被暂停中断
    Interrupted,
    /// 永久失败
    Failed {
        status: Option<u16>,
        error: Option<String>,
        body: String,
    },
}

struct ChunkReport {
    chunk: ChunkDescriptor,
    outcome: ChunkOutcome,
}

#[async_trait]
impl UploadTransport for ChunkTransport {
    fn mode(&self) -> TransportMode {
        TransportMode::Chunked
    }

    async fn run(
        &self,
        files: Vec<TransportFile>,
        events: mpsc::UnboundedSender<TransportEvent>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut pause_rx = self.paused.subscribe();
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut join_set: JoinSet<ChunkReport> = JoinSet::new();
        let mut states: HashMap<String, FileState> = HashMap::new();
        let mut pending: VecDeque<ChunkDescriptor> = VecDeque::new();

        for file in files {
            let chunks = plan_chunks(&file.identifier, file.size, self.shared.chunk_size);
            let total_chunks = chunk_count(file.size, self.shared.chunk_size);
            let progress = Arc::new(FileProgress {
                identifier: file.identifier.clone(),
                total: file.size,
                loaded: AtomicU64::new(0),
                reported: Mutex::new(0),
                throttler: ProgressThrottler::new(self.throttle_interval),
                events: events.clone(),
            });
            pending.extend(chunks);
            let _ = events.send(TransportEvent::FileQueued {
                identifier: file.identifier.clone(),
            });
            states.insert(
                file.identifier.clone(),
                FileState {
                    file: Arc::new(file),
                    total_chunks,
                    remaining: total_chunks,
                    started: false,
                    failed: false,
                    progress,
                    handles: Vec::new(),
                    completion: None,
                },
            );
        }

        info!(
            "[分片上传] 开始上传 {} 个文件，共 {} 个分片，并发数: {}",
            states.len(),
            pending.len(),
            self.max_concurrent
        );

        loop {
            if cancel.is_cancelled() {
                join_set.abort_all();
                info!("[分片上传] 已取消");
                return Ok(());
            }

            // 暂停时不调度新分片，只回收在途分片的结果
            let paused = *pause_rx.borrow();
            if paused {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = pause_rx.changed() => {}
                    Some(joined) = join_set.join_next() => {
                        self.handle_report(joined, &mut states, &mut pending, &events);
                    }
                }
                continue;
            }

            // 下一个分片（跳过已失败文件的分片）
            let next = loop {
                match pending.pop_front() {
                    Some(chunk)
                        if states
                            .get(&chunk.file_identifier)
                            .map_or(true, |s| s.failed) =>
                    {
                        continue
                    }
                    other => break other,
                }
            };

            match next {
                Some(chunk) => {
                    let permit = match semaphore.clone().try_acquire_owned() {
                        Ok(p) => p,
                        Err(_) => {
                            // 并发已满，等待一个分片结束后重新调度
                            pending.push_front(chunk);
                            tokio::select! {
                                _ = cancel.cancelled() => {}
                                Some(joined) = join_set.join_next() => {
                                    self.handle_report(joined, &mut states, &mut pending, &events);
                                }
                            }
                            continue;
                        }
                    };

                    let Some(state) = states.get_mut(&chunk.file_identifier) else {
                        continue;
                    };
                    if !state.started {
                        state.started = true;
                        // 首个进度样本（0 字节），文件进入上传中
                        state.progress.emit(true);
                    }

                    let job = ChunkJob {
                        chunk,
                        file: state.file.clone(),
                        total_chunks: state.total_chunks,
                        progress: state.progress.clone(),
                    };
                    let shared = self.shared.clone();
                    let pause_rx = self.paused.subscribe();

                    let handle = join_set.spawn(async move {
                        let report = upload_single_chunk(shared, job, pause_rx).await;
                        drop(permit);
                        report
                    });
                    state.handles.retain(|h| !h.is_finished());
                    state.handles.push(handle);
                }
                None => {
                    if join_set.is_empty() {
                        break;
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        Some(joined) = join_set.join_next() => {
                            self.handle_report(joined, &mut states, &mut pending, &events);
                        }
                    }
                }
            }

            // 非阻塞回收已完成的任务
            while let Some(joined) = join_set.try_join_next() {
                self.handle_report(joined, &mut states, &mut pending, &events);
            }
        }

        info!("[分片上传] 所有文件传输结束");
        Ok(())
    }

    fn supports_pause(&self) -> bool {
        true
    }

    fn pause(&self) {
        self.paused.send_replace(true);
        info!("[分片上传] 已暂停");
    }

    fn resume(&self) {
        self.paused.send_replace(false);
        info!("[分片上传] 已恢复");
    }
}

// =====================================================
// 独立的分片上传函数（用于并发调度）
// =====================================================

/// 等待暂停信号
async fn wait_for_pause(pause_rx: &mut watch::Receiver<bool>) {
    if pause_rx.wait_for(|paused| *paused).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// 上传单个分片，暂停时中断
async fn upload_single_chunk(
    shared: Arc<ChunkShared>,
    job: ChunkJob,
    mut pause_rx: watch::Receiver<bool>,
) -> ChunkReport {
    let ChunkJob {
        chunk,
        file,
        total_chunks,
        progress,
    } = job;
    let sent = Arc::new(AtomicU64::new(0));
    let mut working = chunk.clone();

    let outcome = tokio::select! {
        outcome = transfer_chunk(&shared, &mut working, &file, total_chunks, &progress, &sent) => outcome,
        _ = wait_for_pause(&mut pause_rx) => {
            progress.rollback(sent.swap(0, Ordering::SeqCst));
            ChunkOutcome::Interrupted
        }
    };

    ChunkReport { chunk, outcome }
}

/// 构建分片请求参数
fn build_params(
    chunk: &ChunkDescriptor,
    file: &TransportFile,
    total_chunks: u64,
    chunk_size: u64,
) -> ResumableParams {
    ResumableParams {
        resumable_chunk_number: chunk.index,
        resumable_chunk_size: chunk_size,
        resumable_current_chunk_size: chunk.size(),
        resumable_total_size: file.size,
        resumable_type: CHUNK_MIME_TYPE.to_string(),
        resumable_identifier: file.identifier.clone(),
        resumable_filename: file.file_name.clone(),
        resumable_relative_path: file.relative_path.clone(),
        resumable_total_chunks: total_chunks,
    }
}

/// 探测 + 上传 + 重试
async fn transfer_chunk(
    shared: &ChunkShared,
    chunk: &mut ChunkDescriptor,
    file: &TransportFile,
    total_chunks: u64,
    progress: &Arc<FileProgress>,
    sent: &Arc<AtomicU64>,
) -> ChunkOutcome {
    let params = build_params(chunk, file, total_chunks, shared.chunk_size);

    if shared.test_chunks {
        match shared.client.test_chunk(&shared.target_url, &params).await {
            Ok(reply) if reply.status == 200 => {
                debug!(
                    "分片已存在，跳过: id={}, chunk={}",
                    chunk.file_identifier, chunk.index
                );
                progress.add(chunk.size());
                return ChunkOutcome::Done(reply);
            }
            Ok(reply) if reply.status == 409 => {
                return ChunkOutcome::Failed {
                    status: Some(reply.status),
                    error: None,
                    body: reply.body,
                };
            }
            Ok(_) => {}
            Err(e) => {
                warn!(
                    "探测分片失败，直接上传: id={}, chunk={}, 错误: {:#}",
                    chunk.file_identifier, chunk.index, e
                );
            }
        }
    }

    let data = match chunk.read_data(&file.local_path).await {
        Ok(data) => data,
        Err(e) => {
            return ChunkOutcome::Failed {
                status: None,
                error: Some(format!("{:#}", e)),
                body: String::new(),
            };
        }
    };

    loop {
        chunk.attempt += 1;

        let on_sent: SentCallback = {
            let progress = progress.clone();
            let sent = sent.clone();
            Arc::new(move |bytes| {
                sent.fetch_add(bytes, Ordering::SeqCst);
                progress.add(bytes);
            })
        };

        let result = shared
            .client
            .upload_chunk(&shared.target_url, &params, data.clone(), on_sent)
            .await;

        let (status, error, body) = match result {
            Ok(reply) if reply.is_success() => return ChunkOutcome::Done(reply),
            Ok(reply) => (Some(reply.status), None, reply.body),
            Err(e) => (None, Some(format!("{:#}", e)), String::new()),
        };

        progress.rollback(sent.swap(0, Ordering::SeqCst));

        let permanent = status.map_or(false, is_permanent_status);
        if permanent || chunk.attempt > shared.max_retries {
            return ChunkOutcome::Failed {
                status,
                error,
                body,
            };
        }

        let delay = calculate_backoff_delay(chunk.attempt - 1);
        warn!(
            "分片上传失败，{}ms 后重试 ({}/{}): id={}, chunk={}, status={:?}, error={:?}",
            delay,
            chunk.attempt,
            shared.max_retries,
            chunk.file_identifier,
            chunk.index,
            status,
            error
        );
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
}
