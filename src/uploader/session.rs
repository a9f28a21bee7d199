// 上传会话控制器
//
// 会话独占所有 UploadTarget 和轮询任务：
// - start()：校验选择（全有或全无）、创建目标、启动传输层和事件循环
// - pause() / resume()：仅分片模式，中断在途分片但保留队列
// - cancel()：取消传输层、清除所有轮询、清空目标，界面进度复位
//
// 传输层事件和轮询报告只由事件循环消费并修改目标状态；
// 目标的 mark_* 方法是幂等检查，重复或迟到的事件不会改变终态。

use crate::client::UploadClient;
use crate::config::{CompletionMode, TransportMode, UploadConfig};
use crate::error::{UploadError, UploadResult};
use crate::events::UploadEvent;
use crate::uploader::chunked::ChunkTransport;
use crate::uploader::completion::{build_link, resolve, CompletionOutcome};
use crate::uploader::legacy::{lane_for, LegacyTransport};
use crate::uploader::poller::{PollReport, PollUpdate, PollingSession};
use crate::uploader::progress::ProgressAccountant;
use crate::uploader::status::{classify, Classification};
use crate::uploader::target::{SelectedFile, UploadTarget, UploadTargetState};
use crate::uploader::transport::{TransportEvent, TransportFile, UploadTransport};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 空选择提示
pub const NO_FILE_SELECTED: &str = "No file selected";

/// 扩展名不允许提示
pub const INCORRECT_FILE_TYPE: &str = "Incorrect file type.";

/// 超出单次选择数量上限的提示
pub fn too_many_files(max: usize) -> String {
    let noun = if max == 1 { "file" } else { "files" };
    format!("Please upload no more than {} {} at a time.", max, noun)
}

/// 会话内部状态（只在持锁期间同步修改）
#[derive(Default)]
struct SessionState {
    /// 按选择顺序排列的上传目标
    targets: Vec<UploadTarget>,
    /// 每个文件的进度统计器
    accountants: HashMap<String, ProgressAccountant>,
    /// 活跃的轮询任务：文件标识 -> 取消令牌
    active_pollers: HashMap<String, CancellationToken>,
    /// 当前批次的取消令牌
    run_token: Option<CancellationToken>,
    /// 事件循环句柄
    loop_handle: Option<JoinHandle<()>>,
    paused: bool,
}

impl SessionState {
    fn target_mut(&mut self, identifier: &str) -> Option<&mut UploadTarget> {
        self.targets.iter_mut().find(|t| t.identifier == identifier)
    }

    fn has_running_targets(&self) -> bool {
        self.targets.iter().any(|t| !t.is_terminal())
    }

    fn all_settled(&self) -> bool {
        !self.targets.is_empty() && self.targets.iter().all(UploadTarget::is_terminal)
    }

    /// 停止某个文件的轮询
    fn stop_poller(&mut self, identifier: &str) {
        if let Some(token) = self.active_pollers.remove(identifier) {
            token.cancel();
        }
    }
}

/// 上传会话
pub struct UploadSession {
    id: String,
    config: UploadConfig,
    client: UploadClient,
    transport: Arc<dyn UploadTransport>,
    status_base: String,
    state: Arc<Mutex<SessionState>>,
    ui_tx: mpsc::UnboundedSender<UploadEvent>,
}

impl UploadSession {
    /// 按配置创建会话（根据传输模式选择分片或整文件传输）
    pub fn new(config: UploadConfig, ui_tx: mpsc::UnboundedSender<UploadEvent>) -> UploadResult<Self> {
        config
            .validate()
            .map_err(|e| UploadError::Config(format!("{:#}", e)))?;
        let client = UploadClient::new(config.request_timeout())?;
        let transport: Arc<dyn UploadTransport> = match config.transport_mode {
            TransportMode::Chunked => Arc::new(ChunkTransport::new(client.clone(), &config)),
            TransportMode::Legacy => Arc::new(LegacyTransport::new(client.clone(), &config)),
        };
        Self::with_transport(config, client, transport, ui_tx)
    }

    /// 使用指定的传输层创建会话
    pub fn with_transport(
        config: UploadConfig,
        client: UploadClient,
        transport: Arc<dyn UploadTransport>,
        ui_tx: mpsc::UnboundedSender<UploadEvent>,
    ) -> UploadResult<Self> {
        let status_base = config
            .status_url_base()
            .map_err(|e| UploadError::Config(format!("{:#}", e)))?;
        let id = uuid::Uuid::new_v4().to_string();

        info!(
            "创建上传会话: id={}, mode={:?}, completion={:?}, concurrency={}",
            id,
            transport.mode(),
            config.completion_mode,
            config.concurrency_limit()
        );

        Ok(Self {
            id,
            config,
            client,
            transport,
            status_base,
            state: Arc::new(Mutex::new(SessionState::default())),
            ui_tx,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn transport_mode(&self) -> TransportMode {
        self.transport.mode()
    }

    /// 开始上传
    ///
    /// 返回被接受文件的标识（按选择顺序）
    pub fn start(&self, files: Vec<SelectedFile>) -> UploadResult<Vec<String>> {
        let mut state = self.state.lock();

        if state.has_running_targets() {
            warn!("会话 {} 仍有未结束的上传，拒绝重复启动", self.id);
            return Err(UploadError::AlreadyRunning);
        }

        if files.is_empty() {
            return Err(self.reject(NO_FILE_SELECTED));
        }

        if let Some(max) = self.config.max_files {
            if files.len() > max {
                warn!("选择了 {} 个文件，超过上限 {}", files.len(), max);
                return Err(self.reject(&too_many_files(max)));
            }
        }

        // 全有或全无：任何一个文件扩展名不允许，整批拒绝
        if let Some(bad) = files
            .iter()
            .find(|f| !f.has_allowed_extension(&self.config.allowed_extensions))
        {
            warn!("文件扩展名不允许: {}", bad.relative_path);
            return Err(self.reject(INCORRECT_FILE_TYPE));
        }

        // 上一批已全部结束，开始新的一批
        state.targets.clear();
        state.accountants.clear();
        for (_, token) in state.active_pollers.drain() {
            token.cancel();
        }

        let legacy = self.transport.mode() == TransportMode::Legacy;
        let lanes = self.config.concurrency_limit();
        let mut identifiers = Vec::with_capacity(files.len());
        for file in &files {
            let mut target = UploadTarget::new(file);
            if state.target_mut(&target.identifier).is_some() {
                warn!("重复选择的文件已忽略: {}", target.relative_path);
                continue;
            }
            // 通道按去重后的顺序分配，与传输层的划分一致
            if legacy {
                target.lane = Some(lane_for(state.targets.len(), lanes));
            }
            identifiers.push(target.identifier.clone());
            state
                .accountants
                .insert(target.identifier.clone(), ProgressAccountant::new());
            state.targets.push(target);
        }

        let transport_files: Vec<TransportFile> =
            state.targets.iter().map(TransportFile::from).collect();

        if state.paused {
            state.paused = false;
            self.transport.resume();
        }

        // 上一批的事件循环和传输任务随旧令牌一起退出
        if let Some(old) = state.run_token.take() {
            old.cancel();
        }
        let run_token = CancellationToken::new();
        state.run_token = Some(run_token.clone());

        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (poll_tx, poll_rx) = mpsc::unbounded_channel();

        // 传输层任务
        let transport = self.transport.clone();
        let transport_token = run_token.clone();
        tokio::spawn(async move {
            if let Err(e) = transport.run(transport_files, transport_tx, transport_token).await {
                error!("传输层异常退出: {:#}", e);
            }
        });

        // 事件循环
        let event_loop = EventLoop {
            session_id: self.id.clone(),
            state: self.state.clone(),
            ui_tx: self.ui_tx.clone(),
            client: self.client.clone(),
            status_base: self.status_base.clone(),
            link_prefix: self.config.link_prefix.clone(),
            completion_mode: self.config.completion_mode,
            poll_interval: self.config.poll_interval(),
            poll_tx,
            token: run_token,
        };
        state.loop_handle = Some(tokio::spawn(event_loop.run(transport_rx, poll_rx)));

        info!("会话 {} 开始上传 {} 个文件", self.id, identifiers.len());
        Ok(identifiers)
    }

    /// 校验失败：发出一次提示，不创建任何目标
    fn reject(&self, message: &str) -> UploadError {
        warn!("会话 {} 校验失败: {}", self.id, message);
        let _ = self.ui_tx.send(UploadEvent::ValidationFailed {
            message: message.to_string(),
        });
        UploadError::Validation(message.to_string())
    }

    /// 暂停（仅分片模式）
    pub fn pause(&self) -> UploadResult<()> {
        if !self.transport.supports_pause() {
            return Err(UploadError::PauseUnsupported);
        }
        let mut state = self.state.lock();
        if !state.has_running_targets() {
            return Err(UploadError::NotRunning);
        }
        if !state.paused {
            state.paused = true;
            self.transport.pause();
        }
        Ok(())
    }

    /// 恢复
    pub fn resume(&self) -> UploadResult<()> {
        if !self.transport.supports_pause() {
            return Err(UploadError::PauseUnsupported);
        }
        let mut state = self.state.lock();
        if state.paused {
            state.paused = false;
            self.transport.resume();
        }
        Ok(())
    }

    /// 取消：中止传输、清除所有轮询、清空目标
    pub fn cancel(&self) {
        let cleared = {
            let mut state = self.state.lock();
            Self::teardown(&mut state)
        };
        info!("会话 {} 已取消，清除 {} 个上传目标", self.id, cleared);
        let _ = self.ui_tx.send(UploadEvent::Reset);
    }

    fn teardown(state: &mut SessionState) -> usize {
        if let Some(token) = state.run_token.take() {
            token.cancel();
        }
        for (_, token) in state.active_pollers.drain() {
            token.cancel();
        }
        state.accountants.clear();
        let cleared = state.targets.len();
        state.targets.clear();
        cleared
    }

    /// 当前所有目标的快照
    pub fn snapshot(&self) -> Vec<UploadTarget> {
        self.state.lock().targets.clone()
    }

    /// 等待当前批次结束（全部到达终态或被取消）
    pub async fn wait_until_settled(&self) {
        let handle = self.state.lock().loop_handle.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("事件循环异常: {}", e);
            }
        }
    }
}

impl Drop for UploadSession {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        Self::teardown(&mut state);
        debug!("会话 {} 已释放", self.id);
    }
}

// =====================================================
// 事件循环
// =====================================================

struct EventLoop {
    session_id: String,
    state: Arc<Mutex<SessionState>>,
    ui_tx: mpsc::UnboundedSender<UploadEvent>,
    client: UploadClient,
    status_base: String,
    link_prefix: String,
    completion_mode: CompletionMode,
    poll_interval: Duration,
    poll_tx: mpsc::UnboundedSender<PollReport>,
    token: CancellationToken,
}

impl EventLoop {
    async fn run(
        self,
        mut transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
        mut poll_rx: mpsc::UnboundedReceiver<PollReport>,
    ) {
        let mut transport_open = true;

        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                event = transport_rx.recv(), if transport_open => {
                    match event {
                        Some(event) => self.on_transport_event(event),
                        None => {
                            transport_open = false;
                            self.on_transport_closed();
                        }
                    }
                }
                Some(report) = poll_rx.recv() => {
                    self.on_poll_report(report);
                }
            }

            let settled = {
                let state = self.state.lock();
                !self.token.is_cancelled() && state.all_settled()
            };
            if settled {
                info!("会话 {} 所有文件已结束", self.session_id);
                self.emit(UploadEvent::AllSettled);
                break;
            }
        }
    }

    fn emit(&self, event: UploadEvent) {
        let _ = self.ui_tx.send(event);
    }

    /// 加锁并确认批次未被取消（取消后到达的事件一律丢弃）
    fn lock_live(&self) -> Option<parking_lot::MutexGuard<'_, SessionState>> {
        let state = self.state.lock();
        if self.token.is_cancelled() {
            return None;
        }
        Some(state)
    }

    fn status_changed(&self, identifier: &str, old: UploadTargetState, new: UploadTargetState) {
        self.emit(UploadEvent::StatusChanged {
            identifier: identifier.to_string(),
            old_status: old.as_str().to_string(),
            new_status: new.as_str().to_string(),
        });
    }

    /// 确保目标进入上传中（首个进度样本，或没有进度就直接结束的文件）
    fn ensure_uploading(&self, target: &mut UploadTarget) {
        if target.mark_uploading() {
            self.status_changed(
                &target.identifier,
                UploadTargetState::Queued,
                UploadTargetState::Uploading,
            );
        }
    }

    fn on_transport_event(&self, event: TransportEvent) {
        let Some(mut guard) = self.lock_live() else {
            return;
        };
        let state = &mut *guard;

        match event {
            TransportEvent::FileQueued { identifier } => {
                let Some(target) = state.target_mut(&identifier) else {
                    return;
                };
                if target.state == UploadTargetState::Queued {
                    self.emit(UploadEvent::Created {
                        identifier,
                        name: target.relative_path.clone(),
                        size: target.size,
                        lane: target.lane,
                    });
                }
            }
            TransportEvent::FileProgress {
                identifier,
                loaded,
                total,
            } => {
                let Some(target) = state.targets.iter_mut().find(|t| t.identifier == identifier)
                else {
                    return;
                };
                if target.is_terminal() {
                    return;
                }
                self.ensure_uploading(target);
                if target.state != UploadTargetState::Uploading {
                    return;
                }
                let accountant = state.accountants.entry(identifier.clone()).or_default();
                let snapshot = accountant.record(loaded, total, Instant::now());
                target.bytes_transferred = snapshot.loaded;
                if let Some(speed) = snapshot.speed {
                    target.speed = speed;
                }
                self.emit(UploadEvent::Progress {
                    identifier,
                    loaded: snapshot.loaded,
                    total: snapshot.total,
                    percent: snapshot.percent,
                    speed: snapshot.speed,
                    phase: snapshot.phase,
                });
            }
            TransportEvent::FileSuccess {
                identifier, body, ..
            } => {
                let outcome = resolve(&body, self.completion_mode, &self.link_prefix);
                self.on_file_success(state, &identifier, outcome);
            }
            TransportEvent::FileError {
                identifier,
                status,
                error,
                body,
            } => {
                let classification = classify(status, error.as_deref(), &body);
                let Some(target) = state.target_mut(&identifier) else {
                    return;
                };
                self.ensure_uploading(target);
                self.fail_target(target, classification);
            }
        }
    }

    fn on_file_success(&self, state: &mut SessionState, identifier: &str, outcome: CompletionOutcome) {
        let Some(target) = state.target_mut(identifier) else {
            return;
        };
        if target.is_terminal() {
            return;
        }
        self.ensure_uploading(target);

        match outcome {
            CompletionOutcome::Deferred { temp_name } => {
                if !target.mark_awaiting_processing(temp_name.clone()) {
                    return;
                }
                self.status_changed(
                    identifier,
                    UploadTargetState::Uploading,
                    UploadTargetState::AwaitingProcessing,
                );

                // 每个等待处理的目标恰好一个轮询任务
                let token = self.token.child_token();
                state.stop_poller(identifier);
                state
                    .active_pollers
                    .insert(identifier.to_string(), token.clone());
                PollingSession::new(identifier.to_string(), temp_name, self.poll_interval).spawn(
                    self.client.clone(),
                    self.status_base.clone(),
                    token,
                    self.poll_tx.clone(),
                );
            }
            CompletionOutcome::Created {
                resource_ids,
                link,
                message,
            } => {
                target.message = message.clone();
                self.succeed_target(target, resource_ids, link, message);
            }
            CompletionOutcome::Unparsed { raw } => {
                target.message = Some(raw.clone());
                self.succeed_target(target, Vec::new(), None, Some(raw));
            }
        }
    }

    fn succeed_target(
        &self,
        target: &mut UploadTarget,
        resource_ids: Vec<String>,
        link: Option<String>,
        message: Option<String>,
    ) {
        let old = target.state;
        if !target.mark_succeeded(resource_ids.clone(), link.clone()) {
            return;
        }
        info!(
            "上传成功: {} ({}), ids={:?}",
            target.relative_path, target.identifier, resource_ids
        );
        self.status_changed(&target.identifier, old, UploadTargetState::Succeeded);
        self.emit(UploadEvent::Succeeded {
            identifier: target.identifier.clone(),
            resource_ids,
            link,
            message,
        });
    }

    fn fail_target(&self, target: &mut UploadTarget, classification: Classification) {
        let old = target.state;
        if !target.mark_failed(Some(classification.clone()), classification.to_string()) {
            return;
        }
        error!(
            "上传失败: {} ({}), {}",
            target.relative_path, target.identifier, classification
        );
        self.status_changed(&target.identifier, old, UploadTargetState::Failed);
        self.emit(UploadEvent::Failed {
            identifier: target.identifier.clone(),
            classification,
        });
    }

    /// 传输层结束：仍未结束传输的目标视为传输失败
    fn on_transport_closed(&self) {
        let Some(mut guard) = self.lock_live() else {
            return;
        };
        for target in guard.targets.iter_mut() {
            if matches!(
                target.state,
                UploadTargetState::Queued | UploadTargetState::Uploading
            ) {
                let classification = classify(None, Some("transfer ended unexpectedly"), "");
                self.ensure_uploading(target);
                self.fail_target(target, classification);
            }
        }
    }

    fn on_poll_report(&self, report: PollReport) {
        let Some(mut guard) = self.lock_live() else {
            return;
        };
        let state = &mut *guard;
        let PollReport { identifier, update } = report;

        // 已停止的轮询（迟到的报告）直接丢弃
        if !state.active_pollers.contains_key(&identifier) {
            debug!("丢弃已停止轮询的报告: id={}", identifier);
            return;
        }

        let terminal = update.is_terminal();
        if terminal {
            state.stop_poller(&identifier);
        }

        let Some(target) = state.target_mut(&identifier) else {
            return;
        };
        if target.state != UploadTargetState::AwaitingProcessing {
            return;
        }

        match update {
            PollUpdate::Status { status, message } => {
                target.processing_status = Some(status.as_str().to_string());
                self.emit(UploadEvent::Processing {
                    identifier,
                    status: status.as_str().to_string(),
                    message,
                });
            }
            PollUpdate::Problem { description } => {
                self.emit(UploadEvent::PollProblem {
                    identifier,
                    description,
                });
            }
            PollUpdate::Completed {
                resource_id,
                message,
            } => {
                target.processing_status = Some("completed".to_string());
                target.message = message.clone();
                let resource_ids = vec![resource_id];
                let link = build_link(&self.link_prefix, &resource_ids, None);
                self.succeed_target(target, resource_ids, link, message);
            }
            PollUpdate::Failed { message } => {
                target.processing_status = Some("failed".to_string());
                self.fail_target(target, Classification::processing_failed(message));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{write_selected, MockServer};
    use crate::uploader::status::{FailureCategory, Severity};

    /// 收集界面事件直到 AllSettled
    async fn drain_until_settled(rx: &mut mpsc::UnboundedReceiver<UploadEvent>) -> Vec<UploadEvent> {
        let mut events = Vec::new();
        let deadline = Duration::from_secs(20);
        tokio::time::timeout(deadline, async {
            while let Some(event) = rx.recv().await {
                let done = matches!(event, UploadEvent::AllSettled);
                events.push(event);
                if done {
                    break;
                }
            }
        })
        .await
        .expect("session did not settle");
        events
    }

    fn session_for(
        config: UploadConfig,
    ) -> (UploadSession, mpsc::UnboundedReceiver<UploadEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (UploadSession::new(config, tx).unwrap(), rx)
    }

    fn target_state(session: &UploadSession, identifier: &str) -> UploadTargetState {
        session
            .snapshot()
            .into_iter()
            .find(|t| t.identifier == identifier)
            .map(|t| t.state)
            .unwrap()
    }

    #[tokio::test]
    async fn test_immediate_success_with_link() {
        let server = MockServer::start().await;
        let dir = tempfile::TempDir::new().unwrap();
        let file = write_selected(&dir, "game.zip", 2048).await;

        let (session, mut rx) = session_for(server.upload_config());
        let ids = session.start(vec![file]).unwrap();
        let events = drain_until_settled(&mut rx).await;

        assert!(matches!(events.first(), Some(UploadEvent::Created { .. })));
        assert!(events.iter().any(|e| matches!(
            e,
            UploadEvent::StatusChanged { new_status, .. } if new_status == "uploading"
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            UploadEvent::Succeeded { link: Some(link), .. } if link == "/web/submission/1"
        )));
        assert_eq!(target_state(&session, &ids[0]), UploadTargetState::Succeeded);
        assert_eq!(session.snapshot()[0].progress(), 100.0);
    }

    #[tokio::test]
    async fn test_polling_until_completed() {
        let server = MockServer::start().await;
        server
            .state
            .script_file_response("game.zip", 200, r#"{"temp_name":"tmp-a"}"#);
        server.state.script_status(
            "tmp-a",
            &[
                (200, r#"{"status":{"status":"queued","message":null,"submission_id":null}}"#),
                (200, r#"{"status":{"status":"processing","message":"extracting","submission_id":null}}"#),
                (200, r#"{"status":{"status":"processing","message":"validating","submission_id":null}}"#),
                (200, r#"{"status":{"status":"completed","message":null,"submission_id":"42"}}"#),
            ],
        );
        let dir = tempfile::TempDir::new().unwrap();
        let file = write_selected(&dir, "game.zip", 100).await;

        let (session, mut rx) = session_for(server.upload_config());
        let ids = session.start(vec![file]).unwrap();
        let events = drain_until_settled(&mut rx).await;

        assert_eq!(server.state.status_polls("tmp-a"), 4);
        let processing = events
            .iter()
            .filter(|e| matches!(e, UploadEvent::Processing { .. }))
            .count();
        assert_eq!(processing, 3);
        assert!(events.iter().any(|e| matches!(
            e,
            UploadEvent::StatusChanged { new_status, .. } if new_status == "awaiting_processing"
        )));

        let target = &session.snapshot()[0];
        assert_eq!(target.identifier, ids[0]);
        assert_eq!(target.state, UploadTargetState::Succeeded);
        assert_eq!(target.resource_ids, vec!["42".to_string()]);
        assert_eq!(target.link.as_deref(), Some("/web/submission/42"));
        assert_eq!(session.state.lock().active_pollers.len(), 0);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(server.state.status_polls("tmp-a"), 4);
    }

    #[tokio::test]
    async fn test_polling_failed_without_id() {
        let server = MockServer::start().await;
        server
            .state
            .script_file_response("game.zip", 200, r#"{"temp_name":"tmp-b"}"#);
        server.state.script_status(
            "tmp-b",
            &[
                (200, r#"{"status":{"status":"processing","message":null,"submission_id":null}}"#),
                (200, r#"{"status":{"status":"failed","message":"corrupt archive","submission_id":null}}"#),
            ],
        );
        let dir = tempfile::TempDir::new().unwrap();
        let file = write_selected(&dir, "game.zip", 100).await;

        let (session, mut rx) = session_for(server.upload_config());
        let ids = session.start(vec![file]).unwrap();
        let events = drain_until_settled(&mut rx).await;

        assert_eq!(target_state(&session, &ids[0]), UploadTargetState::Failed);
        assert!(events.iter().any(|e| matches!(
            e,
            UploadEvent::Failed { classification, .. } if classification.message == "corrupt archive"
        )));
        assert_eq!(server.state.status_polls("tmp-b"), 2);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(server.state.status_polls("tmp-b"), 2);
    }

    #[tokio::test]
    async fn test_conflict_is_warning_and_sibling_proceeds() {
        let server = MockServer::start().await;
        server.state.script_file_response(
            "dup.zip",
            409,
            r#"{"status":409,"message":"already submitted"}"#,
        );
        let dir = tempfile::TempDir::new().unwrap();
        let dup = write_selected(&dir, "dup.zip", 100).await;
        let other = write_selected(&dir, "other.zip", 100).await;

        let mut config = server.upload_config();
        config.max_simultaneous = 1;
        let (session, mut rx) = session_for(config);
        let ids = session.start(vec![dup, other]).unwrap();
        let events = drain_until_settled(&mut rx).await;

        let failure = events.iter().find_map(|e| match e {
            UploadEvent::Failed {
                identifier,
                classification,
            } if *identifier == ids[0] => Some(classification.clone()),
            _ => None,
        });
        let failure = failure.expect("dup.zip should fail");
        assert_eq!(failure.category, FailureCategory::Conflict);
        assert_eq!(failure.severity, Severity::Warning);
        assert_eq!(
            failure.to_string(),
            "Upload failed! Request status: 409 - Conflict. Server response: already submitted"
        );

        assert!(events.iter().any(|e| matches!(
            e,
            UploadEvent::StatusChanged { identifier, new_status, .. }
                if *identifier == ids[1] && new_status == "uploading"
        )));
        assert_eq!(target_state(&session, &ids[0]), UploadTargetState::Failed);
        assert_eq!(target_state(&session, &ids[1]), UploadTargetState::Succeeded);
    }

    #[tokio::test]
    async fn test_disallowed_extension_rejects_whole_selection() {
        let server = MockServer::start().await;
        let dir = tempfile::TempDir::new().unwrap();
        let files = vec![
            write_selected(&dir, "a.zip", 10).await,
            write_selected(&dir, "b.7z", 10).await,
            write_selected(&dir, "c.exe", 10).await,
            write_selected(&dir, "d.zip", 10).await,
        ];

        let mut config = server.upload_config();
        config.allowed_extensions = vec![".zip".to_string(), ".7z".to_string()];
        let (session, mut rx) = session_for(config);

        let err = session.start(files).unwrap_err();
        assert!(err.is_validation());
        assert_eq!(err.to_string(), "Error : Incorrect file type.");
        assert!(session.snapshot().is_empty());

        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut alerts = 0;
        while let Ok(event) = rx.try_recv() {
            assert!(matches!(event, UploadEvent::ValidationFailed { .. }));
            alerts += 1;
        }
        assert_eq!(alerts, 1);
        assert_eq!(server.state.chunk_checks(), 0);
        assert_eq!(server.state.chunk_attempts(), 0);
    }

    #[tokio::test]
    async fn test_selection_over_max_files_rejected() {
        let server = MockServer::start().await;
        let dir = tempfile::TempDir::new().unwrap();
        let files = vec![
            write_selected(&dir, "a.zip", 10).await,
            write_selected(&dir, "b.zip", 10).await,
            write_selected(&dir, "c.zip", 10).await,
        ];

        let mut config = server.upload_config();
        config.max_files = Some(2);
        let (session, mut rx) = session_for(config);

        let err = session.start(files.clone()).unwrap_err();
        assert!(err.is_validation());
        assert_eq!(
            err.to_string(),
            "Error : Please upload no more than 2 files at a time."
        );
        assert!(session.snapshot().is_empty());

        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut alerts = 0;
        while let Ok(event) = rx.try_recv() {
            assert!(matches!(event, UploadEvent::ValidationFailed { .. }));
            alerts += 1;
        }
        assert_eq!(alerts, 1);
        assert_eq!(server.state.chunk_checks(), 0);
        assert_eq!(server.state.chunk_attempts(), 0);

        // 不超过上限的选择照常上传
        let ids = session.start(files[..2].to_vec()).unwrap();
        assert_eq!(ids.len(), 2);
        drain_until_settled(&mut rx).await;
        for id in &ids {
            assert_eq!(target_state(&session, id), UploadTargetState::Succeeded);
        }
    }

    #[test]
    fn test_too_many_files_message() {
        assert_eq!(too_many_files(1), "Please upload no more than 1 file at a time.");
        assert_eq!(too_many_files(5), "Please upload no more than 5 files at a time.");
    }

    #[tokio::test]
    async fn test_new_batch_cancels_previous_run_token() {
        let server = MockServer::start().await;
        let dir = tempfile::TempDir::new().unwrap();
        let first = write_selected(&dir, "first.zip", 10).await;
        let second = write_selected(&dir, "second.zip", 20).await;

        let (session, mut rx) = session_for(server.upload_config());
        session.start(vec![first]).unwrap();
        drain_until_settled(&mut rx).await;
        let old = session
            .state
            .lock()
            .run_token
            .clone()
            .expect("first batch token");
        assert!(!old.is_cancelled());

        let ids = session.start(vec![second]).unwrap();
        assert!(old.is_cancelled());
        let current = session.state.lock().run_token.clone().unwrap();
        assert!(!current.is_cancelled());

        drain_until_settled(&mut rx).await;
        assert_eq!(target_state(&session, &ids[0]), UploadTargetState::Succeeded);
    }

    #[tokio::test]
    async fn test_empty_selection_rejected() {
        let server = MockServer::start().await;
        let (session, mut rx) = session_for(server.upload_config());
        let err = session.start(Vec::new()).unwrap_err();
        assert_eq!(err.to_string(), "Error : No file selected");
        assert!(matches!(
            rx.try_recv(),
            Ok(UploadEvent::ValidationFailed { message }) if message == NO_FILE_SELECTED
        ));
    }

    #[tokio::test]
    async fn test_second_start_while_running_is_rejected() {
        let server = MockServer::start().await;
        server.state.behavior.lock().chunk_delay = Duration::from_millis(200);
        let dir = tempfile::TempDir::new().unwrap();
        let first = write_selected(&dir, "a.zip", 10).await;
        let second = write_selected(&dir, "b.zip", 10).await;

        let (session, mut rx) = session_for(server.upload_config());
        session.start(vec![first]).unwrap();
        assert!(matches!(
            session.start(vec![second.clone()]),
            Err(UploadError::AlreadyRunning)
        ));
        assert_eq!(session.snapshot().len(), 1);

        drain_until_settled(&mut rx).await;
        session.wait_until_settled().await;

        // 上一批结束后可以再次启动
        session.start(vec![second]).unwrap();
        drain_until_settled(&mut rx).await;
        assert_eq!(session.snapshot().len(), 1);
        assert_eq!(session.snapshot()[0].relative_path, "b.zip");
    }

    #[tokio::test]
    async fn test_cancel_clears_targets_and_pollers() {
        let server = MockServer::start().await;
        server
            .state
            .script_file_response("game.zip", 200, r#"{"temp_name":"tmp-c"}"#);
        server.state.script_status(
            "tmp-c",
            &[(200, r#"{"status":{"status":"processing","message":null,"submission_id":null}}"#)],
        );
        let dir = tempfile::TempDir::new().unwrap();
        let file = write_selected(&dir, "game.zip", 100).await;

        let (session, mut rx) = session_for(server.upload_config());
        session.start(vec![file]).unwrap();

        // 等待进入轮询
        tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(event) = rx.recv().await {
                if matches!(event, UploadEvent::Processing { .. }) {
                    break;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(session.state.lock().active_pollers.len(), 1);

        session.cancel();
        session.wait_until_settled().await;
        assert!(session.snapshot().is_empty());
        assert_eq!(session.state.lock().active_pollers.len(), 0);

        let polls = server.state.status_polls("tmp-c");
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(server.state.status_polls("tmp-c"), polls);

        let mut saw_reset = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, UploadEvent::Reset) {
                saw_reset = true;
            }
        }
        assert!(saw_reset);
    }

    #[tokio::test]
    async fn test_pause_only_in_chunked_mode() {
        let server = MockServer::start().await;
        let mut config = server.upload_config();
        config.transport_mode = TransportMode::Legacy;
        let (session, _rx) = session_for(config);
        assert!(matches!(session.pause(), Err(UploadError::PauseUnsupported)));

        let (session, _rx) = session_for(server.upload_config());
        assert!(matches!(session.pause(), Err(UploadError::NotRunning)));
    }

    #[tokio::test]
    async fn test_pause_and_resume_chunked() {
        let server = MockServer::start().await;
        server.state.behavior.lock().chunk_delay = Duration::from_millis(100);
        let dir = tempfile::TempDir::new().unwrap();
        let file = write_selected(&dir, "a.zip", 10).await;

        let (session, mut rx) = session_for(server.upload_config());
        let ids = session.start(vec![file]).unwrap();
        session.pause().unwrap();
        assert!(session.state.lock().paused);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_ne!(target_state(&session, &ids[0]), UploadTargetState::Succeeded);

        session.resume().unwrap();
        drain_until_settled(&mut rx).await;
        assert_eq!(target_state(&session, &ids[0]), UploadTargetState::Succeeded);
    }

    #[tokio::test]
    async fn test_legacy_mode_assigns_lanes() {
        let server = MockServer::start().await;
        let dir = tempfile::TempDir::new().unwrap();
        let mut files = Vec::new();
        for i in 0..5 {
            files.push(write_selected(&dir, &format!("f{}.zip", i), 50).await);
        }

        let mut config = server.upload_config();
        config.transport_mode = TransportMode::Legacy;
        config.max_simultaneous = 2;
        let (session, mut rx) = session_for(config);
        session.start(files).unwrap();
        let events = drain_until_settled(&mut rx).await;

        let lanes: Vec<Option<usize>> = session.snapshot().iter().map(|t| t.lane).collect();
        assert_eq!(lanes, vec![Some(0), Some(1), Some(0), Some(1), Some(0)]);
        let created = events
            .iter()
            .filter(|e| matches!(e, UploadEvent::Created { lane: Some(_), .. }))
            .count();
        assert_eq!(created, 5);
        assert!(session
            .snapshot()
            .iter()
            .all(|t| t.state == UploadTargetState::Succeeded));
        assert!(server.state.max_in_flight() <= 2);
    }

    #[tokio::test]
    async fn test_duplicate_selection_keeps_lanes_aligned() {
        let server = MockServer::start().await;
        server.state.behavior.lock().file_delay = Duration::from_millis(100);
        let dir = tempfile::TempDir::new().unwrap();
        let a = write_selected(&dir, "a.zip", 20).await;
        let b = write_selected(&dir, "b.zip", 30).await;
        let c = write_selected(&dir, "c.zip", 40).await;

        let mut config = server.upload_config();
        config.transport_mode = TransportMode::Legacy;
        config.max_simultaneous = 2;
        let (session, mut rx) = session_for(config);
        let ids = session
            .start(vec![a.clone(), a, b, c])
            .unwrap();
        assert_eq!(ids.len(), 3);
        let events = drain_until_settled(&mut rx).await;

        let lanes: Vec<(String, Option<usize>)> = session
            .snapshot()
            .iter()
            .map(|t| (t.relative_path.clone(), t.lane))
            .collect();
        assert_eq!(
            lanes,
            vec![
                ("a.zip".to_string(), Some(0)),
                ("b.zip".to_string(), Some(1)),
                ("c.zip".to_string(), Some(0)),
            ]
        );
        assert!(events.iter().any(|e| matches!(
            e,
            UploadEvent::Created { name, lane: Some(1), .. } if name == "b.zip"
        )));

        // b 在第二条通道上与 a 并行，c 排在 a 之后
        let timeline = server.state.file_timeline();
        let a_end = timeline.end_of("a.zip").unwrap();
        assert!(timeline.start_of("b.zip").unwrap() < a_end);
        assert!(timeline.start_of("c.zip").unwrap() >= a_end);
        assert_eq!(server.state.file_attempts("a.zip"), 1);
    }

    #[tokio::test]
    async fn test_unparsed_success_body_shows_raw_text() {
        let server = MockServer::start().await;
        server.state.script_file_response("a.zip", 200, "stored, thanks");
        let dir = tempfile::TempDir::new().unwrap();
        let file = write_selected(&dir, "a.zip", 10).await;

        let (session, mut rx) = session_for(server.upload_config());
        session.start(vec![file]).unwrap();
        let events = drain_until_settled(&mut rx).await;

        assert!(events.iter().any(|e| matches!(
            e,
            UploadEvent::Succeeded { link: None, message: Some(m), .. } if m == "stored, thanks"
        )));
    }

    #[tokio::test]
    async fn test_immediate_mode_ignores_temp_name() {
        let server = MockServer::start().await;
        server
            .state
            .script_file_response("a.zip", 200, r#"{"temp_name":"tmp-x","submission_id":3}"#);
        let dir = tempfile::TempDir::new().unwrap();
        let file = write_selected(&dir, "a.zip", 10).await;

        let mut config = server.upload_config();
        config.completion_mode = CompletionMode::Immediate;
        let (session, mut rx) = session_for(config);
        session.start(vec![file]).unwrap();
        drain_until_settled(&mut rx).await;

        assert_eq!(server.state.status_polls("tmp-x"), 0);
        assert_eq!(session.snapshot()[0].resource_ids, vec!["3".to_string()]);
    }

    #[tokio::test]
    async fn test_progress_reaches_100_and_is_monotonic() {
        let server = MockServer::start().await;
        let dir = tempfile::TempDir::new().unwrap();
        let file = write_selected(&dir, "big.zip", 300_000).await;

        let (session, mut rx) = session_for(server.upload_config());
        session.start(vec![file]).unwrap();
        let events = drain_until_settled(&mut rx).await;

        let percents: Vec<f64> = events
            .iter()
            .filter_map(|e| match e {
                UploadEvent::Progress { percent, .. } => Some(*percent),
                _ => None,
            })
            .collect();
        assert!(!percents.is_empty());
        assert!(percents.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(percents.last().copied(), Some(100.0));
    }
}
