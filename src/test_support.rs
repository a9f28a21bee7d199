// 测试用的进程内上传服务器
//
// 用 axum 实现三个接口（分片/整文件上传、分片探测、处理状态查询），
// 响应可按文件名或 temp_name 编排，并记录收到的请求供断言使用。

use crate::config::UploadConfig;
use crate::uploader::identity::identify;
use crate::uploader::target::SelectedFile;
use crate::uploader::transport::{TransportEvent, TransportFile, UploadTransport};
use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const UPLOAD_PATH: &str = "/api/submission-receiver-resumable";

/// 收到的分片
#[derive(Debug, Clone)]
pub struct ReceivedChunk {
    pub filename: String,
    pub identifier: String,
    pub chunk_number: u64,
    pub total_chunks: u64,
    pub total_size: u64,
    pub data_len: u64,
}

/// 响应编排
#[derive(Debug, Default)]
pub struct Behavior {
    pub chunk_delay: Duration,
    pub file_delay: Duration,
    /// 探测时返回 409 的文件名
    pub check_conflict: HashSet<String>,
    /// 分片请求依次返回的失败状态码（按文件名）
    pub chunk_failures: HashMap<String, VecDeque<u16>>,
    /// 文件完成时的响应（按文件名）；分片模式用于最后一个分片，整文件模式用于整个请求
    pub completion_responses: HashMap<String, (u16, String)>,
    /// 处理状态查询依次返回的响应（按 temp_name，最后一个重复使用）
    pub status_scripts: HashMap<String, VecDeque<(u16, String)>>,
}

#[derive(Debug, Clone)]
enum Mark {
    Start,
    End,
}

/// 整文件请求的开始/结束时间线
#[derive(Debug)]
pub struct Timeline {
    entries: Vec<(String, Mark, Instant)>,
}

impl Timeline {
    pub fn start_of(&self, name: &str) -> Option<Instant> {
        self.entries
            .iter()
            .find(|(n, m, _)| n == name && matches!(m, Mark::Start))
            .map(|(_, _, at)| *at)
    }

    pub fn end_of(&self, name: &str) -> Option<Instant> {
        self.entries
            .iter()
            .find(|(n, m, _)| n == name && matches!(m, Mark::End))
            .map(|(_, _, at)| *at)
    }
}

#[derive(Debug, Default)]
pub struct MockState {
    pub behavior: Mutex<Behavior>,
    chunks: Mutex<Vec<ReceivedChunk>>,
    stored: Mutex<HashSet<(String, u64)>>,
    chunk_attempts: AtomicUsize,
    chunk_checks: AtomicUsize,
    file_attempts: Mutex<HashMap<String, usize>>,
    timeline: Mutex<Vec<(String, Mark, Instant)>>,
    status_polls: Mutex<HashMap<String, usize>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    next_submission_id: AtomicUsize,
}

/// 在途请求计数（drop 时减一，请求被客户端中止时也能正确计数）
struct InFlightGuard(Arc<MockState>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockState {
    fn enter(self: &Arc<Self>) -> InFlightGuard {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlightGuard(self.clone())
    }

    pub fn received_chunks(&self) -> Vec<ReceivedChunk> {
        self.chunks.lock().clone()
    }

    pub fn mark_stored(&self, identifier: &str, chunk_number: u64) {
        self.stored
            .lock()
            .insert((identifier.to_string(), chunk_number));
    }

    pub fn chunk_attempts(&self) -> usize {
        self.chunk_attempts.load(Ordering::SeqCst)
    }

    pub fn chunk_checks(&self) -> usize {
        self.chunk_checks.load(Ordering::SeqCst)
    }

    pub fn file_attempts(&self, name: &str) -> usize {
        self.file_attempts.lock().get(name).copied().unwrap_or(0)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn file_timeline(&self) -> Timeline {
        Timeline {
            entries: self.timeline.lock().clone(),
        }
    }

    pub fn status_polls(&self, temp_name: &str) -> usize {
        self.status_polls
            .lock()
            .get(temp_name)
            .copied()
            .unwrap_or(0)
    }

    pub fn script_chunk_failures(&self, name: &str, statuses: &[u16]) {
        self.behavior
            .lock()
            .chunk_failures
            .insert(name.to_string(), statuses.iter().copied().collect());
    }

    pub fn script_file_response(&self, name: &str, status: u16, body: &str) {
        self.behavior
            .lock()
            .completion_responses
            .insert(name.to_string(), (status, body.to_string()));
    }

    pub fn script_status(&self, temp_name: &str, responses: &[(u16, &str)]) {
        self.behavior.lock().status_scripts.insert(
            temp_name.to_string(),
            responses
                .iter()
                .map(|(s, b)| (*s, b.to_string()))
                .collect(),
        );
    }

    fn completion_response(&self, name: &str) -> (u16, String) {
        if let Some(response) = self.behavior.lock().completion_responses.get(name) {
            return response.clone();
        }
        let id = self.next_submission_id.fetch_add(1, Ordering::SeqCst) + 1;
        (200, format!(r#"{{"submission_id":{}}}"#, id))
    }
}

pub struct MockServer {
    pub base_url: String,
    pub state: Arc<MockState>,
}

impl MockServer {
    pub async fn start() -> Self {
        let state = Arc::new(MockState::default());
        let app = Router::new()
            .route(UPLOAD_PATH, get(check_chunk).post(receive_upload))
            .route("/api/upload-status/:temp_name", get(upload_status))
            .layer(DefaultBodyLimit::disable())
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{}", addr),
            state,
        }
    }

    /// 指向本服务器的上传配置（短轮询间隔）
    pub fn upload_config(&self) -> UploadConfig {
        UploadConfig {
            target_url: format!("{}{}", self.base_url, UPLOAD_PATH),
            poll_interval_ms: 50,
            request_timeout_secs: 10,
            ..UploadConfig::default()
        }
    }
}

async fn check_chunk(
    State(state): State<Arc<MockState>>,
    Query(query): Query<HashMap<String, String>>,
) -> (StatusCode, String) {
    state.chunk_checks.fetch_add(1, Ordering::SeqCst);
    let filename = query.get("resumableFilename").cloned().unwrap_or_default();
    let identifier = query
        .get("resumableIdentifier")
        .cloned()
        .unwrap_or_default();
    let number: u64 = query
        .get("resumableChunkNumber")
        .and_then(|n| n.parse().ok())
        .unwrap_or(0);

    if state.behavior.lock().check_conflict.contains(&filename) {
        return (
            StatusCode::CONFLICT,
            r#"{"status":409,"message":"file already fully received"}"#.to_string(),
        );
    }
    if state.stored.lock().contains(&(identifier, number)) {
        return (StatusCode::OK, r#"{"message":"chunk already stored"}"#.to_string());
    }
    (StatusCode::NO_CONTENT, String::new())
}

async fn receive_upload(
    State(state): State<Arc<MockState>>,
    mut multipart: Multipart,
) -> (StatusCode, String) {
    let entered = Instant::now();
    let _guard = state.enter();

    let mut fields: HashMap<String, String> = HashMap::new();
    let mut file: Option<(String, String, u64)> = None;
    while let Ok(Some(field)) = multipart.next_field().await {
        let name = field.name().unwrap_or_default().to_string();
        match field.file_name().map(str::to_string) {
            Some(file_name) => {
                let data = field.bytes().await.unwrap_or_default();
                file = Some((name, file_name, data.len() as u64));
            }
            None => {
                let value = field.text().await.unwrap_or_default();
                fields.insert(name, value);
            }
        }
    }

    if fields.contains_key("resumableChunkNumber") {
        return receive_chunk(&state, &fields, file).await;
    }

    // 整文件上传
    let Some((_, file_name, _)) = file else {
        return (
            StatusCode::BAD_REQUEST,
            r#"{"status":400,"message":"missing file"}"#.to_string(),
        );
    };
    state
        .timeline
        .lock()
        .push((file_name.clone(), Mark::Start, entered));
    *state
        .file_attempts
        .lock()
        .entry(file_name.clone())
        .or_insert(0) += 1;

    let delay = state.behavior.lock().file_delay;
    tokio::time::sleep(delay).await;

    let (status, body) = state.completion_response(&file_name);
    state
        .timeline
        .lock()
        .push((file_name, Mark::End, Instant::now()));
    (
        StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        body,
    )
}

async fn receive_chunk(
    state: &Arc<MockState>,
    fields: &HashMap<String, String>,
    file: Option<(String, String, u64)>,
) -> (StatusCode, String) {
    state.chunk_attempts.fetch_add(1, Ordering::SeqCst);
    let get = |key: &str| fields.get(key).cloned().unwrap_or_default();
    let number = |key: &str| get(key).parse::<u64>().unwrap_or(0);
    let filename = get("resumableFilename");

    let (delay, failure) = {
        let mut behavior = state.behavior.lock();
        let failure = behavior
            .chunk_failures
            .get_mut(&filename)
            .and_then(VecDeque::pop_front);
        (behavior.chunk_delay, failure)
    };
    tokio::time::sleep(delay).await;

    if let Some(status) = failure {
        return (
            StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            format!(r#"{{"status":{},"message":"scripted failure"}}"#, status),
        );
    }

    let chunk = ReceivedChunk {
        filename: filename.clone(),
        identifier: get("resumableIdentifier"),
        chunk_number: number("resumableChunkNumber"),
        total_chunks: number("resumableTotalChunks"),
        total_size: number("resumableTotalSize"),
        data_len: file.map(|(_, _, len)| len).unwrap_or(0),
    };

    let complete = {
        let mut stored = state.stored.lock();
        stored.insert((chunk.identifier.clone(), chunk.chunk_number));
        let received = stored
            .iter()
            .filter(|(id, _)| *id == chunk.identifier)
            .count() as u64;
        received >= chunk.total_chunks
    };
    state.chunks.lock().push(chunk);

    if complete {
        let (status, body) = state.completion_response(&filename);
        return (
            StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            body,
        );
    }
    (StatusCode::OK, r#"{"message":"chunk received"}"#.to_string())
}

async fn upload_status(
    State(state): State<Arc<MockState>>,
    Path(temp_name): Path<String>,
) -> (StatusCode, String) {
    *state
        .status_polls
        .lock()
        .entry(temp_name.clone())
        .or_insert(0) += 1;

    let scripted = {
        let mut behavior = state.behavior.lock();
        behavior.status_scripts.get_mut(&temp_name).and_then(|script| {
            if script.len() > 1 {
                script.pop_front()
            } else {
                script.front().cloned()
            }
        })
    };

    match scripted {
        Some((status, body)) => (
            StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            body,
        ),
        None => (
            StatusCode::NOT_FOUND,
            r#"{"status":404,"message":"unknown temp_name"}"#.to_string(),
        ),
    }
}

/// 写入测试文件，返回传输层文件描述
pub async fn write_file(dir: &tempfile::TempDir, name: &str, size: u64) -> TransportFile {
    let selected = write_selected(dir, name, size).await;
    TransportFile {
        identifier: identify(&selected.relative_path, selected.size),
        local_path: selected.local_path,
        relative_path: selected.relative_path,
        file_name: name.to_string(),
        size,
    }
}

/// 写入测试文件，返回用户选择的文件
pub async fn write_selected(dir: &tempfile::TempDir, name: &str, size: u64) -> SelectedFile {
    let path = dir.path().join(name);
    let content: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
    tokio::fs::write(&path, content).await.unwrap();
    SelectedFile::new(path, name, size)
}

/// 运行传输层直到结束，返回所有事件并检查终态事件数
pub async fn collect_until_settled<T: UploadTransport + ?Sized>(
    transport: &T,
    files: Vec<TransportFile>,
    expected_terminal: usize,
) -> Vec<TransportEvent> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    tokio::time::timeout(
        Duration::from_secs(20),
        transport.run(files, tx, CancellationToken::new()),
    )
    .await
    .expect("transport timed out")
    .expect("transport failed");

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    let terminal = events
        .iter()
        .filter(|e| {
            matches!(
                e,
                TransportEvent::FileSuccess { .. } | TransportEvent::FileError { .. }
            )
        })
        .count();
    assert_eq!(terminal, expected_terminal, "events: {:?}", events);
    events
}
