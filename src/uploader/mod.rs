// 上传编排模块
//
// - 文件选择校验（扩展名白名单，整批拒绝）
// - 两种传输方式：可续传分片上传 / 传统多通道整文件上传
// - 分片级重试（指数退避，永久性错误不重试）
// - 服务器延后处理时轮询处理状态
// - 会话级暂停 / 恢复 / 取消

pub mod chunk;
pub mod chunked;
pub mod completion;
pub mod identity;
pub mod legacy;
pub mod poller;
pub mod progress;
pub mod session;
pub mod status;
pub mod target;
pub mod transport;

pub use chunk::{chunk_count, plan_chunks, ChunkDescriptor};
pub use chunked::{calculate_backoff_delay, is_permanent_status, ChunkTransport};
pub use completion::{resolve, CompletionOutcome};
pub use identity::identify;
pub use legacy::{lane_for, partition_lanes, LegacyTransport};
pub use poller::{PollReport, PollUpdate, PollingSession};
pub use progress::{format_size, percent_complete, ProgressAccountant, ProgressSnapshot, TransferPhase};
pub use session::{UploadSession, INCORRECT_FILE_TYPE, NO_FILE_SELECTED};
pub use status::{classify, Classification, FailureCategory, Severity};
pub use target::{SelectedFile, UploadTarget, UploadTargetState};
pub use transport::{TransportEvent, TransportFile, UploadTransport};
