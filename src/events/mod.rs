// 会话事件模块
//
// 会话控制器发给界面协作方（CLI 渲染器）的事件，以及进度事件节流

pub mod throttle;
pub mod types;

pub use throttle::{ProgressThrottler, DEFAULT_THROTTLE_INTERVAL_MS};
pub use types::UploadEvent;
