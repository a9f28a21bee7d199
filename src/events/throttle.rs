//! 进度事件节流器
//!
//! 分片流每发送一段数据就会回调一次，直接转发会产生事件风暴。
//! 每个文件持有一个节流器，间隔内只放行一个进度样本；
//! 字节全部发送完成的样本总是放行，保证界面能看到 100%。

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// 默认节流间隔（毫秒）
pub const DEFAULT_THROTTLE_INTERVAL_MS: u64 = 200;

/// 表示"从未放行过"的时间戳
const NEVER: u64 = u64::MAX;

/// 进度事件节流器
///
/// 线程安全，使用原子操作避免锁竞争
#[derive(Debug)]
pub struct ProgressThrottler {
    /// 计时起点
    origin: Instant,
    /// 上次放行的时间（相对 origin 的纳秒数）
    last_emit_nanos: AtomicU64,
    /// 节流间隔（纳秒）
    interval_nanos: u64,
}

impl ProgressThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            origin: Instant::now(),
            last_emit_nanos: AtomicU64::new(NEVER),
            interval_nanos: interval.as_nanos() as u64,
        }
    }

    pub fn with_millis(interval_ms: u64) -> Self {
        Self::new(Duration::from_millis(interval_ms))
    }

    /// 是否放行一个进度样本
    ///
    /// `loaded >= total` 时强制放行
    pub fn should_emit_progress(&self, loaded: u64, total: u64) -> bool {
        if loaded >= total {
            return self.force_emit();
        }
        self.should_emit()
    }

    /// 距上次放行超过间隔时返回 true
    ///
    /// 多个线程同时到达时，只有 CAS 成功的一方放行
    pub fn should_emit(&self) -> bool {
        let now = self.elapsed_nanos();
        let last = self.last_emit_nanos.load(Ordering::Relaxed);

        if last != NEVER && now.saturating_sub(last) < self.interval_nanos {
            return false;
        }

        self.last_emit_nanos
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    /// 强制放行
    pub fn force_emit(&self) -> bool {
        self.last_emit_nanos
            .store(self.elapsed_nanos(), Ordering::Relaxed);
        true
    }

    fn elapsed_nanos(&self) -> u64 {
        // 与 NEVER 区分
        (self.origin.elapsed().as_nanos() as u64).min(NEVER - 1)
    }
}

impl Default for ProgressThrottler {
    fn default() -> Self {
        Self::with_millis(DEFAULT_THROTTLE_INTERVAL_MS)
    }
}
