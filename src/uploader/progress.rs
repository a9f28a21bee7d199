// 进度统计
//
// 把原始的字节数回调转换为百分比和瞬时速度。
// 速度只用当前样本与上一个样本的差值计算（不是整体平均），反映最近的网络状况。

use serde::{Deserialize, Serialize};
use std::time::Instant;

/// 传输阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferPhase {
    /// 传输中
    Transferring,
    /// 字节已全部发送，等待服务器校验和处理
    Finalizing,
}

/// 单次进度统计结果
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    /// 已传输字节数
    pub loaded: u64,
    /// 总字节数
    pub total: u64,
    /// 完成百分比 0..=100
    pub percent: f64,
    /// 瞬时速度 (bytes/s)，首个样本没有上一次数据时为 None
    pub speed: Option<u64>,
    pub phase: TransferPhase,
}

/// 单个文件的进度统计器
#[derive(Debug, Default)]
pub struct ProgressAccountant {
    /// 上一个样本（字节数, 时间）
    last_sample: Option<(u64, Instant)>,
}

impl ProgressAccountant {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录一个进度样本
    pub fn record(&mut self, loaded: u64, total: u64, at: Instant) -> ProgressSnapshot {
        let speed = self.last_sample.and_then(|(last_loaded, last_at)| {
            let elapsed = at.checked_duration_since(last_at)?.as_secs_f64();
            if elapsed <= 0.0 {
                return None;
            }
            let delta = loaded.saturating_sub(last_loaded);
            Some((delta as f64 / elapsed) as u64)
        });

        self.last_sample = Some((loaded, at));

        ProgressSnapshot {
            loaded,
            total,
            percent: percent_complete(loaded, total),
            speed,
            phase: if loaded >= total {
                TransferPhase::Finalizing
            } else {
                TransferPhase::Transferring
            },
        }
    }
}

/// 计算完成百分比，loaded == total 时精确返回 100
pub fn percent_complete(loaded: u64, total: u64) -> f64 {
    if loaded >= total {
        return 100.0;
    }
    (loaded as f64 / total as f64) * 100.0
}

/// 十进制单位（1000 进制）
const DECIMAL_UNITS: [&str; 6] = ["B", "kB", "MB", "GB", "TB", "PB"];

/// 格式化字节大小（十进制单位）
///
/// 例如：999 -> "999 B"，1500 -> "1.5 kB"，16_000_000 -> "16.0 MB"
pub fn format_size(bytes: u64) -> String {
    if bytes < 1000 {
        return format!("{} B", bytes);
    }

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit < DECIMAL_UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    format!("{:.1} {}", value, DECIMAL_UNITS[unit])
}
