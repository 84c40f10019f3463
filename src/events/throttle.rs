//! 进度事件节流器
//!
//! 控制分片进行中的进度事件发布频率，避免事件风暴。
//! 分片完成时的进度事件不经过节流

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// 默认节流间隔（毫秒）
pub const DEFAULT_THROTTLE_INTERVAL_MS: u64 = 200;

/// 进度事件节流器
///
/// 使用原子操作，多个分片任务可共享同一个节流器
#[derive(Debug)]
pub struct ProgressThrottler {
    /// 基准时间
    origin: Instant,
    /// 上次发布距基准的纳秒数，0 表示从未发布
    last_emit_nanos: AtomicU64,
    interval_nanos: u64,
}

impl ProgressThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            origin: Instant::now(),
            last_emit_nanos: AtomicU64::new(0),
            interval_nanos: interval.as_nanos() as u64,
        }
    }

    pub fn with_millis(interval_ms: u64) -> Self {
        Self::new(Duration::from_millis(interval_ms))
    }

    /// 距上次发布超过节流间隔时返回 true 并更新时间戳
    pub fn should_emit(&self) -> bool {
        // +1 保证首次调用时 now 总是大于 0
        let now = self.origin.elapsed().as_nanos() as u64 + 1;
        let last = self.last_emit_nanos.load(Ordering::Relaxed);

        if last != 0 && now.saturating_sub(last) < self.interval_nanos {
            return false;
        }

        // 被其他线程抢先更新时本次不发布
        self.last_emit_nanos
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    /// 强制发布，刷新时间戳
    pub fn force_emit(&self) {
        let now = self.origin.elapsed().as_nanos() as u64 + 1;
        self.last_emit_nanos.store(now, Ordering::Relaxed);
    }

    /// 重置状态（恢复上传时调用）
    pub fn reset(&self) {
        self.last_emit_nanos.store(0, Ordering::Relaxed);
    }
}

impl Default for ProgressThrottler {
    fn default() -> Self {
        Self::with_millis(DEFAULT_THROTTLE_INTERVAL_MS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_throttler_basic() {
        let throttler = ProgressThrottler::with_millis(100);

        assert!(throttler.should_emit());
        assert!(!throttler.should_emit());
    }

    #[test]
    fn test_throttler_after_interval() {
        let throttler = ProgressThrottler::with_millis(50);

        assert!(throttler.should_emit());
        thread::sleep(Duration::from_millis(60));
        assert!(throttler.should_emit());
    }

    #[test]
    fn test_force_emit_restarts_interval() {
        let throttler = ProgressThrottler::with_millis(1000);

        throttler.force_emit();
        assert!(!throttler.should_emit());
    }

    #[test]
    fn test_reset() {
        let throttler = ProgressThrottler::with_millis(1000);

        assert!(throttler.should_emit());
        assert!(!throttler.should_emit());

        throttler.reset();
        assert!(throttler.should_emit());
    }
}
