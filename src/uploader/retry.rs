// 重试与退避
//
// 延迟 = 基础延迟 × 2^(retry_count - 1)，retry_count 为本次重试递增后的次数：
// 第 1 次重试等待 1×基础延迟，第 2 次 2×，第 3 次 4×

use crate::config::QueueConfig;
use crate::error::UploadError;
use std::time::Duration;

/// 单次重试延迟上限
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(600);

/// 重试决策
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// 等待 `delay` 后以 `retry_count` 重新入队
    Retry { retry_count: u32, delay: Duration },
    /// 不再重试
    GiveUp,
}

/// 重试控制器
#[derive(Debug, Clone, Copy)]
pub struct RetryController {
    max_retry_attempts: u32,
    base_delay: Duration,
}

impl RetryController {
    pub fn new(max_retry_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_retry_attempts,
            base_delay,
        }
    }

    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(config.max_retry_attempts, config.base_retry_delay())
    }

    /// 根据已重试次数和错误类型决定是否重试
    pub fn should_retry(&self, retry_count: u32, error: &UploadError) -> RetryDecision {
        if !error.is_retriable() || retry_count >= self.max_retry_attempts {
            return RetryDecision::GiveUp;
        }
        let retry_count = retry_count + 1;
        RetryDecision::Retry {
            retry_count,
            delay: self.delay_for(retry_count),
        }
    }

    /// 第 `retry_count` 次重试的等待时间（retry_count 从 1 开始）
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1);
        let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(MAX_RETRY_DELAY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport_error() -> UploadError {
        UploadError::Transport {
            part_number: 2,
            message: "connection reset".to_string(),
        }
    }

    #[test]
    fn test_exponential_delays() {
        let controller = RetryController::new(3, Duration::from_millis(1000));
        let mut delays = Vec::new();
        let mut count = 0;
        while let RetryDecision::Retry { retry_count, delay } =
            controller.should_retry(count, &transport_error())
        {
            assert_eq!(retry_count, count + 1);
            delays.push(delay.as_millis());
            count = retry_count;
        }
        assert_eq!(delays, vec![1000, 2000, 4000]);
        assert_eq!(count, 3);
    }

    #[test]
    fn test_non_retriable_errors() {
        let controller = RetryController::new(3, Duration::from_millis(10));
        assert_eq!(
            controller.should_retry(0, &UploadError::Authorization("denied".to_string())),
            RetryDecision::GiveUp
        );
        assert_eq!(
            controller.should_retry(0, &UploadError::Source("io".to_string())),
            RetryDecision::GiveUp
        );
        assert!(matches!(
            controller.should_retry(0, &UploadError::Finalize("busy".to_string())),
            RetryDecision::Retry { retry_count: 1, .. }
        ));
    }

    #[test]
    fn test_zero_attempts_never_retries() {
        let controller = RetryController::new(0, Duration::from_millis(10));
        assert_eq!(
            controller.should_retry(0, &transport_error()),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn test_delay_is_capped() {
        let controller = RetryController::new(100, Duration::from_secs(1));
        assert_eq!(controller.delay_for(64), MAX_RETRY_DELAY);
        assert_eq!(controller.delay_for(0), Duration::from_secs(1));
    }

    #[test]
    fn test_from_config() {
        let config = QueueConfig {
            max_retry_attempts: 1,
            base_retry_delay_ms: 50,
            ..Default::default()
        };
        let controller = RetryController::from_config(&config);
        assert_eq!(
            controller.should_retry(0, &transport_error()),
            RetryDecision::Retry {
                retry_count: 1,
                delay: Duration::from_millis(50)
            }
        );
        assert_eq!(
            controller.should_retry(1, &transport_error()),
            RetryDecision::GiveUp
        );
    }
}
