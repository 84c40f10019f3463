//! 性能优化器
//!
//! 每个周期根据窗口内（距上次周期的增量）的成功率调整并发：
//! - 成功率低于下限：文件并发和分片并发各减 1（不低于 1）
//! - 成功率高于上限：各加 1（不超过上限配置）
//! - 窗口内没有结束的传输时不做调整
//!
//! 只有开启 `adaptive_optimization` 时才会修改队列配置

use crate::config::{OptimizerConfig, QueueConfig};
use crate::metrics::PerformanceMetrics;
use crate::network::TierProfile;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// 并发下限
pub const MIN_CONCURRENCY: usize = 1;

/// 单次周期的调整动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerAction {
    Decrease,
    Increase,
    Hold,
    /// 窗口内没有传输结束
    NoData,
}

/// 单次周期的结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerReport {
    pub action: OptimizerAction,
    /// 窗口成功率
    pub success_rate: Option<f64>,
    pub max_concurrent_files: usize,
    pub max_concurrent_chunks: usize,
    /// 考虑网络分级后的有效文件并发
    pub optimal_concurrency: usize,
}

/// 性能优化器
#[derive(Debug)]
pub struct PerformanceOptimizer {
    config: OptimizerConfig,
    last_succeeded: u64,
    last_failed: u64,
}

impl PerformanceOptimizer {
    pub fn new(config: OptimizerConfig) -> Self {
        Self {
            config,
            last_succeeded: 0,
            last_failed: 0,
        }
    }

    /// 执行一个优化周期
    ///
    /// `profile` 为 None 表示未开启网络调优
    pub fn tick(
        &mut self,
        metrics: &PerformanceMetrics,
        queue_config: &RwLock<QueueConfig>,
        profile: Option<&TierProfile>,
    ) -> OptimizerReport {
        let succeeded = metrics.succeeded();
        let failed = metrics.failed();
        let window_succeeded = succeeded.saturating_sub(self.last_succeeded);
        let window_failed = failed.saturating_sub(self.last_failed);
        self.last_succeeded = succeeded;
        self.last_failed = failed;

        let finished = window_succeeded + window_failed;
        let success_rate = if finished == 0 {
            None
        } else {
            Some(window_succeeded as f64 / finished as f64)
        };

        let mut config = queue_config.write();
        let action = match success_rate {
            None => OptimizerAction::NoData,
            Some(_) if !config.adaptive_optimization => OptimizerAction::Hold,
            Some(rate) if rate < self.config.low_success_rate => {
                if self.decrease(&mut config) {
                    OptimizerAction::Decrease
                } else {
                    OptimizerAction::Hold
                }
            }
            Some(rate) if rate > self.config.high_success_rate => {
                if self.increase(&mut config) {
                    OptimizerAction::Increase
                } else {
                    OptimizerAction::Hold
                }
            }
            Some(_) => OptimizerAction::Hold,
        };

        let optimal = match profile {
            Some(profile) => profile.cap_files(config.max_concurrent_files),
            None => config.max_concurrent_files.max(MIN_CONCURRENCY),
        };
        metrics.set_optimal_concurrency(optimal);

        let report = OptimizerReport {
            action,
            success_rate,
            max_concurrent_files: config.max_concurrent_files,
            max_concurrent_chunks: config.max_concurrent_chunks,
            optimal_concurrency: optimal,
        };
        drop(config);

        match action {
            OptimizerAction::Decrease | OptimizerAction::Increase => info!(
                "🔧 并发调整({:?}): 成功率={:.2}, 文件并发={}, 分片并发={}",
                action,
                success_rate.unwrap_or_default(),
                report.max_concurrent_files,
                report.max_concurrent_chunks
            ),
            _ => debug!("优化周期: {:?}, 成功率={:?}", action, success_rate),
        }
        report
    }

    fn decrease(&self, config: &mut QueueConfig) -> bool {
        let files = config.max_concurrent_files.saturating_sub(1).max(MIN_CONCURRENCY);
        let chunks = config.max_concurrent_chunks.saturating_sub(1).max(MIN_CONCURRENCY);
        let changed = files != config.max_concurrent_files || chunks != config.max_concurrent_chunks;
        config.max_concurrent_files = files;
        config.max_concurrent_chunks = chunks;
        changed
    }

    fn increase(&self, config: &mut QueueConfig) -> bool {
        let mut changed = false;
        if config.max_concurrent_files < self.config.max_files_ceiling {
            config.max_concurrent_files += 1;
            changed = true;
        }
        if config.max_concurrent_chunks < self.config.max_chunks_ceiling {
            config.max_concurrent_chunks += 1;
            changed = true;
        }
        changed
    }
}
