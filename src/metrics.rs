//! 性能指标
//!
//! 计数器是原子量；吞吐平均只统计最近 [`THROUGHPUT_WINDOW`] 个分片样本

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// 吞吐滚动窗口大小（分片样本数）
pub const THROUGHPUT_WINDOW: usize = 50;

/// 全局性能指标
#[derive(Debug, Default)]
pub struct PerformanceMetrics {
    total_transfers: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    total_bytes: AtomicU64,
    /// 最近的吞吐样本 (bytes/s)
    throughput_window: Mutex<VecDeque<f64>>,
    active_concurrency: AtomicUsize,
    optimal_concurrency: AtomicUsize,
}

/// 性能指标快照
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSnapshot {
    pub total_transfers: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub success_rate: f64,
    pub average_throughput: f64,
    pub total_bytes: u64,
    pub active_concurrency: usize,
    pub optimal_concurrency: usize,
}

impl PerformanceMetrics {
    pub fn new(optimal_concurrency: usize) -> Self {
        let metrics = Self::default();
        metrics
            .optimal_concurrency
            .store(optimal_concurrency, Ordering::SeqCst);
        metrics
    }

    /// 记录一次成功的传输尝试
    pub fn record_success(&self, bytes: u64) {
        self.total_transfers.fetch_add(1, Ordering::SeqCst);
        self.succeeded.fetch_add(1, Ordering::SeqCst);
        self.total_bytes.fetch_add(bytes, Ordering::SeqCst);
    }

    /// 记录一次失败的传输尝试（每次重试前的失败都会计入）
    pub fn record_failure(&self) {
        self.total_transfers.fetch_add(1, Ordering::SeqCst);
        self.failed.fetch_add(1, Ordering::SeqCst);
    }

    /// 记录一个吞吐样本，窗口满时丢弃最旧的样本
    pub fn record_throughput(&self, bytes_per_sec: f64) {
        if !bytes_per_sec.is_finite() || bytes_per_sec < 0.0 {
            return;
        }
        let mut window = self.throughput_window.lock();
        if window.len() >= THROUGHPUT_WINDOW {
            window.pop_front();
        }
        window.push_back(bytes_per_sec);
    }

    /// 窗口内的平均吞吐，无样本时为 0
    pub fn average_throughput(&self) -> f64 {
        let window = self.throughput_window.lock();
        if window.is_empty() {
            0.0
        } else {
            window.iter().sum::<f64>() / window.len() as f64
        }
    }

    pub fn set_active_concurrency(&self, active: usize) {
        self.active_concurrency.store(active, Ordering::SeqCst);
    }

    pub fn set_optimal_concurrency(&self, optimal: usize) {
        self.optimal_concurrency.store(optimal, Ordering::SeqCst);
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::SeqCst)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> PerformanceSnapshot {
        let succeeded = self.succeeded();
        let failed = self.failed();
        let finished = succeeded + failed;
        PerformanceSnapshot {
            total_transfers: self.total_transfers.load(Ordering::SeqCst),
            succeeded,
            failed,
            success_rate: if finished == 0 {
                1.0
            } else {
                succeeded as f64 / finished as f64
            },
            average_throughput: self.average_throughput(),
            total_bytes: self.total_bytes.load(Ordering::SeqCst),
            active_concurrency: self.active_concurrency.load(Ordering::SeqCst),
            optimal_concurrency: self.optimal_concurrency.load(Ordering::SeqCst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_rate() {
        let metrics = PerformanceMetrics::new(3);
        metrics.record_success(100);
        metrics.record_success(50);
        metrics.record_failure();

        let snap = metrics.snapshot();
        assert_eq!(snap.total_transfers, 3);
        assert_eq!(snap.succeeded, 2);
        assert_eq!(snap.failed, 1);
        assert_eq!(snap.total_bytes, 150);
        assert!((snap.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(snap.optimal_concurrency, 3);
    }

    #[test]
    fn test_empty_rate_is_one() {
        assert_eq!(PerformanceMetrics::default().snapshot().success_rate, 1.0);
    }

    #[test]
    fn test_rolling_average() {
        let metrics = PerformanceMetrics::default();
        metrics.record_throughput(100.0);
        metrics.record_throughput(300.0);
        metrics.record_throughput(f64::NAN);
        assert!((metrics.snapshot().average_throughput - 200.0).abs() < 1e-9);
    }

    #[test]
    fn test_old_throughput_samples_drop_out() {
        let metrics = PerformanceMetrics::default();
        for _ in 0..THROUGHPUT_WINDOW {
            metrics.record_throughput(1_000_000.0);
        }
        assert!((metrics.average_throughput() - 1_000_000.0).abs() < 1e-6);

        // 链路变慢后，窗口内只剩新样本
        for _ in 0..THROUGHPUT_WINDOW {
            metrics.record_throughput(10.0);
        }
        assert!((metrics.snapshot().average_throughput - 10.0).abs() < 1e-9);

        metrics.record_throughput(1010.0);
        let expected = (10.0 * (THROUGHPUT_WINDOW - 1) as f64 + 1010.0) / THROUGHPUT_WINDOW as f64;
        assert!((metrics.average_throughput() - expected).abs() < 1e-9);
    }

    #[test]
    fn test_average_without_samples_is_zero() {
        assert_eq!(PerformanceMetrics::default().average_throughput(), 0.0);
    }
}
