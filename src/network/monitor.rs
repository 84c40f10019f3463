// 网络状况监测器
//
// 按固定间隔（以及 notify_change 触发时）调用采样器，维护带宽/RTT 估计和
// 网络分级。分级变化时广播 network_change 事件，并通过 watch 通道唤醒调度器。
// 分级变化只影响之后的调度决策，不会取消正在传输的分片

use super::sampler::{NetworkSample, NetworkSampler};
use super::{NetworkTier, TierProfile, THROUGHPUT_RING_CAPACITY};
use crate::events::{EventBus, UploadEvent};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 网络指标（仅由监测器写入）
#[derive(Debug, Clone, Default)]
pub struct NetworkMetrics {
    pub bandwidth_mbps: Option<f64>,
    pub rtt_ms: Option<u64>,
    pub tier: NetworkTier,
    /// 最近的吞吐样本 (bytes/s)
    pub recent_throughput: VecDeque<f64>,
    pub last_sampled_at: Option<i64>,
}

impl NetworkMetrics {
    fn push_throughput(&mut self, bytes_per_sec: f64) {
        if self.recent_throughput.len() >= THROUGHPUT_RING_CAPACITY {
            self.recent_throughput.pop_front();
        }
        self.recent_throughput.push_back(bytes_per_sec);
    }

    fn average_throughput(&self) -> f64 {
        if self.recent_throughput.is_empty() {
            return 0.0;
        }
        self.recent_throughput.iter().sum::<f64>() / self.recent_throughput.len() as f64
    }
}

/// 网络指标快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSnapshot {
    pub tier: NetworkTier,
    pub bandwidth_mbps: Option<f64>,
    pub rtt_ms: Option<u64>,
    /// 最近吞吐样本的平均值 (bytes/s)
    pub average_throughput: f64,
    pub sample_count: usize,
    pub last_sampled_at: Option<i64>,
}

/// 网络状况监测器
pub struct NetworkMonitor {
    sampler: Arc<dyn NetworkSampler>,
    interval: Duration,
    metrics: RwLock<NetworkMetrics>,
    tier_tx: watch::Sender<NetworkTier>,
    bus: EventBus,
    change_notify: Notify,
    cancel_token: CancellationToken,
}

impl NetworkMonitor {
    pub fn new(sampler: Arc<dyn NetworkSampler>, interval: Duration, bus: EventBus) -> Self {
        let (tier_tx, _) = watch::channel(NetworkTier::Standard);
        Self {
            sampler,
            interval: interval.max(Duration::from_millis(10)),
            metrics: RwLock::new(NetworkMetrics::default()),
            tier_tx,
            bus,
            change_notify: Notify::new(),
            cancel_token: CancellationToken::new(),
        }
    }

    /// 启动采样循环
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!("网络监测已启动，采样间隔 {:?}", monitor.interval);

            loop {
                tokio::select! {
                    _ = monitor.cancel_token.cancelled() => break,
                    _ = ticker.tick() => {}
                    _ = monitor.change_notify.notified() => {
                        debug!("收到网络变化通知，立即采样");
                    }
                }
                monitor.refresh().await;
            }

            info!("网络监测已停止");
        })
    }

    /// 停止采样循环
    pub fn stop(&self) {
        self.cancel_token.cancel();
    }

    /// 外部通知网络可能发生变化（例如切换网卡），触发一次立即采样
    pub fn notify_change(&self) {
        self.change_notify.notify_one();
    }

    /// 调用采样器并应用结果；采样失败时保持原分级
    pub async fn refresh(&self) {
        match self.sampler.sample().await {
            Ok(sample) => {
                self.apply_sample(sample);
            }
            Err(e) => warn!("网络采样失败: {:#}", e),
        }
    }

    /// 应用一次采样，返回分级是否变化
    pub fn apply_sample(&self, sample: NetworkSample) -> bool {
        let new_tier = NetworkTier::classify(sample.bandwidth_mbps, sample.rtt_ms);
        let (old_tier, snapshot) = {
            let mut metrics = self.metrics.write();
            let old_tier = metrics.tier;
            metrics.bandwidth_mbps = sample.bandwidth_mbps;
            metrics.rtt_ms = sample.rtt_ms;
            metrics.tier = new_tier;
            metrics.last_sampled_at = Some(chrono::Utc::now().timestamp());
            (old_tier, Self::snapshot_of(&metrics))
        };

        if old_tier == new_tier {
            return false;
        }

        info!("网络分级变化: {} -> {}", old_tier, new_tier);
        self.tier_tx.send_replace(new_tier);
        self.bus.publish(UploadEvent::NetworkChange { metrics: snapshot });
        true
    }

    /// 记录一个吞吐样本 (bytes/s)
    pub fn record_sample(&self, bytes_per_sec: f64) {
        if !bytes_per_sec.is_finite() || bytes_per_sec < 0.0 {
            return;
        }
        self.metrics.write().push_throughput(bytes_per_sec);
    }

    pub fn tier(&self) -> NetworkTier {
        self.metrics.read().tier
    }

    pub fn profile(&self) -> TierProfile {
        self.tier().profile()
    }

    /// 订阅分级变化
    pub fn subscribe_tier(&self) -> watch::Receiver<NetworkTier> {
        self.tier_tx.subscribe()
    }

    pub fn snapshot(&self) -> NetworkSnapshot {
        Self::snapshot_of(&self.metrics.read())
    }

    fn snapshot_of(metrics: &NetworkMetrics) -> NetworkSnapshot {
        NetworkSnapshot {
            tier: metrics.tier,
            bandwidth_mbps: metrics.bandwidth_mbps,
            rtt_ms: metrics.rtt_ms,
            average_throughput: metrics.average_throughput(),
            sample_count: metrics.recent_throughput.len(),
            last_sampled_at: metrics.last_sampled_at,
        }
    }
}

impl std::fmt::Debug for NetworkMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkMonitor")
            .field("interval", &self.interval)
            .field("tier", &self.tier())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::StaticLinkSampler;

    fn monitor_with(sampler: Arc<StaticLinkSampler>, bus: EventBus) -> Arc<NetworkMonitor> {
        Arc::new(NetworkMonitor::new(sampler, Duration::from_secs(3600), bus))
    }

    #[test]
    fn test_ring_is_bounded() {
        let monitor = monitor_with(Arc::new(StaticLinkSampler::default()), EventBus::default());
        for i in 0..30 {
            monitor.record_sample(i as f64);
        }
        monitor.record_sample(-1.0);

        let snap = monitor.snapshot();
        assert_eq!(snap.sample_count, THROUGHPUT_RING_CAPACITY);
        // 保留最近 20 个样本：10..=29
        assert!((snap.average_throughput - 19.5).abs() < 1e-9);
        // 吞吐样本不影响分级
        assert_eq!(snap.tier, NetworkTier::Standard);
    }

    #[tokio::test]
    async fn test_tier_change_emits_event_once() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let sampler = Arc::new(StaticLinkSampler::new(Some(1.0), None));
        let monitor = monitor_with(sampler.clone(), bus);
        let mut tier_rx = monitor.subscribe_tier();

        monitor.refresh().await;
        assert_eq!(monitor.tier(), NetworkTier::Constrained);
        assert!(tier_rx.has_changed().unwrap());
        assert_eq!(*tier_rx.borrow_and_update(), NetworkTier::Constrained);

        match rx.try_recv().unwrap() {
            UploadEvent::NetworkChange { metrics } => {
                assert_eq!(metrics.tier, NetworkTier::Constrained);
                assert_eq!(metrics.bandwidth_mbps, Some(1.0));
            }
            other => panic!("unexpected event: {:?}", other),
        }

        // 同一分级再次采样不产生事件
        monitor.refresh().await;
        assert!(rx.try_recv().is_err());
        assert!(!tier_rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_notify_change_triggers_sample() {
        let sampler = Arc::new(StaticLinkSampler::default());
        let monitor = monitor_with(sampler.clone(), EventBus::default());
        let mut tier_rx = monitor.subscribe_tier();
        let handle = monitor.start();

        sampler.set_link(Some(5.0), None);
        monitor.notify_change();
        tokio::time::timeout(Duration::from_secs(5), tier_rx.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(monitor.tier(), NetworkTier::Reduced);

        monitor.stop();
        handle.await.unwrap();
    }
}
