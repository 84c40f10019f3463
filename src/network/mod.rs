//! 网络状况监测
//!
//! - `sampler.rs`: 网络采样器（声明链路 / TCP 探测）
//! - `monitor.rs`: 定时采样、网络分级、吞吐样本环

mod monitor;
mod sampler;

pub use monitor::*;
pub use sampler::*;

use serde::{Deserialize, Serialize};

/// 吞吐样本环容量
pub const THROUGHPUT_RING_CAPACITY: usize = 20;

/// 网络分级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkTier {
    /// 弱网：带宽 < 1.5 Mbps 或 RTT > 800ms
    Constrained,
    /// 一般：带宽 < 10 Mbps 或 RTT > 300ms
    Reduced,
    /// 正常
    #[default]
    Standard,
}

/// 单个分级对应的限制，None 表示不额外限制
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierProfile {
    pub max_concurrent_files: Option<usize>,
    pub max_concurrent_chunks: Option<usize>,
    pub max_chunk_size: Option<u64>,
}

impl TierProfile {
    /// 对配置值应用分级上限（结果至少为 1）
    pub fn cap_files(&self, configured: usize) -> usize {
        cap(configured, self.max_concurrent_files)
    }

    pub fn cap_chunks(&self, configured: usize) -> usize {
        cap(configured, self.max_concurrent_chunks)
    }

    pub fn cap_chunk_size(&self, suggested: u64) -> u64 {
        match self.max_chunk_size {
            Some(limit) => suggested.min(limit).max(1),
            None => suggested.max(1),
        }
    }
}

fn cap(configured: usize, limit: Option<usize>) -> usize {
    match limit {
        Some(limit) => configured.min(limit).max(1),
        None => configured.max(1),
    }
}

impl NetworkTier {
    /// 根据带宽 (Mbps) 和 RTT (ms) 分级；没有任何数据时视为正常
    pub fn classify(bandwidth_mbps: Option<f64>, rtt_ms: Option<u64>) -> Self {
        let bw = bandwidth_mbps.filter(|b| b.is_finite() && *b >= 0.0);
        if bw.is_some_and(|b| b < 1.5) || rtt_ms.is_some_and(|r| r > 800) {
            NetworkTier::Constrained
        } else if bw.is_some_and(|b| b < 10.0) || rtt_ms.is_some_and(|r| r > 300) {
            NetworkTier::Reduced
        } else {
            NetworkTier::Standard
        }
    }

    pub fn profile(&self) -> TierProfile {
        match self {
            NetworkTier::Constrained => TierProfile {
                max_concurrent_files: Some(1),
                max_concurrent_chunks: Some(2),
                max_chunk_size: Some(5 * 1024 * 1024),
            },
            NetworkTier::Reduced => TierProfile {
                max_concurrent_files: Some(2),
                max_concurrent_chunks: Some(3),
                max_chunk_size: Some(10 * 1024 * 1024),
            },
            NetworkTier::Standard => TierProfile {
                max_concurrent_files: None,
                max_concurrent_chunks: None,
                max_chunk_size: None,
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkTier::Constrained => "constrained",
            NetworkTier::Reduced => "reduced",
            NetworkTier::Standard => "standard",
        }
    }
}

impl std::fmt::Display for NetworkTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_thresholds() {
        assert_eq!(NetworkTier::classify(None, None), NetworkTier::Standard);
        assert_eq!(NetworkTier::classify(Some(1.0), None), NetworkTier::Constrained);
        assert_eq!(NetworkTier::classify(Some(50.0), Some(900)), NetworkTier::Constrained);
        assert_eq!(NetworkTier::classify(Some(5.0), Some(50)), NetworkTier::Reduced);
        assert_eq!(NetworkTier::classify(None, Some(400)), NetworkTier::Reduced);
        assert_eq!(NetworkTier::classify(Some(100.0), Some(20)), NetworkTier::Standard);
        assert_eq!(NetworkTier::classify(Some(f64::NAN), None), NetworkTier::Standard);
    }

    #[test]
    fn test_profile_caps() {
        let constrained = NetworkTier::Constrained.profile();
        assert_eq!(constrained.cap_files(3), 1);
        assert_eq!(constrained.cap_chunks(4), 2);
        assert_eq!(constrained.cap_chunk_size(8 * 1024 * 1024), 5 * 1024 * 1024);
        assert_eq!(constrained.cap_chunk_size(1024), 1024);

        let standard = NetworkTier::Standard.profile();
        assert_eq!(standard.cap_files(3), 3);
        assert_eq!(standard.cap_chunks(0), 1);
        assert_eq!(standard.cap_chunk_size(64 * 1024 * 1024), 64 * 1024 * 1024);
    }

    #[test]
    fn test_tier_serde() {
        assert_eq!(
            serde_json::to_string(&NetworkTier::Constrained).unwrap(),
            "\"constrained\""
        );
        assert_eq!(NetworkTier::Reduced.to_string(), "reduced");
    }
}
