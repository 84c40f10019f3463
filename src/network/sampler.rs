// 网络采样器

use crate::config::NetworkConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::debug;

/// 一次网络采样结果
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NetworkSample {
    /// 估计带宽 (Mbps)
    pub bandwidth_mbps: Option<f64>,
    /// 往返时延 (ms)
    pub rtt_ms: Option<u64>,
}

/// 网络采样器
#[async_trait]
pub trait NetworkSampler: Send + Sync {
    async fn sample(&self) -> Result<NetworkSample>;
}

/// 声明式链路采样器
///
/// 直接返回配置中声明的链路参数，运行时可通过 `set_link` 修改
#[derive(Debug, Default)]
pub struct StaticLinkSampler {
    link: RwLock<NetworkSample>,
}

impl StaticLinkSampler {
    pub fn new(bandwidth_mbps: Option<f64>, rtt_ms: Option<u64>) -> Self {
        Self {
            link: RwLock::new(NetworkSample {
                bandwidth_mbps,
                rtt_ms,
            }),
        }
    }

    pub fn set_link(&self, bandwidth_mbps: Option<f64>, rtt_ms: Option<u64>) {
        *self.link.write() = NetworkSample {
            bandwidth_mbps,
            rtt_ms,
        };
    }
}

#[async_trait]
impl NetworkSampler for StaticLinkSampler {
    async fn sample(&self) -> Result<NetworkSample> {
        Ok(*self.link.read())
    }
}

/// TCP 连接探测采样器
///
/// 以建立 TCP 连接的耗时作为 RTT 估计；连接超时按超时时长计
#[derive(Debug, Clone)]
pub struct TcpProbeSampler {
    addr: String,
    timeout: Duration,
}

impl TcpProbeSampler {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
        }
    }
}

#[async_trait]
impl NetworkSampler for TcpProbeSampler {
    async fn sample(&self) -> Result<NetworkSample> {
        let start = Instant::now();
        let rtt = match tokio::time::timeout(self.timeout, TcpStream::connect(&self.addr)).await {
            Ok(stream) => {
                stream.with_context(|| format!("探测连接失败: {}", self.addr))?;
                start.elapsed()
            }
            Err(_) => self.timeout,
        };
        debug!("探测 {} RTT: {}ms", self.addr, rtt.as_millis());
        Ok(NetworkSample {
            bandwidth_mbps: None,
            rtt_ms: Some(rtt.as_millis() as u64),
        })
    }
}

/// 根据配置选择采样器：配置了探测地址时使用 TCP 探测，否则使用声明链路
pub fn sampler_from_config(config: &NetworkConfig) -> Arc<dyn NetworkSampler> {
    match &config.probe_addr {
        Some(addr) => Arc::new(TcpProbeSampler::new(
            addr.clone(),
            Duration::from_millis(config.probe_timeout_ms.max(1)),
        )),
        None => Arc::new(StaticLinkSampler::new(
            config.declared_bandwidth_mbps,
            config.declared_rtt_ms,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_sampler() {
        let sampler = StaticLinkSampler::new(Some(5.0), None);
        assert_eq!(sampler.sample().await.unwrap().bandwidth_mbps, Some(5.0));

        sampler.set_link(None, Some(900));
        let sample = sampler.sample().await.unwrap();
        assert_eq!(sample.bandwidth_mbps, None);
        assert_eq!(sample.rtt_ms, Some(900));
    }

    #[tokio::test]
    async fn test_tcp_probe_local_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let accept = tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let sampler = TcpProbeSampler::new(addr, Duration::from_secs(2));
        let sample = sampler.sample().await.unwrap();
        assert!(sample.rtt_ms.is_some());
        assert!(sample.bandwidth_mbps.is_none());
        accept.await.unwrap();
    }

    #[test]
    fn test_sampler_from_config() {
        let config = NetworkConfig {
            declared_rtt_ms: Some(10),
            ..Default::default()
        };
        // 仅验证可以构造
        let _ = sampler_from_config(&config);
    }
}
