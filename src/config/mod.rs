// 配置管理模块

use crate::error::UploadError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 上传队列配置
    #[serde(default)]
    pub queue: QueueConfig,
    /// 网络监控配置
    #[serde(default)]
    pub network: NetworkConfig,
    /// 性能优化器配置
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    /// 本地对象存储配置
    #[serde(default)]
    pub storage: StorageConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 50MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    50 * 1024 * 1024
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

/// 队列优先级模式
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PriorityMode {
    /// 按入队顺序
    #[default]
    Fifo,
    /// 小文件优先
    SmallestFirst,
    /// 大文件优先
    LargestFirst,
}

impl PriorityMode {
    /// 根据文件大小计算默认优先级（数值越小越先出队）
    pub fn priority_for(&self, file_size: u64) -> i64 {
        let size = i64::try_from(file_size).unwrap_or(i64::MAX);
        match self {
            PriorityMode::Fifo => 0,
            PriorityMode::SmallestFirst => size,
            PriorityMode::LargestFirst => -size,
        }
    }
}

/// 上传队列配置（运行时可调整）
///
/// 由性能优化器和调用方显式修改，调度器和传输引擎在每次决策时读取
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueConfig {
    /// 最大同时上传文件数
    #[serde(default = "default_max_concurrent_files")]
    pub max_concurrent_files: usize,
    /// 单文件最大并发分片数
    #[serde(default = "default_max_concurrent_chunks")]
    pub max_concurrent_chunks: usize,
    /// 最大重试次数
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    /// 重试基础延迟（毫秒）
    #[serde(default = "default_base_retry_delay_ms")]
    pub base_retry_delay_ms: u64,
    /// 优先级模式
    #[serde(default)]
    pub priority_mode: PriorityMode,
    /// 是否启用自适应优化
    #[serde(default = "default_true")]
    pub adaptive_optimization: bool,
    /// 是否根据网络状况调整并发和分片大小
    #[serde(default = "default_true")]
    pub network_tuning: bool,
}

fn default_max_concurrent_files() -> usize {
    3
}

fn default_max_concurrent_chunks() -> usize {
    4
}

fn default_max_retry_attempts() -> u32 {
    3
}

fn default_base_retry_delay_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_files: default_max_concurrent_files(),
            max_concurrent_chunks: default_max_concurrent_chunks(),
            max_retry_attempts: default_max_retry_attempts(),
            base_retry_delay_ms: default_base_retry_delay_ms(),
            priority_mode: PriorityMode::default(),
            adaptive_optimization: true,
            network_tuning: true,
        }
    }
}

impl QueueConfig {
    /// 重试基础延迟
    pub fn base_retry_delay(&self) -> Duration {
        Duration::from_millis(self.base_retry_delay_ms)
    }

    /// 校验配置
    pub fn validate(&self) -> std::result::Result<(), UploadError> {
        if self.max_concurrent_files == 0 {
            return Err(UploadError::InvalidConfig(
                "max_concurrent_files 必须大于 0".to_string(),
            ));
        }
        if self.max_concurrent_chunks == 0 {
            return Err(UploadError::InvalidConfig(
                "max_concurrent_chunks 必须大于 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// 网络监控配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// 采样间隔（秒）
    #[serde(default = "default_sample_interval_secs")]
    pub sample_interval_secs: u64,
    /// RTT 探测地址（host:port），为空时不做 TCP 探测
    #[serde(default)]
    pub probe_addr: Option<String>,
    /// 探测超时（毫秒）
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// 声明的链路带宽（Mbps），用于无法探测的环境
    #[serde(default)]
    pub declared_bandwidth_mbps: Option<f64>,
    /// 声明的链路 RTT（毫秒）
    #[serde(default)]
    pub declared_rtt_ms: Option<u64>,
}

fn default_sample_interval_secs() -> u64 {
    30
}

fn default_probe_timeout_ms() -> u64 {
    3000
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            sample_interval_secs: default_sample_interval_secs(),
            probe_addr: None,
            probe_timeout_ms: default_probe_timeout_ms(),
            declared_bandwidth_mbps: None,
            declared_rtt_ms: None,
        }
    }
}

/// 性能优化器配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OptimizerConfig {
    /// 优化周期（秒）
    #[serde(default = "default_optimizer_interval_secs")]
    pub interval_secs: u64,
    /// 成功率下限，低于此值降低并发
    #[serde(default = "default_low_success_rate")]
    pub low_success_rate: f64,
    /// 成功率上限，高于此值提高并发
    #[serde(default = "default_high_success_rate")]
    pub high_success_rate: f64,
    /// 最大同时上传文件数上限
    #[serde(default = "default_max_files_ceiling")]
    pub max_files_ceiling: usize,
    /// 单文件并发分片数上限
    #[serde(default = "default_max_chunks_ceiling")]
    pub max_chunks_ceiling: usize,
}

fn default_optimizer_interval_secs() -> u64 {
    10
}

fn default_low_success_rate() -> f64 {
    0.80
}

fn default_high_success_rate() -> f64 {
    0.95
}

fn default_max_files_ceiling() -> usize {
    6
}

fn default_max_chunks_ceiling() -> usize {
    8
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_optimizer_interval_secs(),
            low_success_rate: default_low_success_rate(),
            high_success_rate: default_high_success_rate(),
            max_files_ceiling: default_max_files_ceiling(),
            max_chunks_ceiling: default_max_chunks_ceiling(),
        }
    }
}

impl OptimizerConfig {
    /// 优化周期
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

/// 本地对象存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// 存储根目录
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
    /// 建议分片大小 (MB)
    #[serde(default = "default_suggested_chunk_size_mb")]
    pub suggested_chunk_size_mb: u64,
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("uploads")
}

fn default_suggested_chunk_size_mb() -> u64 {
    8
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
            suggested_chunk_size_mb: default_suggested_chunk_size_mb(),
        }
    }
}

impl StorageConfig {
    /// 建议分片大小（字节）
    pub fn suggested_chunk_size(&self) -> u64 {
        self.suggested_chunk_size_mb.max(1) * 1024 * 1024
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;

        config
            .queue
            .validate()
            .context("配置文件中的队列配置验证失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        self.queue.validate().context("保存配置失败：队列配置非法")?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create config directory")?;
            }
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {}", path);
        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                Self::default()
            }
        }
    }
}
