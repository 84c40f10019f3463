// Upload Queue Rust Library
// 自适应并发上传队列核心库

// 配置管理模块
pub mod config;

// 错误类型
pub mod error;

// 事件模块（广播、任务回调、进度节流）
pub mod events;

// 日志系统
pub mod logging;

// 性能指标
pub mod metrics;

// 网络状况监测
pub mod network;

// 🔥 自适应并发优化
pub mod optimizer;

// 远端协作方接口（授权 / 分片传输 / 合并）
pub mod remote;

// 上传引擎模块
pub mod uploader;

// 导出常用类型
pub use config::{AppConfig, PriorityMode, QueueConfig};
pub use error::UploadError;
pub use events::{TaskCallbacks, UploadEvent};
pub use metrics::PerformanceSnapshot;
pub use network::{NetworkSnapshot, NetworkTier};
pub use remote::{LocalObjectStore, RemoteServices};
pub use uploader::{
    LocalFileSource, MemorySource, QueueStatus, TaskSnapshot, UploadQueueManager, UploadSource,
    UploadTaskStatus,
};
