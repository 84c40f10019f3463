//! 上传事件类型定义
//!
//! 事件同时投递给任务级回调和全局订阅者

use crate::metrics::PerformanceSnapshot;
use crate::network::NetworkSnapshot;
use crate::remote::FileRecord;
use serde::{Deserialize, Serialize};

/// 进度信息
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressInfo {
    pub task_id: String,
    /// 进度百分比 (0.0 - 100.0)
    pub progress: f64,
    /// 上传速度 (bytes/s)
    pub speed: u64,
    /// 预计剩余时间（秒）
    pub eta: Option<u64>,
    pub bytes_uploaded: u64,
    pub total_bytes: u64,
    pub completed_chunks: usize,
    pub total_chunks: usize,
}

/// 上传事件
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum UploadEvent {
    /// 已进入等待队列
    Queued {
        task_id: String,
        session_id: String,
        file_name: String,
        total_size: u64,
        priority: i64,
    },
    /// 开始传输（每次尝试触发一次）
    Started {
        task_id: String,
        attempt: u32,
        total_size: u64,
    },
    /// 进度更新
    Progress(ProgressInfo),
    /// 上传完成
    Completed {
        task_id: String,
        record: FileRecord,
        bytes_uploaded: u64,
        total_bytes: u64,
        completed_at: i64,
    },
    /// 永久失败
    Error {
        task_id: String,
        message: String,
        retry_count: u32,
    },
    /// 已暂停
    Paused { task_id: String },
    /// 已恢复
    Resumed { task_id: String, resume_count: u32 },
    /// 已取消
    Cancelled { task_id: String },
    /// 本次尝试失败，等待重试
    Retrying {
        task_id: String,
        retry_count: u32,
        delay_ms: u64,
        message: String,
    },
    /// 队列已清空（等待队列和活跃任务都为空）
    QueueEmpty { completed_count: usize },
    /// 性能指标更新
    PerformanceUpdate { metrics: PerformanceSnapshot },
    /// 网络状况变化
    NetworkChange { metrics: NetworkSnapshot },
}

impl UploadEvent {
    /// 获取任务 ID（全局事件返回 None）
    pub fn task_id(&self) -> Option<&str> {
        match self {
            UploadEvent::Queued { task_id, .. }
            | UploadEvent::Started { task_id, .. }
            | UploadEvent::Completed { task_id, .. }
            | UploadEvent::Error { task_id, .. }
            | UploadEvent::Paused { task_id }
            | UploadEvent::Resumed { task_id, .. }
            | UploadEvent::Cancelled { task_id }
            | UploadEvent::Retrying { task_id, .. } => Some(task_id),
            UploadEvent::Progress(info) => Some(&info.task_id),
            UploadEvent::QueueEmpty { .. }
            | UploadEvent::PerformanceUpdate { .. }
            | UploadEvent::NetworkChange { .. } => None,
        }
    }

    /// 是否为任务终态事件
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UploadEvent::Completed { .. } | UploadEvent::Error { .. } | UploadEvent::Cancelled { .. }
        )
    }

    /// 获取事件类型名称
    pub fn event_type_name(&self) -> &'static str {
        match self {
            UploadEvent::Queued { .. } => "queued",
            UploadEvent::Started { .. } => "started",
            UploadEvent::Progress(_) => "progress",
            UploadEvent::Completed { .. } => "completed",
            UploadEvent::Error { .. } => "error",
            UploadEvent::Paused { .. } => "paused",
            UploadEvent::Resumed { .. } => "resumed",
            UploadEvent::Cancelled { .. } => "cancelled",
            UploadEvent::Retrying { .. } => "retrying",
            UploadEvent::QueueEmpty { .. } => "queue_empty",
            UploadEvent::PerformanceUpdate { .. } => "performance_update",
            UploadEvent::NetworkChange { .. } => "network_change",
        }
    }
}
