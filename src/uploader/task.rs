// 上传任务定义
//
// - QueuedTask：等待队列中的任务，由等待队列独占
// - ActiveTransfer：正在传输的任务，由管理器的活跃集合持有，引擎共享
// - TaskSnapshot / TransferSnapshot：对外只读快照

use crate::error::UploadError;
use crate::events::TaskEventSink;
use crate::uploader::source::UploadSource;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// 上传任务状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UploadTaskStatus {
    /// 等待调度
    Queued,
    /// 等待重试延迟
    Retrying,
    /// 申请上传授权中
    Initializing,
    /// 上传中
    Uploading,
    /// 已暂停
    Paused,
    /// 合并分片中
    Completing,
    /// 已完成
    Completed,
    /// 失败
    Error,
    /// 已取消
    Cancelled,
}

impl UploadTaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UploadTaskStatus::Completed | UploadTaskStatus::Error | UploadTaskStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UploadTaskStatus::Queued => "queued",
            UploadTaskStatus::Retrying => "retrying",
            UploadTaskStatus::Initializing => "initializing",
            UploadTaskStatus::Uploading => "uploading",
            UploadTaskStatus::Paused => "paused",
            UploadTaskStatus::Completing => "completing",
            UploadTaskStatus::Completed => "completed",
            UploadTaskStatus::Error => "error",
            UploadTaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for UploadTaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 等待队列中的任务
#[derive(Clone)]
pub struct QueuedTask {
    pub id: String,
    pub source: Arc<dyn UploadSource>,
    pub session_id: String,
    /// 优先级，越小越先调度
    pub priority: i64,
    /// 入队时间 (Unix timestamp)
    pub enqueued_at: i64,
    pub retry_count: u32,
    /// 事件出口（包含任务级回调），跨重试共享
    pub sink: Arc<TaskEventSink>,
}

impl QueuedTask {
    pub fn new(
        source: Arc<dyn UploadSource>,
        session_id: String,
        priority: i64,
        sink: Arc<TaskEventSink>,
    ) -> Self {
        Self {
            id: sink.task_id().to_string(),
            source,
            session_id,
            priority,
            enqueued_at: chrono::Utc::now().timestamp(),
            retry_count: 0,
            sink,
        }
    }

    pub fn snapshot(&self, status: UploadTaskStatus) -> TaskSnapshot {
        TaskSnapshot {
            task_id: self.id.clone(),
            session_id: self.session_id.clone(),
            file_name: self.source.name().to_string(),
            total_size: self.source.size(),
            priority: self.priority,
            status,
            retry_count: self.retry_count,
            enqueued_at: self.enqueued_at,
            error: None,
            transfer: None,
        }
    }
}

impl fmt::Debug for QueuedTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedTask")
            .field("id", &self.id)
            .field("file_name", &self.source.name())
            .field("size", &self.source.size())
            .field("priority", &self.priority)
            .field("retry_count", &self.retry_count)
            .finish()
    }
}

/// 传输过程中会变化的字段
#[derive(Debug)]
struct TransferState {
    status: UploadTaskStatus,
    upload_handle: Option<String>,
    chunk_size: u64,
    total_chunks: usize,
    completed_chunks: usize,
    cursor: usize,
    bytes_uploaded: u64,
    speed: u64,
    started_at: i64,
    last_progress_at: Option<i64>,
    resume_count: u32,
    round_token: Option<CancellationToken>,
}

/// 正在传输的任务
pub struct ActiveTransfer {
    pub task: QueuedTask,
    /// 整个传输的取消令牌
    pub cancel_token: CancellationToken,
    state: Mutex<TransferState>,
    resume_notify: Notify,
}

impl ActiveTransfer {
    pub fn new(task: QueuedTask, cancel_token: CancellationToken) -> Self {
        Self {
            task,
            cancel_token,
            state: Mutex::new(TransferState {
                status: UploadTaskStatus::Initializing,
                upload_handle: None,
                chunk_size: 0,
                total_chunks: 0,
                completed_chunks: 0,
                cursor: 0,
                bytes_uploaded: 0,
                speed: 0,
                started_at: chrono::Utc::now().timestamp(),
                last_progress_at: None,
                resume_count: 0,
                round_token: None,
            }),
            resume_notify: Notify::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.task.id
    }

    pub fn total_size(&self) -> u64 {
        self.task.source.size()
    }

    pub fn status(&self) -> UploadTaskStatus {
        self.state.lock().status
    }

    pub fn set_status(&self, status: UploadTaskStatus) {
        self.state.lock().status = status;
    }

    /// 进入终态；已处于终态时不覆盖并返回 false
    ///
    /// 取消与合并完成并发时只有先到的一方生效
    pub fn finish(&self, status: UploadTaskStatus) -> bool {
        let mut state = self.state.lock();
        if state.status.is_terminal() {
            return false;
        }
        state.status = status;
        true
    }

    pub fn upload_handle(&self) -> Option<String> {
        self.state.lock().upload_handle.clone()
    }

    /// 授权成功后记录上传句柄和分片信息，进入上传状态
    ///
    /// 传输已取消时返回 false
    pub fn begin_upload(&self, upload_handle: String, chunk_size: u64, total_chunks: usize) -> bool {
        let mut state = self.state.lock();
        state.upload_handle = Some(upload_handle);
        state.chunk_size = chunk_size;
        state.total_chunks = total_chunks;
        if state.status.is_terminal() || self.cancel_token.is_cancelled() {
            return false;
        }
        state.status = UploadTaskStatus::Uploading;
        true
    }

    /// 所有分片完成后进入合并状态；处于暂停时返回 false
    pub fn begin_completing(&self) -> bool {
        let mut state = self.state.lock();
        if state.status != UploadTaskStatus::Uploading {
            return false;
        }
        state.status = UploadTaskStatus::Completing;
        true
    }

    /// 创建新一轮上传的令牌（传输令牌的子令牌）
    ///
    /// 已处于暂停状态时返回的令牌立即失效
    pub fn new_round_token(&self) -> CancellationToken {
        let token = self.cancel_token.child_token();
        let mut state = self.state.lock();
        if state.status == UploadTaskStatus::Paused {
            token.cancel();
        } else {
            state.round_token = Some(token.clone());
        }
        token
    }

    /// 暂停：取消本轮令牌，保留已完成分片
    pub fn pause(&self) -> Result<(), UploadError> {
        let mut state = self.state.lock();
        if state.status != UploadTaskStatus::Uploading {
            return Err(self.invalid_state(state.status, "暂停"));
        }
        state.status = UploadTaskStatus::Paused;
        if let Some(token) = state.round_token.take() {
            token.cancel();
        }
        Ok(())
    }

    /// 恢复：返回累计恢复次数
    pub fn resume(&self) -> Result<u32, UploadError> {
        let count = {
            let mut state = self.state.lock();
            if state.status != UploadTaskStatus::Paused {
                return Err(self.invalid_state(state.status, "恢复"));
            }
            state.status = UploadTaskStatus::Uploading;
            state.resume_count += 1;
            state.resume_count
        };
        self.resume_notify.notify_one();
        Ok(count)
    }

    /// 等待暂停结束；传输被取消时返回 false
    pub async fn wait_while_paused(&self) -> bool {
        loop {
            if self.cancel_token.is_cancelled() {
                return false;
            }
            if self.status() != UploadTaskStatus::Paused {
                return true;
            }
            tokio::select! {
                _ = self.resume_notify.notified() => {}
                _ = self.cancel_token.cancelled() => return false,
            }
        }
    }

    /// 更新进度字段
    pub fn record_progress(
        &self,
        bytes_uploaded: u64,
        completed_chunks: usize,
        cursor: usize,
        speed: u64,
    ) {
        let mut state = self.state.lock();
        state.bytes_uploaded = bytes_uploaded.min(self.task.source.size());
        state.completed_chunks = completed_chunks.min(state.total_chunks);
        state.cursor = cursor;
        state.speed = speed;
        state.last_progress_at = Some(chrono::Utc::now().timestamp_millis());
    }

    fn invalid_state(&self, status: UploadTaskStatus, action: &'static str) -> UploadError {
        UploadError::InvalidState {
            task_id: self.task.id.clone(),
            status: status.to_string(),
            action,
        }
    }

    pub fn snapshot(&self) -> TransferSnapshot {
        let state = self.state.lock();
        TransferSnapshot {
            task_id: self.task.id.clone(),
            session_id: self.task.session_id.clone(),
            file_name: self.task.source.name().to_string(),
            status: state.status,
            total_size: self.task.source.size(),
            bytes_uploaded: state.bytes_uploaded,
            chunk_size: state.chunk_size,
            total_chunks: state.total_chunks,
            completed_chunks: state.completed_chunks,
            cursor: state.cursor,
            speed: state.speed,
            retry_count: self.task.retry_count,
            resume_count: state.resume_count,
            started_at: state.started_at,
            last_progress_at: state.last_progress_at,
        }
    }

    pub fn task_snapshot(&self) -> TaskSnapshot {
        let transfer = self.snapshot();
        let mut snapshot = self.task.snapshot(transfer.status);
        snapshot.transfer = Some(transfer);
        snapshot
    }
}

impl fmt::Debug for ActiveTransfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveTransfer")
            .field("task", &self.task)
            .field("status", &self.status())
            .finish()
    }
}

/// 传输快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferSnapshot {
    pub task_id: String,
    pub session_id: String,
    pub file_name: String,
    pub status: UploadTaskStatus,
    pub total_size: u64,
    pub bytes_uploaded: u64,
    pub chunk_size: u64,
    pub total_chunks: usize,
    pub completed_chunks: usize,
    /// 第一个未完成分片的索引
    pub cursor: usize,
    /// 上传速度 (bytes/s)
    pub speed: u64,
    pub retry_count: u32,
    pub resume_count: u32,
    /// 本次尝试开始时间 (Unix timestamp)
    pub started_at: i64,
    /// 最近一次进度时间 (Unix timestamp, 毫秒)，调用方据此判断是否停滞
    pub last_progress_at: Option<i64>,
}

impl TransferSnapshot {
    /// 进度百分比
    pub fn progress(&self) -> f64 {
        if self.total_size == 0 {
            return 0.0;
        }
        (self.bytes_uploaded as f64 / self.total_size as f64) * 100.0
    }

    /// 估算剩余时间 (秒)
    pub fn eta(&self) -> Option<u64> {
        if self.speed == 0 || self.bytes_uploaded >= self.total_size {
            return None;
        }
        Some((self.total_size - self.bytes_uploaded) / self.speed)
    }
}

/// 任务快照（任意阶段）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub task_id: String,
    pub session_id: String,
    pub file_name: String,
    pub total_size: u64,
    pub priority: i64,
    pub status: UploadTaskStatus,
    pub retry_count: u32,
    pub enqueued_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer: Option<TransferSnapshot>,
}
