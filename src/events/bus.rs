//! 事件分发
//!
//! - `EventBus`：全局广播通道，任意数量的被动订阅者
//! - `TaskCallbacks`：入队时提供的任务级回调
//! - `TaskEventSink`：单个任务的事件出口，保证终态事件只发一次

use super::types::{ProgressInfo, UploadEvent};
use crate::remote::FileRecord;
use parking_lot::ReentrantMutex;
use std::cell::Cell;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// 广播通道默认容量
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// 全局事件总线
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<UploadEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// 订阅全局事件
    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.sender.subscribe()
    }

    /// 发布事件（没有订阅者时直接丢弃）
    pub fn publish(&self, event: UploadEvent) {
        if self.sender.send(event).is_err() {
            debug!("没有事件订阅者，事件已丢弃");
        }
    }

    /// 当前订阅者数量
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

type ProgressFn = Arc<dyn Fn(&ProgressInfo) + Send + Sync>;
type CompleteFn = Arc<dyn Fn(&FileRecord) + Send + Sync>;
type ErrorFn = Arc<dyn Fn(&str) + Send + Sync>;
type EventFn = Arc<dyn Fn(&UploadEvent) + Send + Sync>;

/// 任务级回调
///
/// `on_event` 接收该任务的所有事件，其余回调只接收对应类型
#[derive(Clone, Default)]
pub struct TaskCallbacks {
    on_progress: Option<ProgressFn>,
    on_complete: Option<CompleteFn>,
    on_error: Option<ErrorFn>,
    on_event: Option<EventFn>,
}

impl TaskCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_progress<F>(mut self, f: F) -> Self
    where
        F: Fn(&ProgressInfo) + Send + Sync + 'static,
    {
        self.on_progress = Some(Arc::new(f));
        self
    }

    pub fn on_complete<F>(mut self, f: F) -> Self
    where
        F: Fn(&FileRecord) + Send + Sync + 'static,
    {
        self.on_complete = Some(Arc::new(f));
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
        self
    }

    pub fn on_event<F>(mut self, f: F) -> Self
    where
        F: Fn(&UploadEvent) + Send + Sync + 'static,
    {
        self.on_event = Some(Arc::new(f));
        self
    }

    fn dispatch(&self, event: &UploadEvent) {
        match event {
            UploadEvent::Progress(info) => {
                if let Some(cb) = &self.on_progress {
                    cb(info);
                }
            }
            UploadEvent::Completed { record, .. } => {
                if let Some(cb) = &self.on_complete {
                    cb(record);
                }
            }
            UploadEvent::Error { message, .. } => {
                if let Some(cb) = &self.on_error {
                    cb(message);
                }
            }
            _ => {}
        }
        if let Some(cb) = &self.on_event {
            cb(event);
        }
    }
}

impl fmt::Debug for TaskCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskCallbacks")
            .field("on_progress", &self.on_progress.is_some())
            .field("on_complete", &self.on_complete.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_event", &self.on_event.is_some())
            .finish()
    }
}

/// 单个任务的事件出口
///
/// 跨重试共享。终态事件（completed / error / cancelled）发出后，
/// 该任务的任何后续事件都会被丢弃。回调内可以安全地调用队列管理器
/// 操作同一任务（锁可重入）
pub struct TaskEventSink {
    task_id: String,
    callbacks: TaskCallbacks,
    bus: EventBus,
    terminated: ReentrantMutex<Cell<bool>>,
}

impl TaskEventSink {
    pub fn new(task_id: String, callbacks: TaskCallbacks, bus: EventBus) -> Self {
        Self {
            task_id,
            callbacks,
            bus,
            terminated: ReentrantMutex::new(Cell::new(false)),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// 发布事件，返回是否实际发出
    pub fn emit(&self, event: UploadEvent) -> bool {
        let terminated = self.terminated.lock();
        if terminated.get() {
            debug!(
                "任务 {} 已结束，丢弃 {} 事件",
                self.task_id,
                event.event_type_name()
            );
            return false;
        }
        if event.is_terminal() {
            terminated.set(true);
        }

        // 先广播再回调：回调中重入产生的事件排在本事件之后
        self.bus.publish(event.clone());
        self.callbacks.dispatch(&event);
        true
    }

    /// 是否已发出终态事件
    pub fn is_terminated(&self) -> bool {
        self.terminated.lock().get()
    }
}

impl fmt::Debug for TaskEventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskEventSink")
            .field("task_id", &self.task_id)
            .field("terminated", &self.is_terminated())
            .finish()
    }
}
