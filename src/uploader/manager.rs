// 上传队列管理器
//
// 负责：
// - 等待队列（按优先级出队）与活跃传输集合
// - 调度：单个调度任务串行执行调度和优化周期，由 Notify / 优化定时器 / 网络分级变化唤醒
// - 失败重试：按重试策略延迟后插回队首
// - 取消/暂停/恢复
// - 队列清空通知：等待队列、活跃集合、待重试集合都为空时触发一次
//
// 锁顺序：队列状态锁 -> 传输状态锁。持有队列状态锁时不发送任务事件

use crate::config::{AppConfig, QueueConfig};
use crate::error::UploadError;
use crate::events::{
    EventBus, TaskCallbacks, TaskEventSink, UploadEvent, DEFAULT_EVENT_CAPACITY,
    DEFAULT_THROTTLE_INTERVAL_MS,
};
use crate::metrics::{PerformanceMetrics, PerformanceSnapshot};
use crate::network::{sampler_from_config, NetworkMonitor, NetworkSampler, NetworkSnapshot, TierProfile};
use crate::optimizer::PerformanceOptimizer;
use crate::remote::RemoteServices;
use crate::uploader::backlog::Backlog;
use crate::uploader::engine::{TransferOutcome, UploadEngine};
use crate::uploader::retry::{RetryController, RetryDecision};
use crate::uploader::source::UploadSource;
use crate::uploader::task::{
    ActiveTransfer, QueuedTask, TaskSnapshot, TransferSnapshot, UploadTaskStatus,
};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// 默认保留的已结束任务快照数量
pub const DEFAULT_FINISHED_RETENTION: usize = 1000;

/// 队列状态快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStatus {
    /// 等待中的任务数
    pub queued: usize,
    /// 正在传输的任务数
    pub active: usize,
    /// 等待重试延迟的任务数
    pub pending_retries: usize,
    /// 累计成功完成的任务数
    pub completed_count: usize,
    /// 仍可查询的已结束任务快照数
    pub finished: usize,
    /// 考虑网络分级后的有效文件并发
    pub effective_max_files: usize,
    pub config: QueueConfig,
    pub network: NetworkSnapshot,
    pub performance: PerformanceSnapshot,
}

/// 等待重试延迟的任务
struct PendingRetry {
    task: QueuedTask,
    token: CancellationToken,
}

#[derive(Default)]
struct QueueState {
    backlog: Backlog,
    active: HashMap<String, Arc<ActiveTransfer>>,
    pending_retries: HashMap<String, PendingRetry>,
    /// 当前空闲期是否已发出 queue_empty
    idle_notified: bool,
    completed_count: usize,
}

impl QueueState {
    fn is_idle(&self) -> bool {
        self.backlog.is_empty() && self.active.is_empty() && self.pending_retries.is_empty()
    }
}

struct ManagerInner {
    services: RemoteServices,
    config: Arc<RwLock<QueueConfig>>,
    monitor: Arc<NetworkMonitor>,
    metrics: Arc<PerformanceMetrics>,
    optimizer: Mutex<PerformanceOptimizer>,
    optimizer_interval: Duration,
    progress_interval: Duration,
    bus: EventBus,
    state: Mutex<QueueState>,
    /// 已结束任务（完成/失败/取消）的最终快照
    finished: DashMap<String, TaskSnapshot>,
    /// 快照写入顺序，超过保留数量时从最旧的开始淘汰
    finished_order: Mutex<VecDeque<String>>,
    finished_retention: usize,
    schedule_notify: Notify,
    shutdown_token: CancellationToken,
    engine_handles: Mutex<Vec<JoinHandle<()>>>,
}

/// 上传队列管理器
pub struct UploadQueueManager {
    inner: Arc<ManagerInner>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

/// 管理器构建器
pub struct UploadQueueManagerBuilder {
    services: RemoteServices,
    config: AppConfig,
    sampler: Option<Arc<dyn NetworkSampler>>,
    optimizer_interval: Option<Duration>,
    sample_interval: Option<Duration>,
    progress_interval: Duration,
    event_capacity: usize,
    finished_retention: usize,
}

impl UploadQueueManagerBuilder {
    pub fn config(mut self, config: AppConfig) -> Self {
        self.config = config;
        self
    }

    pub fn queue_config(mut self, queue: QueueConfig) -> Self {
        self.config.queue = queue;
        self
    }

    /// 使用自定义网络采样器（默认根据配置选择）
    pub fn sampler(mut self, sampler: Arc<dyn NetworkSampler>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    /// 覆盖优化周期（默认取 `[optimizer] interval_secs`）
    pub fn optimizer_interval(mut self, interval: Duration) -> Self {
        self.optimizer_interval = Some(interval);
        self
    }

    /// 覆盖网络采样间隔（默认取 `[network] sample_interval_secs`）
    pub fn sample_interval(mut self, interval: Duration) -> Self {
        self.sample_interval = Some(interval);
        self
    }

    pub fn progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// 已结束任务快照的保留数量（至少 1）
    pub fn finished_retention(mut self, retention: usize) -> Self {
        self.finished_retention = retention.max(1);
        self
    }

    /// 构建并启动调度任务和网络监测（需要在 tokio 运行时内调用）
    pub fn build(self) -> Result<UploadQueueManager, UploadError> {
        self.config.queue.validate()?;

        let bus = EventBus::new(self.event_capacity);
        let sampler = self
            .sampler
            .unwrap_or_else(|| sampler_from_config(&self.config.network));
        let sample_interval = self
            .sample_interval
            .unwrap_or_else(|| Duration::from_secs(self.config.network.sample_interval_secs.max(1)));
        let monitor = Arc::new(NetworkMonitor::new(sampler, sample_interval, bus.clone()));
        let metrics = Arc::new(PerformanceMetrics::new(
            self.config.queue.max_concurrent_files,
        ));
        let optimizer_interval = self
            .optimizer_interval
            .unwrap_or_else(|| self.config.optimizer.interval())
            .max(Duration::from_millis(1));

        info!(
            "创建上传队列: 文件并发={}, 分片并发={}, 最大重试={}, 优先级={:?}, 优化周期={:?}",
            self.config.queue.max_concurrent_files,
            self.config.queue.max_concurrent_chunks,
            self.config.queue.max_retry_attempts,
            self.config.queue.priority_mode,
            optimizer_interval
        );

        let inner = Arc::new(ManagerInner {
            services: self.services,
            config: Arc::new(RwLock::new(self.config.queue)),
            monitor: monitor.clone(),
            metrics,
            optimizer: Mutex::new(PerformanceOptimizer::new(self.config.optimizer)),
            optimizer_interval,
            progress_interval: self.progress_interval,
            bus,
            state: Mutex::new(QueueState {
                idle_notified: true,
                ..Default::default()
            }),
            finished: DashMap::new(),
            finished_order: Mutex::new(VecDeque::new()),
            finished_retention: self.finished_retention,
            schedule_notify: Notify::new(),
            shutdown_token: CancellationToken::new(),
            engine_handles: Mutex::new(Vec::new()),
        });

        let monitor_handle = monitor.start();
        let dispatcher_handle = tokio::spawn(inner.clone().dispatch_loop());

        Ok(UploadQueueManager {
            inner,
            background: Mutex::new(vec![dispatcher_handle, monitor_handle]),
        })
    }
}

impl UploadQueueManager {
    /// 使用应用配置创建管理器
    pub fn new(services: RemoteServices, config: &AppConfig) -> Result<Self, UploadError> {
        Self::builder(services).config(config.clone()).build()
    }

    pub fn builder(services: RemoteServices) -> UploadQueueManagerBuilder {
        UploadQueueManagerBuilder {
            services,
            config: AppConfig::default(),
            sampler: None,
            optimizer_interval: None,
            sample_interval: None,
            progress_interval: Duration::from_millis(DEFAULT_THROTTLE_INTERVAL_MS),
            event_capacity: DEFAULT_EVENT_CAPACITY,
            finished_retention: DEFAULT_FINISHED_RETENTION,
        }
    }

    /// 入队
    ///
    /// 空文件和空会话ID同步拒绝。`priority_override` 覆盖优先级模式计算的优先级
    pub fn enqueue(
        &self,
        source: Arc<dyn UploadSource>,
        session_id: &str,
        priority_override: Option<i64>,
        callbacks: TaskCallbacks,
    ) -> Result<String, UploadError> {
        if self.inner.shutdown_token.is_cancelled() {
            return Err(UploadError::InvalidInput("上传队列已关闭".to_string()));
        }
        if source.size() == 0 {
            return Err(UploadError::InvalidInput(format!(
                "文件为空: {}",
                source.name()
            )));
        }
        if session_id.trim().is_empty() {
            return Err(UploadError::InvalidInput("会话ID不能为空".to_string()));
        }

        let task_id = Uuid::new_v4().to_string();
        let priority = priority_override.unwrap_or_else(|| {
            self.inner
                .config
                .read()
                .priority_mode
                .priority_for(source.size())
        });
        let sink = Arc::new(TaskEventSink::new(
            task_id.clone(),
            callbacks,
            self.inner.bus.clone(),
        ));
        let task = QueuedTask::new(source, session_id.to_string(), priority, sink.clone());

        info!(
            "任务入队: task={}, file={}, size={}, priority={}",
            task_id,
            task.source.name(),
            task.source.size(),
            priority
        );
        sink.emit(UploadEvent::Queued {
            task_id: task_id.clone(),
            session_id: task.session_id.clone(),
            file_name: task.source.name().to_string(),
            total_size: task.source.size(),
            priority,
        });

        {
            let mut state = self.inner.state.lock();
            state.idle_notified = false;
            state.backlog.push(task);
        }
        self.inner.schedule_notify.notify_one();

        Ok(task_id)
    }

    /// 取消任务
    ///
    /// 对已结束的任务是空操作；未知 ID 返回 `TaskNotFound`
    pub fn cancel(&self, task_id: &str) -> Result<(), UploadError> {
        enum Target {
            Queued(QueuedTask),
            Active(Arc<ActiveTransfer>),
            Retry(PendingRetry),
            Finished,
        }

        let target = {
            let mut state = self.inner.state.lock();
            if let Some(task) = state.backlog.remove(task_id) {
                Some(Target::Queued(task))
            } else if let Some(transfer) = state.active.get(task_id).cloned() {
                if !transfer.finish(UploadTaskStatus::Cancelled) {
                    Some(Target::Finished)
                } else {
                    state.active.remove(task_id);
                    self.inner
                        .metrics
                        .set_active_concurrency(state.active.len());
                    Some(Target::Active(transfer))
                }
            } else {
                state.pending_retries.remove(task_id).map(Target::Retry)
            }
        };

        let snapshot = match target {
            None if self.inner.finished.contains_key(task_id) => {
                debug!("任务已结束，忽略取消: {}", task_id);
                return Ok(());
            }
            None => return Err(UploadError::TaskNotFound(task_id.to_string())),
            Some(Target::Finished) => return Ok(()),
            Some(Target::Queued(task)) => {
                task.sink.emit(cancelled_event(task_id));
                task.snapshot(UploadTaskStatus::Cancelled)
            }
            Some(Target::Active(transfer)) => {
                transfer.cancel_token.cancel();
                transfer.task.sink.emit(cancelled_event(task_id));
                transfer.task_snapshot()
            }
            Some(Target::Retry(pending)) => {
                pending.token.cancel();
                pending.task.sink.emit(cancelled_event(task_id));
                pending.task.snapshot(UploadTaskStatus::Cancelled)
            }
        };

        info!("任务已取消: {}", task_id);
        self.inner.record_finished(snapshot);
        self.inner.check_idle();
        self.inner.schedule_notify.notify_one();
        Ok(())
    }

    /// 暂停正在上传的任务
    pub fn pause(&self, task_id: &str) -> Result<(), UploadError> {
        let transfer = self.inner.find_active(task_id, "暂停")?;
        transfer.pause()?;
        info!("任务已暂停: {}", task_id);
        transfer.task.sink.emit(UploadEvent::Paused {
            task_id: task_id.to_string(),
        });
        Ok(())
    }

    /// 恢复已暂停的任务
    pub fn resume(&self, task_id: &str) -> Result<(), UploadError> {
        let transfer = self.inner.find_active(task_id, "恢复")?;
        let resume_count = transfer.resume()?;
        info!("任务已恢复: {} (第 {} 次)", task_id, resume_count);
        transfer.task.sink.emit(UploadEvent::Resumed {
            task_id: task_id.to_string(),
            resume_count,
        });
        Ok(())
    }

    /// 队列状态快照（不阻塞调度）
    pub fn status(&self) -> QueueStatus {
        let (queued, active, pending_retries, completed_count) = {
            let state = self.inner.state.lock();
            (
                state.backlog.len(),
                state.active.len(),
                state.pending_retries.len(),
                state.completed_count,
            )
        };
        QueueStatus {
            queued,
            active,
            pending_retries,
            completed_count,
            finished: self.inner.finished.len(),
            effective_max_files: self.inner.effective_max_files(),
            config: self.inner.config.read().clone(),
            network: self.inner.monitor.snapshot(),
            performance: self.inner.metrics.snapshot(),
        }
    }

    /// 查询任务（任意阶段）
    ///
    /// 已结束的任务只保留最近 `finished_retention` 个快照，更早的返回 None
    pub fn get_task(&self, task_id: &str) -> Option<TaskSnapshot> {
        {
            let state = self.inner.state.lock();
            if let Some(task) = state.backlog.get(task_id) {
                return Some(task.snapshot(UploadTaskStatus::Queued));
            }
            if let Some(transfer) = state.active.get(task_id) {
                return Some(transfer.task_snapshot());
            }
            if let Some(pending) = state.pending_retries.get(task_id) {
                return Some(pending.task.snapshot(UploadTaskStatus::Retrying));
            }
        }
        self.inner.finished.get(task_id).map(|s| s.clone())
    }

    /// 等待队列中的任务（按出队顺序）
    pub fn queued_tasks(&self) -> Vec<TaskSnapshot> {
        self.inner
            .state
            .lock()
            .backlog
            .iter()
            .map(|task| task.snapshot(UploadTaskStatus::Queued))
            .collect()
    }

    /// 正在传输的任务
    pub fn active_transfers(&self) -> Vec<TransferSnapshot> {
        let transfers: Vec<Arc<ActiveTransfer>> =
            self.inner.state.lock().active.values().cloned().collect();
        transfers.iter().map(|t| t.snapshot()).collect()
    }

    pub fn config(&self) -> QueueConfig {
        self.inner.config.read().clone()
    }

    /// 修改队列配置，校验失败时不生效
    pub fn update_config<F>(&self, update: F) -> Result<QueueConfig, UploadError>
    where
        F: FnOnce(&mut QueueConfig),
    {
        let updated = {
            let mut config = self.inner.config.write();
            let mut candidate = config.clone();
            update(&mut candidate);
            candidate.validate()?;
            *config = candidate.clone();
            candidate
        };

        info!(
            "🔧 队列配置已更新: 文件并发={}, 分片并发={}, 最大重试={}",
            updated.max_concurrent_files, updated.max_concurrent_chunks, updated.max_retry_attempts
        );
        self.inner
            .metrics
            .set_optimal_concurrency(self.inner.effective_max_files());
        self.inner.schedule_notify.notify_one();
        Ok(updated)
    }

    /// 整体替换队列配置
    pub fn set_config(&self, config: QueueConfig) -> Result<(), UploadError> {
        self.update_config(move |current| *current = config)
            .map(|_| ())
    }

    /// 订阅全局事件
    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.inner.bus.subscribe()
    }

    pub fn network_monitor(&self) -> &Arc<NetworkMonitor> {
        &self.inner.monitor
    }

    pub fn metrics(&self) -> PerformanceSnapshot {
        self.inner.metrics.snapshot()
    }

    /// 关闭：停止调度和网络监测，取消所有未结束的任务并等待后台任务退出
    pub async fn shutdown(&self) {
        if self.inner.shutdown_token.is_cancelled() {
            return;
        }
        info!("正在关闭上传队列...");
        self.inner.shutdown_token.cancel();
        self.inner.monitor.stop();

        let (queued, active, retries) = {
            let mut state = self.inner.state.lock();
            state.idle_notified = true;
            (
                state.backlog.drain(),
                state.active.drain().map(|(_, t)| t).collect::<Vec<_>>(),
                state
                    .pending_retries
                    .drain()
                    .map(|(_, p)| p)
                    .collect::<Vec<_>>(),
            )
        };

        for task in queued {
            task.sink.emit(cancelled_event(&task.id));
            self.inner
                .record_finished(task.snapshot(UploadTaskStatus::Cancelled));
        }
        for transfer in active {
            if transfer.finish(UploadTaskStatus::Cancelled) {
                transfer.cancel_token.cancel();
                transfer.task.sink.emit(cancelled_event(transfer.id()));
            }
            self.inner.record_finished(transfer.task_snapshot());
        }
        for pending in retries {
            pending.token.cancel();
            pending.task.sink.emit(cancelled_event(&pending.task.id));
            self.inner
                .record_finished(pending.task.snapshot(UploadTaskStatus::Cancelled));
        }

        let mut handles: Vec<JoinHandle<()>> = self.background.lock().drain(..).collect();
        handles.extend(self.inner.engine_handles.lock().drain(..));
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                warn!("后台任务异常退出: {}", e);
            }
        }
        info!("上传队列已关闭");
    }
}

impl Drop for UploadQueueManager {
    fn drop(&mut self) {
        self.inner.shutdown_token.cancel();
        self.inner.monitor.stop();
    }
}

impl std::fmt::Debug for UploadQueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadQueueManager")
            .field("status", &self.status())
            .finish()
    }
}

fn cancelled_event(task_id: &str) -> UploadEvent {
    UploadEvent::Cancelled {
        task_id: task_id.to_string(),
    }
}

impl ManagerInner {
    /// 调度循环：调度和优化周期在同一个任务上串行执行
    async fn dispatch_loop(self: Arc<Self>) {
        let period = self.optimizer_interval;
        let mut optimizer_tick =
            tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        optimizer_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut tier_rx = self.monitor.subscribe_tier();

        info!("调度器已启动");
        loop {
            tokio::select! {
                _ = self.shutdown_token.cancelled() => break,
                _ = self.schedule_notify.notified() => {}
                _ = optimizer_tick.tick() => self.run_optimizer(),
                Ok(()) = tier_rx.changed() => {
                    let tier = *tier_rx.borrow_and_update();
                    info!("网络分级变为 {}，重新调度", tier);
                }
            }
            self.schedule_pass();
        }
        info!("调度器已停止");
    }

    fn tuning_profile(&self) -> Option<TierProfile> {
        if self.config.read().network_tuning {
            Some(self.monitor.profile())
        } else {
            None
        }
    }

    /// 有效文件并发 = 配置值，开启网络调优时再受分级上限约束
    fn effective_max_files(&self) -> usize {
        let profile = self.tuning_profile();
        let files = self.config.read().max_concurrent_files;
        match profile {
            Some(profile) => profile.cap_files(files),
            None => files.max(1),
        }
    }

    fn run_optimizer(&self) {
        let profile = self.tuning_profile();
        self.optimizer
            .lock()
            .tick(&self.metrics, &self.config, profile.as_ref());
        self.bus.publish(UploadEvent::PerformanceUpdate {
            metrics: self.metrics.snapshot(),
        });
    }

    /// 调度：活跃数低于有效并发时按优先级取出任务启动
    fn schedule_pass(self: &Arc<Self>) {
        if self.shutdown_token.is_cancelled() {
            return;
        }
        let max_files = self.effective_max_files();

        let started = {
            let mut state = self.state.lock();
            let mut started = Vec::new();
            while state.active.len() < max_files {
                let Some(task) = state.backlog.pop() else {
                    break;
                };
                let transfer = Arc::new(ActiveTransfer::new(
                    task,
                    self.shutdown_token.child_token(),
                ));
                state
                    .active
                    .insert(transfer.id().to_string(), transfer.clone());
                started.push(transfer);
            }
            self.metrics.set_active_concurrency(state.active.len());
            started
        };

        for transfer in started {
            debug!("调度任务: {} (并发上限 {})", transfer.id(), max_files);
            self.spawn_transfer(transfer);
        }
    }

    fn spawn_transfer(self: &Arc<Self>, transfer: Arc<ActiveTransfer>) {
        let engine = UploadEngine::new(
            transfer.clone(),
            self.services.clone(),
            self.config.clone(),
            self.monitor.clone(),
            self.metrics.clone(),
        )
        .with_progress_interval(self.progress_interval);

        let inner = self.clone();
        let handle = tokio::spawn(async move {
            let outcome = engine.run().await;
            inner.on_transfer_finished(&transfer, outcome);
        });

        let mut handles = self.engine_handles.lock();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    /// 传输结束：释放活跃槽位，失败时交给重试策略
    fn on_transfer_finished(self: &Arc<Self>, transfer: &Arc<ActiveTransfer>, outcome: TransferOutcome) {
        let task_id = transfer.id().to_string();
        let decision = match &outcome {
            TransferOutcome::Failed(error) => Some(
                RetryController::from_config(&self.config.read())
                    .should_retry(transfer.task.retry_count, error),
            ),
            _ => None,
        };
        let retry_token = self.shutdown_token.child_token();

        // 移出活跃集合和登记待重试在同一临界区内完成，避免误判空闲
        let owned = {
            let mut state = self.state.lock();
            let owned = state
                .active
                .get(&task_id)
                .is_some_and(|active| Arc::ptr_eq(active, transfer));
            if owned {
                state.active.remove(&task_id);
                match (&outcome, decision) {
                    (TransferOutcome::Completed(_), _) => state.completed_count += 1,
                    (_, Some(RetryDecision::Retry { retry_count, .. })) => {
                        let mut task = transfer.task.clone();
                        task.retry_count = retry_count;
                        state.pending_retries.insert(
                            task_id.clone(),
                            PendingRetry {
                                task,
                                token: retry_token.clone(),
                            },
                        );
                    }
                    _ => {}
                }
                self.metrics.set_active_concurrency(state.active.len());
            }
            owned
        };

        if owned {
            match outcome {
                TransferOutcome::Completed(_) => {
                    self.record_finished(transfer.task_snapshot());
                }
                TransferOutcome::Cancelled => {
                    transfer.set_status(UploadTaskStatus::Cancelled);
                    transfer.task.sink.emit(cancelled_event(&task_id));
                    self.record_finished(transfer.task_snapshot());
                }
                TransferOutcome::Failed(error) => match decision {
                    Some(RetryDecision::Retry { retry_count, delay }) => {
                        warn!(
                            "任务 {} 上传失败，{}ms 后第 {} 次重试: {}",
                            task_id,
                            delay.as_millis(),
                            retry_count,
                            error
                        );
                        transfer.task.sink.emit(UploadEvent::Retrying {
                            task_id: task_id.clone(),
                            retry_count,
                            delay_ms: delay.as_millis() as u64,
                            message: error.to_string(),
                        });
                        self.spawn_retry_delay(task_id.clone(), delay, retry_token);
                    }
                    _ => {
                        let retry_count = transfer.task.retry_count;
                        transfer.set_status(UploadTaskStatus::Error);
                        error!(
                            "任务 {} 永久失败（已重试 {} 次）: {}",
                            task_id, retry_count, error
                        );
                        transfer.task.sink.emit(UploadEvent::Error {
                            task_id: task_id.clone(),
                            message: error.to_string(),
                            retry_count,
                        });
                        let mut snapshot = transfer.task_snapshot();
                        snapshot.error = Some(error.to_string());
                        self.record_finished(snapshot);
                    }
                },
            }
        } else {
            debug!("任务 {} 已不在活跃集合中（已取消）", task_id);
        }

        self.check_idle();
        self.schedule_notify.notify_one();
    }

    /// 重试延迟结束后插回队首
    fn spawn_retry_delay(self: &Arc<Self>, task_id: String, delay: Duration, token: CancellationToken) {
        let inner = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            let requeued = {
                let mut state = inner.state.lock();
                match state.pending_retries.remove(&task_id) {
                    Some(pending) => {
                        state.backlog.push_front(pending.task);
                        true
                    }
                    None => false,
                }
            };
            if requeued {
                debug!("任务 {} 重新入队（队首）", task_id);
                inner.schedule_notify.notify_one();
            }
        });
    }

    /// 进入空闲状态时发出一次 queue_empty
    fn check_idle(&self) {
        let completed_count = {
            let mut state = self.state.lock();
            if state.idle_notified || !state.is_idle() {
                return;
            }
            state.idle_notified = true;
            state.completed_count
        };
        info!("上传队列已清空，累计完成 {} 个任务", completed_count);
        self.bus.publish(UploadEvent::QueueEmpty { completed_count });
    }

    fn record_finished(&self, snapshot: TaskSnapshot) {
        let task_id = snapshot.task_id.clone();
        let mut order = self.finished_order.lock();
        if self.finished.insert(task_id.clone(), snapshot).is_none() {
            order.push_back(task_id);
        }
        while order.len() > self.finished_retention {
            if let Some(evicted) = order.pop_front() {
                self.finished.remove(&evicted);
                debug!("淘汰已结束任务快照: {}", evicted);
            }
        }
    }

    /// 查找活跃传输；任务存在但不在传输中时返回 `InvalidState`
    fn find_active(
        &self,
        task_id: &str,
        action: &'static str,
    ) -> Result<Arc<ActiveTransfer>, UploadError> {
        let status = {
            let state = self.state.lock();
            if let Some(transfer) = state.active.get(task_id) {
                return Ok(transfer.clone());
            }
            if state.backlog.get(task_id).is_some() {
                Some(UploadTaskStatus::Queued)
            } else if state.pending_retries.contains_key(task_id) {
                Some(UploadTaskStatus::Retrying)
            } else {
                None
            }
        };
        let status = match status {
            Some(status) => status,
            None => match self.finished.get(task_id) {
                Some(snapshot) => snapshot.status,
                None => return Err(UploadError::TaskNotFound(task_id.to_string())),
            },
        };
        Err(UploadError::InvalidState {
            task_id: task_id.to_string(),
            status: status.to_string(),
            action,
        })
    }
}
