// 上传引擎
//
// 负责单个文件的一次上传尝试：
// 1. 申请上传授权，按网络分级确定分片大小
// 2. 滚动窗口并发上传分片，窗口大小在每个分片结束时重新计算
// 3. 任一分片失败时中止其余分片，整个尝试失败（由管理器决定是否重试）
// 4. 按分片序号排序后合并
//
// 暂停只取消本轮令牌，已完成分片保留；恢复后从分片游标继续。
// 每次传输调用都与取消令牌竞争，忽略取消的传输方其结果会被丢弃

use crate::config::QueueConfig;
use crate::error::UploadError;
use crate::events::{ProgressInfo, ProgressThrottler, UploadEvent};
use crate::metrics::PerformanceMetrics;
use crate::network::NetworkMonitor;
use crate::remote::{
    ChunkProgressFn, ChunkTransport, ChunkUpload, FileRecord, RemoteServices, UploadRequest,
};
use crate::uploader::chunk::{effective_chunk_size, UploadChunk, UploadChunkManager};
use crate::uploader::source::UploadSource;
use crate::uploader::task::{ActiveTransfer, UploadTaskStatus};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 一次上传尝试的结果
#[derive(Debug, Clone)]
pub enum TransferOutcome {
    Completed(FileRecord),
    Failed(UploadError),
    Cancelled,
}

/// 单个分片任务的结果
enum ChunkResult {
    Done {
        index: usize,
        tag: String,
        bytes: u64,
        elapsed: Duration,
    },
    /// 本轮被取消（暂停或取消），结果丢弃
    Interrupted { index: usize },
    Failed { index: usize, error: UploadError },
}

/// 进度上报
///
/// 字节数 = 已完成分片字节 + 在途分片已发送字节，并以最高水位保证单调不减
struct ProgressReporter {
    transfer: Arc<ActiveTransfer>,
    chunk_manager: Arc<Mutex<UploadChunkManager>>,
    /// 在途分片已发送字节（按分片索引）
    in_flight: DashMap<usize, u64>,
    high_water: Mutex<u64>,
    throttler: ProgressThrottler,
    started: Instant,
}

impl ProgressReporter {
    fn new(
        transfer: Arc<ActiveTransfer>,
        chunk_manager: Arc<Mutex<UploadChunkManager>>,
        throttle_interval: Duration,
    ) -> Self {
        Self {
            transfer,
            chunk_manager,
            in_flight: DashMap::new(),
            high_water: Mutex::new(0),
            throttler: ProgressThrottler::new(throttle_interval),
            started: Instant::now(),
        }
    }

    fn chunk_started(&self, index: usize) {
        self.in_flight.insert(index, 0);
    }

    /// 在途进度（节流）
    fn chunk_progress(&self, index: usize, sent: u64) {
        match self.in_flight.get_mut(&index) {
            Some(mut entry) => *entry = (*entry).max(sent),
            None => return,
        }
        if self.throttler.should_emit() {
            self.emit();
        }
    }

    /// 分片完成（总是上报）
    fn chunk_finished(&self, index: usize) {
        self.in_flight.remove(&index);
        self.throttler.force_emit();
        self.emit();
    }

    fn chunk_dropped(&self, index: usize) {
        self.in_flight.remove(&index);
    }

    fn clear(&self) {
        self.in_flight.clear();
    }

    fn emit(&self) {
        let (completed_bytes, completed_chunks, total_chunks, cursor) = {
            let cm = self.chunk_manager.lock();
            (
                cm.uploaded_bytes(),
                cm.completed_count(),
                cm.chunk_count(),
                cm.cursor(),
            )
        };
        let in_flight: u64 = self.in_flight.iter().map(|e| *e.value()).sum();
        let total = self.transfer.total_size();

        // 持锁发送，保证并发分片的进度事件按水位顺序发出
        let mut high_water = self.high_water.lock();
        let bytes = (completed_bytes + in_flight).min(total).max(*high_water);
        *high_water = bytes;

        let elapsed = self.started.elapsed().as_secs_f64();
        let speed = if elapsed > 0.0 {
            (bytes as f64 / elapsed) as u64
        } else {
            0
        };
        let eta = if speed > 0 && bytes < total {
            Some((total - bytes) / speed)
        } else {
            None
        };

        self.transfer
            .record_progress(bytes, completed_chunks, cursor, speed);
        self.transfer.task.sink.emit(UploadEvent::Progress(ProgressInfo {
            task_id: self.transfer.id().to_string(),
            progress: if total == 0 {
                0.0
            } else {
                bytes as f64 / total as f64 * 100.0
            },
            speed,
            eta,
            bytes_uploaded: bytes,
            total_bytes: total,
            completed_chunks,
            total_chunks,
        }));
    }
}

/// 分片任务共享的上下文
struct ChunkContext {
    transport: Arc<dyn ChunkTransport>,
    source: Arc<dyn UploadSource>,
    upload_handle: String,
    reporter: Arc<ProgressReporter>,
}

/// 上传引擎
pub struct UploadEngine {
    transfer: Arc<ActiveTransfer>,
    services: RemoteServices,
    config: Arc<RwLock<QueueConfig>>,
    monitor: Arc<NetworkMonitor>,
    metrics: Arc<PerformanceMetrics>,
    progress_interval: Duration,
}

impl UploadEngine {
    pub fn new(
        transfer: Arc<ActiveTransfer>,
        services: RemoteServices,
        config: Arc<RwLock<QueueConfig>>,
        monitor: Arc<NetworkMonitor>,
        metrics: Arc<PerformanceMetrics>,
    ) -> Self {
        Self {
            transfer,
            services,
            config,
            monitor,
            metrics,
            progress_interval: Duration::from_millis(crate::events::DEFAULT_THROTTLE_INTERVAL_MS),
        }
    }

    /// 设置在途进度的节流间隔
    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    /// 执行一次上传尝试
    pub async fn run(self) -> TransferOutcome {
        let task_id = self.transfer.id().to_string();
        let total_size = self.transfer.total_size();
        let attempt = self.transfer.task.retry_count + 1;

        info!(
            "开始上传: task={}, file={}, size={}, attempt={}",
            task_id,
            self.transfer.task.source.name(),
            total_size,
            attempt
        );
        self.transfer.task.sink.emit(UploadEvent::Started {
            task_id: task_id.clone(),
            attempt,
            total_size,
        });

        match self.execute().await {
            Ok(record) => {
                if !self.transfer.finish(UploadTaskStatus::Completed) {
                    // 合并期间任务已被取消，结果不计入成功
                    info!(
                        "合并完成但任务已取消: task={}, status={:?}",
                        task_id,
                        self.transfer.status()
                    );
                    return TransferOutcome::Cancelled;
                }
                self.metrics.record_success(total_size);
                info!("✓ 上传完成: task={}, location={}", task_id, record.location);
                self.transfer.task.sink.emit(UploadEvent::Completed {
                    task_id,
                    record: record.clone(),
                    bytes_uploaded: total_size,
                    total_bytes: total_size,
                    completed_at: chrono::Utc::now().timestamp(),
                });
                TransferOutcome::Completed(record)
            }
            Err(UploadError::Cancelled) => {
                info!("上传已取消: task={}", task_id);
                self.abort_remote().await;
                TransferOutcome::Cancelled
            }
            Err(e) => {
                self.metrics.record_failure();
                error!("上传失败: task={}, 错误: {}", task_id, e);
                self.abort_remote().await;
                TransferOutcome::Failed(e)
            }
        }
    }

    async fn execute(&self) -> Result<FileRecord, UploadError> {
        let cancel_token = &self.transfer.cancel_token;
        let source = self.transfer.task.source.clone();
        let total_size = source.size();

        // 1. 申请授权
        let request = UploadRequest {
            file_name: source.name().to_string(),
            file_size: total_size,
            content_type: source.content_type().to_string(),
            session_id: self.transfer.task.session_id.clone(),
        };
        let authorization = tokio::select! {
            biased;
            _ = cancel_token.cancelled() => return Err(UploadError::Cancelled),
            result = self.services.authorizer.request_upload(&request) => {
                result.map_err(|e| UploadError::Authorization(format!("{:#}", e)))?
            }
        };

        let profile = if self.config.read().network_tuning {
            Some(self.monitor.profile())
        } else {
            None
        };
        let chunk_size = effective_chunk_size(authorization.suggested_chunk_size, profile.as_ref());
        let chunk_manager = Arc::new(Mutex::new(UploadChunkManager::new(total_size, chunk_size)));
        let total_chunks = chunk_manager.lock().chunk_count();

        if !self
            .transfer
            .begin_upload(authorization.upload_handle.clone(), chunk_size, total_chunks)
        {
            return Err(UploadError::Cancelled);
        }
        info!(
            "获取上传授权成功: task={}, handle={}, 分片大小={}, 分片数={}, 网络分级={}",
            self.transfer.id(),
            authorization.upload_handle,
            chunk_size,
            total_chunks,
            self.monitor.tier()
        );

        // 2. 分片上传（暂停后可多轮）
        let reporter = Arc::new(ProgressReporter::new(
            self.transfer.clone(),
            chunk_manager.clone(),
            self.progress_interval,
        ));
        let ctx = Arc::new(ChunkContext {
            transport: self.services.transport.clone(),
            source,
            upload_handle: authorization.upload_handle.clone(),
            reporter,
        });

        loop {
            if !self.transfer.wait_while_paused().await {
                return Err(UploadError::Cancelled);
            }
            let round = self.transfer.new_round_token();
            self.upload_round(&ctx, &chunk_manager, &round).await?;

            if cancel_token.is_cancelled() {
                return Err(UploadError::Cancelled);
            }
            if chunk_manager.lock().is_completed() {
                if self.transfer.begin_completing() {
                    break;
                }
                // 最后一个分片完成后被暂停，恢复后再合并
                continue;
            }
            debug!(
                "本轮上传被暂停: task={}, 游标={}",
                self.transfer.id(),
                chunk_manager.lock().cursor()
            );
        }

        // 3. 合并
        let parts = chunk_manager.lock().completed_parts();
        info!(
            "合并上传分片: task={}, 分片数={}",
            self.transfer.id(),
            parts.len()
        );
        let record = tokio::select! {
            biased;
            _ = cancel_token.cancelled() => return Err(UploadError::Cancelled),
            result = self.services.finalizer.complete(&authorization.upload_handle, &parts) => {
                result.map_err(|e| UploadError::Finalize(format!("{:#}", e)))?
            }
        };

        Ok(record)
    }

    /// 当前分片并发窗口
    fn chunk_window(&self, remaining: usize) -> usize {
        let config = self.config.read();
        let mut limit = config.max_concurrent_chunks;
        if config.network_tuning {
            limit = self.monitor.profile().cap_chunks(limit);
        }
        limit.min(remaining).max(1)
    }

    /// 一轮分片上传：本轮令牌取消后不再派发新分片，等待在途分片退出
    async fn upload_round(
        &self,
        ctx: &Arc<ChunkContext>,
        chunk_manager: &Arc<Mutex<UploadChunkManager>>,
        round: &CancellationToken,
    ) -> Result<(), UploadError> {
        let mut join_set: JoinSet<ChunkResult> = JoinSet::new();

        loop {
            if !round.is_cancelled() {
                let remaining = chunk_manager.lock().remaining_count();
                let window = self.chunk_window(remaining);

                while join_set.len() < window {
                    let next = {
                        let mut cm = chunk_manager.lock();
                        cm.next_pending().map(|chunk| {
                            chunk.uploading = true;
                            chunk.clone()
                        })
                    };
                    let Some(chunk) = next else { break };

                    debug!(
                        "派发分片 #{}: task={}, 窗口={}",
                        chunk.part_number,
                        self.transfer.id(),
                        window
                    );
                    ctx.reporter.chunk_started(chunk.index);
                    join_set.spawn(upload_chunk(ctx.clone(), chunk, round.clone()));
                }
            }

            let Some(joined) = join_set.join_next().await else {
                return Ok(());
            };

            let failure = match joined {
                Ok(ChunkResult::Done {
                    index,
                    tag,
                    bytes,
                    elapsed,
                }) => {
                    chunk_manager.lock().mark_completed(index, tag);
                    let rate = bytes as f64 / elapsed.as_secs_f64().max(0.001);
                    self.monitor.record_sample(rate);
                    self.metrics.record_throughput(rate);
                    ctx.reporter.chunk_finished(index);
                    None
                }
                Ok(ChunkResult::Interrupted { index }) => {
                    chunk_manager.lock().unmark_uploading(index);
                    ctx.reporter.chunk_dropped(index);
                    None
                }
                Ok(ChunkResult::Failed { index, error }) => {
                    warn!(
                        "分片失败，中止其余分片: task={}, index={}, 错误: {}",
                        self.transfer.id(),
                        index,
                        error
                    );
                    Some(error)
                }
                Err(e) => Some(UploadError::Transport {
                    part_number: 0,
                    message: format!("分片任务异常: {}", e),
                }),
            };

            if let Some(error) = failure {
                join_set.abort_all();
                while join_set.join_next().await.is_some() {}
                chunk_manager.lock().unmark_all_uploading();
                ctx.reporter.clear();

                if self.transfer.cancel_token.is_cancelled() {
                    return Err(UploadError::Cancelled);
                }
                return Err(error);
            }
        }
    }

    /// 放弃远端上传（尽力而为）
    async fn abort_remote(&self) {
        let Some(handle) = self.transfer.upload_handle() else {
            return;
        };
        if let Err(e) = self.services.finalizer.abort(&handle).await {
            warn!(
                "放弃远端上传失败: task={}, handle={}, 错误: {:#}",
                self.transfer.id(),
                handle,
                e
            );
        }
    }
}

/// 上传单个分片
async fn upload_chunk(
    ctx: Arc<ChunkContext>,
    chunk: UploadChunk,
    round: CancellationToken,
) -> ChunkResult {
    let index = chunk.index;
    let part_number = chunk.part_number;
    let size = chunk.size();

    let data = tokio::select! {
        biased;
        _ = round.cancelled() => return ChunkResult::Interrupted { index },
        result = chunk.read_data(ctx.source.as_ref()) => match result {
            Ok(data) => data,
            Err(e) => {
                return ChunkResult::Failed {
                    index,
                    error: UploadError::Source(format!("{:#}", e)),
                }
            }
        },
    };

    let reporter = ctx.reporter.clone();
    let progress_round = round.clone();
    let on_progress: ChunkProgressFn = Arc::new(move |sent| {
        if !progress_round.is_cancelled() {
            reporter.chunk_progress(index, sent.min(size));
        }
    });

    let started = Instant::now();
    let upload = ChunkUpload {
        upload_handle: ctx.upload_handle.clone(),
        part_number,
        data,
    };
    let result = tokio::select! {
        biased;
        _ = round.cancelled() => return ChunkResult::Interrupted { index },
        result = ctx.transport.put_chunk(upload, on_progress, round.clone()) => result,
    };

    if round.is_cancelled() {
        return ChunkResult::Interrupted { index };
    }
    match result {
        Ok(tag) => {
            debug!("分片 #{} 上传成功: {} bytes", part_number, size);
            ChunkResult::Done {
                index,
                tag,
                bytes: size,
                elapsed: started.elapsed(),
            }
        }
        Err(e) => ChunkResult::Failed {
            index,
            error: UploadError::Transport {
                part_number,
                message: format!("{:#}", e),
            },
        },
    }
}
