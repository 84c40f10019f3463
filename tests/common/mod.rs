// 集成测试共用的脚本化远端和事件收集工具

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use upload_queue::config::{AppConfig, QueueConfig};
use upload_queue::events::{TaskCallbacks, UploadEvent};
use upload_queue::network::StaticLinkSampler;
use upload_queue::remote::{
    AuthorizationProvider, ChunkProgressFn, ChunkTransport, ChunkUpload, CompletedPart,
    FileRecord, Finalizer, RemoteServices, UploadAuthorization, UploadRequest,
};
use upload_queue::{MemorySource, UploadQueueManager};

/// 脚本化远端：记录调用顺序，可注入延迟和失败
pub struct MockRemote {
    chunk_size: u64,
    default_delay: Duration,
    part_delays: HashMap<u32, Duration>,
    /// 前 N 次授权得到的句柄，其分片全部失败
    failing_attempts: AtomicUsize,
    failing_handles: Mutex<HashSet<String>>,
    pub fail_auth: AtomicBool,
    pub auth_calls: AtomicUsize,
    pub aborted: AtomicUsize,
    pub open_uploads: AtomicUsize,
    pub max_open_uploads: AtomicUsize,
    /// 同时在传的分片数及其峰值
    pub in_flight_chunks: AtomicUsize,
    pub max_in_flight_chunks: AtomicUsize,
    /// 收到的最大分片字节数
    pub max_chunk_bytes: AtomicU64,
    /// 授权顺序（文件名）
    pub authorized_files: Mutex<Vec<String>>,
    /// 分片传输完成顺序
    pub chunk_completion_order: Mutex<Vec<u32>>,
    /// 合并时收到的分片序号
    pub finalized_parts: Mutex<Vec<Vec<u32>>>,
    next_handle: AtomicUsize,
    handles: Mutex<HashMap<String, String>>,
}

impl MockRemote {
    pub fn new(chunk_size: u64) -> Self {
        Self {
            chunk_size,
            default_delay: Duration::from_millis(5),
            part_delays: HashMap::new(),
            failing_attempts: AtomicUsize::new(0),
            failing_handles: Mutex::new(HashSet::new()),
            fail_auth: AtomicBool::new(false),
            auth_calls: AtomicUsize::new(0),
            aborted: AtomicUsize::new(0),
            open_uploads: AtomicUsize::new(0),
            max_open_uploads: AtomicUsize::new(0),
            in_flight_chunks: AtomicUsize::new(0),
            max_in_flight_chunks: AtomicUsize::new(0),
            max_chunk_bytes: AtomicU64::new(0),
            authorized_files: Mutex::new(Vec::new()),
            chunk_completion_order: Mutex::new(Vec::new()),
            finalized_parts: Mutex::new(Vec::new()),
            next_handle: AtomicUsize::new(0),
            handles: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_default_delay(mut self, delay: Duration) -> Self {
        self.default_delay = delay;
        self
    }

    pub fn with_part_delay(mut self, part_number: u32, delay: Duration) -> Self {
        self.part_delays.insert(part_number, delay);
        self
    }

    /// 前 `attempts` 次上传尝试的分片传输全部失败
    pub fn with_failing_attempts(self, attempts: usize) -> Self {
        self.failing_attempts.store(attempts, Ordering::SeqCst);
        self
    }

    pub fn services(self: &Arc<Self>) -> RemoteServices {
        RemoteServices::from_store(self.clone())
    }

    fn close_upload(&self, handle: &str) {
        if self.handles.lock().remove(handle).is_some() {
            self.open_uploads.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl AuthorizationProvider for MockRemote {
    async fn request_upload(&self, request: &UploadRequest) -> anyhow::Result<UploadAuthorization> {
        self.auth_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_auth.load(Ordering::SeqCst) {
            anyhow::bail!("permission denied");
        }

        let handle = format!("handle-{}", self.next_handle.fetch_add(1, Ordering::SeqCst));
        let failing = self
            .failing_attempts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            self.failing_handles.lock().insert(handle.clone());
        }

        self.authorized_files.lock().push(request.file_name.clone());
        self.handles
            .lock()
            .insert(handle.clone(), request.file_name.clone());
        let open = self.open_uploads.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_open_uploads.fetch_max(open, Ordering::SeqCst);

        Ok(UploadAuthorization {
            upload_handle: handle,
            suggested_chunk_size: self.chunk_size,
        })
    }
}

#[async_trait]
impl ChunkTransport for MockRemote {
    async fn put_chunk(
        &self,
        chunk: ChunkUpload,
        on_progress: ChunkProgressFn,
        cancel: CancellationToken,
    ) -> anyhow::Result<String> {
        let delay = self
            .part_delays
            .get(&chunk.part_number)
            .copied()
            .unwrap_or(self.default_delay);
        let len = chunk.data.len() as u64;
        self.max_chunk_bytes.fetch_max(len, Ordering::SeqCst);
        let in_flight = self.in_flight_chunks.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight_chunks.fetch_max(in_flight, Ordering::SeqCst);

        on_progress(len / 2);
        let cancelled = tokio::select! {
            _ = cancel.cancelled() => true,
            _ = tokio::time::sleep(delay) => false,
        };
        self.in_flight_chunks.fetch_sub(1, Ordering::SeqCst);
        if cancelled {
            anyhow::bail!("cancelled");
        }
        if self.failing_handles.lock().contains(&chunk.upload_handle) {
            anyhow::bail!("connection reset by peer");
        }
        on_progress(len);

        self.chunk_completion_order.lock().push(chunk.part_number);
        Ok(format!("etag-{}", chunk.part_number))
    }
}

#[async_trait]
impl Finalizer for MockRemote {
    async fn complete(&self, upload_handle: &str, parts: &[CompletedPart]) -> anyhow::Result<FileRecord> {
        let file_name = self
            .handles
            .lock()
            .get(upload_handle)
            .cloned()
            .unwrap_or_default();
        self.finalized_parts
            .lock()
            .push(parts.iter().map(|p| p.part_number).collect());
        self.close_upload(upload_handle);

        Ok(FileRecord {
            file_id: upload_handle.to_string(),
            file_name: file_name.clone(),
            size: 0,
            location: format!("mock://{}", file_name),
            created_at: 0,
            metadata: serde_json::Value::Null,
        })
    }

    async fn abort(&self, upload_handle: &str) -> anyhow::Result<()> {
        self.aborted.fetch_add(1, Ordering::SeqCst);
        self.close_upload(upload_handle);
        Ok(())
    }
}

/// 测试用配置：关闭自适应优化，重试延迟很短
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.queue = QueueConfig {
        max_retry_attempts: 3,
        base_retry_delay_ms: 5,
        adaptive_optimization: false,
        ..Default::default()
    };
    config
}

pub fn build_manager(remote: &Arc<MockRemote>, config: AppConfig) -> UploadQueueManager {
    UploadQueueManager::builder(remote.services())
        .config(config)
        .sampler(Arc::new(StaticLinkSampler::default()))
        .progress_interval(Duration::from_millis(1))
        .build()
        .expect("build manager")
}

pub fn memory_file(name: &str, size: usize) -> Arc<MemorySource> {
    let data = (0..size).map(|i| (i % 251) as u8).collect();
    Arc::new(MemorySource::new(name, data))
}

pub type EventLog = Arc<Mutex<Vec<UploadEvent>>>;

/// 记录任务全部事件的回调
pub fn recording_callbacks() -> (TaskCallbacks, EventLog) {
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    let callbacks = TaskCallbacks::new().on_event(move |event| sink.lock().push(event.clone()));
    (callbacks, log)
}

/// 收集全局事件直到 queue_empty
pub async fn wait_for_queue_empty(rx: &mut broadcast::Receiver<UploadEvent>) -> Vec<UploadEvent> {
    let mut events = Vec::new();
    let collect = async {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let done = matches!(event, UploadEvent::QueueEmpty { .. });
                    events.push(event);
                    if done {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(10), collect)
        .await
        .expect("queue did not become idle in time");
    events
}

pub fn count_terminal(events: &[UploadEvent]) -> usize {
    events.iter().filter(|e| e.is_terminal()).count()
}
