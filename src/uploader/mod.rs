// 上传模块
//
// - 分片切分与状态跟踪
// - 单文件上传引擎（分片窗口并发、暂停/恢复、失败整体中止）
// - 优先级等待队列与重试退避
// - 上传队列管理器（调度、取消、空闲通知）

pub mod backlog;
pub mod chunk;
pub mod engine;
pub mod manager;
pub mod retry;
pub mod source;
pub mod task;

pub use backlog::Backlog;
pub use chunk::{effective_chunk_size, UploadChunk, UploadChunkManager};
pub use engine::{TransferOutcome, UploadEngine};
pub use manager::{QueueStatus, UploadQueueManager, UploadQueueManagerBuilder};
pub use retry::{RetryController, RetryDecision, MAX_RETRY_DELAY};
pub use source::{guess_content_type, LocalFileSource, MemorySource, UploadSource};
pub use task::{
    ActiveTransfer, QueuedTask, TaskSnapshot, TransferSnapshot, UploadTaskStatus,
};
