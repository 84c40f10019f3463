// 远端协作方接口
//
// 上传核心只依赖三个抽象：
// - AuthorizationProvider：申请分片上传句柄和建议分片大小
// - ChunkTransport：传输单个分片，返回确认标签
// - Finalizer：按分片序号合并完成，或放弃上传
//
// 授权/合并的具体协议由实现方决定

pub mod local;

pub use local::LocalObjectStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// 上传授权请求
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadRequest {
    pub file_name: String,
    pub file_size: u64,
    pub content_type: String,
    pub session_id: String,
}

/// 上传授权（分片上传句柄 + 建议分片大小）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadAuthorization {
    pub upload_handle: String,
    pub suggested_chunk_size: u64,
}

/// 待传输的分片
#[derive(Debug, Clone)]
pub struct ChunkUpload {
    pub upload_handle: String,
    /// 分片序号（从 1 开始）
    pub part_number: u32,
    pub data: Vec<u8>,
}

/// 已确认的分片
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedPart {
    pub part_number: u32,
    /// 传输方返回的确认标签
    pub tag: String,
}

/// 合并完成后的文件记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub file_id: String,
    pub file_name: String,
    pub size: u64,
    pub location: String,
    pub created_at: i64,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// 分片进度回调，参数为该分片已发送的字节数
pub type ChunkProgressFn = Arc<dyn Fn(u64) + Send + Sync>;

/// 上传授权提供方
///
/// 实现必须可以安全重试（每次重试都会重新申请句柄）
#[async_trait]
pub trait AuthorizationProvider: Send + Sync {
    async fn request_upload(&self, request: &UploadRequest) -> anyhow::Result<UploadAuthorization>;
}

/// 分片传输
///
/// 实现应在 `cancel` 触发后尽快返回；忽略取消的实现，其结果会被丢弃
#[async_trait]
pub trait ChunkTransport: Send + Sync {
    async fn put_chunk(
        &self,
        chunk: ChunkUpload,
        on_progress: ChunkProgressFn,
        cancel: CancellationToken,
    ) -> anyhow::Result<String>;
}

/// 分片合并
#[async_trait]
pub trait Finalizer: Send + Sync {
    /// `parts` 按分片序号升序
    async fn complete(&self, upload_handle: &str, parts: &[CompletedPart])
        -> anyhow::Result<FileRecord>;

    /// 放弃上传（尽力而为，失败只记录日志）
    async fn abort(&self, upload_handle: &str) -> anyhow::Result<()>;
}

/// 三个协作方的集合
#[derive(Clone)]
pub struct RemoteServices {
    pub authorizer: Arc<dyn AuthorizationProvider>,
    pub transport: Arc<dyn ChunkTransport>,
    pub finalizer: Arc<dyn Finalizer>,
}

impl RemoteServices {
    pub fn new(
        authorizer: Arc<dyn AuthorizationProvider>,
        transport: Arc<dyn ChunkTransport>,
        finalizer: Arc<dyn Finalizer>,
    ) -> Self {
        Self {
            authorizer,
            transport,
            finalizer,
        }
    }

    /// 同一个对象同时实现三个接口时使用
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: AuthorizationProvider + ChunkTransport + Finalizer + 'static,
    {
        Self {
            authorizer: store.clone(),
            transport: store.clone(),
            finalizer: store,
        }
    }
}

impl fmt::Debug for RemoteServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteServices").finish_non_exhaustive()
    }
}
