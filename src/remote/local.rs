// 本地文件系统对象存储
//
// 同时实现授权、分片传输和合并三个接口，供命令行工具和集成测试使用：
// - 分片暂存在 <root>/.staging/<handle>/part-NNNNN
// - 确认标签为分片内容的 MD5
// - 合并时校验标签并按分片序号拼接到 <root>/<session>/<file_name>

use super::{
    AuthorizationProvider, ChunkProgressFn, ChunkTransport, ChunkUpload, CompletedPart,
    FileRecord, Finalizer, UploadAuthorization, UploadRequest,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 暂存目录名
const STAGING_DIR: &str = ".staging";

/// 单次写入块大小，每写完一块上报一次进度
const WRITE_BLOCK_SIZE: usize = 256 * 1024;

/// 进行中的分片上传
#[derive(Debug, Clone)]
struct PendingUpload {
    request: UploadRequest,
    staging_dir: PathBuf,
}

/// 本地对象存储
#[derive(Debug)]
pub struct LocalObjectStore {
    root: PathBuf,
    suggested_chunk_size: u64,
    pending: DashMap<String, PendingUpload>,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>, suggested_chunk_size: u64) -> Self {
        Self {
            root: root.into(),
            suggested_chunk_size: suggested_chunk_size.max(1),
            pending: DashMap::new(),
        }
    }

    /// 进行中的上传数量
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn part_path(staging_dir: &Path, part_number: u32) -> PathBuf {
        staging_dir.join(format!("part-{:05}", part_number))
    }

    fn pending_upload(&self, upload_handle: &str) -> Result<PendingUpload> {
        self.pending
            .get(upload_handle)
            .map(|p| p.clone())
            .ok_or_else(|| anyhow::anyhow!("上传句柄不存在: {}", upload_handle))
    }
}

/// 只保留文件名部分，防止路径穿越
fn sanitize_name(name: &str) -> Option<String> {
    let name = Path::new(name).file_name()?.to_str()?.trim();
    if name.is_empty() || name == "." || name == ".." {
        None
    } else {
        Some(name.to_string())
    }
}

#[async_trait]
impl AuthorizationProvider for LocalObjectStore {
    async fn request_upload(&self, request: &UploadRequest) -> Result<UploadAuthorization> {
        let file_name = sanitize_name(&request.file_name)
            .ok_or_else(|| anyhow::anyhow!("非法文件名: {:?}", request.file_name))?;
        sanitize_name(&request.session_id)
            .ok_or_else(|| anyhow::anyhow!("非法会话ID: {:?}", request.session_id))?;

        let upload_handle = Uuid::new_v4().to_string();
        let staging_dir = self.root.join(STAGING_DIR).join(&upload_handle);
        fs::create_dir_all(&staging_dir)
            .await
            .with_context(|| format!("创建暂存目录失败: {:?}", staging_dir))?;

        let mut request = request.clone();
        request.file_name = file_name;
        self.pending.insert(
            upload_handle.clone(),
            PendingUpload {
                request,
                staging_dir,
            },
        );

        debug!("本地存储分配上传句柄: {}", upload_handle);
        Ok(UploadAuthorization {
            upload_handle,
            suggested_chunk_size: self.suggested_chunk_size,
        })
    }
}

#[async_trait]
impl ChunkTransport for LocalObjectStore {
    async fn put_chunk(
        &self,
        chunk: ChunkUpload,
        on_progress: ChunkProgressFn,
        cancel: CancellationToken,
    ) -> Result<String> {
        let pending = self.pending_upload(&chunk.upload_handle)?;
        let path = Self::part_path(&pending.staging_dir, chunk.part_number);

        let mut file = fs::File::create(&path)
            .await
            .with_context(|| format!("创建分片文件失败: {:?}", path))?;

        let mut written = 0usize;
        for block in chunk.data.chunks(WRITE_BLOCK_SIZE) {
            if cancel.is_cancelled() {
                anyhow::bail!("分片 #{} 写入已取消", chunk.part_number);
            }
            file.write_all(block).await.context("写入分片数据失败")?;
            written += block.len();
            on_progress(written as u64);
        }
        file.flush().await.context("刷新分片文件失败")?;

        Ok(format!("{:x}", md5::compute(&chunk.data)))
    }
}

#[async_trait]
impl Finalizer for LocalObjectStore {
    async fn complete(&self, upload_handle: &str, parts: &[CompletedPart]) -> Result<FileRecord> {
        let pending = self.pending_upload(upload_handle)?;

        for (expected, part) in (1u32..).zip(parts) {
            if part.part_number != expected {
                anyhow::bail!(
                    "分片序号不连续: 期望 #{}, 实际 #{}",
                    expected,
                    part.part_number
                );
            }
        }

        let target_dir = self.root.join(&pending.request.session_id);
        fs::create_dir_all(&target_dir)
            .await
            .with_context(|| format!("创建目标目录失败: {:?}", target_dir))?;
        let target = target_dir.join(&pending.request.file_name);
        let temp = target_dir.join(format!(".{}.{}", pending.request.file_name, upload_handle));

        let mut output = fs::File::create(&temp)
            .await
            .with_context(|| format!("创建目标文件失败: {:?}", temp))?;
        let mut size = 0u64;
        for part in parts {
            let data = fs::read(Self::part_path(&pending.staging_dir, part.part_number))
                .await
                .with_context(|| format!("读取分片 #{} 失败", part.part_number))?;
            let digest = format!("{:x}", md5::compute(&data));
            if digest != part.tag {
                let _ = fs::remove_file(&temp).await;
                anyhow::bail!(
                    "分片 #{} 校验失败: 期望 {}, 实际 {}",
                    part.part_number,
                    part.tag,
                    digest
                );
            }
            output.write_all(&data).await.context("写入目标文件失败")?;
            size += data.len() as u64;
        }
        output.flush().await.context("刷新目标文件失败")?;
        drop(output);

        if size != pending.request.file_size {
            let _ = fs::remove_file(&temp).await;
            anyhow::bail!(
                "合并后大小不符: 期望 {} bytes, 实际 {} bytes",
                pending.request.file_size,
                size
            );
        }

        fs::rename(&temp, &target)
            .await
            .with_context(|| format!("移动目标文件失败: {:?}", target))?;
        self.pending.remove(upload_handle);
        if let Err(e) = fs::remove_dir_all(&pending.staging_dir).await {
            warn!("清理暂存目录失败: {:?}, 错误: {}", pending.staging_dir, e);
        }

        info!("本地存储合并完成: {:?} ({} bytes)", target, size);
        Ok(FileRecord {
            file_id: upload_handle.to_string(),
            file_name: pending.request.file_name.clone(),
            size,
            location: target.to_string_lossy().to_string(),
            created_at: chrono::Utc::now().timestamp(),
            metadata: serde_json::json!({
                "session_id": pending.request.session_id,
                "content_type": pending.request.content_type,
                "parts": parts.len(),
            }),
        })
    }

    async fn abort(&self, upload_handle: &str) -> Result<()> {
        let Some((_, pending)) = self.pending.remove(upload_handle) else {
            return Ok(());
        };
        match fs::remove_dir_all(&pending.staging_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("清理暂存目录失败: {:?}", pending.staging_dir)
                })
            }
        }
        debug!("本地存储已放弃上传: {}", upload_handle);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    fn request(name: &str, size: u64) -> UploadRequest {
        UploadRequest {
            file_name: name.to_string(),
            file_size: size,
            content_type: "application/octet-stream".to_string(),
            session_id: "session-1".to_string(),
        }
    }

    fn no_progress() -> ChunkProgressFn {
        Arc::new(|_| {})
    }

    async fn put(store: &LocalObjectStore, handle: &str, part: u32, data: &[u8]) -> String {
        store
            .put_chunk(
                ChunkUpload {
                    upload_handle: handle.to_string(),
                    part_number: part,
                    data: data.to_vec(),
                },
                no_progress(),
                CancellationToken::new(),
            )
            .await
            .unwrap()
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("a.txt").as_deref(), Some("a.txt"));
        assert_eq!(sanitize_name("../../etc/passwd").as_deref(), Some("passwd"));
        assert_eq!(sanitize_name(".."), None);
        assert_eq!(sanitize_name(""), None);
    }

    #[tokio::test]
    async fn test_upload_out_of_order_and_complete() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path(), 4);
        let auth = store.request_upload(&request("data.bin", 10)).await.unwrap();
        assert_eq!(auth.suggested_chunk_size, 4);

        let tag3 = put(&store, &auth.upload_handle, 3, b"89").await;
        let tag1 = put(&store, &auth.upload_handle, 1, b"0123").await;
        let tag2 = put(&store, &auth.upload_handle, 2, b"4567").await;

        let parts = vec![
            CompletedPart { part_number: 1, tag: tag1 },
            CompletedPart { part_number: 2, tag: tag2 },
            CompletedPart { part_number: 3, tag: tag3 },
        ];
        let record = store.complete(&auth.upload_handle, &parts).await.unwrap();

        assert_eq!(record.size, 10);
        assert_eq!(record.file_name, "data.bin");
        let content = std::fs::read(dir.path().join("session-1").join("data.bin")).unwrap();
        assert_eq!(content, b"0123456789");
        assert_eq!(store.pending_count(), 0);
        assert!(!dir.path().join(STAGING_DIR).join(&auth.upload_handle).exists());
    }

    #[tokio::test]
    async fn test_complete_rejects_bad_tag() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path(), 4);
        let auth = store.request_upload(&request("x.bin", 4)).await.unwrap();
        put(&store, &auth.upload_handle, 1, b"abcd").await;

        let parts = vec![CompletedPart {
            part_number: 1,
            tag: "bogus".to_string(),
        }];
        let err = store.complete(&auth.upload_handle, &parts).await.unwrap_err();
        assert!(err.to_string().contains("校验失败"));
    }

    #[tokio::test]
    async fn test_complete_rejects_gap() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path(), 4);
        let auth = store.request_upload(&request("x.bin", 8)).await.unwrap();
        let tag = put(&store, &auth.upload_handle, 2, b"abcd").await;

        let parts = vec![CompletedPart { part_number: 2, tag }];
        assert!(store.complete(&auth.upload_handle, &parts).await.is_err());
    }

    #[tokio::test]
    async fn test_progress_and_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path(), 1024 * 1024);
        let auth = store.request_upload(&request("big.bin", 600_000)).await.unwrap();

        let reported = Arc::new(AtomicU64::new(0));
        let reported_clone = reported.clone();
        let progress: ChunkProgressFn = Arc::new(move |n| {
            reported_clone.store(n, Ordering::SeqCst);
        });
        let chunk = ChunkUpload {
            upload_handle: auth.upload_handle.clone(),
            part_number: 1,
            data: vec![7u8; 600_000],
        };
        store
            .put_chunk(chunk.clone(), progress, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(reported.load(Ordering::SeqCst), 600_000);

        let token = CancellationToken::new();
        token.cancel();
        assert!(store.put_chunk(chunk, no_progress(), token).await.is_err());
    }

    #[tokio::test]
    async fn test_abort_removes_staging() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path(), 4);
        let auth = store.request_upload(&request("x.bin", 4)).await.unwrap();
        put(&store, &auth.upload_handle, 1, b"abcd").await;

        store.abort(&auth.upload_handle).await.unwrap();
        assert!(!dir.path().join(STAGING_DIR).join(&auth.upload_handle).exists());
        assert_eq!(store.pending_count(), 0);

        // 重复放弃不报错
        store.abort(&auth.upload_handle).await.unwrap();
    }
}
