// 上传源
//
// 引擎通过 UploadSource 按字节范围读取文件内容，不关心数据来自磁盘还是内存

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::io::{Read, Seek, SeekFrom};
use std::ops::Range;
use std::path::{Path, PathBuf};

/// 上传源
#[async_trait]
pub trait UploadSource: Send + Sync {
    /// 文件名（不含目录）
    fn name(&self) -> &str;

    /// 文件大小 (bytes)
    fn size(&self) -> u64;

    fn content_type(&self) -> &str {
        "application/octet-stream"
    }

    /// 读取指定字节范围
    async fn read_range(&self, range: Range<u64>) -> Result<Vec<u8>>;
}

/// 根据扩展名猜测内容类型
pub fn guess_content_type(name: &str) -> &'static str {
    let ext = Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("txt") | Some("log") => "text/plain",
        Some("json") => "application/json",
        Some("html") | Some("htm") => "text/html",
        Some("csv") => "text/csv",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        Some("gz") => "application/gzip",
        Some("mp4") => "video/mp4",
        Some("mp3") => "audio/mpeg",
        _ => "application/octet-stream",
    }
}

/// 本地文件上传源
#[derive(Debug, Clone)]
pub struct LocalFileSource {
    path: PathBuf,
    name: String,
    size: u64,
    content_type: &'static str,
}

impl LocalFileSource {
    /// 打开本地文件（读取元数据）
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let metadata = tokio::fs::metadata(&path)
            .await
            .with_context(|| format!("无法读取文件信息: {:?}", path))?;
        if !metadata.is_file() {
            anyhow::bail!("不是普通文件: {:?}", path);
        }

        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.to_string())
            .ok_or_else(|| anyhow::anyhow!("无法获取文件名: {:?}", path))?;
        let content_type = guess_content_type(&name);

        Ok(Self {
            path,
            name,
            size: metadata.len(),
            content_type,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl UploadSource for LocalFileSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn content_type(&self) -> &str {
        self.content_type
    }

    async fn read_range(&self, range: Range<u64>) -> Result<Vec<u8>> {
        let path = self.path.clone();
        let start = range.start;
        let len = range.end.saturating_sub(range.start) as usize;

        tokio::task::spawn_blocking(move || {
            let mut file =
                std::fs::File::open(&path).with_context(|| format!("无法打开文件: {:?}", path))?;
            file.seek(SeekFrom::Start(start))?;

            let mut buffer = vec![0u8; len];
            file.read_exact(&mut buffer)?;

            Ok(buffer)
        })
        .await?
    }
}

/// 内存上传源
#[derive(Debug, Clone)]
pub struct MemorySource {
    name: String,
    data: std::sync::Arc<Vec<u8>>,
    content_type: String,
}

impl MemorySource {
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> Self {
        let name = name.into();
        let content_type = guess_content_type(&name).to_string();
        Self {
            name,
            data: std::sync::Arc::new(data),
            content_type,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }
}

#[async_trait]
impl UploadSource for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn content_type(&self) -> &str {
        &self.content_type
    }

    async fn read_range(&self, range: Range<u64>) -> Result<Vec<u8>> {
        let len = self.data.len() as u64;
        if range.start > range.end || range.end > len {
            anyhow::bail!("读取范围越界: {:?}, 数据长度 {}", range, len);
        }
        Ok(self.data[range.start as usize..range.end as usize].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_guess_content_type() {
        assert_eq!(guess_content_type("a.PNG"), "image/png");
        assert_eq!(guess_content_type("notes.txt"), "text/plain");
        assert_eq!(guess_content_type("noext"), "application/octet-stream");
    }

    #[tokio::test]
    async fn test_memory_source_ranges() {
        let source = MemorySource::new("x.bin", vec![1, 2, 3, 4, 5]);
        assert_eq!(source.size(), 5);
        assert_eq!(source.read_range(1..3).await.unwrap(), vec![2, 3]);
        assert!(source.read_range(3..9).await.is_err());
    }

    #[tokio::test]
    async fn test_local_file_source() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        file.write_all(b"0123456789").unwrap();
        file.flush().unwrap();

        let source = LocalFileSource::open(file.path()).await.unwrap();
        assert_eq!(source.size(), 10);
        assert_eq!(source.content_type(), "application/json");
        assert_eq!(source.read_range(4..7).await.unwrap(), b"456".to_vec());
        assert!(source.read_range(8..20).await.is_err());
    }

    #[tokio::test]
    async fn test_local_file_source_rejects_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(LocalFileSource::open(dir.path()).await.is_err());
    }
}
