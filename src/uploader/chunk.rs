// 上传分片管理
//
// 分片规则：
// - 分片大小 = 授权返回的建议大小，开启网络调优时再受网络分级上限约束
// - 分片序号从 1 开始，与分片索引一一对应（part_number = index + 1）
// - 最后一个分片可以小于分片大小

use crate::network::TierProfile;
use crate::remote::CompletedPart;
use crate::uploader::source::UploadSource;
use anyhow::{Context, Result};
use std::ops::Range;
use tracing::{debug, info};

/// 计算实际分片大小
///
/// `profile` 为 None 表示未开启网络调优
pub fn effective_chunk_size(suggested: u64, profile: Option<&TierProfile>) -> u64 {
    match profile {
        Some(profile) => profile.cap_chunk_size(suggested),
        None => suggested.max(1),
    }
}

/// 上传分片信息
#[derive(Debug, Clone)]
pub struct UploadChunk {
    /// 分片索引
    pub index: usize,
    /// 分片序号（从 1 开始）
    pub part_number: u32,
    /// 字节范围
    pub range: Range<u64>,
    /// 是否已完成
    pub completed: bool,
    /// 是否正在上传（防止重复调度）
    pub uploading: bool,
    /// 传输方返回的确认标签
    pub tag: Option<String>,
}

impl UploadChunk {
    pub fn new(index: usize, range: Range<u64>) -> Self {
        Self {
            index,
            part_number: index as u32 + 1,
            range,
            completed: false,
            uploading: false,
            tag: None,
        }
    }

    /// 分片大小
    pub fn size(&self) -> u64 {
        self.range.end - self.range.start
    }

    /// 从上传源读取分片数据
    pub async fn read_data(&self, source: &dyn UploadSource) -> Result<Vec<u8>> {
        let data = source
            .read_range(self.range.clone())
            .await
            .with_context(|| format!("读取分片 #{} 数据失败", self.part_number))?;

        if data.len() as u64 != self.size() {
            anyhow::bail!(
                "分片 #{} 数据长度不符: 期望 {} bytes, 实际 {} bytes",
                self.part_number,
                self.size(),
                data.len()
            );
        }

        debug!(
            "读取分片 #{}: bytes={}-{}, 大小={} bytes",
            self.part_number,
            self.range.start,
            self.range.end - 1,
            data.len()
        );
        Ok(data)
    }
}

/// 上传分片管理器
#[derive(Debug)]
pub struct UploadChunkManager {
    chunks: Vec<UploadChunk>,
}

impl UploadChunkManager {
    pub fn new(total_size: u64, chunk_size: u64) -> Self {
        let chunk_size = chunk_size.max(1);
        let chunks = Self::calculate_chunks(total_size, chunk_size);

        info!(
            "创建上传分片管理器: 文件大小={} bytes, 分片大小={} bytes, 分片数量={}",
            total_size,
            chunk_size,
            chunks.len()
        );
        Self { chunks }
    }

    fn calculate_chunks(total_size: u64, chunk_size: u64) -> Vec<UploadChunk> {
        let mut chunks = Vec::with_capacity(total_size.div_ceil(chunk_size) as usize);
        let mut offset = 0u64;
        let mut index = 0;

        while offset < total_size {
            let end = std::cmp::min(offset + chunk_size, total_size);
            chunks.push(UploadChunk::new(index, offset..end));
            offset = end;
            index += 1;
        }

        chunks
    }

    /// 获取下一个待上传的分片
    pub fn next_pending(&mut self) -> Option<&mut UploadChunk> {
        self.chunks
            .iter_mut()
            .find(|c| !c.completed && !c.uploading)
    }

    pub fn chunks(&self) -> &[UploadChunk] {
        &self.chunks
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn completed_count(&self) -> usize {
        self.chunks.iter().filter(|c| c.completed).count()
    }

    /// 尚未完成的分片数量
    pub fn remaining_count(&self) -> usize {
        self.chunks.iter().filter(|c| !c.completed).count()
    }

    /// 正在上传的分片数量
    pub fn in_flight_count(&self) -> usize {
        self.chunks.iter().filter(|c| c.uploading).count()
    }

    /// 已上传的字节数（仅统计已完成分片）
    pub fn uploaded_bytes(&self) -> u64 {
        self.chunks
            .iter()
            .filter(|c| c.completed)
            .map(|c| c.size())
            .sum()
    }

    /// 分片游标：第一个未完成分片的索引，全部完成时等于分片数量
    pub fn cursor(&self) -> usize {
        self.chunks
            .iter()
            .position(|c| !c.completed)
            .unwrap_or(self.chunks.len())
    }

    pub fn is_completed(&self) -> bool {
        self.chunks.iter().all(|c| c.completed)
    }

    /// 标记分片为已完成
    pub fn mark_completed(&mut self, index: usize, tag: String) {
        if let Some(chunk) = self.chunks.get_mut(index) {
            chunk.completed = true;
            chunk.uploading = false;
            chunk.tag = Some(tag);
        }
    }

    /// 标记分片正在上传（防止重复调度）
    pub fn mark_uploading(&mut self, index: usize) {
        if let Some(chunk) = self.chunks.get_mut(index) {
            chunk.uploading = true;
        }
    }

    /// 取消分片上传标记（上传失败或暂停时调用）
    pub fn unmark_uploading(&mut self, index: usize) {
        if let Some(chunk) = self.chunks.get_mut(index) {
            chunk.uploading = false;
        }
    }

    /// 清除所有正在上传标记
    pub fn unmark_all_uploading(&mut self) {
        for chunk in &mut self.chunks {
            chunk.uploading = false;
        }
    }

    /// 已完成分片列表，按分片序号升序
    pub fn completed_parts(&self) -> Vec<CompletedPart> {
        let mut parts: Vec<CompletedPart> = self
            .chunks
            .iter()
            .filter(|c| c.completed)
            .filter_map(|c| {
                c.tag.clone().map(|tag| CompletedPart {
                    part_number: c.part_number,
                    tag,
                })
            })
            .collect();
        parts.sort_by_key(|p| p.part_number);
        parts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::NetworkTier;
    use crate::uploader::source::MemorySource;

    const MB: u64 = 1024 * 1024;

    #[test]
    fn test_chunk_creation() {
        let chunk = UploadChunk::new(0, 0..1024);
        assert_eq!(chunk.index, 0);
        assert_eq!(chunk.part_number, 1);
        assert_eq!(chunk.size(), 1024);
        assert!(!chunk.completed);
        assert!(!chunk.uploading);
    }

    #[test]
    fn test_chunk_calculation() {
        let manager = UploadChunkManager::new(16 * MB, 4 * MB);
        assert_eq!(manager.chunk_count(), 4);
        assert_eq!(manager.chunks()[3].range, (12 * MB)..(16 * MB));
        assert_eq!(manager.chunks()[3].part_number, 4);

        // 不完整的最后一个分片
        let manager = UploadChunkManager::new(17 * MB, 4 * MB);
        assert_eq!(manager.chunk_count(), 5);
        assert_eq!(manager.chunks()[4].size(), MB);

        // 小于分片大小的文件只有一个分片
        let manager = UploadChunkManager::new(100, 4 * MB);
        assert_eq!(manager.chunk_count(), 1);
        assert_eq!(manager.chunks()[0].range, 0..100);
    }

    #[test]
    fn test_next_pending_skips_uploading() {
        let mut manager = UploadChunkManager::new(16 * MB, 4 * MB);
        manager.mark_uploading(0);
        assert_eq!(manager.next_pending().unwrap().index, 1);
        assert_eq!(manager.in_flight_count(), 1);

        manager.unmark_uploading(0);
        assert_eq!(manager.next_pending().unwrap().index, 0);
    }

    #[test]
    fn test_cursor_and_progress() {
        let mut manager = UploadChunkManager::new(16 * MB, 4 * MB);
        assert_eq!(manager.cursor(), 0);

        manager.mark_completed(0, "a".to_string());
        manager.mark_completed(2, "c".to_string());
        assert_eq!(manager.cursor(), 1);
        assert_eq!(manager.uploaded_bytes(), 8 * MB);
        assert_eq!(manager.remaining_count(), 2);

        manager.mark_completed(1, "b".to_string());
        manager.mark_completed(3, "d".to_string());
        assert_eq!(manager.cursor(), 4);
        assert!(manager.is_completed());
    }

    #[test]
    fn test_completed_parts_sorted_regardless_of_order() {
        let mut manager = UploadChunkManager::new(16 * MB, 4 * MB);
        for index in [2, 0, 3, 1] {
            manager.mark_completed(index, format!("tag-{}", index + 1));
        }

        let parts = manager.completed_parts();
        let numbers: Vec<u32> = parts.iter().map(|p| p.part_number).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4]);
        assert_eq!(parts[0].tag, "tag-1");
    }

    #[test]
    fn test_effective_chunk_size() {
        let constrained = NetworkTier::Constrained.profile();
        assert_eq!(effective_chunk_size(8 * MB, Some(&constrained)), 5 * MB);
        assert_eq!(effective_chunk_size(8 * MB, None), 8 * MB);
        assert_eq!(effective_chunk_size(0, None), 1);
    }

    #[tokio::test]
    async fn test_read_data_from_source() {
        let source = MemorySource::new("a.bin", (0u8..10).collect());
        let manager = UploadChunkManager::new(10, 4);
        let data = manager.chunks()[2].read_data(&source).await.unwrap();
        assert_eq!(data, vec![8, 9]);
    }
}
