use proptest::prelude::*;
use upload_queue::network::NetworkTier;
use upload_queue::uploader::{effective_chunk_size, UploadChunkManager};

proptest! {
    #[test]
    fn chunks_cover_file_without_gaps(total in 1u64..5_000_000, chunk_size in 1u64..1_000_000) {
        let manager = UploadChunkManager::new(total, chunk_size);
        let chunks = manager.chunks();

        prop_assert_eq!(chunks.len() as u64, total.div_ceil(chunk_size));
        prop_assert_eq!(chunks[0].range.start, 0);
        prop_assert_eq!(chunks.last().unwrap().range.end, total);
        for (i, chunk) in chunks.iter().enumerate() {
            prop_assert_eq!(chunk.index, i);
            prop_assert_eq!(chunk.part_number as usize, i + 1);
            prop_assert!(chunk.size() > 0 && chunk.size() <= chunk_size);
            if i + 1 < chunks.len() {
                prop_assert_eq!(chunk.size(), chunk_size);
                prop_assert_eq!(chunk.range.end, chunks[i + 1].range.start);
            }
        }
    }

    #[test]
    fn completed_parts_sorted_regardless_of_completion_order(
        total in 1u64..200_000,
        chunk_size in 1_000u64..20_000,
        seed in any::<u64>(),
    ) {
        let mut manager = UploadChunkManager::new(total, chunk_size);
        let mut order: Vec<usize> = (0..manager.chunk_count()).collect();
        // 简单的确定性洗牌
        let mut state = seed | 1;
        for i in (1..order.len()).rev() {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            order.swap(i, (state % (i as u64 + 1)) as usize);
        }
        for index in order {
            manager.mark_completed(index, format!("tag-{}", index));
        }

        prop_assert!(manager.is_completed());
        prop_assert_eq!(manager.uploaded_bytes(), total);
        let parts: Vec<u32> = manager.completed_parts().iter().map(|p| p.part_number).collect();
        let expected: Vec<u32> = (1..=manager.chunk_count() as u32).collect();
        prop_assert_eq!(parts, expected);
    }

    #[test]
    fn tier_caps_chunk_size(suggested in 1u64..100 * 1024 * 1024) {
        for tier in [NetworkTier::Constrained, NetworkTier::Reduced, NetworkTier::Standard] {
            let profile = tier.profile();
            let size = effective_chunk_size(suggested, Some(&profile));
            prop_assert!(size >= 1 && size <= suggested);
            if let Some(max) = profile.max_chunk_size {
                prop_assert!(size <= max);
            } else {
                prop_assert_eq!(size, suggested);
            }
        }
        prop_assert_eq!(effective_chunk_size(suggested, None), suggested);
    }
}
