//! Chunk Calculator — pure arithmetic mapping a logical byte offset to a
//! chunk index and in-chunk position, and back.

use crate::marfs::xattr::{ObjType, Post};

/// Position within the chunk sequence: which chunk, how far into its
/// data region, and how many data bytes remain in that chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPosition {
    pub chunk: u64,
    pub chunk_offset: u64,
    pub chunk_remain: u64,
}

/// `chunk_size - sizeof(RecoveryInfo) - 8` for Uni/Multi, or
/// `chunk_size - (post.chunks * recovery)` for Packed.
pub fn data_per_chunk(chunk_size: u64, recovery: u64, post: Option<&Post>) -> u64 {
    match post {
        Some(post) if post.obj_type == ObjType::Packed => chunk_size - post.chunks * recovery,
        _ => chunk_size - recovery,
    }
}

/// Map a logical offset to `(chunk, chunk_offset, chunk_remain)`. `phy_offset`
/// folds in `POST.obj_offset` for Packed files; it is zero otherwise.
pub fn locate(logical_offset: u64, data_per_chunk: u64, phy_offset: u64) -> ChunkPosition {
    let lo = logical_offset + phy_offset;
    let mut chunk = lo / data_per_chunk;
    let mut chunk_offset = lo % data_per_chunk;

    // Exactly at a chunk boundary: a zero-byte read/write at the logical end
    // of a chunk belongs to that chunk, not the next one.
    if chunk_offset == 0 && chunk > 0 {
        chunk -= 1;
        chunk_offset = data_per_chunk;
    }

    ChunkPosition {
        chunk,
        chunk_offset,
        chunk_remain: data_per_chunk - chunk_offset,
    }
}

/// The logical offset at which chunk `chunk` ends: `(chunk+1) * data_per_chunk`.
pub fn chunk_logical_end(chunk: u64, data_per_chunk: u64) -> u64 {
    (chunk + 1) * data_per_chunk
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_per_chunk_uni() {
        assert_eq!(data_per_chunk(1024, 136, None), 888);
    }

    #[test]
    fn data_per_chunk_packed_scales_with_chunk_count() {
        let post = Post {
            obj_type: ObjType::Packed,
            chunks: 3,
            obj_offset: 0,
            chunk_info_bytes: 0,
        };
        assert_eq!(data_per_chunk(1024, 100, Some(&post)), 1024 - 300);
    }

    #[test]
    fn locate_middle_of_first_chunk() {
        let pos = locate(50, 888, 0);
        assert_eq!(pos.chunk, 0);
        assert_eq!(pos.chunk_offset, 50);
        assert_eq!(pos.chunk_remain, 838);
    }

    #[test]
    fn locate_exact_chunk_boundary_backs_up() {
        // lo == data_per_chunk exactly: stays in chunk 0, at its logical end.
        let pos = locate(888, 888, 0);
        assert_eq!(pos.chunk, 0);
        assert_eq!(pos.chunk_offset, 888);
        assert_eq!(pos.chunk_remain, 0);
    }

    #[test]
    fn locate_just_past_boundary_advances_chunk() {
        let pos = locate(889, 888, 0);
        assert_eq!(pos.chunk, 1);
        assert_eq!(pos.chunk_offset, 1);
    }

    #[test]
    fn locate_applies_packed_phy_offset() {
        let pos = locate(10, 888, 100);
        assert_eq!(pos.chunk, 0);
        assert_eq!(pos.chunk_offset, 110);
    }

    #[test]
    fn chunk_logical_end_is_exclusive_upper_bound() {
        assert_eq!(chunk_logical_end(0, 888), 888);
        assert_eq!(chunk_logical_end(1, 888), 1776);
    }
}
