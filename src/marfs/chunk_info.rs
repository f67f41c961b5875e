//! `ChunkInfo` record: the fixed-size entry packed into the MDFS file of a
//! Multi-layout write, one per object chunk.

use crate::marfs::error::{Error, Result};

pub const CHUNK_INFO_SIZE: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkInfo {
    pub seq: u64,
    pub logical_offset: u64,
    pub length: u64,
}

impl ChunkInfo {
    pub fn to_bytes(&self) -> [u8; CHUNK_INFO_SIZE] {
        let mut buf = [0u8; CHUNK_INFO_SIZE];
        buf[0..8].copy_from_slice(&self.seq.to_le_bytes());
        buf[8..16].copy_from_slice(&self.logical_offset.to_le_bytes());
        buf[16..24].copy_from_slice(&self.length.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<ChunkInfo> {
        if buf.len() != CHUNK_INFO_SIZE {
            return Err(Error::Layout("malformed ChunkInfo record"));
        }
        Ok(ChunkInfo {
            seq: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            logical_offset: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            length: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_bytes() {
        let info = ChunkInfo {
            seq: 3,
            logical_offset: 2_097_152,
            length: 888,
        };
        assert_eq!(ChunkInfo::from_bytes(&info.to_bytes()).unwrap(), info);
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(ChunkInfo::from_bytes(&[0u8; 10]).is_err());
    }
}
