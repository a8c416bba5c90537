//! Chunk entity.

use serde::{Deserialize, Serialize};

use crate::id::ObjectId;

/// A stored chunk: content bytes plus store bookkeeping.
///
/// `data` is immutable once stored under an id; only `refcount` changes
/// over a chunk's lifetime. `parity` is redundancy data carried opaquely
/// for future erasure coding; the store never computes or inspects it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Content-derived identifier. Primary key.
    pub id: ObjectId,
    /// Rolling checksum of `data`, for cheap pre-comparison.
    pub weaksum: u32,
    pub data: Vec<u8>,
    pub parity: Option<Vec<u8>>,
    /// Live references. A stored chunk always has `refcount >= 1`.
    pub refcount: u64,
}

impl Chunk {
    pub fn meta(&self) -> ChunkMeta {
        ChunkMeta {
            length: self.data.len() as u64,
            weaksum: self.weaksum,
            refcount: self.refcount,
            parity: self.parity.clone(),
        }
    }
}

/// Everything `head` reveals about a chunk without shipping its bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMeta {
    pub length: u64,
    pub weaksum: u32,
    pub refcount: u64,
    pub parity: Option<Vec<u8>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weaksum::weaksum;

    #[test]
    fn test_meta_mirrors_chunk() {
        let data = b"payload".to_vec();
        let chunk = Chunk {
            id: [7u8; 16],
            weaksum: weaksum(&data),
            data,
            parity: None,
            refcount: 3,
        };
        let meta = chunk.meta();
        assert_eq!(meta.length, 7);
        assert_eq!(meta.weaksum, chunk.weaksum);
        assert_eq!(meta.refcount, 3);
        assert!(meta.parity.is_none());
    }
}
