//! Persistence seam for chunks.
//!
//! The store depends only on [`ChunkRepository`]; the backing medium is an
//! implementation detail. [`MemoryChunkRepository`] is the in-process
//! reference implementation. A backend wrapping a remote or on-disk store
//! maps its failures onto [`StorageError`], which callers treat as
//! retryable.

use dashmap::DashMap;
use thiserror::Error;

use crate::chunk::Chunk;
use crate::id::ObjectId;

/// A repository call failed or timed out. Retryable; the entity state is
/// unchanged.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
}

/// Keyed persistence for chunks, one entity per identifier.
///
/// Implementations must be internally thread-safe; serialization of
/// read-modify-write sequences is the service's job, not the repository's.
pub trait ChunkRepository: Send + Sync {
    fn get(&self, id: &ObjectId) -> Result<Option<Chunk>, StorageError>;
    /// Insert or replace the chunk stored under `chunk.id`.
    fn put(&self, chunk: Chunk) -> Result<(), StorageError>;
    fn delete(&self, id: &ObjectId) -> Result<(), StorageError>;
    /// Identifiers of every stored chunk, in no particular order.
    fn list(&self) -> Result<Vec<ObjectId>, StorageError>;
}

/// In-process repository backed by a concurrent map.
#[derive(Debug, Default)]
pub struct MemoryChunkRepository {
    chunks: DashMap<ObjectId, Chunk>,
}

impl MemoryChunkRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChunkRepository for MemoryChunkRepository {
    fn get(&self, id: &ObjectId) -> Result<Option<Chunk>, StorageError> {
        Ok(self.chunks.get(id).map(|entry| entry.value().clone()))
    }

    fn put(&self, chunk: Chunk) -> Result<(), StorageError> {
        self.chunks.insert(chunk.id, chunk);
        Ok(())
    }

    fn delete(&self, id: &ObjectId) -> Result<(), StorageError> {
        self.chunks.remove(id);
        Ok(())
    }

    fn list(&self) -> Result<Vec<ObjectId>, StorageError> {
        Ok(self.chunks.iter().map(|entry| *entry.key()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: ObjectId, data: &[u8]) -> Chunk {
        Chunk {
            id,
            weaksum: crate::weaksum::weaksum(data),
            data: data.to_vec(),
            parity: None,
            refcount: 1,
        }
    }

    #[test]
    fn test_memory_repo_roundtrip() {
        let repo = MemoryChunkRepository::new();
        let id = [1u8; 16];
        assert!(repo.get(&id).unwrap().is_none());

        repo.put(chunk(id, b"abc")).unwrap();
        assert_eq!(repo.get(&id).unwrap().unwrap().data, b"abc");

        repo.delete(&id).unwrap();
        assert!(repo.get(&id).unwrap().is_none());
    }

    #[test]
    fn test_memory_repo_list() {
        let repo = MemoryChunkRepository::new();
        repo.put(chunk([1u8; 16], b"a")).unwrap();
        repo.put(chunk([2u8; 16], b"b")).unwrap();

        let mut ids = repo.list().unwrap();
        ids.sort();
        assert_eq!(ids, vec![[1u8; 16], [2u8; 16]]);
    }
}
