//! # silo-store
//!
//! Content-addressed chunk store with reference counting.
//!
//! Chunks are keyed by a 128-bit content-derived identifier (32 hex chars
//! on the wire). Identical content maps to the same identifier, so the
//! store holds exactly one copy no matter how many owners reference it; a
//! per-chunk reference count tracks liveness and the chunk is dropped when
//! the count reaches zero.
//!
//! ## Lifecycle per identifier
//!
//! ```text
//! Absent  --put-->            Live(1)
//! Live(n) --put/addref-->     Live(n+1)
//! Live(n>1) --deref-->        Live(n-1)
//! Live(1) --deref-->          Absent      (data dropped)
//! ```
//!
//! All mutations for one identifier are serialized through a sharded lock
//! table, so concurrent put/addref/deref observe each other's post-state
//! and no update is lost. Persistence sits behind [`ChunkRepository`].

pub mod chunk;
pub mod id;
pub mod repo;
pub mod weaksum;

pub use chunk::{Chunk, ChunkMeta};
pub use id::ObjectId;
pub use repo::{ChunkRepository, MemoryChunkRepository, StorageError};

use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, error};

/// Errors surfaced by store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Malformed identifier string. Caller error, not retryable.
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// No chunk stored under the identifier. Not retryable.
    #[error("chunk not found: {0}")]
    NotFound(String),

    /// The store observed a state its invariants forbid. Fatal for the
    /// operation; never silently repaired.
    #[error("consistency violation: {0}")]
    Consistency(String),

    /// The backing repository failed or timed out. Retryable.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Outcome of a deref: the chunk either stays live with the decremented
/// count, or has just been deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deref {
    Live(u64),
    Deleted,
}

/// Aggregate store accounting, from a full repository sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Unique chunks stored.
    pub chunks: u64,
    /// Deduplicated payload bytes.
    pub bytes: u64,
    /// Sum of all reference counts.
    pub refs: u64,
}

const LOCK_STRIPES: usize = 128;

/// The chunk store service.
///
/// Cheap to share: wrap in an [`Arc`] and call from as many tasks or
/// threads as needed.
pub struct ChunkStore {
    repo: Arc<dyn ChunkRepository>,
    stripes: Vec<Mutex<()>>,
}

impl ChunkStore {
    pub fn new(repo: Arc<dyn ChunkRepository>) -> Self {
        Self {
            repo,
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Store over a fresh [`MemoryChunkRepository`].
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryChunkRepository::new()))
    }

    fn stripe(&self, id: &ObjectId) -> &Mutex<()> {
        &self.stripes[id[0] as usize % LOCK_STRIPES]
    }

    /// Whether a chunk is stored under `id`. Side-effect free.
    pub fn exists(&self, id: &ObjectId) -> Result<bool> {
        Ok(self.repo.get(id)?.is_some())
    }

    /// Chunk metadata without the payload bytes.
    pub fn head(&self, id: &ObjectId) -> Result<ChunkMeta> {
        self.repo
            .get(id)?
            .map(|chunk| chunk.meta())
            .ok_or_else(|| StoreError::NotFound(id::to_hex(id)))
    }

    /// Fetch a chunk, bytes included.
    pub fn get(&self, id: &ObjectId) -> Result<Chunk> {
        self.repo
            .get(id)?
            .ok_or_else(|| StoreError::NotFound(id::to_hex(id)))
    }

    /// Store content under an externally supplied identifier.
    ///
    /// First put of an id stores the bytes with `refcount = 1`. A put of an
    /// id that is already stored is an implicit addref: because the id is
    /// content-derived, the resubmitted bytes are trusted to match and are
    /// not re-compared.
    /// Returns the post-state refcount.
    pub fn put(&self, id: &ObjectId, data: Vec<u8>, parity: Option<Vec<u8>>) -> Result<u64> {
        let _guard = self.stripe(id).lock().unwrap();
        match self.repo.get(id)? {
            Some(mut chunk) => {
                chunk.refcount += 1;
                let refcount = chunk.refcount;
                self.repo.put(chunk)?;
                debug!(id = %id::to_hex(id), refcount, "put of stored chunk, addref");
                Ok(refcount)
            }
            None => {
                let chunk = Chunk {
                    id: *id,
                    weaksum: weaksum::weaksum(&data),
                    data,
                    parity,
                    refcount: 1,
                };
                self.repo.put(chunk)?;
                debug!(id = %id::to_hex(id), "stored new chunk");
                Ok(1)
            }
        }
    }

    /// Take an additional reference on a stored chunk. Returns the new
    /// refcount.
    pub fn addref(&self, id: &ObjectId) -> Result<u64> {
        let _guard = self.stripe(id).lock().unwrap();
        let mut chunk = self
            .repo
            .get(id)?
            .ok_or_else(|| StoreError::NotFound(id::to_hex(id)))?;
        chunk.refcount += 1;
        let refcount = chunk.refcount;
        self.repo.put(chunk)?;
        debug!(id = %id::to_hex(id), refcount, "addref");
        Ok(refcount)
    }

    /// Drop one reference. Deletes the chunk when the count reaches zero.
    ///
    /// A stored refcount of zero violates the store invariant; it is
    /// reported as [`StoreError::Consistency`], never clamped.
    pub fn deref(&self, id: &ObjectId) -> Result<Deref> {
        let _guard = self.stripe(id).lock().unwrap();
        let mut chunk = self
            .repo
            .get(id)?
            .ok_or_else(|| StoreError::NotFound(id::to_hex(id)))?;
        if chunk.refcount == 0 {
            error!(id = %id::to_hex(id), "stored chunk has refcount 0");
            return Err(StoreError::Consistency(format!(
                "refcount underflow for {}",
                id::to_hex(id)
            )));
        }
        chunk.refcount -= 1;
        if chunk.refcount == 0 {
            self.repo.delete(id)?;
            debug!(id = %id::to_hex(id), "deref to zero, chunk deleted");
            Ok(Deref::Deleted)
        } else {
            let refcount = chunk.refcount;
            self.repo.put(chunk)?;
            debug!(id = %id::to_hex(id), refcount, "deref");
            Ok(Deref::Live(refcount))
        }
    }

    /// Sweep the repository and total up chunk count, payload bytes and
    /// references.
    pub fn stats(&self) -> Result<StoreStats> {
        let mut stats = StoreStats::default();
        for id in self.repo.list()? {
            // A chunk may be deref'd away between list and get.
            if let Some(chunk) = self.repo.get(&id)? {
                stats.chunks += 1;
                stats.bytes += chunk.data.len() as u64;
                stats.refs += chunk.refcount;
            }
        }
        Ok(stats)
    }
}
