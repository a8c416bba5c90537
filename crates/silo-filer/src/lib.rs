//! # silo-filer
//!
//! Versioned file and directory metadata over the silo chunk store.
//!
//! A file is an ordered list of chunk identifiers; a directory is an
//! ordered list of child record identifiers. Records are append-only:
//! a new version is a fresh record whose `previous` field points at the
//! one it supersedes, forming a backward version chain.
//!
//! The filer references chunks by identifier without owning them, but it
//! is responsible for the refcount bookkeeping: creating a file version
//! takes one reference per listed chunk, and a creation that fails
//! half-way releases whatever it already took before reporting the error.

pub mod record;
pub mod repo;

pub use record::{FileAttrs, FileKind, FileRecord};
pub use repo::{FileRepository, MemoryFileRepository};

use std::collections::HashSet;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, warn};

use silo_store::{id, ChunkStore, ObjectId, StorageError, StoreError};

/// Errors surfaced by filer operations.
#[derive(Error, Debug)]
pub enum FilerError {
    /// No record stored under the identifier. Not retryable.
    #[error("file record not found: {0}")]
    NotFound(String),

    /// A record already exists under the identifier. Records are
    /// append-only; pick a fresh version id instead.
    #[error("file record already exists: {0}")]
    Exists(String),

    /// Creation named a chunk or child record that is not stored. Any
    /// partial refcount changes have been rolled back.
    #[error("missing reference: {0}")]
    Reference(String),

    /// A version chain revisited an identifier. Fatal for the traversal.
    #[error("version chain cycle at {0}")]
    Cycle(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// The backing repository failed or timed out. Retryable.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, FilerError>;

/// The file metadata service.
pub struct Filer {
    repo: Arc<dyn FileRepository>,
    chunks: Arc<ChunkStore>,
}

impl Filer {
    pub fn new(repo: Arc<dyn FileRepository>, chunks: Arc<ChunkStore>) -> Self {
        Self { repo, chunks }
    }

    /// Filer over a fresh [`MemoryFileRepository`].
    pub fn in_memory(chunks: Arc<ChunkStore>) -> Self {
        Self::new(Arc::new(MemoryFileRepository::new()), chunks)
    }

    /// Create a record under an externally supplied identifier.
    ///
    /// For a file, every entry must name a stored chunk and one reference
    /// is taken per entry (ownership of those references transfers to the
    /// new version). For a directory, every entry must name an existing
    /// record; chunk refcounts are untouched. `previous`, when given, must
    /// name an existing record.
    pub fn create(
        &self,
        record_id: ObjectId,
        kind: FileKind,
        attrs: FileAttrs,
        entries: Vec<ObjectId>,
        previous: Option<ObjectId>,
    ) -> Result<FileRecord> {
        if self.repo.get(&record_id)?.is_some() {
            return Err(FilerError::Exists(id::to_hex(&record_id)));
        }
        if let Some(prev) = &previous {
            if self.repo.get(prev)?.is_none() {
                return Err(FilerError::Reference(format!(
                    "previous version {} is not stored",
                    id::to_hex(prev)
                )));
            }
        }
        match kind {
            FileKind::Directory => {
                for child in &entries {
                    if self.repo.get(child)?.is_none() {
                        return Err(FilerError::Reference(format!(
                            "child record {} is not stored",
                            id::to_hex(child)
                        )));
                    }
                }
            }
            FileKind::File => self.addref_entries(&entries)?,
        }

        let record = FileRecord {
            id: record_id,
            kind,
            attrs,
            previous,
            entries,
        };
        if let Err(e) = self.repo.put(record.clone()) {
            if kind == FileKind::File {
                self.release_entries(&record.entries, record.entries.len());
            }
            return Err(e.into());
        }
        debug!(id = %id::to_hex(&record_id), ?kind, "created file record");
        Ok(record)
    }

    /// Fetch a record by identifier.
    pub fn get(&self, record_id: &ObjectId) -> Result<FileRecord> {
        self.repo
            .get(record_id)?
            .ok_or_else(|| FilerError::NotFound(id::to_hex(record_id)))
    }

    /// Create a new version of `old_id` under `new_id`.
    ///
    /// The old record is never mutated or deleted, and chunks only it
    /// references keep their counts; sweeping orphaned versions is a
    /// separate concern.
    pub fn supersede(
        &self,
        old_id: &ObjectId,
        new_id: ObjectId,
        attrs: FileAttrs,
        entries: Vec<ObjectId>,
    ) -> Result<FileRecord> {
        let old = self.get(old_id)?;
        self.create(new_id, old.kind, attrs, entries, Some(*old_id))
    }

    /// Walk the version chain from `record_id` back to the root.
    ///
    /// The iterator is lazy (one repository fetch per step) and finite:
    /// it ends at a record without `previous`, or yields one error and
    /// then stops. A revisited identifier yields [`FilerError::Cycle`];
    /// a fetch failure yields whatever the repository reported.
    pub fn history(&self, record_id: &ObjectId) -> History<'_> {
        History {
            filer: self,
            next: Some(*record_id),
            seen: HashSet::new(),
        }
    }

    /// Take one chunk reference per entry, releasing the ones already
    /// taken if any entry turns out to be missing.
    fn addref_entries(&self, entries: &[ObjectId]) -> Result<()> {
        for (taken, chunk_id) in entries.iter().enumerate() {
            if let Err(e) = self.chunks.addref(chunk_id) {
                self.release_entries(entries, taken);
                return match e {
                    StoreError::NotFound(hex) => {
                        Err(FilerError::Reference(format!("chunk {hex} is not stored")))
                    }
                    other => Err(other.into()),
                };
            }
        }
        Ok(())
    }

    /// Compensation path: deref the first `taken` entries.
    fn release_entries(&self, entries: &[ObjectId], taken: usize) {
        for chunk_id in &entries[..taken] {
            if let Err(e) = self.chunks.deref(chunk_id) {
                // Nothing left to do but record it; the reference leaks.
                warn!(chunk = %id::to_hex(chunk_id), error = %e, "rollback deref failed");
            }
        }
    }
}

/// Lazy traversal of a version chain, newest first. Restart by calling
/// [`Filer::history`] again.
pub struct History<'a> {
    filer: &'a Filer,
    next: Option<ObjectId>,
    seen: HashSet<ObjectId>,
}

impl Iterator for History<'_> {
    type Item = Result<FileRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        let record_id = self.next.take()?;
        if !self.seen.insert(record_id) {
            error!(id = %id::to_hex(&record_id), "version chain revisits a record");
            return Some(Err(FilerError::Cycle(id::to_hex(&record_id))));
        }
        match self.filer.get(&record_id) {
            Ok(record) => {
                self.next = record.previous;
                Some(Ok(record))
            }
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use silo_store::id::content_id;

    fn setup() -> (Arc<ChunkStore>, Filer) {
        let chunks = Arc::new(ChunkStore::in_memory());
        let filer = Filer::in_memory(chunks.clone());
        (chunks, filer)
    }

    fn attrs(name: &str) -> FileAttrs {
        FileAttrs {
            name: name.to_string(),
            hash: None,
            size: 0,
            mode: 0o644,
            chunk_size: 1024,
            mtime: 1_700_000_000,
            ctime: 1_700_000_000,
        }
    }

    fn put_chunk(chunks: &ChunkStore, data: &[u8]) -> ObjectId {
        let chunk_id = content_id(data);
        chunks.put(&chunk_id, data.to_vec(), None).unwrap();
        chunk_id
    }

    #[test]
    fn test_create_file_takes_chunk_references() {
        let (chunks, filer) = setup();
        let a = put_chunk(&chunks, b"aaaa");
        let b = put_chunk(&chunks, b"bbbb");

        let record = filer
            .create([1u8; 16], FileKind::File, attrs("f"), vec![a, b], None)
            .unwrap();
        assert_eq!(record.entries, vec![a, b]);
        assert_eq!(chunks.head(&a).unwrap().refcount, 2);
        assert_eq!(chunks.head(&b).unwrap().refcount, 2);
    }

    #[test]
    fn test_create_rolls_back_on_missing_chunk() {
        let (chunks, filer) = setup();
        let a = put_chunk(&chunks, b"aaaa");
        let missing = content_id(b"never stored");
        let b = put_chunk(&chunks, b"bbbb");

        let err = filer
            .create(
                [2u8; 16],
                FileKind::File,
                attrs("f"),
                vec![a, missing, b],
                None,
            )
            .unwrap_err();
        assert!(matches!(err, FilerError::Reference(_)));

        // The reference taken on `a` was released; `b` was never touched.
        assert_eq!(chunks.head(&a).unwrap().refcount, 1);
        assert_eq!(chunks.head(&b).unwrap().refcount, 1);
        assert!(matches!(filer.get(&[2u8; 16]), Err(FilerError::NotFound(_))));
    }

    #[test]
    fn test_create_duplicate_entries_count_twice() {
        let (chunks, filer) = setup();
        let a = put_chunk(&chunks, b"aaaa");

        filer
            .create([3u8; 16], FileKind::File, attrs("f"), vec![a, a], None)
            .unwrap();
        // One reference per position: 1 (put) + 2 (entries).
        assert_eq!(chunks.head(&a).unwrap().refcount, 3);
    }

    #[test]
    fn test_create_rejects_existing_id() {
        let (_, filer) = setup();
        filer
            .create([4u8; 16], FileKind::File, attrs("f"), vec![], None)
            .unwrap();
        assert!(matches!(
            filer.create([4u8; 16], FileKind::File, attrs("f"), vec![], None),
            Err(FilerError::Exists(_))
        ));
    }

    #[test]
    fn test_create_rejects_missing_previous() {
        let (_, filer) = setup();
        assert!(matches!(
            filer.create(
                [5u8; 16],
                FileKind::File,
                attrs("f"),
                vec![],
                Some([99u8; 16]),
            ),
            Err(FilerError::Reference(_))
        ));
    }

    #[test]
    fn test_directory_checks_children_not_chunks() {
        let (chunks, filer) = setup();
        let child = filer
            .create([6u8; 16], FileKind::File, attrs("child"), vec![], None)
            .unwrap();
        let chunk_id = put_chunk(&chunks, b"data");

        filer
            .create(
                [7u8; 16],
                FileKind::Directory,
                attrs("dir"),
                vec![child.id],
                None,
            )
            .unwrap();
        // Directory creation leaves chunk refcounts alone.
        assert_eq!(chunks.head(&chunk_id).unwrap().refcount, 1);

        // A directory naming a nonexistent child is rejected.
        assert!(matches!(
            filer.create(
                [8u8; 16],
                FileKind::Directory,
                attrs("dir"),
                vec![[42u8; 16]],
                None,
            ),
            Err(FilerError::Reference(_))
        ));
    }

    #[test]
    fn test_supersede_chains_versions() {
        let (_, filer) = setup();
        let v1 = filer
            .create([10u8; 16], FileKind::File, attrs("f"), vec![], None)
            .unwrap();
        let v2 = filer
            .supersede(&v1.id, [11u8; 16], attrs("f"), vec![])
            .unwrap();

        assert_eq!(v2.previous, Some(v1.id));
        assert_eq!(v2.kind, FileKind::File);
        // The old version is untouched.
        assert_eq!(filer.get(&v1.id).unwrap(), v1);
    }

    #[test]
    fn test_history_single_version() {
        let (_, filer) = setup();
        let v1 = filer
            .create([12u8; 16], FileKind::File, attrs("f"), vec![], None)
            .unwrap();

        let chain: Vec<_> = filer.history(&v1.id).collect::<Result<_>>().unwrap();
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].id, v1.id);
    }

    #[test]
    fn test_history_walks_newest_first() {
        let (_, filer) = setup();
        let mut latest = filer
            .create([20u8; 16], FileKind::File, attrs("f"), vec![], None)
            .unwrap();
        for n in 21u8..25 {
            latest = filer
                .supersede(&latest.id, [n; 16], attrs("f"), vec![])
                .unwrap();
        }

        let chain: Vec<_> = filer.history(&latest.id).collect::<Result<_>>().unwrap();
        let ids: Vec<_> = chain.iter().map(|r| r.id).collect();
        assert_eq!(
            ids,
            vec![[24u8; 16], [23u8; 16], [22u8; 16], [21u8; 16], [20u8; 16]]
        );
    }

    #[test]
    fn test_history_detects_cycle() {
        // Plant a two-record loop directly in the repository; create()
        // cannot produce one.
        let repo = Arc::new(MemoryFileRepository::new());
        let filer = Filer::new(repo.clone(), Arc::new(ChunkStore::in_memory()));
        repo.put(FileRecord {
            id: [30u8; 16],
            kind: FileKind::File,
            attrs: attrs("a"),
            previous: Some([31u8; 16]),
            entries: vec![],
        })
        .unwrap();
        repo.put(FileRecord {
            id: [31u8; 16],
            kind: FileKind::File,
            attrs: attrs("b"),
            previous: Some([30u8; 16]),
            entries: vec![],
        })
        .unwrap();

        let results: Vec<_> = filer.history(&[30u8; 16]).collect();
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(results[1].is_ok());
        assert!(matches!(results[2], Err(FilerError::Cycle(_))));
    }

    #[test]
    fn test_history_dangling_previous_is_not_found() {
        let repo = Arc::new(MemoryFileRepository::new());
        let filer = Filer::new(repo.clone(), Arc::new(ChunkStore::in_memory()));
        repo.put(FileRecord {
            id: [32u8; 16],
            kind: FileKind::File,
            attrs: attrs("a"),
            previous: Some([33u8; 16]),
            entries: vec![],
        })
        .unwrap();

        let results: Vec<_> = filer.history(&[32u8; 16]).collect();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(FilerError::NotFound(_))));
    }

    #[test]
    fn test_history_restarts_from_scratch() {
        let (_, filer) = setup();
        let v1 = filer
            .create([40u8; 16], FileKind::File, attrs("f"), vec![], None)
            .unwrap();
        let v2 = filer
            .supersede(&v1.id, [41u8; 16], attrs("f"), vec![])
            .unwrap();

        assert_eq!(filer.history(&v2.id).count(), 2);
        // A fresh iterator walks the same chain again.
        assert_eq!(filer.history(&v2.id).count(), 2);
    }
}
