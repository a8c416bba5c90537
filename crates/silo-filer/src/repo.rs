//! Persistence seam for file records, mirroring the chunk repository.

use dashmap::DashMap;

use silo_store::{ObjectId, StorageError};

use crate::record::FileRecord;

/// Keyed persistence for file records, one entity per identifier.
pub trait FileRepository: Send + Sync {
    fn get(&self, id: &ObjectId) -> Result<Option<FileRecord>, StorageError>;
    fn put(&self, record: FileRecord) -> Result<(), StorageError>;
    fn delete(&self, id: &ObjectId) -> Result<(), StorageError>;
    fn list(&self) -> Result<Vec<ObjectId>, StorageError>;
}

/// In-process repository backed by a concurrent map.
#[derive(Debug, Default)]
pub struct MemoryFileRepository {
    records: DashMap<ObjectId, FileRecord>,
}

impl MemoryFileRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FileRepository for MemoryFileRepository {
    fn get(&self, id: &ObjectId) -> Result<Option<FileRecord>, StorageError> {
        Ok(self.records.get(id).map(|entry| entry.value().clone()))
    }

    fn put(&self, record: FileRecord) -> Result<(), StorageError> {
        self.records.insert(record.id, record);
        Ok(())
    }

    fn delete(&self, id: &ObjectId) -> Result<(), StorageError> {
        self.records.remove(id);
        Ok(())
    }

    fn list(&self) -> Result<Vec<ObjectId>, StorageError> {
        Ok(self.records.iter().map(|entry| *entry.key()).collect())
    }
}
