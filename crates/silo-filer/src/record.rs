//! File and directory records.

use serde::{Deserialize, Serialize};

use silo_store::ObjectId;

/// Discriminates the two record shapes sharing one entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileKind {
    File,
    Directory,
}

/// Caller-supplied metadata carried through the filer unchanged. The core
/// never interprets these fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttrs {
    /// Display name. Not unique; versions of one logical file share it.
    pub name: String,
    /// Digest of the full reconstructed content. `None` for directories.
    pub hash: Option<ObjectId>,
    pub size: u64,
    pub mode: u32,
    /// Chunking granularity the content was split with.
    pub chunk_size: u32,
    pub mtime: i64,
    pub ctime: i64,
}

/// One immutable version of a file or directory.
///
/// `entries` holds chunk identifiers for a file (concatenation in order
/// reconstructs the content) or child record identifiers for a directory.
/// These are weak references: the filer addrefs/derefs chunks explicitly
/// and never owns their lifecycle. `previous` chains versions backward;
/// the chain is acyclic by construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Unique per version. Primary key.
    pub id: ObjectId,
    pub kind: FileKind,
    pub attrs: FileAttrs,
    pub previous: Option<ObjectId>,
    pub entries: Vec<ObjectId>,
}

impl FileRecord {
    pub fn is_directory(&self) -> bool {
        self.kind == FileKind::Directory
    }
}
