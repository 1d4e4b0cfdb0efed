//! Embedded ordered key-value substrate.
//!
//! The storage engine is written against the [`Kv`] trait rather than a
//! concrete store. A `Kv` instance owns a set of named *column families*,
//! each an independent ordered keyspace; write batches are atomic across
//! families, and snapshots provide a consistent view for iteration that
//! stays valid even if the family is dropped afterwards.
//!
//! Two implementations exist:
//!
//! - [`memory::MemoryKv`]: an in-memory store modelling the full substrate
//!   surface (memtables, L0 files, flushes, partial compactions). Used by
//!   tests and available as a backend for ephemeral deployments.
//! - [`fjall::FjallKv`]: a persistent LSM store where each family is a
//!   fjall partition sharing one keyspace journal.
//!
//! [`factory::create_kv`] builds either from a [`config::KvConfig`].

pub mod config;
pub mod factory;
pub mod fjall;
pub mod memory;
pub mod settings;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::util::BytesRange;

/// Cheap cloneable handle identifying a column family.
///
/// Handles are resolved by name inside each implementation; a handle for a
/// dropped family yields `KvError::NotFound` on use.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FamilyHandle {
    name: Arc<str>,
}

impl FamilyHandle {
    pub fn new(name: &str) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Errors surfaced by the substrate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvError {
    /// Underlying storage failure.
    Io(String),
    /// Data failed validation (checksum, malformed key or value).
    Corruption(String),
    /// Unknown family or key space.
    NotFound(String),
    /// Transient contention; the caller may retry.
    Busy(String),
    /// The backend cannot perform this operation.
    Unsupported(&'static str),
}

impl std::fmt::Display for KvError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KvError::Io(msg) => write!(f, "io error: {}", msg),
            KvError::Corruption(msg) => write!(f, "corruption: {}", msg),
            KvError::NotFound(what) => write!(f, "not found: {}", what),
            KvError::Busy(msg) => write!(f, "busy: {}", msg),
            KvError::Unsupported(what) => write!(f, "unsupported operation: {}", what),
        }
    }
}

impl std::error::Error for KvError {}

pub type KvResult<T> = std::result::Result<T, KvError>;

/// Durability control for a single write.
#[derive(Debug, Clone, Copy, Default)]
pub struct KvWriteOptions {
    /// Sync the write-ahead log before returning.
    pub sync_wal: bool,
}

/// One operation inside a [`WriteBatch`].
#[derive(Debug, Clone)]
pub enum BatchOp {
    Put {
        family: FamilyHandle,
        key: Bytes,
        value: Bytes,
    },
    Delete {
        family: FamilyHandle,
        key: Bytes,
    },
}

/// An atomic multi-family write.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, family: &FamilyHandle, key: Bytes, value: Bytes) {
        self.ops.push(BatchOp::Put {
            family: family.clone(),
            key,
            value,
        });
    }

    pub fn delete(&mut self, family: &FamilyHandle, key: Bytes) {
        self.ops.push(BatchOp::Delete {
            family: family.clone(),
            key,
        });
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }
}

/// Per-family statistics a caller can poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvProperty {
    /// Number of level-0 files (flushed, not yet fully compacted).
    NumL0Files,
    /// Bytes buffered in the active memtable.
    MemtableBytes,
    /// Total bytes held by the family (files plus memtable).
    TotalDataBytes,
}

/// Description of one level-0 file, used to pick partial compactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct L0FileInfo {
    pub id: u64,
    pub size_bytes: u64,
}

/// The substrate interface.
///
/// All operations are async; implementations may serve them from memory
/// without yielding. Write batches commit atomically: either every op in
/// the batch becomes visible or none does.
#[async_trait]
pub trait Kv: Send + Sync {
    /// Creates the family if it does not exist and returns its handle.
    async fn create_family(&self, name: &str) -> KvResult<FamilyHandle>;

    /// Removes the family and all its data.
    async fn drop_family(&self, family: &FamilyHandle) -> KvResult<()>;

    /// Names of all existing families, unordered.
    async fn list_families(&self) -> KvResult<Vec<String>>;

    async fn write(&self, batch: WriteBatch, options: KvWriteOptions) -> KvResult<()>;

    async fn get(&self, family: &FamilyHandle, key: Bytes) -> KvResult<Option<Bytes>>;

    /// Consistent point-in-time view of one family.
    ///
    /// The snapshot owns everything it needs: dropping the family afterwards
    /// does not invalidate it.
    async fn snapshot(&self, family: &FamilyHandle) -> KvResult<Arc<dyn KvSnapshot>>;

    /// Moves the family's memtable into a new level-0 file.
    async fn flush(&self, family: &FamilyHandle) -> KvResult<()>;

    /// Rewrites all files overlapping `range` into one, discarding
    /// tombstones where safe.
    async fn compact_range(&self, family: &FamilyHandle, range: BytesRange) -> KvResult<()>;

    /// Merges the given level-0 files into one. Backends without per-file
    /// control return `KvError::Unsupported`.
    async fn compact_files(&self, family: &FamilyHandle, files: &[u64]) -> KvResult<()>;

    /// Level-0 file listing, oldest first. May be empty on backends that do
    /// not expose per-file metadata.
    async fn l0_files(&self, family: &FamilyHandle) -> KvResult<Vec<L0FileInfo>>;

    async fn property(&self, family: &FamilyHandle, property: KvProperty) -> KvResult<u64>;

    /// Syncs the write-ahead log. Supports deferring `sync_wal` to a
    /// dedicated background task.
    async fn persist_wal(&self) -> KvResult<()>;

    async fn close(&self) -> KvResult<()>;
}

#[async_trait]
pub trait KvSnapshot: Send + Sync {
    async fn get(&self, key: Bytes) -> KvResult<Option<Bytes>>;

    /// Forward scan over `range` in key order.
    async fn scan(&self, range: BytesRange) -> KvResult<Box<dyn KvIterator + Send>>;
}

#[async_trait]
pub trait KvIterator: Send {
    async fn next(&mut self) -> KvResult<Option<(Bytes, Bytes)>>;
}
