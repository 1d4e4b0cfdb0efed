//! Error taxonomy of the storage engine.

use common::KvError;

use crate::model::ShardIndex;

/// Errors surfaced by engine operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Underlying storage failure.
    Io(String),
    /// Checksum mismatch on read, bad key encoding, or an impossible
    /// directory entry. Never auto-repaired.
    Corruption(String),
    /// Disk-full threshold crossed; the store was rejected.
    NoSpace,
    /// The log is sealed at an epoch at or above the record's epoch.
    Preempted { sealed_epoch: u32 },
    /// The shard is read-only (operator setting or persistent IO errors).
    Disabled,
    /// Transient contention, e.g. the partial-compaction stall trigger.
    Busy(String),
    NotFound(String),
    /// The operation deadline elapsed. The underlying write may still
    /// commit.
    TimedOut,
    /// Malformed request.
    Protocol(String),
    /// The shard is being rebuilt; stores should be redirected.
    Rebuilding { recipient: ShardIndex },
    /// The payload checksum did not match during a store. Fatal to the
    /// request, not to the shard.
    ChecksumMismatch,
    ShuttingDown,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Io(msg) => write!(f, "io error: {}", msg),
            Error::Corruption(msg) => write!(f, "corruption: {}", msg),
            Error::NoSpace => write!(f, "out of disk space"),
            Error::Preempted { sealed_epoch } => {
                write!(f, "preempted by seal at epoch {}", sealed_epoch)
            }
            Error::Disabled => write!(f, "shard is read-only"),
            Error::Busy(msg) => write!(f, "busy: {}", msg),
            Error::NotFound(what) => write!(f, "not found: {}", what),
            Error::TimedOut => write!(f, "operation timed out"),
            Error::Protocol(msg) => write!(f, "malformed request: {}", msg),
            Error::Rebuilding { recipient } => {
                write!(f, "shard is rebuilding, redirect to shard {}", recipient)
            }
            Error::ChecksumMismatch => write!(f, "payload checksum mismatch"),
            Error::ShuttingDown => write!(f, "shard is shutting down"),
        }
    }
}

impl std::error::Error for Error {}

impl From<KvError> for Error {
    fn from(err: KvError) -> Self {
        match err {
            KvError::Io(msg) => Error::Io(msg),
            KvError::Corruption(msg) => Error::Corruption(msg),
            KvError::NotFound(what) => Error::NotFound(what),
            KvError::Busy(msg) => Error::Busy(msg),
            KvError::Unsupported(what) => Error::Io(format!("unsupported operation: {}", what)),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
