//! Core data types for the shard storage engine.
//!
//! This module defines the identifiers and value types used throughout the
//! engine: logs, sequence numbers, partitions, copysets, and the record
//! shapes exchanged with higher layers.

use bytes::{BufMut, Bytes, BytesMut};
use smallvec::SmallVec;

/// Identifier of a log. Assigned by the cluster configuration.
///
/// Log ids with the top bit set are internal logs; their records are stored
/// in the unpartitioned column family and are exempt from time-based
/// partitioning and retention.
pub type LogId = u64;

/// Log sequence number, assigned by the sequencer.
///
/// The high 32 bits carry the sequencer epoch, the low 32 bits the offset
/// within the epoch.
pub type Lsn = u64;

/// Monotonically increasing identifier of a partition within a shard.
pub type PartitionId = u64;

/// Index of a storage shard in the cluster, as referenced by copysets.
pub type ShardIndex = u32;

/// Sequencer epoch extracted from an LSN.
pub type Epoch = u32;

const INTERNAL_LOG_BIT: u64 = 1 << 63;

/// Returns true for internal logs (stored unpartitioned).
pub fn is_internal_log(log_id: LogId) -> bool {
    log_id & INTERNAL_LOG_BIT != 0
}

/// Epoch component of an LSN.
pub fn lsn_epoch(lsn: Lsn) -> Epoch {
    (lsn >> 32) as Epoch
}

/// Composes an LSN from epoch and in-epoch offset.
pub fn compose_lsn(epoch: Epoch, offset: u32) -> Lsn {
    ((epoch as u64) << 32) | offset as u64
}

/// Number of copyset entries stored inline before spilling to the heap.
pub const COPYSET_INLINE: usize = 6;

/// Ordered list of shards holding a copy of a record.
pub type CopySet = SmallVec<[ShardIndex; COPYSET_INLINE]>;

/// Record flags, as set by the sequencer and the rebuilding pipeline.
pub mod record_flags {
    /// The payload carries a leading crc32 of its contents.
    pub const CHECKSUM: u32 = 1 << 0;
    /// The record was written by the rebuilding pipeline, not a live append.
    pub const WRITTEN_BY_REBUILDING: u32 = 1 << 1;
    /// The copy was drained off another shard.
    pub const DRAINED: u32 = 1 << 2;
    /// Metadata-only amend of an existing record.
    pub const AMEND: u32 = 1 << 3;

    /// Human-readable flag list for diagnostics.
    pub fn format(flags: u32) -> String {
        let mut parts = Vec::new();
        if flags & CHECKSUM != 0 {
            parts.push("CHECKSUM");
        }
        if flags & WRITTEN_BY_REBUILDING != 0 {
            parts.push("WRITTEN_BY_REBUILDING");
        }
        if flags & DRAINED != 0 {
            parts.push("DRAINED");
        }
        if flags & AMEND != 0 {
            parts.push("AMEND");
        }
        if parts.is_empty() {
            "-".to_string()
        } else {
            parts.join("|")
        }
    }
}

/// Validates a checksummed payload: the first four bytes carry the crc32
/// of the remainder, big-endian.
pub fn payload_checksum_valid(payload: &Bytes) -> bool {
    if payload.len() < 4 {
        return false;
    }
    let expected = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
    crc32fast::hash(&payload[4..]) == expected
}

/// Prefixes a payload with its crc32, as senders of `CHECKSUM`-flagged
/// records do.
pub fn prepend_checksum(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(payload.len() + 4);
    buf.put_u32(crc32fast::hash(payload));
    buf.put_slice(payload);
    buf.freeze()
}

/// Context attached to stores issued by the rebuilding pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebuildContext {
    /// Version of the rebuilding set this store belongs to.
    pub version: u64,
    /// Retry wave.
    pub wave: u32,
    /// Identifier of the rebuilding run.
    pub id: u64,
}

/// A validated store request handed to the engine by the replication layer.
///
/// The sequencer has already assigned `lsn` and selected `copyset`; the
/// engine only persists and indexes the record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreRequest {
    pub log_id: LogId,
    pub lsn: Lsn,
    /// Record timestamp in milliseconds since the Unix epoch, assigned at
    /// sequencing time. Drives partition selection.
    pub timestamp_ms: i64,
    pub copyset: CopySet,
    pub flags: u32,
    pub payload: Bytes,
    pub rebuild: Option<RebuildContext>,
}

impl StoreRequest {
    pub fn new(log_id: LogId, lsn: Lsn, timestamp_ms: i64, copyset: CopySet, payload: Bytes) -> Self {
        Self {
            log_id,
            lsn,
            timestamp_ms,
            copyset,
            flags: 0,
            payload,
            rebuild: None,
        }
    }
}

/// A record returned by the read path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub log_id: LogId,
    pub lsn: Lsn,
    pub timestamp_ms: i64,
    pub copyset: CopySet,
    pub flags: u32,
    pub payload: Bytes,
}

/// One item yielded by a range read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadItem {
    /// Records in `[from, to]` were removed by trimming.
    TrimGap { from: Lsn, to: Lsn },
    Record(StoredRecord),
}

/// Per-(log, partition) directory entry.
///
/// Ranges may over-approximate the records actually present (after crashes
/// or partial trims) but never under-approximate them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub first_lsn: Lsn,
    pub last_lsn: Lsn,
    pub size_bytes: u64,
    pub record_count: u64,
    pub flags: u32,
}

impl DirectoryEntry {
    /// Widens the entry to cover one more record.
    pub fn absorb(&mut self, lsn: Lsn, size: u64) {
        self.first_lsn = self.first_lsn.min(lsn);
        self.last_lsn = self.last_lsn.max(lsn);
        self.size_bytes += size;
        self.record_count += 1;
    }

    pub fn for_record(lsn: Lsn, size: u64) -> Self {
        Self {
            first_lsn: lsn,
            last_lsn: lsn,
            size_bytes: size,
            record_count: 1,
            flags: 0,
        }
    }
}
