//! Key and value encodings for everything the shard persists.
//!
//! # Key format
//!
//! All keys start with a version byte and a record-type discriminator:
//!
//! ```text
//! | version (u8) | type (u8) | ... record-specific fields ... |
//! ```
//!
//! Integer fields are big-endian so lexicographic key order equals numeric
//! order; scans over `(log_id, lsn)` ranges therefore see records in LSN
//! order without any post-sorting.
//!
//! # Record types
//!
//! Partition column families hold `Record`, `CopysetIndex` and
//! `FindTimeIndex` rows. The `metadata` family holds `Directory`,
//! `TrimPoint`, `Seal`, `DirtyMarker` and `PartitionMeta` rows.

use std::ops::Bound;

use bytes::{BufMut, Bytes, BytesMut};
use common::BytesRange;

use crate::error::Error;
use crate::model::{CopySet, DirectoryEntry, Epoch, LogId, Lsn, PartitionId};

/// Key format version.
pub const KEY_VERSION: u8 = 0x01;

/// Record type discriminators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    /// A log record: header, copyset and payload.
    Record = 0x01,
    /// Copyset index entry mirroring a record's copyset without the payload.
    CopysetIndex = 0x02,
    /// Time-to-LSN index entry.
    FindTimeIndex = 0x03,
    /// Per-(log, partition) directory entry.
    Directory = 0x04,
    /// Per-log trim point.
    TrimPoint = 0x05,
    /// Per-log seal epoch.
    Seal = 0x06,
    /// Marks a partition with unflushed data; survives unclean shutdown.
    DirtyMarker = 0x07,
    /// Partition creation metadata.
    PartitionMeta = 0x08,
}

impl RecordType {
    pub fn id(&self) -> u8 {
        *self as u8
    }

    pub fn from_id(id: u8) -> Result<Self, Error> {
        match id {
            0x01 => Ok(RecordType::Record),
            0x02 => Ok(RecordType::CopysetIndex),
            0x03 => Ok(RecordType::FindTimeIndex),
            0x04 => Ok(RecordType::Directory),
            0x05 => Ok(RecordType::TrimPoint),
            0x06 => Ok(RecordType::Seal),
            0x07 => Ok(RecordType::DirtyMarker),
            0x08 => Ok(RecordType::PartitionMeta),
            _ => Err(Error::Corruption(format!("invalid record type: 0x{:02x}", id))),
        }
    }
}

fn check_prefix(data: &[u8], expected: RecordType, min_len: usize) -> Result<(), Error> {
    if data.len() < min_len {
        return Err(Error::Corruption(format!(
            "key too short for {:?}: need {} bytes, got {}",
            expected,
            min_len,
            data.len()
        )));
    }
    if data[0] != KEY_VERSION {
        return Err(Error::Corruption(format!(
            "unsupported key version 0x{:02x}",
            data[0]
        )));
    }
    let record_type = RecordType::from_id(data[1])?;
    if record_type != expected {
        return Err(Error::Corruption(format!(
            "invalid record type: expected {:?}, got {:?}",
            expected, record_type
        )));
    }
    Ok(())
}

fn read_u64(data: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[at..at + 8]);
    u64::from_be_bytes(buf)
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[at..at + 4]);
    u32::from_be_bytes(buf)
}

fn read_i64(data: &[u8], at: usize) -> i64 {
    read_u64(data, at) as i64
}

/// Key of a log record: `| ver | 0x01 | log_id (u64 BE) | lsn (u64 BE) |`.
///
/// The same layout (with its own tag) is used for copyset index entries, so
/// both indexes sort by `(log_id, lsn)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordKey {
    pub log_id: LogId,
    pub lsn: Lsn,
}

impl RecordKey {
    pub fn new(log_id: LogId, lsn: Lsn) -> Self {
        Self { log_id, lsn }
    }

    pub fn serialize(&self) -> Bytes {
        encode_log_lsn(RecordType::Record, self.log_id, self.lsn)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, Error> {
        let (log_id, lsn) = decode_log_lsn(data, RecordType::Record)?;
        Ok(Self { log_id, lsn })
    }

    /// Range over record keys of one log, `[from, until]` inclusive.
    ///
    /// With `bounded` false the range is capped at the end of the log's
    /// record keyspace instead of `until` (the iterator then enforces the
    /// bound itself).
    pub fn scan_range(log_id: LogId, from: Lsn, until: Lsn, bounded: bool) -> BytesRange {
        scan_log_lsn(RecordType::Record, log_id, from, until, bounded)
    }
}

/// Key of a copyset index entry; same layout as [`RecordKey`], tag 0x02.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CsiKey {
    pub log_id: LogId,
    pub lsn: Lsn,
}

impl CsiKey {
    pub fn new(log_id: LogId, lsn: Lsn) -> Self {
        Self { log_id, lsn }
    }

    pub fn serialize(&self) -> Bytes {
        encode_log_lsn(RecordType::CopysetIndex, self.log_id, self.lsn)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, Error> {
        let (log_id, lsn) = decode_log_lsn(data, RecordType::CopysetIndex)?;
        Ok(Self { log_id, lsn })
    }

    pub fn scan_range(log_id: LogId, from: Lsn, until: Lsn, bounded: bool) -> BytesRange {
        scan_log_lsn(RecordType::CopysetIndex, log_id, from, until, bounded)
    }
}

fn encode_log_lsn(record_type: RecordType, log_id: LogId, lsn: Lsn) -> Bytes {
    let mut buf = BytesMut::with_capacity(18);
    buf.put_u8(KEY_VERSION);
    buf.put_u8(record_type.id());
    buf.put_u64(log_id);
    buf.put_u64(lsn);
    buf.freeze()
}

fn decode_log_lsn(data: &[u8], record_type: RecordType) -> Result<(LogId, Lsn), Error> {
    check_prefix(data, record_type, 18)?;
    Ok((read_u64(data, 2), read_u64(data, 10)))
}

fn scan_log_lsn(
    record_type: RecordType,
    log_id: LogId,
    from: Lsn,
    until: Lsn,
    bounded: bool,
) -> BytesRange {
    let start = encode_log_lsn(record_type, log_id, from);
    let end = if bounded {
        encode_log_lsn(record_type, log_id, until)
    } else {
        encode_log_lsn(record_type, log_id, Lsn::MAX)
    };
    BytesRange::new(Bound::Included(start), Bound::Included(end))
}

/// Value of a log record.
///
/// ```text
/// | flags (u32 BE) | timestamp_ms (i64 BE) | copyset_len (u8) |
/// | copyset (u32 BE each) | payload |
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordValue {
    pub flags: u32,
    pub timestamp_ms: i64,
    pub copyset: CopySet,
    pub payload: Bytes,
}

impl RecordValue {
    pub fn serialize(&self) -> Bytes {
        let mut buf =
            BytesMut::with_capacity(13 + self.copyset.len() * 4 + self.payload.len());
        buf.put_u32(self.flags);
        buf.put_i64(self.timestamp_ms);
        buf.put_u8(self.copyset.len() as u8);
        for shard in &self.copyset {
            buf.put_u32(*shard);
        }
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn deserialize(data: &Bytes) -> Result<Self, Error> {
        if data.len() < 13 {
            return Err(Error::Corruption(format!(
                "record value too short: {} bytes",
                data.len()
            )));
        }
        let flags = read_u32(data, 0);
        let timestamp_ms = read_i64(data, 4);
        let copyset_len = data[12] as usize;
        let payload_at = 13 + copyset_len * 4;
        if data.len() < payload_at {
            return Err(Error::Corruption(
                "record value truncated inside copyset".to_string(),
            ));
        }
        let mut copyset = CopySet::new();
        for i in 0..copyset_len {
            copyset.push(read_u32(data, 13 + i * 4));
        }
        let payload = data.slice(payload_at..);
        Ok(Self {
            flags,
            timestamp_ms,
            copyset,
            payload,
        })
    }
}

/// Value of a copyset index entry: `| copyset_len (u8) | copyset (u32 BE each) |`.
///
/// Stores the copyset itself so read filters can be evaluated without
/// fetching the record payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsiValue {
    pub copyset: CopySet,
}

impl CsiValue {
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + self.copyset.len() * 4);
        buf.put_u8(self.copyset.len() as u8);
        for shard in &self.copyset {
            buf.put_u32(*shard);
        }
        buf.freeze()
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, Error> {
        if data.is_empty() {
            return Err(Error::Corruption("empty copyset index value".to_string()));
        }
        let len = data[0] as usize;
        if data.len() != 1 + len * 4 {
            return Err(Error::Corruption(format!(
                "copyset index value length mismatch: header says {}, got {} bytes",
                len,
                data.len()
            )));
        }
        let mut copyset = CopySet::new();
        for i in 0..len {
            copyset.push(read_u32(data, 1 + i * 4));
        }
        Ok(Self { copyset })
    }
}

/// Key of a findTime index entry:
/// `| ver | 0x03 | log_id (u64 BE) | ts_bucket (u64 BE) |`.
///
/// The value is the smallest LSN written into the bucket (u64 BE).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FtiKey {
    pub log_id: LogId,
    pub bucket: u64,
}

impl FtiKey {
    pub fn new(log_id: LogId, bucket: u64) -> Self {
        Self { log_id, bucket }
    }

    pub fn serialize(&self) -> Bytes {
        encode_log_lsn(RecordType::FindTimeIndex, self.log_id, self.bucket)
    }

    /// All index entries of `log_id` with bucket ≥ `from_bucket`.
    pub fn scan_from(log_id: LogId, from_bucket: u64) -> BytesRange {
        scan_log_lsn(RecordType::FindTimeIndex, log_id, from_bucket, 0, false)
    }
}

pub fn serialize_lsn(lsn: Lsn) -> Bytes {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_u64(lsn);
    buf.freeze()
}

pub fn deserialize_lsn(data: &[u8]) -> Result<Lsn, Error> {
    if data.len() != 8 {
        return Err(Error::Corruption(format!(
            "lsn value must be 8 bytes, got {}",
            data.len()
        )));
    }
    Ok(read_u64(data, 0))
}

/// Key of a directory entry:
/// `| ver | 0x04 | log_id (u64 BE) | partition_id (u64 BE) |`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirKey {
    pub log_id: LogId,
    pub partition_id: PartitionId,
}

impl DirKey {
    pub fn new(log_id: LogId, partition_id: PartitionId) -> Self {
        Self {
            log_id,
            partition_id,
        }
    }

    pub fn serialize(&self) -> Bytes {
        encode_log_lsn(RecordType::Directory, self.log_id, self.partition_id)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, Error> {
        let (log_id, partition_id) = decode_log_lsn(data, RecordType::Directory)?;
        Ok(Self {
            log_id,
            partition_id,
        })
    }

    /// Every directory entry of every log.
    pub fn scan_all() -> BytesRange {
        scan_record_type(RecordType::Directory)
    }
}

/// Range covering every key of one record type.
fn scan_record_type(record_type: RecordType) -> BytesRange {
    let mut start = BytesMut::with_capacity(2);
    start.put_u8(KEY_VERSION);
    start.put_u8(record_type.id());
    let mut end = BytesMut::with_capacity(2);
    end.put_u8(KEY_VERSION);
    end.put_u8(record_type.id() + 1);
    BytesRange::new(
        Bound::Included(start.freeze()),
        Bound::Excluded(end.freeze()),
    )
}

/// Value of a directory entry:
/// `| first_lsn | last_lsn | size | record_count (u64 BE each) | flags (u32 BE) |`.
pub fn serialize_dir_entry(entry: &DirectoryEntry) -> Bytes {
    let mut buf = BytesMut::with_capacity(36);
    buf.put_u64(entry.first_lsn);
    buf.put_u64(entry.last_lsn);
    buf.put_u64(entry.size_bytes);
    buf.put_u64(entry.record_count);
    buf.put_u32(entry.flags);
    buf.freeze()
}

pub fn deserialize_dir_entry(data: &[u8]) -> Result<DirectoryEntry, Error> {
    if data.len() != 36 {
        return Err(Error::Corruption(format!(
            "directory entry must be 36 bytes, got {}",
            data.len()
        )));
    }
    Ok(DirectoryEntry {
        first_lsn: read_u64(data, 0),
        last_lsn: read_u64(data, 8),
        size_bytes: read_u64(data, 16),
        record_count: read_u64(data, 24),
        flags: read_u32(data, 32),
    })
}

/// Key of a per-log singleton row (`TrimPoint` or `Seal`):
/// `| ver | type | log_id (u64 BE) |`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogKey {
    pub record_type: RecordType,
    pub log_id: LogId,
}

impl LogKey {
    pub fn trim(log_id: LogId) -> Self {
        Self {
            record_type: RecordType::TrimPoint,
            log_id,
        }
    }

    pub fn seal(log_id: LogId) -> Self {
        Self {
            record_type: RecordType::Seal,
            log_id,
        }
    }

    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(10);
        buf.put_u8(KEY_VERSION);
        buf.put_u8(self.record_type.id());
        buf.put_u64(self.log_id);
        buf.freeze()
    }

    pub fn deserialize(data: &[u8], record_type: RecordType) -> Result<Self, Error> {
        check_prefix(data, record_type, 10)?;
        Ok(Self {
            record_type,
            log_id: read_u64(data, 2),
        })
    }

    pub fn scan_all(record_type: RecordType) -> BytesRange {
        scan_record_type(record_type)
    }
}

pub fn serialize_epoch(epoch: Epoch) -> Bytes {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_u32(epoch);
    buf.freeze()
}

pub fn deserialize_epoch(data: &[u8]) -> Result<Epoch, Error> {
    if data.len() != 4 {
        return Err(Error::Corruption(format!(
            "epoch value must be 4 bytes, got {}",
            data.len()
        )));
    }
    Ok(read_u32(data, 0))
}

/// Key of a per-partition singleton row (`DirtyMarker` or `PartitionMeta`):
/// `| ver | type | partition_id (u64 BE) |`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionKey {
    pub record_type: RecordType,
    pub partition_id: PartitionId,
}

impl PartitionKey {
    pub fn dirty(partition_id: PartitionId) -> Self {
        Self {
            record_type: RecordType::DirtyMarker,
            partition_id,
        }
    }

    pub fn meta(partition_id: PartitionId) -> Self {
        Self {
            record_type: RecordType::PartitionMeta,
            partition_id,
        }
    }

    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(10);
        buf.put_u8(KEY_VERSION);
        buf.put_u8(self.record_type.id());
        buf.put_u64(self.partition_id);
        buf.freeze()
    }

    pub fn deserialize(data: &[u8], record_type: RecordType) -> Result<Self, Error> {
        check_prefix(data, record_type, 10)?;
        Ok(Self {
            record_type,
            partition_id: read_u64(data, 2),
        })
    }

    pub fn scan_all(record_type: RecordType) -> BytesRange {
        scan_record_type(record_type)
    }
}

/// Value of a dirty marker: `| server_instance (u64 BE) | wave (u32 BE) |`.
///
/// `server_instance` identifies the process generation that dirtied the
/// partition; a marker from an older instance found at open means the
/// partition may hold records the directory does not know about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirtyValue {
    pub server_instance: u64,
    pub wave: u32,
}

impl DirtyValue {
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(12);
        buf.put_u64(self.server_instance);
        buf.put_u32(self.wave);
        buf.freeze()
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, Error> {
        if data.len() != 12 {
            return Err(Error::Corruption(format!(
                "dirty marker must be 12 bytes, got {}",
                data.len()
            )));
        }
        Ok(Self {
            server_instance: read_u64(data, 0),
            wave: read_u32(data, 8),
        })
    }
}

/// Value of a partition meta row:
/// `| min_ts (i64 BE) | creation_time_ms (i64 BE) | flags (u32 BE) |`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionMetaValue {
    pub min_ts: i64,
    pub creation_time_ms: i64,
    pub prepended: bool,
}

const PARTITION_META_PREPENDED: u32 = 1 << 0;

impl PartitionMetaValue {
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(20);
        buf.put_i64(self.min_ts);
        buf.put_i64(self.creation_time_ms);
        buf.put_u32(if self.prepended {
            PARTITION_META_PREPENDED
        } else {
            0
        });
        buf.freeze()
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, Error> {
        if data.len() != 20 {
            return Err(Error::Corruption(format!(
                "partition meta must be 20 bytes, got {}",
                data.len()
            )));
        }
        Ok(Self {
            min_ts: read_i64(data, 0),
            creation_time_ms: read_i64(data, 8),
            prepended: read_u32(data, 16) & PARTITION_META_PREPENDED != 0,
        })
    }
}

/// Name of the column family backing a partition.
pub fn partition_family_name(partition_id: PartitionId) -> String {
    format!("partition_{}", partition_id)
}

/// Inverse of [`partition_family_name`].
pub fn parse_partition_family(name: &str) -> Option<PartitionId> {
    name.strip_prefix("partition_")?.parse().ok()
}

/// Reserved family for directory, trim, seal and dirty rows.
pub const METADATA_FAMILY: &str = "metadata";

/// Reserved family for internal logs.
pub const UNPARTITIONED_FAMILY: &str = "unpartitioned";
