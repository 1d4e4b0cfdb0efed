//! shardlog - a single-shard, time-partitioned log storage engine.
//!
//! shardlog is the storage half of a distributed append-only log: a
//! sequencer assigns monotonic sequence numbers (LSNs) and picks copysets,
//! and each storage node runs one `Shard` per disk that durably stores,
//! serves, trims and compacts the records it receives.
//!
//! # Architecture
//!
//! Records live in an embedded ordered key-value store (see `common::kv`),
//! split into *partitions*: column families each covering a bounded
//! wall-clock time range. Retention and space reclamation then become
//! cheap, partition-granular operations: once every log's records in the
//! oldest partition are trimmed, the whole column family is dropped.
//!
//! A per-log *directory* in the metadata family tracks which partitions
//! hold each log's records and the log's trim point. Reads resolve
//! partitions through the directory and chain per-partition snapshot
//! iterators; an optional copyset index lets filtered reads skip payloads
//! entirely.
//!
//! # Key Concepts
//!
//! - **Shard**: one storage unit owning one KV instance; the entry point.
//! - **Partition**: a time-bounded column family, created by the
//!   high-priority loop (or prepended for old timestamps) and dropped by
//!   the low-priority loop once fully trimmed.
//! - **Trim point**: per-log LSN below which records are logically gone.
//! - **Copyset index (CSI)**: compact per-record copyset entries enabling
//!   filter push-down without payload IO.
//! - **findTime**: timestamp-to-LSN lookup, served from an index or by
//!   scanning record headers.
//!
//! # Example
//!
//! ```ignore
//! use shardlog::{Shard, ShardConfig, ReadFilter, StoreRequest};
//! use smallvec::smallvec;
//! use bytes::Bytes;
//!
//! let shard = Shard::open(config, logs_config).await?;
//!
//! shard.store(StoreRequest::new(7, 100, now_ms, smallvec![1, 2, 3],
//!                               Bytes::from("payload"))).await?;
//!
//! let mut stream = shard.read(7, 0, u64::MAX, ReadFilter::default()).await?;
//! while let Some(item) = stream.next().await? {
//!     println!("{:?}", item);
//! }
//! ```

mod compaction;
pub mod config;
mod directory;
mod error;
mod flush;
mod metrics;
pub mod model;
mod partition;
mod read;
mod retention;
mod serde;
mod shard;

pub use config::{
    CompactionSchedule, LogAttributes, LogsConfig, Settings, StaticLogsConfig,
};
pub use error::{Error, Result};
pub use metrics::ShardMetrics;
pub use model::{
    record_flags, CopySet, DirectoryEntry, Epoch, LogId, Lsn, PartitionId, ReadItem,
    RebuildContext, ShardIndex, StoreRequest, StoredRecord,
};
pub use read::{CopysetFilter, ReadFilter, RecordStream};
pub use retention::{DiskSpace, MockDiskSpace, SpaceStatus, SystemDiskSpace};
pub use shard::{PartitionInfo, Shard, ShardConfig, ShardStatus};
