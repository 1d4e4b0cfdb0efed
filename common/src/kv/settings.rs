//! Substrate tuning knobs.
//!
//! Every numeric knob the engine exposes for its storage backend lives
//! here, so the rest of the engine never talks to a concrete store's
//! option types. Backends apply the subset they support.

use serde::{Deserialize, Serialize};

/// How files are merged in the background.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompactionStyle {
    /// Size-tiered merging of similarly sized runs.
    #[default]
    Universal,
    /// Leveled layout with sorted non-overlapping runs per level.
    Level,
}

/// On-disk block compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Snappy,
    Zlib,
    Bzip2,
    Lz4,
    Lz4hc,
    Zstd,
    Xpress,
}

/// When to cut a data block during flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushBlockPolicy {
    /// Cut on size only.
    #[default]
    Default,
    /// Also cut whenever the log id changes, so a block never mixes logs.
    EachLog,
    /// Also cut whenever the copyset changes.
    EachCopyset,
}

/// Numeric configuration for a KV instance.
///
/// Defaults follow the production tuning of the system this engine is
/// modelled on. Sizes are bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KvSettings {
    pub compaction_style: CompactionStyle,
    pub compression: Compression,
    pub flush_block_policy: FlushBlockPolicy,

    /// Target uncompressed size of a data block.
    pub block_size: u64,
    /// Lower bound on block size when cutting early (per-log / per-copyset
    /// policies).
    pub min_block_size: u64,
    /// Block size for the metadata family; 0 means `block_size`.
    pub metadata_block_size: u64,

    pub cache_size: u64,
    pub cache_num_shard_bits: u32,
    pub metadata_cache_size: u64,
    pub metadata_cache_num_shard_bits: u32,
    /// Cache for compressed blocks; 0 disables it.
    pub compressed_cache_size: u64,
    pub compressed_cache_num_shard_bits: u32,

    pub bloom_bits_per_key: u32,
    pub metadata_bloom_bits_per_key: u32,
    pub bloom_block_based: bool,

    /// Per-family write buffer size.
    pub write_buffer_size: u64,
    /// Instance-wide write buffer limit; 0 means unlimited.
    pub db_write_buffer_size: u64,

    pub bytes_per_sync: u64,
    pub wal_bytes_per_sync: u64,

    pub max_open_files: u64,
}

impl Default for KvSettings {
    fn default() -> Self {
        Self {
            compaction_style: CompactionStyle::default(),
            compression: Compression::default(),
            flush_block_policy: FlushBlockPolicy::default(),
            block_size: 500 * 1024,
            min_block_size: 16384,
            metadata_block_size: 0,
            cache_size: 10 * 1024 * 1024 * 1024,
            cache_num_shard_bits: 4,
            metadata_cache_size: 1024 * 1024 * 1024,
            metadata_cache_num_shard_bits: 4,
            compressed_cache_size: 0,
            compressed_cache_num_shard_bits: 0,
            bloom_bits_per_key: 10,
            metadata_bloom_bits_per_key: 0,
            bloom_block_based: false,
            write_buffer_size: 100 * 1024 * 1024 * 1024,
            db_write_buffer_size: 0,
            bytes_per_sync: 1024 * 1024,
            wal_bytes_per_sync: 1024 * 1024,
            max_open_files: 10_000,
        }
    }
}

impl KvSettings {
    /// Effective block size for the metadata family.
    pub fn metadata_block_size(&self) -> u64 {
        if self.metadata_block_size == 0 {
            self.block_size
        } else {
            self.metadata_block_size
        }
    }
}
