//! Prometheus metrics for the shard engine.

use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

/// Container for all shard metrics.
pub struct ShardMetrics {
    registry: Registry,

    /// Counter of records successfully stored.
    pub stores_total: Counter,
    /// Counter of payload bytes stored.
    pub store_bytes_total: Counter,
    /// Counter of stores rejected with an error.
    pub store_failures_total: Counter,

    /// Counter of records returned by reads.
    pub records_read_total: Counter,
    /// Counter of record values fetched from the substrate. With the
    /// copyset index enabled, filtered-out records never reach this.
    pub payload_reads_total: Counter,
    /// Counter of copyset index entries scanned.
    pub csi_entries_scanned_total: Counter,

    /// Counter of trim-point advances.
    pub trims_total: Counter,

    pub partitions_created_total: Counter,
    pub partitions_prepended_total: Counter,
    pub partitions_dropped_total: Counter,

    pub flushes_total: Counter,
    pub partial_compactions_total: Counter,
    pub full_compactions_total: Counter,
    pub metadata_compactions_total: Counter,

    pub wal_syncs_total: Counter,
    /// Counter of background IO errors.
    pub io_errors_total: Counter,

    /// Gauge of live partitions.
    pub partition_count: Gauge,
    /// Gauge of bytes buffered across all partition memtables.
    pub memtable_bytes: Gauge,
    /// Gauge of partitions with unflushed data.
    pub dirty_partitions: Gauge,
    /// 1 while the shard reports disk fullness.
    pub out_of_space: Gauge,
    /// 1 while the shard is read-only.
    pub read_only: Gauge,
}

impl Default for ShardMetrics {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! register_counter {
    ($registry:expr, $name:literal, $help:literal) => {{
        let counter = Counter::default();
        $registry.register($name, $help, counter.clone());
        counter
    }};
}

macro_rules! register_gauge {
    ($registry:expr, $name:literal, $help:literal) => {{
        let gauge = Gauge::default();
        $registry.register($name, $help, gauge.clone());
        gauge
    }};
}

impl ShardMetrics {
    /// Create a new metrics registry with all metrics registered.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let stores_total = register_counter!(
            registry,
            "shard_stores_total",
            "Total number of records stored"
        );
        let store_bytes_total = register_counter!(
            registry,
            "shard_store_bytes_total",
            "Total payload bytes stored"
        );
        let store_failures_total = register_counter!(
            registry,
            "shard_store_failures_total",
            "Total number of rejected stores"
        );
        let records_read_total = register_counter!(
            registry,
            "shard_records_read_total",
            "Total number of records returned by reads"
        );
        let payload_reads_total = register_counter!(
            registry,
            "shard_payload_reads_total",
            "Total number of record values fetched from storage"
        );
        let csi_entries_scanned_total = register_counter!(
            registry,
            "shard_csi_entries_scanned_total",
            "Total number of copyset index entries scanned"
        );
        let trims_total = register_counter!(
            registry,
            "shard_trims_total",
            "Total number of trim point advances"
        );
        let partitions_created_total = register_counter!(
            registry,
            "shard_partitions_created_total",
            "Total number of partitions created"
        );
        let partitions_prepended_total = register_counter!(
            registry,
            "shard_partitions_prepended_total",
            "Total number of partitions prepended for old timestamps"
        );
        let partitions_dropped_total = register_counter!(
            registry,
            "shard_partitions_dropped_total",
            "Total number of partitions dropped"
        );
        let flushes_total = register_counter!(
            registry,
            "shard_flushes_total",
            "Total number of memtable flushes"
        );
        let partial_compactions_total = register_counter!(
            registry,
            "shard_partial_compactions_total",
            "Total number of partial compactions"
        );
        let full_compactions_total = register_counter!(
            registry,
            "shard_full_compactions_total",
            "Total number of scheduled full compactions"
        );
        let metadata_compactions_total = register_counter!(
            registry,
            "shard_metadata_compactions_total",
            "Total number of metadata family compactions"
        );
        let wal_syncs_total = register_counter!(
            registry,
            "shard_wal_syncs_total",
            "Total number of write-ahead log syncs"
        );
        let io_errors_total = register_counter!(
            registry,
            "shard_io_errors_total",
            "Total number of background IO errors"
        );
        let partition_count = register_gauge!(
            registry,
            "shard_partition_count",
            "Number of live partitions"
        );
        let memtable_bytes = register_gauge!(
            registry,
            "shard_memtable_bytes",
            "Bytes buffered across partition memtables"
        );
        let dirty_partitions = register_gauge!(
            registry,
            "shard_dirty_partitions",
            "Partitions with unflushed data"
        );
        let out_of_space = register_gauge!(
            registry,
            "shard_out_of_space",
            "Whether the shard reports disk fullness"
        );
        let read_only = register_gauge!(
            registry,
            "shard_read_only",
            "Whether the shard is read-only"
        );

        Self {
            registry,
            stores_total,
            store_bytes_total,
            store_failures_total,
            records_read_total,
            payload_reads_total,
            csi_entries_scanned_total,
            trims_total,
            partitions_created_total,
            partitions_prepended_total,
            partitions_dropped_total,
            flushes_total,
            partial_compactions_total,
            full_compactions_total,
            metadata_compactions_total,
            wal_syncs_total,
            io_errors_total,
            partition_count,
            memtable_bytes,
            dirty_partitions,
            out_of_space,
            read_only,
        }
    }

    /// Encode all metrics to Prometheus text format.
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, &self.registry)
            .expect("encoding metrics should not fail");
        buffer
    }
}
