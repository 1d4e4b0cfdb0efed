//! Flush scheduling.
//!
//! The scheduler walks the partitions on a fixed cadence and flushes a
//! partition's memtable when the data is old enough, the partition went
//! idle, enough bytes accumulated, or the node-wide memtable budget is
//! exceeded (oldest-dirtied partitions are evicted first).
//!
//! A partition stays associated with its on-disk dirty marker for
//! `redirty_grace_period` after a flush, so a write arriving right after
//! the flush re-dirties it without another metadata write. Markers of
//! partitions that stayed clean through the grace period are deleted.

use std::sync::Arc;
use std::time::Duration;

use common::{FamilyHandle, Kv, KvWriteOptions, WriteBatch};
use tracing::debug;

use crate::config::Settings;
use crate::error::Result;
use crate::metrics::ShardMetrics;
use crate::model::PartitionId;
use crate::partition::{Partition, PartitionCatalog};
use crate::serde::PartitionKey;

pub(crate) struct FlushScheduler {
    settings: Arc<Settings>,
    metadata: FamilyHandle,
    metrics: Arc<ShardMetrics>,
}

/// What one scheduler pass did, for observability and tests.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct FlushOutcome {
    pub flushed: Vec<PartitionId>,
    pub markers_cleared: Vec<PartitionId>,
}

fn triggered(duration: Duration, elapsed_ms: i64) -> bool {
    !duration.is_zero() && elapsed_ms >= duration.as_millis() as i64
}

impl FlushScheduler {
    pub fn new(
        settings: Arc<Settings>,
        metadata: FamilyHandle,
        metrics: Arc<ShardMetrics>,
    ) -> Self {
        Self {
            settings,
            metadata,
            metrics,
        }
    }

    /// One scheduler pass over all partitions.
    pub async fn run_once(
        &self,
        kv: &dyn Kv,
        catalog: &PartitionCatalog,
        now_ms: i64,
    ) -> Result<FlushOutcome> {
        let partitions = catalog.all();
        let mut outcome = FlushOutcome::default();

        let mut to_flush: Vec<Arc<Partition>> = Vec::new();
        let mut dirty: Vec<Arc<Partition>> = Vec::new();
        for partition in &partitions {
            if !partition.is_dirty() || partition.is_dropping() {
                continue;
            }
            dirty.push(partition.clone());
            let data_age = now_ms - partition.first_dirtied_ms();
            let idle = now_ms - partition.last_write_ms();
            let bytes = partition.bytes_since_flush();
            let byte_trigger = self.settings.bytes_written_since_flush_trigger;
            if triggered(self.settings.partition_data_age_flush_trigger, data_age)
                || triggered(self.settings.partition_idle_flush_trigger, idle)
                || (byte_trigger > 0 && bytes >= byte_trigger)
            {
                to_flush.push(partition.clone());
            }
        }

        // Node-wide memtable budget: evict oldest-dirtied partitions until
        // the remaining buffered bytes fit.
        let budget = self.settings.memtable_size_per_node;
        if budget > 0 {
            let mut remaining: u64 = dirty.iter().map(|p| p.bytes_since_flush()).sum();
            remaining = remaining.saturating_sub(
                to_flush.iter().map(|p| p.bytes_since_flush()).sum::<u64>(),
            );
            let mut candidates: Vec<Arc<Partition>> = dirty
                .iter()
                .filter(|p| !to_flush.iter().any(|f| f.id() == p.id()))
                .cloned()
                .collect();
            candidates.sort_by_key(|p| p.first_dirtied_ms());
            for partition in candidates {
                if remaining <= budget {
                    break;
                }
                remaining = remaining.saturating_sub(partition.bytes_since_flush());
                to_flush.push(partition);
            }
        }

        to_flush.sort_by_key(|p| p.id());
        for partition in &to_flush {
            debug!(partition = partition.id(), "flushing partition memtable");
            kv.flush(partition.family()).await?;
            partition.mark_clean(now_ms);
            self.metrics.flushes_total.inc();
            outcome.flushed.push(partition.id());
        }

        // Delete dirty markers of partitions that stayed clean through the
        // redirty grace period.
        let mut marker_batch = WriteBatch::new();
        let mut cleared: Vec<Arc<Partition>> = Vec::new();
        for partition in &partitions {
            if partition.is_dirty() || !partition.marker_on_disk() {
                continue;
            }
            let clean_since = partition.clean_since_ms();
            if clean_since > 0
                && now_ms - clean_since >= self.settings.redirty_grace_period.as_millis() as i64
            {
                marker_batch.delete(
                    &self.metadata,
                    PartitionKey::dirty(partition.id()).serialize(),
                );
                cleared.push(partition.clone());
            }
        }
        if !marker_batch.is_empty() {
            kv.write(marker_batch, KvWriteOptions::default()).await?;
            for partition in cleared {
                partition.set_marker_on_disk(false);
                outcome.markers_cleared.push(partition.id());
            }
        }

        let buffered: u64 = catalog.all().iter().map(|p| p.bytes_since_flush()).sum();
        self.metrics.memtable_bytes.set(buffered as i64);
        self.metrics
            .dirty_partitions
            .set(catalog.all().iter().filter(|p| p.is_dirty()).count() as i64);

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::kv::memory::MemoryKv;
    use common::KvProperty;
    use crate::serde::partition_family_name;

    struct Fixture {
        kv: MemoryKv,
        catalog: PartitionCatalog,
        scheduler: FlushScheduler,
    }

    async fn fixture(settings: Settings) -> Fixture {
        let kv = MemoryKv::new();
        let metadata = kv.create_family("metadata").await.unwrap();
        Fixture {
            kv,
            catalog: PartitionCatalog::new(),
            scheduler: FlushScheduler::new(
                Arc::new(settings),
                metadata,
                Arc::new(ShardMetrics::new()),
            ),
        }
    }

    async fn add_partition(fixture: &Fixture, id: PartitionId) -> Arc<Partition> {
        let family = fixture
            .kv
            .create_family(&partition_family_name(id))
            .await
            .unwrap();
        let partition = Arc::new(Partition::new(id, family, 0, 0, false));
        fixture.catalog.insert(partition.clone());
        partition
    }

    /// Writes `bytes` into the partition's family and mirrors the dirty
    /// accounting a real store would perform.
    async fn write_bytes(fixture: &Fixture, partition: &Arc<Partition>, bytes: u64, now_ms: i64) {
        let mut batch = WriteBatch::new();
        batch.put(
            partition.family(),
            bytes::Bytes::copy_from_slice(format!("k{}", now_ms).as_bytes()),
            bytes::Bytes::from(vec![0u8; bytes as usize]),
        );
        fixture
            .kv
            .write(batch, KvWriteOptions::default())
            .await
            .unwrap();
        partition.observe_write(now_ms, bytes, now_ms);
    }

    fn test_settings() -> Settings {
        Settings {
            partition_data_age_flush_trigger: Duration::from_secs(600),
            partition_idle_flush_trigger: Duration::from_secs(300),
            bytes_written_since_flush_trigger: 0,
            memtable_size_per_node: 0,
            redirty_grace_period: Duration::from_secs(5),
            ..Settings::default()
        }
    }

    #[tokio::test]
    async fn should_not_flush_fresh_writes() {
        // given
        let fixture = fixture(test_settings()).await;
        let p = add_partition(&fixture, 1_000_000).await;
        write_bytes(&fixture, &p, 100, 1_000).await;

        // when - shortly after the write
        let outcome = fixture
            .scheduler
            .run_once(&fixture.kv, &fixture.catalog, 2_000)
            .await
            .unwrap();

        // then
        assert!(outcome.flushed.is_empty());
        assert!(p.is_dirty());
    }

    #[tokio::test]
    async fn should_flush_when_data_age_trigger_fires() {
        // given - data written at t=0, still being written recently
        let fixture = fixture(test_settings()).await;
        let p = add_partition(&fixture, 1_000_000).await;
        write_bytes(&fixture, &p, 100, 0).await;
        write_bytes(&fixture, &p, 100, 599_000).await;

        // when - oldest unflushed data is 600s old
        let outcome = fixture
            .scheduler
            .run_once(&fixture.kv, &fixture.catalog, 600_000)
            .await
            .unwrap();

        // then
        assert_eq!(outcome.flushed, vec![1_000_000]);
        assert!(!p.is_dirty());
        assert_eq!(
            fixture
                .kv
                .property(p.family(), KvProperty::NumL0Files)
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn should_flush_when_partition_goes_idle() {
        // given - one write, then silence
        let fixture = fixture(test_settings()).await;
        let p = add_partition(&fixture, 1_000_000).await;
        write_bytes(&fixture, &p, 100, 0).await;

        // when - idle for 300s (data age only 300s, below its trigger)
        let outcome = fixture
            .scheduler
            .run_once(&fixture.kv, &fixture.catalog, 300_000)
            .await
            .unwrap();

        // then
        assert_eq!(outcome.flushed, vec![1_000_000]);
    }

    #[tokio::test]
    async fn should_flush_when_byte_trigger_fires() {
        // given
        let mut settings = test_settings();
        settings.bytes_written_since_flush_trigger = 1_000;
        let fixture = fixture(settings).await;
        let p = add_partition(&fixture, 1_000_000).await;
        write_bytes(&fixture, &p, 1_500, 1_000).await;

        // when - immediately, with no time-based trigger armed
        let outcome = fixture
            .scheduler
            .run_once(&fixture.kv, &fixture.catalog, 1_001)
            .await
            .unwrap();

        // then
        assert_eq!(outcome.flushed, vec![1_000_000]);
    }

    #[tokio::test]
    async fn should_evict_oldest_dirtied_partition_when_over_budget() {
        // given - 3 MB in A (dirtied first), then 3 MB in B, budget 4 MB
        let mut settings = test_settings();
        settings.memtable_size_per_node = 4 * 1024 * 1024;
        let fixture = fixture(settings).await;
        let a = add_partition(&fixture, 1_000_000).await;
        let b = add_partition(&fixture, 1_000_001).await;
        write_bytes(&fixture, &a, 3 * 1024 * 1024, 1_000).await;
        write_bytes(&fixture, &b, 3 * 1024 * 1024, 2_000).await;

        // when
        let outcome = fixture
            .scheduler
            .run_once(&fixture.kv, &fixture.catalog, 3_000)
            .await
            .unwrap();

        // then - only A is flushed, bringing the total under budget
        assert_eq!(outcome.flushed, vec![1_000_000]);
        assert!(!a.is_dirty());
        assert!(b.is_dirty());
        assert_eq!(b.bytes_since_flush(), 3 * 1024 * 1024);
    }

    #[tokio::test]
    async fn should_clear_dirty_marker_after_redirty_grace_period() {
        // given - a flushed partition whose marker is still on disk
        let fixture = fixture(test_settings()).await;
        let p = add_partition(&fixture, 1_000_000).await;
        p.set_marker_on_disk(true);
        write_bytes(&fixture, &p, 100, 0).await;
        let outcome = fixture
            .scheduler
            .run_once(&fixture.kv, &fixture.catalog, 300_000)
            .await
            .unwrap();
        assert_eq!(outcome.flushed, vec![1_000_000]);
        assert!(p.marker_on_disk());

        // when - within the grace period, nothing happens
        let outcome = fixture
            .scheduler
            .run_once(&fixture.kv, &fixture.catalog, 303_000)
            .await
            .unwrap();
        assert!(outcome.markers_cleared.is_empty());

        // and after the grace period the marker is deleted
        let outcome = fixture
            .scheduler
            .run_once(&fixture.kv, &fixture.catalog, 305_000)
            .await
            .unwrap();

        // then
        assert_eq!(outcome.markers_cleared, vec![1_000_000]);
        assert!(!p.marker_on_disk());
    }
}
