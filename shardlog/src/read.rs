//! Read path: cursor-style range reads and findTime.
//!
//! A read resolves candidate partitions through the directory, takes one
//! substrate snapshot per partition and chains them in partition order.
//! Within one log, LSN ranges of different partitions are disjoint and
//! ordered, so chaining yields records in LSN order without a merge heap.
//!
//! With the copyset index enabled and a copyset filter present, the stream
//! scans the compact index entries first and fetches record values only
//! for LSNs that pass the filter, saving payload IO.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use common::{KvIterator, KvSnapshot};

use crate::error::{Error, Result};
use crate::metrics::ShardMetrics;
use crate::model::{
    payload_checksum_valid, record_flags, CopySet, LogId, Lsn, ReadItem, ShardIndex, StoredRecord,
};
use crate::partition::Partition;
use crate::serde::{CsiKey, CsiValue, FtiKey, RecordKey, RecordValue};

/// Predicate over record copysets, used by rebuilding reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopysetFilter {
    /// The copyset must include this shard.
    Contains(ShardIndex),
    /// The copyset must include at least one of these shards.
    ContainsAny(Vec<ShardIndex>),
}

impl CopysetFilter {
    pub fn matches(&self, copyset: &CopySet) -> bool {
        match self {
            CopysetFilter::Contains(shard) => copyset.contains(shard),
            CopysetFilter::ContainsAny(shards) => {
                copyset.iter().any(|shard| shards.contains(shard))
            }
        }
    }
}

/// Filter and bounds applied to a range read.
#[derive(Debug, Clone, Default)]
pub struct ReadFilter {
    pub copyset: Option<CopysetFilter>,
    /// Stop after yielding this many records.
    pub max_records: Option<usize>,
}

/// One partition's contribution to a read.
pub(crate) struct PartitionReader {
    pub snapshot: Arc<dyn KvSnapshot>,
    /// Keeps the partition alive (and its drop deferred) while the stream
    /// exists. `None` for the unpartitioned family.
    pub partition: Option<Arc<Partition>>,
}

enum Mode {
    /// Scan record keys directly.
    Records,
    /// Scan copyset index keys, fetch payloads for passing LSNs.
    CopysetIndex,
}

struct ActiveReader {
    snapshot: Arc<dyn KvSnapshot>,
    iter: Box<dyn KvIterator + Send>,
    _partition: Option<Arc<Partition>>,
}

/// Lazy, finite, forward-only stream of records and trim-gap markers.
pub struct RecordStream {
    log_id: LogId,
    from: Lsn,
    until: Lsn,
    pending_gap: Option<(Lsn, Lsn)>,
    readers: VecDeque<PartitionReader>,
    current: Option<ActiveReader>,
    filter: ReadFilter,
    mode: Mode,
    bounded_scans: bool,
    emitted: usize,
    metrics: Arc<ShardMetrics>,
}

impl RecordStream {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        log_id: LogId,
        from: Lsn,
        until: Lsn,
        pending_gap: Option<(Lsn, Lsn)>,
        readers: Vec<PartitionReader>,
        filter: ReadFilter,
        use_copyset_index: bool,
        bounded_scans: bool,
        metrics: Arc<ShardMetrics>,
    ) -> Self {
        let mode = if use_copyset_index && filter.copyset.is_some() {
            Mode::CopysetIndex
        } else {
            Mode::Records
        };
        Self {
            log_id,
            from,
            until,
            pending_gap,
            readers: readers.into(),
            current: None,
            filter,
            mode,
            bounded_scans,
            emitted: 0,
            metrics,
        }
    }

    /// Returns the next item, or `None` when the range is exhausted.
    pub async fn next(&mut self) -> Result<Option<ReadItem>> {
        if let Some((from, to)) = self.pending_gap.take() {
            return Ok(Some(ReadItem::TrimGap { from, to }));
        }
        if let Some(max) = self.filter.max_records {
            if self.emitted >= max {
                return Ok(None);
            }
        }
        if self.from > self.until {
            return Ok(None);
        }

        loop {
            if self.current.is_none() && !self.advance_partition().await? {
                return Ok(None);
            }

            let record = match self.mode {
                Mode::Records => self.next_record().await?,
                Mode::CopysetIndex => self.next_via_csi().await?,
            };
            match record {
                Some(record) => {
                    self.emitted += 1;
                    self.metrics.records_read_total.inc();
                    return Ok(Some(ReadItem::Record(record)));
                }
                // Current partition exhausted; move on.
                None => self.current = None,
            }
        }
    }

    async fn advance_partition(&mut self) -> Result<bool> {
        let Some(reader) = self.readers.pop_front() else {
            return Ok(false);
        };
        let range = match self.mode {
            Mode::Records => {
                RecordKey::scan_range(self.log_id, self.from, self.until, self.bounded_scans)
            }
            Mode::CopysetIndex => {
                CsiKey::scan_range(self.log_id, self.from, self.until, self.bounded_scans)
            }
        };
        let iter = reader.snapshot.scan(range).await?;
        self.current = Some(ActiveReader {
            snapshot: reader.snapshot,
            iter,
            _partition: reader.partition,
        });
        Ok(true)
    }

    async fn next_record(&mut self) -> Result<Option<StoredRecord>> {
        let reader = self.current.as_mut().expect("current reader is set");
        while let Some((key, value)) = reader.iter.next().await? {
            let key = RecordKey::deserialize(&key)?;
            if key.lsn > self.until {
                return Ok(None);
            }
            self.metrics.payload_reads_total.inc();
            let record = decode_record(self.log_id, key.lsn, &value)?;
            if let Some(filter) = &self.filter.copyset {
                if !filter.matches(&record.copyset) {
                    continue;
                }
            }
            return Ok(Some(record));
        }
        Ok(None)
    }

    async fn next_via_csi(&mut self) -> Result<Option<StoredRecord>> {
        loop {
            let reader = self.current.as_mut().expect("current reader is set");
            let Some((key, value)) = reader.iter.next().await? else {
                return Ok(None);
            };
            let key = CsiKey::deserialize(&key)?;
            if key.lsn > self.until {
                return Ok(None);
            }
            self.metrics.csi_entries_scanned_total.inc();
            let entry = CsiValue::deserialize(&value)?;
            let passes = match &self.filter.copyset {
                Some(filter) => filter.matches(&entry.copyset),
                None => true,
            };
            if !passes {
                continue;
            }

            let record_key = RecordKey::new(self.log_id, key.lsn).serialize();
            let Some(record_value) = reader.snapshot.get(record_key).await? else {
                return Err(Error::Corruption(format!(
                    "copyset index entry without record: log {} lsn {}",
                    self.log_id, key.lsn
                )));
            };
            self.metrics.payload_reads_total.inc();
            return Ok(Some(decode_record(self.log_id, key.lsn, &record_value)?));
        }
    }
}

fn decode_record(log_id: LogId, lsn: Lsn, value: &Bytes) -> Result<StoredRecord> {
    let value = RecordValue::deserialize(value)?;
    if value.flags & record_flags::CHECKSUM != 0 && !payload_checksum_valid(&value.payload) {
        return Err(Error::Corruption(format!(
            "checksum mismatch reading log {} lsn {}",
            log_id, lsn
        )));
    }
    Ok(StoredRecord {
        log_id,
        lsn,
        timestamp_ms: value.timestamp_ms,
        copyset: value.copyset,
        flags: value.flags,
        payload: value.payload,
    })
}

/// Smallest LSN in this snapshot whose record timestamp is at least
/// `target_ts`, using the findTime index when enabled.
pub(crate) async fn find_time_in_snapshot(
    snapshot: &Arc<dyn KvSnapshot>,
    log_id: LogId,
    target_ts: i64,
    read_find_time_index: bool,
    ts_bucket: u64,
) -> Result<Option<Lsn>> {
    if read_find_time_index {
        let mut iter = snapshot.scan(FtiKey::scan_from(log_id, ts_bucket)).await?;
        if let Some((_, value)) = iter.next().await? {
            return Ok(Some(crate::serde::deserialize_lsn(&value)?));
        }
        return Ok(None);
    }

    let mut iter = snapshot
        .scan(RecordKey::scan_range(log_id, 0, Lsn::MAX, true))
        .await?;
    while let Some((key, value)) = iter.next().await? {
        let key = RecordKey::deserialize(&key)?;
        let record = RecordValue::deserialize(&value)?;
        if record.timestamp_ms >= target_ts {
            return Ok(Some(key.lsn));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::kv::memory::MemoryKv;
    use common::{Kv, KvWriteOptions, WriteBatch};
    use smallvec::smallvec;

    use crate::serde::serialize_lsn;

    const LOG: LogId = 7;

    async fn store_record(
        kv: &MemoryKv,
        family: &common::FamilyHandle,
        lsn: Lsn,
        timestamp_ms: i64,
        copyset: CopySet,
        payload: &[u8],
        with_csi: bool,
    ) {
        let mut batch = WriteBatch::new();
        let value = RecordValue {
            flags: 0,
            timestamp_ms,
            copyset: copyset.clone(),
            payload: Bytes::copy_from_slice(payload),
        };
        batch.put(family, RecordKey::new(LOG, lsn).serialize(), value.serialize());
        if with_csi {
            batch.put(
                family,
                CsiKey::new(LOG, lsn).serialize(),
                CsiValue { copyset }.serialize(),
            );
        }
        kv.write(batch, KvWriteOptions::default()).await.unwrap();
    }

    async fn stream(
        kv: &MemoryKv,
        family: &common::FamilyHandle,
        from: Lsn,
        until: Lsn,
        filter: ReadFilter,
        use_csi: bool,
    ) -> RecordStream {
        let snapshot = kv.snapshot(family).await.unwrap();
        RecordStream::new(
            LOG,
            from,
            until,
            None,
            vec![PartitionReader {
                snapshot,
                partition: None,
            }],
            filter,
            use_csi,
            true,
            Arc::new(ShardMetrics::new()),
        )
    }

    async fn collect(stream: &mut RecordStream) -> Vec<ReadItem> {
        let mut items = Vec::new();
        while let Some(item) = stream.next().await.unwrap() {
            items.push(item);
        }
        items
    }

    #[tokio::test]
    async fn should_stream_records_in_lsn_order() {
        // given
        let kv = MemoryKv::new();
        let family = kv.create_family("partition_1000000").await.unwrap();
        for lsn in [102u64, 100, 101] {
            store_record(&kv, &family, lsn, 1_000, smallvec![1, 2, 3], b"x", false).await;
        }

        // when
        let mut stream = stream(&kv, &family, 0, 200, ReadFilter::default(), false).await;
        let items = collect(&mut stream).await;

        // then
        let lsns: Vec<Lsn> = items
            .iter()
            .map(|item| match item {
                ReadItem::Record(record) => record.lsn,
                other => panic!("unexpected item {:?}", other),
            })
            .collect();
        assert_eq!(lsns, vec![100, 101, 102]);
    }

    #[tokio::test]
    async fn should_respect_lsn_bounds() {
        // given
        let kv = MemoryKv::new();
        let family = kv.create_family("partition_1000000").await.unwrap();
        for lsn in 100u64..110 {
            store_record(&kv, &family, lsn, 1_000, smallvec![1], b"x", false).await;
        }

        // when
        let mut stream = stream(&kv, &family, 103, 105, ReadFilter::default(), false).await;
        let items = collect(&mut stream).await;

        // then
        assert_eq!(items.len(), 3);
    }

    #[tokio::test]
    async fn should_emit_trim_gap_before_records() {
        // given
        let kv = MemoryKv::new();
        let family = kv.create_family("partition_1000000").await.unwrap();
        store_record(&kv, &family, 101, 1_000, smallvec![1], b"b", false).await;
        let snapshot = kv.snapshot(&family).await.unwrap();

        // when - the caller resolved trim point 100 into a pending gap
        let mut stream = RecordStream::new(
            LOG,
            101,
            200,
            Some((0, 100)),
            vec![PartitionReader {
                snapshot,
                partition: None,
            }],
            ReadFilter::default(),
            false,
            true,
            Arc::new(ShardMetrics::new()),
        );
        let items = collect(&mut stream).await;

        // then
        assert_eq!(items.len(), 2);
        assert_eq!(items[0], ReadItem::TrimGap { from: 0, to: 100 });
        assert!(matches!(&items[1], ReadItem::Record(r) if r.lsn == 101));
    }

    #[tokio::test]
    async fn should_filter_by_copyset_without_index() {
        // given - records on two disjoint copysets
        let kv = MemoryKv::new();
        let family = kv.create_family("partition_1000000").await.unwrap();
        for lsn in 0u64..10 {
            let copyset: CopySet = if lsn % 2 == 0 {
                smallvec![1, 2, 3]
            } else {
                smallvec![4, 5, 6]
            };
            store_record(&kv, &family, lsn, 1_000, copyset, b"x", false).await;
        }

        // when
        let filter = ReadFilter {
            copyset: Some(CopysetFilter::Contains(1)),
            max_records: None,
        };
        let mut stream = stream(&kv, &family, 0, 100, filter, false).await;
        let items = collect(&mut stream).await;

        // then
        assert_eq!(items.len(), 5);
        for item in items {
            match item {
                ReadItem::Record(record) => assert!(record.copyset.contains(&1)),
                other => panic!("unexpected item {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn should_fetch_only_matching_payloads_with_copyset_index() {
        // given - 10 records, half matching, with CSI entries
        let kv = MemoryKv::new();
        let family = kv.create_family("partition_1000000").await.unwrap();
        for lsn in 0u64..10 {
            let copyset: CopySet = if lsn % 2 == 0 {
                smallvec![1, 2, 3]
            } else {
                smallvec![4, 5, 6]
            };
            store_record(&kv, &family, lsn, 1_000, copyset, b"x", true).await;
        }
        let metrics = Arc::new(ShardMetrics::new());
        let snapshot = kv.snapshot(&family).await.unwrap();

        // when
        let mut stream = RecordStream::new(
            LOG,
            0,
            100,
            None,
            vec![PartitionReader {
                snapshot,
                partition: None,
            }],
            ReadFilter {
                copyset: Some(CopysetFilter::Contains(4)),
                max_records: None,
            },
            true,
            true,
            metrics.clone(),
        );
        let items = collect(&mut stream).await;

        // then - 5 records emitted, 10 index entries scanned, only 5
        // payloads fetched
        assert_eq!(items.len(), 5);
        assert_eq!(metrics.csi_entries_scanned_total.get(), 10);
        assert_eq!(metrics.payload_reads_total.get(), 5);
    }

    #[tokio::test]
    async fn should_return_identical_results_with_and_without_index() {
        // given
        let kv = MemoryKv::new();
        let family = kv.create_family("partition_1000000").await.unwrap();
        for lsn in 0u64..20 {
            let copyset: CopySet = if lsn % 3 == 0 {
                smallvec![1, 2]
            } else {
                smallvec![8, 9]
            };
            store_record(&kv, &family, lsn, 1_000, copyset, b"p", true).await;
        }
        let filter = ReadFilter {
            copyset: Some(CopysetFilter::Contains(9)),
            max_records: None,
        };

        // when
        let mut with_csi = stream(&kv, &family, 0, 100, filter.clone(), true).await;
        let mut without_csi = stream(&kv, &family, 0, 100, filter, false).await;

        // then
        assert_eq!(collect(&mut with_csi).await, collect(&mut without_csi).await);
    }

    #[tokio::test]
    async fn should_stop_after_max_records() {
        // given
        let kv = MemoryKv::new();
        let family = kv.create_family("partition_1000000").await.unwrap();
        for lsn in 0u64..10 {
            store_record(&kv, &family, lsn, 1_000, smallvec![1], b"x", false).await;
        }

        // when
        let filter = ReadFilter {
            copyset: None,
            max_records: Some(3),
        };
        let mut stream = stream(&kv, &family, 0, 100, filter, false).await;
        let items = collect(&mut stream).await;

        // then
        assert_eq!(items.len(), 3);
    }

    #[tokio::test]
    async fn should_surface_missing_record_behind_csi_entry_as_corruption() {
        // given - a CSI entry with no record
        let kv = MemoryKv::new();
        let family = kv.create_family("partition_1000000").await.unwrap();
        let mut batch = WriteBatch::new();
        batch.put(
            &family,
            CsiKey::new(LOG, 5).serialize(),
            CsiValue {
                copyset: smallvec![1],
            }
            .serialize(),
        );
        kv.write(batch, KvWriteOptions::default()).await.unwrap();

        // when
        let filter = ReadFilter {
            copyset: Some(CopysetFilter::Contains(1)),
            max_records: None,
        };
        let mut stream = stream(&kv, &family, 0, 100, filter, true).await;
        let result = stream.next().await;

        // then
        assert!(matches!(result, Err(Error::Corruption(_))));
    }

    #[tokio::test]
    async fn should_find_time_by_scanning_record_timestamps() {
        // given - records at timestamps 1000, 2000, 3000
        let kv = MemoryKv::new();
        let family = kv.create_family("partition_1000000").await.unwrap();
        for (lsn, ts) in [(100u64, 1_000i64), (101, 2_000), (102, 3_000)] {
            store_record(&kv, &family, lsn, ts, smallvec![1], b"x", false).await;
        }
        let snapshot = kv.snapshot(&family).await.unwrap();

        // when/then
        assert_eq!(
            find_time_in_snapshot(&snapshot, LOG, 1_500, false, 0)
                .await
                .unwrap(),
            Some(101)
        );
        assert_eq!(
            find_time_in_snapshot(&snapshot, LOG, 500, false, 0)
                .await
                .unwrap(),
            Some(100)
        );
        assert_eq!(
            find_time_in_snapshot(&snapshot, LOG, 5_000, false, 0)
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn should_find_time_via_index_when_enabled() {
        // given - index entries for buckets 2 and 4 (5s granularity)
        let kv = MemoryKv::new();
        let family = kv.create_family("partition_1000000").await.unwrap();
        let mut batch = WriteBatch::new();
        batch.put(&family, FtiKey::new(LOG, 2).serialize(), serialize_lsn(200));
        batch.put(&family, FtiKey::new(LOG, 4).serialize(), serialize_lsn(400));
        kv.write(batch, KvWriteOptions::default()).await.unwrap();
        let snapshot = kv.snapshot(&family).await.unwrap();

        // when/then - bucket 3 has no entry, the next one answers
        assert_eq!(
            find_time_in_snapshot(&snapshot, LOG, 15_000, true, 3)
                .await
                .unwrap(),
            Some(400)
        );
        assert_eq!(
            find_time_in_snapshot(&snapshot, LOG, 10_000, true, 2)
                .await
                .unwrap(),
            Some(200)
        );
    }
}
