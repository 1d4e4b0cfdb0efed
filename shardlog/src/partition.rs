//! Partitions and the partition catalog.
//!
//! A partition is a time-bounded column family. Partitions are totally
//! ordered by id; their `min_ts` bounds are non-decreasing in id, so the
//! catalog can binary-search a timestamp to its partition. Shared mutable
//! state on a partition (timestamp ceiling, dirty accounting, lifecycle
//! flags) is atomics, so the catalog lock is only held for structural
//! changes.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use common::FamilyHandle;
use parking_lot::RwLock;

use crate::model::PartitionId;

/// First partition id of a fresh shard. Leaves room below for partitions
/// prepended to hold records older than any existing partition.
pub(crate) const INITIAL_PARTITION_ID: PartitionId = 1_000_000;

/// One time-bounded partition.
pub(crate) struct Partition {
    id: PartitionId,
    family: FamilyHandle,
    /// Lower timestamp bound, fixed at creation.
    min_ts: i64,
    /// Highest record timestamp observed, advanced by writes.
    max_ts: AtomicI64,
    creation_time_ms: i64,
    prepended: bool,

    // Dirty/flush accounting.
    dirty: AtomicBool,
    /// Wall clock of the first write since the last flush; 0 when clean.
    first_dirtied_ms: AtomicI64,
    last_write_ms: AtomicI64,
    bytes_since_flush: AtomicU64,
    /// Wall clock of the last completed flush; 0 if never flushed.
    clean_since_ms: AtomicI64,
    /// The on-disk dirty marker exists.
    marker_on_disk: AtomicBool,
    /// A dirty marker from a previous process generation was found at open.
    recovered_dirty: AtomicBool,

    // Lifecycle.
    dropping: AtomicBool,
    /// Largest schedule age this partition was already compacted at, in
    /// seconds; 0 if never.
    compacted_up_to_secs: AtomicU64,
}

impl Partition {
    pub fn new(
        id: PartitionId,
        family: FamilyHandle,
        min_ts: i64,
        creation_time_ms: i64,
        prepended: bool,
    ) -> Self {
        Self {
            id,
            family,
            min_ts,
            max_ts: AtomicI64::new(min_ts),
            creation_time_ms,
            prepended,
            dirty: AtomicBool::new(false),
            first_dirtied_ms: AtomicI64::new(0),
            last_write_ms: AtomicI64::new(0),
            bytes_since_flush: AtomicU64::new(0),
            clean_since_ms: AtomicI64::new(0),
            marker_on_disk: AtomicBool::new(false),
            recovered_dirty: AtomicBool::new(false),
            dropping: AtomicBool::new(false),
            compacted_up_to_secs: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> PartitionId {
        self.id
    }

    pub fn family(&self) -> &FamilyHandle {
        &self.family
    }

    pub fn min_ts(&self) -> i64 {
        self.min_ts
    }

    pub fn max_ts(&self) -> i64 {
        self.max_ts.load(Ordering::Relaxed)
    }

    pub fn creation_time_ms(&self) -> i64 {
        self.creation_time_ms
    }

    pub fn is_prepended(&self) -> bool {
        self.prepended
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn first_dirtied_ms(&self) -> i64 {
        self.first_dirtied_ms.load(Ordering::Relaxed)
    }

    pub fn last_write_ms(&self) -> i64 {
        self.last_write_ms.load(Ordering::Relaxed)
    }

    pub fn bytes_since_flush(&self) -> u64 {
        self.bytes_since_flush.load(Ordering::Relaxed)
    }

    pub fn clean_since_ms(&self) -> i64 {
        self.clean_since_ms.load(Ordering::Relaxed)
    }

    pub fn marker_on_disk(&self) -> bool {
        self.marker_on_disk.load(Ordering::Acquire)
    }

    pub fn set_marker_on_disk(&self, value: bool) {
        self.marker_on_disk.store(value, Ordering::Release);
    }

    pub fn recovered_dirty(&self) -> bool {
        self.recovered_dirty.load(Ordering::Relaxed)
    }

    pub fn set_recovered_dirty(&self) {
        self.recovered_dirty.store(true, Ordering::Relaxed);
    }

    pub fn is_dropping(&self) -> bool {
        self.dropping.load(Ordering::Acquire)
    }

    pub fn mark_dropping(&self) {
        self.dropping.store(true, Ordering::Release);
    }

    pub fn compacted_up_to_secs(&self) -> u64 {
        self.compacted_up_to_secs.load(Ordering::Relaxed)
    }

    pub fn set_compacted_up_to_secs(&self, secs: u64) {
        self.compacted_up_to_secs.fetch_max(secs, Ordering::Relaxed);
    }

    /// Raises the timestamp ceiling without touching dirty accounting,
    /// used when rebuilding catalog state at open.
    pub fn raise_max_ts(&self, ts: i64) {
        self.max_ts.fetch_max(ts, Ordering::Relaxed);
    }

    /// Records a committed write. Returns true if the partition was clean
    /// before, i.e. this write dirtied it.
    pub fn observe_write(&self, record_ts: i64, bytes: u64, now_ms: i64) -> bool {
        self.max_ts.fetch_max(record_ts, Ordering::Relaxed);
        self.last_write_ms.store(now_ms, Ordering::Relaxed);
        self.bytes_since_flush.fetch_add(bytes, Ordering::Relaxed);
        let was_clean = !self.dirty.swap(true, Ordering::AcqRel);
        if was_clean {
            self.first_dirtied_ms.store(now_ms, Ordering::Relaxed);
        }
        was_clean
    }

    /// Resets dirty accounting after a completed flush.
    pub fn mark_clean(&self, now_ms: i64) {
        self.dirty.store(false, Ordering::Release);
        self.first_dirtied_ms.store(0, Ordering::Relaxed);
        self.bytes_since_flush.store(0, Ordering::Relaxed);
        self.clean_since_ms.store(now_ms, Ordering::Relaxed);
    }

    pub fn age(&self, now_ms: i64) -> i64 {
        now_ms - self.creation_time_ms
    }
}

/// Ordered set of live partitions.
///
/// Readers resolve partitions under the shared lock; create/drop take the
/// exclusive lock only to mutate the maps, never across substrate calls.
pub(crate) struct PartitionCatalog {
    inner: RwLock<CatalogInner>,
    next_id: AtomicU64,
}

#[derive(Default)]
struct CatalogInner {
    by_id: BTreeMap<PartitionId, Arc<Partition>>,
    /// Secondary index for timestamp lookup; identical `min_ts` values are
    /// tie-broken by partition id.
    by_min_ts: BTreeMap<(i64, PartitionId), Arc<Partition>>,
}

impl PartitionCatalog {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(CatalogInner::default()),
            next_id: AtomicU64::new(INITIAL_PARTITION_ID),
        }
    }

    /// Next id for a fresh (appended) partition.
    pub fn allocate_id(&self) -> PartitionId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Id for a partition prepended below the current oldest. Returns
    /// `None` when there is no room left or no partition exists yet.
    pub fn allocate_prepend_id(&self) -> Option<PartitionId> {
        let inner = self.inner.read();
        let oldest = *inner.by_id.keys().next()?;
        oldest.checked_sub(1)
    }

    pub fn insert(&self, partition: Arc<Partition>) {
        let mut inner = self.inner.write();
        let id = partition.id();
        inner
            .by_min_ts
            .insert((partition.min_ts(), id), partition.clone());
        inner.by_id.insert(id, partition);
        // Keep the id allocator ahead of recovered partitions.
        self.next_id.fetch_max(id + 1, Ordering::SeqCst);
    }

    pub fn remove(&self, id: PartitionId) -> Option<Arc<Partition>> {
        let mut inner = self.inner.write();
        let partition = inner.by_id.remove(&id)?;
        inner.by_min_ts.remove(&(partition.min_ts(), id));
        Some(partition)
    }

    pub fn get(&self, id: PartitionId) -> Option<Arc<Partition>> {
        self.inner.read().by_id.get(&id).cloned()
    }

    pub fn latest(&self) -> Option<Arc<Partition>> {
        self.inner.read().by_id.values().next_back().cloned()
    }

    pub fn oldest(&self) -> Option<Arc<Partition>> {
        self.inner.read().by_id.values().next().cloned()
    }

    pub fn count(&self) -> usize {
        self.inner.read().by_id.len()
    }

    /// All partitions, oldest first.
    pub fn all(&self) -> Vec<Arc<Partition>> {
        self.inner.read().by_id.values().cloned().collect()
    }

    /// The partition whose time range covers `ts`: the highest-id partition
    /// with `min_ts <= ts`. Returns `None` when `ts` predates every
    /// partition.
    pub fn find_for_timestamp(&self, ts: i64) -> Option<Arc<Partition>> {
        let inner = self.inner.read();
        inner
            .by_min_ts
            .range(..=(ts, PartitionId::MAX))
            .next_back()
            .map(|(_, partition)| partition.clone())
    }

    /// The `n` newest partition ids.
    pub fn newest_ids(&self, n: usize) -> Vec<PartitionId> {
        let inner = self.inner.read();
        inner.by_id.keys().rev().take(n).copied().collect()
    }
}

impl Default for PartitionCatalog {
    fn default() -> Self {
        Self::new()
    }
}
