//! Per-log, per-partition directory.
//!
//! The directory records, for every log, which partitions hold its records
//! and the `[first_lsn, last_lsn]` range in each, plus the log's trim
//! point. It is persisted in the metadata column family and cached in RAM
//! as a two-level map striped by log id.
//!
//! Updates follow a build/apply discipline: `build_*` computes the new
//! state and appends the corresponding rows to a write batch without
//! mutating the cache; `apply_*` commits the cached state only after the
//! substrate write succeeded. The cache may therefore over-approximate the
//! on-disk ranges after a failed write, never under-approximate them.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use common::{FamilyHandle, Kv, KvSnapshot, WriteBatch};
use parking_lot::Mutex;
use tracing::warn;

use crate::error::Result;
use crate::model::{DirectoryEntry, LogId, Lsn, PartitionId};
use crate::serde::{
    deserialize_dir_entry, deserialize_lsn, serialize_dir_entry, serialize_lsn, DirKey, FtiKey,
    LogKey, RecordType,
};

#[derive(Default)]
struct LogState {
    entries: BTreeMap<PartitionId, DirectoryEntry>,
    trim_point: Lsn,
    /// Last findTime bucket written per partition, to write each bucket's
    /// index entry once.
    last_fti_bucket: HashMap<PartitionId, u64>,
    /// When this log was first seen missing from the logs config.
    unconfigured_since_ms: Option<i64>,
}

/// Outcome of [`Directory::build_store_delta`].
pub(crate) struct StoreDelta {
    log_id: LogId,
    partition_id: PartitionId,
    entry: DirectoryEntry,
    fti_bucket: Option<u64>,
}

/// Outcome of [`Directory::build_trim_delta`].
pub(crate) struct TrimDelta {
    log_id: LogId,
    trim_point: Lsn,
}

/// Outcome of [`Directory::build_gc_delta`] /
/// [`Directory::build_partition_drop_delta`].
pub(crate) struct RemovalDelta {
    removals: Vec<(LogId, PartitionId)>,
}

impl RemovalDelta {
    pub fn is_empty(&self) -> bool {
        self.removals.is_empty()
    }
}

pub(crate) struct Directory {
    stripes: Box<[Mutex<HashMap<LogId, LogState>>]>,
    metadata: FamilyHandle,
}

impl Directory {
    pub fn new(metadata: FamilyHandle, num_locks: usize) -> Self {
        let stripes = (0..num_locks.max(1))
            .map(|_| Mutex::new(HashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { stripes, metadata }
    }

    fn stripe(&self, log_id: LogId) -> &Mutex<HashMap<LogId, LogState>> {
        &self.stripes[(log_id % self.stripes.len() as u64) as usize]
    }

    /// Loads directory entries and trim points from the metadata family.
    pub async fn load(&self, kv: &dyn Kv) -> Result<()> {
        let snapshot = kv.snapshot(&self.metadata).await?;

        let mut iter = snapshot.scan(DirKey::scan_all()).await?;
        while let Some((key, value)) = iter.next().await? {
            let key = DirKey::deserialize(&key)?;
            let entry = deserialize_dir_entry(&value)?;
            let mut stripe = self.stripe(key.log_id).lock();
            stripe
                .entry(key.log_id)
                .or_default()
                .entries
                .insert(key.partition_id, entry);
        }

        let mut iter = snapshot.scan(LogKey::scan_all(RecordType::TrimPoint)).await?;
        while let Some((key, value)) = iter.next().await? {
            let key = LogKey::deserialize(&key, RecordType::TrimPoint)?;
            let trim = deserialize_lsn(&value)?;
            let mut stripe = self.stripe(key.log_id).lock();
            stripe.entry(key.log_id).or_default().trim_point = trim;
        }
        Ok(())
    }

    /// Computes the directory rows for one record write and appends them to
    /// `batch`. The cache is untouched until [`Self::apply_store_delta`].
    pub fn build_store_delta(
        &self,
        log_id: LogId,
        partition_id: PartitionId,
        partition_family: &FamilyHandle,
        lsn: Lsn,
        size: u64,
        ts_bucket: u64,
        batch: &mut WriteBatch,
    ) -> StoreDelta {
        let stripe = self.stripe(log_id).lock();
        let state = stripe.get(&log_id);

        let entry = match state.and_then(|s| s.entries.get(&partition_id)) {
            Some(existing) => {
                let mut updated = *existing;
                updated.absorb(lsn, size);
                updated
            }
            None => DirectoryEntry::for_record(lsn, size),
        };
        batch.put(
            &self.metadata,
            DirKey::new(log_id, partition_id).serialize(),
            serialize_dir_entry(&entry),
        );

        let fti_bucket = match state.and_then(|s| s.last_fti_bucket.get(&partition_id)) {
            Some(&last) if last == ts_bucket => None,
            _ => Some(ts_bucket),
        };
        if let Some(bucket) = fti_bucket {
            batch.put(
                partition_family,
                FtiKey::new(log_id, bucket).serialize(),
                serialize_lsn(lsn),
            );
        }

        StoreDelta {
            log_id,
            partition_id,
            entry,
            fti_bucket,
        }
    }

    pub fn apply_store_delta(&self, delta: StoreDelta) {
        let mut stripe = self.stripe(delta.log_id).lock();
        let state = stripe.entry(delta.log_id).or_default();
        state.entries.insert(delta.partition_id, delta.entry);
        if let Some(bucket) = delta.fti_bucket {
            state.last_fti_bucket.insert(delta.partition_id, bucket);
        }
    }

    pub fn trim_point(&self, log_id: LogId) -> Lsn {
        self.stripe(log_id)
            .lock()
            .get(&log_id)
            .map(|s| s.trim_point)
            .unwrap_or(0)
    }

    /// Prepares a trim-point advance; returns `None` when the new point
    /// does not move forward (trims are idempotent).
    pub fn build_trim_delta(
        &self,
        log_id: LogId,
        trim_point: Lsn,
        batch: &mut WriteBatch,
    ) -> Option<TrimDelta> {
        let current = self.trim_point(log_id);
        if trim_point <= current {
            return None;
        }
        batch.put(
            &self.metadata,
            LogKey::trim(log_id).serialize(),
            serialize_lsn(trim_point),
        );
        Some(TrimDelta {
            log_id,
            trim_point,
        })
    }

    pub fn apply_trim_delta(&self, delta: TrimDelta) {
        let mut stripe = self.stripe(delta.log_id).lock();
        let state = stripe.entry(delta.log_id).or_default();
        state.trim_point = state.trim_point.max(delta.trim_point);
    }

    /// Prepares removal of directory entries whose whole range is trimmed.
    pub fn build_gc_delta(&self, log_id: LogId, batch: &mut WriteBatch) -> RemovalDelta {
        let stripe = self.stripe(log_id).lock();
        let mut removals = Vec::new();
        if let Some(state) = stripe.get(&log_id) {
            for (&partition_id, entry) in &state.entries {
                if entry.last_lsn <= state.trim_point {
                    batch.delete(
                        &self.metadata,
                        DirKey::new(log_id, partition_id).serialize(),
                    );
                    removals.push((log_id, partition_id));
                }
            }
        }
        RemovalDelta { removals }
    }

    /// Prepares removal of every log's entry in one partition, for drops.
    pub fn build_partition_drop_delta(
        &self,
        partition_id: PartitionId,
        batch: &mut WriteBatch,
    ) -> RemovalDelta {
        let mut removals = Vec::new();
        for stripe in self.stripes.iter() {
            let stripe = stripe.lock();
            for (&log_id, state) in stripe.iter() {
                if state.entries.contains_key(&partition_id) {
                    batch.delete(
                        &self.metadata,
                        DirKey::new(log_id, partition_id).serialize(),
                    );
                    removals.push((log_id, partition_id));
                }
            }
        }
        RemovalDelta { removals }
    }

    pub fn apply_removal_delta(&self, delta: RemovalDelta) {
        for (log_id, partition_id) in delta.removals {
            let mut stripe = self.stripe(log_id).lock();
            if let Some(state) = stripe.get_mut(&log_id) {
                state.entries.remove(&partition_id);
                state.last_fti_bucket.remove(&partition_id);
            }
        }
    }

    /// Partitions whose entry for `log_id` overlaps `[from, until]`,
    /// ordered by partition id.
    pub fn lookup(
        &self,
        log_id: LogId,
        from: Lsn,
        until: Lsn,
    ) -> Vec<(PartitionId, DirectoryEntry)> {
        let stripe = self.stripe(log_id).lock();
        match stripe.get(&log_id) {
            Some(state) => state
                .entries
                .iter()
                .filter(|(_, entry)| entry.first_lsn <= until && entry.last_lsn >= from)
                .map(|(&partition_id, entry)| (partition_id, *entry))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Every log's entry in one partition.
    pub fn partition_entries(&self, partition_id: PartitionId) -> Vec<(LogId, DirectoryEntry)> {
        let mut result = Vec::new();
        for stripe in self.stripes.iter() {
            let stripe = stripe.lock();
            for (&log_id, state) in stripe.iter() {
                if let Some(entry) = state.entries.get(&partition_id) {
                    result.push((log_id, *entry));
                }
            }
        }
        result.sort_by_key(|(log_id, _)| *log_id);
        result
    }

    /// All logs with at least one directory entry.
    pub fn logs(&self) -> Vec<LogId> {
        let mut logs = Vec::new();
        for stripe in self.stripes.iter() {
            let stripe = stripe.lock();
            for (&log_id, state) in stripe.iter() {
                if !state.entries.is_empty() {
                    logs.push(log_id);
                }
            }
        }
        logs.sort_unstable();
        logs
    }

    /// Highest known LSN of a log across all partitions.
    pub fn last_lsn(&self, log_id: LogId) -> Option<Lsn> {
        let stripe = self.stripe(log_id).lock();
        stripe
            .get(&log_id)
            .and_then(|s| s.entries.values().map(|e| e.last_lsn).max())
    }

    /// Records when a log was first observed to be unconfigured and
    /// returns that instant.
    pub fn note_unconfigured(&self, log_id: LogId, now_ms: i64) -> i64 {
        let mut stripe = self.stripe(log_id).lock();
        let state = stripe.entry(log_id).or_default();
        *state.unconfigured_since_ms.get_or_insert(now_ms)
    }

    pub fn clear_unconfigured(&self, log_id: LogId) {
        let mut stripe = self.stripe(log_id).lock();
        if let Some(state) = stripe.get_mut(&log_id) {
            state.unconfigured_since_ms = None;
        }
    }

    /// Compares the cache against the persisted directory and widens cached
    /// ranges where they diverge. Returns the number of divergent entries.
    pub async fn reconcile(&self, snapshot: &Arc<dyn KvSnapshot>) -> Result<usize> {
        let mut divergent = 0;
        let mut iter = snapshot.scan(DirKey::scan_all()).await?;
        while let Some((key, value)) = iter.next().await? {
            let key = DirKey::deserialize(&key)?;
            let disk = deserialize_dir_entry(&value)?;
            let mut stripe = self.stripe(key.log_id).lock();
            let state = stripe.entry(key.log_id).or_default();
            match state.entries.get_mut(&key.partition_id) {
                Some(cached) => {
                    if cached.first_lsn > disk.first_lsn || cached.last_lsn < disk.last_lsn {
                        divergent += 1;
                        cached.first_lsn = cached.first_lsn.min(disk.first_lsn);
                        cached.last_lsn = cached.last_lsn.max(disk.last_lsn);
                    }
                }
                None => {
                    divergent += 1;
                    state.entries.insert(key.partition_id, disk);
                }
            }
        }
        if divergent > 0 {
            warn!(divergent, "directory cache diverged from disk; widened");
        }
        Ok(divergent)
    }
}
