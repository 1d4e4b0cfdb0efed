//! In-memory KV substrate.
//!
//! Models the full substrate surface, including the parts persistent
//! backends keep internal: each family has an explicit memtable and an
//! ordered list of immutable level-0 files, so flush scheduling and
//! compaction policies can be exercised deterministically in tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use super::{
    BatchOp, FamilyHandle, Kv, KvError, KvIterator, KvProperty, KvResult, KvSnapshot,
    KvWriteOptions, L0FileInfo, WriteBatch,
};
use crate::util::BytesRange;

/// `None` marks a tombstone.
type Slot = Option<Bytes>;

struct L0File {
    id: u64,
    size_bytes: u64,
    data: Arc<BTreeMap<Bytes, Slot>>,
}

#[derive(Default)]
struct FamilyState {
    memtable: BTreeMap<Bytes, Slot>,
    memtable_bytes: u64,
    /// Oldest first.
    files: Vec<L0File>,
}

impl FamilyState {
    fn get(&self, key: &Bytes) -> Option<Bytes> {
        if let Some(slot) = self.memtable.get(key) {
            return slot.clone();
        }
        for file in self.files.iter().rev() {
            if let Some(slot) = file.data.get(key) {
                return slot.clone();
            }
        }
        None
    }

    /// Merged view with tombstones resolved, oldest data overwritten by newest.
    fn merged(&self) -> BTreeMap<Bytes, Bytes> {
        let mut merged = BTreeMap::new();
        for file in &self.files {
            Self::apply(&mut merged, &file.data);
        }
        Self::apply(&mut merged, &self.memtable);
        merged
    }

    fn apply(target: &mut BTreeMap<Bytes, Bytes>, layer: &BTreeMap<Bytes, Slot>) {
        for (key, slot) in layer {
            match slot {
                Some(value) => {
                    target.insert(key.clone(), value.clone());
                }
                None => {
                    target.remove(key);
                }
            }
        }
    }

    fn data_bytes(data: &BTreeMap<Bytes, Slot>) -> u64 {
        data.iter()
            .map(|(k, v)| k.len() as u64 + v.as_ref().map(|v| v.len() as u64).unwrap_or(0))
            .sum()
    }
}

/// In-memory implementation of [`Kv`].
pub struct MemoryKv {
    families: Mutex<HashMap<String, FamilyState>>,
    next_file_id: AtomicU64,
    wal_syncs: AtomicU64,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self {
            families: Mutex::new(HashMap::new()),
            next_file_id: AtomicU64::new(1),
            wal_syncs: AtomicU64::new(0),
        }
    }

    /// Number of WAL syncs performed, for durability-policy tests.
    pub fn wal_sync_count(&self) -> u64 {
        self.wal_syncs.load(Ordering::Relaxed)
    }

    fn fresh_file_id(&self) -> u64 {
        self.next_file_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

struct MemorySnapshot {
    data: Arc<BTreeMap<Bytes, Bytes>>,
}

#[async_trait]
impl KvSnapshot for MemorySnapshot {
    async fn get(&self, key: Bytes) -> KvResult<Option<Bytes>> {
        Ok(self.data.get(&key).cloned())
    }

    async fn scan(&self, range: BytesRange) -> KvResult<Box<dyn KvIterator + Send>> {
        let items: Vec<(Bytes, Bytes)> = self
            .data
            .range(range)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(Box::new(MemoryIterator {
            items: items.into_iter(),
        }))
    }
}

struct MemoryIterator {
    items: std::vec::IntoIter<(Bytes, Bytes)>,
}

#[async_trait]
impl KvIterator for MemoryIterator {
    async fn next(&mut self) -> KvResult<Option<(Bytes, Bytes)>> {
        Ok(self.items.next())
    }
}

#[async_trait]
impl Kv for MemoryKv {
    async fn create_family(&self, name: &str) -> KvResult<FamilyHandle> {
        let mut families = self.families.lock();
        families.entry(name.to_string()).or_default();
        Ok(FamilyHandle::new(name))
    }

    async fn drop_family(&self, family: &FamilyHandle) -> KvResult<()> {
        let mut families = self.families.lock();
        families
            .remove(family.name())
            .map(|_| ())
            .ok_or_else(|| KvError::NotFound(family.name().to_string()))
    }

    async fn list_families(&self) -> KvResult<Vec<String>> {
        Ok(self.families.lock().keys().cloned().collect())
    }

    async fn write(&self, batch: WriteBatch, options: KvWriteOptions) -> KvResult<()> {
        let mut families = self.families.lock();

        // Validate up front so a failed batch leaves no partial state.
        for op in batch.ops() {
            let family = match op {
                BatchOp::Put { family, .. } | BatchOp::Delete { family, .. } => family,
            };
            if !families.contains_key(family.name()) {
                return Err(KvError::NotFound(family.name().to_string()));
            }
        }

        for op in batch.into_ops() {
            match op {
                BatchOp::Put { family, key, value } => {
                    let state = families.get_mut(family.name()).unwrap();
                    state.memtable_bytes += key.len() as u64 + value.len() as u64;
                    state.memtable.insert(key, Some(value));
                }
                BatchOp::Delete { family, key } => {
                    let state = families.get_mut(family.name()).unwrap();
                    state.memtable_bytes += key.len() as u64;
                    state.memtable.insert(key, None);
                }
            }
        }

        if options.sync_wal {
            self.wal_syncs.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn get(&self, family: &FamilyHandle, key: Bytes) -> KvResult<Option<Bytes>> {
        let families = self.families.lock();
        let state = families
            .get(family.name())
            .ok_or_else(|| KvError::NotFound(family.name().to_string()))?;
        Ok(state.get(&key))
    }

    async fn snapshot(&self, family: &FamilyHandle) -> KvResult<Arc<dyn KvSnapshot>> {
        let families = self.families.lock();
        let state = families
            .get(family.name())
            .ok_or_else(|| KvError::NotFound(family.name().to_string()))?;
        Ok(Arc::new(MemorySnapshot {
            data: Arc::new(state.merged()),
        }))
    }

    async fn flush(&self, family: &FamilyHandle) -> KvResult<()> {
        let id = self.fresh_file_id();
        let mut families = self.families.lock();
        let state = families
            .get_mut(family.name())
            .ok_or_else(|| KvError::NotFound(family.name().to_string()))?;
        if state.memtable.is_empty() {
            return Ok(());
        }
        let data = std::mem::take(&mut state.memtable);
        let size_bytes = state.memtable_bytes;
        state.memtable_bytes = 0;
        state.files.push(L0File {
            id,
            size_bytes,
            data: Arc::new(data),
        });
        Ok(())
    }

    async fn compact_range(&self, family: &FamilyHandle, range: BytesRange) -> KvResult<()> {
        let id = self.fresh_file_id();
        let mut families = self.families.lock();
        let state = families
            .get_mut(family.name())
            .ok_or_else(|| KvError::NotFound(family.name().to_string()))?;
        if state.files.len() < 2 && !state.files.iter().any(|f| f.data.values().any(|s| s.is_none()))
        {
            return Ok(());
        }

        // Merge every file touching the range. All files participate, so
        // tombstones can be discarded.
        let files = std::mem::take(&mut state.files);
        let mut merged: BTreeMap<Bytes, Slot> = BTreeMap::new();
        for file in files {
            for (key, slot) in file.data.iter() {
                merged.insert(key.clone(), slot.clone());
            }
        }
        merged.retain(|key, slot| !(range.contains(key) && slot.is_none()));

        if !merged.is_empty() {
            let size_bytes = FamilyState::data_bytes(&merged);
            state.files.push(L0File {
                id,
                size_bytes,
                data: Arc::new(merged),
            });
        }
        Ok(())
    }

    async fn compact_files(&self, family: &FamilyHandle, files: &[u64]) -> KvResult<()> {
        if files.is_empty() {
            return Ok(());
        }
        let id = self.fresh_file_id();
        let mut families = self.families.lock();
        let state = families
            .get_mut(family.name())
            .ok_or_else(|| KvError::NotFound(family.name().to_string()))?;

        let mut merged: BTreeMap<Bytes, Slot> = BTreeMap::new();
        let mut insert_at = None;
        let mut kept = Vec::with_capacity(state.files.len());
        for (idx, file) in std::mem::take(&mut state.files).into_iter().enumerate() {
            if files.contains(&file.id) {
                insert_at.get_or_insert(idx);
                for (key, slot) in file.data.iter() {
                    merged.insert(key.clone(), slot.clone());
                }
            } else {
                kept.push(file);
            }
        }
        state.files = kept;

        let Some(mut insert_at) = insert_at else {
            return Err(KvError::NotFound(format!(
                "l0 files {:?} in family {}",
                files,
                family.name()
            )));
        };
        // Tombstones must survive: older files outside the merge may still
        // hold the deleted keys.
        insert_at = insert_at.min(state.files.len());
        let size_bytes = FamilyState::data_bytes(&merged);
        state.files.insert(
            insert_at,
            L0File {
                id,
                size_bytes,
                data: Arc::new(merged),
            },
        );
        Ok(())
    }

    async fn l0_files(&self, family: &FamilyHandle) -> KvResult<Vec<L0FileInfo>> {
        let families = self.families.lock();
        let state = families
            .get(family.name())
            .ok_or_else(|| KvError::NotFound(family.name().to_string()))?;
        Ok(state
            .files
            .iter()
            .map(|f| L0FileInfo {
                id: f.id,
                size_bytes: f.size_bytes,
            })
            .collect())
    }

    async fn property(&self, family: &FamilyHandle, property: KvProperty) -> KvResult<u64> {
        let families = self.families.lock();
        let state = families
            .get(family.name())
            .ok_or_else(|| KvError::NotFound(family.name().to_string()))?;
        Ok(match property {
            KvProperty::NumL0Files => state.files.len() as u64,
            KvProperty::MemtableBytes => state.memtable_bytes,
            KvProperty::TotalDataBytes => {
                state.memtable_bytes + state.files.iter().map(|f| f.size_bytes).sum::<u64>()
            }
        })
    }

    async fn persist_wal(&self) -> KvResult<()> {
        self.wal_syncs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn close(&self) -> KvResult<()> {
        Ok(())
    }
}
