//! Persistent KV substrate backed by fjall.
//!
//! One fjall keyspace per instance; each column family maps to a fjall
//! partition, so families share a single journal (giving atomic
//! multi-family batches) while keeping independent trees, which makes
//! dropping a family cheap.
//!
//! Family names are mirrored into a small registry partition so
//! [`Kv::list_families`] works across restarts.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use parking_lot::RwLock;
use std::collections::HashMap;

use super::settings::{Compression, KvSettings};
use super::{
    BatchOp, FamilyHandle, Kv, KvError, KvIterator, KvProperty, KvResult, KvSnapshot,
    KvWriteOptions, L0FileInfo, WriteBatch,
};
use crate::util::BytesRange;

/// Partition holding one empty-valued key per family name.
const FAMILY_REGISTRY: &str = "__families";

fn from_fjall(err: fjall::Error) -> KvError {
    KvError::Io(err.to_string())
}

/// Persistent implementation of [`Kv`].
pub struct FjallKv {
    keyspace: Keyspace,
    registry: PartitionHandle,
    partitions: RwLock<HashMap<String, PartitionHandle>>,
    settings: KvSettings,
}

impl FjallKv {
    /// Opens (or creates) the keyspace at `path` and reopens every family
    /// recorded in the registry.
    pub fn open(path: impl AsRef<Path>, settings: &KvSettings) -> KvResult<Self> {
        let keyspace = Config::new(path)
            .cache_size(settings.cache_size)
            .open()
            .map_err(from_fjall)?;
        let registry = keyspace
            .open_partition(FAMILY_REGISTRY, PartitionCreateOptions::default())
            .map_err(from_fjall)?;

        let kv = Self {
            keyspace,
            registry,
            partitions: RwLock::new(HashMap::new()),
            settings: settings.clone(),
        };

        for name in kv.registered_families()? {
            let partition = kv.open_partition(&name)?;
            kv.partitions.write().insert(name, partition);
        }
        Ok(kv)
    }

    fn registered_families(&self) -> KvResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in self.registry.iter() {
            let (key, _) = entry.map_err(from_fjall)?;
            let name = String::from_utf8(key.to_vec())
                .map_err(|_| KvError::Corruption("non-utf8 family name in registry".into()))?;
            names.push(name);
        }
        Ok(names)
    }

    fn open_partition(&self, name: &str) -> KvResult<PartitionHandle> {
        let block_size = if name == "metadata" {
            self.settings.metadata_block_size()
        } else {
            self.settings.block_size
        };
        let mut options = PartitionCreateOptions::default().block_size(block_size as u32);
        options = match self.settings.compression {
            Compression::None => options,
            _ => options.compression(fjall::CompressionType::Lz4),
        };
        self.keyspace
            .open_partition(name, options)
            .map_err(from_fjall)
    }

    fn partition(&self, family: &FamilyHandle) -> KvResult<PartitionHandle> {
        self.partitions
            .read()
            .get(family.name())
            .cloned()
            .ok_or_else(|| KvError::NotFound(family.name().to_string()))
    }
}

struct FjallSnapshot {
    snapshot: fjall::Snapshot,
}

#[async_trait]
impl KvSnapshot for FjallSnapshot {
    #[tracing::instrument(level = "trace", skip_all)]
    async fn get(&self, key: Bytes) -> KvResult<Option<Bytes>> {
        let value = self
            .snapshot
            .get(&key)
            .map_err(|err| from_fjall(err.into()))?;
        Ok(value.map(|v| Bytes::copy_from_slice(&v)))
    }

    #[tracing::instrument(level = "trace", skip_all)]
    async fn scan(&self, range: BytesRange) -> KvResult<Box<dyn KvIterator + Send>> {
        // The underlying lsm-tree range iterator is not `Send` (it holds
        // non-thread-affine lock guards), so it must be drained here rather
        // than boxed as a trait object; this preserves ordering and errors.
        let items: Vec<_> = self
            .snapshot
            .range(range)
            .map(|item| item.map_err(fjall::Error::from))
            .collect();
        Ok(Box::new(FjallIterator {
            inner: items.into_iter(),
        }))
    }
}

struct FjallIterator {
    inner: std::vec::IntoIter<fjall::Result<(fjall::Slice, fjall::Slice)>>,
}

#[async_trait]
impl KvIterator for FjallIterator {
    async fn next(&mut self) -> KvResult<Option<(Bytes, Bytes)>> {
        match self.inner.next() {
            Some(Ok((key, value))) => Ok(Some((
                Bytes::copy_from_slice(&key),
                Bytes::copy_from_slice(&value),
            ))),
            Some(Err(err)) => Err(from_fjall(err)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl Kv for FjallKv {
    #[tracing::instrument(level = "trace", skip_all)]
    async fn create_family(&self, name: &str) -> KvResult<FamilyHandle> {
        if !self.partitions.read().contains_key(name) {
            let partition = self.open_partition(name)?;
            self.registry
                .insert(name.as_bytes(), "")
                .map_err(from_fjall)?;
            self.partitions.write().insert(name.to_string(), partition);
        }
        Ok(FamilyHandle::new(name))
    }

    #[tracing::instrument(level = "trace", skip_all)]
    async fn drop_family(&self, family: &FamilyHandle) -> KvResult<()> {
        let partition = {
            let mut partitions = self.partitions.write();
            partitions
                .remove(family.name())
                .ok_or_else(|| KvError::NotFound(family.name().to_string()))?
        };
        self.registry
            .remove(family.name().as_bytes())
            .map_err(from_fjall)?;
        self.keyspace
            .delete_partition(partition)
            .map_err(from_fjall)
    }

    async fn list_families(&self) -> KvResult<Vec<String>> {
        Ok(self.partitions.read().keys().cloned().collect())
    }

    #[tracing::instrument(level = "trace", skip_all)]
    async fn write(&self, batch: WriteBatch, options: KvWriteOptions) -> KvResult<()> {
        let mut fjall_batch = self.keyspace.batch();
        {
            let partitions = self.partitions.read();
            for op in batch.ops() {
                match op {
                    BatchOp::Put { family, key, value } => {
                        let partition = partitions
                            .get(family.name())
                            .ok_or_else(|| KvError::NotFound(family.name().to_string()))?;
                        fjall_batch.insert(partition, key.as_ref(), value.as_ref());
                    }
                    BatchOp::Delete { family, key } => {
                        let partition = partitions
                            .get(family.name())
                            .ok_or_else(|| KvError::NotFound(family.name().to_string()))?;
                        fjall_batch.remove(partition, key.as_ref());
                    }
                }
            }
        }
        fjall_batch.commit().map_err(from_fjall)?;
        if options.sync_wal {
            self.keyspace
                .persist(PersistMode::SyncAll)
                .map_err(from_fjall)?;
        }
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip_all)]
    async fn get(&self, family: &FamilyHandle, key: Bytes) -> KvResult<Option<Bytes>> {
        let partition = self.partition(family)?;
        let value = partition.get(&key).map_err(from_fjall)?;
        Ok(value.map(|v| Bytes::copy_from_slice(&v)))
    }

    async fn snapshot(&self, family: &FamilyHandle) -> KvResult<Arc<dyn KvSnapshot>> {
        let partition = self.partition(family)?;
        Ok(Arc::new(FjallSnapshot {
            snapshot: partition.snapshot(),
        }))
    }

    #[tracing::instrument(level = "trace", skip_all)]
    async fn flush(&self, family: &FamilyHandle) -> KvResult<()> {
        let partition = self.partition(family)?;
        partition.rotate_memtable_and_wait().map_err(from_fjall)?;
        Ok(())
    }

    async fn compact_range(&self, family: &FamilyHandle, _range: BytesRange) -> KvResult<()> {
        // fjall drives merges from its own compaction strategy; the closest
        // external nudge is sealing the active memtable so the strategy sees
        // the full picture.
        let partition = self.partition(family)?;
        partition.rotate_memtable_and_wait().map_err(from_fjall)?;
        Ok(())
    }

    async fn compact_files(&self, _family: &FamilyHandle, _files: &[u64]) -> KvResult<()> {
        Err(KvError::Unsupported("per-file compaction"))
    }

    async fn l0_files(&self, family: &FamilyHandle) -> KvResult<Vec<L0FileInfo>> {
        // No per-file metadata is exposed; callers treat an empty listing as
        // "partial compaction not applicable".
        self.partition(family)?;
        Ok(Vec::new())
    }

    async fn property(&self, family: &FamilyHandle, property: KvProperty) -> KvResult<u64> {
        let partition = self.partition(family)?;
        match property {
            KvProperty::NumL0Files => Ok(partition.segment_count() as u64),
            KvProperty::TotalDataBytes => Ok(partition.disk_space()),
            KvProperty::MemtableBytes => Err(KvError::Unsupported("memtable bytes")),
        }
    }

    async fn persist_wal(&self) -> KvResult<()> {
        self.keyspace
            .persist(PersistMode::SyncAll)
            .map_err(from_fjall)
    }

    async fn close(&self) -> KvResult<()> {
        self.keyspace
            .persist(PersistMode::SyncAll)
            .map_err(from_fjall)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn should_write_and_read_back_from_disk() {
        // given
        let dir = tempfile::tempdir().unwrap();
        let kv = FjallKv::open(dir.path(), &KvSettings::default()).unwrap();
        let fam = kv.create_family("data").await.unwrap();

        // when
        let mut batch = WriteBatch::new();
        batch.put(&fam, Bytes::from_static(b"k"), Bytes::from_static(b"v"));
        kv.write(batch, KvWriteOptions { sync_wal: true })
            .await
            .unwrap();

        // then
        assert_eq!(
            kv.get(&fam, Bytes::from_static(b"k")).await.unwrap(),
            Some(Bytes::from_static(b"v"))
        );
    }

    #[tokio::test]
    async fn should_remember_families_across_reopen() {
        // given
        let dir = tempfile::tempdir().unwrap();
        {
            let kv = FjallKv::open(dir.path(), &KvSettings::default()).unwrap();
            kv.create_family("metadata").await.unwrap();
            kv.create_family("partition_1").await.unwrap();
            kv.close().await.unwrap();
        }

        // when
        let kv = FjallKv::open(dir.path(), &KvSettings::default()).unwrap();
        let mut names = kv.list_families().await.unwrap();
        names.sort();

        // then
        assert_eq!(names, vec!["metadata", "partition_1"]);
    }

    #[tokio::test]
    async fn should_scan_snapshot_in_key_order() {
        // given
        let dir = tempfile::tempdir().unwrap();
        let kv = FjallKv::open(dir.path(), &KvSettings::default()).unwrap();
        let fam = kv.create_family("data").await.unwrap();
        let mut batch = WriteBatch::new();
        for key in [b"b" as &[u8], b"a", b"c"] {
            batch.put(
                &fam,
                Bytes::copy_from_slice(key),
                Bytes::from_static(b"v"),
            );
        }
        kv.write(batch, KvWriteOptions::default()).await.unwrap();

        // when
        let snapshot = kv.snapshot(&fam).await.unwrap();
        let mut iter = snapshot.scan(BytesRange::all()).await.unwrap();
        let mut keys = Vec::new();
        while let Some((key, _)) = iter.next().await.unwrap() {
            keys.push(key);
        }

        // then
        assert_eq!(
            keys,
            vec![
                Bytes::from_static(b"a"),
                Bytes::from_static(b"b"),
                Bytes::from_static(b"c")
            ]
        );
    }
}
