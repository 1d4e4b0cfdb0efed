//! The shard: one storage unit owning one KV instance.
//!
//! `Shard` ties the pieces together: the partition catalog, the directory,
//! the flush scheduler, the compaction policy and the space monitor, and
//! exposes the operations the replication layer calls: store, read,
//! findTime, trim and seal.
//!
//! Background work runs on three loops plus the space monitor:
//!
//! - the high-priority partition loop creates partitions (latency-critical
//!   for appends straddling a partition boundary),
//! - the low-priority maintenance loop trims by retention, drops fully
//!   trimmed partitions and selects compactions,
//! - the flush scheduler enforces data-age, idle and memory triggers.
//!
//! Each loop body is a `*_tick` method so tests can drive maintenance
//! deterministically with a mock clock.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::clock::{Clock, SystemClock};
use common::kv::config::KvConfig;
use common::kv::factory::create_kv;
use common::{BytesRange, FamilyHandle, Kv, KvProperty, KvWriteOptions, WriteBatch};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::compaction::{due_compaction_age, pick_partial_compactions, RateLimiter};
use crate::config::{LogsConfig, Settings};
use crate::directory::Directory;
use crate::error::{Error, Result};
use crate::flush::FlushScheduler;
use crate::metrics::ShardMetrics;
use crate::model::{
    is_internal_log, lsn_epoch, payload_checksum_valid, record_flags, Epoch, LogId, Lsn,
    PartitionId, ShardIndex, StoreRequest,
};
use crate::partition::{Partition, PartitionCatalog};
use crate::read::{find_time_in_snapshot, PartitionReader, ReadFilter, RecordStream};
use crate::retention::{DiskSpace, SpaceMonitor, SpaceStatus, SystemDiskSpace};
use crate::serde::{
    partition_family_name, parse_partition_family, CsiKey, CsiValue, DirtyValue, LogKey,
    PartitionKey, PartitionMetaValue, RecordKey, RecordType, RecordValue, deserialize_epoch,
    serialize_epoch, METADATA_FAMILY, UNPARTITIONED_FAMILY,
};

/// How often the dedicated WAL-sync task runs when `background_wal_sync`
/// is enabled.
const BACKGROUND_WAL_SYNC_PERIOD: Duration = Duration::from_millis(500);

/// Consecutive background IO errors before the shard goes read-only.
const READ_ONLY_ERROR_THRESHOLD: u32 = 3;

/// The newest partitions are never dropped.
const UNDROPPABLE_NEWEST: usize = 2;

/// Everything needed to open a shard.
#[derive(Debug, Clone)]
pub struct ShardConfig {
    pub shard_id: u32,
    /// Filesystem location of the shard, used for free-space monitoring.
    pub root: PathBuf,
    pub kv: KvConfig,
    pub settings: Settings,
}

/// Per-partition diagnostics snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionInfo {
    pub id: PartitionId,
    pub min_ts: i64,
    pub max_ts: i64,
    pub creation_time_ms: i64,
    pub prepended: bool,
    pub dirty: bool,
    /// The partition was dirty when the process last died; its contents may
    /// exceed what the directory records until the next clean flush.
    pub under_replicated: bool,
}

/// Operational state visible to operators and the replication layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardStatus {
    pub shard_id: u32,
    pub partition_count: usize,
    pub read_only: bool,
    pub out_of_space: bool,
    pub rebuilding: Option<ShardIndex>,
}

struct ShardState {
    shutdown: AtomicBool,
    read_only: AtomicBool,
    out_of_space: AtomicBool,
    rebuilding: RwLock<Option<ShardIndex>>,
    consecutive_io_errors: AtomicU32,
}

pub struct Shard {
    shard_id: u32,
    root: PathBuf,
    kv: Arc<dyn Kv>,
    settings: Arc<Settings>,
    logs_config: Arc<dyn LogsConfig>,
    clock: Arc<dyn Clock>,

    catalog: PartitionCatalog,
    directory: Directory,
    metadata: FamilyHandle,
    unpartitioned: FamilyHandle,

    /// Serializes writes per log, so LSN order within a log matches
    /// commit order.
    write_locks: Box<[tokio::sync::Mutex<()>]>,
    /// Serializes partition creation between the write path and the
    /// high-priority loop.
    creation_lock: tokio::sync::Mutex<()>,
    seals: RwLock<HashMap<LogId, Epoch>>,

    flush: FlushScheduler,
    monitor: SpaceMonitor,
    metrics: Arc<ShardMetrics>,
    state: ShardState,

    /// Identifies this process generation in dirty markers.
    server_instance: u64,
    outstanding_partial_compactions: AtomicUsize,
    /// Partitions removed from the catalog whose families still wait for
    /// the last reader to let go.
    pending_family_drops: Mutex<Vec<Arc<Partition>>>,
    last_metadata_compaction_ms: AtomicI64,
    last_directory_check_ms: AtomicI64,

    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Shard {
    /// Opens a shard from configuration and starts the background loops.
    pub async fn open(
        config: ShardConfig,
        logs_config: Arc<dyn LogsConfig>,
    ) -> Result<Arc<Self>> {
        if let KvConfig::Fjall(fjall_config) = &config.kv {
            let exists = std::path::Path::new(&fjall_config.path).exists();
            if !exists && !config.settings.auto_create_shards {
                return Err(Error::NotFound(format!(
                    "shard {} has no data at {} and auto_create_shards is off",
                    config.shard_id, fjall_config.path
                )));
            }
        }
        let kv = create_kv(&config.kv)?;
        let shard = Self::open_with(
            config.shard_id,
            config.root,
            kv,
            config.settings,
            logs_config,
            Arc::new(SystemClock),
            Arc::new(SystemDiskSpace),
        )
        .await?;
        shard.start_background();
        Ok(shard)
    }

    /// Opens a shard on an existing KV instance with injectable clock and
    /// disk-space sources. Background loops are not started; callers drive
    /// the `*_tick` methods themselves or call [`Self::start_background`].
    pub async fn open_with(
        shard_id: u32,
        root: impl Into<PathBuf>,
        kv: Arc<dyn Kv>,
        settings: Settings,
        logs_config: Arc<dyn LogsConfig>,
        clock: Arc<dyn Clock>,
        disk_space: Arc<dyn DiskSpace>,
    ) -> Result<Arc<Self>> {
        let settings = Arc::new(settings);
        let metadata = kv.create_family(METADATA_FAMILY).await?;
        let unpartitioned = kv.create_family(UNPARTITIONED_FAMILY).await?;

        let directory = Directory::new(metadata.clone(), settings.num_metadata_locks);
        directory.load(kv.as_ref()).await?;

        let metrics = Arc::new(ShardMetrics::new());
        // The instance id distinguishes dirty markers of this process
        // generation from stale ones.
        let server_instance = clock.now_ms() as u64;
        let (shutdown_tx, _) = watch::channel(false);
        let write_locks = (0..settings.num_metadata_locks.max(1))
            .map(|_| tokio::sync::Mutex::new(()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let shard = Arc::new(Self {
            shard_id,
            root: root.into(),
            flush: FlushScheduler::new(settings.clone(), metadata.clone(), metrics.clone()),
            monitor: SpaceMonitor::new(settings.free_disk_space_threshold_low, disk_space),
            kv,
            settings,
            logs_config,
            clock,
            catalog: PartitionCatalog::new(),
            directory,
            metadata,
            unpartitioned,
            write_locks,
            creation_lock: tokio::sync::Mutex::new(()),
            seals: RwLock::new(HashMap::new()),
            metrics,
            state: ShardState {
                shutdown: AtomicBool::new(false),
                read_only: AtomicBool::new(false),
                out_of_space: AtomicBool::new(false),
                rebuilding: RwLock::new(None),
                consecutive_io_errors: AtomicU32::new(0),
            },
            server_instance,
            outstanding_partial_compactions: AtomicUsize::new(0),
            pending_family_drops: Mutex::new(Vec::new()),
            last_metadata_compaction_ms: AtomicI64::new(0),
            last_directory_check_ms: AtomicI64::new(0),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        });
        shard.recover().await?;
        info!(
            shard = shard.shard_id,
            partitions = shard.catalog.count(),
            "shard opened"
        );
        Ok(shard)
    }

    /// Rebuilds in-memory state from the metadata family and the set of
    /// existing column families.
    async fn recover(&self) -> Result<()> {
        let snapshot = self.kv.snapshot(&self.metadata).await?;

        let mut metas: HashMap<PartitionId, PartitionMetaValue> = HashMap::new();
        let mut iter = snapshot
            .scan(PartitionKey::scan_all(RecordType::PartitionMeta))
            .await?;
        while let Some((key, value)) = iter.next().await? {
            let key = PartitionKey::deserialize(&key, RecordType::PartitionMeta)?;
            metas.insert(key.partition_id, PartitionMetaValue::deserialize(&value)?);
        }

        let mut cleanup = WriteBatch::new();
        for name in self.kv.list_families().await? {
            let Some(partition_id) = parse_partition_family(&name) else {
                continue;
            };
            match metas.remove(&partition_id) {
                Some(meta) => {
                    let partition = Arc::new(Partition::new(
                        partition_id,
                        FamilyHandle::new(&name),
                        meta.min_ts,
                        meta.creation_time_ms,
                        meta.prepended,
                    ));
                    self.catalog.insert(partition);
                }
                None => {
                    // The process died between creating the family and
                    // persisting its meta row; the family holds nothing.
                    warn!(partition = partition_id, "dropping family without meta row");
                    self.kv.drop_family(&FamilyHandle::new(&name)).await?;
                }
            }
        }
        for (partition_id, _) in metas {
            warn!(partition = partition_id, "meta row without family");
            cleanup.delete(
                &self.metadata,
                PartitionKey::meta(partition_id).serialize(),
            );
        }

        // The exact ceiling is unknown after a restart; the next
        // partition's floor is a safe over-approximation.
        let partitions = self.catalog.all();
        for pair in partitions.windows(2) {
            pair[0].raise_max_ts(pair[1].min_ts());
        }

        let mut iter = snapshot.scan(LogKey::scan_all(RecordType::Seal)).await?;
        while let Some((key, value)) = iter.next().await? {
            let key = LogKey::deserialize(&key, RecordType::Seal)?;
            self.seals
                .write()
                .insert(key.log_id, deserialize_epoch(&value)?);
        }

        let mut iter = snapshot
            .scan(PartitionKey::scan_all(RecordType::DirtyMarker))
            .await?;
        while let Some((key, value)) = iter.next().await? {
            let key = PartitionKey::deserialize(&key, RecordType::DirtyMarker)?;
            let marker = DirtyValue::deserialize(&value)?;
            match self.catalog.get(key.partition_id) {
                Some(partition) => {
                    // Unclean shutdown: the partition may hold records the
                    // directory under-reports, so readers treat its entries
                    // as over-approximate until the next clean flush.
                    warn!(
                        partition = key.partition_id,
                        instance = marker.server_instance,
                        wave = marker.wave,
                        "partition was dirty at shutdown"
                    );
                    partition.set_recovered_dirty();
                    partition.set_marker_on_disk(true);
                }
                None => cleanup.delete(&self.metadata, key.serialize()),
            }
        }
        if !cleanup.is_empty() {
            self.kv
                .write(cleanup, KvWriteOptions { sync_wal: true })
                .await?;
        }

        if self.catalog.count() == 0 {
            self.create_partition(self.clock.now_ms(), None).await?;
        }
        self.metrics.partition_count.set(self.catalog.count() as i64);
        Ok(())
    }

    /// Spawns the background loops. Idempotence is the caller's problem;
    /// call at most once.
    pub fn start_background(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();

        tasks.push(self.spawn_loop(
            self.settings.partition_hi_pri_check_period,
            "hi-pri partition loop",
            |shard| async move { shard.hi_pri_tick().await },
        ));
        tasks.push(self.spawn_loop(
            self.settings.partition_lo_pri_check_period,
            "lo-pri maintenance loop",
            |shard| async move { shard.lo_pri_tick().await },
        ));
        tasks.push(self.spawn_loop(
            self.settings.min_manual_flush_interval,
            "flush scheduler",
            |shard| async move { shard.flush_tick().await.map(|_| ()) },
        ));
        tasks.push(self.spawn_loop(
            self.settings.partition_lo_pri_check_period,
            "space monitor",
            |shard| async move { shard.monitor_tick().await.map(|_| ()) },
        ));
        if self.settings.background_wal_sync {
            tasks.push(self.spawn_loop(
                BACKGROUND_WAL_SYNC_PERIOD,
                "wal sync",
                |shard| async move {
                    shard.kv.persist_wal().await?;
                    shard.metrics.wal_syncs_total.inc();
                    Ok(())
                },
            ));
        }
    }

    fn spawn_loop<F, Fut>(
        self: &Arc<Self>,
        period: Duration,
        name: &'static str,
        body: F,
    ) -> JoinHandle<()>
    where
        F: Fn(Arc<Shard>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send,
    {
        let shard = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(err) = body(Arc::clone(&shard)).await {
                            error!(loop_name = name, error = %err, "background pass failed");
                            shard.note_background_error(&err);
                        } else {
                            shard.state.consecutive_io_errors.store(0, Ordering::Relaxed);
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        info!(loop_name = name, "stopping");
                        break;
                    }
                }
            }
        })
    }

    fn note_background_error(&self, err: &Error) {
        if !matches!(err, Error::Io(_)) {
            self.state.consecutive_io_errors.store(0, Ordering::Relaxed);
            return;
        }
        self.metrics.io_errors_total.inc();
        let errors = self
            .state
            .consecutive_io_errors
            .fetch_add(1, Ordering::Relaxed)
            + 1;
        if errors >= READ_ONLY_ERROR_THRESHOLD && !self.state.read_only.swap(true, Ordering::SeqCst)
        {
            self.metrics.read_only.set(1);
            error!(
                shard = self.shard_id,
                errors, "persistent IO errors; entering read-only mode"
            );
        }
    }

    fn check_writable(&self, request: &StoreRequest) -> Result<()> {
        if self.state.shutdown.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }
        if let Some(recipient) = *self.state.rebuilding.read() {
            return Err(Error::Rebuilding { recipient });
        }
        if self.settings.read_only || self.state.read_only.load(Ordering::Acquire) {
            return Err(Error::Disabled);
        }
        if self.state.out_of_space.load(Ordering::Acquire) {
            return Err(Error::NoSpace);
        }
        if request.copyset.is_empty() {
            return Err(Error::Protocol("empty copyset".to_string()));
        }
        if let Some(&sealed_epoch) = self.seals.read().get(&request.log_id) {
            if lsn_epoch(request.lsn) <= sealed_epoch {
                return Err(Error::Preempted { sealed_epoch });
            }
        }
        if request.flags & record_flags::CHECKSUM != 0
            && self.settings.verify_checksum_during_store
            && !payload_checksum_valid(&request.payload)
        {
            return Err(Error::ChecksumMismatch);
        }
        if request.rebuild.is_some() {
            let stall = self.settings.partition_partial_compaction_stall_trigger;
            if stall > 0 && self.outstanding_partial_compactions.load(Ordering::Acquire) >= stall {
                return Err(Error::Busy(
                    "too many outstanding partial compactions".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Stores one record.
    pub async fn store(&self, request: StoreRequest) -> Result<()> {
        let result = self.store_inner(request).await;
        if result.is_err() {
            self.metrics.store_failures_total.inc();
        }
        result
    }

    /// Stores one record, failing with `TimedOut` if `deadline` elapses
    /// first. Cancellation is best-effort: the write may still commit.
    pub async fn store_with_deadline(
        &self,
        request: StoreRequest,
        deadline: Duration,
    ) -> Result<()> {
        match tokio::time::timeout(deadline, self.store(request)).await {
            Ok(result) => result,
            Err(_) => Err(Error::TimedOut),
        }
    }

    async fn store_inner(&self, request: StoreRequest) -> Result<()> {
        self.check_writable(&request)?;

        let stripe = (request.log_id % self.write_locks.len() as u64) as usize;
        let _write_guard = self.write_locks[stripe].lock().await;

        let now_ms = self.clock.now_ms();
        let sync_wal = !self.settings.background_wal_sync && request.rebuild.is_none();
        let payload_len = request.payload.len() as u64;

        if is_internal_log(request.log_id) {
            let value = RecordValue {
                flags: request.flags,
                timestamp_ms: request.timestamp_ms,
                copyset: request.copyset.clone(),
                payload: request.payload.clone(),
            };
            let mut batch = WriteBatch::new();
            batch.put(
                &self.unpartitioned,
                RecordKey::new(request.log_id, request.lsn).serialize(),
                value.serialize(),
            );
            self.kv.write(batch, KvWriteOptions { sync_wal }).await?;
            self.finish_store(payload_len, sync_wal);
            return Ok(());
        }

        let partition = self.partition_for_write(request.timestamp_ms, now_ms).await?;

        let value = RecordValue {
            flags: request.flags,
            timestamp_ms: request.timestamp_ms,
            copyset: request.copyset.clone(),
            payload: request.payload.clone(),
        };
        let mut batch = WriteBatch::new();
        batch.put(
            partition.family(),
            RecordKey::new(request.log_id, request.lsn).serialize(),
            value.serialize(),
        );
        if self.settings.use_copyset_index {
            batch.put(
                partition.family(),
                CsiKey::new(request.log_id, request.lsn).serialize(),
                CsiValue {
                    copyset: request.copyset.clone(),
                }
                .serialize(),
            );
        }
        let directory_delta = self.directory.build_store_delta(
            request.log_id,
            partition.id(),
            partition.family(),
            request.lsn,
            payload_len,
            self.settings.ts_bucket(request.timestamp_ms),
            &mut batch,
        );

        // First write into a clean partition persists a dirty marker, so an
        // unclean shutdown is detectable. Within the redirty grace period
        // the old marker is still on disk and is reused.
        let grace_ms = self.settings.redirty_grace_period.as_millis() as i64;
        let marker_written = if !partition.is_dirty()
            && !(partition.marker_on_disk() && now_ms - partition.clean_since_ms() < grace_ms)
        {
            batch.put(
                &self.metadata,
                PartitionKey::dirty(partition.id()).serialize(),
                DirtyValue {
                    server_instance: self.server_instance,
                    wave: request.rebuild.as_ref().map(|r| r.wave).unwrap_or(0),
                }
                .serialize(),
            );
            true
        } else {
            false
        };

        self.kv.write(batch, KvWriteOptions { sync_wal }).await?;

        self.directory.apply_store_delta(directory_delta);
        partition.observe_write(request.timestamp_ms, payload_len, now_ms);
        if marker_written {
            partition.set_marker_on_disk(true);
        }
        self.finish_store(payload_len, sync_wal);
        Ok(())
    }

    fn finish_store(&self, payload_len: u64, synced: bool) {
        self.metrics.stores_total.inc();
        self.metrics.store_bytes_total.inc_by(payload_len);
        if synced {
            self.metrics.wal_syncs_total.inc();
        }
    }

    /// Resolves the partition a record timestamp belongs to, prepending a
    /// partition when the timestamp predates every existing one.
    async fn partition_for_write(
        &self,
        timestamp_ms: i64,
        now_ms: i64,
    ) -> Result<Arc<Partition>> {
        let margin_ms = self.settings.new_partition_timestamp_margin.as_millis() as i64;
        let latest = self
            .catalog
            .latest()
            .ok_or_else(|| Error::NotFound("no partitions".to_string()))?;
        if timestamp_ms >= latest.min_ts() - margin_ms {
            return Ok(latest);
        }
        if let Some(partition) = self.catalog.find_for_timestamp(timestamp_ms) {
            return Ok(partition);
        }

        // Older than every partition: prepend one, unless the catalog is
        // already oversized.
        if self.catalog.count() < self.settings.partition_count_soft_limit {
            if let Some(partition) = self.create_partition(now_ms, Some(timestamp_ms)).await? {
                return Ok(partition);
            }
        }
        let oldest = self
            .catalog
            .oldest()
            .ok_or_else(|| Error::NotFound("no partitions".to_string()))?;
        warn!(
            timestamp_ms,
            partition = oldest.id(),
            "timestamp predates all partitions; routing to oldest"
        );
        Ok(oldest)
    }

    /// Creates a partition. With `prepend_ts` set, the partition is
    /// prepended below the current oldest to cover that timestamp; returns
    /// `None` when no id room is left below.
    async fn create_partition(
        &self,
        now_ms: i64,
        prepend_ts: Option<i64>,
    ) -> Result<Option<Arc<Partition>>> {
        let _guard = self.creation_lock.lock().await;

        let margin_ms = self.settings.new_partition_timestamp_margin.as_millis() as i64;
        let granularity_ms = self.settings.timestamp_granularity.as_millis().max(1) as i64;
        let (id, min_ts, prepended) = match prepend_ts {
            Some(ts) => {
                // A racing prepend may already cover the timestamp.
                if let Some(partition) = self.catalog.find_for_timestamp(ts) {
                    return Ok(Some(partition));
                }
                let Some(id) = self.catalog.allocate_prepend_id() else {
                    return Ok(None);
                };
                (id, ts - ts.rem_euclid(granularity_ms), true)
            }
            None => (self.catalog.allocate_id(), now_ms + margin_ms, false),
        };

        let family = self.kv.create_family(&partition_family_name(id)).await?;
        let mut batch = WriteBatch::new();
        batch.put(
            &self.metadata,
            PartitionKey::meta(id).serialize(),
            PartitionMetaValue {
                min_ts,
                creation_time_ms: now_ms,
                prepended,
            }
            .serialize(),
        );
        self.kv
            .write(batch, KvWriteOptions { sync_wal: true })
            .await?;

        let partition = Arc::new(Partition::new(id, family, min_ts, now_ms, prepended));
        self.catalog.insert(partition.clone());
        self.metrics.partition_count.set(self.catalog.count() as i64);
        if prepended {
            self.metrics.partitions_prepended_total.inc();
        } else {
            self.metrics.partitions_created_total.inc();
        }
        info!(partition = id, min_ts, prepended, "created partition");
        Ok(Some(partition))
    }

    /// Opens a cursor over `[from, until]` of one log.
    pub async fn read(
        &self,
        log_id: LogId,
        from: Lsn,
        until: Lsn,
        filter: ReadFilter,
    ) -> Result<RecordStream> {
        if self.state.shutdown.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }

        let trim_point = self.directory.trim_point(log_id);
        let pending_gap = if trim_point > 0 && trim_point >= from {
            Some((from, trim_point.min(until)))
        } else {
            None
        };
        let effective_from = from.max(trim_point.saturating_add(1));

        let mut readers = Vec::new();
        if is_internal_log(log_id) {
            readers.push(PartitionReader {
                snapshot: self.kv.snapshot(&self.unpartitioned).await?,
                partition: None,
            });
        } else {
            for (partition_id, _) in self.directory.lookup(log_id, effective_from, until) {
                let Some(partition) = self.catalog.get(partition_id) else {
                    continue;
                };
                if partition.is_dropping() {
                    continue;
                }
                readers.push(PartitionReader {
                    snapshot: self.kv.snapshot(partition.family()).await?,
                    partition: Some(partition),
                });
            }
        }

        Ok(RecordStream::new(
            log_id,
            effective_from,
            until,
            pending_gap,
            readers,
            filter,
            self.settings.use_copyset_index,
            !self.settings.disable_iterate_upper_bound,
            self.metrics.clone(),
        ))
    }

    /// Smallest LSN whose record timestamp is at least `timestamp_ms`.
    ///
    /// Past the newest record this returns one past the log's last LSN;
    /// results never fall at or below the trim point.
    pub async fn find_time(&self, log_id: LogId, timestamp_ms: i64) -> Result<Lsn> {
        if self.state.shutdown.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }
        let trim_point = self.directory.trim_point(log_id);
        let bucket = self.settings.ts_bucket(timestamp_ms);

        let mut found = None;
        if is_internal_log(log_id) {
            let snapshot = self.kv.snapshot(&self.unpartitioned).await?;
            found = find_time_in_snapshot(
                &snapshot,
                log_id,
                timestamp_ms,
                self.settings.read_find_time_index,
                bucket,
            )
            .await?;
        } else {
            for (partition_id, _) in self.directory.lookup(log_id, 0, Lsn::MAX) {
                let Some(partition) = self.catalog.get(partition_id) else {
                    continue;
                };
                if partition.is_dropping() || partition.max_ts() < timestamp_ms {
                    continue;
                }
                let snapshot = self.kv.snapshot(partition.family()).await?;
                if let Some(lsn) = find_time_in_snapshot(
                    &snapshot,
                    log_id,
                    timestamp_ms,
                    self.settings.read_find_time_index,
                    bucket,
                )
                .await?
                {
                    found = Some(lsn);
                    break;
                }
            }
        }

        let result = match found {
            Some(lsn) => lsn,
            None => self
                .directory
                .last_lsn(log_id)
                .map(|lsn| lsn + 1)
                .unwrap_or(trim_point + 1),
        };
        Ok(result.max(trim_point + 1))
    }

    /// Advances the trim point of a log. Idempotent; trimming to an
    /// already-passed point is a no-op.
    pub async fn trim(&self, log_id: LogId, trim_point: Lsn) -> Result<()> {
        if self.state.shutdown.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }
        self.trim_inner(log_id, trim_point).await
    }

    async fn trim_inner(&self, log_id: LogId, trim_point: Lsn) -> Result<()> {
        let mut batch = WriteBatch::new();
        let Some(delta) = self.directory.build_trim_delta(log_id, trim_point, &mut batch) else {
            return Ok(());
        };
        self.kv
            .write(batch, KvWriteOptions { sync_wal: true })
            .await?;
        self.directory.apply_trim_delta(delta);
        self.metrics.trims_total.inc();

        let mut batch = WriteBatch::new();
        let gc = self.directory.build_gc_delta(log_id, &mut batch);
        if !gc.is_empty() {
            self.kv.write(batch, KvWriteOptions::default()).await?;
            self.directory.apply_removal_delta(gc);
        }
        Ok(())
    }

    /// Seals a log at an epoch: stores with an LSN epoch at or below it are
    /// rejected with `Preempted`.
    pub async fn seal(&self, log_id: LogId, epoch: Epoch) -> Result<()> {
        if self.state.shutdown.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }
        if self.seals.read().get(&log_id).is_some_and(|&e| e >= epoch) {
            return Ok(());
        }
        let mut batch = WriteBatch::new();
        batch.put(
            &self.metadata,
            LogKey::seal(log_id).serialize(),
            serialize_epoch(epoch),
        );
        self.kv
            .write(batch, KvWriteOptions { sync_wal: true })
            .await?;
        let mut seals = self.seals.write();
        let entry = seals.entry(log_id).or_insert(epoch);
        *entry = (*entry).max(epoch);
        Ok(())
    }

    /// Marks the shard as being rebuilt; stores are rejected with
    /// `Rebuilding(recipient)` until cleared with `None`.
    pub fn set_rebuilding(&self, recipient: Option<ShardIndex>) {
        *self.state.rebuilding.write() = recipient;
    }

    pub fn status(&self) -> ShardStatus {
        ShardStatus {
            shard_id: self.shard_id,
            partition_count: self.catalog.count(),
            read_only: self.settings.read_only || self.state.read_only.load(Ordering::Acquire),
            out_of_space: self.state.out_of_space.load(Ordering::Acquire),
            rebuilding: *self.state.rebuilding.read(),
        }
    }

    pub fn metrics(&self) -> &Arc<ShardMetrics> {
        &self.metrics
    }

    /// Diagnostics view of the live partitions, oldest first.
    pub fn partitions(&self) -> Vec<PartitionInfo> {
        self.catalog
            .all()
            .into_iter()
            .map(|partition| PartitionInfo {
                id: partition.id(),
                min_ts: partition.min_ts(),
                max_ts: partition.max_ts(),
                creation_time_ms: partition.creation_time_ms(),
                prepended: partition.is_prepended(),
                dirty: partition.is_dirty(),
                under_replicated: partition.recovered_dirty(),
            })
            .collect()
    }

    /// Stops the background loops and closes the KV instance.
    pub async fn shutdown(&self) -> Result<()> {
        if self.state.shutdown.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.shutdown_tx.send(true);
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                warn!(shard = self.shard_id, "background task did not stop in time");
            }
        }
        self.kv.close().await?;
        info!(shard = self.shard_id, "shard closed");
        Ok(())
    }

    // ---- Background passes -------------------------------------------------

    /// High-priority pass: decides whether the latest partition should be
    /// rolled over.
    pub async fn hi_pri_tick(&self) -> Result<()> {
        let Some(latest) = self.catalog.latest() else {
            return Ok(());
        };
        let now_ms = self.clock.now_ms();
        let over_soft_limit = self.catalog.count() > self.settings.partition_count_soft_limit;
        let margin_ms = self.settings.new_partition_timestamp_margin.as_millis() as i64;

        let mut roll = false;
        let duration_ms = self.settings.partition_duration.as_millis() as i64;
        if duration_ms > 0 {
            let threshold = if over_soft_limit {
                duration_ms * 3
            } else {
                duration_ms
            };
            roll = latest.age(now_ms) >= threshold;
        }
        if !roll && !over_soft_limit && self.settings.partition_file_limit > 0 {
            let files = self
                .kv
                .property(latest.family(), KvProperty::NumL0Files)
                .await?;
            roll = files >= self.settings.partition_file_limit;
        }
        if !roll && self.settings.partition_size_limit > 0 {
            let bytes = self
                .kv
                .property(latest.family(), KvProperty::TotalDataBytes)
                .await?;
            roll = bytes >= self.settings.partition_size_limit;
        }
        if !roll {
            // Records are arriving with timestamps beyond the current
            // partition's window.
            roll = latest.max_ts() > now_ms + margin_ms;
        }

        if roll {
            self.create_partition(now_ms, None).await?;
        }
        Ok(())
    }

    /// Low-priority pass: retention trimming, partition drops, compaction.
    pub async fn lo_pri_tick(&self) -> Result<()> {
        let now_ms = self.clock.now_ms();
        self.retention_pass(now_ms).await?;
        self.drop_pass(now_ms).await?;
        self.retry_pending_family_drops().await?;
        self.compaction_pass(now_ms).await?;
        self.metadata_compaction_pass(now_ms).await?;
        self.directory_check_pass(now_ms).await?;
        Ok(())
    }

    /// One flush-scheduler pass. Public so embedders and tests can force
    /// flush evaluation.
    pub async fn flush_tick(&self) -> Result<Vec<PartitionId>> {
        let outcome = self
            .flush
            .run_once(self.kv.as_ref(), &self.catalog, self.clock.now_ms())
            .await?;
        Ok(outcome.flushed)
    }

    /// One space-monitor pass.
    pub async fn monitor_tick(&self) -> Result<SpaceStatus> {
        let status = self
            .monitor
            .check(&self.root)
            .map_err(|err| Error::Io(err.to_string()))?;
        match status {
            SpaceStatus::Ok => {
                self.state.out_of_space.store(false, Ordering::Release);
                self.metrics.out_of_space.set(0);
            }
            SpaceStatus::Low { free_fraction } => {
                let newly = !self.state.out_of_space.swap(true, Ordering::AcqRel);
                self.metrics.out_of_space.set(1);
                if newly {
                    warn!(
                        shard = self.shard_id,
                        free_fraction, "disk space low; reporting fullness"
                    );
                }
                if self.settings.sbr_force {
                    self.force_retention().await?;
                }
            }
        }
        Ok(status)
    }

    /// Space-based retention: advance trim points past everything in the
    /// oldest partition.
    async fn force_retention(&self) -> Result<()> {
        let Some(oldest) = self.catalog.oldest() else {
            return Ok(());
        };
        for (log_id, entry) in self.directory.partition_entries(oldest.id()) {
            self.trim_inner(log_id, entry.last_lsn).await?;
        }
        Ok(())
    }

    async fn retention_pass(&self, now_ms: i64) -> Result<()> {
        let grace_ms = self
            .settings
            .unconfigured_log_trimming_grace_period
            .as_millis() as i64;
        for log_id in self.directory.logs() {
            if is_internal_log(log_id) {
                continue;
            }
            match self.logs_config.attributes(log_id) {
                Some(attributes) => {
                    self.directory.clear_unconfigured(log_id);
                    let Some(backlog) = attributes.backlog else {
                        continue;
                    };
                    let cutoff = now_ms - backlog.as_millis() as i64;
                    let mut candidate: Option<Lsn> = None;
                    for (partition_id, entry) in self.directory.lookup(log_id, 0, Lsn::MAX) {
                        let Some(partition) = self.catalog.get(partition_id) else {
                            continue;
                        };
                        // Only partitions whose whole time range is past
                        // the cutoff; newer records must survive.
                        if partition.max_ts() < cutoff {
                            candidate = Some(candidate.map_or(entry.last_lsn, |c: Lsn| {
                                c.max(entry.last_lsn)
                            }));
                        }
                    }
                    if let Some(trim_point) = candidate {
                        debug!(log = log_id, trim_point, "retention trim");
                        self.trim_inner(log_id, trim_point).await?;
                    }
                }
                None => {
                    let since = self.directory.note_unconfigured(log_id, now_ms);
                    if now_ms - since >= grace_ms {
                        if let Some(last) = self.directory.last_lsn(log_id) {
                            info!(log = log_id, "trimming unconfigured log");
                            self.trim_inner(log_id, last).await?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Drops fully trimmed partitions, oldest first.
    async fn drop_pass(&self, now_ms: i64) -> Result<()> {
        let protected = self.catalog.newest_ids(UNDROPPABLE_NEWEST);
        let min_lifetime_ms = self.settings.prepended_partition_min_lifetime.as_millis() as i64;

        for partition in self.catalog.all() {
            if protected.contains(&partition.id()) {
                break;
            }
            if partition.is_dirty() || partition.is_dropping() {
                break;
            }
            if partition.is_prepended() && partition.age(now_ms) < min_lifetime_ms {
                break;
            }
            let all_trimmed = self
                .directory
                .partition_entries(partition.id())
                .iter()
                .all(|(log_id, entry)| entry.last_lsn <= self.directory.trim_point(*log_id));
            if !all_trimmed {
                // Drops remove a prefix of the partition sequence; stop at
                // the first partition that must stay.
                break;
            }
            self.drop_partition(partition).await?;
        }
        Ok(())
    }

    async fn drop_partition(&self, partition: Arc<Partition>) -> Result<()> {
        partition.mark_dropping();

        let mut batch = WriteBatch::new();
        let removal = self
            .directory
            .build_partition_drop_delta(partition.id(), &mut batch);
        batch.delete(
            &self.metadata,
            PartitionKey::dirty(partition.id()).serialize(),
        );
        batch.delete(
            &self.metadata,
            PartitionKey::meta(partition.id()).serialize(),
        );
        self.kv
            .write(batch, KvWriteOptions { sync_wal: true })
            .await?;
        self.directory.apply_removal_delta(removal);

        let removed = self.catalog.remove(partition.id());
        drop(removed);
        self.metrics.partition_count.set(self.catalog.count() as i64);
        self.metrics.partitions_dropped_total.inc();
        info!(partition = partition.id(), "dropped partition");

        // The column family is destroyed once no reader holds the
        // partition; `partition` plus pending-list entries are ours.
        if Arc::strong_count(&partition) == 1 {
            self.kv.drop_family(partition.family()).await?;
        } else {
            debug!(
                partition = partition.id(),
                "family drop deferred until readers finish"
            );
            self.pending_family_drops.lock().push(partition);
        }
        Ok(())
    }

    async fn retry_pending_family_drops(&self) -> Result<()> {
        let pending: Vec<Arc<Partition>> =
            std::mem::take(&mut *self.pending_family_drops.lock());
        for partition in pending {
            if Arc::strong_count(&partition) == 1 {
                self.kv.drop_family(partition.family()).await?;
            } else {
                self.pending_family_drops.lock().push(partition);
            }
        }
        Ok(())
    }

    async fn compaction_pass(&self, now_ms: i64) -> Result<()> {
        if !self.settings.partition_compactions_enabled {
            return Ok(());
        }
        let ages = self
            .settings
            .partition_compaction_schedule
            .resolve(&self.logs_config.backlog_durations());
        let protected = self.catalog.newest_ids(UNDROPPABLE_NEWEST);
        let limiter = RateLimiter::new(self.settings.compaction_ratelimit_bytes_per_sec);
        let mut partials_done = 0;

        for partition in self.catalog.all() {
            if protected.contains(&partition.id()) || partition.is_dropping() {
                continue;
            }

            if let Some(age) = due_compaction_age(&partition, &ages, now_ms) {
                let bytes = self
                    .kv
                    .property(partition.family(), KvProperty::TotalDataBytes)
                    .await?;
                self.kv
                    .compact_range(partition.family(), BytesRange::all())
                    .await?;
                partition.set_compacted_up_to_secs(age.as_secs());
                self.metrics.full_compactions_total.inc();
                info!(
                    partition = partition.id(),
                    age_secs = age.as_secs(),
                    "full compaction"
                );
                tokio::time::sleep(limiter.pause_for(bytes)).await;
            }

            if partials_done >= self.settings.partition_partial_compaction_max_num_per_loop {
                continue;
            }
            let files = self.kv.l0_files(partition.family()).await?;
            for file_ids in pick_partial_compactions(&files, &self.settings) {
                if partials_done >= self.settings.partition_partial_compaction_max_num_per_loop {
                    break;
                }
                let bytes: u64 = files
                    .iter()
                    .filter(|f| file_ids.contains(&f.id))
                    .map(|f| f.size_bytes)
                    .sum();
                self.outstanding_partial_compactions
                    .fetch_add(1, Ordering::AcqRel);
                let result = self.kv.compact_files(partition.family(), &file_ids).await;
                self.outstanding_partial_compactions
                    .fetch_sub(1, Ordering::AcqRel);
                result?;
                self.metrics.partial_compactions_total.inc();
                partials_done += 1;
                tokio::time::sleep(limiter.pause_for(bytes)).await;
            }
        }
        Ok(())
    }

    async fn metadata_compaction_pass(&self, now_ms: i64) -> Result<()> {
        let period_ms = self.settings.metadata_compaction_period.as_millis() as i64;
        if period_ms == 0 {
            return Ok(());
        }
        let last = self.last_metadata_compaction_ms.load(Ordering::Relaxed);
        if last != 0 && now_ms - last < period_ms {
            return Ok(());
        }
        // Bounds iterator work in the metadata family after mass-delete
        // churn from drops and directory GC.
        self.kv.flush(&self.metadata).await?;
        let files = self
            .kv
            .property(&self.metadata, KvProperty::NumL0Files)
            .await?;
        if files > 1 {
            self.kv
                .compact_range(&self.metadata, BytesRange::all())
                .await?;
            self.metrics.metadata_compactions_total.inc();
        }
        self.last_metadata_compaction_ms
            .store(now_ms, Ordering::Relaxed);
        Ok(())
    }

    async fn directory_check_pass(&self, now_ms: i64) -> Result<()> {
        let period_ms = self.settings.directory_consistency_check_period.as_millis() as i64;
        if period_ms == 0 {
            return Ok(());
        }
        let last = self.last_directory_check_ms.load(Ordering::Relaxed);
        if last != 0 && now_ms - last < period_ms {
            return Ok(());
        }
        let snapshot = self.kv.snapshot(&self.metadata).await?;
        self.directory.reconcile(&snapshot).await?;
        self.last_directory_check_ms
            .store(now_ms, Ordering::Relaxed);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn set_outstanding_partial_compactions(&self, n: usize) {
        self.outstanding_partial_compactions
            .store(n, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use common::clock::MockClock;
    use common::kv::memory::MemoryKv;
    use crate::config::StaticLogsConfig;
    use crate::model::{compose_lsn, prepend_checksum, ReadItem};
    use crate::retention::MockDiskSpace;
    use smallvec::smallvec;

    struct Fixture {
        shard: Arc<Shard>,
        kv: Arc<MemoryKv>,
        clock: Arc<MockClock>,
        disk: Arc<MockDiskSpace>,
    }

    async fn open_fixture(settings: Settings, logs_config: StaticLogsConfig) -> Fixture {
        let kv = Arc::new(MemoryKv::new());
        let clock = Arc::new(MockClock::at_epoch());
        clock.advance(Duration::from_secs(100));
        let disk = Arc::new(MockDiskSpace::new(0.5));
        let shard = Shard::open_with(
            0,
            "/tmp/shard_0",
            kv.clone(),
            settings,
            Arc::new(logs_config),
            clock.clone(),
            disk.clone(),
        )
        .await
        .unwrap();
        Fixture {
            shard,
            kv,
            clock,
            disk,
        }
    }

    fn request(log_id: LogId, lsn: Lsn, timestamp_ms: i64, payload: &str) -> StoreRequest {
        StoreRequest::new(
            log_id,
            lsn,
            timestamp_ms,
            smallvec![1, 2, 3],
            Bytes::copy_from_slice(payload.as_bytes()),
        )
    }

    async fn read_records(shard: &Shard, log_id: LogId, from: Lsn, until: Lsn) -> Vec<(Lsn, Bytes)> {
        let mut stream = shard
            .read(log_id, from, until, ReadFilter::default())
            .await
            .unwrap();
        let mut records = Vec::new();
        while let Some(item) = stream.next().await.unwrap() {
            if let ReadItem::Record(record) = item {
                records.push((record.lsn, record.payload));
            }
        }
        records
    }

    #[tokio::test]
    async fn should_store_and_read_back_records() {
        // given
        let fixture = open_fixture(Settings::default(), StaticLogsConfig::new()).await;

        // when
        fixture.shard.store(request(7, 100, 100_000, "a")).await.unwrap();
        fixture.shard.store(request(7, 101, 100_001, "b")).await.unwrap();

        // then
        let records = read_records(&fixture.shard, 7, 0, 200).await;
        assert_eq!(
            records,
            vec![
                (100, Bytes::from_static(b"a")),
                (101, Bytes::from_static(b"b"))
            ]
        );
    }

    #[tokio::test]
    async fn should_reject_store_with_empty_copyset() {
        // given
        let fixture = open_fixture(Settings::default(), StaticLogsConfig::new()).await;
        let mut request = request(7, 100, 100_000, "a");
        request.copyset.clear();

        // when
        let result = fixture.shard.store(request).await;

        // then
        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn should_preempt_stores_at_or_below_sealed_epoch() {
        // given - sealed at epoch 3
        let fixture = open_fixture(Settings::default(), StaticLogsConfig::new()).await;
        fixture.shard.seal(7, 3).await.unwrap();

        // when/then - epoch 2 and 3 are preempted, epoch 4 is accepted
        let result = fixture
            .shard
            .store(request(7, compose_lsn(2, 5), 100_000, "a"))
            .await;
        assert_eq!(result, Err(Error::Preempted { sealed_epoch: 3 }));
        let result = fixture
            .shard
            .store(request(7, compose_lsn(3, 5), 100_000, "a"))
            .await;
        assert_eq!(result, Err(Error::Preempted { sealed_epoch: 3 }));
        fixture
            .shard
            .store(request(7, compose_lsn(4, 5), 100_000, "a"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn should_keep_seals_monotonic() {
        // given
        let fixture = open_fixture(Settings::default(), StaticLogsConfig::new()).await;
        fixture.shard.seal(7, 5).await.unwrap();

        // when - a lower seal arrives late
        fixture.shard.seal(7, 2).await.unwrap();

        // then - epoch 5 still rules
        let result = fixture
            .shard
            .store(request(7, compose_lsn(5, 1), 100_000, "a"))
            .await;
        assert_eq!(result, Err(Error::Preempted { sealed_epoch: 5 }));
    }

    #[tokio::test]
    async fn should_verify_checksums_during_store_by_default() {
        // given
        let fixture = open_fixture(Settings::default(), StaticLogsConfig::new()).await;

        // when - a valid checksummed payload
        let mut ok_request = request(7, 100, 100_000, "");
        ok_request.payload = prepend_checksum(b"payload");
        ok_request.flags = record_flags::CHECKSUM;
        fixture.shard.store(ok_request).await.unwrap();

        // and a corrupted one
        let mut bad_request = request(7, 101, 100_000, "");
        let mut corrupted = prepend_checksum(b"payload").to_vec();
        corrupted[6] ^= 0xff;
        bad_request.payload = Bytes::from(corrupted);
        bad_request.flags = record_flags::CHECKSUM;
        let result = fixture.shard.store(bad_request).await;

        // then
        assert_eq!(result, Err(Error::ChecksumMismatch));
    }

    #[tokio::test]
    async fn should_skip_store_checksum_verification_when_disabled() {
        // given
        let mut settings = Settings::default();
        settings.verify_checksum_during_store = false;
        let fixture = open_fixture(settings, StaticLogsConfig::new()).await;

        // when - a corrupted checksummed payload with verification off
        let mut bad_request = request(7, 100, 100_000, "");
        let mut corrupted = prepend_checksum(b"payload").to_vec();
        corrupted[6] ^= 0xff;
        bad_request.payload = Bytes::from(corrupted);
        bad_request.flags = record_flags::CHECKSUM;

        // then - the store is accepted; the mismatch surfaces on read
        fixture.shard.store(bad_request).await.unwrap();
    }

    #[tokio::test]
    async fn should_redirect_stores_while_rebuilding() {
        // given
        let fixture = open_fixture(Settings::default(), StaticLogsConfig::new()).await;
        fixture.shard.set_rebuilding(Some(12));

        // when
        let result = fixture.shard.store(request(7, 100, 100_000, "a")).await;

        // then
        assert_eq!(result, Err(Error::Rebuilding { recipient: 12 }));

        // and clearing it restores service
        fixture.shard.set_rebuilding(None);
        fixture.shard.store(request(7, 100, 100_000, "a")).await.unwrap();
    }

    #[tokio::test]
    async fn should_stall_rebuilding_stores_under_compaction_pressure() {
        // given
        let fixture = open_fixture(Settings::default(), StaticLogsConfig::new()).await;
        fixture.shard.set_outstanding_partial_compactions(50);
        let mut rebuild_request = request(7, 100, 100_000, "a");
        rebuild_request.rebuild = Some(crate::model::RebuildContext {
            version: 1,
            wave: 1,
            id: 1,
        });

        // when
        let result = fixture.shard.store(rebuild_request.clone()).await;

        // then - rebuilding stores stall, normal stores do not
        assert!(matches!(result, Err(Error::Busy(_))));
        fixture.shard.store(request(7, 101, 100_000, "b")).await.unwrap();

        // and once pressure subsides the rebuild store goes through
        fixture.shard.set_outstanding_partial_compactions(0);
        fixture.shard.store(rebuild_request).await.unwrap();
    }

    #[tokio::test]
    async fn should_store_internal_logs_unpartitioned() {
        // given
        let fixture = open_fixture(Settings::default(), StaticLogsConfig::new()).await;
        let internal_log = (1u64 << 63) | 42;

        // when
        fixture
            .shard
            .store(request(internal_log, 10, 100_000, "cfg"))
            .await
            .unwrap();

        // then - readable, and no partition directory entry was created
        let records = read_records(&fixture.shard, internal_log, 0, 100).await;
        assert_eq!(records, vec![(10, Bytes::from_static(b"cfg"))]);
        assert!(fixture.shard.directory.lookup(internal_log, 0, u64::MAX).is_empty());
    }

    #[tokio::test]
    async fn should_roll_partition_when_file_limit_reached() {
        // given - a tiny file limit
        let mut settings = Settings::default();
        settings.partition_file_limit = 2;
        let fixture = open_fixture(settings, StaticLogsConfig::new()).await;
        let first = fixture.shard.catalog.latest().unwrap().id();

        // when - two flushes produce two L0 files, then the hi-pri pass runs
        for lsn in [100, 101] {
            fixture
                .shard
                .store(request(7, lsn, 100_000 + lsn as i64, "x"))
                .await
                .unwrap();
            fixture
                .kv
                .flush(fixture.shard.catalog.latest().unwrap().family())
                .await
                .unwrap();
        }
        fixture.shard.hi_pri_tick().await.unwrap();

        // then
        assert_eq!(fixture.shard.catalog.count(), 2);
        assert!(fixture.shard.catalog.latest().unwrap().id() > first);
    }

    #[tokio::test]
    async fn should_recover_state_across_reopen() {
        // given - records, a trim and a seal on the first incarnation
        let fixture = open_fixture(Settings::default(), StaticLogsConfig::new()).await;
        fixture.shard.store(request(7, 100, 100_000, "a")).await.unwrap();
        fixture.shard.store(request(7, 101, 100_001, "b")).await.unwrap();
        fixture.shard.trim(7, 100).await.unwrap();
        fixture.shard.seal(9, 4).await.unwrap();
        let partition_id = fixture.shard.catalog.latest().unwrap().id();

        // when - reopened on the same storage (no clean shutdown)
        let reopened = Shard::open_with(
            0,
            "/tmp/shard_0",
            fixture.kv.clone(),
            Settings::default(),
            Arc::new(StaticLogsConfig::new()),
            fixture.clock.clone(),
            fixture.disk.clone(),
        )
        .await
        .unwrap();

        // then - records, trim point, seal and partition survive
        let records = read_records(&reopened, 7, 0, 200).await;
        assert_eq!(records, vec![(101, Bytes::from_static(b"b"))]);
        assert_eq!(reopened.directory.trim_point(7), 100);
        let result = reopened
            .store(request(9, compose_lsn(4, 1), 100_000, "x"))
            .await;
        assert_eq!(result, Err(Error::Preempted { sealed_epoch: 4 }));
        let recovered = reopened.catalog.get(partition_id).unwrap();
        // The dirty marker from the unclean shutdown is noticed.
        assert!(recovered.recovered_dirty());
    }

    #[tokio::test]
    async fn should_reject_stores_when_out_of_space_and_force_trim_with_sbr() {
        // given - sbr_force enabled, threshold 20%
        let mut settings = Settings::default();
        settings.free_disk_space_threshold_low = 0.2;
        settings.sbr_force = true;
        let fixture = open_fixture(settings, StaticLogsConfig::new()).await;
        fixture.shard.store(request(7, 100, 100_000, "a")).await.unwrap();

        // when - disk fills up
        fixture.disk.set_fraction(0.1);
        let status = fixture.shard.monitor_tick().await.unwrap();

        // then - fullness reported, stores rejected, trim advanced past the
        // oldest partition's records
        assert!(matches!(status, SpaceStatus::Low { .. }));
        assert!(fixture.shard.status().out_of_space);
        let result = fixture.shard.store(request(7, 101, 100_001, "b")).await;
        assert_eq!(result, Err(Error::NoSpace));
        assert_eq!(fixture.shard.directory.trim_point(7), 100);

        // and recovery of free space clears the state
        fixture.disk.set_fraction(0.5);
        fixture.shard.monitor_tick().await.unwrap();
        fixture.shard.store(request(7, 102, 100_002, "c")).await.unwrap();
    }

    #[tokio::test]
    async fn should_enter_read_only_after_repeated_background_io_errors() {
        // given
        let fixture = open_fixture(Settings::default(), StaticLogsConfig::new()).await;

        // when - three consecutive background IO errors
        for _ in 0..3 {
            fixture
                .shard
                .note_background_error(&Error::Io("disk gone".to_string()));
        }

        // then
        assert!(fixture.shard.status().read_only);
        let result = fixture.shard.store(request(7, 100, 100_000, "a")).await;
        assert_eq!(result, Err(Error::Disabled));
    }

    #[tokio::test]
    async fn should_not_enter_read_only_when_errors_are_interleaved_with_success() {
        // given
        let fixture = open_fixture(Settings::default(), StaticLogsConfig::new()).await;

        // when - errors never accumulate three in a row
        for _ in 0..2 {
            fixture
                .shard
                .note_background_error(&Error::Io("hiccup".to_string()));
        }
        fixture.shard.state.consecutive_io_errors.store(0, Ordering::Relaxed);
        fixture
            .shard
            .note_background_error(&Error::Io("hiccup".to_string()));

        // then
        assert!(!fixture.shard.status().read_only);
    }

    #[tokio::test]
    async fn should_reject_operations_after_shutdown() {
        // given
        let fixture = open_fixture(Settings::default(), StaticLogsConfig::new()).await;
        fixture.shard.shutdown().await.unwrap();

        // when/then
        let result = fixture.shard.store(request(7, 100, 100_000, "a")).await;
        assert_eq!(result, Err(Error::ShuttingDown));
        assert!(matches!(
            fixture.shard.read(7, 0, 100, ReadFilter::default()).await,
            Err(Error::ShuttingDown)
        ));
        assert_eq!(fixture.shard.trim(7, 10).await, Err(Error::ShuttingDown));
    }

    #[tokio::test]
    async fn should_time_out_stores_past_deadline() {
        // given - the log's write stripe is held elsewhere, so the store
        // cannot make progress
        let fixture = open_fixture(Settings::default(), StaticLogsConfig::new()).await;
        let stripe = (7 % fixture.shard.write_locks.len() as u64) as usize;
        let _guard = fixture.shard.write_locks[stripe].lock().await;

        // when
        let result = fixture
            .shard
            .store_with_deadline(request(7, 100, 100_000, "a"), Duration::from_millis(20))
            .await;

        // then
        assert_eq!(result, Err(Error::TimedOut));
    }

    #[tokio::test]
    async fn should_prepend_partition_for_ancient_timestamps() {
        // given - clock well past the first partition's floor
        let fixture = open_fixture(Settings::default(), StaticLogsConfig::new()).await;
        fixture.clock.advance(Duration::from_secs(10_000));
        fixture
            .shard
            .store(request(7, 500, fixture.clock.now_ms(), "new"))
            .await
            .unwrap();
        let count_before = fixture.shard.catalog.count();

        // when - a record far older than every partition arrives
        fixture.shard.store(request(8, 100, 1_000, "old")).await.unwrap();

        // then - a prepended partition was created below the others
        assert_eq!(fixture.shard.catalog.count(), count_before + 1);
        let oldest = fixture.shard.catalog.oldest().unwrap();
        assert!(oldest.is_prepended());
        assert!(oldest.min_ts() <= 1_000);
        let records = read_records(&fixture.shard, 8, 0, 200).await;
        assert_eq!(records, vec![(100, Bytes::from_static(b"old"))]);
    }

    #[tokio::test]
    async fn should_answer_find_time_across_partitions() {
        // given - records at increasing timestamps
        let fixture = open_fixture(Settings::default(), StaticLogsConfig::new()).await;
        for (lsn, ts) in [(100u64, 100_000i64), (101, 200_000), (102, 300_000)] {
            fixture.shard.store(request(7, lsn, ts, "x")).await.unwrap();
        }

        // then
        assert_eq!(fixture.shard.find_time(7, 50_000).await.unwrap(), 100);
        assert_eq!(fixture.shard.find_time(7, 150_000).await.unwrap(), 101);
        assert_eq!(fixture.shard.find_time(7, 300_000).await.unwrap(), 102);
        // past the newest record: one past the end
        assert_eq!(fixture.shard.find_time(7, 900_000).await.unwrap(), 103);

        // and results stay above the trim point
        fixture.shard.trim(7, 101).await.unwrap();
        assert_eq!(fixture.shard.find_time(7, 50_000).await.unwrap(), 102);
    }
}
