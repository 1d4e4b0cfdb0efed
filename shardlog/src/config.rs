//! Engine configuration.
//!
//! [`Settings`] carries every tuning knob of the shard engine; defaults
//! match the production tuning of the system this engine is modelled on.
//! Substrate-level knobs (block sizes, caches, compression) live in
//! `common::kv::settings` and are passed through unchanged.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use crate::error::Error;
use crate::model::LogId;

/// When to run full compactions of a partition.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CompactionSchedule {
    /// Compact at each distinct backlog duration found in the logs config.
    #[default]
    Auto,
    /// Never run scheduled full compactions.
    Disabled,
    /// Compact when the partition reaches each of these ages, ascending.
    Ages(Vec<Duration>),
}

impl CompactionSchedule {
    /// Resolves the schedule to a sorted list of ages.
    pub fn resolve(&self, backlogs: &[Duration]) -> Vec<Duration> {
        let mut ages = match self {
            CompactionSchedule::Auto => backlogs.to_vec(),
            CompactionSchedule::Disabled => Vec::new(),
            CompactionSchedule::Ages(ages) => ages.clone(),
        };
        ages.sort();
        ages.dedup();
        ages
    }
}

impl FromStr for CompactionSchedule {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Error> {
        match value.trim() {
            "auto" => Ok(CompactionSchedule::Auto),
            "disabled" => Ok(CompactionSchedule::Disabled),
            list => {
                let mut ages = Vec::new();
                for part in list.split(',') {
                    ages.push(parse_duration(part.trim())?);
                }
                if ages.is_empty() {
                    return Err(Error::Protocol("empty compaction schedule".to_string()));
                }
                ages.sort();
                Ok(CompactionSchedule::Ages(ages))
            }
        }
    }
}

/// Parses durations of the form `30s`, `15min`, `1h`, `7d`, `100ms`.
pub fn parse_duration(value: &str) -> Result<Duration, Error> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| Error::Protocol(format!("duration '{}' has no unit", value)))?;
    let (digits, unit) = value.split_at(split);
    let amount: u64 = digits
        .parse()
        .map_err(|_| Error::Protocol(format!("invalid duration '{}'", value)))?;
    let ms = match unit {
        "ms" => amount,
        "s" => amount * 1000,
        "min" => amount * 60 * 1000,
        "h" => amount * 60 * 60 * 1000,
        "d" => amount * 24 * 60 * 60 * 1000,
        _ => return Err(Error::Protocol(format!("unknown duration unit '{}'", unit))),
    };
    Ok(Duration::from_millis(ms))
}

/// All engine-level tuning knobs.
///
/// Durations of zero mean "disabled" for the limits that document it.
#[derive(Debug, Clone)]
pub struct Settings {
    // Partition lifecycle.
    /// Create a new partition when the latest one becomes this old.
    /// Zero means never.
    pub partition_duration: Duration,
    /// Create a new partition when the latest one has this many level-0
    /// files. Zero means never.
    pub partition_file_limit: u64,
    /// Create a new partition when the latest one holds this many bytes.
    /// Zero means never.
    pub partition_size_limit: u64,
    /// Above this partition count the duration trigger is tripled and the
    /// file trigger ignored; prepends are refused.
    pub partition_count_soft_limit: usize,
    /// Slack allowed on partition timestamp bounds; also the findTime
    /// index bucket width.
    pub timestamp_granularity: Duration,
    /// New partitions start this far in the future, so slightly-ahead
    /// timestamps still land in them.
    pub new_partition_timestamp_margin: Duration,
    pub partition_hi_pri_check_period: Duration,
    pub partition_lo_pri_check_period: Duration,
    /// Prepended partitions are kept at least this long.
    pub prepended_partition_min_lifetime: Duration,

    // Flush scheduling.
    pub min_manual_flush_interval: Duration,
    /// Flush when the oldest unflushed write is this old.
    pub partition_data_age_flush_trigger: Duration,
    /// Flush when a dirty partition has seen no writes for this long.
    pub partition_idle_flush_trigger: Duration,
    /// Flush when this many bytes are buffered in one partition.
    /// Zero disables the trigger.
    pub bytes_written_since_flush_trigger: u64,
    /// Node-wide memtable budget; the oldest-dirtied partition is flushed
    /// when exceeded.
    pub memtable_size_per_node: u64,
    /// After a flush, writes within this window re-dirty the partition
    /// without rewriting its dirty marker.
    pub redirty_grace_period: Duration,
    /// Defer WAL syncs to a dedicated background task instead of syncing
    /// on every store.
    pub background_wal_sync: bool,

    // Compaction.
    pub partition_compactions_enabled: bool,
    pub partition_compaction_schedule: CompactionSchedule,
    /// Compact the metadata family at least this often when it has more
    /// than one file.
    pub metadata_compaction_period: Duration,
    /// Uncompressed read rate allowed per compaction. Zero means unlimited.
    pub compaction_ratelimit_bytes_per_sec: u64,
    /// Delete rate for obsolete files. Zero means unlimited.
    pub sst_delete_bytes_per_sec: u64,
    pub partition_partial_compaction_file_num_threshold: usize,
    pub partition_partial_compaction_max_files: usize,
    pub partition_partial_compaction_file_size_threshold: u64,
    /// Largest file size admitted into a partial compaction; zero means
    /// twice the size threshold.
    pub partition_partial_compaction_max_file_size: u64,
    /// No single file may exceed this share of a picked range's total.
    pub partition_partial_compaction_largest_file_share: f64,
    pub partition_partial_compaction_max_num_per_loop: usize,
    /// Rebuilding stores stall while this many partial compactions are
    /// outstanding.
    pub partition_partial_compaction_stall_trigger: usize,

    // Directory.
    pub num_metadata_locks: usize,
    pub directory_consistency_check_period: Duration,

    // Retention.
    /// Free-space fraction below which the shard reports fullness.
    /// Zero disables the monitor.
    pub free_disk_space_threshold_low: f64,
    /// Advance trim points locally under disk pressure.
    pub sbr_force: bool,
    /// Delay before records of unconfigured logs become trimmable.
    pub unconfigured_log_trimming_grace_period: Duration,

    // Reads.
    pub use_copyset_index: bool,
    pub read_find_time_index: bool,
    pub disable_iterate_upper_bound: bool,

    // Safety.
    pub verify_checksum_during_store: bool,
    pub read_only: bool,
    pub auto_create_shards: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            partition_duration: Duration::from_secs(15 * 60),
            partition_file_limit: 200,
            partition_size_limit: 6 * 1024 * 1024 * 1024,
            partition_count_soft_limit: 2000,
            timestamp_granularity: Duration::from_secs(5),
            new_partition_timestamp_margin: Duration::from_secs(10),
            partition_hi_pri_check_period: Duration::from_secs(2),
            partition_lo_pri_check_period: Duration::from_secs(30),
            prepended_partition_min_lifetime: Duration::from_secs(300),
            min_manual_flush_interval: Duration::from_secs(120),
            partition_data_age_flush_trigger: Duration::from_secs(600),
            partition_idle_flush_trigger: Duration::from_secs(300),
            bytes_written_since_flush_trigger: 0,
            memtable_size_per_node: 10 * 1024 * 1024 * 1024,
            redirty_grace_period: Duration::from_secs(5),
            background_wal_sync: true,
            partition_compactions_enabled: true,
            partition_compaction_schedule: CompactionSchedule::Auto,
            metadata_compaction_period: Duration::from_secs(60 * 60),
            compaction_ratelimit_bytes_per_sec: 30 * 1024 * 1024,
            sst_delete_bytes_per_sec: 0,
            partition_partial_compaction_file_num_threshold: 10,
            partition_partial_compaction_max_files: 100,
            partition_partial_compaction_file_size_threshold: 50_000_000,
            partition_partial_compaction_max_file_size: 0,
            partition_partial_compaction_largest_file_share: 0.7,
            partition_partial_compaction_max_num_per_loop: 4,
            partition_partial_compaction_stall_trigger: 50,
            num_metadata_locks: 256,
            directory_consistency_check_period: Duration::from_secs(5 * 60),
            free_disk_space_threshold_low: 0.0,
            sbr_force: false,
            unconfigured_log_trimming_grace_period: Duration::from_secs(4 * 24 * 60 * 60),
            use_copyset_index: true,
            read_find_time_index: false,
            disable_iterate_upper_bound: false,
            verify_checksum_during_store: true,
            read_only: false,
            auto_create_shards: false,
        }
    }
}

impl Settings {
    /// FindTime bucket for a timestamp.
    pub fn ts_bucket(&self, timestamp_ms: i64) -> u64 {
        let granularity = self.timestamp_granularity.as_millis().max(1) as i64;
        (timestamp_ms.max(0) / granularity) as u64
    }

    /// Effective cap on file sizes admitted into partial compactions.
    pub fn partial_compaction_max_file_size(&self) -> u64 {
        if self.partition_partial_compaction_max_file_size == 0 {
            2 * self.partition_partial_compaction_file_size_threshold
        } else {
            self.partition_partial_compaction_max_file_size
        }
    }
}

/// Attributes of one configured log, as seen by this shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LogAttributes {
    /// Retention: records older than this may be trimmed. `None` keeps
    /// records until an explicit trim.
    pub backlog: Option<Duration>,
}

/// Read-only view of the logs configuration.
///
/// Distributed by a higher layer; the engine only consults it for
/// retention and for detecting unconfigured logs.
pub trait LogsConfig: Send + Sync {
    fn attributes(&self, log_id: LogId) -> Option<LogAttributes>;

    /// Distinct backlog durations across all configured logs, used by the
    /// `auto` compaction schedule.
    fn backlog_durations(&self) -> Vec<Duration>;
}

/// Immutable in-memory logs configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticLogsConfig {
    logs: HashMap<LogId, LogAttributes>,
}

impl StaticLogsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_log(mut self, log_id: LogId, attributes: LogAttributes) -> Self {
        self.logs.insert(log_id, attributes);
        self
    }
}

impl LogsConfig for StaticLogsConfig {
    fn attributes(&self, log_id: LogId) -> Option<LogAttributes> {
        self.logs.get(&log_id).copied()
    }

    fn backlog_durations(&self) -> Vec<Duration> {
        let mut durations: Vec<Duration> =
            self.logs.values().filter_map(|attrs| attrs.backlog).collect();
        durations.sort();
        durations.dedup();
        durations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_parse_duration_units() {
        assert_eq!(parse_duration("100ms").unwrap(), Duration::from_millis(100));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("15min").unwrap(), Duration::from_secs(900));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("7d").unwrap(), Duration::from_secs(604_800));
    }

    #[test]
    fn should_reject_malformed_durations() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("x5s").is_err());
        assert!(parse_duration("5weeks").is_err());
    }

    #[test]
    fn should_parse_auto_and_disabled_schedules() {
        assert_eq!(
            "auto".parse::<CompactionSchedule>().unwrap(),
            CompactionSchedule::Auto
        );
        assert_eq!(
            "disabled".parse::<CompactionSchedule>().unwrap(),
            CompactionSchedule::Disabled
        );
    }

    #[test]
    fn should_parse_age_list_schedule_sorted() {
        // given
        let schedule: CompactionSchedule = "7d, 3d".parse().unwrap();

        // then
        assert_eq!(
            schedule,
            CompactionSchedule::Ages(vec![
                Duration::from_secs(3 * 24 * 3600),
                Duration::from_secs(7 * 24 * 3600)
            ])
        );
    }

    #[test]
    fn should_resolve_auto_schedule_from_backlogs() {
        // given
        let backlogs = vec![
            Duration::from_secs(7200),
            Duration::from_secs(3600),
            Duration::from_secs(7200),
        ];

        // when
        let ages = CompactionSchedule::Auto.resolve(&backlogs);

        // then - sorted and deduplicated
        assert_eq!(
            ages,
            vec![Duration::from_secs(3600), Duration::from_secs(7200)]
        );
        assert!(CompactionSchedule::Disabled.resolve(&backlogs).is_empty());
    }

    #[test]
    fn should_default_durability_and_safety_knobs_on() {
        // given/when
        let settings = Settings::default();

        // then - stores verify flagged checksums, and WAL syncs are
        // deferred to the dedicated background task
        assert!(settings.verify_checksum_during_store);
        assert!(settings.background_wal_sync);
        assert!(!settings.read_only);
        assert!(!settings.auto_create_shards);
    }

    #[test]
    fn should_bucket_timestamps_by_granularity() {
        // given
        let settings = Settings::default();

        // then - 5s buckets
        assert_eq!(settings.ts_bucket(0), 0);
        assert_eq!(settings.ts_bucket(4_999), 0);
        assert_eq!(settings.ts_bucket(5_000), 1);
        assert_eq!(settings.ts_bucket(12_500), 2);
    }

    #[test]
    fn should_derive_partial_compaction_max_file_size() {
        // given
        let mut settings = Settings::default();

        // then - zero means twice the threshold
        assert_eq!(settings.partial_compaction_max_file_size(), 100_000_000);

        settings.partition_partial_compaction_max_file_size = 1;
        assert_eq!(settings.partial_compaction_max_file_size(), 1);
    }

    #[test]
    fn should_collect_distinct_backlogs_from_static_config() {
        // given
        let config = StaticLogsConfig::new()
            .with_log(
                1,
                LogAttributes {
                    backlog: Some(Duration::from_secs(60)),
                },
            )
            .with_log(
                2,
                LogAttributes {
                    backlog: Some(Duration::from_secs(60)),
                },
            )
            .with_log(3, LogAttributes { backlog: None });

        // when/then
        assert_eq!(config.backlog_durations(), vec![Duration::from_secs(60)]);
        assert!(config.attributes(1).is_some());
        assert!(config.attributes(99).is_none());
    }
}
