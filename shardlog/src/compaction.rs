//! Compaction policy.
//!
//! Two kinds of work are decided here, both executed by the low-priority
//! maintenance loop:
//!
//! - **Partial compactions** merge contiguous ranges of small level-0
//!   files, which accumulate quickly during rebuilding. The picker is a
//!   pure function over the file listing so it can be tested exhaustively.
//! - **Scheduled full compactions** rewrite a whole partition once it
//!   reaches each configured age, reclaiming the space of records that
//!   retention has trimmed by then.
//!
//! Compaction reads are paced by a byte-rate limiter.

use std::time::Duration;

use common::L0FileInfo;

use crate::config::Settings;
use crate::partition::Partition;

/// Picks contiguous ranges of level-0 files worth merging.
///
/// A file is a candidate if it is at most `partial_compaction_max_file_size`
/// large; ranges must have at least `file_num_threshold` files, at most
/// `max_files`, and no single file may exceed `largest_file_share` of the
/// range's total size (ranges dominated by one file are split around it).
pub(crate) fn pick_partial_compactions(
    files: &[L0FileInfo],
    settings: &Settings,
) -> Vec<Vec<u64>> {
    let max_file_size = settings.partial_compaction_max_file_size();
    let mut picked = Vec::new();
    let mut run: Vec<L0FileInfo> = Vec::new();
    for file in files {
        if file.size_bytes <= max_file_size {
            run.push(*file);
        } else {
            pick_from_run(&run, settings, &mut picked);
            run.clear();
        }
    }
    pick_from_run(&run, settings, &mut picked);
    picked
}

fn pick_from_run(run: &[L0FileInfo], settings: &Settings, picked: &mut Vec<Vec<u64>>) {
    let threshold = settings.partition_partial_compaction_file_num_threshold.max(2);
    if run.len() < threshold {
        return;
    }

    let total: u64 = run.iter().map(|f| f.size_bytes).sum();
    let (largest_idx, largest) = run
        .iter()
        .enumerate()
        .max_by_key(|(_, f)| f.size_bytes)
        .map(|(idx, f)| (idx, f.size_bytes))
        .expect("run is non-empty");
    if run.len() > 1
        && largest as f64 > settings.partition_partial_compaction_largest_file_share * total as f64
    {
        pick_from_run(&run[..largest_idx], settings, picked);
        pick_from_run(&run[largest_idx + 1..], settings, picked);
        return;
    }

    let max_files = settings.partition_partial_compaction_max_files.max(2);
    for chunk in run.chunks(max_files) {
        if chunk.len() >= threshold {
            picked.push(chunk.iter().map(|f| f.id).collect());
        }
    }
}

/// Paces compaction IO: how long to pause after reading `bytes`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RateLimiter {
    bytes_per_sec: u64,
}

impl RateLimiter {
    pub fn new(bytes_per_sec: u64) -> Self {
        Self { bytes_per_sec }
    }

    pub fn pause_for(&self, bytes: u64) -> Duration {
        if self.bytes_per_sec == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(bytes as f64 / self.bytes_per_sec as f64)
    }
}

/// The largest schedule age this partition is now due for, if any.
///
/// A partition is compacted once per schedule age: when its age passes
/// `d`, retention has trimmed every log with a backlog of up to `d` out of
/// it, so a rewrite reclaims their space.
pub(crate) fn due_compaction_age(
    partition: &Partition,
    ages: &[Duration],
    now_ms: i64,
) -> Option<Duration> {
    let partition_age_ms = partition.age(now_ms);
    ages.iter()
        .filter(|age| {
            partition_age_ms >= age.as_millis() as i64
                && age.as_secs() > partition.compacted_up_to_secs()
        })
        .max()
        .copied()
}
