//! Space-based retention.
//!
//! A monitor polls the filesystem holding the shard and compares the free
//! fraction against `free_disk_space_threshold_low`. Below the threshold
//! the shard reports fullness (new stores fail with `NoSpace`) so the
//! sequencer side can trim proactively; with `sbr_force` enabled the shard
//! additionally advances trim points for the logs in its oldest partition.

use std::io;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use sysinfo::Disks;

/// Source of free-space information, separated out so tests can fake it.
pub trait DiskSpace: Send + Sync {
    /// Fraction of the filesystem holding `path` that is free, in `0.0..=1.0`.
    fn free_fraction(&self, path: &Path) -> io::Result<f64>;
}

/// Reads free space from the operating system.
pub struct SystemDiskSpace;

impl DiskSpace for SystemDiskSpace {
    fn free_fraction(&self, path: &Path) -> io::Result<f64> {
        let disks = Disks::new_with_refreshed_list();
        let disk = disks
            .list()
            .iter()
            .filter(|disk| path.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no filesystem found for {}", path.display()),
                )
            })?;
        if disk.total_space() == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "filesystem reports zero total space",
            ));
        }
        Ok(disk.available_space() as f64 / disk.total_space() as f64)
    }
}

/// Fixed free-space fraction, adjustable at runtime.
pub struct MockDiskSpace {
    fraction: RwLock<f64>,
}

impl MockDiskSpace {
    pub fn new(fraction: f64) -> Self {
        Self {
            fraction: RwLock::new(fraction),
        }
    }

    pub fn set_fraction(&self, fraction: f64) {
        *self.fraction.write() = fraction;
    }
}

impl DiskSpace for MockDiskSpace {
    fn free_fraction(&self, _path: &Path) -> io::Result<f64> {
        Ok(*self.fraction.read())
    }
}

/// Result of one monitor poll.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SpaceStatus {
    /// Enough free space, or the monitor is disabled.
    Ok,
    /// Free fraction dropped below the threshold.
    Low { free_fraction: f64 },
}

pub(crate) struct SpaceMonitor {
    threshold: f64,
    provider: Arc<dyn DiskSpace>,
}

impl SpaceMonitor {
    pub fn new(threshold: f64, provider: Arc<dyn DiskSpace>) -> Self {
        Self {
            threshold,
            provider,
        }
    }

    pub fn check(&self, path: &Path) -> io::Result<SpaceStatus> {
        if self.threshold <= 0.0 {
            return Ok(SpaceStatus::Ok);
        }
        let free_fraction = self.provider.free_fraction(path)?;
        if free_fraction < self.threshold {
            Ok(SpaceStatus::Low { free_fraction })
        } else {
            Ok(SpaceStatus::Ok)
        }
    }
}
