//! Available-memory sampling and the chunk sizing rules derived from it

use parking_lot::Mutex;
use serde::Serialize;
use sysinfo::System;

use crate::Config;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Source of available-memory readings.
pub trait MemoryProbe: Send + Sync {
    /// Bytes currently available to new allocations, `None` if unknown.
    fn available_bytes(&self) -> Option<u64>;

    /// Full snapshot for diagnostics, when the probe can provide one.
    fn info(&self) -> Option<(u64, u64, u64)> {
        None
    }
}

/// Probe backed by the operating system via `sysinfo`.
pub struct SystemMemory {
    system: Mutex<System>,
}

impl SystemMemory {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SystemMemory {
    fn available_bytes(&self) -> Option<u64> {
        let mut system = self.system.lock();
        system.refresh_memory();
        match system.available_memory() {
            0 => None,
            bytes => Some(bytes),
        }
    }

    /// (total, available, used) in bytes
    fn info(&self) -> Option<(u64, u64, u64)> {
        let mut system = self.system.lock();
        system.refresh_memory();
        let total = system.total_memory();
        (total > 0).then(|| (total, system.available_memory(), system.used_memory()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryLevel {
    /// At or above the warning floor
    Sufficient,
    /// Between the hard and warning floors; chunks shrink
    Low,
    /// Below the hard floor; builds abort
    Critical,
    /// The probe gave no reading; treated as able to continue
    Unknown,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct MemoryStatus {
    pub available_gb: f64,
    pub level: MemoryLevel,
}

impl MemoryStatus {
    pub fn can_continue(&self) -> bool {
        self.level != MemoryLevel::Critical
    }

    pub fn is_low(&self) -> bool {
        self.level == MemoryLevel::Low
    }
}

/// Diagnostics view of system memory.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryInfo {
    pub total_gb: f64,
    pub available_gb: f64,
    pub used_gb: f64,
    pub percent_used: f64,
    pub can_continue: bool,
    pub below_warning: bool,
}

/// Thresholds and chunk sizing taken from [`Config`].
#[derive(Debug, Clone, Copy)]
pub struct MemoryPolicy {
    pub min_gb: f64,
    pub warning_gb: f64,
    pub shrink_factor: f64,
    pub base_chunk: usize,
    pub min_chunk: usize,
}

impl MemoryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            min_gb: config.min_memory_gb,
            warning_gb: config.warning_memory_gb,
            shrink_factor: config.chunk_shrink_factor,
            base_chunk: config.base_chunk_size,
            min_chunk: config.min_chunk_size,
        }
    }

    /// Classify a probe reading.
    pub fn assess(&self, available_bytes: Option<u64>) -> MemoryStatus {
        let Some(bytes) = available_bytes else {
            return MemoryStatus {
                available_gb: 0.0,
                level: MemoryLevel::Unknown,
            };
        };
        let available_gb = bytes as f64 / BYTES_PER_GB;
        let level = if available_gb < self.min_gb {
            MemoryLevel::Critical
        } else if available_gb < self.warning_gb {
            MemoryLevel::Low
        } else {
            MemoryLevel::Sufficient
        };
        MemoryStatus {
            available_gb,
            level,
        }
    }

    pub fn sample(&self, probe: &dyn MemoryProbe) -> MemoryStatus {
        self.assess(probe.available_bytes())
    }

    /// Chunk size for a build of `total_files`, scaled down proportionally
    /// when memory is below the warning floor, never below `min_chunk`.
    pub fn initial_chunk_size(&self, total_files: usize, status: &MemoryStatus) -> usize {
        let mut size = self.base_chunk;
        if status.is_low() && self.warning_gb > 0.0 {
            let ratio = (status.available_gb / self.warning_gb).clamp(0.0, 1.0);
            size = (size as f64 * ratio) as usize;
        }
        size.min(total_files).max(self.min_chunk)
    }

    /// Next smaller chunk size after memory pressure or an encode failure.
    pub fn shrink(&self, size: usize) -> usize {
        ((size as f64 * self.shrink_factor) as usize).max(self.min_chunk)
    }

    pub fn describe(&self, probe: &dyn MemoryProbe) -> MemoryInfo {
        let status = self.sample(probe);
        match probe.info() {
            Some((total, available, used)) => MemoryInfo {
                total_gb: total as f64 / BYTES_PER_GB,
                available_gb: available as f64 / BYTES_PER_GB,
                used_gb: used as f64 / BYTES_PER_GB,
                percent_used: if total > 0 {
                    used as f64 * 100.0 / total as f64
                } else {
                    0.0
                },
                can_continue: status.can_continue(),
                below_warning: status.level != MemoryLevel::Sufficient,
            },
            None => MemoryInfo {
                total_gb: 0.0,
                available_gb: status.available_gb,
                used_gb: 0.0,
                percent_used: 0.0,
                can_continue: status.can_continue(),
                below_warning: matches!(status.level, MemoryLevel::Low | MemoryLevel::Critical),
            },
        }
    }
}
