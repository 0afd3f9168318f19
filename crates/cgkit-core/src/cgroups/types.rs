//! Data types for cgroup management

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use super::error::{CgroupError, Result};

/// Which kernel interface a cgroup lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CgroupVersion {
    /// Per-controller hierarchies (cgroup v1)
    #[serde(rename = "v1")]
    Legacy,
    /// Single unified hierarchy (cgroup v2)
    #[serde(rename = "v2")]
    Unified,
}

impl CgroupVersion {
    /// Detect the hierarchy mounted at `root`.
    ///
    /// Only a cgroup2 filesystem mounted directly at the root counts as
    /// unified; hybrid setups (tmpfs root with a `unified` sub-mount) are
    /// treated as legacy.
    pub fn detect(root: &Path) -> Result<Self> {
        use nix::sys::statfs::{statfs, CGROUP2_SUPER_MAGIC};

        let stat = statfs(root).map_err(|errno| {
            CgroupError::from_io(root, std::io::Error::from_raw_os_error(errno as i32))
        })?;

        if stat.filesystem_type() == CGROUP2_SUPER_MAGIC {
            Ok(Self::Unified)
        } else {
            Ok(Self::Legacy)
        }
    }

    pub fn is_unified(self) -> bool {
        self == Self::Unified
    }
}

impl fmt::Display for CgroupVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Legacy => f.write_str("v1"),
            Self::Unified => f.write_str("v2"),
        }
    }
}

/// Resource limits to apply to a cgroup
///
/// Numeric fields use `0` for "not requested". Where a field also accepts
/// `-1`, that means unlimited.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Resources {
    pub cpu: CpuResources,
    pub cpuset: CpusetResources,
    pub memory: MemoryResources,
    pub blkio: BlkioResources,
    pub pids: PidsResources,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuResources {
    /// Unified-hierarchy weight (1-10000)
    pub weight: u64,

    /// Legacy relative shares
    pub shares: u64,

    /// CFS period (microseconds)
    pub period: u64,

    /// CFS quota per period (microseconds, -1 = unlimited)
    pub quota: i64,

    /// Real-time period (microseconds)
    pub rt_period: u64,

    /// Real-time runtime per period (microseconds)
    pub rt_runtime: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpusetResources {
    /// CPU list in kernel list format, e.g. "0-3,6"
    pub cpus: String,

    /// Memory node list in kernel list format
    pub mems: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryResources {
    /// Hard memory limit (bytes, -1 = unlimited)
    pub limit: i64,

    /// Soft limit / reservation (bytes)
    pub reservation: i64,

    /// Memory + swap limit (bytes, -1 = unlimited)
    pub swap: i64,

    /// Swappiness 0-100; `None` or -1 leaves the kernel value alone
    pub swappiness: Option<i64>,

    /// Disable the OOM killer (legacy hierarchy only)
    pub oom_kill_disable: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlkioResources {
    /// Relative weight (10-1000)
    pub weight: u16,

    /// Weight for tasks directly in this cgroup (legacy only)
    pub leaf_weight: u16,

    pub weight_device: Vec<WeightDevice>,
    pub throttle_read_bps_device: Vec<ThrottleDevice>,
    pub throttle_write_bps_device: Vec<ThrottleDevice>,
    pub throttle_read_iops_device: Vec<ThrottleDevice>,
    pub throttle_write_iops_device: Vec<ThrottleDevice>,
}

/// Per-device weight entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeightDevice {
    pub major: i64,
    pub minor: i64,
    pub weight: u16,
    pub leaf_weight: u16,
}

/// Per-device throttle entry (bytes or operations per second)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleDevice {
    pub major: i64,
    pub minor: i64,
    pub rate: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PidsResources {
    /// Maximum number of tasks. Non-positive means unlimited on the legacy
    /// hierarchy; on the unified hierarchy `0` is written as-is.
    pub limit: Option<i64>,
}

/// A byte limit as the unified hierarchy spells it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Limit {
    Unlimited,
    Bytes(u64),
}

impl Limit {
    /// Interpret a raw resource value: `0` is unset, negative is unlimited.
    pub fn from_raw(value: i64) -> Option<Self> {
        match value {
            0 => None,
            v if v < 0 => Some(Self::Unlimited),
            v => Some(Self::Bytes(v as u64)),
        }
    }

    /// Value for systemd properties, where infinity is `u64::MAX`.
    pub fn as_u64(self) -> u64 {
        match self {
            Self::Unlimited => u64::MAX,
            Self::Bytes(bytes) => bytes,
        }
    }
}

impl fmt::Display for Limit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unlimited => f.write_str("max"),
            Self::Bytes(bytes) => write!(f, "{}", bytes),
        }
    }
}

/// Usage statistics collected from all controllers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metrics {
    pub cpu: CpuStats,
    pub memory: MemoryStats,
    pub blkio: BlkioStats,
    pub pids: PidsStats,
}

/// CPU statistics (nanoseconds on both hierarchies)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuStats {
    /// Total CPU time consumed
    pub total_usage: u64,

    /// Kernel-mode CPU time
    pub usage_in_kernelmode: u64,

    /// Per-CPU usage (legacy hierarchy only)
    pub percpu_usage: Vec<u64>,
}

/// Memory statistics
///
/// On the unified hierarchy `usage` is anonymous memory only; on the legacy
/// hierarchy it is the kernel's total usage including page cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStats {
    /// Current usage (bytes)
    pub usage: u64,

    /// Hard limit (bytes, `u64::MAX` when unlimited)
    pub limit: u64,
}

impl MemoryStats {
    /// Get current usage in MB
    pub fn usage_mb(&self) -> u64 {
        self.usage / 1024 / 1024
    }

    pub fn is_limited(&self) -> bool {
        self.limit != 0 && self.limit != u64::MAX
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlkioStats {
    pub io_service_bytes_recursive: Vec<BlkioStatEntry>,
}

impl BlkioStats {
    /// Value recorded for one device and operation.
    pub fn value(&self, major: u64, minor: u64, op: &str) -> Option<u64> {
        self.io_service_bytes_recursive
            .iter()
            .find(|e| e.major == major && e.minor == minor && e.op == op)
            .map(|e| e.value)
    }

    /// Sum of one operation across all devices.
    pub fn total(&self, op: &str) -> u64 {
        self.io_service_bytes_recursive
            .iter()
            .filter(|e| e.op == op)
            .map(|e| e.value)
            .sum()
    }
}

/// One `(device, operation)` I/O counter, using legacy op names
/// (`Read`/`Write` on v1, `read`/`write` on v2).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlkioStatEntry {
    pub major: u64,
    pub minor: u64,
    pub op: String,
    pub value: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PidsStats {
    pub current: u64,
}
