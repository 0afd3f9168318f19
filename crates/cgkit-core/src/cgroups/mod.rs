//! Unified cgroup v1/v2 resource control
//!
//! [`CgroupControl`] is the entry point. It picks a [`Hierarchy`] strategy
//! once from the [`CgroupVersion`] and drives the CPU, CPUSet, Memory,
//! BlkIO and PIDs [`Handler`]s of that hierarchy in a fixed order.
//!
//! All kernel access goes through [`CgroupFs`], so the whole layer runs
//! against an in-memory filesystem in tests.

mod blkio;
mod control;
mod cpu;
mod cpuset;
pub mod error;
pub mod fs;
pub mod hierarchy;
mod memory;
pub mod path;
mod pids;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use blkio::{io_weight_from_blkio, parse_io_stat, LegacyBlkio, UnifiedBlkio};
pub use control::CgroupControl;
pub use cpu::{cpu_max_value, LegacyCpu, UnifiedCpu, DEFAULT_CFS_PERIOD_US};
pub use cpuset::{LegacyCpuset, UnifiedCpuset};
pub use error::{CgroupError, Result};
pub use fs::{CgroupFs, HostFs};
pub use hierarchy::{Handler, Hierarchy, LegacyHierarchy, Scope, UnifiedHierarchy};
pub use memory::{swap_allowance, LegacyMemory, UnifiedMemory};
pub use path::{CgroupPaths, Subsystem, DEFAULT_CGROUP_ROOT};
pub use pids::{LegacyPids, UnifiedPids};
pub use types::{
    BlkioResources, BlkioStatEntry, BlkioStats, CgroupVersion, CpuResources, CpuStats,
    CpusetResources, Limit, MemoryResources, MemoryStats, Metrics, PidsResources, PidsStats,
    Resources, ThrottleDevice, WeightDevice,
};
