//! Memory controller

use std::path::Path;

use tracing::debug;

use super::error::{CgroupError, Result};
use super::fs::{self, CgroupFs};
use super::hierarchy::{create_legacy_dir, remove_legacy_dir, Handler, Scope};
use super::path::Subsystem;
use super::types::{Limit, MemoryResources, Metrics, Resources};

/// Convert a legacy memory+swap limit into a unified swap-only allowance.
///
/// `swap` and `memory` use the resource encoding (0 = unset, -1 =
/// unlimited). Returns `None` when nothing should be written.
pub fn swap_allowance(swap: i64, memory: i64) -> Result<Option<Limit>> {
    // Unlimited memory with unset swap means both unlimited.
    if memory == -1 && swap == 0 {
        return Ok(Some(Limit::Unlimited));
    }
    match swap {
        -1 => return Ok(Some(Limit::Unlimited)),
        0 => return Ok(None),
        _ => {}
    }

    if memory == 0 || memory == -1 {
        return Err(CgroupError::InvalidLimit(
            "unable to set swap limit without memory limit".to_string(),
        ));
    }
    if memory < 0 {
        return Err(CgroupError::InvalidLimit(format!(
            "invalid memory value: {}",
            memory
        )));
    }
    if swap < memory {
        return Err(CgroupError::InvalidLimit(format!(
            "memory+swap limit {} should be >= memory limit {}",
            swap, memory
        )));
    }

    Ok(Some(Limit::Bytes((swap - memory) as u64)))
}

/// Validate swappiness; `None` and `-1` mean leave unchanged.
fn swappiness(memory: &MemoryResources) -> Result<Option<i64>> {
    match memory.swappiness {
        None | Some(-1) => Ok(None),
        Some(value @ 0..=100) => Ok(Some(value)),
        Some(value) => Err(CgroupError::InvalidLimit(format!(
            "invalid memory swappiness value: {} (valid range is 0-100)",
            value
        ))),
    }
}

/// Memory on the unified hierarchy: `memory.swap.max`, `memory.max`,
/// `memory.low`.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnifiedMemory;

impl Handler for UnifiedMemory {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn apply(&self, scope: &Scope<'_>, resources: &Resources) -> Result<()> {
        let memory = &resources.memory;
        let dir = scope.paths.unified();

        if let Some(swap) = swap_allowance(memory.swap, memory.limit)? {
            fs::write_file(scope.fs, &dir, "memory.swap.max", swap)?;
        }
        if let Some(limit) = Limit::from_raw(memory.limit) {
            fs::write_file(scope.fs, &dir, "memory.max", limit)?;
        }
        if let Some(low) = Limit::from_raw(memory.reservation) {
            fs::write_file(scope.fs, &dir, "memory.low", low)?;
        }

        if memory.oom_kill_disable {
            debug!("oom_kill_disable has no unified equivalent, ignoring");
        }
        Ok(())
    }

    /// Usage is the `anon` counter of `memory.stat`, not `memory.current`.
    fn stat(&self, scope: &Scope<'_>, metrics: &mut Metrics) -> Result<()> {
        let dir = scope.paths.unified();

        metrics.memory.usage = fs::read_key_u64(scope.fs, &dir, "memory.stat", "anon")?;
        metrics.memory.limit = fs::read_u64(scope.fs, &dir, "memory.max")?;
        Ok(())
    }
}

/// Memory on the legacy hierarchy.
#[derive(Debug, Clone, Copy, Default)]
pub struct LegacyMemory;

impl LegacyMemory {
    /// Write the hard limit and the memory+swap limit.
    ///
    /// The kernel requires memsw >= limit at every instant, so when both
    /// change the order depends on the limit currently in effect.
    fn write_limits(fs: &dyn CgroupFs, dir: &Path, limit: i64, swap: i64) -> Result<()> {
        if limit != 0 && swap != 0 {
            let current = fs::read_u64(fs, dir, "memory.limit_in_bytes")?;
            let swap_first = swap == -1 || current < swap as u64;
            debug!(current, limit, swap, swap_first, "Ordering memory limit writes");

            if swap_first {
                fs::write_file(fs, dir, "memory.memsw.limit_in_bytes", swap)?;
                fs::write_file(fs, dir, "memory.limit_in_bytes", limit)?;
            } else {
                fs::write_file(fs, dir, "memory.limit_in_bytes", limit)?;
                fs::write_file(fs, dir, "memory.memsw.limit_in_bytes", swap)?;
            }
            return Ok(());
        }

        if limit != 0 {
            fs::write_file(fs, dir, "memory.limit_in_bytes", limit)?;
        }
        if swap != 0 {
            fs::write_file(fs, dir, "memory.memsw.limit_in_bytes", swap)?;
        }
        Ok(())
    }
}

impl Handler for LegacyMemory {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn create(&self, scope: &Scope<'_>) -> Result<()> {
        create_legacy_dir(scope, Subsystem::Memory).map(|_| ())
    }

    fn apply(&self, scope: &Scope<'_>, resources: &Resources) -> Result<()> {
        let memory = &resources.memory;
        let dir = scope.paths.legacy(Subsystem::Memory);
        let swappiness = swappiness(memory)?;

        let mut swap = memory.swap;
        // Only touch swap when the kernel has swap accounting.
        if memory.limit == -1 && swap == 0 && scope.fs.exists(&dir.join("memory.memsw.limit_in_bytes")) {
            swap = -1;
        }

        Self::write_limits(scope.fs, &dir, memory.limit, swap)?;

        if memory.reservation != 0 {
            fs::write_file(scope.fs, &dir, "memory.soft_limit_in_bytes", memory.reservation)?;
        }
        if memory.oom_kill_disable {
            fs::write_file(scope.fs, &dir, "memory.oom_control", "1")?;
        }
        if let Some(value) = swappiness {
            fs::write_file(scope.fs, &dir, "memory.swappiness", value)?;
        }

        Ok(())
    }

    fn destroy(&self, scope: &Scope<'_>) -> Result<()> {
        remove_legacy_dir(scope, Subsystem::Memory)
    }

    fn stat(&self, scope: &Scope<'_>, metrics: &mut Metrics) -> Result<()> {
        let dir = scope.paths.legacy(Subsystem::Memory);

        metrics.memory.usage = fs::read_u64(scope.fs, &dir, "memory.usage_in_bytes")?;
        metrics.memory.limit = fs::read_u64(scope.fs, &dir, "memory.limit_in_bytes")?;
        Ok(())
    }
}
