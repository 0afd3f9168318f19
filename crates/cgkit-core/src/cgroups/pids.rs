//! PIDs controller

use std::path::Path;

use super::error::Result;
use super::fs;
use super::hierarchy::{create_legacy_dir, remove_legacy_dir, Handler, Scope};
use super::path::Subsystem;
use super::types::{Metrics, Resources};

fn stat_current(scope: &Scope<'_>, dir: &Path, metrics: &mut Metrics) -> Result<()> {
    // No cgroup named yet, nothing to read.
    if scope.paths.is_empty() {
        return Ok(());
    }
    metrics.pids.current = fs::read_u64(scope.fs, dir, "pids.current")?;
    Ok(())
}

/// PIDs on the unified hierarchy. `0` is a real limit here and is written
/// as-is; negative values become `max`.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnifiedPids;

impl Handler for UnifiedPids {
    fn name(&self) -> &'static str {
        "pids"
    }

    fn apply(&self, scope: &Scope<'_>, resources: &Resources) -> Result<()> {
        let Some(limit) = resources.pids.limit else {
            return Ok(());
        };
        let value = if limit < 0 {
            "max".to_string()
        } else {
            limit.to_string()
        };
        fs::write_file(scope.fs, &scope.paths.unified(), "pids.max", value)
    }

    fn stat(&self, scope: &Scope<'_>, metrics: &mut Metrics) -> Result<()> {
        stat_current(scope, &scope.paths.unified(), metrics)
    }
}

/// PIDs on the legacy hierarchy. Any non-positive limit is `max`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LegacyPids;

impl Handler for LegacyPids {
    fn name(&self) -> &'static str {
        "pids"
    }

    fn create(&self, scope: &Scope<'_>) -> Result<()> {
        create_legacy_dir(scope, Subsystem::Pids).map(|_| ())
    }

    fn apply(&self, scope: &Scope<'_>, resources: &Resources) -> Result<()> {
        let Some(limit) = resources.pids.limit else {
            return Ok(());
        };
        let value = if limit > 0 {
            limit.to_string()
        } else {
            "max".to_string()
        };
        fs::write_file(scope.fs, &scope.paths.legacy(Subsystem::Pids), "pids.max", value)
    }

    fn destroy(&self, scope: &Scope<'_>) -> Result<()> {
        remove_legacy_dir(scope, Subsystem::Pids)
    }

    fn stat(&self, scope: &Scope<'_>, metrics: &mut Metrics) -> Result<()> {
        stat_current(scope, &scope.paths.legacy(Subsystem::Pids), metrics)
    }
}
