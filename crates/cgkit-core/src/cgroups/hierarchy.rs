//! Hierarchy strategies
//!
//! A [`Hierarchy`] is chosen once per cgroup from its [`CgroupVersion`] and
//! carries the controller [`Handler`]s for that version, so no call site
//! has to branch on the version again.

use std::path::{Path, PathBuf};

use tracing::debug;

use super::blkio::{LegacyBlkio, UnifiedBlkio};
use super::cpu::{LegacyCpu, UnifiedCpu};
use super::cpuset::{LegacyCpuset, UnifiedCpuset};
use super::error::Result;
use super::fs::{self, CgroupFs};
use super::memory::{LegacyMemory, UnifiedMemory};
use super::path::{CgroupPaths, Subsystem};
use super::pids::{LegacyPids, UnifiedPids};
use super::types::{CgroupVersion, Metrics, Resources};

/// Everything a handler call needs: where the cgroup lives and how to
/// reach it.
#[derive(Clone, Copy)]
pub struct Scope<'a> {
    pub fs: &'a dyn CgroupFs,
    pub paths: &'a CgroupPaths,
}

impl<'a> Scope<'a> {
    pub fn new(fs: &'a dyn CgroupFs, paths: &'a CgroupPaths) -> Self {
        Self { fs, paths }
    }
}

/// One resource controller on one hierarchy version.
///
/// Handlers are stateless; everything arrives through the arguments.
pub trait Handler: Send + Sync {
    /// Controller name used in errors and logs.
    fn name(&self) -> &'static str;

    fn create(&self, _scope: &Scope<'_>) -> Result<()> {
        Ok(())
    }

    fn apply(&self, scope: &Scope<'_>, resources: &Resources) -> Result<()>;

    fn destroy(&self, _scope: &Scope<'_>) -> Result<()> {
        Ok(())
    }

    /// Fill this controller's part of `metrics`.
    fn stat(&self, _scope: &Scope<'_>, _metrics: &mut Metrics) -> Result<()> {
        Ok(())
    }
}

/// Version-specific directory management plus the handler set.
pub trait Hierarchy: Send + Sync {
    fn version(&self) -> CgroupVersion;

    /// Make the cgroup's directories ready before handler creation.
    fn prepare(&self, scope: &Scope<'_>) -> Result<()>;

    /// Remove what `prepare` created, after handler destruction.
    fn remove(&self, scope: &Scope<'_>) -> Result<()>;

    /// Handlers in dispatch order: CPU, CPUSet, Memory, BlkIO, PIDs.
    fn handlers(&self) -> &[Box<dyn Handler>];

    /// Directory that holds the cgroup (the CPU one on legacy).
    fn cgroup_dir(&self, paths: &CgroupPaths) -> PathBuf;
}

/// Select the strategy for `version`.
pub fn for_version(version: CgroupVersion) -> Box<dyn Hierarchy> {
    match version {
        CgroupVersion::Legacy => Box::new(LegacyHierarchy::new()),
        CgroupVersion::Unified => Box::new(UnifiedHierarchy::new()),
    }
}

/// Per-controller mounts (cgroup v1).
pub struct LegacyHierarchy {
    handlers: Vec<Box<dyn Handler>>,
}

impl LegacyHierarchy {
    pub fn new() -> Self {
        Self {
            handlers: vec![
                Box::new(LegacyCpu),
                Box::new(LegacyCpuset),
                Box::new(LegacyMemory),
                Box::new(LegacyBlkio),
                Box::new(LegacyPids),
            ],
        }
    }
}

impl Default for LegacyHierarchy {
    fn default() -> Self {
        Self::new()
    }
}

impl Hierarchy for LegacyHierarchy {
    fn version(&self) -> CgroupVersion {
        CgroupVersion::Legacy
    }

    fn prepare(&self, _scope: &Scope<'_>) -> Result<()> {
        Ok(())
    }

    fn remove(&self, _scope: &Scope<'_>) -> Result<()> {
        Ok(())
    }

    fn handlers(&self) -> &[Box<dyn Handler>] {
        &self.handlers
    }

    fn cgroup_dir(&self, paths: &CgroupPaths) -> PathBuf {
        paths.legacy(Subsystem::Cpu)
    }
}

/// Single unified hierarchy (cgroup v2).
pub struct UnifiedHierarchy {
    handlers: Vec<Box<dyn Handler>>,
}

impl UnifiedHierarchy {
    pub fn new() -> Self {
        Self {
            handlers: vec![
                Box::new(UnifiedCpu),
                Box::new(UnifiedCpuset),
                Box::new(UnifiedMemory),
                Box::new(UnifiedBlkio),
                Box::new(UnifiedPids),
            ],
        }
    }
}

impl Default for UnifiedHierarchy {
    fn default() -> Self {
        Self::new()
    }
}

impl Hierarchy for UnifiedHierarchy {
    fn version(&self) -> CgroupVersion {
        CgroupVersion::Unified
    }

    /// Create every missing directory along the path and enable all
    /// available controllers in the root and each intermediate cgroup.
    ///
    /// The leaf never gets `cgroup.subtree_control` written: a cgroup with
    /// controllers enabled for its children cannot hold processes.
    fn prepare(&self, scope: &Scope<'_>) -> Result<()> {
        let root = scope.paths.root();
        let enable = match fs::read_file(scope.fs, root, "cgroup.controllers") {
            Ok(content) => subtree_control_value(&content),
            Err(err) if err.is_not_found() => String::new(),
            Err(err) => return Err(err),
        };

        let mut created = Vec::new();
        let result = create_unified_path(scope, root, &enable, &mut created);
        if result.is_err() {
            fs::rollback_dirs(scope.fs, &created);
        }
        result
    }

    fn remove(&self, scope: &Scope<'_>) -> Result<()> {
        if scope.paths.is_empty() {
            debug!("Refusing to remove the hierarchy root");
            return Ok(());
        }
        fs::remove_dir_recursive(scope.fs, &scope.paths.unified())
    }

    fn handlers(&self) -> &[Box<dyn Handler>] {
        &self.handlers
    }

    fn cgroup_dir(&self, paths: &CgroupPaths) -> PathBuf {
        paths.unified()
    }
}

/// `cpu memory pids` → `+cpu +memory +pids`
fn subtree_control_value(controllers: &str) -> String {
    controllers
        .split_whitespace()
        .map(|c| format!("+{}", c))
        .collect::<Vec<_>>()
        .join(" ")
}

fn create_unified_path(
    scope: &Scope<'_>,
    root: &Path,
    enable: &str,
    created: &mut Vec<PathBuf>,
) -> Result<()> {
    let mut current = root.to_path_buf();

    for component in scope.paths.relative().components() {
        if !enable.is_empty() {
            fs::write_file(scope.fs, &current, "cgroup.subtree_control", enable)?;
        }

        current.push(component);
        if !scope.fs.exists(&current) {
            scope.fs.create_dir(&current)?;
            debug!(path = %current.display(), "Created cgroup directory");
            created.push(current.clone());
        }
    }

    Ok(())
}

/// Create a legacy controller directory.
///
/// Returns whether the directory was newly created. A controller whose
/// hierarchy is not mounted is skipped.
pub(crate) fn create_legacy_dir(scope: &Scope<'_>, subsystem: Subsystem) -> Result<bool> {
    let mount = scope.paths.mount(subsystem);
    if !scope.fs.exists(&mount) {
        debug!(controller = %subsystem, "Controller not mounted, skipping");
        return Ok(false);
    }

    let created = fs::create_dir_all(scope.fs, &scope.paths.legacy(subsystem))?;
    Ok(!created.is_empty())
}

/// Remove a legacy controller directory, tolerating its absence.
pub(crate) fn remove_legacy_dir(scope: &Scope<'_>, subsystem: Subsystem) -> Result<()> {
    if scope.paths.is_empty() {
        return Ok(());
    }
    fs::remove_dir_recursive(scope.fs, &scope.paths.legacy(subsystem))
}
