//! CPUSet controller
//!
//! A freshly created cpuset cgroup has empty `cpuset.cpus`/`cpuset.mems`
//! and cannot run tasks until they are filled, so creation copies the
//! nearest non-empty ancestor values into the new cgroup.

use std::path::Path;

use tracing::debug;

use super::error::{CgroupError, Result};
use super::fs::{self, CgroupFs};
use super::hierarchy::{create_legacy_dir, remove_legacy_dir, Handler, Scope};
use super::path::Subsystem;
use super::types::Resources;

const CPUSET_FILES: [&str; 2] = ["cpuset.cpus", "cpuset.mems"];

/// Fill `dir/file` from the closest ancestor that has a value.
///
/// The child's own file decides whether anything is missing. On the unified
/// hierarchy the parent's `.effective` variant is the source, since the
/// parent's own file may be empty while it still inherits CPUs. Returns
/// `None` when the file does not exist (cpuset not enabled).
fn copy_from_parent(
    fs: &dyn CgroupFs,
    dir: &Path,
    boundary: &Path,
    file: &str,
    unified: bool,
) -> Result<Option<String>> {
    let current = match fs::read_file(fs, dir, file) {
        Ok(value) => value,
        Err(err) if err.is_not_found() => return Ok(None),
        Err(err) => return Err(err),
    };
    if !current.is_empty() {
        return Ok(Some(current));
    }

    let parent = match dir.parent() {
        Some(parent) if dir != boundary && parent.starts_with(boundary) => parent,
        _ => return Err(no_parent(dir, file)),
    };

    let inherited = if unified {
        let effective = format!("{}.effective", file);
        match fs::read_file(fs, parent, &effective) {
            Ok(value) if !value.is_empty() => Some(value),
            Ok(_) => copy_from_parent(fs, parent, boundary, file, unified)?,
            Err(err) if err.is_not_found() => copy_from_parent(fs, parent, boundary, file, unified)?,
            Err(err) => return Err(err),
        }
    } else {
        copy_from_parent(fs, parent, boundary, file, unified)?
    };

    match &inherited {
        Some(value) => fs::write_file(fs, dir, file, value)?,
        // The unified root has no plain cpuset files to fall back on.
        None if unified && parent == boundary => return Err(no_parent(dir, file)),
        None => {}
    }
    Ok(inherited)
}

fn no_parent(dir: &Path, file: &str) -> CgroupError {
    CgroupError::InvalidPath(format!(
        "could not find parent to initialize {} for {}",
        file,
        dir.display()
    ))
}

fn copy_all_from_parent(fs: &dyn CgroupFs, dir: &Path, boundary: &Path, unified: bool) -> Result<()> {
    for file in CPUSET_FILES {
        if copy_from_parent(fs, dir, boundary, file, unified)?.is_none() {
            debug!(path = %dir.display(), file, "cpuset file absent, nothing to inherit");
        }
    }
    Ok(())
}

fn write_cpuset(fs: &dyn CgroupFs, dir: &Path, resources: &Resources) -> Result<()> {
    let cpuset = &resources.cpuset;
    if !cpuset.cpus.is_empty() {
        fs::write_file(fs, dir, "cpuset.cpus", &cpuset.cpus)?;
    }
    if !cpuset.mems.is_empty() {
        fs::write_file(fs, dir, "cpuset.mems", &cpuset.mems)?;
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UnifiedCpuset;

impl Handler for UnifiedCpuset {
    fn name(&self) -> &'static str {
        "cpuset"
    }

    fn create(&self, scope: &Scope<'_>) -> Result<()> {
        copy_all_from_parent(scope.fs, &scope.paths.unified(), scope.paths.root(), true)
    }

    fn apply(&self, scope: &Scope<'_>, resources: &Resources) -> Result<()> {
        write_cpuset(scope.fs, &scope.paths.unified(), resources)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LegacyCpuset;

impl Handler for LegacyCpuset {
    fn name(&self) -> &'static str {
        "cpuset"
    }

    fn create(&self, scope: &Scope<'_>) -> Result<()> {
        if !create_legacy_dir(scope, Subsystem::Cpuset)? {
            return Ok(());
        }
        copy_all_from_parent(
            scope.fs,
            &scope.paths.legacy(Subsystem::Cpuset),
            &scope.paths.mount(Subsystem::Cpuset),
            false,
        )
    }

    fn apply(&self, scope: &Scope<'_>, resources: &Resources) -> Result<()> {
        write_cpuset(scope.fs, &scope.paths.legacy(Subsystem::Cpuset), resources)
    }

    fn destroy(&self, scope: &Scope<'_>) -> Result<()> {
        remove_legacy_dir(scope, Subsystem::Cpuset)
    }
}
