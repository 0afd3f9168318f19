//! Pseudo-file primitives for cgroupfs
//!
//! Every read and write goes through a [`CgroupFs`], so the controller
//! handlers can be driven against the real kernel filesystem ([`HostFs`]) or
//! against an in-memory fake in tests.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use tracing::{debug, trace};

use super::error::{CgroupError, Result};

/// How often `rmdir` is retried while the kernel reports the cgroup busy.
const RMDIR_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Number of retries, five seconds in total.
const RMDIR_MAX_RETRIES: u32 = 500;

/// Filesystem operations used against a cgroup hierarchy.
pub trait CgroupFs: Send + Sync {
    /// Read a whole pseudo-file.
    fn read(&self, path: &Path) -> Result<String>;

    /// Write `contents` to a pseudo-file in a single `write(2)`.
    fn write(&self, path: &Path, contents: &str) -> Result<()>;

    fn exists(&self, path: &Path) -> bool;

    /// Create one directory; the parent must exist.
    fn create_dir(&self, path: &Path) -> Result<()>;

    /// Remove one (cgroup) directory.
    fn remove_dir(&self, path: &Path) -> Result<()>;

    /// Immediate child directories of `path`.
    fn subdirs(&self, path: &Path) -> Result<Vec<PathBuf>>;
}

/// The host's cgroup filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostFs;

impl CgroupFs for HostFs {
    fn read(&self, path: &Path) -> Result<String> {
        fs::read_to_string(path).map_err(|e| CgroupError::from_io(path, e))
    }

    /// Pseudo-files are never created: kernfs refuses `O_CREAT` on a
    /// missing knob with `EACCES`, which would hide its absence.
    fn write(&self, path: &Path, contents: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(path)
            .map_err(|e| CgroupError::from_io(path, e))?;
        file.write_all(contents.as_bytes())
            .map_err(|e| CgroupError::from_io(path, e))
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn create_dir(&self, path: &Path) -> Result<()> {
        fs::create_dir(path).map_err(|e| CgroupError::from_io(path, e))
    }

    fn remove_dir(&self, path: &Path) -> Result<()> {
        fs::remove_dir(path).map_err(|e| CgroupError::from_io(path, e))
    }

    fn subdirs(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let entries = fs::read_dir(path).map_err(|e| CgroupError::from_io(path, e))?;

        let mut dirs = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| CgroupError::from_io(path, e))?;
            let file_type = entry
                .file_type()
                .map_err(|e| CgroupError::from_io(entry.path(), e))?;
            if file_type.is_dir() {
                dirs.push(entry.path());
            }
        }
        dirs.sort();
        Ok(dirs)
    }
}

/// Write `value` to `dir/name`.
pub fn write_file(fs: &dyn CgroupFs, dir: &Path, name: &str, value: impl Display) -> Result<()> {
    let path = dir.join(name);
    let value = value.to_string();
    debug!(path = %path.display(), value = %value, "Writing cgroup file");
    fs.write(&path, &value)
}

/// Read `dir/name` with surrounding whitespace removed.
pub fn read_file(fs: &dyn CgroupFs, dir: &Path, name: &str) -> Result<String> {
    let path = dir.join(name);
    let content = fs.read(&path)?;
    trace!(path = %path.display(), "Read cgroup file");
    Ok(content.trim().to_string())
}

/// Parse a kernel-published counter; `max` reads as `u64::MAX`.
pub fn parse_u64(path: &Path, value: &str) -> Result<u64> {
    let value = value.trim();
    if value == "max" {
        return Ok(u64::MAX);
    }
    value.parse::<u64>().map_err(|_| CgroupError::ParseError {
        path: path.to_path_buf(),
        value: value.to_string(),
    })
}

/// Read a single-value file as `u64`.
pub fn read_u64(fs: &dyn CgroupFs, dir: &Path, name: &str) -> Result<u64> {
    let value = read_file(fs, dir, name)?;
    parse_u64(&dir.join(name), &value)
}

/// Parse `key value1 value2 …` lines into key → ordered value tokens.
///
/// Lines with fewer than two fields are skipped.
///
/// ```text
/// 8:0 rbytes=1024 wbytes=2048 rios=3 wios=4
/// usage_usec 1234567
/// ```
pub fn parse_map(content: &str) -> BTreeMap<String, Vec<String>> {
    let mut values = BTreeMap::new();

    for line in content.lines() {
        let mut fields = line.split_whitespace();
        let Some(key) = fields.next() else {
            continue;
        };
        let tokens: Vec<String> = fields.map(str::to_string).collect();
        if tokens.is_empty() {
            continue;
        }
        values.insert(key.to_string(), tokens);
    }

    values
}

/// Read a flat-keyed or nested-keyed map file such as `cpu.stat` or `io.stat`.
pub fn read_map_file(
    fs: &dyn CgroupFs,
    dir: &Path,
    name: &str,
) -> Result<BTreeMap<String, Vec<String>>> {
    let path = dir.join(name);
    let content = fs.read(&path)?;
    Ok(parse_map(&content))
}

/// Read one key of a flat-keyed file as `u64`; a missing key reads as zero.
pub fn read_key_u64(fs: &dyn CgroupFs, dir: &Path, name: &str, key: &str) -> Result<u64> {
    let values = read_map_file(fs, dir, name)?;
    match values.get(key).and_then(|tokens| tokens.first()) {
        Some(token) => parse_u64(&dir.join(name), token),
        None => Ok(0),
    }
}

/// Create `path` and any missing parents, returning the directories that
/// were created (outermost first).
///
/// If a `mkdir` fails, directories created by this call are removed again.
pub fn create_dir_all(fs: &dyn CgroupFs, path: &Path) -> Result<Vec<PathBuf>> {
    let mut missing = Vec::new();
    let mut current = Some(path);
    while let Some(dir) = current {
        if dir.as_os_str().is_empty() || fs.exists(dir) {
            break;
        }
        missing.push(dir.to_path_buf());
        current = dir.parent();
    }
    missing.reverse();

    for (index, dir) in missing.iter().enumerate() {
        if let Err(err) = fs.create_dir(dir) {
            rollback_dirs(fs, &missing[..index]);
            return Err(err);
        }
        debug!(path = %dir.display(), "Created cgroup directory");
    }

    Ok(missing)
}

/// Remove directories created by a failed operation, innermost first.
pub fn rollback_dirs(fs: &dyn CgroupFs, created: &[PathBuf]) {
    for dir in created.iter().rev() {
        if let Err(err) = fs.remove_dir(dir) {
            debug!(path = %dir.display(), error = %err, "Failed to roll back cgroup directory");
        }
    }
}

/// Remove a cgroup directory and all child cgroups.
///
/// A missing directory counts as removed. `rmdir` is retried while the
/// kernel reports `EBUSY` (tasks still exiting).
pub fn remove_dir_recursive(fs: &dyn CgroupFs, path: &Path) -> Result<()> {
    let children = match fs.subdirs(path) {
        Ok(children) => children,
        Err(err) if err.is_not_found() => return Ok(()),
        Err(err) => return Err(err),
    };

    for child in &children {
        remove_dir_recursive(fs, child)?;
    }

    let mut retries = 0;
    loop {
        match fs.remove_dir(path) {
            Ok(()) => {
                debug!(path = %path.display(), "Removed cgroup directory");
                return Ok(());
            }
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) if err.is_busy() && retries < RMDIR_MAX_RETRIES => {
                retries += 1;
                thread::sleep(RMDIR_RETRY_INTERVAL);
            }
            Err(err) => return Err(err),
        }
    }
}
