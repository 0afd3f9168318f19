//! In-memory cgroup filesystem for unit tests
//!
//! Records every operation in order, so tests can assert on write
//! sequencing, and can inject errnos and kernel-side clamping.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::error::{CgroupError, Result};
use super::fs::CgroupFs;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Read(PathBuf),
    Write(PathBuf, String),
    CreateDir(PathBuf),
    RemoveDir(PathBuf),
}

#[derive(Debug, Default)]
struct State {
    files: BTreeMap<PathBuf, String>,
    dirs: BTreeSet<PathBuf>,
    ops: Vec<Op>,
    failures: HashMap<PathBuf, (i32, usize)>,
    clamps: HashMap<PathBuf, (u64, u64)>,
    templates: Vec<(String, String)>,
}

#[derive(Debug, Default)]
pub struct FakeFs {
    state: Mutex<State>,
}

impl FakeFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a directory and all of its ancestors.
    pub fn add_dir(&self, path: impl AsRef<Path>) {
        let mut state = self.state.lock().unwrap();
        for dir in path.as_ref().ancestors() {
            if !dir.as_os_str().is_empty() {
                state.dirs.insert(dir.to_path_buf());
            }
        }
    }

    /// Seed a file, creating its parent directories.
    pub fn set_file(&self, path: impl AsRef<Path>, content: &str) {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            self.add_dir(parent);
        }
        self.state
            .lock()
            .unwrap()
            .files
            .insert(path.to_path_buf(), content.to_string());
    }

    pub fn file(&self, path: impl AsRef<Path>) -> Option<String> {
        self.state.lock().unwrap().files.get(path.as_ref()).cloned()
    }

    /// Fail the next `times` operations on `path` with `errno`.
    pub fn fail_times(&self, path: impl AsRef<Path>, errno: i32, times: usize) {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert(path.as_ref().to_path_buf(), (errno, times));
    }

    /// Store writes to `path` clamped into `min..=max`, like `cpu.shares`.
    pub fn clamp_writes(&self, path: impl AsRef<Path>, min: u64, max: u64) {
        self.state
            .lock()
            .unwrap()
            .clamps
            .insert(path.as_ref().to_path_buf(), (min, max));
    }

    /// Every directory created afterwards starts with this pseudo-file.
    pub fn populate_on_create(&self, name: &str, content: &str) {
        self.state
            .lock()
            .unwrap()
            .templates
            .push((name.to_string(), content.to_string()));
    }

    pub fn ops(&self) -> Vec<Op> {
        self.state.lock().unwrap().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.state.lock().unwrap().ops.clear();
    }

    /// Successful writes in order, as `(file name, value)`.
    pub fn writes(&self) -> Vec<(String, String)> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                Op::Write(path, value) => path
                    .file_name()
                    .map(|name| (name.to_string_lossy().into_owned(), value)),
                _ => None,
            })
            .collect()
    }

    /// Successful writes to one path, in order.
    pub fn writes_to(&self, path: impl AsRef<Path>) -> Vec<String> {
        let path = path.as_ref();
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                Op::Write(p, value) if p == path => Some(value),
                _ => None,
            })
            .collect()
    }

    fn injected(state: &mut State, path: &Path) -> Result<()> {
        if let Some((errno, remaining)) = state.failures.get_mut(path) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(CgroupError::from_io(path, io::Error::from_raw_os_error(*errno)));
            }
        }
        Ok(())
    }

    fn not_found(path: &Path) -> CgroupError {
        CgroupError::NotFound(path.to_path_buf())
    }
}

impl CgroupFs for FakeFs {
    fn read(&self, path: &Path) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        Self::injected(&mut state, path)?;
        state.ops.push(Op::Read(path.to_path_buf()));
        state
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| Self::not_found(path))
    }

    fn write(&self, path: &Path, contents: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::injected(&mut state, path)?;

        let parent_exists = path.parent().map_or(false, |p| state.dirs.contains(p));
        if !parent_exists {
            return Err(Self::not_found(path));
        }

        let stored = match state.clamps.get(path) {
            Some(&(min, max)) => match contents.trim().parse::<u64>() {
                Ok(value) => value.clamp(min, max).to_string(),
                Err(_) => {
                    return Err(CgroupError::from_io(
                        path,
                        io::Error::from_raw_os_error(libc::EINVAL),
                    ))
                }
            },
            None => contents.to_string(),
        };

        state.ops.push(Op::Write(path.to_path_buf(), contents.to_string()));
        state.files.insert(path.to_path_buf(), stored);
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        let state = self.state.lock().unwrap();
        state.dirs.contains(path) || state.files.contains_key(path)
    }

    fn create_dir(&self, path: &Path) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::injected(&mut state, path)?;

        if state.dirs.contains(path) {
            return Err(CgroupError::from_io(
                path,
                io::Error::from_raw_os_error(libc::EEXIST),
            ));
        }
        let parent_exists = path.parent().map_or(false, |p| state.dirs.contains(p));
        if !parent_exists {
            return Err(Self::not_found(path));
        }

        state.ops.push(Op::CreateDir(path.to_path_buf()));
        state.dirs.insert(path.to_path_buf());
        let seeded: Vec<_> = state
            .templates
            .iter()
            .map(|(name, content)| (path.join(name), content.clone()))
            .collect();
        state.files.extend(seeded);
        Ok(())
    }

    fn remove_dir(&self, path: &Path) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::injected(&mut state, path)?;

        if !state.dirs.contains(path) {
            return Err(Self::not_found(path));
        }
        if state.dirs.iter().any(|d| d.parent() == Some(path)) {
            return Err(CgroupError::from_io(
                path,
                io::Error::from_raw_os_error(libc::ENOTEMPTY),
            ));
        }

        state.ops.push(Op::RemoveDir(path.to_path_buf()));
        state.dirs.remove(path);
        // Pseudo-files vanish with their cgroup.
        state.files.retain(|file, _| file.parent() != Some(path));
        Ok(())
    }

    fn subdirs(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let state = self.state.lock().unwrap();
        if !state.dirs.contains(path) {
            return Err(Self::not_found(path));
        }
        Ok(state
            .dirs
            .iter()
            .filter(|d| d.parent() == Some(path))
            .cloned()
            .collect())
    }
}
