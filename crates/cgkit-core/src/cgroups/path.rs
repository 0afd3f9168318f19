//! Path resolution for legacy and unified hierarchies

use std::fmt;
use std::path::{Component, Path, PathBuf};

use super::error::{CgroupError, Result};
use super::types::CgroupVersion;

/// Default cgroupfs mount point
pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// A legacy-hierarchy controller mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subsystem {
    Cpu,
    CpuAcct,
    Cpuset,
    Memory,
    Blkio,
    Pids,
}

impl Subsystem {
    pub fn name(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::CpuAcct => "cpuacct",
            Self::Cpuset => "cpuset",
            Self::Memory => "memory",
            Self::Blkio => "blkio",
            Self::Pids => "pids",
        }
    }
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where one cgroup lives on disk.
///
/// `relative` is the hierarchy-relative identity, e.g. `machine.slice/web`.
/// On the unified hierarchy it resolves to `root/relative`, on the legacy
/// hierarchy to `root/<controller>/relative`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgroupPaths {
    root: PathBuf,
    relative: PathBuf,
}

impl CgroupPaths {
    /// Build from a mount root and a hierarchy-relative path.
    ///
    /// A leading `/` is accepted; `..` components are rejected.
    pub fn new(root: impl Into<PathBuf>, path: &str) -> Result<Self> {
        let mut relative = PathBuf::new();
        for component in Path::new(path).components() {
            match component {
                Component::Normal(part) => relative.push(part),
                Component::RootDir | Component::CurDir => {}
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(CgroupError::InvalidPath(path.to_string()));
                }
            }
        }

        Ok(Self {
            root: root.into(),
            relative,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn relative(&self) -> &Path {
        &self.relative
    }

    /// True when no cgroup has been named (the hierarchy root itself).
    pub fn is_empty(&self) -> bool {
        self.relative.as_os_str().is_empty()
    }

    /// Path on the unified hierarchy.
    pub fn unified(&self) -> PathBuf {
        if self.is_empty() {
            self.root.clone()
        } else {
            self.root.join(&self.relative)
        }
    }

    /// Mount point of a legacy controller.
    pub fn mount(&self, subsystem: Subsystem) -> PathBuf {
        self.root.join(subsystem.name())
    }

    /// Path under a legacy controller's hierarchy.
    pub fn legacy(&self, subsystem: Subsystem) -> PathBuf {
        let mount = self.mount(subsystem);
        if self.is_empty() {
            mount
        } else {
            mount.join(&self.relative)
        }
    }

    pub fn resolve(&self, version: CgroupVersion, subsystem: Subsystem) -> PathBuf {
        match version {
            CgroupVersion::Unified => self.unified(),
            CgroupVersion::Legacy => self.legacy(subsystem),
        }
    }
}

impl fmt::Display for CgroupPaths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.relative.display())
    }
}
