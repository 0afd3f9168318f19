//! The cgroup orchestrator
//!
//! [`CgroupControl`] owns one cgroup identity and dispatches lifecycle calls
//! to the controller handlers of its hierarchy, or to systemd when creation
//! is delegated.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::error::{CgroupError, Result};
use super::fs::{CgroupFs, HostFs};
use super::hierarchy::{self, Hierarchy, Scope};
use super::path::{CgroupPaths, DEFAULT_CGROUP_ROOT};
use super::types::{CgroupVersion, Metrics, Resources};
use crate::config::{Config, ManagerKind};
use crate::systemd::SystemdDelegate;

/// Manages one cgroup.
///
/// Not safe for concurrent `apply`/`destroy` on the same cgroup: the memory
/// and CPU handlers read, compare and then write.
pub struct CgroupControl {
    paths: CgroupPaths,
    hierarchy: Box<dyn Hierarchy>,
    fs: Arc<dyn CgroupFs>,
    systemd: Option<SystemdDelegate>,
}

impl CgroupControl {
    /// Manage `path` under the default mount point.
    ///
    /// # Example
    /// ```no_run
    /// use cgkit_core::{CgroupControl, CgroupVersion, Resources};
    ///
    /// let control = CgroupControl::new("machine.slice/web", CgroupVersion::Unified).unwrap();
    /// let mut resources = Resources::default();
    /// resources.memory.limit = 512 * 1024 * 1024;
    /// control.create(&resources).unwrap();
    /// ```
    pub fn new(path: &str, version: CgroupVersion) -> Result<Self> {
        Self::with_root(DEFAULT_CGROUP_ROOT, path, version)
    }

    pub fn with_root(root: impl Into<PathBuf>, path: &str, version: CgroupVersion) -> Result<Self> {
        Ok(Self {
            paths: CgroupPaths::new(root, path)?,
            hierarchy: hierarchy::for_version(version),
            fs: Arc::new(HostFs),
            systemd: None,
        })
    }

    /// Detect the hierarchy version mounted at the default root.
    pub fn detect(path: &str) -> Result<Self> {
        let version = CgroupVersion::detect(std::path::Path::new(DEFAULT_CGROUP_ROOT))?;
        Self::new(path, version)
    }

    /// Build from configuration, connecting to systemd when it manages
    /// cgroups.
    pub fn from_config(config: &Config, path: &str) -> Result<Self> {
        let version = config.cgroup_version()?;
        let control = Self::with_root(config.cgroup.root.clone(), path, version)?;

        match config.cgroup.manager {
            ManagerKind::Cgroupfs => Ok(control),
            ManagerKind::Systemd => {
                let delegate = SystemdDelegate::connect(config.systemd.bus)?;
                Ok(control.with_systemd(delegate))
            }
        }
    }

    /// Use a different filesystem backend.
    pub fn with_fs(mut self, fs: Arc<dyn CgroupFs>) -> Self {
        self.fs = fs;
        self
    }

    /// Delegate creation and removal to systemd.
    pub fn with_systemd(mut self, delegate: SystemdDelegate) -> Self {
        self.systemd = Some(delegate);
        self
    }

    pub fn paths(&self) -> &CgroupPaths {
        &self.paths
    }

    pub fn version(&self) -> CgroupVersion {
        self.hierarchy.version()
    }

    pub fn is_delegated(&self) -> bool {
        self.systemd.is_some()
    }

    fn scope(&self) -> Scope<'_> {
        Scope::new(self.fs.as_ref(), &self.paths)
    }

    /// Whether the cgroup directory exists.
    pub fn exists(&self) -> bool {
        self.fs.exists(&self.hierarchy.cgroup_dir(&self.paths))
    }

    /// Create the cgroup and apply `resources`.
    ///
    /// Under delegation this is one transient-unit request carrying the
    /// resources as unit properties. Otherwise the directories are created,
    /// every handler runs its create step (cpuset inheritance included) and
    /// then the resources are applied.
    pub fn create(&self, resources: &Resources) -> Result<()> {
        if let Some(systemd) = &self.systemd {
            return systemd.create(self.paths.relative(), resources);
        }

        let scope = self.scope();
        self.hierarchy.prepare(&scope)?;
        for handler in self.hierarchy.handlers() {
            handler
                .create(&scope)
                .map_err(|e| e.in_controller(handler.name()))?;
        }
        info!(cgroup = %self.paths, version = %self.version(), "Created cgroup");

        self.apply(resources)
    }

    /// Apply `resources`, stopping at the first failing controller.
    ///
    /// Writes made by earlier controllers are kept.
    pub fn apply(&self, resources: &Resources) -> Result<()> {
        let scope = self.scope();
        for handler in self.hierarchy.handlers() {
            handler
                .apply(&scope, resources)
                .map_err(|e| e.in_controller(handler.name()))?;
        }
        debug!(cgroup = %self.paths, "Applied resources");
        Ok(())
    }

    /// Collect statistics from every controller into `metrics`.
    ///
    /// Controllers whose files are absent leave their fields untouched. The
    /// first hard error is returned after all controllers ran, so fields
    /// filled by the others stay valid.
    pub fn stat_into(&self, metrics: &mut Metrics) -> Result<()> {
        let scope = self.scope();
        let mut first_error = None;

        for handler in self.hierarchy.handlers() {
            match handler.stat(&scope, metrics) {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {
                    debug!(controller = handler.name(), error = %err, "No statistics available");
                }
                Err(err) => {
                    warn!(controller = handler.name(), error = %err, "Failed to read statistics");
                    if first_error.is_none() {
                        first_error = Some(err.in_controller(handler.name()));
                    }
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn stat(&self) -> Result<Metrics> {
        let mut metrics = Metrics::default();
        self.stat_into(&mut metrics)?;
        Ok(metrics)
    }

    /// Remove the cgroup. Removing a cgroup that is already gone succeeds.
    pub fn destroy(&self) -> Result<()> {
        if let Some(systemd) = &self.systemd {
            return systemd.destroy(self.paths.relative());
        }

        let scope = self.scope();
        let mut first_error: Option<CgroupError> = None;

        for handler in self.hierarchy.handlers() {
            match handler.destroy(&scope) {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => {
                    warn!(controller = handler.name(), error = %err, "Failed to remove cgroup");
                    if first_error.is_none() {
                        first_error = Some(err.in_controller(handler.name()));
                    }
                }
            }
        }

        match self.hierarchy.remove(&scope) {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => {
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => {
                info!(cgroup = %self.paths, "Destroyed cgroup");
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for CgroupControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CgroupControl")
            .field("paths", &self.paths)
            .field("version", &self.version())
            .field("delegated", &self.is_delegated())
            .finish()
    }
}
