//! cgkit Core Library
//!
//! Resource control for Linux control groups on both the legacy (v1) and
//! unified (v2) hierarchies, with optional delegation of cgroup creation
//! to systemd over D-Bus.

pub mod cgroups;
pub mod config;
pub mod systemd;

pub use cgroups::{
    CgroupControl, CgroupError, CgroupPaths, CgroupVersion, Limit, Metrics, Resources, Result,
};
pub use config::{Config, ConfigError};
pub use systemd::{Bus, SystemdDelegate, UnitManager};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
