//! Error types for cgroup operations

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Cgroup operation errors
#[derive(Debug, Error)]
pub enum CgroupError {
    /// The kernel does not expose this pseudo-file or directory.
    #[error("Cgroup file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Permission denied: {}", .0.display())]
    PermissionDenied(PathBuf),

    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse {value:?} read from {}", path.display())]
    ParseError { path: PathBuf, value: String },

    /// The kernel stored a different value than the one written.
    #[error("the {bound} allowed {knob} is {allowed} (requested {requested})")]
    OutOfBounds {
        knob: &'static str,
        requested: u64,
        bound: &'static str,
        allowed: u64,
    },

    #[error("Invalid limit value: {0}")]
    InvalidLimit(String),

    #[error("Invalid cgroup path: {0}")]
    InvalidPath(String),

    #[error("{controller} controller: {source}")]
    Controller {
        controller: &'static str,
        #[source]
        source: Box<CgroupError>,
    },

    #[error("D-Bus error: {0}")]
    Dbus(#[from] zbus::Error),

    #[error("Systemd job for unit {unit} finished with result {result:?}")]
    JobFailed { unit: String, result: String },

    #[error("Systemd unit not loaded: {0}")]
    UnitNotFound(String),

    #[error("Systemd error: {0}")]
    Systemd(String),
}

impl CgroupError {
    /// Map an I/O failure on `path` into the matching variant.
    pub fn from_io(path: impl Into<PathBuf>, err: io::Error) -> Self {
        let path = path.into();
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound(path),
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(path),
            _ => Self::Io { path, source: err },
        }
    }

    /// Attribute this error to a controller.
    pub fn in_controller(self, controller: &'static str) -> Self {
        match self {
            err @ Self::Controller { .. } => err,
            err => Self::Controller {
                controller,
                source: Box::new(err),
            },
        }
    }

    /// True when the file or unit simply does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) | Self::UnitNotFound(_) => true,
            Self::Controller { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// True for EINVAL, which the kernel returns when a write fails validation.
    pub fn is_invalid_argument(&self) -> bool {
        self.raw_os_error() == Some(libc::EINVAL)
    }

    /// True for EBUSY, returned by rmdir while the cgroup still has tasks.
    pub fn is_busy(&self) -> bool {
        self.raw_os_error() == Some(libc::EBUSY)
    }

    fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::Io { source, .. } => source.raw_os_error(),
            Self::Controller { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, CgroupError>;
