//! TOML configuration for cgkit.
//!
//! Selects the cgroup root, hierarchy version and manager, the systemd bus,
//! and where logs go.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::cgroups::{CgroupVersion, Result as CgroupResult, DEFAULT_CGROUP_ROOT};
use crate::systemd::Bus;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write config {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration for cgkit
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Cgroup filesystem settings
    pub cgroup: CgroupSettings,

    /// systemd delegation settings
    pub systemd: SystemdSettings,

    /// Logging configuration
    pub logging: LogConfig,
}

/// Which hierarchy to drive
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionSetting {
    /// Detect from the filesystem mounted at the root
    #[default]
    Auto,
    V1,
    V2,
}

/// Who creates and removes cgroups
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManagerKind {
    /// Direct cgroupfs manipulation
    #[default]
    Cgroupfs,
    /// Transient units through systemd
    Systemd,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CgroupSettings {
    /// cgroupfs mount point (default: /sys/fs/cgroup)
    pub root: PathBuf,

    /// Hierarchy version (default: auto)
    pub version: VersionSetting,

    /// Lifecycle manager (default: cgroupfs)
    pub manager: ManagerKind,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemdSettings {
    /// Message bus to reach systemd on (default: system)
    pub bus: Bus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default level when RUST_LOG is unset (default: info)
    pub level: String,

    /// Directory for daily-rotated log files; console only when unset
    pub log_dir: Option<PathBuf>,

    /// Log file name prefix (default: cgkit.log)
    pub file_name: String,
}

impl Default for CgroupSettings {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_CGROUP_ROOT),
            version: VersionSetting::Auto,
            manager: ManagerKind::Cgroupfs,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_dir: None,
            file_name: "cgkit.log".to_string(),
        }
    }
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl Config {
    /// Load configuration from TOML file
    ///
    /// # Example
    /// ```no_run
    /// use cgkit_core::config::Config;
    ///
    /// let config = Config::load_from_file("/etc/cgkit/config.toml").unwrap();
    /// println!("cgroup root: {}", config.cgroup.root.display());
    /// ```
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        std::fs::write(path, self.to_toml()?).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.cgroup.root.is_absolute() {
            return Err(ConfigError::Invalid(format!(
                "cgroup root must be an absolute path, got: {}",
                self.cgroup.root.display()
            )));
        }

        if !LOG_LEVELS.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(ConfigError::Invalid(format!(
                "log level must be one of {:?}, got: {}",
                LOG_LEVELS, self.logging.level
            )));
        }

        if self.logging.file_name.is_empty() {
            return Err(ConfigError::Invalid("log file name must not be empty".to_string()));
        }

        Ok(())
    }

    /// Hierarchy version, detecting it when set to auto.
    pub fn cgroup_version(&self) -> CgroupResult<CgroupVersion> {
        match self.cgroup.version {
            VersionSetting::V1 => Ok(CgroupVersion::Legacy),
            VersionSetting::V2 => Ok(CgroupVersion::Unified),
            VersionSetting::Auto => CgroupVersion::detect(&self.cgroup.root),
        }
    }

    /// Full path of the log file, when file logging is enabled.
    pub fn log_file_path(&self) -> Option<PathBuf> {
        self.logging
            .log_dir
            .as_ref()
            .map(|dir| dir.join(&self.logging.file_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.cgroup.root, PathBuf::from("/sys/fs/cgroup"));
        assert_eq!(config.cgroup.version, VersionSetting::Auto);
        assert_eq!(config.cgroup.manager, ManagerKind::Cgroupfs);
        assert_eq!(config.systemd.bus, Bus::System);
        assert_eq!(config.logging.level, "info");
        assert!(config.log_file_path().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_deserialization() {
        let toml_str = r#"
            [cgroup]
            root = "/tmp/cgroup"
            version = "v1"
            manager = "systemd"

            [systemd]
            bus = "session"

            [logging]
            level = "debug"
            log_dir = "/var/log/cgkit"
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();

        assert_eq!(config.cgroup.root, PathBuf::from("/tmp/cgroup"));
        assert_eq!(config.cgroup.version, VersionSetting::V1);
        assert_eq!(config.cgroup.manager, ManagerKind::Systemd);
        assert_eq!(config.systemd.bus, Bus::Session);
        assert_eq!(config.cgroup_version().unwrap(), CgroupVersion::Legacy);
        assert_eq!(
            config.log_file_path(),
            Some(PathBuf::from("/var/log/cgkit/cgkit.log"))
        );
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: Config = toml::from_str("[cgroup]\nversion = \"v2\"\n").unwrap();
        assert_eq!(config.cgroup.root, PathBuf::from("/sys/fs/cgroup"));
        assert_eq!(config.cgroup_version().unwrap(), CgroupVersion::Unified);
        assert_eq!(config.logging, LogConfig::default());
    }

    #[test]
    fn test_config_validation_invalid() {
        let mut config = Config::default();
        config.logging.level = "loud".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.cgroup.root = PathBuf::from("relative/cgroup");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.cgroup.version = VersionSetting::V2;
        config.save_to_file(&path).unwrap();

        let loaded = Config::load_from_file(&path).unwrap();
        assert_eq!(loaded, config);

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("[cgroup]"));
        assert!(content.contains("version = \"v2\""));
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load_from_file("/nonexistent/cgkit.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
