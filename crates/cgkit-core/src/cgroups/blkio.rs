//! Block I/O controller (`io` on the unified hierarchy)

use std::path::Path;

use tracing::debug;

use super::error::Result;
use super::fs::{self, CgroupFs};
use super::hierarchy::{create_legacy_dir, remove_legacy_dir, Handler, Scope};
use super::path::Subsystem;
use super::types::{BlkioStatEntry, Metrics, Resources, ThrottleDevice};

/// Map a legacy blkio weight (10-1000) onto the unified scale (1-10000).
pub fn io_weight_from_blkio(weight: u16) -> u64 {
    1 + (u64::from(weight).saturating_sub(10)) * 9999 / 990
}

/// Split `major:minor`.
fn parse_device(key: &str) -> Option<(u64, u64)> {
    let (major, minor) = key.split_once(':')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

/// Rename unified op names to the legacy vocabulary.
fn legacy_op_name(op: &str) -> &str {
    match op {
        "rbytes" => "read",
        "wbytes" => "write",
        other => other,
    }
}

/// Parse `io.stat`: `8:0 rbytes=1024 wbytes=2048 rios=3 wios=4 …`
///
/// Entries that are not `major:minor` keyed or `op=value` shaped are skipped.
pub fn parse_io_stat(content: &str) -> Vec<BlkioStatEntry> {
    let mut entries = Vec::new();

    for (device, tokens) in fs::parse_map(content) {
        let Some((major, minor)) = parse_device(&device) else {
            continue;
        };
        for token in &tokens {
            let Some((op, value)) = token.split_once('=') else {
                continue;
            };
            let Ok(value) = value.parse::<u64>() else {
                continue;
            };
            entries.push(BlkioStatEntry {
                major,
                minor,
                op: legacy_op_name(op).to_string(),
                value,
            });
        }
    }

    entries
}

/// Parse `blkio.throttle.io_service_bytes_recursive`:
///
/// ```text
/// 8:0 Read 4096
/// 8:0 Write 8192
/// Total 12288
/// ```
pub fn parse_service_bytes(content: &str) -> Vec<BlkioStatEntry> {
    content
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 3 {
                return None;
            }
            let (major, minor) = parse_device(fields[0])?;
            let value = fields[2].parse::<u64>().ok()?;
            Some(BlkioStatEntry {
                major,
                minor,
                op: fields[1].to_string(),
                value,
            })
        })
        .collect()
}

/// Block I/O on the unified hierarchy: `io.weight` or `io.bfq.weight`,
/// `io.max`.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnifiedBlkio;

impl UnifiedBlkio {
    fn write_throttle(fs: &dyn CgroupFs, dir: &Path, devices: &[ThrottleDevice], key: &str) -> Result<()> {
        for device in devices {
            let value = format!("{}:{} {}={}", device.major, device.minor, key, device.rate);
            fs::write_file(fs, dir, "io.max", value)?;
        }
        Ok(())
    }
}

impl Handler for UnifiedBlkio {
    fn name(&self) -> &'static str {
        "blkio"
    }

    fn apply(&self, scope: &Scope<'_>, resources: &Resources) -> Result<()> {
        let blkio = &resources.blkio;
        let dir = scope.paths.unified();

        // Only probe for bfq when a weight was requested.
        let bfq = if blkio.weight != 0 || !blkio.weight_device.is_empty() {
            match fs::read_file(scope.fs, &dir, "io.bfq.weight") {
                Ok(content) => Some(content),
                Err(err) if err.is_not_found() => None,
                Err(err) => return Err(err),
            }
        } else {
            None
        };

        if blkio.weight != 0 {
            if bfq.is_some() {
                fs::write_file(scope.fs, &dir, "io.bfq.weight", blkio.weight)?;
            } else {
                fs::write_file(scope.fs, &dir, "io.weight", io_weight_from_blkio(blkio.weight))?;
            }
        }

        // Per-device bfq weights exist only where the file lists a default.
        match &bfq {
            Some(content) if content.starts_with("default") => {
                for device in &blkio.weight_device {
                    let value = format!("{}:{} {}", device.major, device.minor, device.weight);
                    fs::write_file(scope.fs, &dir, "io.bfq.weight", value)?;
                }
            }
            _ if !blkio.weight_device.is_empty() => {
                debug!("Per-device weights unsupported by this kernel, ignoring");
            }
            _ => {}
        }

        Self::write_throttle(scope.fs, &dir, &blkio.throttle_read_bps_device, "rbps")?;
        Self::write_throttle(scope.fs, &dir, &blkio.throttle_write_bps_device, "wbps")?;
        Self::write_throttle(scope.fs, &dir, &blkio.throttle_read_iops_device, "riops")?;
        Self::write_throttle(scope.fs, &dir, &blkio.throttle_write_iops_device, "wiops")?;

        Ok(())
    }

    fn stat(&self, scope: &Scope<'_>, metrics: &mut Metrics) -> Result<()> {
        let content = scope.fs.read(&scope.paths.unified().join("io.stat"))?;
        metrics.blkio.io_service_bytes_recursive = parse_io_stat(&content);
        Ok(())
    }
}

/// Block I/O on the legacy hierarchy.
#[derive(Debug, Clone, Copy, Default)]
pub struct LegacyBlkio;

impl LegacyBlkio {
    /// Weight files: the bfq ones when that scheduler is active.
    fn weight_files(fs: &dyn CgroupFs, dir: &Path) -> (&'static str, &'static str) {
        if fs.exists(&dir.join("blkio.bfq.weight")) {
            ("blkio.bfq.weight", "blkio.bfq.weight_device")
        } else {
            ("blkio.weight", "blkio.weight_device")
        }
    }

    fn write_throttle(fs: &dyn CgroupFs, dir: &Path, file: &str, devices: &[ThrottleDevice]) -> Result<()> {
        for device in devices {
            let value = format!("{}:{} {}", device.major, device.minor, device.rate);
            fs::write_file(fs, dir, file, value)?;
        }
        Ok(())
    }
}

impl Handler for LegacyBlkio {
    fn name(&self) -> &'static str {
        "blkio"
    }

    fn create(&self, scope: &Scope<'_>) -> Result<()> {
        create_legacy_dir(scope, Subsystem::Blkio).map(|_| ())
    }

    fn apply(&self, scope: &Scope<'_>, resources: &Resources) -> Result<()> {
        let blkio = &resources.blkio;
        let dir = scope.paths.legacy(Subsystem::Blkio);
        let (weight_file, weight_device_file) = Self::weight_files(scope.fs, &dir);

        if blkio.weight != 0 {
            fs::write_file(scope.fs, &dir, weight_file, blkio.weight)?;
        }
        if blkio.leaf_weight != 0 {
            fs::write_file(scope.fs, &dir, "blkio.leaf_weight", blkio.leaf_weight)?;
        }

        for device in &blkio.weight_device {
            if device.weight != 0 {
                let value = format!("{}:{} {}", device.major, device.minor, device.weight);
                fs::write_file(scope.fs, &dir, weight_device_file, value)?;
            }
            if device.leaf_weight != 0 {
                let value = format!("{}:{} {}", device.major, device.minor, device.leaf_weight);
                fs::write_file(scope.fs, &dir, "blkio.leaf_weight_device", value)?;
            }
        }

        let throttles = [
            ("blkio.throttle.read_bps_device", &blkio.throttle_read_bps_device),
            ("blkio.throttle.write_bps_device", &blkio.throttle_write_bps_device),
            ("blkio.throttle.read_iops_device", &blkio.throttle_read_iops_device),
            ("blkio.throttle.write_iops_device", &blkio.throttle_write_iops_device),
        ];
        for (file, devices) in throttles {
            Self::write_throttle(scope.fs, &dir, file, devices)?;
        }

        Ok(())
    }

    fn destroy(&self, scope: &Scope<'_>) -> Result<()> {
        remove_legacy_dir(scope, Subsystem::Blkio)
    }

    fn stat(&self, scope: &Scope<'_>, metrics: &mut Metrics) -> Result<()> {
        let path = scope
            .paths
            .legacy(Subsystem::Blkio)
            .join("blkio.throttle.io_service_bytes_recursive");

        let content = match scope.fs.read(&path) {
            Ok(content) => content,
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err),
        };
        metrics.blkio.io_service_bytes_recursive = parse_service_bytes(&content);
        Ok(())
    }
}
