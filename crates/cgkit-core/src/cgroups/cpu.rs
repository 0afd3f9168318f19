//! CPU controller

use std::path::Path;

use tracing::debug;

use super::error::{CgroupError, Result};
use super::fs::{self, CgroupFs};
use super::hierarchy::{create_legacy_dir, remove_legacy_dir, Handler, Scope};
use super::path::Subsystem;
use super::types::{CpuStats, Metrics, Resources};

/// Kernel default CFS period (microseconds)
pub const DEFAULT_CFS_PERIOD_US: u64 = 100_000;

const NANOS_PER_MICRO: u64 = 1_000;

/// `cpu.max` content: quota (or `max`) and period.
pub fn cpu_max_value(quota: i64, period: u64) -> String {
    let quota = if quota > 0 {
        quota.to_string()
    } else {
        "max".to_string()
    };
    let period = if period == 0 { DEFAULT_CFS_PERIOD_US } else { period };
    format!("{} {}", quota, period)
}

/// CPU on the unified hierarchy: `cpu.weight`, `cpu.max`.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnifiedCpu;

impl Handler for UnifiedCpu {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn apply(&self, scope: &Scope<'_>, resources: &Resources) -> Result<()> {
        let cpu = &resources.cpu;
        let dir = scope.paths.unified();

        if cpu.weight != 0 {
            fs::write_file(scope.fs, &dir, "cpu.weight", cpu.weight)?;
        }

        if cpu.quota != 0 || cpu.period != 0 {
            fs::write_file(scope.fs, &dir, "cpu.max", cpu_max_value(cpu.quota, cpu.period))?;
        }

        Ok(())
    }

    fn stat(&self, scope: &Scope<'_>, metrics: &mut Metrics) -> Result<()> {
        let dir = scope.paths.unified();
        let path = dir.join("cpu.stat");
        let values = fs::read_map_file(scope.fs, &dir, "cpu.stat")?;

        let mut stats = CpuStats::default();
        if let Some(token) = values.get("usage_usec").and_then(|v| v.first()) {
            stats.total_usage = fs::parse_u64(&path, token)?.saturating_mul(NANOS_PER_MICRO);
        }
        if let Some(token) = values.get("system_usec").and_then(|v| v.first()) {
            stats.usage_in_kernelmode =
                fs::parse_u64(&path, token)?.saturating_mul(NANOS_PER_MICRO);
        }

        metrics.cpu = stats;
        Ok(())
    }
}

/// CPU on the legacy hierarchy: shares, CFS and RT bandwidth.
#[derive(Debug, Clone, Copy, Default)]
pub struct LegacyCpu;

impl LegacyCpu {
    /// Write `cpu.shares` and refuse a value the kernel clamped.
    fn write_shares(fs: &dyn CgroupFs, dir: &Path, shares: u64) -> Result<()> {
        fs::write_file(fs, dir, "cpu.shares", shares)?;

        let stored = fs::read_u64(fs, dir, "cpu.shares")?;
        let bound = if shares > stored {
            "maximum"
        } else if shares < stored {
            "minimum"
        } else {
            return Ok(());
        };

        Err(CgroupError::OutOfBounds {
            knob: "cpu-shares",
            requested: shares,
            bound,
            allowed: stored,
        })
    }

    /// Write CFS period and quota.
    ///
    /// The kernel checks a new period against the quota in effect, so a
    /// period rejected with EINVAL is retried after the quota is written.
    fn write_bandwidth(fs: &dyn CgroupFs, dir: &Path, period: u64, quota: i64) -> Result<()> {
        let mut deferred_period = None;

        if period != 0 {
            match fs::write_file(fs, dir, "cpu.cfs_period_us", period) {
                Ok(()) => {}
                Err(err) if err.is_invalid_argument() && quota != 0 => {
                    debug!(period, quota, "Period rejected, retrying after quota");
                    deferred_period = Some(period);
                }
                Err(err) => return Err(err),
            }
        }

        if quota != 0 {
            fs::write_file(fs, dir, "cpu.cfs_quota_us", quota)?;
            if let Some(period) = deferred_period {
                fs::write_file(fs, dir, "cpu.cfs_period_us", period)?;
            }
        }

        Ok(())
    }

    /// Read a cpuacct counter, treating an absent file as zero.
    fn read_acct(fs: &dyn CgroupFs, dir: &Path, name: &str) -> Result<u64> {
        match fs::read_u64(fs, dir, name) {
            Ok(value) => Ok(value),
            Err(err) if err.is_not_found() => Ok(0),
            Err(err) => Err(err),
        }
    }

    fn read_acct_list(fs: &dyn CgroupFs, dir: &Path, name: &str) -> Result<Vec<u64>> {
        let content = match fs::read_file(fs, dir, name) {
            Ok(content) => content,
            Err(err) if err.is_not_found() => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };

        let path = dir.join(name);
        content
            .split_whitespace()
            .map(|token| fs::parse_u64(&path, token))
            .collect()
    }
}

impl Handler for LegacyCpu {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn create(&self, scope: &Scope<'_>) -> Result<()> {
        create_legacy_dir(scope, Subsystem::Cpu).map(|_| ())
    }

    fn apply(&self, scope: &Scope<'_>, resources: &Resources) -> Result<()> {
        let cpu = &resources.cpu;
        let dir = scope.paths.legacy(Subsystem::Cpu);

        if cpu.shares != 0 {
            Self::write_shares(scope.fs, &dir, cpu.shares)?;
        }

        Self::write_bandwidth(scope.fs, &dir, cpu.period, cpu.quota)?;

        if cpu.rt_period != 0 {
            fs::write_file(scope.fs, &dir, "cpu.rt_period_us", cpu.rt_period)?;
        }
        if cpu.rt_runtime != 0 {
            fs::write_file(scope.fs, &dir, "cpu.rt_runtime_us", cpu.rt_runtime)?;
        }

        Ok(())
    }

    fn destroy(&self, scope: &Scope<'_>) -> Result<()> {
        remove_legacy_dir(scope, Subsystem::Cpu)
    }

    fn stat(&self, scope: &Scope<'_>, metrics: &mut Metrics) -> Result<()> {
        let dir = scope.paths.legacy(Subsystem::CpuAcct);

        metrics.cpu = CpuStats {
            total_usage: Self::read_acct(scope.fs, &dir, "cpuacct.usage")?,
            usage_in_kernelmode: Self::read_acct(scope.fs, &dir, "cpuacct.usage_sys")?,
            percpu_usage: Self::read_acct_list(scope.fs, &dir, "cpuacct.usage_percpu")?,
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgroups::path::CgroupPaths;
    use crate::cgroups::testing::FakeFs;
    use crate::cgroups::types::CpuResources;

    fn resources(cpu: CpuResources) -> Resources {
        Resources {
            cpu,
            ..Default::default()
        }
    }

    #[test]
    fn test_cpu_max_value() {
        assert_eq!(cpu_max_value(50_000, 0), "50000 100000");
        assert_eq!(cpu_max_value(-1, 200_000), "max 200000");
        assert_eq!(cpu_max_value(0, 250_000), "max 250000");
    }

    #[test]
    fn test_unified_apply() {
        let fs = FakeFs::new();
        fs.add_dir("/cg/box");
        let paths = CgroupPaths::new("/cg", "box").unwrap();

        let res = resources(CpuResources {
            weight: 200,
            quota: 30_000,
            ..Default::default()
        });
        UnifiedCpu.apply(&Scope::new(&fs, &paths), &res).unwrap();

        assert_eq!(
            fs.writes(),
            vec![
                ("cpu.weight".to_string(), "200".to_string()),
                ("cpu.max".to_string(), "30000 100000".to_string()),
            ]
        );
    }

    #[test]
    fn test_unified_apply_nothing_requested() {
        let fs = FakeFs::new();
        fs.add_dir("/cg/box");
        let paths = CgroupPaths::new("/cg", "box").unwrap();

        UnifiedCpu
            .apply(&Scope::new(&fs, &paths), &Resources::default())
            .unwrap();
        assert!(fs.writes().is_empty());
    }

    #[test]
    fn test_unified_stat_converts_to_nanoseconds() {
        let fs = FakeFs::new();
        fs.set_file(
            "/cg/box/cpu.stat",
            "usage_usec 1500\nuser_usec 1000\nsystem_usec 500\nnr_periods 0\n",
        );
        let paths = CgroupPaths::new("/cg", "box").unwrap();

        let mut metrics = Metrics::default();
        UnifiedCpu.stat(&Scope::new(&fs, &paths), &mut metrics).unwrap();

        assert_eq!(metrics.cpu.total_usage, 1_500_000);
        assert_eq!(metrics.cpu.usage_in_kernelmode, 500_000);
        assert!(metrics.cpu.percpu_usage.is_empty());
    }

    #[test]
    fn test_legacy_shares_round_trip() {
        let fs = FakeFs::new();
        fs.add_dir("/cg/cpu/box");
        fs.clamp_writes("/cg/cpu/box/cpu.shares", 2, 262_144);
        let paths = CgroupPaths::new("/cg", "box").unwrap();

        let res = resources(CpuResources {
            shares: 512,
            ..Default::default()
        });
        LegacyCpu.apply(&Scope::new(&fs, &paths), &res).unwrap();
        assert_eq!(fs.file("/cg/cpu/box/cpu.shares").as_deref(), Some("512"));
    }

    #[test]
    fn test_legacy_shares_clamped_is_error() {
        let fs = FakeFs::new();
        fs.add_dir("/cg/cpu/box");
        fs.clamp_writes("/cg/cpu/box/cpu.shares", 2, 262_144);
        let paths = CgroupPaths::new("/cg", "box").unwrap();
        let scope = Scope::new(&fs, &paths);

        let res = resources(CpuResources {
            shares: 1_000_000,
            ..Default::default()
        });
        let err = LegacyCpu.apply(&scope, &res).unwrap_err();
        match err {
            CgroupError::OutOfBounds {
                bound, allowed, requested, ..
            } => {
                assert_eq!(bound, "maximum");
                assert_eq!(allowed, 262_144);
                assert_eq!(requested, 1_000_000);
            }
            other => panic!("unexpected error: {other}"),
        }

        let res = resources(CpuResources {
            shares: 1,
            ..Default::default()
        });
        let err = LegacyCpu.apply(&scope, &res).unwrap_err();
        assert!(err.to_string().contains("minimum allowed cpu-shares is 2"));
    }

    #[test]
    fn test_legacy_period_retried_after_quota() {
        let fs = FakeFs::new();
        fs.add_dir("/cg/cpu/box");
        fs.fail_times("/cg/cpu/box/cpu.cfs_period_us", libc::EINVAL, 1);
        let paths = CgroupPaths::new("/cg", "box").unwrap();

        let res = resources(CpuResources {
            period: 50_000,
            quota: 25_000,
            ..Default::default()
        });
        LegacyCpu.apply(&Scope::new(&fs, &paths), &res).unwrap();

        assert_eq!(
            fs.writes(),
            vec![
                ("cpu.cfs_quota_us".to_string(), "25000".to_string()),
                ("cpu.cfs_period_us".to_string(), "50000".to_string()),
            ]
        );
    }

    #[test]
    fn test_legacy_period_einval_without_quota_fails() {
        let fs = FakeFs::new();
        fs.add_dir("/cg/cpu/box");
        fs.fail_times("/cg/cpu/box/cpu.cfs_period_us", libc::EINVAL, 1);
        let paths = CgroupPaths::new("/cg", "box").unwrap();

        let res = resources(CpuResources {
            period: 50_000,
            ..Default::default()
        });
        let err = LegacyCpu.apply(&Scope::new(&fs, &paths), &res).unwrap_err();
        assert!(err.is_invalid_argument());
    }

    #[test]
    fn test_legacy_apply_order() {
        let fs = FakeFs::new();
        fs.add_dir("/cg/cpu/box");
        let paths = CgroupPaths::new("/cg", "box").unwrap();

        let res = resources(CpuResources {
            period: 100_000,
            quota: -1,
            rt_period: 1_000_000,
            rt_runtime: 950_000,
            ..Default::default()
        });
        LegacyCpu.apply(&Scope::new(&fs, &paths), &res).unwrap();

        let names: Vec<_> = fs.writes().into_iter().map(|(name, _)| name).collect();
        assert_eq!(
            names,
            vec![
                "cpu.cfs_period_us",
                "cpu.cfs_quota_us",
                "cpu.rt_period_us",
                "cpu.rt_runtime_us",
            ]
        );
        assert_eq!(fs.file("/cg/cpu/box/cpu.cfs_quota_us").as_deref(), Some("-1"));
    }

    #[test]
    fn test_legacy_stat_absent_files_are_zero() {
        let fs = FakeFs::new();
        fs.set_file("/cg/cpuacct/box/cpuacct.usage", "123456\n");
        fs.set_file("/cg/cpuacct/box/cpuacct.usage_percpu", "100 200 300 \n");
        let paths = CgroupPaths::new("/cg", "box").unwrap();

        let mut metrics = Metrics::default();
        LegacyCpu.stat(&Scope::new(&fs, &paths), &mut metrics).unwrap();

        assert_eq!(metrics.cpu.total_usage, 123_456);
        assert_eq!(metrics.cpu.usage_in_kernelmode, 0);
        assert_eq!(metrics.cpu.percpu_usage, vec![100, 200, 300]);
    }
}
