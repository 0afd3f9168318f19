//! systemd delegation over D-Bus
//!
//! Instead of creating directories in cgroupfs, a cgroup can be created as a
//! transient unit by systemd's manager. Each lifecycle call is one
//! request/response pair: the method call returns a job object path, and
//! the job's outcome arrives later as a `JobRemoved` signal.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use zbus::blocking::Connection;
use zbus::zvariant::{ObjectPath, OwnedObjectPath, Value};

use crate::cgroups::{swap_allowance, CgroupError, Limit, Resources, Result};

/// Kernel default CFS period (microseconds)
const DEFAULT_CPU_PERIOD_US: u64 = 100_000;

/// systemd only accepts CPU quotas in 10ms steps.
const CPU_QUOTA_GRANULARITY_US: u64 = 10_000;

/// Upper bound on CPU and NUMA node ids accepted in a cpuset list.
const MAX_CPUSET_IDS: usize = 8192;

const NO_SUCH_UNIT: &str = "org.freedesktop.systemd1.NoSuchUnit";

#[zbus::proxy(
    interface = "org.freedesktop.systemd1.Manager",
    default_service = "org.freedesktop.systemd1",
    default_path = "/org/freedesktop/systemd1"
)]
trait Manager {
    fn start_transient_unit(
        &self,
        name: &str,
        mode: &str,
        properties: &[(&str, Value<'_>)],
        aux: &[(&str, &[(&str, Value<'_>)])],
    ) -> zbus::Result<OwnedObjectPath>;

    fn stop_unit(&self, name: &str, mode: &str) -> zbus::Result<OwnedObjectPath>;

    fn subscribe(&self) -> zbus::Result<()>;

    #[zbus(signal)]
    fn job_removed(&self, id: u32, job: ObjectPath<'_>, unit: &str, result: &str)
        -> zbus::Result<()>;
}

/// Which message bus to reach systemd on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bus {
    /// The system instance (root)
    #[default]
    System,
    /// The per-user instance (rootless)
    Session,
}

/// A typed unit property value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    Bool(bool),
    U64(u64),
    Str(String),
    Strings(Vec<String>),
    Bytes(Vec<u8>),
}

impl PropertyValue {
    fn to_value(&self) -> Value<'_> {
        match self {
            Self::Bool(value) => Value::from(*value),
            Self::U64(value) => Value::from(*value),
            Self::Str(value) => Value::from(value.as_str()),
            Self::Strings(values) => Value::from(values.clone()),
            Self::Bytes(bytes) => Value::from(bytes.clone()),
        }
    }
}

/// One `(name, value)` pair of a transient unit definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    pub name: &'static str,
    pub value: PropertyValue,
}

impl Property {
    pub fn new(name: &'static str, value: PropertyValue) -> Self {
        Self { name, value }
    }
}

/// A queued systemd job whose completion has not been observed yet.
pub struct PendingJob {
    unit: String,
    job: String,
    waiter: Box<dyn FnOnce() -> Result<String>>,
}

impl PendingJob {
    pub fn new(
        unit: impl Into<String>,
        job: impl Into<String>,
        waiter: impl FnOnce() -> Result<String> + 'static,
    ) -> Self {
        Self {
            unit: unit.into(),
            job: job.into(),
            waiter: Box::new(waiter),
        }
    }

    /// A job whose result is already known.
    pub fn finished(unit: impl Into<String>, job: impl Into<String>, result: &str) -> Self {
        let result = result.to_string();
        Self::new(unit, job, move || Ok(result))
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    /// D-Bus object path of the job.
    pub fn job(&self) -> &str {
        &self.job
    }

    /// Block until the job is removed; any result but `done` is an error.
    pub fn wait(self) -> Result<()> {
        let result = (self.waiter)()?;
        debug!(unit = %self.unit, job = %self.job, result = %result, "Systemd job finished");

        if result == "done" {
            Ok(())
        } else {
            Err(CgroupError::JobFailed {
                unit: self.unit,
                result,
            })
        }
    }
}

impl std::fmt::Debug for PendingJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingJob")
            .field("unit", &self.unit)
            .field("job", &self.job)
            .finish_non_exhaustive()
    }
}

/// The subset of systemd's manager interface used for delegation.
pub trait UnitManager: Send + Sync {
    fn start_transient_unit(
        &self,
        name: &str,
        mode: &str,
        properties: &[Property],
    ) -> Result<PendingJob>;

    fn stop_unit(&self, name: &str, mode: &str) -> Result<PendingJob>;
}

/// [`UnitManager`] backed by a blocking zbus connection.
pub struct DbusUnitManager {
    proxy: ManagerProxyBlocking<'static>,
}

impl DbusUnitManager {
    pub fn connect(bus: Bus) -> Result<Self> {
        let connection = match bus {
            Bus::System => Connection::system()?,
            Bus::Session => Connection::session()?,
        };
        Self::with_connection(&connection)
    }

    pub fn with_connection(connection: &Connection) -> Result<Self> {
        let proxy = ManagerProxyBlocking::new(connection)?;
        // JobRemoved is only broadcast to subscribed clients; without it
        // no job completion would ever be observed.
        proxy.subscribe()?;
        Ok(Self { proxy })
    }

    /// Wait for the `JobRemoved` signal of `job` on a stream opened before
    /// the job was queued.
    fn pending<I>(&self, unit: &str, job: OwnedObjectPath, signals: I) -> PendingJob
    where
        I: Iterator<Item = JobRemoved> + 'static,
    {
        let path = job.as_str().to_string();
        PendingJob::new(unit, path, move || {
            for signal in signals {
                let args = signal.args()?;
                if args.job().as_str() == job.as_str() {
                    return Ok(args.result().to_string());
                }
            }
            Err(CgroupError::Systemd(format!(
                "signal stream closed before job {} finished",
                job.as_str()
            )))
        })
    }
}

fn map_unit_error(unit: &str, err: zbus::Error) -> CgroupError {
    if let zbus::Error::MethodError(name, _, _) = &err {
        if name.as_str() == NO_SUCH_UNIT {
            return CgroupError::UnitNotFound(unit.to_string());
        }
    }
    CgroupError::Dbus(err)
}

impl UnitManager for DbusUnitManager {
    fn start_transient_unit(
        &self,
        name: &str,
        mode: &str,
        properties: &[Property],
    ) -> Result<PendingJob> {
        let signals = self.proxy.receive_job_removed()?;
        let values: Vec<(&str, Value<'_>)> = properties
            .iter()
            .map(|p| (p.name, p.value.to_value()))
            .collect();

        let job = self
            .proxy
            .start_transient_unit(name, mode, &values, &[])
            .map_err(|e| map_unit_error(name, e))?;
        Ok(self.pending(name, job, signals))
    }

    fn stop_unit(&self, name: &str, mode: &str) -> Result<PendingJob> {
        let signals = self.proxy.receive_job_removed()?;
        let job = self
            .proxy
            .stop_unit(name, mode)
            .map_err(|e| map_unit_error(name, e))?;
        Ok(self.pending(name, job, signals))
    }
}

/// Split a cgroup path into its parent slice and unit name.
///
/// `machine.slice/web.scope` → `("machine.slice", "web.scope")`
pub fn split_unit_path(path: &Path) -> Result<(String, String)> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| CgroupError::InvalidPath(path.display().to_string()))?;
    let slice = path
        .parent()
        .map(|p| p.to_string_lossy().trim_matches('/').to_string())
        .unwrap_or_default();
    Ok((slice, name))
}

/// Bitmask for `AllowedCPUs`/`AllowedMemoryNodes` from a kernel list such
/// as `0-3,6`. Byte `k` holds ids `8k..8k+7`, lowest id in the lowest bit.
pub fn range_to_bits(list: &str) -> Result<Vec<u8>> {
    let invalid = || CgroupError::InvalidLimit(format!("invalid cpu/node list: {:?}", list));
    let mut bits: Vec<u8> = Vec::new();

    for part in list.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (start, end) = match part.split_once('-') {
            Some((start, end)) => (start.trim(), end.trim()),
            None => (part, part),
        };
        let start: usize = start.parse().map_err(|_| invalid())?;
        let end: usize = end.parse().map_err(|_| invalid())?;
        if end < start {
            return Err(invalid());
        }
        if end >= MAX_CPUSET_IDS {
            return Err(CgroupError::InvalidLimit(format!(
                "cpu/node id {} exceeds the supported maximum of {}",
                end,
                MAX_CPUSET_IDS - 1
            )));
        }

        for id in start..=end {
            let byte = id / 8;
            if bits.len() <= byte {
                bits.resize(byte + 1, 0);
            }
            bits[byte] |= 1 << (id % 8);
        }
    }

    if bits.is_empty() {
        return Err(invalid());
    }
    Ok(bits)
}

/// `CPUQuotaPerSecUSec` for a CFS quota/period pair.
pub fn cpu_quota_per_sec(quota: i64, period: u64) -> u64 {
    if quota < 0 {
        return u64::MAX;
    }
    let period = if period == 0 { DEFAULT_CPU_PERIOD_US } else { period };
    let per_sec = (quota as u64).saturating_mul(1_000_000) / period;
    per_sec.div_ceil(CPU_QUOTA_GRANULARITY_US) * CPU_QUOTA_GRANULARITY_US
}

/// Unit properties derived from the resource specification.
pub fn resource_properties(resources: &Resources) -> Result<Vec<Property>> {
    let mut properties = Vec::new();
    let cpu = &resources.cpu;

    if cpu.period != 0 {
        properties.push(Property::new("CPUQuotaPeriodUSec", PropertyValue::U64(cpu.period)));
    }
    if cpu.quota != 0 {
        properties.push(Property::new(
            "CPUQuotaPerSecUSec",
            PropertyValue::U64(cpu_quota_per_sec(cpu.quota, cpu.period)),
        ));
    }

    if !resources.cpuset.cpus.is_empty() {
        properties.push(Property::new(
            "AllowedCPUs",
            PropertyValue::Bytes(range_to_bits(&resources.cpuset.cpus)?),
        ));
    }
    if !resources.cpuset.mems.is_empty() {
        properties.push(Property::new(
            "AllowedMemoryNodes",
            PropertyValue::Bytes(range_to_bits(&resources.cpuset.mems)?),
        ));
    }

    let memory = &resources.memory;
    if let Some(limit) = Limit::from_raw(memory.limit) {
        properties.push(Property::new("MemoryMax", PropertyValue::U64(limit.as_u64())));
    }
    if memory.swap != 0 {
        if let Some(swap) = swap_allowance(memory.swap, memory.limit)? {
            properties.push(Property::new("MemorySwapMax", PropertyValue::U64(swap.as_u64())));
        }
    }

    if resources.blkio.weight > 0 {
        properties.push(Property::new(
            "BlockIOWeight",
            PropertyValue::U64(u64::from(resources.blkio.weight)),
        ));
    }

    Ok(properties)
}

/// Full property set for a transient unit.
pub fn unit_properties(
    slice: &str,
    name: &str,
    resources: &Resources,
    delegate: bool,
) -> Result<Vec<Property>> {
    let mut properties = vec![Property::new(
        "Description",
        PropertyValue::Str(format!("cgroup {}", name)),
    )];
    if !slice.is_empty() {
        properties.push(Property::new(
            "Wants",
            PropertyValue::Strings(vec![slice.to_string()]),
        ));
    }

    properties.extend([
        Property::new("DefaultDependencies", PropertyValue::Bool(false)),
        Property::new("MemoryAccounting", PropertyValue::Bool(true)),
        Property::new("CPUAccounting", PropertyValue::Bool(true)),
        Property::new("BlockIOAccounting", PropertyValue::Bool(true)),
    ]);
    if delegate {
        properties.push(Property::new("Delegate", PropertyValue::Bool(true)));
    }

    properties.extend(resource_properties(resources)?);
    Ok(properties)
}

/// Creates and removes cgroups as systemd transient units.
pub struct SystemdDelegate {
    manager: Box<dyn UnitManager>,
}

impl SystemdDelegate {
    pub fn new(manager: Box<dyn UnitManager>) -> Self {
        Self { manager }
    }

    /// Connect to systemd on `bus`.
    pub fn connect(bus: Bus) -> Result<Self> {
        Ok(Self::new(Box::new(DbusUnitManager::connect(bus)?)))
    }

    fn start(&self, name: &str, properties: &[Property]) -> Result<()> {
        self.manager
            .start_transient_unit(name, "replace", properties)?
            .wait()
    }

    /// Start the transient unit for `path`.
    ///
    /// Some systemd versions refuse `Delegate` for certain unit types, so a
    /// failed attempt is repeated once without it. Invalid resources fail
    /// before anything is sent.
    pub fn create(&self, path: &Path, resources: &Resources) -> Result<()> {
        let (slice, name) = split_unit_path(path)?;
        let properties = unit_properties(&slice, &name, resources, true)?;

        if let Err(err) = self.start(&name, &properties) {
            warn!(unit = %name, error = %err, "Transient unit failed, retrying without Delegate");
            let without_delegate: Vec<Property> = properties
                .into_iter()
                .filter(|p| p.name != "Delegate")
                .collect();
            self.start(&name, &without_delegate)?;
        }

        info!(unit = %name, slice = %slice, "Started transient unit");
        Ok(())
    }

    /// Stop the unit for `path`; a unit systemd does not know is already gone.
    pub fn destroy(&self, path: &Path) -> Result<()> {
        let (_, name) = split_unit_path(path)?;

        match self
            .manager
            .stop_unit(&name, "replace")
            .and_then(PendingJob::wait)
        {
            Ok(()) => {
                info!(unit = %name, "Stopped transient unit");
                Ok(())
            }
            Err(err) if err.is_not_found() => {
                debug!(unit = %name, "Unit already gone");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgroups::{CpuResources, CpusetResources, MemoryResources};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct RecordingManager {
        started: Mutex<Vec<(String, Vec<Property>)>>,
        stopped: Mutex<Vec<String>>,
        fail_delegate: bool,
        fail_all: bool,
        missing: bool,
    }

    impl RecordingManager {
        fn started(&self) -> Vec<(String, Vec<Property>)> {
            self.started.lock().unwrap().clone()
        }
    }

    impl UnitManager for RecordingManager {
        fn start_transient_unit(
            &self,
            name: &str,
            _mode: &str,
            properties: &[Property],
        ) -> Result<PendingJob> {
            self.started
                .lock()
                .unwrap()
                .push((name.to_string(), properties.to_vec()));

            let delegated = properties.iter().any(|p| p.name == "Delegate");
            let result = if self.fail_all || (delegated && self.fail_delegate) {
                "failed"
            } else {
                "done"
            };
            Ok(PendingJob::finished(name, "/org/freedesktop/systemd1/job/1", result))
        }

        fn stop_unit(&self, name: &str, _mode: &str) -> Result<PendingJob> {
            self.stopped.lock().unwrap().push(name.to_string());
            if self.missing {
                return Err(CgroupError::UnitNotFound(name.to_string()));
            }
            Ok(PendingJob::finished(name, "/org/freedesktop/systemd1/job/2", "done"))
        }
    }

    impl UnitManager for Arc<RecordingManager> {
        fn start_transient_unit(
            &self,
            name: &str,
            mode: &str,
            properties: &[Property],
        ) -> Result<PendingJob> {
            self.as_ref().start_transient_unit(name, mode, properties)
        }

        fn stop_unit(&self, name: &str, mode: &str) -> Result<PendingJob> {
            self.as_ref().stop_unit(name, mode)
        }
    }

    fn find<'a>(properties: &'a [Property], name: &str) -> Option<&'a PropertyValue> {
        properties.iter().find(|p| p.name == name).map(|p| &p.value)
    }

    #[test]
    fn test_split_unit_path() {
        let (slice, name) = split_unit_path(Path::new("machine.slice/web.scope")).unwrap();
        assert_eq!(slice, "machine.slice");
        assert_eq!(name, "web.scope");

        let (slice, name) = split_unit_path(Path::new("solo.slice")).unwrap();
        assert_eq!(slice, "");
        assert_eq!(name, "solo.slice");

        assert!(split_unit_path(Path::new("")).is_err());
    }

    #[test]
    fn test_range_to_bits() {
        assert_eq!(range_to_bits("0").unwrap(), vec![0b0000_0001]);
        assert_eq!(range_to_bits("0-3,6").unwrap(), vec![0b0100_1111]);
        assert_eq!(range_to_bits("9").unwrap(), vec![0, 0b0000_0010]);
        assert!(range_to_bits("3-1").is_err());
        assert!(range_to_bits("a").is_err());
        assert!(range_to_bits("").is_err());
    }

    #[test]
    fn test_range_to_bits_rejects_huge_ids() {
        let err = range_to_bits("0-18446744073709551615").unwrap_err();
        assert!(matches!(err, CgroupError::InvalidLimit(_)));
        assert!(range_to_bits("8192").is_err());

        let bits = range_to_bits("8191").unwrap();
        assert_eq!(bits.len(), 1024);
        assert_eq!(bits[1023], 0b1000_0000);
    }

    #[test]
    fn test_cpu_quota_per_sec() {
        assert_eq!(cpu_quota_per_sec(50_000, 100_000), 500_000);
        assert_eq!(cpu_quota_per_sec(50_000, 0), 500_000);
        // 33333us per 100ms = 333330us/s, rounded up to 10ms steps
        assert_eq!(cpu_quota_per_sec(33_333, 100_000), 340_000);
        assert_eq!(cpu_quota_per_sec(-1, 100_000), u64::MAX);
    }

    #[test]
    fn test_unit_properties() {
        let resources = Resources {
            cpu: CpuResources {
                period: 100_000,
                quota: 20_000,
                ..Default::default()
            },
            cpuset: CpusetResources {
                cpus: "0-1".into(),
                mems: "0".into(),
            },
            memory: MemoryResources {
                limit: 1 << 30,
                swap: -1,
                ..Default::default()
            },
            ..Default::default()
        };

        let properties = unit_properties("machine.slice", "web.scope", &resources, true).unwrap();

        assert_eq!(
            find(&properties, "Description"),
            Some(&PropertyValue::Str("cgroup web.scope".into()))
        );
        assert_eq!(
            find(&properties, "Wants"),
            Some(&PropertyValue::Strings(vec!["machine.slice".into()]))
        );
        assert_eq!(find(&properties, "DefaultDependencies"), Some(&PropertyValue::Bool(false)));
        assert_eq!(find(&properties, "Delegate"), Some(&PropertyValue::Bool(true)));
        assert_eq!(find(&properties, "CPUQuotaPeriodUSec"), Some(&PropertyValue::U64(100_000)));
        assert_eq!(find(&properties, "CPUQuotaPerSecUSec"), Some(&PropertyValue::U64(200_000)));
        assert_eq!(find(&properties, "AllowedCPUs"), Some(&PropertyValue::Bytes(vec![0b11])));
        assert_eq!(find(&properties, "AllowedMemoryNodes"), Some(&PropertyValue::Bytes(vec![1])));
        assert_eq!(find(&properties, "MemoryMax"), Some(&PropertyValue::U64(1 << 30)));
        assert_eq!(find(&properties, "MemorySwapMax"), Some(&PropertyValue::U64(u64::MAX)));
        assert_eq!(find(&properties, "BlockIOWeight"), None);

        let properties = unit_properties("machine.slice", "web.scope", &resources, false).unwrap();
        assert_eq!(find(&properties, "Delegate"), None);
    }

    #[test]
    fn test_create_retries_without_delegate() {
        let manager = Arc::new(RecordingManager {
            fail_delegate: true,
            ..Default::default()
        });
        let delegate = SystemdDelegate::new(Box::new(manager.clone()));

        delegate
            .create(Path::new("machine.slice/web.scope"), &Resources::default())
            .unwrap();

        let started = manager.started();
        assert_eq!(started.len(), 2);
        assert_eq!(started[0].0, "web.scope");
        assert_eq!(find(&started[0].1, "Delegate"), Some(&PropertyValue::Bool(true)));
        assert_eq!(started[1].0, "web.scope");
        assert_eq!(find(&started[1].1, "Delegate"), None);
        assert_eq!(started[0].1.len(), started[1].1.len() + 1);
    }

    #[test]
    fn test_create_fails_when_both_attempts_fail() {
        let manager = Arc::new(RecordingManager {
            fail_all: true,
            ..Default::default()
        });
        let delegate = SystemdDelegate::new(Box::new(manager.clone()));

        let err = delegate
            .create(Path::new("machine.slice/web.scope"), &Resources::default())
            .unwrap_err();

        assert!(matches!(
            err,
            CgroupError::JobFailed { ref unit, ref result } if unit == "web.scope" && result == "failed"
        ));
        assert_eq!(manager.started().len(), 2);
    }

    #[test]
    fn test_invalid_resources_are_not_retried() {
        let manager = Arc::new(RecordingManager::default());
        let delegate = SystemdDelegate::new(Box::new(manager.clone()));

        let mut resources = Resources::default();
        resources.cpuset.cpus = "7-2".to_string();

        let err = delegate
            .create(Path::new("machine.slice/web.scope"), &resources)
            .unwrap_err();
        assert!(matches!(err, CgroupError::InvalidLimit(_)));
        assert!(manager.started().is_empty());
    }

    #[test]
    fn test_pending_job_failure() {
        let err = PendingJob::finished("web.scope", "/job/3", "timeout")
            .wait()
            .unwrap_err();
        match err {
            CgroupError::JobFailed { unit, result } => {
                assert_eq!(unit, "web.scope");
                assert_eq!(result, "timeout");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_destroy_missing_unit_is_ok() {
        let manager = RecordingManager {
            missing: true,
            ..Default::default()
        };
        let delegate = SystemdDelegate::new(Box::new(manager));

        delegate.destroy(Path::new("machine.slice/web.scope")).unwrap();
        delegate.destroy(Path::new("machine.slice/web.scope")).unwrap();
    }
}
