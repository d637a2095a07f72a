use crate::{
    Result, StratoError,
    config::{TimeoutConfig, limits},
    host::{CommandOutput, HostConnection, HostDriver},
    log_debug, log_error, log_info, log_warn,
    store::JsonStore,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    Online,
    Offline,
    #[default]
    Unknown,
}

impl std::fmt::Display for HostStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostStatus::Online => write!(f, "online"),
            HostStatus::Offline => write!(f, "offline"),
            HostStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// One observed metrics sample for a host. The per-host ring keeps 24 hours
/// of samples with strictly increasing timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostMetrics {
    pub cpu_usage: f64,
    pub memory_total_mb: u64,
    pub memory_used_mb: u64,
    pub disk_total_gb: u64,
    pub disk_used_gb: u64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    pub id: String,
    pub name: String,
    pub hostname: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_username")]
    pub username: String,
    pub key_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default)]
    pub status: HostStatus,
    #[serde(default = "default_vm_capacity")]
    pub vm_capacity: u32,
    #[serde(default)]
    pub vm_count: u32,
    #[serde(default)]
    pub cpu_cores: u32,
    #[serde(default)]
    pub memory_mb: u64,
    #[serde(default)]
    pub disk_gb: u64,
    #[serde(default)]
    pub metrics_history: Vec<HostMetrics>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

fn default_port() -> u16 {
    22
}
fn default_username() -> String {
    "ubuntu".to_string()
}
fn default_vm_capacity() -> u32 {
    10
}

impl Host {
    pub fn new(id: &str, name: &str, hostname: &str) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            name: name.to_string(),
            hostname: hostname.to_string(),
            port: default_port(),
            username: default_username(),
            key_path: None,
            password: None,
            status: HostStatus::Unknown,
            vm_capacity: default_vm_capacity(),
            vm_count: 0,
            cpu_cores: 0,
            memory_mb: 0,
            disk_gb: 0,
            metrics_history: Vec::new(),
            created_at: now,
            updated_at: now,
            extra: HashMap::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(StratoError::InvalidInput("host id cannot be empty".into()));
        }
        if !limits::HOST_PORT.contains(&self.port) {
            return Err(StratoError::InvalidInput(format!(
                "port {} outside {:?}",
                self.port,
                limits::HOST_PORT
            )));
        }
        if !limits::HOST_VM_CAPACITY.contains(&self.vm_capacity) {
            return Err(StratoError::InvalidInput(format!(
                "vm_capacity {} outside {:?}",
                self.vm_capacity,
                limits::HOST_VM_CAPACITY
            )));
        }
        if self.key_path.is_none() && self.password.is_none() {
            return Err(StratoError::InvalidInput(
                "either key_path or password must be provided".into(),
            ));
        }
        Ok(())
    }

    pub fn connection(&self) -> HostConnection {
        HostConnection {
            host_id: self.id.clone(),
            hostname: self.hostname.clone(),
            port: self.port,
            username: self.username.clone(),
            key_path: self.key_path.clone(),
            password: self.password.clone(),
        }
    }

    pub fn hypervisor_uri(&self) -> String {
        self.connection().hypervisor_uri()
    }

    pub fn latest_metrics(&self) -> Option<&HostMetrics> {
        self.metrics_history.last()
    }

    /// Available (cores, memory MB, disk GB) from the latest sample.
    pub fn available_resources(&self) -> Option<(f64, u64, u64)> {
        let m = self.latest_metrics()?;
        let cores = (self.cpu_cores as f64) * (1.0 - m.cpu_usage / 100.0);
        let mem = self.memory_mb.saturating_sub(m.memory_used_mb);
        let disk = self.disk_gb.saturating_sub(m.disk_used_gb);
        Some((cores.max(0.0), mem, disk))
    }

    /// Copy with the secret scrubbed, for presentation to callers.
    pub fn redacted(&self) -> Host {
        let mut host = self.clone();
        host.password = None;
        host
    }
}

/// Newly observed host facts, produced by a probe run outside the registry
/// lock and applied under it.
#[derive(Debug, Clone, Default)]
pub struct ProbeReport {
    pub status: HostStatus,
    pub specs: Option<HostSpecs>,
    pub sample: Option<HostMetrics>,
}

#[derive(Debug, Clone, Copy)]
pub struct HostSpecs {
    pub cpu_cores: u32,
    pub memory_mb: u64,
    pub disk_gb: u64,
    pub vm_count: Option<u32>,
}

const METRICS_RETENTION_HOURS: i64 = 24;

/// Inventory of hypervisor hosts with liveness probing, a bounded metrics
/// ring per host, and resource-aware placement.
pub struct FleetRegistry {
    hosts: Mutex<BTreeMap<String, Host>>,
    store: JsonStore,
    timeouts: TimeoutConfig,
    // Hosts probed during this process lifetime; placement only trusts these.
    probed: Mutex<HashSet<String>>,
}

impl FleetRegistry {
    pub fn load(data_dir: &Path, timeouts: TimeoutConfig) -> Result<Self> {
        let store = JsonStore::new(data_dir.join("hosts.json"));
        let hosts: BTreeMap<String, Host> = store.load()?;
        if !hosts.is_empty() {
            log_info!("Loaded {} hosts from {}", hosts.len(), store.path().display());
        }
        Ok(Self {
            hosts: Mutex::new(hosts),
            store,
            timeouts,
            probed: Mutex::new(HashSet::new()),
        })
    }

    pub fn timeouts(&self) -> TimeoutConfig {
        self.timeouts
    }

    pub fn driver_for(&self, host: &Host) -> HostDriver {
        HostDriver::new(host.connection(), self.timeouts)
    }

    pub fn driver(&self, host_id: &str) -> Result<HostDriver> {
        Ok(self.driver_for(&self.get(host_id)?))
    }

    /// Register a host: probe it, collect specs if reachable, persist.
    pub async fn add(&self, mut host: Host) -> Result<Host> {
        host.validate()?;
        {
            let hosts = self.hosts.lock().unwrap();
            if hosts.contains_key(&host.id) {
                return Err(StratoError::Conflict(format!(
                    "host {} already exists",
                    host.id
                )));
            }
        }

        let report = self.collect_probe(&host).await;
        host.status = report.status;
        if let Some(specs) = report.specs {
            host.cpu_cores = specs.cpu_cores;
            host.memory_mb = specs.memory_mb;
            host.disk_gb = specs.disk_gb;
            if let Some(count) = specs.vm_count {
                host.vm_count = count;
            }
        } else if host.status == HostStatus::Online && host.cpu_cores == 0 {
            // Online hosts must carry specs; without them the record is
            // not trustworthy for placement.
            log_warn!("Could not collect specs for host {}", host.id);
            host.status = HostStatus::Unknown;
        }
        host.updated_at = Utc::now();

        let mut hosts = self.hosts.lock().unwrap();
        if hosts.contains_key(&host.id) {
            return Err(StratoError::Conflict(format!(
                "host {} already exists",
                host.id
            )));
        }
        hosts.insert(host.id.clone(), host.clone());
        self.persist(&hosts)?;
        if host.status == HostStatus::Online {
            self.probed.lock().unwrap().insert(host.id.clone());
        }
        log_info!("Added host {} ({}) as {}", host.id, host.hostname, host.status);
        Ok(host.redacted())
    }

    /// Drop the record. VMs and volumes referencing the host are left in
    /// place and will error on access.
    pub fn remove(&self, host_id: &str) -> Result<()> {
        let mut hosts = self.hosts.lock().unwrap();
        if hosts.remove(host_id).is_none() {
            return Err(StratoError::NotFound(format!("host {}", host_id)));
        }
        self.persist(&hosts)?;
        self.probed.lock().unwrap().remove(host_id);
        log_info!("Removed host {}", host_id);
        Ok(())
    }

    pub fn get(&self, host_id: &str) -> Result<Host> {
        self.hosts
            .lock()
            .unwrap()
            .get(host_id)
            .cloned()
            .ok_or_else(|| StratoError::NotFound(format!("host {}", host_id)))
    }

    pub fn list(&self) -> Vec<Host> {
        self.hosts.lock().unwrap().values().cloned().collect()
    }

    pub fn online_hosts(&self) -> Vec<Host> {
        self.list()
            .into_iter()
            .filter(|h| h.status == HostStatus::Online)
            .collect()
    }

    /// Refresh status, specs and metrics for one host. Remote collection
    /// runs without the registry lock; the report is applied under it.
    pub async fn probe(&self, host_id: &str) -> Result<Host> {
        let host = self.get(host_id)?;
        let report = self.collect_probe(&host).await;
        self.apply_probe(host_id, report)
    }

    /// Probe every host, tolerating individual failures.
    pub async fn probe_all(&self) {
        for host in self.list() {
            if let Err(e) = self.probe(&host.id).await {
                log_error!("Error probing host {}: {}", host.id, e);
            }
        }
    }

    /// Apply a probe outcome: status, specs, and a metrics sample appended
    /// to the ring (trimmed to 24 h, timestamps strictly increasing).
    pub fn apply_probe(&self, host_id: &str, report: ProbeReport) -> Result<Host> {
        let mut hosts = self.hosts.lock().unwrap();
        let host = hosts
            .get_mut(host_id)
            .ok_or_else(|| StratoError::NotFound(format!("host {}", host_id)))?;

        host.status = report.status;
        if let Some(specs) = report.specs {
            host.cpu_cores = specs.cpu_cores;
            host.memory_mb = specs.memory_mb;
            host.disk_gb = specs.disk_gb;
            if let Some(count) = specs.vm_count {
                host.vm_count = count;
            }
        } else if host.status == HostStatus::Online && host.cpu_cores == 0 {
            host.status = HostStatus::Unknown;
        }
        if let Some(sample) = report.sample {
            let monotonic = host
                .latest_metrics()
                .map(|last| sample.timestamp > last.timestamp)
                .unwrap_or(true);
            if monotonic {
                host.metrics_history.push(sample);
            } else {
                log_debug!("Dropping out-of-order metrics sample for host {}", host_id);
            }
            let cutoff = Utc::now() - ChronoDuration::hours(METRICS_RETENTION_HOURS);
            host.metrics_history.retain(|m| m.timestamp > cutoff);
        }
        host.updated_at = Utc::now();

        let snapshot = host.clone();
        self.persist(&hosts)?;
        drop(hosts);
        self.probed.lock().unwrap().insert(host_id.to_string());
        Ok(snapshot.redacted())
    }

    /// Run a command on a host; thin pass-through to the driver.
    pub async fn exec(&self, host_id: &str, command: &str) -> Result<CommandOutput> {
        self.driver(host_id)?
            .exec(command, self.timeouts.exec())
            .await
    }

    pub async fn exec_checked(&self, host_id: &str, command: &str) -> Result<CommandOutput> {
        self.driver(host_id)?
            .exec_checked(command, self.timeouts.exec())
            .await
    }

    pub async fn copy_to(&self, host_id: &str, local: &Path, remote: &str) -> Result<()> {
        self.driver(host_id)?.put_file(local, remote).await
    }

    pub async fn copy_from(&self, host_id: &str, remote: &str, local: &Path) -> Result<()> {
        self.driver(host_id)?.get_file(remote, local).await
    }

    /// Whether a host can take a workload of the given shape, judged from
    /// its latest metrics sample.
    pub fn host_fits(host: &Host, cpu_cores: u32, memory_mb: u64, disk_gb: u64) -> bool {
        if host.vm_count >= host.vm_capacity {
            return false;
        }
        match host.available_resources() {
            Some((cores, mem, disk)) => {
                cores >= cpu_cores as f64 && mem >= memory_mb && disk >= disk_gb
            }
            None => false,
        }
    }

    /// Pick the online host with the most available capacity for the given
    /// request, or `None` when nothing fits. Only hosts probed during this
    /// process lifetime are considered. Ties break by host id.
    pub fn select_for(&self, cpu_cores: u32, memory_mb: u64, disk_gb: u64) -> Option<Host> {
        // Lock order is hosts, then probed, everywhere both are held.
        let hosts = self.hosts.lock().unwrap();
        let probed = self.probed.lock().unwrap();

        let mut candidates: Vec<&Host> = hosts
            .values()
            .filter(|h| h.status == HostStatus::Online)
            .filter(|h| probed.contains(&h.id))
            .filter(|h| Self::host_fits(h, cpu_cores, memory_mb, disk_gb))
            .collect();

        candidates.sort_by(|a, b| {
            Self::score(b)
                .partial_cmp(&Self::score(a))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });

        candidates.first().map(|h| (*h).clone())
    }

    /// Probe the whole fleet, then select. Used by placement paths that
    /// must not rely on stale samples.
    pub async fn refresh_and_select(
        &self,
        cpu_cores: u32,
        memory_mb: u64,
        disk_gb: u64,
    ) -> Option<Host> {
        self.probe_all().await;
        self.select_for(cpu_cores, memory_mb, disk_gb)
    }

    fn score(host: &Host) -> f64 {
        match host.available_resources() {
            Some((cores, mem_mb, disk_gb)) => cores + (mem_mb as f64) / 1024.0 + disk_gb as f64,
            None => 0.0,
        }
    }

    /// Adjust the bookkeeping of VMs placed on a host. Saturates at zero.
    pub fn adjust_vm_count(&self, host_id: &str, delta: i64) -> Result<()> {
        let mut hosts = self.hosts.lock().unwrap();
        let host = hosts
            .get_mut(host_id)
            .ok_or_else(|| StratoError::NotFound(format!("host {}", host_id)))?;
        host.vm_count = (host.vm_count as i64 + delta).max(0) as u32;
        host.updated_at = Utc::now();
        self.persist(&hosts)
    }

    /// Hypervisor errors in a reprobe-worthy class trigger a fresh liveness
    /// check of the host so placement stops trusting it.
    pub async fn reprobe_on_error(&self, host_id: &str, err: &StratoError) {
        if !err.warrants_reprobe() {
            return;
        }
        log_warn!("Re-probing host {} after: {}", host_id, err);
        if let Err(probe_err) = self.probe(host_id).await {
            log_error!("Re-probe of host {} failed: {}", host_id, probe_err);
        }
    }

    async fn collect_probe(&self, host: &Host) -> ProbeReport {
        let driver = self.driver_for(host);

        if let Err(e) = driver.exec_checked("echo ok", self.timeouts.probe()).await {
            log_warn!("Host {} unreachable: {}", host.id, e);
            return ProbeReport {
                status: HostStatus::Offline,
                specs: None,
                sample: None,
            };
        }

        let specs = match self.collect_specs(&driver).await {
            Ok(specs) => Some(specs),
            Err(e) => {
                log_warn!("Could not collect specs for host {}: {}", host.id, e);
                None
            }
        };

        let sample = match self.collect_metrics(&driver).await {
            Ok(sample) => Some(sample),
            Err(e) => {
                // A partial sample is worse than none; skip the whole tick.
                log_warn!("Skipping metrics sample for host {}: {}", host.id, e);
                None
            }
        };

        ProbeReport {
            status: HostStatus::Online,
            specs,
            sample,
        }
    }

    async fn collect_specs(&self, driver: &HostDriver) -> Result<HostSpecs> {
        let timeout = self.timeouts.probe();

        let out = driver
            .exec_checked("grep -c processor /proc/cpuinfo", timeout)
            .await?;
        let cpu_cores = parse_u64(&out.stdout)? as u32;

        let out = driver
            .exec_checked("grep MemTotal /proc/meminfo | awk '{print $2}'", timeout)
            .await?;
        let memory_mb = parse_u64(&out.stdout)? / 1024;

        let out = driver
            .exec_checked("df -B1G / | awk '{print $2}' | tail -n 1", timeout)
            .await?;
        let disk_gb = parse_u64(&out.stdout)?;

        let out = driver
            .exec(
                "command -v virsh > /dev/null && virsh list --all --name | grep -c . || echo 0",
                timeout,
            )
            .await?;
        let vm_count = parse_u64(&out.stdout).ok().map(|n| n as u32);

        Ok(HostSpecs {
            cpu_cores,
            memory_mb,
            disk_gb,
            vm_count,
        })
    }

    async fn collect_metrics(&self, driver: &HostDriver) -> Result<HostMetrics> {
        let timeout = self.timeouts.metrics();

        let out = driver
            .exec_checked("top -bn1 | grep 'Cpu(s)' | awk '{print $2 + $4}'", timeout)
            .await?;
        let cpu_usage = parse_f64(&out.stdout)?;

        let out = driver
            .exec_checked("free -m | awk '/Mem:/ {print $2 \" \" $3}'", timeout)
            .await?;
        let (memory_total_mb, memory_used_mb) = parse_pair(&out.stdout)?;

        let out = driver
            .exec_checked("df -B1G / | tail -1 | awk '{print $2 \" \" $3}'", timeout)
            .await?;
        let (disk_total_gb, disk_used_gb) = parse_pair(&out.stdout)?;

        let out = driver
            .exec_checked(
                "cat /proc/net/dev | grep -E 'eth0|ens|eno|enp' | head -n 1 | awk '{print $2 \" \" $10}'",
                timeout,
            )
            .await?;
        let (network_rx_bytes, network_tx_bytes) = parse_pair(&out.stdout)?;

        Ok(HostMetrics {
            cpu_usage,
            memory_total_mb,
            memory_used_mb,
            disk_total_gb,
            disk_used_gb,
            network_rx_bytes,
            network_tx_bytes,
            timestamp: Utc::now(),
        })
    }

    fn persist(&self, hosts: &BTreeMap<String, Host>) -> Result<()> {
        self.store.save(hosts)
    }
}

fn parse_u64(raw: &str) -> Result<u64> {
    raw.trim()
        .parse()
        .map_err(|_| StratoError::Serde(format!("expected integer, got {:?}", raw.trim())))
}

fn parse_f64(raw: &str) -> Result<f64> {
    raw.trim()
        .parse()
        .map_err(|_| StratoError::Serde(format!("expected number, got {:?}", raw.trim())))
}

fn parse_pair(raw: &str) -> Result<(u64, u64)> {
    let mut parts = raw.split_whitespace();
    let first = parts
        .next()
        .and_then(|p| p.parse().ok())
        .ok_or_else(|| StratoError::Serde(format!("expected two integers, got {:?}", raw)))?;
    let second = parts
        .next()
        .and_then(|p| p.parse().ok())
        .ok_or_else(|| StratoError::Serde(format!("expected two integers, got {:?}", raw)))?;
    Ok((first, second))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_pair_requires_both_fields() {
        assert_eq!(parse_pair("16384 8192").unwrap(), (16384, 8192));
        assert!(parse_pair("16384").is_err());
        assert!(parse_pair("").is_err());
    }

    #[test]
    fn available_resources_from_latest_sample() {
        let mut host = Host::new("h1", "node-1", "node1.lab");
        host.cpu_cores = 8;
        host.memory_mb = 16_384;
        host.disk_gb = 200;
        host.metrics_history.push(HostMetrics {
            cpu_usage: 50.0,
            memory_total_mb: 16_384,
            memory_used_mb: 8_192,
            disk_total_gb: 200,
            disk_used_gb: 50,
            network_rx_bytes: 0,
            network_tx_bytes: 0,
            timestamp: Utc::now(),
        });

        let (cores, mem, disk) = host.available_resources().unwrap();
        assert!((cores - 4.0).abs() < 1e-9);
        assert_eq!(mem, 8_192);
        assert_eq!(disk, 150);
    }

    #[test]
    fn host_without_metrics_never_fits() {
        let mut host = Host::new("h1", "node-1", "node1.lab");
        host.cpu_cores = 8;
        host.memory_mb = 16_384;
        host.disk_gb = 200;
        assert!(!FleetRegistry::host_fits(&host, 1, 512, 1));
    }
}
