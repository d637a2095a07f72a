use crate::{
    Result, StratoError,
    config::limits,
    fleet::{FleetRegistry, Host},
    hypervisor::{DomainState, HypervisorSession},
    log_debug, log_error, log_info, log_warn,
    store::JsonStore,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinSet;

pub const DISK_DIR: &str = "/var/lib/strato/disks";
pub const IMAGE_DIR: &str = "/var/lib/strato/images";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VmArch {
    #[default]
    X86_64,
    Aarch64,
}

impl VmArch {
    fn machine(self) -> &'static str {
        match self {
            VmArch::X86_64 => "q35",
            VmArch::Aarch64 => "virt",
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            VmArch::X86_64 => "x86_64",
            VmArch::Aarch64 => "aarch64",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmConfig {
    pub name: String,
    #[serde(default = "default_cpu_cores")]
    pub cpu_cores: u32,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,
    #[serde(default = "default_disk_gb")]
    pub disk_size_gb: u64,
    pub image_id: Option<String>,
    pub network_name: Option<String>,
    pub arch: Option<VmArch>,
    /// Opaque cloud-init user data, rendered by an outer layer.
    pub cloud_init: Option<serde_json::Value>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

fn default_cpu_cores() -> u32 {
    2
}
fn default_memory_mb() -> u64 {
    2048
}
fn default_disk_gb() -> u64 {
    20
}

impl VmConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            cpu_cores: default_cpu_cores(),
            memory_mb: default_memory_mb(),
            disk_size_gb: default_disk_gb(),
            image_id: None,
            network_name: None,
            arch: None,
            cloud_init: None,
            extra: HashMap::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(StratoError::InvalidInput("VM name cannot be empty".into()));
        }
        if !limits::VM_CPU_CORES.contains(&self.cpu_cores) {
            return Err(StratoError::InvalidInput(format!(
                "cpu_cores {} outside {:?}",
                self.cpu_cores,
                limits::VM_CPU_CORES
            )));
        }
        if !limits::VM_MEMORY_MB.contains(&self.memory_mb) {
            return Err(StratoError::InvalidInput(format!(
                "memory_mb {} outside {:?}",
                self.memory_mb,
                limits::VM_MEMORY_MB
            )));
        }
        if !limits::VM_DISK_GB.contains(&self.disk_size_gb) {
            return Err(StratoError::InvalidInput(format!(
                "disk_size_gb {} outside {:?}",
                self.disk_size_gb,
                limits::VM_DISK_GB
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmState {
    Creating,
    Running,
    Stopped,
    Error,
    NotFound,
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VmState::Creating => "creating",
            VmState::Running => "running",
            VmState::Stopped => "stopped",
            VmState::Error => "error",
            VmState::NotFound => "not_found",
        };
        write!(f, "{}", s)
    }
}

impl From<DomainState> for VmState {
    fn from(state: DomainState) -> Self {
        match state {
            DomainState::Running | DomainState::Paused => VmState::Running,
            DomainState::Stopped => VmState::Stopped,
            DomainState::Crashed => VmState::Error,
            DomainState::Unknown => VmState::Error,
        }
    }
}

/// Cluster-visible view of one VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vm {
    pub id: String,
    pub name: String,
    pub host_id: String,
    pub config: VmConfig,
    pub state: VmState,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Persisted entry of the authoritative vm -> host map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmRecord {
    pub name: String,
    pub host_id: String,
    pub config: VmConfig,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmMetrics {
    pub state: VmState,
    /// Percent of allocated vCPU time consumed over the sampling window.
    pub cpu_usage: f64,
    /// Percent of balloon memory in use.
    pub memory_usage: f64,
    pub memory_used_mb: u64,
    pub memory_total_mb: u64,
    /// Percent allocation per block device target.
    pub disk_usage: HashMap<String, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskInfo {
    pub id: String,
    pub path: String,
    pub size_gb: Option<u64>,
    pub host_id: String,
}

/// Owns the cluster-wide `vm_id -> host_id` mapping and routes every VM
/// operation to the owning host's hypervisor.
pub struct VmManager {
    fleet: Arc<FleetRegistry>,
    vms: Mutex<BTreeMap<String, VmRecord>>,
    store: JsonStore,
}

impl VmManager {
    pub fn load(data_dir: &Path, fleet: Arc<FleetRegistry>) -> Result<Self> {
        let store = JsonStore::new(data_dir.join("vm_map.json"));
        let vms: BTreeMap<String, VmRecord> = store.load()?;
        if !vms.is_empty() {
            log_info!("Loaded {} VM placements", vms.len());
        }
        Ok(Self {
            fleet,
            vms: Mutex::new(vms),
            store,
        })
    }

    pub fn host_of(&self, vm_id: &str) -> Result<String> {
        self.record(vm_id).map(|r| r.host_id)
    }

    pub fn record(&self, vm_id: &str) -> Result<VmRecord> {
        self.vms
            .lock()
            .unwrap()
            .get(vm_id)
            .cloned()
            .ok_or_else(|| StratoError::NotFound(format!("VM {}", vm_id)))
    }

    fn session_for(&self, vm_id: &str) -> Result<(Host, HypervisorSession, VmRecord)> {
        let record = self.record(vm_id)?;
        let host = self.fleet.get(&record.host_id)?;
        let session = self.fleet.driver_for(&host).hypervisor();
        Ok((host, session, record))
    }

    /// Create a VM on the best-fitting host. No state changes survive a
    /// failed creation; partial hypervisor artifacts are rolled back on a
    /// best-effort basis.
    pub async fn create(&self, config: VmConfig) -> Result<Vm> {
        config.validate()?;

        let host = self
            .fleet
            .refresh_and_select(config.cpu_cores, config.memory_mb, config.disk_size_gb)
            .await
            .ok_or_else(|| {
                StratoError::NoCapacity(format!(
                    "no host fits {} cores / {} MB / {} GB",
                    config.cpu_cores, config.memory_mb, config.disk_size_gb
                ))
            })?;
        log_info!("Selected host {} for VM {}", host.id, config.name);

        let vm_id = short_id();
        let disk_path = format!("{}/{}.qcow2", DISK_DIR, vm_id);
        let driver = self.fleet.driver_for(&host);
        let session = driver.hypervisor();

        let create_disk = match &config.image_id {
            Some(image) => format!(
                "sudo mkdir -p {dir} && sudo qemu-img create -f qcow2 -b {img_dir}/{image}.qcow2 -F qcow2 {path} {size}G",
                dir = DISK_DIR,
                img_dir = IMAGE_DIR,
                image = image,
                path = disk_path,
                size = config.disk_size_gb,
            ),
            None => format!(
                "sudo mkdir -p {dir} && sudo qemu-img create -f qcow2 {path} {size}G",
                dir = DISK_DIR,
                path = disk_path,
                size = config.disk_size_gb,
            ),
        };

        let result: Result<()> = async {
            driver
                .exec_checked(&create_disk, self.fleet.timeouts().exec())
                .await?;
            let xml = build_domain_xml(&config, &disk_path);
            session.define_xml(&xml).await?;
            session.start(&config.name).await?;
            Ok(())
        }
        .await;

        if let Err(e) = result {
            log_error!("Error creating VM {} on host {}: {}", config.name, host.id, e);
            if let Err(undef) = session.undefine(&config.name).await {
                log_debug!("Rollback undefine of {}: {}", config.name, undef);
            }
            let _ = driver
                .exec(
                    &format!("sudo rm -f {}", disk_path),
                    self.fleet.timeouts().exec(),
                )
                .await;
            self.fleet.reprobe_on_error(&host.id, &e).await;
            return Err(e);
        }

        let record = VmRecord {
            name: config.name.clone(),
            host_id: host.id.clone(),
            config: config.clone(),
            created_at: Utc::now(),
            extra: HashMap::new(),
        };

        // Map insert and host vm_count move in one critical section so no
        // snapshot observes one without the other.
        {
            let mut vms = self.vms.lock().unwrap();
            vms.insert(vm_id.clone(), record.clone());
            self.store.save(&*vms)?;
            self.fleet.adjust_vm_count(&host.id, 1)?;
        }

        log_info!("Created VM {} ({}) on host {}", vm_id, config.name, host.id);
        Ok(Vm {
            id: vm_id,
            name: record.name,
            host_id: record.host_id,
            config,
            state: VmState::Running,
            error_message: None,
            created_at: record.created_at,
        })
    }

    /// Read-through fetch: placement from the map, runtime state from the
    /// owning host.
    pub async fn get(&self, vm_id: &str) -> Result<Vm> {
        let (host, session, record) = self.session_for(vm_id)?;
        let (state, error_message) = match session.state(&record.name).await {
            Ok(domain_state) => (VmState::from(domain_state), None),
            Err(e) if is_missing_domain(&e) => (VmState::NotFound, None),
            Err(e) => {
                self.fleet.reprobe_on_error(&host.id, &e).await;
                (VmState::Error, Some(e.to_string()))
            }
        };
        Ok(Vm {
            id: vm_id.to_string(),
            name: record.name,
            host_id: record.host_id,
            config: record.config,
            state,
            error_message,
            created_at: record.created_at,
        })
    }

    /// Runtime state only; lookup failures collapse to `not_found`.
    pub async fn status(&self, vm_id: &str) -> VmState {
        match self.get(vm_id).await {
            Ok(vm) => vm.state,
            Err(_) => VmState::NotFound,
        }
    }

    pub async fn start(&self, vm_id: &str) -> Result<()> {
        let (_, session, record) = self.session_for(vm_id)?;
        session.start(&record.name).await
    }

    pub async fn stop(&self, vm_id: &str, force: bool) -> Result<()> {
        let (_, session, record) = self.session_for(vm_id)?;
        if force {
            session.destroy(&record.name).await
        } else {
            session.shutdown(&record.name).await
        }
    }

    /// Sample guest counters twice to derive CPU utilization over a short
    /// window; memory and block usage come from the second sample.
    pub async fn metrics(&self, vm_id: &str) -> Result<VmMetrics> {
        let (_, session, record) = self.session_for(vm_id)?;

        let first = session.domstats(&record.name).await?;
        tokio::time::sleep(Duration::from_secs(1)).await;
        let second = session.domstats(&record.name).await?;

        let cpu_time_0 = stat_u64(&first, "cpu.time");
        let cpu_time_1 = stat_u64(&second, "cpu.time");
        let vcpus = stat_u64(&second, "vcpu.current").max(1);
        let elapsed_ns = 1_000_000_000u64 * vcpus;
        let cpu_usage =
            (cpu_time_1.saturating_sub(cpu_time_0) as f64 / elapsed_ns as f64 * 100.0).min(100.0);

        let balloon_kib = stat_u64(&second, "balloon.current");
        let unused_kib = stat_u64(&second, "balloon.unused");
        let used_kib = balloon_kib.saturating_sub(unused_kib);
        let memory_usage = if balloon_kib > 0 {
            used_kib as f64 / balloon_kib as f64 * 100.0
        } else {
            0.0
        };

        let mut disk_usage = HashMap::new();
        let block_count = stat_u64(&second, "block.count");
        for i in 0..block_count {
            let name = second
                .get(&format!("block.{}.name", i))
                .cloned()
                .unwrap_or_else(|| format!("block{}", i));
            let capacity = stat_u64(&second, &format!("block.{}.capacity", i));
            let allocation = stat_u64(&second, &format!("block.{}.allocation", i));
            if capacity > 0 {
                disk_usage.insert(name, allocation as f64 / capacity as f64 * 100.0);
            }
        }

        Ok(VmMetrics {
            state: VmState::Running,
            cpu_usage,
            memory_usage,
            memory_used_mb: used_kib / 1024,
            memory_total_mb: balloon_kib / 1024,
            disk_usage,
        })
    }

    /// Enumerate all VMs across online hosts in parallel, adopting domains
    /// the map does not know about yet.
    pub async fn list(&self) -> Vec<Vm> {
        let hosts = self.fleet.online_hosts();
        let timeouts = self.fleet.timeouts();

        let mut tasks = JoinSet::new();
        for host in hosts {
            let uri = host.hypervisor_uri();
            tasks.spawn(async move {
                let session = HypervisorSession::new(uri, timeouts);
                (host, session.list_all().await)
            });
        }

        let mut by_host = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((host, Ok(domains))) => by_host.push((host, domains)),
                Ok((host, Err(e))) => {
                    log_error!("Error listing VMs on host {}: {}", host.id, e);
                }
                Err(e) => log_error!("VM listing task failed: {}", e),
            }
        }

        let mut result = Vec::new();
        let mut vms = self.vms.lock().unwrap();
        let mut repaired = false;

        for (host, domains) in by_host {
            for domain in domains {
                let known = vms
                    .iter()
                    .find(|(_, r)| r.name == domain.name)
                    .map(|(id, r)| (id.clone(), r.clone()));
                let (vm_id, record) = match known {
                    Some(pair) => pair,
                    None => {
                        // Host reports a domain the map has never seen;
                        // adopt it under its domain name.
                        log_warn!(
                            "Adopting unmapped domain {} found on host {}",
                            domain.name,
                            host.id
                        );
                        let record = VmRecord {
                            name: domain.name.clone(),
                            host_id: host.id.clone(),
                            config: VmConfig::new(&domain.name),
                            created_at: Utc::now(),
                            extra: HashMap::new(),
                        };
                        vms.insert(domain.name.clone(), record.clone());
                        repaired = true;
                        (domain.name.clone(), record)
                    }
                };
                result.push(Vm {
                    id: vm_id,
                    name: record.name,
                    host_id: record.host_id,
                    config: record.config,
                    state: VmState::from(domain.state),
                    error_message: None,
                    created_at: record.created_at,
                });
            }
        }

        if repaired {
            if let Err(e) = self.store.save(&*vms) {
                log_error!("Error persisting repaired VM map: {}", e);
            }
        }

        result
    }

    /// Destroy a VM and forget its placement. Idempotent: once the record
    /// is gone, further calls succeed immediately.
    pub async fn delete(&self, vm_id: &str) -> Result<()> {
        let record = match self.record(vm_id) {
            Ok(record) => record,
            Err(StratoError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        let host = self.fleet.get(&record.host_id)?;
        let driver = self.fleet.driver_for(&host);
        let session = driver.hypervisor();

        if let Err(e) = session.destroy(&record.name).await {
            if !is_missing_domain(&e) {
                log_debug!("Destroy of {} before undefine: {}", record.name, e);
            }
        }
        match session.undefine(&record.name).await {
            Ok(()) => {}
            Err(e) if is_missing_domain(&e) => {}
            Err(e) => {
                self.fleet.reprobe_on_error(&host.id, &e).await;
                return Err(e);
            }
        }
        let _ = driver
            .exec(
                &format!("sudo rm -f {}/{}.qcow2", DISK_DIR, vm_id),
                self.fleet.timeouts().exec(),
            )
            .await;

        {
            let mut vms = self.vms.lock().unwrap();
            vms.remove(vm_id);
            self.store.save(&*vms)?;
            self.fleet.adjust_vm_count(&record.host_id, -1)?;
        }
        log_info!("Deleted VM {}", vm_id);
        Ok(())
    }

    /// Flip a VM's authoritative host after a successful migration. The map
    /// update and both vm_count moves happen in one critical section.
    pub fn commit_migration(&self, vm_id: &str, dest_host_id: &str) -> Result<()> {
        let mut vms = self.vms.lock().unwrap();
        let record = vms
            .get_mut(vm_id)
            .ok_or_else(|| StratoError::NotFound(format!("VM {}", vm_id)))?;
        let source = record.host_id.clone();
        record.host_id = dest_host_id.to_string();
        self.store.save(&*vms)?;
        self.fleet.adjust_vm_count(&source, -1)?;
        self.fleet.adjust_vm_count(dest_host_id, 1)?;
        log_info!("VM {} now placed on host {}", vm_id, dest_host_id);
        Ok(())
    }

    /// Create a standalone disk on the first online host (no affinity).
    pub async fn create_disk(&self, name: &str, size_gb: u64) -> Result<DiskInfo> {
        if !limits::VM_DISK_GB.contains(&size_gb) {
            return Err(StratoError::InvalidInput(format!(
                "disk size {} outside {:?}",
                size_gb,
                limits::VM_DISK_GB
            )));
        }
        let host = self
            .fleet
            .online_hosts()
            .into_iter()
            .next()
            .ok_or_else(|| StratoError::NoCapacity("no online hosts for disk".into()))?;

        let disk_id = format!("{}-{}", name, short_id());
        let path = format!("{}/{}.qcow2", DISK_DIR, disk_id);
        self.fleet
            .exec_checked(
                &host.id,
                &format!(
                    "sudo mkdir -p {} && sudo qemu-img create -f qcow2 {} {}G",
                    DISK_DIR, path, size_gb
                ),
            )
            .await?;
        Ok(DiskInfo {
            id: disk_id,
            path,
            size_gb: Some(size_gb),
            host_id: host.id,
        })
    }

    /// Enumerate standalone disks across all online hosts.
    pub async fn list_disks(&self) -> Vec<DiskInfo> {
        let mut disks = Vec::new();
        for host in self.fleet.online_hosts() {
            let out = self
                .fleet
                .exec(&host.id, &format!("ls -1 {} 2>/dev/null || true", DISK_DIR))
                .await;
            match out {
                Ok(out) => {
                    for file in out.stdout.lines() {
                        let Some(id) = file.trim().strip_suffix(".qcow2") else {
                            continue;
                        };
                        disks.push(DiskInfo {
                            id: id.to_string(),
                            path: format!("{}/{}", DISK_DIR, file.trim()),
                            size_gb: None,
                            host_id: host.id.clone(),
                        });
                    }
                }
                Err(e) => log_error!("Error listing disks on host {}: {}", host.id, e),
            }
        }
        disks
    }

    pub async fn attach_disk(&self, vm_id: &str, disk_id: &str) -> Result<()> {
        let (_, session, record) = self.session_for(vm_id)?;
        let path = format!("{}/{}.qcow2", DISK_DIR, disk_id);
        let existing = session.domblklist(&record.name).await?;
        let target = next_block_target(existing.len());
        session.attach_disk(&record.name, &path, &target).await
    }

    pub async fn detach_disk(&self, vm_id: &str, disk_id: &str) -> Result<()> {
        let (_, session, record) = self.session_for(vm_id)?;
        let path = format!("{}/{}.qcow2", DISK_DIR, disk_id);
        let devices = session.domblklist(&record.name).await?;
        let target = devices
            .into_iter()
            .find(|(_, source)| *source == path)
            .map(|(target, _)| target)
            .ok_or_else(|| {
                StratoError::NotFound(format!("disk {} on VM {}", disk_id, vm_id))
            })?;
        session.detach_disk(&record.name, &target).await
    }
}

fn stat_u64(stats: &HashMap<String, String>, key: &str) -> u64 {
    stats
        .get(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

fn is_missing_domain(err: &StratoError) -> bool {
    match err {
        StratoError::Hypervisor { message, .. } => {
            let lower = message.to_lowercase();
            lower.contains("failed to get domain") || lower.contains("domain not found")
        }
        _ => false,
    }
}

fn next_block_target(existing: usize) -> String {
    let letter = (b'a' + (existing as u8).min(25)) as char;
    format!("vd{}", letter)
}

pub fn short_id() -> String {
    uuid::Uuid::new_v4().to_string()[..8].to_string()
}

/// Render the domain definition for a VM. The domain name is the VM name.
pub fn build_domain_xml(config: &VmConfig, disk_path: &str) -> String {
    let arch = config.arch.unwrap_or_default();
    let network = config.network_name.as_deref().unwrap_or("default");
    format!(
        r#"<domain type='kvm'>
  <name>{name}</name>
  <memory unit='MiB'>{memory}</memory>
  <currentMemory unit='MiB'>{memory}</currentMemory>
  <vcpu placement='static'>{cpus}</vcpu>
  <os>
    <type arch='{arch}' machine='{machine}'>hvm</type>
    <boot dev='hd'/>
  </os>
  <features>
    <acpi/>
    <apic/>
  </features>
  <cpu mode='host-passthrough'>
    <topology sockets='1' cores='{cpus}' threads='1'/>
  </cpu>
  <devices>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='{disk}'/>
      <target dev='vda' bus='virtio'/>
    </disk>
    <interface type='network'>
      <source network='{network}'/>
      <model type='virtio'/>
    </interface>
    <console type='pty'/>
    <graphics type='vnc' port='-1' autoport='yes' listen='0.0.0.0'/>
  </devices>
</domain>
"#,
        name = config.name,
        memory = config.memory_mb,
        cpus = config.cpu_cores,
        arch = arch.as_str(),
        machine = arch.machine(),
        disk = disk_path,
        network = network,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_validation_enforces_limits() {
        let mut config = VmConfig::new("web-1");
        assert!(config.validate().is_ok());

        config.cpu_cores = 64;
        assert!(matches!(
            config.validate(),
            Err(StratoError::InvalidInput(_))
        ));

        config.cpu_cores = 4;
        config.memory_mb = 256;
        assert!(config.validate().is_err());
    }

    #[test]
    fn domain_xml_carries_vm_shape() {
        let mut config = VmConfig::new("web-1");
        config.cpu_cores = 4;
        config.memory_mb = 4096;
        config.network_name = Some("overlay0".into());
        let xml = build_domain_xml(&config, "/var/lib/strato/disks/abc.qcow2");

        assert!(xml.contains("<name>web-1</name>"));
        assert!(xml.contains("<memory unit='MiB'>4096</memory>"));
        assert!(xml.contains("arch='x86_64'"));
        assert!(xml.contains("network='overlay0'"));
    }

    #[test]
    fn block_targets_advance_alphabetically() {
        assert_eq!(next_block_target(0), "vda");
        assert_eq!(next_block_target(1), "vdb");
        assert_eq!(next_block_target(2), "vdc");
    }
}
