use crate::{
    Result, StratoError,
    fleet::{FleetRegistry, HostStatus},
    log_debug, log_error, log_info, log_warn,
    network::{NetworkManager, NetworkMetricsSummary},
    storage::{StorageManager, StorageMetricsSummary},
    store::JsonStore,
    vm::{VmManager, VmState, short_id},
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Warning => "warning",
            AlertSeverity::Error => "error",
            AlertSeverity::Critical => "critical",
        };
        write!(f, "{}", s)
    }
}

/// Severity of a plain threshold breach. Critical is never derived this
/// way; explicit rules assign it.
pub fn threshold_severity(value: f64) -> AlertSeverity {
    if value < 95.0 {
        AlertSeverity::Warning
    } else {
        AlertSeverity::Error
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub title: String,
    pub message: String,
    pub severity: AlertSeverity,
    pub resource_type: String,
    pub resource_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub acknowledged: bool,
    #[serde(default)]
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// Persisted alert set with deduplication on
/// `(resource_type, resource_id, title)` among unresolved alerts.
pub struct AlertStore {
    alerts: Mutex<HashMap<String, Alert>>,
    store: JsonStore,
}

impl AlertStore {
    pub fn load(data_dir: &Path) -> Result<Self> {
        let store = JsonStore::new(data_dir.join("alerts.json"));
        let alerts: HashMap<String, Alert> = store.load()?;
        Ok(Self {
            alerts: Mutex::new(alerts),
            store,
        })
    }

    /// Create an alert unless an unresolved one with the same key already
    /// exists, in which case that one is returned unchanged.
    pub fn raise(
        &self,
        title: &str,
        message: &str,
        severity: AlertSeverity,
        resource_type: &str,
        resource_id: &str,
    ) -> Result<Alert> {
        let mut alerts = self.alerts.lock().unwrap();

        if let Some(existing) = alerts.values().find(|a| {
            a.resource_type == resource_type
                && a.resource_id == resource_id
                && a.title == title
                && !a.resolved
        }) {
            return Ok(existing.clone());
        }

        let alert = Alert {
            id: short_id(),
            title: title.to_string(),
            message: message.to_string(),
            severity,
            resource_type: resource_type.to_string(),
            resource_id: resource_id.to_string(),
            timestamp: Utc::now(),
            acknowledged: false,
            resolved: false,
            resolved_at: None,
            extra: HashMap::new(),
        };
        alerts.insert(alert.id.clone(), alert.clone());
        self.store.save(&*alerts)?;
        log_info!("Created alert: {}", title);
        Ok(alert)
    }

    pub fn acknowledge(&self, alert_id: &str) -> Result<Alert> {
        let mut alerts = self.alerts.lock().unwrap();
        let alert = alerts
            .get_mut(alert_id)
            .ok_or_else(|| StratoError::NotFound(format!("alert {}", alert_id)))?;
        alert.acknowledged = true;
        let snapshot = alert.clone();
        self.store.save(&*alerts)?;
        Ok(snapshot)
    }

    /// Resolve an alert; resolving twice is a no-op.
    pub fn resolve(&self, alert_id: &str) -> Result<Alert> {
        let mut alerts = self.alerts.lock().unwrap();
        let alert = alerts
            .get_mut(alert_id)
            .ok_or_else(|| StratoError::NotFound(format!("alert {}", alert_id)))?;
        if !alert.resolved {
            alert.resolved = true;
            alert.resolved_at = Some(Utc::now());
        }
        let snapshot = alert.clone();
        self.store.save(&*alerts)?;
        Ok(snapshot)
    }

    pub fn get(&self, alert_id: &str) -> Result<Alert> {
        self.alerts
            .lock()
            .unwrap()
            .get(alert_id)
            .cloned()
            .ok_or_else(|| StratoError::NotFound(format!("alert {}", alert_id)))
    }

    /// Alerts sorted newest first.
    pub fn list(&self, include_resolved: bool) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = self
            .alerts
            .lock()
            .unwrap()
            .values()
            .filter(|a| include_resolved || !a.resolved)
            .cloned()
            .collect();
        alerts.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        alerts
    }

    pub fn unresolved_counts(&self) -> AlertCounts {
        let alerts = self.alerts.lock().unwrap();
        let mut counts = AlertCounts::default();
        for alert in alerts.values().filter(|a| !a.resolved) {
            match alert.severity {
                AlertSeverity::Info => counts.info += 1,
                AlertSeverity::Warning => counts.warning += 1,
                AlertSeverity::Error => counts.error += 1,
                AlertSeverity::Critical => counts.critical += 1,
            }
        }
        counts
    }

    /// Drop resolved alerts older than the cutoff. Returns how many went.
    pub fn gc(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut alerts = self.alerts.lock().unwrap();
        let before = alerts.len();
        alerts.retain(|_, a| !(a.resolved && a.resolved_at.map(|t| t < cutoff).unwrap_or(false)));
        let removed = before - alerts.len();
        if removed > 0 {
            self.store.save(&*alerts)?;
        }
        Ok(removed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertThresholds {
    #[serde(default = "default_threshold")]
    pub server_cpu_usage: f64,
    #[serde(default = "default_threshold")]
    pub server_memory_usage: f64,
    #[serde(default = "default_threshold")]
    pub server_disk_usage: f64,
    #[serde(default = "default_threshold")]
    pub vm_cpu_usage: f64,
    #[serde(default = "default_threshold")]
    pub vm_memory_usage: f64,
    #[serde(default = "default_threshold")]
    pub vm_disk_usage: f64,
    #[serde(default = "default_threshold")]
    pub network_bandwidth_usage: f64,
    #[serde(default = "default_threshold")]
    pub storage_usage: f64,
}

fn default_threshold() -> f64 {
    90.0
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            server_cpu_usage: default_threshold(),
            server_memory_usage: default_threshold(),
            server_disk_usage: default_threshold(),
            vm_cpu_usage: default_threshold(),
            vm_memory_usage: default_threshold(),
            vm_disk_usage: default_threshold(),
            network_bandwidth_usage: default_threshold(),
            storage_usage: default_threshold(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EnabledCollectors {
    #[serde(default = "default_true")]
    pub server: bool,
    #[serde(default = "default_true")]
    pub vm: bool,
    #[serde(default = "default_true")]
    pub network: bool,
    #[serde(default = "default_true")]
    pub storage: bool,
}

fn default_true() -> bool {
    true
}

impl Default for EnabledCollectors {
    fn default() -> Self {
        Self {
            server: true,
            vm: true,
            network: true,
            storage: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    #[serde(default = "default_interval")]
    pub collection_interval_seconds: u64,
    #[serde(default = "default_retention_days")]
    pub metrics_retention_days: i64,
    #[serde(default)]
    pub alert_thresholds: AlertThresholds,
    #[serde(default)]
    pub enabled_monitors: EnabledCollectors,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

fn default_interval() -> u64 {
    60
}
fn default_retention_days() -> i64 {
    7
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            collection_interval_seconds: default_interval(),
            metrics_retention_days: default_retention_days(),
            alert_thresholds: AlertThresholds::default(),
            enabled_monitors: EnabledCollectors::default(),
            extra: HashMap::new(),
        }
    }
}

// Per-tick snapshots appended to the in-memory rolling series.

#[derive(Debug, Clone, Serialize)]
pub struct HostSample {
    pub id: String,
    pub name: String,
    pub status: HostStatus,
    pub cpu_usage: Option<f64>,
    pub memory_usage_pct: Option<f64>,
    pub disk_usage_pct: Option<f64>,
    pub network_rx_bytes: Option<u64>,
    pub network_tx_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FleetSnapshot {
    pub timestamp: DateTime<Utc>,
    pub total: usize,
    pub online: usize,
    pub offline: usize,
    pub total_cpu_cores: u32,
    pub total_memory_mb: u64,
    pub total_disk_gb: u64,
    pub used_cpu_cores: f64,
    pub used_memory_mb: u64,
    pub used_disk_gb: u64,
    pub hosts: Vec<HostSample>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VmSample {
    pub id: String,
    pub name: String,
    pub state: VmState,
    pub cpu_usage: Option<f64>,
    pub memory_usage: Option<f64>,
    pub disk_usage: HashMap<String, f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VmsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub total: usize,
    pub running: usize,
    pub stopped: usize,
    pub error: usize,
    pub total_allocated_cpu: u32,
    pub total_allocated_memory_mb: u64,
    pub vms: Vec<VmSample>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkSnapshot {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub summary: NetworkMetricsSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct StorageSnapshot {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub summary: StorageMetricsSummary,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct MetricsHistory {
    pub hosts: Vec<FleetSnapshot>,
    pub vms: Vec<VmsSnapshot>,
    pub network: Vec<NetworkSnapshot>,
    pub storage: Vec<StorageSnapshot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
}

#[derive(Debug, Clone, Copy, Serialize, Default)]
pub struct AlertCounts {
    pub critical: usize,
    pub error: usize,
    pub warning: usize,
    pub info: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterHealth {
    pub status: HealthStatus,
    pub servers: ServerHealth,
    pub vms: VmHealth,
    pub storage: StorageHealth,
    pub networks: NetworkHealth,
    pub alerts: AlertCounts,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct ServerHealth {
    pub total: usize,
    pub online: usize,
    pub offline: usize,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct VmHealth {
    pub total: usize,
    pub running: usize,
    pub stopped: usize,
    pub error: usize,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct StorageHealth {
    pub volumes: usize,
    pub usage_percent: f64,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct NetworkHealth {
    pub vpcs: usize,
}

/// Top-level status from the aggregates: any unresolved critical alert is
/// critical; error alerts or offline hosts degrade; otherwise healthy.
pub fn derive_health_status(alerts: &AlertCounts, offline_hosts: usize) -> HealthStatus {
    if alerts.critical > 0 {
        HealthStatus::Critical
    } else if alerts.error > 0 || offline_hosts > 0 {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

/// Background collector and alert engine over the fleet, VM, network and
/// storage coordinators. Reads are non-mutating snapshots; the monitor
/// never holds a coordinator lock across a remote call.
pub struct Monitor {
    fleet: Arc<FleetRegistry>,
    vms: Arc<VmManager>,
    network: Arc<NetworkManager>,
    storage: Arc<StorageManager>,
    config: Mutex<MonitoringConfig>,
    alerts: AlertStore,
    history: Mutex<MetricsHistory>,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
}

impl Monitor {
    pub fn load(
        data_dir: &Path,
        fleet: Arc<FleetRegistry>,
        vms: Arc<VmManager>,
        network: Arc<NetworkManager>,
        storage: Arc<StorageManager>,
    ) -> Result<Self> {
        let config_store = JsonStore::new(data_dir.join("monitoring_config.json"));
        let config: MonitoringConfig = config_store.load()?;
        if !config_store.path().exists() {
            config_store.save(&config)?;
        }
        let alerts = AlertStore::load(data_dir)?;
        Ok(Self {
            fleet,
            vms,
            network,
            storage,
            config: Mutex::new(config),
            alerts,
            history: Mutex::new(MetricsHistory::default()),
            stop_tx: Mutex::new(None),
        })
    }

    pub fn config(&self) -> MonitoringConfig {
        self.config.lock().unwrap().clone()
    }

    pub fn alerts(&self) -> &AlertStore {
        &self.alerts
    }

    pub fn history(&self) -> MetricsHistory {
        self.history.lock().unwrap().clone()
    }

    /// Spawn the collection loop. Errors never kill the loop; a failed
    /// cycle waits ten seconds instead of the full interval.
    pub fn start(self: Arc<Self>) {
        let mut guard = self.stop_tx.lock().unwrap();
        if guard.is_some() {
            log_warn!("Monitoring already active");
            return;
        }
        let (tx, mut rx) = watch::channel(false);
        *guard = Some(tx);
        drop(guard);

        let monitor = Arc::clone(&self);
        tokio::spawn(async move {
            log_info!("Started cluster monitoring");
            loop {
                let wait = match monitor.run_once().await {
                    Ok(()) => {
                        Duration::from_secs(monitor.config().collection_interval_seconds)
                    }
                    Err(e) => {
                        log_error!("Error in monitoring loop: {}", e);
                        Duration::from_secs(10)
                    }
                };
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = rx.changed() => break,
                }
            }
            log_info!("Stopped cluster monitoring");
        });
    }

    pub fn stop(&self) {
        if let Some(tx) = self.stop_tx.lock().unwrap().take() {
            let _ = tx.send(true);
        }
    }

    /// One collection cycle: refresh sources, append snapshots, evaluate
    /// thresholds, trim old data. A failing collector drops that cycle's
    /// sample for its category only.
    pub async fn run_once(&self) -> Result<()> {
        let config = self.config();
        let timestamp = Utc::now();

        if config.enabled_monitors.server {
            self.fleet.probe_all().await;
            let snapshot = self.collect_fleet(timestamp);
            self.history.lock().unwrap().hosts.push(snapshot);
        }

        if config.enabled_monitors.vm {
            match self.collect_vms(timestamp).await {
                Ok(snapshot) => self.history.lock().unwrap().vms.push(snapshot),
                Err(e) => log_error!("Error collecting VM metrics: {}", e),
            }
        }

        if config.enabled_monitors.network {
            let snapshot = NetworkSnapshot {
                timestamp,
                summary: self.network.network_metrics(),
            };
            self.history.lock().unwrap().network.push(snapshot);
        }

        if config.enabled_monitors.storage {
            let snapshot = StorageSnapshot {
                timestamp,
                summary: self.storage.storage_metrics(),
            };
            self.history.lock().unwrap().storage.push(snapshot);
        }

        self.check_alert_conditions(&config).await;
        self.cleanup_old_data(&config)?;
        Ok(())
    }

    fn collect_fleet(&self, timestamp: DateTime<Utc>) -> FleetSnapshot {
        let hosts = self.fleet.list();
        let mut snapshot = FleetSnapshot {
            timestamp,
            total: hosts.len(),
            online: 0,
            offline: 0,
            total_cpu_cores: 0,
            total_memory_mb: 0,
            total_disk_gb: 0,
            used_cpu_cores: 0.0,
            used_memory_mb: 0,
            used_disk_gb: 0,
            hosts: Vec::with_capacity(hosts.len()),
        };

        for host in hosts {
            if host.status == HostStatus::Online {
                snapshot.online += 1;
                snapshot.total_cpu_cores += host.cpu_cores;
                snapshot.total_memory_mb += host.memory_mb;
                snapshot.total_disk_gb += host.disk_gb;
            } else {
                snapshot.offline += 1;
            }

            let metrics = host.latest_metrics();
            if let (HostStatus::Online, Some(m)) = (host.status, metrics) {
                snapshot.used_cpu_cores += host.cpu_cores as f64 * m.cpu_usage / 100.0;
                snapshot.used_memory_mb += m.memory_used_mb;
                snapshot.used_disk_gb += m.disk_used_gb;
            }

            snapshot.hosts.push(HostSample {
                id: host.id.clone(),
                name: host.name.clone(),
                status: host.status,
                cpu_usage: metrics.map(|m| m.cpu_usage),
                memory_usage_pct: metrics.map(|m| {
                    percent(m.memory_used_mb as f64, host.memory_mb as f64)
                }),
                disk_usage_pct: metrics
                    .map(|m| percent(m.disk_used_gb as f64, host.disk_gb as f64)),
                network_rx_bytes: metrics.map(|m| m.network_rx_bytes),
                network_tx_bytes: metrics.map(|m| m.network_tx_bytes),
            });
        }

        snapshot
    }

    async fn collect_vms(&self, timestamp: DateTime<Utc>) -> Result<VmsSnapshot> {
        let vms = self.vms.list().await;
        let mut snapshot = VmsSnapshot {
            timestamp,
            total: vms.len(),
            running: 0,
            stopped: 0,
            error: 0,
            total_allocated_cpu: 0,
            total_allocated_memory_mb: 0,
            vms: Vec::with_capacity(vms.len()),
        };

        for vm in vms {
            let mut sample = VmSample {
                id: vm.id.clone(),
                name: vm.name.clone(),
                state: vm.state,
                cpu_usage: None,
                memory_usage: None,
                disk_usage: HashMap::new(),
            };

            match vm.state {
                VmState::Running => {
                    snapshot.running += 1;
                    snapshot.total_allocated_cpu += vm.config.cpu_cores;
                    snapshot.total_allocated_memory_mb += vm.config.memory_mb;
                    match self.vms.metrics(&vm.id).await {
                        Ok(m) => {
                            sample.cpu_usage = Some(m.cpu_usage);
                            sample.memory_usage = Some(m.memory_usage);
                            sample.disk_usage = m.disk_usage;
                        }
                        Err(e) => {
                            log_debug!("No metrics for VM {} this cycle: {}", vm.id, e)
                        }
                    }
                }
                VmState::Stopped => {
                    snapshot.stopped += 1;
                    snapshot.total_allocated_cpu += vm.config.cpu_cores;
                    snapshot.total_allocated_memory_mb += vm.config.memory_mb;
                }
                _ => snapshot.error += 1,
            }

            snapshot.vms.push(sample);
        }

        Ok(snapshot)
    }

    async fn check_alert_conditions(&self, config: &MonitoringConfig) {
        if config.enabled_monitors.server {
            self.check_host_alerts(&config.alert_thresholds);
        }
        if config.enabled_monitors.vm {
            self.check_vm_alerts(&config.alert_thresholds).await;
        }
        if config.enabled_monitors.storage {
            self.check_storage_alerts(&config.alert_thresholds);
        }
        // Network bandwidth has a configurable threshold but no reliable
        // capacity baseline to evaluate against; see DESIGN.md.
    }

    fn check_host_alerts(&self, thresholds: &AlertThresholds) {
        for host in self.fleet.list() {
            if host.status != HostStatus::Online {
                continue;
            }
            let Some(m) = host.latest_metrics() else {
                continue;
            };

            if m.cpu_usage >= thresholds.server_cpu_usage {
                self.raise_usage_alert(
                    &format!("High CPU usage on host {}", host.name),
                    "CPU",
                    m.cpu_usage,
                    thresholds.server_cpu_usage,
                    "server",
                    &host.id,
                );
            }

            let memory_pct = percent(m.memory_used_mb as f64, host.memory_mb as f64);
            if memory_pct >= thresholds.server_memory_usage {
                self.raise_usage_alert(
                    &format!("High memory usage on host {}", host.name),
                    "Memory",
                    memory_pct,
                    thresholds.server_memory_usage,
                    "server",
                    &host.id,
                );
            }

            let disk_pct = percent(m.disk_used_gb as f64, host.disk_gb as f64);
            if disk_pct >= thresholds.server_disk_usage {
                self.raise_usage_alert(
                    &format!("High disk usage on host {}", host.name),
                    "Disk",
                    disk_pct,
                    thresholds.server_disk_usage,
                    "server",
                    &host.id,
                );
            }
        }
    }

    async fn check_vm_alerts(&self, thresholds: &AlertThresholds) {
        for vm in self.vms.list().await {
            if vm.state != VmState::Running {
                continue;
            }
            let metrics = match self.vms.metrics(&vm.id).await {
                Ok(metrics) => metrics,
                Err(e) => {
                    log_debug!("Skipping alert checks for VM {}: {}", vm.id, e);
                    continue;
                }
            };

            if metrics.cpu_usage >= thresholds.vm_cpu_usage {
                self.raise_usage_alert(
                    &format!("High CPU usage on VM {}", vm.name),
                    "CPU",
                    metrics.cpu_usage,
                    thresholds.vm_cpu_usage,
                    "vm",
                    &vm.id,
                );
            }
            if metrics.memory_usage >= thresholds.vm_memory_usage {
                self.raise_usage_alert(
                    &format!("High memory usage on VM {}", vm.name),
                    "Memory",
                    metrics.memory_usage,
                    thresholds.vm_memory_usage,
                    "vm",
                    &vm.id,
                );
            }
            for (device, usage) in &metrics.disk_usage {
                if *usage >= thresholds.vm_disk_usage {
                    self.raise_usage_alert(
                        &format!("High disk usage on VM {}", vm.name),
                        &format!("Disk {}", device),
                        *usage,
                        thresholds.vm_disk_usage,
                        "vm",
                        &vm.id,
                    );
                }
            }
        }
    }

    fn check_storage_alerts(&self, thresholds: &AlertThresholds) {
        let summary = self.storage.storage_metrics();
        for host in &summary.per_host {
            let usage = percent(host.disk_used_gb as f64, host.disk_total_gb as f64);
            if usage >= thresholds.storage_usage {
                self.raise_usage_alert(
                    &format!("High storage usage on host {}", host.host_id),
                    "Storage",
                    usage,
                    thresholds.storage_usage,
                    "storage",
                    &host.host_id,
                );
            }
        }
    }

    fn raise_usage_alert(
        &self,
        title: &str,
        axis: &str,
        value: f64,
        threshold: f64,
        resource_type: &str,
        resource_id: &str,
    ) {
        let message = format!(
            "{} usage is {:.1}%, which exceeds the threshold of {:.0}%",
            axis, value, threshold
        );
        if let Err(e) = self.alerts.raise(
            title,
            &message,
            threshold_severity(value),
            resource_type,
            resource_id,
        ) {
            log_error!("Error recording alert: {}", e);
        }
    }

    fn cleanup_old_data(&self, config: &MonitoringConfig) -> Result<()> {
        let cutoff = Utc::now() - ChronoDuration::days(config.metrics_retention_days);

        let mut history = self.history.lock().unwrap();
        history.hosts.retain(|s| s.timestamp > cutoff);
        history.vms.retain(|s| s.timestamp > cutoff);
        history.network.retain(|s| s.timestamp > cutoff);
        history.storage.retain(|s| s.timestamp > cutoff);
        drop(history);

        let removed = self.alerts.gc(cutoff)?;
        if removed > 0 {
            log_debug!("Garbage-collected {} resolved alerts", removed);
        }
        Ok(())
    }

    /// Write the full in-memory series out as one JSON document.
    pub fn export_metrics(&self, path: &Path) -> Result<()> {
        let history = self.history();
        let store = JsonStore::new(path);
        store.save(&history)?;
        log_info!("Exported metrics to {}", path.display());
        Ok(())
    }

    /// Aggregate cluster health across all coordinators.
    pub async fn cluster_health(&self) -> ClusterHealth {
        let mut servers = ServerHealth::default();
        for host in self.fleet.list() {
            servers.total += 1;
            if host.status == HostStatus::Online {
                servers.online += 1;
            } else {
                servers.offline += 1;
                servers
                    .issues
                    .push(format!("Host {} is {}", host.name, host.status));
            }
        }

        let mut vms = VmHealth::default();
        for vm in self.vms.list().await {
            vms.total += 1;
            match vm.state {
                VmState::Running => vms.running += 1,
                VmState::Stopped => vms.stopped += 1,
                state => {
                    vms.error += 1;
                    vms.issues.push(format!("VM {} is in {} state", vm.name, state));
                }
            }
        }

        let summary = self.storage.storage_metrics();
        let mut storage = StorageHealth {
            volumes: summary.total_volumes,
            usage_percent: 0.0,
            issues: Vec::new(),
        };
        let total_disk: u64 = summary.per_host.iter().map(|h| h.disk_total_gb).sum();
        let used_disk: u64 = summary.per_host.iter().map(|h| h.disk_used_gb).sum();
        if total_disk > 0 {
            storage.usage_percent = percent(used_disk as f64, total_disk as f64);
            if storage.usage_percent >= 90.0 {
                storage.issues.push(format!(
                    "Cluster storage usage is high: {:.1}%",
                    storage.usage_percent
                ));
            }
        }

        let networks = NetworkHealth {
            vpcs: self.network.list_overlays().len(),
        };

        let alerts = self.alerts.unresolved_counts();
        let status = derive_health_status(&alerts, servers.offline);

        ClusterHealth {
            status,
            servers,
            vms,
            storage,
            networks,
            alerts,
            timestamp: Utc::now(),
        }
    }
}

fn percent(used: f64, total: f64) -> f64 {
    if total > 0.0 { used / total * 100.0 } else { 0.0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_splits_at_95_percent() {
        assert_eq!(threshold_severity(90.0), AlertSeverity::Warning);
        assert_eq!(threshold_severity(94.9), AlertSeverity::Warning);
        assert_eq!(threshold_severity(95.0), AlertSeverity::Error);
        assert_eq!(threshold_severity(97.0), AlertSeverity::Error);
    }

    #[test]
    fn health_status_derivation() {
        let mut counts = AlertCounts::default();
        assert_eq!(derive_health_status(&counts, 0), HealthStatus::Healthy);

        assert_eq!(derive_health_status(&counts, 1), HealthStatus::Degraded);

        counts.error = 2;
        assert_eq!(derive_health_status(&counts, 0), HealthStatus::Degraded);

        counts.critical = 1;
        assert_eq!(derive_health_status(&counts, 0), HealthStatus::Critical);
    }

    #[test]
    fn monitoring_config_defaults() {
        let config: MonitoringConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.collection_interval_seconds, 60);
        assert_eq!(config.metrics_retention_days, 7);
        assert_eq!(config.alert_thresholds.server_cpu_usage, 90.0);
        assert!(config.enabled_monitors.storage);
    }

    #[test]
    fn unknown_config_fields_survive_round_trip() {
        let raw = r#"{"collection_interval_seconds": 30, "future_knob": {"a": 1}}"#;
        let config: MonitoringConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.collection_interval_seconds, 30);
        let out = serde_json::to_value(&config).unwrap();
        assert_eq!(out["future_knob"]["a"], 1);
    }
}
