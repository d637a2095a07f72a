// Integration tests for alerts and the monitoring engine
use chrono::{Duration, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use strato::StratoError;
use strato::config::TimeoutConfig;
use strato::fleet::{FleetRegistry, Host, HostStatus};
use strato::monitor::{AlertSeverity, AlertStore, Monitor};
use strato::network::NetworkManager;
use strato::storage::StorageManager;
use strato::store::JsonStore;
use strato::vm::VmManager;
use tempfile::TempDir;

#[test]
fn duplicate_breaches_produce_one_alert() {
    let dir = TempDir::new().unwrap();
    let store = AlertStore::load(dir.path()).unwrap();

    let first = store
        .raise(
            "High CPU usage on host h1",
            "CPU usage is 97.0%, which exceeds the threshold of 90%",
            AlertSeverity::Error,
            "server",
            "h1",
        )
        .unwrap();
    let second = store
        .raise(
            "High CPU usage on host h1",
            "CPU usage is 97.2%, which exceeds the threshold of 90%",
            AlertSeverity::Error,
            "server",
            "h1",
        )
        .unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(store.list(false).len(), 1);

    // A different resource gets its own alert.
    store
        .raise(
            "High CPU usage on host h2",
            "CPU usage is 96.0%, which exceeds the threshold of 90%",
            AlertSeverity::Error,
            "server",
            "h2",
        )
        .unwrap();
    assert_eq!(store.list(false).len(), 2);
}

#[test]
fn resolving_reopens_the_dedup_window() {
    let dir = TempDir::new().unwrap();
    let store = AlertStore::load(dir.path()).unwrap();

    let first = store
        .raise("High CPU usage on host h1", "97%", AlertSeverity::Error, "server", "h1")
        .unwrap();
    store.resolve(&first.id).unwrap();

    let second = store
        .raise("High CPU usage on host h1", "97%", AlertSeverity::Error, "server", "h1")
        .unwrap();
    assert_ne!(first.id, second.id);

    // Unresolved view shows only the new one.
    let open = store.list(false);
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].id, second.id);
    assert_eq!(store.list(true).len(), 2);
}

#[test]
fn resolve_and_acknowledge_lifecycle() {
    let dir = TempDir::new().unwrap();
    let store = AlertStore::load(dir.path()).unwrap();

    let alert = store
        .raise("Disk filling up", "93%", AlertSeverity::Warning, "storage", "h1")
        .unwrap();
    assert!(!alert.acknowledged);

    let alert = store.acknowledge(&alert.id).unwrap();
    assert!(alert.acknowledged);
    assert!(!alert.resolved);

    let alert = store.resolve(&alert.id).unwrap();
    assert!(alert.resolved);
    let resolved_at = alert.resolved_at.unwrap();

    // Resolving again is a no-op and keeps the original timestamp.
    let alert = store.resolve(&alert.id).unwrap();
    assert_eq!(alert.resolved_at.unwrap(), resolved_at);

    let err = store.resolve("missing").unwrap_err();
    assert!(matches!(err, StratoError::NotFound(_)));
}

#[test]
fn gc_drops_only_old_resolved_alerts() {
    let dir = TempDir::new().unwrap();
    let store = AlertStore::load(dir.path()).unwrap();

    let resolved = store
        .raise("High CPU usage on host h1", "97%", AlertSeverity::Error, "server", "h1")
        .unwrap();
    store.resolve(&resolved.id).unwrap();
    store
        .raise("High memory usage on host h1", "96%", AlertSeverity::Error, "server", "h1")
        .unwrap();

    // Cutoff in the past keeps everything.
    assert_eq!(store.gc(Utc::now() - Duration::days(7)).unwrap(), 0);

    // Cutoff in the future removes the resolved alert only.
    assert_eq!(store.gc(Utc::now() + Duration::days(1)).unwrap(), 1);
    let remaining = store.list(true);
    assert_eq!(remaining.len(), 1);
    assert!(!remaining[0].resolved);
}

#[test]
fn alerts_round_trip_through_disk() {
    let dir = TempDir::new().unwrap();
    let alert_id = {
        let store = AlertStore::load(dir.path()).unwrap();
        store
            .raise("High CPU usage on host h1", "97%", AlertSeverity::Error, "server", "h1")
            .unwrap()
            .id
    };

    let store = AlertStore::load(dir.path()).unwrap();
    let alert = store.get(&alert_id).unwrap();
    assert_eq!(alert.title, "High CPU usage on host h1");
    assert_eq!(alert.severity, AlertSeverity::Error);
}

fn build_monitor(dir: &TempDir, hosts: Vec<Host>) -> Arc<Monitor> {
    let mut map = BTreeMap::new();
    for host in hosts {
        map.insert(host.id.clone(), host);
    }
    JsonStore::new(dir.path().join("hosts.json"))
        .save(&map)
        .unwrap();

    let timeouts = TimeoutConfig {
        probe_secs: 2,
        exec_secs: 2,
        file_copy_secs: 2,
        metrics_secs: 1,
    };
    let fleet = Arc::new(FleetRegistry::load(dir.path(), timeouts).unwrap());
    let vms = Arc::new(VmManager::load(dir.path(), Arc::clone(&fleet)).unwrap());
    let network = Arc::new(NetworkManager::load(dir.path(), Arc::clone(&fleet)).unwrap());
    let storage = Arc::new(StorageManager::load(dir.path(), Arc::clone(&fleet)).unwrap());
    Arc::new(Monitor::load(dir.path(), fleet, vms, network, storage).unwrap())
}

#[tokio::test]
async fn empty_cluster_reports_healthy() {
    let dir = TempDir::new().unwrap();
    let monitor = build_monitor(&dir, vec![]);

    let health = monitor.cluster_health().await;
    assert_eq!(health.servers.total, 0);
    assert_eq!(health.vms.total, 0);
    assert_eq!(health.alerts.critical, 0);
    assert_eq!(format!("{:?}", health.status), "Healthy");
}

#[tokio::test]
async fn offline_hosts_degrade_cluster_health() {
    let dir = TempDir::new().unwrap();
    let mut host = Host::new("h1", "h1", "192.0.2.1");
    host.key_path = Some("/root/.ssh/id_ed25519".to_string());
    host.status = HostStatus::Offline;
    let monitor = build_monitor(&dir, vec![host]);

    let health = monitor.cluster_health().await;
    assert_eq!(health.servers.offline, 1);
    assert_eq!(health.servers.issues.len(), 1);
    assert_eq!(format!("{:?}", health.status), "Degraded");
}

#[tokio::test]
async fn critical_alerts_dominate_health() {
    let dir = TempDir::new().unwrap();
    let monitor = build_monitor(&dir, vec![]);

    monitor
        .alerts()
        .raise(
            "Host lost quorum",
            "manual intervention required",
            AlertSeverity::Critical,
            "server",
            "h1",
        )
        .unwrap();

    let health = monitor.cluster_health().await;
    assert_eq!(health.alerts.critical, 1);
    assert_eq!(format!("{:?}", health.status), "Critical");
}

#[tokio::test]
async fn run_once_collects_every_enabled_category() {
    let dir = TempDir::new().unwrap();
    let monitor = build_monitor(&dir, vec![]);

    monitor.run_once().await.unwrap();

    let history = monitor.history();
    assert_eq!(history.hosts.len(), 1);
    assert_eq!(history.vms.len(), 1);
    assert_eq!(history.network.len(), 1);
    assert_eq!(history.storage.len(), 1);

    // A second cycle appends.
    monitor.run_once().await.unwrap();
    assert_eq!(monitor.history().hosts.len(), 2);
}

#[tokio::test]
async fn export_writes_the_series_to_disk() {
    let dir = TempDir::new().unwrap();
    let monitor = build_monitor(&dir, vec![]);
    monitor.run_once().await.unwrap();

    let out = dir.path().join("export.json");
    monitor.export_metrics(&out).unwrap();
    let raw = std::fs::read_to_string(&out).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert!(parsed["hosts"].is_array());
    assert_eq!(parsed["hosts"].as_array().unwrap().len(), 1);
}
