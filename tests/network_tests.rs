// Integration tests for elastic IPs and overlay networks
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use strato::StratoError;
use strato::config::TimeoutConfig;
use strato::fleet::{FleetRegistry, Host, HostStatus};
use strato::network::{ElasticIp, NetworkManager, OverlayHostStatus};
use strato::store::JsonStore;
use tempfile::TempDir;

// Hosts point at TEST-NET space so remote commands fail fast instead of
// reaching anything real.
fn unreachable_host(id: &str) -> Host {
    let mut host = Host::new(id, id, "192.0.2.1");
    host.key_path = Some("/root/.ssh/id_ed25519".to_string());
    host.status = HostStatus::Online;
    host
}

fn short_timeouts() -> TimeoutConfig {
    TimeoutConfig {
        probe_secs: 2,
        exec_secs: 2,
        file_copy_secs: 2,
        metrics_secs: 1,
    }
}

fn fleet_with(dir: &TempDir, hosts: Vec<Host>) -> Arc<FleetRegistry> {
    let mut map = BTreeMap::new();
    for host in hosts {
        map.insert(host.id.clone(), host);
    }
    JsonStore::new(dir.path().join("hosts.json"))
        .save(&map)
        .unwrap();
    Arc::new(FleetRegistry::load(dir.path(), short_timeouts()).unwrap())
}

fn attached_ip(ip: &str, vm_id: &str, host_id: &str) -> ElasticIp {
    let mut record = unattached_ip(ip);
    record.attached_to = Some(vm_id.to_string());
    record.host_id = Some(host_id.to_string());
    record.vm_address = Some("10.1.0.5".to_string());
    record
}

fn unattached_ip(ip: &str) -> ElasticIp {
    ElasticIp {
        ip: ip.to_string(),
        attached_to: None,
        host_id: None,
        vm_address: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
        extra: HashMap::new(),
    }
}

fn seed_ips(dir: &TempDir, ips: Vec<ElasticIp>) {
    let mut map = BTreeMap::new();
    for ip in ips {
        map.insert(ip.ip.clone(), ip);
    }
    JsonStore::new(dir.path().join("elastic_ips.json"))
        .save(&map)
        .unwrap();
}

#[test]
fn first_allocation_starts_the_pool() {
    let dir = TempDir::new().unwrap();
    let fleet = fleet_with(&dir, vec![]);
    let network = NetworkManager::load(dir.path(), fleet).unwrap();

    assert_eq!(network.allocate_elastic_ip().unwrap(), "10.100.0.1");
}

#[test]
fn allocation_prefers_reusing_unattached_ips() {
    let dir = TempDir::new().unwrap();
    seed_ips(
        &dir,
        vec![
            attached_ip("10.100.0.1", "vm-1", "h1"),
            unattached_ip("10.100.0.7"),
        ],
    );
    let fleet = fleet_with(&dir, vec![]);
    let network = NetworkManager::load(dir.path(), fleet).unwrap();

    assert_eq!(network.allocate_elastic_ip().unwrap(), "10.100.0.7");
}

#[tokio::test]
async fn second_attach_of_the_same_ip_conflicts() {
    let dir = TempDir::new().unwrap();
    seed_ips(&dir, vec![attached_ip("10.100.0.1", "vm-1", "h1")]);
    let fleet = fleet_with(&dir, vec![unreachable_host("h1"), unreachable_host("h2")]);
    let network = NetworkManager::load(dir.path(), fleet).unwrap();

    let err = network
        .attach_elastic_ip("10.100.0.1", "vm-2", "h2", "10.1.0.9")
        .await
        .unwrap_err();
    assert!(matches!(err, StratoError::Conflict(_)));

    // State still reflects the first attach only.
    let record = network.get_elastic_ip("10.100.0.1").unwrap();
    assert_eq!(record.attached_to.as_deref(), Some("vm-1"));
    assert_eq!(record.host_id.as_deref(), Some("h1"));
}

#[tokio::test]
async fn failed_attach_rolls_the_reservation_back() {
    let dir = TempDir::new().unwrap();
    seed_ips(&dir, vec![unattached_ip("10.100.0.1")]);
    let fleet = fleet_with(&dir, vec![unreachable_host("h1")]);
    let network = NetworkManager::load(dir.path(), fleet).unwrap();

    // The host is unreachable, so installing the NAT rule fails.
    let result = network
        .attach_elastic_ip("10.100.0.1", "vm-1", "h1", "10.1.0.5")
        .await;
    assert!(result.is_err());

    let record = network.get_elastic_ip("10.100.0.1").unwrap();
    assert!(record.attached_to.is_none());
    assert!(record.host_id.is_none());
}

#[tokio::test]
async fn detach_of_an_unattached_ip_is_a_no_op() {
    let dir = TempDir::new().unwrap();
    seed_ips(&dir, vec![unattached_ip("10.100.0.1")]);
    let fleet = fleet_with(&dir, vec![]);
    let network = NetworkManager::load(dir.path(), fleet).unwrap();

    network.detach_elastic_ip("10.100.0.1").await.unwrap();
    network.detach_elastic_ip("10.100.0.1").await.unwrap();

    let err = network.detach_elastic_ip("10.100.0.9").await.unwrap_err();
    assert!(matches!(err, StratoError::NotFound(_)));
}

#[tokio::test]
async fn overlay_records_per_host_failures_without_erroring() {
    let dir = TempDir::new().unwrap();
    let fleet = fleet_with(&dir, vec![unreachable_host("h1"), unreachable_host("h2")]);
    let network = NetworkManager::load(dir.path(), fleet).unwrap();

    let overlay = network
        .create_overlay("net1", Some("10.20.0.0/24"))
        .await
        .unwrap();

    assert_eq!(overlay.cidr, "10.20.0.0/24");
    assert_eq!(overlay.servers.len(), 2);
    for server in &overlay.servers {
        assert_eq!(server.status, OverlayHostStatus::Failed);
    }

    // The record survives a reload.
    let fleet = fleet_with(&dir, vec![]);
    let reloaded = NetworkManager::load(dir.path(), fleet).unwrap();
    assert_eq!(reloaded.get_overlay("net1").unwrap().servers.len(), 2);
}

#[tokio::test]
async fn duplicate_overlay_names_conflict() {
    let dir = TempDir::new().unwrap();
    let fleet = fleet_with(&dir, vec![unreachable_host("h1")]);
    let network = NetworkManager::load(dir.path(), fleet).unwrap();

    network
        .create_overlay("net1", Some("10.20.0.0/24"))
        .await
        .unwrap();
    let err = network
        .create_overlay("net1", Some("10.30.0.0/24"))
        .await
        .unwrap_err();
    assert!(matches!(err, StratoError::Conflict(_)));
}

#[tokio::test]
async fn overlay_cidr_is_validated_before_any_host_work() {
    let dir = TempDir::new().unwrap();
    let fleet = fleet_with(&dir, vec![]);
    let network = NetworkManager::load(dir.path(), fleet).unwrap();

    let err = network
        .create_overlay("bad", Some("8.8.0.0/24"))
        .await
        .unwrap_err();
    assert!(matches!(err, StratoError::InvalidInput(_)));

    let err = network
        .create_overlay("bad", Some("10.0.0.0/8"))
        .await
        .unwrap_err();
    assert!(matches!(err, StratoError::InvalidInput(_)));

    // Valid CIDR but no online hosts to configure.
    let err = network
        .create_overlay("net1", Some("10.20.0.0/24"))
        .await
        .unwrap_err();
    assert!(matches!(err, StratoError::NoCapacity(_)));
}

#[tokio::test]
async fn generated_overlay_cidrs_are_deterministic() {
    let dir = TempDir::new().unwrap();
    let fleet = fleet_with(&dir, vec![unreachable_host("h1")]);
    let network = NetworkManager::load(dir.path(), fleet).unwrap();

    let first = network.create_overlay("vpc-a", None).await.unwrap();
    assert_eq!(first.cidr, "10.1.0.0/16");
    let second = network.create_overlay("vpc-b", None).await.unwrap();
    assert_eq!(second.cidr, "10.2.0.0/16");
}

#[test]
fn network_metrics_summarize_pool_state() {
    let dir = TempDir::new().unwrap();
    seed_ips(
        &dir,
        vec![
            attached_ip("10.100.0.1", "vm-1", "h1"),
            unattached_ip("10.100.0.2"),
        ],
    );
    let fleet = fleet_with(&dir, vec![]);
    let network = NetworkManager::load(dir.path(), fleet).unwrap();

    let metrics = network.network_metrics();
    assert_eq!(metrics.total_elastic_ips, 2);
    assert_eq!(metrics.attached_elastic_ips, 1);
    assert_eq!(metrics.total_overlays, 0);
}
