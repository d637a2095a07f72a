// Integration tests for the storage coordinator
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use strato::StratoError;
use strato::config::TimeoutConfig;
use strato::fleet::{FleetRegistry, Host, HostStatus};
use strato::storage::{BackupJob, StorageManager, Volume, VolumeState};
use strato::store::JsonStore;
use tempfile::TempDir;

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

fn volume(id: &str, state: VolumeState, attached_to: Option<&str>) -> Volume {
    Volume {
        id: id.to_string(),
        name: format!("vol-{}", id),
        size_gb: 10,
        host_id: Some("h1".to_string()),
        replica_host_id: None,
        attached_to: attached_to.map(|s| s.to_string()),
        attached_host_id: attached_to.map(|_| "h1".to_string()),
        replicated: false,
        state,
        created_at: Utc::now(),
        updated_at: Utc::now(),
        extra: HashMap::new(),
    }
}

fn seed_volumes(dir: &TempDir, volumes: Vec<Volume>) {
    let mut map = BTreeMap::new();
    for v in volumes {
        map.insert(v.id.clone(), v);
    }
    JsonStore::new(dir.path().join("volumes.json"))
        .save(&map)
        .unwrap();
}

fn seed_backup(dir: &TempDir, backup_id: &str, volume_id: &str) {
    let mut map = BTreeMap::new();
    map.insert(
        backup_id.to_string(),
        BackupJob {
            id: backup_id.to_string(),
            name: "nightly".to_string(),
            volume_id: volume_id.to_string(),
            volume_name: format!("vol-{}", volume_id),
            host_id: "h1".to_string(),
            status: "completed".to_string(),
            size_gb: 10,
            created_at: Utc::now(),
            completed_at: Some(Utc::now()),
            extra: HashMap::new(),
        },
    );
    JsonStore::new(dir.path().join("backup_jobs.json"))
        .save(&map)
        .unwrap();
}

#[tokio::test]
async fn create_without_capacity_is_refused() {
    let dir = TempDir::new().unwrap();
    let fleet = fleet_with(&dir, vec![]);
    let storage = StorageManager::load(dir.path(), fleet).unwrap();

    let err = storage.create_volume("data", 10, false).await.unwrap_err();
    assert!(matches!(err, StratoError::NoCapacity(_)));

    let err = storage.create_volume("data", 5000, false).await.unwrap_err();
    assert!(matches!(err, StratoError::InvalidInput(_)));
}

#[tokio::test]
async fn attached_volumes_cannot_be_deleted() {
    let dir = TempDir::new().unwrap();
    seed_volumes(&dir, vec![volume("v1", VolumeState::Attached, Some("vm-1"))]);
    let fleet = fleet_with(&dir, vec![unreachable_host("h1")]);
    let storage = StorageManager::load(dir.path(), fleet).unwrap();

    let err = storage.delete_volume("v1").await.unwrap_err();
    assert!(matches!(err, StratoError::Conflict(_)));
    assert!(storage.get_volume("v1").is_ok());
}

#[tokio::test]
async fn attach_requires_an_available_volume() {
    let dir = TempDir::new().unwrap();
    seed_volumes(
        &dir,
        vec![
            volume("busy", VolumeState::Attached, Some("vm-1")),
            volume("mid", VolumeState::Attaching, None),
        ],
    );
    let fleet = fleet_with(&dir, vec![unreachable_host("h1")]);
    let storage = StorageManager::load(dir.path(), fleet).unwrap();

    let err = storage.attach_volume("busy", "vm-2", "h1").await.unwrap_err();
    assert!(matches!(err, StratoError::Conflict(_)));

    let err = storage.attach_volume("mid", "vm-2", "h1").await.unwrap_err();
    assert!(matches!(err, StratoError::Conflict(_)));

    let err = storage.attach_volume("nope", "vm-2", "h1").await.unwrap_err();
    assert!(matches!(err, StratoError::NotFound(_)));
}

#[tokio::test]
async fn failed_attach_reverts_to_available() {
    let dir = TempDir::new().unwrap();
    seed_volumes(&dir, vec![volume("v1", VolumeState::Available, None)]);
    let fleet = fleet_with(&dir, vec![unreachable_host("h1")]);
    let storage = StorageManager::load(dir.path(), fleet).unwrap();

    // The host is unreachable so the block plumbing fails mid-attach.
    let result = storage.attach_volume("v1", "vm-1", "h1").await;
    assert!(result.is_err());

    let record = storage.get_volume("v1").unwrap();
    assert_eq!(record.state, VolumeState::Available);
    assert!(record.attached_to.is_none());
}

#[tokio::test]
async fn detach_of_an_available_volume_is_a_no_op() {
    let dir = TempDir::new().unwrap();
    seed_volumes(&dir, vec![volume("v1", VolumeState::Available, None)]);
    let fleet = fleet_with(&dir, vec![unreachable_host("h1")]);
    let storage = StorageManager::load(dir.path(), fleet).unwrap();

    storage.detach_volume("v1").await.unwrap();
    let record = storage.get_volume("v1").unwrap();
    assert_eq!(record.state, VolumeState::Available);
}

#[tokio::test]
async fn failed_detach_stays_attached() {
    let dir = TempDir::new().unwrap();
    seed_volumes(&dir, vec![volume("v1", VolumeState::Attached, Some("vm-1"))]);
    let fleet = fleet_with(&dir, vec![unreachable_host("h1")]);
    let storage = StorageManager::load(dir.path(), fleet).unwrap();

    let result = storage.detach_volume("v1").await;
    assert!(result.is_err());

    let record = storage.get_volume("v1").unwrap();
    assert_eq!(record.state, VolumeState::Attached);
    assert_eq!(record.attached_to.as_deref(), Some("vm-1"));
}

#[tokio::test]
async fn resize_preconditions() {
    let dir = TempDir::new().unwrap();
    seed_volumes(
        &dir,
        vec![
            volume("attached", VolumeState::Attached, Some("vm-1")),
            volume("free", VolumeState::Available, None),
        ],
    );
    let fleet = fleet_with(&dir, vec![unreachable_host("h1")]);
    let storage = StorageManager::load(dir.path(), fleet).unwrap();

    let err = storage.resize_volume("attached", 20).await.unwrap_err();
    assert!(matches!(err, StratoError::Conflict(_)));

    // Must strictly grow.
    let err = storage.resize_volume("free", 10).await.unwrap_err();
    assert!(matches!(err, StratoError::InvalidInput(_)));
    let err = storage.resize_volume("free", 5).await.unwrap_err();
    assert!(matches!(err, StratoError::InvalidInput(_)));

    // Valid target size but the host is unreachable; size is unchanged.
    assert!(storage.resize_volume("free", 20).await.is_err());
    assert_eq!(storage.get_volume("free").unwrap().size_gb, 10);
}

#[tokio::test]
async fn restore_requires_a_detached_target() {
    let dir = TempDir::new().unwrap();
    seed_volumes(&dir, vec![volume("v1", VolumeState::Attached, Some("vm-1"))]);
    seed_backup(&dir, "b1", "v1");
    let fleet = fleet_with(&dir, vec![unreachable_host("h1")]);
    let storage = StorageManager::load(dir.path(), fleet).unwrap();

    let err = storage.restore_backup("b1", None).await.unwrap_err();
    assert!(matches!(err, StratoError::Conflict(_)));

    let err = storage.restore_backup("missing", None).await.unwrap_err();
    assert!(matches!(err, StratoError::NotFound(_)));
}

#[test]
fn backup_listing_filters_by_volume() {
    let dir = TempDir::new().unwrap();
    seed_backup(&dir, "b1", "v1");
    let fleet = fleet_with(&dir, vec![]);
    let storage = StorageManager::load(dir.path(), fleet).unwrap();

    assert_eq!(storage.list_backups(None).len(), 1);
    assert_eq!(storage.list_backups(Some("v1")).len(), 1);
    assert!(storage.list_backups(Some("other")).is_empty());
}

#[test]
fn storage_state_round_trips_through_disk() {
    let dir = TempDir::new().unwrap();
    seed_volumes(
        &dir,
        vec![
            volume("v1", VolumeState::Attached, Some("vm-1")),
            volume("v2", VolumeState::Available, None),
        ],
    );
    let fleet = fleet_with(&dir, vec![]);
    let storage = StorageManager::load(dir.path(), fleet).unwrap();

    let volumes = storage.list_volumes();
    assert_eq!(volumes.len(), 2);

    let metrics = storage.storage_metrics();
    assert_eq!(metrics.total_volumes, 2);
    assert_eq!(metrics.attached_volumes, 1);
    assert_eq!(metrics.total_volume_size_gb, 20);

    // Attached volumes always carry their VM; available ones never do.
    for v in volumes {
        assert_eq!(v.state == VolumeState::Attached, v.attached_to.is_some());
    }
}
