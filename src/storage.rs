use crate::{
    Result, StratoError,
    config::limits,
    fleet::{FleetRegistry, Host},
    log_error, log_info, log_warn,
    store::JsonStore,
    vm::short_id,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};

pub const VOLUME_DIR: &str = "/var/lib/strato/volumes";
pub const BACKUP_DIR: &str = "/var/lib/strato/backups";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VolumeState {
    #[default]
    Available,
    Attaching,
    Attached,
    Detaching,
}

impl std::fmt::Display for VolumeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VolumeState::Available => "available",
            VolumeState::Attaching => "attaching",
            VolumeState::Attached => "attached",
            VolumeState::Detaching => "detaching",
        };
        write!(f, "{}", s)
    }
}

/// A host-resident block device, optionally mirrored on a second host.
/// `attached_to` is set exactly when `state` is `attached`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    pub id: String,
    pub name: String,
    pub size_gb: u64,
    pub host_id: Option<String>,
    pub replica_host_id: Option<String>,
    pub attached_to: Option<String>,
    /// Host the consuming VM lived on at attach time; remote plumbing is
    /// torn down there on detach.
    pub attached_host_id: Option<String>,
    #[serde(default)]
    pub replicated: bool,
    #[serde(default)]
    pub state: VolumeState,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl Volume {
    pub fn path(&self) -> String {
        format!("{}/{}.qcow2", VOLUME_DIR, self.id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupJob {
    pub id: String,
    pub name: String,
    pub volume_id: String,
    pub volume_name: String,
    pub host_id: String,
    pub status: String,
    pub size_gb: u64,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl BackupJob {
    pub fn path(&self) -> String {
        format!("{}/{}.qcow2", BACKUP_DIR, self.id)
    }
}

/// Result record of a synchronous restore; not persisted.
#[derive(Debug, Clone, Serialize)]
pub struct RestoreJob {
    pub id: String,
    pub backup_id: String,
    pub target_volume_id: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HostDiskSample {
    pub host_id: String,
    pub disk_total_gb: u64,
    pub disk_used_gb: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct StorageMetricsSummary {
    pub total_volumes: usize,
    pub total_volume_size_gb: u64,
    pub attached_volumes: usize,
    pub replicated_volumes: usize,
    pub total_backups: usize,
    pub per_host: Vec<HostDiskSample>,
}

/// Volumes, replication and backup jobs across the fleet.
pub struct StorageManager {
    fleet: Arc<FleetRegistry>,
    volumes: Mutex<BTreeMap<String, Volume>>,
    volume_store: JsonStore,
    backups: Mutex<BTreeMap<String, BackupJob>>,
    backup_store: JsonStore,
}

impl StorageManager {
    pub fn load(data_dir: &Path, fleet: Arc<FleetRegistry>) -> Result<Self> {
        let volume_store = JsonStore::new(data_dir.join("volumes.json"));
        let backup_store = JsonStore::new(data_dir.join("backup_jobs.json"));
        let volumes: BTreeMap<String, Volume> = volume_store.load()?;
        let backups: BTreeMap<String, BackupJob> = backup_store.load()?;
        Ok(Self {
            fleet,
            volumes: Mutex::new(volumes),
            volume_store,
            backups: Mutex::new(backups),
            backup_store,
        })
    }

    /// Online host with the most free disk that can fit `size_gb`.
    fn select_host_for_volume(&self, size_gb: u64, exclude: Option<&str>) -> Result<Host> {
        let mut candidates: Vec<(Host, u64)> = self
            .fleet
            .online_hosts()
            .into_iter()
            .filter(|h| Some(h.id.as_str()) != exclude)
            .filter_map(|h| {
                let free = h
                    .latest_metrics()
                    .map(|m| h.disk_gb.saturating_sub(m.disk_used_gb))?;
                (free >= size_gb).then_some((h, free))
            })
            .collect();

        candidates.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.id.cmp(&b.0.id)));
        candidates
            .into_iter()
            .next()
            .map(|(h, _)| h)
            .ok_or_else(|| {
                StratoError::NoCapacity(format!("no online host can fit a {} GB volume", size_gb))
            })
    }

    /// Create a volume, optionally with a replica on a second host. Replica
    /// setup is best effort: when it fails, the volume survives with
    /// `replicated` cleared.
    pub async fn create_volume(
        &self,
        name: &str,
        size_gb: u64,
        replicated: bool,
    ) -> Result<Volume> {
        if !limits::VOLUME_SIZE_GB.contains(&size_gb) {
            return Err(StratoError::InvalidInput(format!(
                "volume size {} outside {:?}",
                size_gb,
                limits::VOLUME_SIZE_GB
            )));
        }

        let host = self.select_host_for_volume(size_gb, None)?;
        log_info!("Selected host {} for volume {}", host.id, name);

        let mut volume = Volume {
            id: short_id(),
            name: name.to_string(),
            size_gb,
            host_id: Some(host.id.clone()),
            replica_host_id: None,
            attached_to: None,
            attached_host_id: None,
            replicated: false,
            state: VolumeState::Available,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            extra: HashMap::new(),
        };

        self.fleet
            .exec_checked(
                &host.id,
                &format!(
                    "sudo mkdir -p {} && sudo qemu-img create -f qcow2 {} {}G",
                    VOLUME_DIR,
                    volume.path(),
                    size_gb
                ),
            )
            .await?;

        if replicated {
            match self.setup_replica(&volume).await {
                Ok(replica_host) => {
                    volume.replicated = true;
                    volume.replica_host_id = Some(replica_host);
                }
                Err(e) => {
                    log_error!("Error setting up replication for volume {}: {}", volume.id, e);
                }
            }
        }

        let mut volumes = self.volumes.lock().unwrap();
        volumes.insert(volume.id.clone(), volume.clone());
        self.volume_store.save(&*volumes)?;
        log_info!("Created volume {} ({} GB) on host {}", volume.id, size_gb, host.id);
        Ok(volume)
    }

    async fn setup_replica(&self, volume: &Volume) -> Result<String> {
        let primary = volume
            .host_id
            .as_deref()
            .ok_or_else(|| StratoError::Internal("volume has no assigned host".into()))?;
        let replica = self.select_host_for_volume(volume.size_gb, Some(primary))?;

        self.fleet
            .exec_checked(
                &replica.id,
                &format!(
                    "sudo mkdir -p {} && sudo qemu-img create -f qcow2 {} {}G",
                    VOLUME_DIR,
                    volume.path(),
                    volume.size_gb
                ),
            )
            .await?;

        log_info!(
            "Set up replica of volume {} on host {}",
            volume.id,
            replica.id
        );
        Ok(replica.id)
    }

    /// Delete a volume and its replica. Attached volumes are refused.
    pub async fn delete_volume(&self, volume_id: &str) -> Result<()> {
        let volume = self.get_volume(volume_id)?;
        if volume.attached_to.is_some() {
            return Err(StratoError::Conflict(format!(
                "volume {} is attached to VM {}",
                volume_id,
                volume.attached_to.as_deref().unwrap_or_default()
            )));
        }

        let remove = format!("sudo rm -f {}", volume.path());
        if let Some(host_id) = &volume.host_id {
            self.fleet.exec_checked(host_id, &remove).await?;
        } else {
            log_warn!(
                "Volume {} has no host assigned, removing record only",
                volume_id
            );
        }
        if let Some(replica) = &volume.replica_host_id {
            if let Err(e) = self.fleet.exec_checked(replica, &remove).await {
                log_error!(
                    "Error removing replica of volume {} on host {}: {}",
                    volume_id,
                    replica,
                    e
                );
            }
        }

        let mut volumes = self.volumes.lock().unwrap();
        volumes.remove(volume_id);
        self.volume_store.save(&*volumes)?;
        log_info!("Deleted volume {}", volume_id);
        Ok(())
    }

    /// Attach a volume to a VM. How the block device reaches the VM's host
    /// depends on co-location: direct for a local volume, the replica when
    /// one lives there, otherwise a network block export.
    pub async fn attach_volume(
        &self,
        volume_id: &str,
        vm_id: &str,
        vm_host_id: &str,
    ) -> Result<Volume> {
        // Reserve under the lock: of two concurrent attaches only one sees
        // `available`.
        let volume = {
            let mut volumes = self.volumes.lock().unwrap();
            let volume = volumes
                .get_mut(volume_id)
                .ok_or_else(|| StratoError::NotFound(format!("volume {}", volume_id)))?;
            if volume.state != VolumeState::Available {
                return Err(StratoError::Conflict(format!(
                    "volume {} is {}",
                    volume_id, volume.state
                )));
            }
            if volume.host_id.is_none() {
                return Err(StratoError::Conflict(format!(
                    "volume {} has no host assigned",
                    volume_id
                )));
            }
            volume.state = VolumeState::Attaching;
            volume.updated_at = Utc::now();
            let snapshot = volume.clone();
            self.volume_store.save(&*volumes)?;
            snapshot
        };

        let result = self.plumb_attachment(&volume, vm_host_id).await;

        let mut volumes = self.volumes.lock().unwrap();
        let record = volumes
            .get_mut(volume_id)
            .ok_or_else(|| StratoError::NotFound(format!("volume {}", volume_id)))?;
        match result {
            Ok(()) => {
                record.state = VolumeState::Attached;
                record.attached_to = Some(vm_id.to_string());
                record.attached_host_id = Some(vm_host_id.to_string());
                record.updated_at = Utc::now();
                let snapshot = record.clone();
                self.volume_store.save(&*volumes)?;
                log_info!("Attached volume {} to VM {}", volume_id, vm_id);
                Ok(snapshot)
            }
            Err(e) => {
                record.state = VolumeState::Available;
                record.updated_at = Utc::now();
                self.volume_store.save(&*volumes)?;
                log_error!("Error attaching volume {} to VM {}: {}", volume_id, vm_id, e);
                Err(e)
            }
        }
    }

    async fn plumb_attachment(&self, volume: &Volume, vm_host_id: &str) -> Result<()> {
        let volume_host = volume
            .host_id
            .as_deref()
            .ok_or_else(|| StratoError::Conflict(format!("volume {} has no host", volume.id)))?;
        let path = volume.path();

        if volume_host == vm_host_id {
            // Local block device; just verify it is present.
            self.fleet
                .exec_checked(vm_host_id, &format!("sudo test -f {}", path))
                .await?;
            return Ok(());
        }

        if volume.replica_host_id.as_deref() == Some(vm_host_id) {
            self.fleet
                .exec_checked(vm_host_id, &format!("sudo test -f {}", path))
                .await?;
            return Ok(());
        }

        // Remote volume without a local replica: export it from its host
        // and connect on the VM's host.
        let volume_hostname = self.fleet.get(volume_host)?.hostname;
        self.fleet
            .exec_checked(
                volume_host,
                &format!(
                    "sudo qemu-img info {} > /dev/null && sudo qemu-nbd --fork --persistent -x vol-{} {}",
                    path, volume.id, path
                ),
            )
            .await?;
        self.fleet
            .exec_checked(
                vm_host_id,
                &format!(
                    "sudo modprobe nbd && sudo nbd-client {} /dev/nbd0 -name vol-{}",
                    volume_hostname, volume.id
                ),
            )
            .await?;
        Ok(())
    }

    /// Detach a volume from its VM. Detaching an unattached volume is a
    /// no-op; anything mid-transition is refused.
    pub async fn detach_volume(&self, volume_id: &str) -> Result<()> {
        let volume = {
            let mut volumes = self.volumes.lock().unwrap();
            let volume = volumes
                .get_mut(volume_id)
                .ok_or_else(|| StratoError::NotFound(format!("volume {}", volume_id)))?;
            match volume.state {
                VolumeState::Available => {
                    log_warn!("Volume {} is not attached to any VM", volume_id);
                    return Ok(());
                }
                VolumeState::Attached => {}
                state => {
                    return Err(StratoError::Conflict(format!(
                        "volume {} is {}",
                        volume_id, state
                    )));
                }
            }
            volume.state = VolumeState::Detaching;
            volume.updated_at = Utc::now();
            let snapshot = volume.clone();
            self.volume_store.save(&*volumes)?;
            snapshot
        };

        let result = self.unplumb_attachment(&volume).await;

        let mut volumes = self.volumes.lock().unwrap();
        let record = volumes
            .get_mut(volume_id)
            .ok_or_else(|| StratoError::NotFound(format!("volume {}", volume_id)))?;
        match result {
            Ok(()) => {
                record.state = VolumeState::Available;
                record.attached_to = None;
                record.attached_host_id = None;
                record.updated_at = Utc::now();
                self.volume_store.save(&*volumes)?;
                log_info!("Detached volume {}", volume_id);
                Ok(())
            }
            Err(e) => {
                record.state = VolumeState::Attached;
                record.updated_at = Utc::now();
                self.volume_store.save(&*volumes)?;
                log_error!("Error detaching volume {}: {}", volume_id, e);
                Err(e)
            }
        }
    }

    async fn unplumb_attachment(&self, volume: &Volume) -> Result<()> {
        let volume_host = volume
            .host_id
            .as_deref()
            .ok_or_else(|| StratoError::Conflict(format!("volume {} has no host", volume.id)))?;
        let attached_host = volume.attached_host_id.as_deref().unwrap_or(volume_host);

        let remote = attached_host != volume_host
            && volume.replica_host_id.as_deref() != Some(attached_host);
        if remote {
            self.fleet
                .exec_checked(attached_host, "sudo nbd-client -d /dev/nbd0")
                .await?;
        } else {
            self.fleet.exec_checked(attached_host, "sync").await?;
        }
        Ok(())
    }

    /// Grow a detached volume. Shrinking is refused; replicas grow with it.
    pub async fn resize_volume(&self, volume_id: &str, new_size_gb: u64) -> Result<Volume> {
        let volume = self.get_volume(volume_id)?;
        if volume.attached_to.is_some() || volume.state != VolumeState::Available {
            return Err(StratoError::Conflict(format!(
                "volume {} must be detached before resizing",
                volume_id
            )));
        }
        if new_size_gb <= volume.size_gb {
            return Err(StratoError::InvalidInput(format!(
                "new size must be larger than current size ({} GB)",
                volume.size_gb
            )));
        }
        if !limits::VOLUME_SIZE_GB.contains(&new_size_gb) {
            return Err(StratoError::InvalidInput(format!(
                "volume size {} outside {:?}",
                new_size_gb,
                limits::VOLUME_SIZE_GB
            )));
        }
        let host_id = volume.host_id.clone().ok_or_else(|| {
            StratoError::Conflict(format!("volume {} has no host assigned", volume_id))
        })?;

        let resize = format!("sudo qemu-img resize {} {}G", volume.path(), new_size_gb);
        self.fleet.exec_checked(&host_id, &resize).await?;
        if let Some(replica) = &volume.replica_host_id {
            if let Err(e) = self.fleet.exec_checked(replica, &resize).await {
                log_error!(
                    "Error resizing replica of volume {} on host {}: {}",
                    volume_id,
                    replica,
                    e
                );
            }
        }

        let mut volumes = self.volumes.lock().unwrap();
        let record = volumes
            .get_mut(volume_id)
            .ok_or_else(|| StratoError::NotFound(format!("volume {}", volume_id)))?;
        record.size_gb = new_size_gb;
        record.updated_at = Utc::now();
        let snapshot = record.clone();
        self.volume_store.save(&*volumes)?;
        log_info!("Resized volume {} to {} GB", volume_id, new_size_gb);
        Ok(snapshot)
    }

    /// Synchronous point-in-time copy of a volume.
    pub async fn create_backup(&self, volume_id: &str, name: &str) -> Result<BackupJob> {
        let volume = self.get_volume(volume_id)?;
        let host_id = volume.host_id.clone().ok_or_else(|| {
            StratoError::Conflict(format!("volume {} has no host assigned", volume_id))
        })?;

        let backup_id = short_id();
        let backup_path = format!("{}/{}.qcow2", BACKUP_DIR, backup_id);
        self.fleet
            .exec_checked(
                &host_id,
                &format!(
                    "sudo mkdir -p {} && sudo qemu-img convert -O qcow2 {} {}",
                    BACKUP_DIR,
                    volume.path(),
                    backup_path
                ),
            )
            .await?;

        let job = BackupJob {
            id: backup_id,
            name: name.to_string(),
            volume_id: volume.id.clone(),
            volume_name: volume.name.clone(),
            host_id,
            status: "completed".to_string(),
            size_gb: volume.size_gb,
            created_at: Utc::now(),
            completed_at: Some(Utc::now()),
            extra: HashMap::new(),
        };

        let mut backups = self.backups.lock().unwrap();
        backups.insert(job.id.clone(), job.clone());
        self.backup_store.save(&*backups)?;
        log_info!("Created backup {} of volume {}", job.id, volume_id);
        Ok(job)
    }

    /// Restore a backup into a detached volume, defaulting to the volume
    /// it was taken from. Cross-host restores are staged through the
    /// control plane.
    pub async fn restore_backup(
        &self,
        backup_id: &str,
        target_volume_id: Option<&str>,
    ) -> Result<RestoreJob> {
        let backup = self
            .backups
            .lock()
            .unwrap()
            .get(backup_id)
            .cloned()
            .ok_or_else(|| StratoError::NotFound(format!("backup {}", backup_id)))?;

        let target_id = target_volume_id.unwrap_or(&backup.volume_id).to_string();
        let target = self.get_volume(&target_id)?;
        if target.attached_to.is_some() || target.state != VolumeState::Available {
            return Err(StratoError::Conflict(format!(
                "target volume {} must be detached before restore",
                target_id
            )));
        }
        let target_host = target.host_id.clone().ok_or_else(|| {
            StratoError::Conflict(format!("target volume {} has no host assigned", target_id))
        })?;

        if target_host == backup.host_id {
            self.fleet
                .exec_checked(
                    &target_host,
                    &format!(
                        "sudo qemu-img convert -O qcow2 {} {}",
                        backup.path(),
                        target.path()
                    ),
                )
                .await?;
        } else {
            // Stage the image through a scoped local file; removed on all
            // exit paths when the handle drops.
            let staging = tempfile::NamedTempFile::new()?;
            self.fleet
                .copy_from(&backup.host_id, &backup.path(), staging.path())
                .await?;
            let remote_staging = format!("/tmp/strato-restore-{}.qcow2", backup.id);
            self.fleet
                .copy_to(&target_host, staging.path(), &remote_staging)
                .await?;
            self.fleet
                .exec_checked(
                    &target_host,
                    &format!(
                        "sudo qemu-img convert -O qcow2 {} {} && rm -f {}",
                        remote_staging,
                        target.path(),
                        remote_staging
                    ),
                )
                .await?;
        }

        log_info!("Restored backup {} to volume {}", backup_id, target_id);
        Ok(RestoreJob {
            id: short_id(),
            backup_id: backup_id.to_string(),
            target_volume_id: target_id,
            status: "completed".to_string(),
            created_at: Utc::now(),
            completed_at: Utc::now(),
        })
    }

    pub fn get_volume(&self, volume_id: &str) -> Result<Volume> {
        self.volumes
            .lock()
            .unwrap()
            .get(volume_id)
            .cloned()
            .ok_or_else(|| StratoError::NotFound(format!("volume {}", volume_id)))
    }

    pub fn list_volumes(&self) -> Vec<Volume> {
        self.volumes.lock().unwrap().values().cloned().collect()
    }

    pub fn list_backups(&self, volume_id: Option<&str>) -> Vec<BackupJob> {
        let backups = self.backups.lock().unwrap();
        backups
            .values()
            .filter(|b| volume_id.is_none_or(|id| b.volume_id == id))
            .cloned()
            .collect()
    }

    /// Non-mutating snapshot for the monitor.
    pub fn storage_metrics(&self) -> StorageMetricsSummary {
        let volumes = self.volumes.lock().unwrap();
        let total_volumes = volumes.len();
        let total_volume_size_gb = volumes.values().map(|v| v.size_gb).sum();
        let attached_volumes = volumes.values().filter(|v| v.attached_to.is_some()).count();
        let replicated_volumes = volumes.values().filter(|v| v.replicated).count();
        drop(volumes);

        let total_backups = self.backups.lock().unwrap().len();

        let per_host = self
            .fleet
            .list()
            .into_iter()
            .filter_map(|host| {
                host.latest_metrics().map(|m| HostDiskSample {
                    host_id: host.id.clone(),
                    disk_total_gb: host.disk_gb,
                    disk_used_gb: m.disk_used_gb,
                    timestamp: m.timestamp,
                })
            })
            .collect();

        StorageMetricsSummary {
            total_volumes,
            total_volume_size_gb,
            attached_volumes,
            replicated_volumes,
            total_backups,
            per_host,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_paths_are_stable() {
        let volume = Volume {
            id: "abcd1234".into(),
            name: "data".into(),
            size_gb: 10,
            host_id: Some("h1".into()),
            replica_host_id: None,
            attached_to: None,
            attached_host_id: None,
            replicated: false,
            state: VolumeState::Available,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            extra: HashMap::new(),
        };
        assert_eq!(volume.path(), "/var/lib/strato/volumes/abcd1234.qcow2");
    }
}
