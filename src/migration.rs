use crate::{
    Result, StratoError,
    config::MigrationSettings,
    error::HypervisorErrorKind,
    fleet::{FleetRegistry, HostStatus},
    hypervisor::{HypervisorSession, MigrateFlags, MigrationJobInfo},
    log_debug, log_error, log_info, log_warn,
    vm::VmManager,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MigrationType {
    #[default]
    Direct,
    P2p,
    Tunneled,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationState {
    Preparing,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl MigrationState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MigrationState::Completed | MigrationState::Failed | MigrationState::Cancelled
        )
    }

    /// The state machine only moves along
    /// `preparing -> in_progress -> {completed, failed, cancelled}`,
    /// with failure and cancellation also reachable from `preparing`.
    pub fn can_transition(self, next: MigrationState) -> bool {
        use MigrationState::*;
        matches!(
            (self, next),
            (Preparing, InProgress)
                | (Preparing, Failed)
                | (Preparing, Cancelled)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Cancelled)
        )
    }
}

impl std::fmt::Display for MigrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MigrationState::Preparing => "preparing",
            MigrationState::InProgress => "in_progress",
            MigrationState::Completed => "completed",
            MigrationState::Failed => "failed",
            MigrationState::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone)]
pub struct MigrationRequest {
    pub vm_id: String,
    pub dest_host_id: String,
    pub live: bool,
    pub migration_type: MigrationType,
    pub bandwidth_mib: Option<u32>,
    pub max_downtime_ms: Option<u64>,
    pub compression_cache_bytes: Option<u64>,
}

impl MigrationRequest {
    pub fn new(vm_id: &str, dest_host_id: &str) -> Self {
        Self {
            vm_id: vm_id.to_string(),
            dest_host_id: dest_host_id.to_string(),
            live: true,
            migration_type: MigrationType::Direct,
            bandwidth_mib: None,
            max_downtime_ms: None,
            compression_cache_bytes: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct MigrationStats {
    pub progress: f64,
    pub data_total: u64,
    pub data_processed: u64,
    pub data_remaining: u64,
    /// MiB per second.
    pub speed: u64,
    pub downtime_ms: u64,
    pub compression_cache: Option<u64>,
    pub compressed_bytes: Option<u64>,
}

impl From<MigrationJobInfo> for MigrationStats {
    fn from(info: MigrationJobInfo) -> Self {
        let progress = if info.data_total > 0 {
            info.data_processed as f64 / info.data_total as f64 * 100.0
        } else {
            0.0
        };
        Self {
            progress,
            data_total: info.data_total,
            data_processed: info.data_processed,
            data_remaining: info.data_remaining,
            speed: info.speed,
            downtime_ms: info.downtime_ms,
            compression_cache: info.compression_cache,
            compressed_bytes: info.compressed_bytes,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationJob {
    pub vm_id: String,
    pub vm_name: String,
    pub source_host_id: String,
    pub dest_host_id: String,
    pub migration_type: MigrationType,
    pub live: bool,
    pub state: MigrationState,
    pub stats: MigrationStats,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Runs the per-VM migration state machine. One background worker per
/// in-flight migration; the API polls rather than awaiting.
pub struct MigrationManager {
    fleet: Arc<FleetRegistry>,
    vms: Arc<VmManager>,
    settings: MigrationSettings,
    jobs: Arc<Mutex<HashMap<String, MigrationJob>>>,
}

impl MigrationManager {
    pub fn new(
        fleet: Arc<FleetRegistry>,
        vms: Arc<VmManager>,
        settings: MigrationSettings,
    ) -> Self {
        Self {
            fleet,
            vms,
            settings,
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Validate and launch a migration; returns the job in `preparing`.
    pub async fn start(&self, request: MigrationRequest) -> Result<MigrationJob> {
        let record = self.vms.record(&request.vm_id)?;
        let source = self.fleet.get(&record.host_id)?;
        let dest = self.fleet.get(&request.dest_host_id)?;

        if dest.id == source.id {
            return Err(StratoError::InvalidInput(format!(
                "VM {} is already on host {}",
                request.vm_id, dest.id
            )));
        }
        if dest.status != HostStatus::Online {
            return Err(StratoError::Conflict(format!(
                "destination host {} is not online",
                dest.id
            )));
        }
        if !FleetRegistry::host_fits(
            &dest,
            record.config.cpu_cores,
            record.config.memory_mb,
            record.config.disk_size_gb,
        ) {
            return Err(StratoError::NoCapacity(format!(
                "destination host {} cannot fit VM {}",
                dest.id, request.vm_id
            )));
        }

        let job = {
            let mut jobs = self.jobs.lock().unwrap();
            if let Some(existing) = jobs.get(&request.vm_id) {
                if !existing.state.is_terminal() {
                    return Err(StratoError::Conflict(format!(
                        "migration of VM {} already {}",
                        request.vm_id, existing.state
                    )));
                }
            }
            let job = MigrationJob {
                vm_id: request.vm_id.clone(),
                vm_name: record.name.clone(),
                source_host_id: source.id.clone(),
                dest_host_id: dest.id.clone(),
                migration_type: request.migration_type,
                live: request.live,
                state: MigrationState::Preparing,
                stats: MigrationStats::default(),
                error_message: None,
                started_at: Utc::now(),
                completed_at: None,
            };
            jobs.insert(request.vm_id.clone(), job.clone());
            job
        };

        let worker = self.clone_for_async();
        let request_clone = request.clone();
        tokio::spawn(async move {
            let vm_id = request_clone.vm_id.clone();
            if let Err(e) = worker.execute(request_clone).await {
                log_error!("Migration of VM {} failed: {}", vm_id, e);
                worker.finish(&vm_id, MigrationState::Failed, Some(e.to_string()));
            }
        });

        log_info!(
            "Migration of VM {} to host {} queued",
            request.vm_id,
            request.dest_host_id
        );
        Ok(job)
    }

    async fn execute(&self, request: MigrationRequest) -> Result<()> {
        let record = self.vms.record(&request.vm_id)?;
        let source = self.fleet.get(&record.host_id)?;
        let dest = self.fleet.get(&request.dest_host_id)?;
        let session = self.fleet.driver_for(&source).hypervisor();
        let dest_uri = dest.hypervisor_uri();
        let name = record.name.clone();

        self.apply_knobs(&session, &name, &request).await;

        let active = session.is_active(&name).await?;
        let offline_request = request.migration_type == MigrationType::Offline;
        let live = active && request.live && !offline_request;

        if active && !live {
            self.shutdown_for_migration(&session, &name).await?;
        }

        let flags = MigrateFlags {
            live,
            offline: !live,
            persist_dest: true,
            undefine_source: self.settings.undefine_source,
            compressed: live && self.settings.compressed,
            auto_converge: live && self.settings.auto_converge,
            peer_to_peer: request.migration_type == MigrationType::P2p,
            tunnelled: request.migration_type == MigrationType::Tunneled,
            change_protection: true,
        };

        if !self.transition(&request.vm_id, MigrationState::InProgress) {
            // Cancelled while preparing.
            return Ok(());
        }

        let mut child = session.spawn_migrate(&name, &dest_uri, flags)?;
        let mut stderr = child.stderr.take();
        let mut ticker = tokio::time::interval(Duration::from_secs(2));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let status = loop {
            tokio::select! {
                status = child.wait() => {
                    break status.map_err(|e| {
                        StratoError::Internal(format!("migration process error: {}", e))
                    })?;
                }
                _ = ticker.tick() => {
                    if let Ok(info) = session.job_info(&name).await {
                        self.update_stats(&request.vm_id, info.into());
                    }
                }
            }
        };

        if !status.success() {
            let mut message = String::new();
            if let Some(pipe) = stderr.as_mut() {
                let _ = pipe.read_to_string(&mut message).await;
            }
            let message = message.trim().to_string();
            if self.state_of(&request.vm_id) == Some(MigrationState::Cancelled) {
                log_info!("Migration of VM {} aborted by cancel", request.vm_id);
                return Ok(());
            }
            return Err(StratoError::Hypervisor {
                kind: HypervisorErrorKind::classify(&message),
                message,
            });
        }

        // Destination is canonical from here on; a lingering source
        // definition is reconciled by a later list().
        self.vms.commit_migration(&request.vm_id, &dest.id)?;

        if !self.settings.undefine_source {
            log_debug!(
                "Leaving source definition of {} on host {} (undefine_source disabled)",
                name,
                source.id
            );
        }

        if let Ok(info) = session.job_info(&name).await {
            self.update_stats(&request.vm_id, info.into());
        }
        self.finish(&request.vm_id, MigrationState::Completed, None);
        log_info!(
            "Migrated VM {} from host {} to host {}",
            request.vm_id,
            source.id,
            dest.id
        );
        Ok(())
    }

    async fn apply_knobs(
        &self,
        session: &HypervisorSession,
        domain: &str,
        request: &MigrationRequest,
    ) {
        if let Some(mib) = request.bandwidth_mib.or(self.settings.bandwidth_mib) {
            if let Err(e) = session.migrate_set_max_speed(domain, mib).await {
                log_warn!("Could not cap migration bandwidth for {}: {}", domain, e);
            }
        }
        if let Some(ms) = request.max_downtime_ms.or(self.settings.max_downtime_ms) {
            if let Err(e) = session.migrate_set_max_downtime(domain, ms).await {
                log_warn!("Could not set max downtime for {}: {}", domain, e);
            }
        }
        if let Some(bytes) = request
            .compression_cache_bytes
            .or(self.settings.compression_cache_bytes)
        {
            if let Err(e) = session.migrate_set_compression_cache(domain, bytes).await {
                log_warn!("Could not size compression cache for {}: {}", domain, e);
            }
        }
    }

    /// Graceful shutdown with a bounded wait, then force off.
    async fn shutdown_for_migration(
        &self,
        session: &HypervisorSession,
        domain: &str,
    ) -> Result<()> {
        log_info!("Shutting down VM {} for non-live migration", domain);
        session.shutdown(domain).await?;

        for _ in 0..self.settings.shutdown_timeout_secs {
            if !session.is_active(domain).await? {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        log_warn!("VM {} did not shut down gracefully, forcing off", domain);
        session.destroy(domain).await
    }

    /// Abort an in-flight migration. The job lands in `cancelled` and the
    /// VM stays on its source host.
    pub async fn cancel(&self, vm_id: &str) -> Result<()> {
        let job = self
            .status(vm_id)
            .ok_or_else(|| StratoError::NotFound(format!("migration for VM {}", vm_id)))?;
        if job.state.is_terminal() {
            return Err(StratoError::Conflict(format!(
                "migration of VM {} already {}",
                vm_id, job.state
            )));
        }

        let source = self.fleet.get(&job.source_host_id)?;
        let session = self.fleet.driver_for(&source).hypervisor();
        if let Err(e) = session.abort_job(&job.vm_name).await {
            // Nothing in flight on the hypervisor side is fine; anything
            // else is surfaced.
            log_warn!("Abort of migration job for {} reported: {}", job.vm_name, e);
        }

        self.finish(vm_id, MigrationState::Cancelled, None);
        log_info!("Cancelled migration of VM {}", vm_id);
        Ok(())
    }

    pub fn status(&self, vm_id: &str) -> Option<MigrationJob> {
        self.jobs.lock().unwrap().get(vm_id).cloned()
    }

    pub fn list(&self) -> Vec<MigrationJob> {
        let mut jobs: Vec<MigrationJob> = self.jobs.lock().unwrap().values().cloned().collect();
        jobs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        jobs
    }

    pub async fn set_max_speed(&self, vm_id: &str, mib_per_sec: u32) -> Result<()> {
        let (session, name) = self.source_session(vm_id)?;
        session.migrate_set_max_speed(&name, mib_per_sec).await
    }

    pub async fn set_max_downtime(&self, vm_id: &str, downtime_ms: u64) -> Result<()> {
        let (session, name) = self.source_session(vm_id)?;
        session.migrate_set_max_downtime(&name, downtime_ms).await
    }

    pub async fn set_compression_cache(&self, vm_id: &str, bytes: u64) -> Result<()> {
        let (session, name) = self.source_session(vm_id)?;
        session.migrate_set_compression_cache(&name, bytes).await
    }

    fn source_session(&self, vm_id: &str) -> Result<(HypervisorSession, String)> {
        let record = self.vms.record(vm_id)?;
        let host = self.fleet.get(&record.host_id)?;
        Ok((self.fleet.driver_for(&host).hypervisor(), record.name))
    }

    fn state_of(&self, vm_id: &str) -> Option<MigrationState> {
        self.jobs.lock().unwrap().get(vm_id).map(|j| j.state)
    }

    fn transition(&self, vm_id: &str, next: MigrationState) -> bool {
        let mut jobs = self.jobs.lock().unwrap();
        let Some(job) = jobs.get_mut(vm_id) else {
            return false;
        };
        if !job.state.can_transition(next) {
            log_debug!(
                "Ignoring migration transition {} -> {} for VM {}",
                job.state,
                next,
                vm_id
            );
            return false;
        }
        job.state = next;
        true
    }

    fn finish(&self, vm_id: &str, state: MigrationState, error: Option<String>) {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(job) = jobs.get_mut(vm_id) {
            if job.state.is_terminal() {
                return;
            }
            if job.state.can_transition(state) {
                job.state = state;
                job.error_message = error;
                job.completed_at = Some(Utc::now());
            }
        }
    }

    fn update_stats(&self, vm_id: &str, stats: MigrationStats) {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(job) = jobs.get_mut(vm_id) {
            if job.state == MigrationState::InProgress {
                job.stats = stats;
            }
        }
    }

    fn clone_for_async(&self) -> Self {
        Self {
            fleet: Arc::clone(&self.fleet),
            vms: Arc::clone(&self.vms),
            settings: self.settings.clone(),
            jobs: Arc::clone(&self.jobs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_machine_follows_the_arrows() {
        use MigrationState::*;
        assert!(Preparing.can_transition(InProgress));
        assert!(InProgress.can_transition(Completed));
        assert!(InProgress.can_transition(Failed));
        assert!(InProgress.can_transition(Cancelled));
        assert!(Preparing.can_transition(Cancelled));

        assert!(!Completed.can_transition(InProgress));
        assert!(!Cancelled.can_transition(Completed));
        assert!(!InProgress.can_transition(Preparing));
        assert!(!Failed.can_transition(Cancelled));
    }

    #[test]
    fn progress_derives_from_job_counters() {
        let info = MigrationJobInfo {
            data_total: 1000,
            data_processed: 250,
            data_remaining: 750,
            speed: 100,
            downtime_ms: 40,
            compression_cache: None,
            compressed_bytes: None,
        };
        let stats: MigrationStats = info.into();
        assert!((stats.progress - 25.0).abs() < 1e-9);
        assert_eq!(stats.data_remaining, 750);
    }
}
