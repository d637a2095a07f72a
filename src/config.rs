use crate::{Result, StratoError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Validation limits for user-supplied resource requests.
pub mod limits {
    pub const VM_CPU_CORES: std::ops::RangeInclusive<u32> = 1..=32;
    pub const VM_MEMORY_MB: std::ops::RangeInclusive<u64> = 512..=262_144;
    pub const VM_DISK_GB: std::ops::RangeInclusive<u64> = 1..=2048;
    pub const VOLUME_SIZE_GB: std::ops::RangeInclusive<u64> = 1..=2048;
    pub const HOST_PORT: std::ops::RangeInclusive<u16> = 1..=65_535;
    pub const HOST_VM_CAPACITY: std::ops::RangeInclusive<u32> = 1..=1000;
}

/// Top-level cluster configuration, read from a `StratoFile` (TOML).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClusterConfig {
    /// Directory holding the per-coordinator JSON state documents.
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub migration: MigrationSettings,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Liveness probe and spec collection commands.
    #[serde(default = "default_probe_secs")]
    pub probe_secs: u64,
    /// General remote command execution.
    #[serde(default = "default_exec_secs")]
    pub exec_secs: u64,
    /// SFTP-style file transfer in either direction.
    #[serde(default = "default_copy_secs")]
    pub file_copy_secs: u64,
    /// Each individual metrics collection command.
    #[serde(default = "default_metrics_secs")]
    pub metrics_secs: u64,
}

fn default_probe_secs() -> u64 {
    10
}
fn default_exec_secs() -> u64 {
    30
}
fn default_copy_secs() -> u64 {
    30
}
fn default_metrics_secs() -> u64 {
    2
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            probe_secs: default_probe_secs(),
            exec_secs: default_exec_secs(),
            file_copy_secs: default_copy_secs(),
            metrics_secs: default_metrics_secs(),
        }
    }
}

impl TimeoutConfig {
    pub fn probe(&self) -> Duration {
        Duration::from_secs(self.probe_secs)
    }
    pub fn exec(&self) -> Duration {
        Duration::from_secs(self.exec_secs)
    }
    pub fn file_copy(&self) -> Duration {
        Duration::from_secs(self.file_copy_secs)
    }
    pub fn metrics(&self) -> Duration {
        Duration::from_secs(self.metrics_secs)
    }
}

/// Cluster-wide defaults for VM migration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationSettings {
    /// Bandwidth cap in MiB/s applied before a migration starts.
    pub bandwidth_mib: Option<u32>,
    /// Maximum tolerated pause of the guest, in milliseconds.
    pub max_downtime_ms: Option<u64>,
    /// Compression cache size in bytes.
    pub compression_cache_bytes: Option<u64>,
    #[serde(default = "default_true")]
    pub compressed: bool,
    #[serde(default = "default_true")]
    pub auto_converge: bool,
    /// Remove the source-side definition once the destination is canonical.
    #[serde(default = "default_true")]
    pub undefine_source: bool,
    /// Grace period for guest shutdown during non-live migration.
    #[serde(default = "default_shutdown_secs")]
    pub shutdown_timeout_secs: u64,
}

fn default_true() -> bool {
    true
}
fn default_shutdown_secs() -> u64 {
    30
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            bandwidth_mib: None,
            max_downtime_ms: None,
            compression_cache_bytes: None,
            compressed: true,
            auto_converge: true,
            undefine_source: true,
            shutdown_timeout_secs: default_shutdown_secs(),
        }
    }
}

impl ClusterConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = fs::read_to_string(path.as_ref())?;
        let config: ClusterConfig = toml::from_str(&raw)?;
        Ok(config)
    }

    /// Load from the given path, falling back to defaults when absent.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let raw = toml::to_string_pretty(self)
            .map_err(|e| StratoError::Serde(e.to_string()))?;
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, raw)?;
        Ok(())
    }

    /// Resolve the data directory: explicit config, or the platform data dir.
    pub fn resolve_data_dir(&self) -> PathBuf {
        if let Some(dir) = &self.data_dir {
            return dir.clone();
        }
        dirs::data_local_dir()
            .map(|d| d.join("strato"))
            .unwrap_or_else(|| PathBuf::from("data"))
    }
}
