pub mod config;
pub mod error;
pub mod fleet;
pub mod host;
pub mod hypervisor;
pub mod logger;
pub mod migration;
pub mod monitor;
pub mod network;
pub mod storage;
pub mod store;
pub mod vm;

pub use error::StratoError;

pub type Result<T> = std::result::Result<T, StratoError>;

// Convenience re-exports for the coordinators
pub use fleet::{FleetRegistry, Host, HostMetrics, HostStatus};
pub use migration::{MigrationManager, MigrationRequest, MigrationState, MigrationType};
pub use monitor::{Alert, AlertSeverity, ClusterHealth, Monitor, MonitoringConfig};
pub use network::{ElasticIp, NetworkManager, OverlayNetwork};
pub use storage::{StorageManager, Volume, VolumeState};
pub use vm::{Vm, VmConfig, VmManager, VmState};
