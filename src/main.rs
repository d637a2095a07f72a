use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use strato::{
    config::ClusterConfig,
    fleet::{FleetRegistry, Host},
    logger,
    migration::{MigrationManager, MigrationRequest, MigrationType},
    monitor::Monitor,
    network::NetworkManager,
    storage::StorageManager,
    vm::{VmArch, VmConfig, VmManager},
};

#[derive(Parser)]
#[command(name = "strato")]
#[command(about = "Multi-host virtual machine control plane")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the StratoFile configuration
    #[arg(short, long, default_value = "StratoFile")]
    config: PathBuf,

    /// Override the data directory
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage hypervisor hosts
    #[command(subcommand)]
    Host(HostCommands),
    /// Manage virtual machines
    #[command(subcommand)]
    Vm(VmCommands),
    /// Manage VM migrations
    #[command(subcommand)]
    Migrate(MigrateCommands),
    /// Manage elastic IPs
    #[command(subcommand)]
    Ip(IpCommands),
    /// Manage overlay networks
    #[command(subcommand)]
    Overlay(OverlayCommands),
    /// Cross-host network plumbing
    #[command(subcommand)]
    Net(NetCommands),
    /// Manage storage volumes
    #[command(subcommand)]
    Volume(VolumeCommands),
    /// Manage volume backups
    #[command(subcommand)]
    Backup(BackupCommands),
    /// Run or query the monitoring loop
    #[command(subcommand)]
    Monitor(MonitorCommands),
    /// Manage alerts
    #[command(subcommand)]
    Alert(AlertCommands),
    /// Show aggregate cluster health
    Health,
}

#[derive(Subcommand)]
enum HostCommands {
    /// Register a host and probe it
    Add {
        id: String,
        hostname: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long, default_value_t = 22)]
        port: u16,
        #[arg(long, default_value = "ubuntu")]
        user: String,
        #[arg(long)]
        key: Option<String>,
        #[arg(long)]
        password: Option<String>,
        #[arg(long, default_value_t = 10)]
        capacity: u32,
    },
    /// List registered hosts
    List,
    /// Show one host as JSON
    Show { id: String },
    /// Refresh liveness, specs and metrics for a host
    Probe { id: String },
    /// Drop a host record (VMs and volumes on it become orphaned)
    Remove { id: String },
    /// Run a command on a host
    Exec { id: String, command: String },
}

#[derive(Subcommand)]
enum VmCommands {
    /// Create a VM on the best-fitting host
    Create {
        name: String,
        #[arg(long, default_value_t = 2)]
        cpu: u32,
        #[arg(long, default_value_t = 2048)]
        memory: u64,
        #[arg(long, default_value_t = 20)]
        disk: u64,
        #[arg(long)]
        image: Option<String>,
        #[arg(long)]
        network: Option<String>,
        #[arg(long, value_enum)]
        arch: Option<ArchArg>,
    },
    /// List VMs across all online hosts
    List,
    /// Show one VM as JSON
    Show { id: String },
    /// Show only the runtime state
    Status { id: String },
    /// Show guest metrics
    Metrics { id: String },
    Start { id: String },
    Stop {
        id: String,
        #[arg(long)]
        force: bool,
    },
    Delete { id: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum ArchArg {
    X86_64,
    Aarch64,
}

impl From<ArchArg> for VmArch {
    fn from(arch: ArchArg) -> Self {
        match arch {
            ArchArg::X86_64 => VmArch::X86_64,
            ArchArg::Aarch64 => VmArch::Aarch64,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum MigrationTypeArg {
    Direct,
    P2p,
    Tunneled,
    Offline,
}

impl From<MigrationTypeArg> for MigrationType {
    fn from(t: MigrationTypeArg) -> Self {
        match t {
            MigrationTypeArg::Direct => MigrationType::Direct,
            MigrationTypeArg::P2p => MigrationType::P2p,
            MigrationTypeArg::Tunneled => MigrationType::Tunneled,
            MigrationTypeArg::Offline => MigrationType::Offline,
        }
    }
}

#[derive(Subcommand)]
enum MigrateCommands {
    /// Start migrating a VM to another host
    Start {
        vm_id: String,
        dest_host_id: String,
        /// Shut the guest down instead of streaming memory
        #[arg(long)]
        offline: bool,
        #[arg(long, value_enum, default_value = "direct")]
        mode: MigrationTypeArg,
        /// Bandwidth cap in MiB/s
        #[arg(long)]
        bandwidth: Option<u32>,
        /// Max allowed downtime in milliseconds
        #[arg(long)]
        downtime: Option<u64>,
    },
    /// Show migration status for a VM
    Status { vm_id: String },
    /// Abort an in-flight migration
    Cancel { vm_id: String },
    /// List all migration jobs
    List,
}

#[derive(Subcommand)]
enum IpCommands {
    /// Allocate an elastic IP from the pool
    Allocate,
    /// Attach an elastic IP to a VM; vm_address is the guest's primary IP
    Attach {
        ip: String,
        vm_id: String,
        host_id: String,
        vm_address: String,
    },
    Detach { ip: String },
    List,
}

#[derive(Subcommand)]
enum OverlayCommands {
    /// Create an overlay network; the CIDR is generated when omitted
    Create {
        name: String,
        #[arg(long)]
        cidr: Option<String>,
    },
    Delete { name: String },
    List,
    Show { name: String },
}

#[derive(Subcommand)]
enum NetCommands {
    /// Verify connectivity between every pair of online hosts
    CrossHost,
    /// Configure outbound NAT on one host, or all online hosts
    Nat {
        host_id: Option<String>,
    },
}

#[derive(Subcommand)]
enum VolumeCommands {
    Create {
        name: String,
        size_gb: u64,
        #[arg(long)]
        replicated: bool,
    },
    Delete { id: String },
    Attach {
        id: String,
        vm_id: String,
        vm_host_id: String,
    },
    Detach { id: String },
    Resize { id: String, new_size_gb: u64 },
    List,
    Show { id: String },
}

#[derive(Subcommand)]
enum BackupCommands {
    Create { volume_id: String, name: String },
    Restore {
        backup_id: String,
        #[arg(long)]
        target: Option<String>,
    },
    List {
        #[arg(long)]
        volume: Option<String>,
    },
}

#[derive(Subcommand)]
enum MonitorCommands {
    /// Run the collection loop in the foreground until interrupted
    Run,
    /// Run a single collection cycle
    Once,
    /// Export the in-memory metrics series to a JSON file
    Export { path: PathBuf },
}

#[derive(Subcommand)]
enum AlertCommands {
    List {
        /// Include resolved alerts
        #[arg(long)]
        all: bool,
    },
    Ack { id: String },
    Resolve { id: String },
}

struct ControlPlane {
    fleet: Arc<FleetRegistry>,
    vms: Arc<VmManager>,
    migrations: MigrationManager,
    network: Arc<NetworkManager>,
    storage: Arc<StorageManager>,
    monitor: Arc<Monitor>,
}

/// Composition root: every coordinator is built once here and handed out
/// by reference; ownership stays acyclic.
fn build(config: &ClusterConfig, data_dir: &std::path::Path) -> anyhow::Result<ControlPlane> {
    let fleet = Arc::new(FleetRegistry::load(data_dir, config.timeouts)?);
    let vms = Arc::new(VmManager::load(data_dir, Arc::clone(&fleet))?);
    let migrations = MigrationManager::new(
        Arc::clone(&fleet),
        Arc::clone(&vms),
        config.migration.clone(),
    );
    let network = Arc::new(NetworkManager::load(data_dir, Arc::clone(&fleet))?);
    let storage = Arc::new(StorageManager::load(data_dir, Arc::clone(&fleet))?);
    let monitor = Arc::new(Monitor::load(
        data_dir,
        Arc::clone(&fleet),
        Arc::clone(&vms),
        Arc::clone(&network),
        Arc::clone(&storage),
    )?);
    Ok(ControlPlane {
        fleet,
        vms,
        migrations,
        network,
        storage,
        monitor,
    })
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logger::init_logger();

    let cli = Cli::parse();
    let mut config =
        ClusterConfig::load_or_default(&cli.config).context("loading StratoFile")?;
    if let Some(dir) = cli.data_dir {
        config.data_dir = Some(dir);
    }
    let data_dir = config.resolve_data_dir();
    let plane = build(&config, &data_dir).context("building control plane")?;

    match cli.command {
        Commands::Host(cmd) => host_command(&plane, cmd).await?,
        Commands::Vm(cmd) => vm_command(&plane, cmd).await?,
        Commands::Migrate(cmd) => migrate_command(&plane, cmd).await?,
        Commands::Ip(cmd) => ip_command(&plane, cmd).await?,
        Commands::Overlay(cmd) => overlay_command(&plane, cmd).await?,
        Commands::Net(cmd) => net_command(&plane, cmd).await?,
        Commands::Volume(cmd) => volume_command(&plane, cmd).await?,
        Commands::Backup(cmd) => backup_command(&plane, cmd).await?,
        Commands::Monitor(cmd) => monitor_command(&plane, cmd).await?,
        Commands::Alert(cmd) => alert_command(&plane, cmd)?,
        Commands::Health => {
            print_json(&plane.monitor.cluster_health().await)?;
        }
    }

    Ok(())
}

async fn host_command(plane: &ControlPlane, cmd: HostCommands) -> anyhow::Result<()> {
    match cmd {
        HostCommands::Add {
            id,
            hostname,
            name,
            port,
            user,
            key,
            password,
            capacity,
        } => {
            let mut host = Host::new(&id, name.as_deref().unwrap_or(&id), &hostname);
            host.port = port;
            host.username = user;
            host.key_path = key;
            host.password = password;
            host.vm_capacity = capacity;
            let host = plane.fleet.add(host).await?;
            println!("Added host {} ({})", host.id, host.status);
        }
        HostCommands::List => {
            for host in plane.fleet.list() {
                println!(
                    "{:<12} {:<20} {:<8} vms {}/{} cores {} mem {} MB disk {} GB",
                    host.id,
                    host.hostname,
                    host.status,
                    host.vm_count,
                    host.vm_capacity,
                    host.cpu_cores,
                    host.memory_mb,
                    host.disk_gb
                );
            }
        }
        HostCommands::Show { id } => print_json(&plane.fleet.get(&id)?.redacted())?,
        HostCommands::Probe { id } => {
            let host = plane.fleet.probe(&id).await?;
            println!("Host {} is {}", host.id, host.status);
        }
        HostCommands::Remove { id } => {
            plane.fleet.remove(&id)?;
            println!("Removed host {}", id);
        }
        HostCommands::Exec { id, command } => {
            let output = plane.fleet.exec(&id, &command).await?;
            if !output.stdout.is_empty() {
                println!("{}", output.stdout);
            }
            if !output.stderr.is_empty() {
                eprintln!("{}", output.stderr);
            }
            std::process::exit(output.exit_code);
        }
    }
    Ok(())
}

async fn vm_command(plane: &ControlPlane, cmd: VmCommands) -> anyhow::Result<()> {
    match cmd {
        VmCommands::Create {
            name,
            cpu,
            memory,
            disk,
            image,
            network,
            arch,
        } => {
            let mut config = VmConfig::new(&name);
            config.cpu_cores = cpu;
            config.memory_mb = memory;
            config.disk_size_gb = disk;
            config.image_id = image;
            config.network_name = network;
            config.arch = arch.map(Into::into);
            let vm = plane.vms.create(config).await?;
            println!("Created VM {} on host {}", vm.id, vm.host_id);
        }
        VmCommands::List => {
            for vm in plane.vms.list().await {
                println!(
                    "{:<12} {:<20} {:<10} host {}",
                    vm.id, vm.name, vm.state, vm.host_id
                );
            }
        }
        VmCommands::Show { id } => print_json(&plane.vms.get(&id).await?)?,
        VmCommands::Status { id } => println!("{}", plane.vms.status(&id).await),
        VmCommands::Metrics { id } => print_json(&plane.vms.metrics(&id).await?)?,
        VmCommands::Start { id } => {
            plane.vms.start(&id).await?;
            println!("Started VM {}", id);
        }
        VmCommands::Stop { id, force } => {
            plane.vms.stop(&id, force).await?;
            println!("Stopped VM {}", id);
        }
        VmCommands::Delete { id } => {
            plane.vms.delete(&id).await?;
            println!("Deleted VM {}", id);
        }
    }
    Ok(())
}

async fn migrate_command(plane: &ControlPlane, cmd: MigrateCommands) -> anyhow::Result<()> {
    match cmd {
        MigrateCommands::Start {
            vm_id,
            dest_host_id,
            offline,
            mode,
            bandwidth,
            downtime,
        } => {
            let mut request = MigrationRequest::new(&vm_id, &dest_host_id);
            request.live = !offline;
            request.migration_type = mode.into();
            request.bandwidth_mib = bandwidth;
            request.max_downtime_ms = downtime;
            let job = plane.migrations.start(request).await?;
            println!(
                "Migration of VM {} to host {} is {}",
                job.vm_id, job.dest_host_id, job.state
            );
        }
        MigrateCommands::Status { vm_id } => match plane.migrations.status(&vm_id) {
            Some(job) => print_json(&job)?,
            None => println!("No migration recorded for VM {}", vm_id),
        },
        MigrateCommands::Cancel { vm_id } => {
            plane.migrations.cancel(&vm_id).await?;
            println!("Cancelled migration of VM {}", vm_id);
        }
        MigrateCommands::List => {
            for job in plane.migrations.list() {
                println!(
                    "{:<12} {} -> {} {:<12} {:.1}%",
                    job.vm_id,
                    job.source_host_id,
                    job.dest_host_id,
                    job.state.to_string(),
                    job.stats.progress
                );
            }
        }
    }
    Ok(())
}

async fn ip_command(plane: &ControlPlane, cmd: IpCommands) -> anyhow::Result<()> {
    match cmd {
        IpCommands::Allocate => println!("{}", plane.network.allocate_elastic_ip()?),
        IpCommands::Attach {
            ip,
            vm_id,
            host_id,
            vm_address,
        } => {
            plane
                .network
                .attach_elastic_ip(&ip, &vm_id, &host_id, &vm_address)
                .await?;
            println!("Attached {} to VM {}", ip, vm_id);
        }
        IpCommands::Detach { ip } => {
            plane.network.detach_elastic_ip(&ip).await?;
            println!("Detached {}", ip);
        }
        IpCommands::List => {
            for eip in plane.network.list_elastic_ips() {
                match &eip.attached_to {
                    Some(vm) => println!("{:<16} attached to {}", eip.ip, vm),
                    None => println!("{:<16} unattached", eip.ip),
                }
            }
        }
    }
    Ok(())
}

async fn overlay_command(plane: &ControlPlane, cmd: OverlayCommands) -> anyhow::Result<()> {
    match cmd {
        OverlayCommands::Create { name, cidr } => {
            let overlay = plane.network.create_overlay(&name, cidr.as_deref()).await?;
            print_json(&overlay)?;
        }
        OverlayCommands::Delete { name } => {
            plane.network.delete_overlay(&name).await?;
            println!("Deleted overlay network {}", name);
        }
        OverlayCommands::List => {
            for overlay in plane.network.list_overlays() {
                println!(
                    "{:<20} {:<18} {} hosts",
                    overlay.name,
                    overlay.cidr,
                    overlay.servers.len()
                );
            }
        }
        OverlayCommands::Show { name } => print_json(&plane.network.get_overlay(&name)?)?,
    }
    Ok(())
}

async fn net_command(plane: &ControlPlane, cmd: NetCommands) -> anyhow::Result<()> {
    match cmd {
        NetCommands::CrossHost => {
            plane.network.setup_cross_host().await?;
            println!("Cross-host networking verified");
        }
        NetCommands::Nat { host_id } => match host_id {
            Some(id) => {
                plane.network.configure_nat(&id).await?;
                println!("Configured NAT on host {}", id);
            }
            None => {
                plane.network.configure_nat_all().await;
                println!("Configured NAT on all online hosts");
            }
        },
    }
    Ok(())
}

async fn volume_command(plane: &ControlPlane, cmd: VolumeCommands) -> anyhow::Result<()> {
    match cmd {
        VolumeCommands::Create {
            name,
            size_gb,
            replicated,
        } => {
            let volume = plane.storage.create_volume(&name, size_gb, replicated).await?;
            println!("Created volume {} on host {:?}", volume.id, volume.host_id);
        }
        VolumeCommands::Delete { id } => {
            plane.storage.delete_volume(&id).await?;
            println!("Deleted volume {}", id);
        }
        VolumeCommands::Attach {
            id,
            vm_id,
            vm_host_id,
        } => {
            plane.storage.attach_volume(&id, &vm_id, &vm_host_id).await?;
            println!("Attached volume {} to VM {}", id, vm_id);
        }
        VolumeCommands::Detach { id } => {
            plane.storage.detach_volume(&id).await?;
            println!("Detached volume {}", id);
        }
        VolumeCommands::Resize { id, new_size_gb } => {
            let volume = plane.storage.resize_volume(&id, new_size_gb).await?;
            println!("Resized volume {} to {} GB", volume.id, volume.size_gb);
        }
        VolumeCommands::List => {
            for volume in plane.storage.list_volumes() {
                println!(
                    "{:<12} {:<20} {:>6} GB {:<10} host {:?}",
                    volume.id,
                    volume.name,
                    volume.size_gb,
                    volume.state.to_string(),
                    volume.host_id
                );
            }
        }
        VolumeCommands::Show { id } => print_json(&plane.storage.get_volume(&id)?)?,
    }
    Ok(())
}

async fn backup_command(plane: &ControlPlane, cmd: BackupCommands) -> anyhow::Result<()> {
    match cmd {
        BackupCommands::Create { volume_id, name } => {
            let job = plane.storage.create_backup(&volume_id, &name).await?;
            println!("Created backup {} of volume {}", job.id, volume_id);
        }
        BackupCommands::Restore { backup_id, target } => {
            let job = plane
                .storage
                .restore_backup(&backup_id, target.as_deref())
                .await?;
            println!("Restored backup {} to volume {}", backup_id, job.target_volume_id);
        }
        BackupCommands::List { volume } => {
            for job in plane.storage.list_backups(volume.as_deref()) {
                println!(
                    "{:<12} {:<20} volume {} {:>6} GB {}",
                    job.id, job.name, job.volume_id, job.size_gb, job.status
                );
            }
        }
    }
    Ok(())
}

async fn monitor_command(plane: &ControlPlane, cmd: MonitorCommands) -> anyhow::Result<()> {
    match cmd {
        MonitorCommands::Run => {
            Arc::clone(&plane.monitor).start();
            println!("Monitoring started; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            plane.monitor.stop();
        }
        MonitorCommands::Once => {
            plane.monitor.run_once().await?;
            println!("Collected one monitoring cycle");
        }
        MonitorCommands::Export { path } => {
            plane.monitor.export_metrics(&path)?;
        }
    }
    Ok(())
}

fn alert_command(plane: &ControlPlane, cmd: AlertCommands) -> anyhow::Result<()> {
    match cmd {
        AlertCommands::List { all } => {
            for alert in plane.monitor.alerts().list(all) {
                println!(
                    "{:<12} [{}] {} ({}/{}){}",
                    alert.id,
                    alert.severity,
                    alert.title,
                    alert.resource_type,
                    alert.resource_id,
                    if alert.resolved { " resolved" } else { "" }
                );
            }
        }
        AlertCommands::Ack { id } => {
            plane.monitor.alerts().acknowledge(&id)?;
            println!("Acknowledged alert {}", id);
        }
        AlertCommands::Resolve { id } => {
            plane.monitor.alerts().resolve(&id)?;
            println!("Resolved alert {}", id);
        }
    }
    Ok(())
}
