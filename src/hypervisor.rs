use crate::{
    Result, StratoError,
    config::TimeoutConfig,
    error::HypervisorErrorKind,
    log_debug,
};
use std::collections::HashMap;
use std::io::Write;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Simplified domain runtime state as reported by the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainState {
    Running,
    Stopped,
    Paused,
    Crashed,
    Unknown,
}

impl DomainState {
    fn parse(raw: &str) -> Self {
        match raw.trim() {
            "running" => DomainState::Running,
            "shut off" => DomainState::Stopped,
            "paused" | "pmsuspended" => DomainState::Paused,
            "crashed" => DomainState::Crashed,
            _ => DomainState::Unknown,
        }
    }

    pub fn is_active(self) -> bool {
        matches!(self, DomainState::Running | DomainState::Paused)
    }
}

#[derive(Debug, Clone)]
pub struct DomainRecord {
    pub name: String,
    pub state: DomainState,
}

#[derive(Debug, Clone, Default)]
pub struct DomainInfo {
    pub cpus: u32,
    pub max_memory_kib: u64,
    pub used_memory_kib: u64,
    pub state: String,
}

/// Flags passed through to the hypervisor's migrate call.
#[derive(Debug, Clone, Copy, Default)]
pub struct MigrateFlags {
    pub live: bool,
    pub offline: bool,
    pub persist_dest: bool,
    pub undefine_source: bool,
    pub compressed: bool,
    pub auto_converge: bool,
    pub peer_to_peer: bool,
    pub tunnelled: bool,
    pub change_protection: bool,
}

/// Snapshot of the hypervisor's migration job counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct MigrationJobInfo {
    pub data_total: u64,
    pub data_processed: u64,
    pub data_remaining: u64,
    /// MiB per second.
    pub speed: u64,
    pub downtime_ms: u64,
    pub compression_cache: Option<u64>,
    pub compressed_bytes: Option<u64>,
}

/// RPC channel to the hypervisor daemon on one host, addressed by a
/// `<driver>+ssh://user@host/system` URI. Each call runs its own client
/// process; nothing is kept open between calls.
pub struct HypervisorSession {
    uri: String,
    timeouts: TimeoutConfig,
}

impl HypervisorSession {
    pub fn new(uri: String, timeouts: TimeoutConfig) -> Self {
        Self { uri, timeouts }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    async fn virsh(&self, args: &[&str], timeout: Duration) -> Result<String> {
        let mut cmd = Command::new("virsh");
        cmd.arg("-c").arg(&self.uri);
        cmd.args(args);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        log_debug!("virsh -c {} {}", self.uri, args.join(" "));

        let result = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| {
                StratoError::Timeout(format!(
                    "hypervisor call on {} exceeded {}s",
                    self.uri,
                    timeout.as_secs()
                ))
            })?;

        let output = result.map_err(|e| {
            StratoError::Internal(format!("could not start hypervisor client: {}", e))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();
            return Err(StratoError::Hypervisor {
                kind: HypervisorErrorKind::classify(&stderr),
                message: stderr,
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Define a domain from XML. The document is staged in a scoped temp
    /// file that is removed on every exit path.
    pub async fn define_xml(&self, xml: &str) -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(xml.as_bytes())?;
        file.flush()?;
        let path = file.path().to_string_lossy().to_string();
        self.virsh(&["define", &path], self.timeouts.exec()).await?;
        Ok(())
    }

    pub async fn undefine(&self, domain: &str) -> Result<()> {
        self.virsh(&["undefine", domain], self.timeouts.exec())
            .await?;
        Ok(())
    }

    pub async fn start(&self, domain: &str) -> Result<()> {
        self.virsh(&["start", domain], self.timeouts.exec()).await?;
        Ok(())
    }

    /// Graceful ACPI shutdown request; the guest may ignore it.
    pub async fn shutdown(&self, domain: &str) -> Result<()> {
        self.virsh(&["shutdown", domain], self.timeouts.exec())
            .await?;
        Ok(())
    }

    /// Hard power-off.
    pub async fn destroy(&self, domain: &str) -> Result<()> {
        self.virsh(&["destroy", domain], self.timeouts.exec())
            .await?;
        Ok(())
    }

    pub async fn state(&self, domain: &str) -> Result<DomainState> {
        let out = self
            .virsh(&["domstate", domain], self.timeouts.exec())
            .await?;
        Ok(DomainState::parse(&out))
    }

    pub async fn is_active(&self, domain: &str) -> Result<bool> {
        Ok(self.state(domain).await?.is_active())
    }

    /// All domains, active and defined-but-stopped.
    pub async fn list_all(&self) -> Result<Vec<DomainRecord>> {
        let out = self
            .virsh(&["list", "--all", "--name"], self.timeouts.exec())
            .await?;
        let mut records = Vec::new();
        for line in out.lines() {
            let name = line.trim();
            if name.is_empty() {
                continue;
            }
            let state = self.state(name).await.unwrap_or(DomainState::Unknown);
            records.push(DomainRecord {
                name: name.to_string(),
                state,
            });
        }
        Ok(records)
    }

    pub async fn domain_count(&self) -> Result<u32> {
        let out = self
            .virsh(&["list", "--all", "--name"], self.timeouts.exec())
            .await?;
        Ok(out.lines().filter(|l| !l.trim().is_empty()).count() as u32)
    }

    pub async fn dominfo(&self, domain: &str) -> Result<DomainInfo> {
        let out = self
            .virsh(&["dominfo", domain], self.timeouts.exec())
            .await?;
        Ok(parse_dominfo(&out))
    }

    /// Key/value counters from `domstats`, flattened across stat groups.
    pub async fn domstats(&self, domain: &str) -> Result<HashMap<String, String>> {
        let out = self
            .virsh(&["domstats", domain], self.timeouts.metrics())
            .await?;
        Ok(parse_domstats(&out))
    }

    /// Block devices of a domain as `(target, source)` pairs.
    pub async fn domblklist(&self, domain: &str) -> Result<Vec<(String, String)>> {
        let out = self
            .virsh(&["domblklist", domain], self.timeouts.exec())
            .await?;
        Ok(parse_domblklist(&out))
    }

    pub async fn attach_disk(&self, domain: &str, source: &str, target: &str) -> Result<()> {
        self.virsh(
            &["attach-disk", domain, source, target, "--persistent"],
            self.timeouts.exec(),
        )
        .await?;
        Ok(())
    }

    pub async fn detach_disk(&self, domain: &str, target: &str) -> Result<()> {
        self.virsh(
            &["detach-disk", domain, target, "--persistent"],
            self.timeouts.exec(),
        )
        .await?;
        Ok(())
    }

    /// Start a migration as a child process so the caller can poll job
    /// progress while it runs. The caller owns the child's lifetime.
    pub fn spawn_migrate(
        &self,
        domain: &str,
        dest_uri: &str,
        flags: MigrateFlags,
    ) -> Result<tokio::process::Child> {
        let mut cmd = Command::new("virsh");
        cmd.arg("-c").arg(&self.uri).arg("migrate");
        if flags.live {
            cmd.arg("--live");
        }
        if flags.offline {
            cmd.arg("--offline");
        }
        if flags.persist_dest {
            cmd.arg("--persistent");
        }
        if flags.undefine_source {
            cmd.arg("--undefinesource");
        }
        if flags.compressed {
            cmd.arg("--compressed");
        }
        if flags.auto_converge {
            cmd.arg("--auto-converge");
        }
        if flags.peer_to_peer {
            cmd.arg("--p2p");
        }
        if flags.tunnelled {
            cmd.arg("--tunnelled");
        }
        if flags.change_protection {
            cmd.arg("--change-protection");
        }
        cmd.arg(domain).arg(dest_uri);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        log_debug!("starting migration of {} to {}", domain, dest_uri);
        cmd.spawn()
            .map_err(|e| StratoError::Internal(format!("could not start migration client: {}", e)))
    }

    pub async fn migrate_set_max_speed(&self, domain: &str, mib_per_sec: u32) -> Result<()> {
        self.virsh(
            &["migrate-setspeed", domain, &mib_per_sec.to_string()],
            self.timeouts.exec(),
        )
        .await?;
        Ok(())
    }

    pub async fn migrate_set_max_downtime(&self, domain: &str, downtime_ms: u64) -> Result<()> {
        self.virsh(
            &["migrate-setmaxdowntime", domain, &downtime_ms.to_string()],
            self.timeouts.exec(),
        )
        .await?;
        Ok(())
    }

    pub async fn migrate_set_compression_cache(&self, domain: &str, bytes: u64) -> Result<()> {
        self.virsh(
            &["migrate-compcache", domain, "--size", &bytes.to_string()],
            self.timeouts.exec(),
        )
        .await?;
        Ok(())
    }

    /// Abort the in-flight job on a domain (migration included).
    pub async fn abort_job(&self, domain: &str) -> Result<()> {
        self.virsh(&["domjobabort", domain], self.timeouts.exec())
            .await?;
        Ok(())
    }

    pub async fn job_info(&self, domain: &str) -> Result<MigrationJobInfo> {
        let out = self
            .virsh(&["domjobinfo", domain], self.timeouts.exec())
            .await?;
        Ok(parse_job_info(&out))
    }
}

fn parse_dominfo(raw: &str) -> DomainInfo {
    let mut info = DomainInfo::default();
    for line in raw.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "CPU(s)" => info.cpus = value.parse().unwrap_or(0),
            "Max memory" => info.max_memory_kib = leading_u64(value),
            "Used memory" => info.used_memory_kib = leading_u64(value),
            "State" => info.state = value.to_string(),
            _ => {}
        }
    }
    info
}

fn parse_domstats(raw: &str) -> HashMap<String, String> {
    let mut stats = HashMap::new();
    for line in raw.lines() {
        let line = line.trim();
        if let Some((key, value)) = line.split_once('=') {
            stats.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    stats
}

fn parse_domblklist(raw: &str) -> Vec<(String, String)> {
    raw.lines()
        .skip(2) // header and separator
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let target = parts.next()?.to_string();
            let source = parts.next()?.to_string();
            Some((target, source))
        })
        .collect()
}

fn parse_job_info(raw: &str) -> MigrationJobInfo {
    let mut info = MigrationJobInfo::default();
    for line in raw.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "Data processed" => info.data_processed = parse_size_bytes(value),
            "Data remaining" => info.data_remaining = parse_size_bytes(value),
            "Data total" => info.data_total = parse_size_bytes(value),
            "Memory bandwidth" => info.speed = parse_size_bytes(value) / (1024 * 1024),
            "Expected downtime" | "Total downtime" => info.downtime_ms = leading_u64(value),
            "Compression cache" => info.compression_cache = Some(parse_size_bytes(value)),
            "Compressed data" => info.compressed_bytes = Some(parse_size_bytes(value)),
            _ => {}
        }
    }
    if info.data_total == 0 {
        info.data_total = info.data_processed + info.data_remaining;
    }
    info
}

/// Parse strings like `260.962 MiB` or `1.418 GiB` into bytes.
fn parse_size_bytes(value: &str) -> u64 {
    let mut parts = value.split_whitespace();
    let Some(number) = parts.next().and_then(|n| n.parse::<f64>().ok()) else {
        return 0;
    };
    let multiplier = match parts.next() {
        Some("KiB") => 1024.0,
        Some("MiB") => 1024.0 * 1024.0,
        Some("GiB") => 1024.0 * 1024.0 * 1024.0,
        Some("TiB") => 1024.0_f64.powi(4),
        Some("B") | None => 1.0,
        Some(_) => 1.0,
    };
    (number * multiplier) as u64
}

fn leading_u64(value: &str) -> u64 {
    value
        .split_whitespace()
        .next()
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_domjobinfo_counters() {
        let raw = "Job type:         Unbounded\n\
                   Operation:        Outgoing migration\n\
                   Time elapsed:     1234         ms\n\
                   Data processed:   260.962 MiB\n\
                   Data remaining:   1.418 GiB\n\
                   Data total:       1.673 GiB\n\
                   Memory bandwidth: 120.500 MiB\n\
                   Expected downtime: 48           ms\n";
        let info = parse_job_info(raw);
        assert_eq!(info.data_processed, (260.962 * 1024.0 * 1024.0) as u64);
        assert_eq!(info.downtime_ms, 48);
        assert!(info.data_total > info.data_processed);
        assert_eq!(info.speed, 120);
    }

    #[test]
    fn parses_dominfo_fields() {
        let raw = "Id:             7\n\
                   Name:           web-1\n\
                   State:          running\n\
                   CPU(s):         4\n\
                   Max memory:     4194304 KiB\n\
                   Used memory:    4194304 KiB\n";
        let info = parse_dominfo(raw);
        assert_eq!(info.cpus, 4);
        assert_eq!(info.max_memory_kib, 4_194_304);
        assert_eq!(info.state, "running");
    }

    #[test]
    fn domain_state_mapping() {
        assert_eq!(DomainState::parse("running\n"), DomainState::Running);
        assert_eq!(DomainState::parse("shut off"), DomainState::Stopped);
        assert!(!DomainState::parse("shut off").is_active());
    }

    #[test]
    fn domstats_key_values() {
        let raw = "Domain: 'web-1'\n  state.state=1\n  balloon.current=2097152\n  cpu.time=91232000000\n";
        let stats = parse_domstats(raw);
        assert_eq!(stats.get("balloon.current").unwrap(), "2097152");
        assert_eq!(stats.get("cpu.time").unwrap(), "91232000000");
    }
}
