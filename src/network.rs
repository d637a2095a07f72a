use crate::{
    Result, StratoError,
    fleet::FleetRegistry,
    log_error, log_info, log_warn,
    store::JsonStore,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// A cluster-managed address mapped to one VM via host-side NAT.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElasticIp {
    pub ip: String,
    pub attached_to: Option<String>,
    pub host_id: Option<String>,
    /// Primary guest address the DNAT rule points at; recorded on attach
    /// so detach can remove the exact rule.
    pub vm_address: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl ElasticIp {
    fn new(ip: String) -> Self {
        let now = Utc::now();
        Self {
            ip,
            attached_to: None,
            host_id: None,
            vm_address: None,
            created_at: now,
            updated_at: now,
            extra: HashMap::new(),
        }
    }

    pub fn is_attached(&self) -> bool {
        self.attached_to.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverlayHostStatus {
    Pending,
    Configured,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlayHost {
    pub host_id: String,
    pub status: OverlayHostStatus,
}

/// Cluster-wide L3 network name with a CIDR and per-host configuration
/// status. The name is the key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlayNetwork {
    pub name: String,
    pub cidr: String,
    pub servers: Vec<OverlayHost>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HostNetSample {
    pub host_id: String,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct NetworkMetricsSummary {
    pub total_elastic_ips: usize,
    pub attached_elastic_ips: usize,
    pub total_overlays: usize,
    pub per_host: Vec<HostNetSample>,
}

const ELASTIC_POOL_PREFIX: &str = "10.100";

/// Elastic IP pool, overlay network records and cross-host plumbing.
pub struct NetworkManager {
    fleet: Arc<FleetRegistry>,
    elastic_ips: Mutex<BTreeMap<String, ElasticIp>>,
    ip_store: JsonStore,
    overlays: Mutex<BTreeMap<String, OverlayNetwork>>,
    overlay_store: JsonStore,
}

impl NetworkManager {
    pub fn load(data_dir: &Path, fleet: Arc<FleetRegistry>) -> Result<Self> {
        let ip_store = JsonStore::new(data_dir.join("elastic_ips.json"));
        let overlay_store = JsonStore::new(data_dir.join("overlay_networks.json"));
        let elastic_ips: BTreeMap<String, ElasticIp> = ip_store.load()?;
        let overlays: BTreeMap<String, OverlayNetwork> = overlay_store.load()?;
        Ok(Self {
            fleet,
            elastic_ips: Mutex::new(elastic_ips),
            ip_store,
            overlays: Mutex::new(overlays),
            overlay_store,
        })
    }

    /// Hand out an unattached IP, preferring reuse over growing the pool.
    /// New addresses are taken from 10.100.0.0/16 by deterministic scan.
    pub fn allocate_elastic_ip(&self) -> Result<String> {
        let mut ips = self.elastic_ips.lock().unwrap();

        if let Some(free) = ips.values().find(|eip| !eip.is_attached()) {
            return Ok(free.ip.clone());
        }

        for third in 0..=254u32 {
            for fourth in 1..=254u32 {
                let candidate = format!("{}.{}.{}", ELASTIC_POOL_PREFIX, third, fourth);
                if !ips.contains_key(&candidate) {
                    ips.insert(candidate.clone(), ElasticIp::new(candidate.clone()));
                    self.ip_store.save(&*ips)?;
                    log_info!("Allocated elastic IP {}", candidate);
                    return Ok(candidate);
                }
            }
        }

        Err(StratoError::NoCapacity("elastic IP pool exhausted".into()))
    }

    /// Attach an IP to a VM. Exclusive: of two concurrent attaches, exactly
    /// one wins; the loser observes the reservation and gets a conflict.
    /// The host-side NAT failure rolls the reservation back.
    pub async fn attach_elastic_ip(
        &self,
        ip: &str,
        vm_id: &str,
        host_id: &str,
        vm_address: &str,
    ) -> Result<ElasticIp> {
        let host = self.fleet.get(host_id)?;

        {
            let mut ips = self.elastic_ips.lock().unwrap();
            let eip = ips
                .get_mut(ip)
                .ok_or_else(|| StratoError::NotFound(format!("elastic IP {}", ip)))?;
            if let Some(owner) = &eip.attached_to {
                return Err(StratoError::Conflict(format!(
                    "elastic IP {} is already attached to VM {}",
                    ip, owner
                )));
            }
            eip.attached_to = Some(vm_id.to_string());
            eip.host_id = Some(host_id.to_string());
            eip.vm_address = Some(vm_address.to_string());
            eip.updated_at = Utc::now();
            self.ip_store.save(&*ips)?;
        }

        let rule = format!(
            "sudo iptables -t nat -A PREROUTING -d {} -j DNAT --to-destination {}",
            ip, vm_address
        );
        match self.fleet.exec_checked(host_id, &rule).await {
            Ok(_) => {
                log_info!(
                    "Attached elastic IP {} to VM {} on host {}",
                    ip,
                    vm_id,
                    host.id
                );
                let ips = self.elastic_ips.lock().unwrap();
                ips.get(ip)
                    .cloned()
                    .ok_or_else(|| StratoError::NotFound(format!("elastic IP {}", ip)))
            }
            Err(e) => {
                let mut ips = self.elastic_ips.lock().unwrap();
                if let Some(eip) = ips.get_mut(ip) {
                    eip.attached_to = None;
                    eip.host_id = None;
                    eip.vm_address = None;
                    eip.updated_at = Utc::now();
                }
                self.ip_store.save(&*ips)?;
                log_error!("Error configuring elastic IP {} for VM {}: {}", ip, vm_id, e);
                Err(e)
            }
        }
    }

    /// Remove the NAT mapping and clear the attachment. Detaching an
    /// unattached IP is a no-op.
    pub async fn detach_elastic_ip(&self, ip: &str) -> Result<()> {
        let (host_id, vm_address) = {
            let ips = self.elastic_ips.lock().unwrap();
            let eip = ips
                .get(ip)
                .ok_or_else(|| StratoError::NotFound(format!("elastic IP {}", ip)))?;
            match (&eip.host_id, &eip.vm_address) {
                (Some(host_id), Some(addr)) => (host_id.clone(), addr.clone()),
                _ => {
                    log_warn!("Elastic IP {} is not attached to any VM", ip);
                    return Ok(());
                }
            }
        };

        let rule = format!(
            "sudo iptables -t nat -D PREROUTING -d {} -j DNAT --to-destination {}",
            ip, vm_address
        );
        self.fleet.exec_checked(&host_id, &rule).await?;

        let mut ips = self.elastic_ips.lock().unwrap();
        if let Some(eip) = ips.get_mut(ip) {
            eip.attached_to = None;
            eip.host_id = None;
            eip.vm_address = None;
            eip.updated_at = Utc::now();
        }
        self.ip_store.save(&*ips)?;
        log_info!("Detached elastic IP {}", ip);
        Ok(())
    }

    pub fn get_elastic_ip(&self, ip: &str) -> Result<ElasticIp> {
        self.elastic_ips
            .lock()
            .unwrap()
            .get(ip)
            .cloned()
            .ok_or_else(|| StratoError::NotFound(format!("elastic IP {}", ip)))
    }

    pub fn list_elastic_ips(&self) -> Vec<ElasticIp> {
        self.elastic_ips.lock().unwrap().values().cloned().collect()
    }

    /// Create an overlay network and push per-host configuration to every
    /// online host. The record is created even when individual hosts fail;
    /// callers inspect the per-host status.
    pub async fn create_overlay(&self, name: &str, cidr: Option<&str>) -> Result<OverlayNetwork> {
        if name.is_empty() {
            return Err(StratoError::InvalidInput(
                "overlay network name cannot be empty".into(),
            ));
        }

        let cidr = match cidr {
            Some(cidr) => {
                validate_overlay_cidr(cidr)?;
                cidr.to_string()
            }
            None => {
                let used: Vec<String> = self
                    .overlays
                    .lock()
                    .unwrap()
                    .values()
                    .map(|o| o.cidr.clone())
                    .collect();
                generate_overlay_cidr(&used).ok_or_else(|| {
                    StratoError::NoCapacity("no private /16 ranges left to assign".into())
                })?
            }
        };

        let online = self.fleet.online_hosts();
        if online.is_empty() {
            return Err(StratoError::NoCapacity(
                "no online hosts available to create overlay network".into(),
            ));
        }

        let overlay = {
            let mut overlays = self.overlays.lock().unwrap();
            if overlays.contains_key(name) {
                return Err(StratoError::Conflict(format!(
                    "overlay network {} already exists",
                    name
                )));
            }
            let overlay = OverlayNetwork {
                name: name.to_string(),
                cidr: cidr.clone(),
                servers: online
                    .iter()
                    .map(|h| OverlayHost {
                        host_id: h.id.clone(),
                        status: OverlayHostStatus::Pending,
                    })
                    .collect(),
                created_at: Utc::now(),
                updated_at: Utc::now(),
                extra: HashMap::new(),
            };
            overlays.insert(name.to_string(), overlay.clone());
            self.overlay_store.save(&*overlays)?;
            overlay
        };

        let setup = format!(
            "sudo ip link add name br-{name} type bridge 2>/dev/null || true && sudo ip link set br-{name} up",
            name = name
        );
        let mut results = Vec::with_capacity(overlay.servers.len());
        for server in &overlay.servers {
            let status = match self.fleet.exec_checked(&server.host_id, &setup).await {
                Ok(_) => OverlayHostStatus::Configured,
                Err(e) => {
                    log_error!(
                        "Error configuring overlay {} on host {}: {}",
                        name,
                        server.host_id,
                        e
                    );
                    OverlayHostStatus::Failed
                }
            };
            results.push((server.host_id.clone(), status));
        }

        let mut overlays = self.overlays.lock().unwrap();
        let record = overlays
            .get_mut(name)
            .ok_or_else(|| StratoError::NotFound(format!("overlay network {}", name)))?;
        for (host_id, status) in results {
            if let Some(server) = record.servers.iter_mut().find(|s| s.host_id == host_id) {
                server.status = status;
            }
        }
        record.updated_at = Utc::now();
        let snapshot = record.clone();
        self.overlay_store.save(&*overlays)?;
        log_info!("Created overlay network {} ({})", name, cidr);
        Ok(snapshot)
    }

    /// Best-effort teardown on each recorded host, then drop the record.
    pub async fn delete_overlay(&self, name: &str) -> Result<()> {
        let overlay = self.get_overlay(name)?;

        let cleanup = format!("sudo ip link del br-{} 2>/dev/null || true", name);
        for server in &overlay.servers {
            if let Err(e) = self.fleet.exec(&server.host_id, &cleanup).await {
                log_error!(
                    "Error cleaning up overlay {} on host {}: {}",
                    name,
                    server.host_id,
                    e
                );
            }
        }

        let mut overlays = self.overlays.lock().unwrap();
        overlays.remove(name);
        self.overlay_store.save(&*overlays)?;
        log_info!("Deleted overlay network {}", name);
        Ok(())
    }

    pub fn get_overlay(&self, name: &str) -> Result<OverlayNetwork> {
        self.overlays
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| StratoError::NotFound(format!("overlay network {}", name)))
    }

    pub fn list_overlays(&self) -> Vec<OverlayNetwork> {
        self.overlays.lock().unwrap().values().cloned().collect()
    }

    /// Verify connectivity between every unordered pair of online hosts.
    /// The probe command is idempotent, so repeated runs are safe.
    pub async fn setup_cross_host(&self) -> Result<()> {
        let online = self.fleet.online_hosts();
        if online.len() < 2 {
            log_info!("Not enough online hosts to set up cross-host networking");
            return Ok(());
        }

        for (i, first) in online.iter().enumerate() {
            for second in online.iter().skip(i + 1) {
                let to_second = format!("ping -c 1 -W 2 {}", second.hostname);
                let to_first = format!("ping -c 1 -W 2 {}", first.hostname);
                if let Err(e) = self.fleet.exec_checked(&first.id, &to_second).await {
                    log_error!(
                        "Error linking hosts {} -> {}: {}",
                        first.id,
                        second.id,
                        e
                    );
                }
                if let Err(e) = self.fleet.exec_checked(&second.id, &to_first).await {
                    log_error!(
                        "Error linking hosts {} -> {}: {}",
                        second.id,
                        first.id,
                        e
                    );
                }
            }
        }
        Ok(())
    }

    /// Outbound MASQUERADE plus IP forwarding, persisted to sysctl.
    pub async fn configure_nat(&self, host_id: &str) -> Result<()> {
        let host = self.fleet.get(host_id)?;

        self.fleet
            .exec_checked(
                host_id,
                "sudo iptables -t nat -A POSTROUTING -s 10.0.0.0/8 -o eth0 -j MASQUERADE",
            )
            .await?;
        self.fleet
            .exec_checked(host_id, "sudo sysctl -w net.ipv4.ip_forward=1")
            .await?;
        self.fleet
            .exec_checked(
                host_id,
                "echo 'net.ipv4.ip_forward=1' | sudo tee -a /etc/sysctl.conf",
            )
            .await?;

        log_info!("Configured outbound NAT on host {}", host.name);
        Ok(())
    }

    pub async fn configure_nat_all(&self) {
        for host in self.fleet.online_hosts() {
            if let Err(e) = self.configure_nat(&host.id).await {
                log_error!("Error configuring NAT on host {}: {}", host.id, e);
            }
        }
    }

    /// Non-mutating snapshot for the monitor.
    pub fn network_metrics(&self) -> NetworkMetricsSummary {
        let ips = self.elastic_ips.lock().unwrap();
        let total_elastic_ips = ips.len();
        let attached_elastic_ips = ips.values().filter(|e| e.is_attached()).count();
        drop(ips);

        let total_overlays = self.overlays.lock().unwrap().len();

        let per_host = self
            .fleet
            .list()
            .into_iter()
            .filter_map(|host| {
                host.latest_metrics().map(|m| HostNetSample {
                    host_id: host.id.clone(),
                    network_rx_bytes: m.network_rx_bytes,
                    network_tx_bytes: m.network_tx_bytes,
                    timestamp: m.timestamp,
                })
            })
            .collect();

        NetworkMetricsSummary {
            total_elastic_ips,
            attached_elastic_ips,
            total_overlays,
            per_host,
        }
    }
}

/// Parse `a.b.c.d/len` into its address and prefix length.
pub fn parse_cidr(cidr: &str) -> Result<(Ipv4Addr, u8)> {
    let (addr, len) = cidr
        .split_once('/')
        .ok_or_else(|| StratoError::InvalidInput(format!("invalid CIDR {:?}", cidr)))?;
    let addr: Ipv4Addr = addr
        .parse()
        .map_err(|_| StratoError::InvalidInput(format!("invalid CIDR address in {:?}", cidr)))?;
    let len: u8 = len
        .parse()
        .map_err(|_| StratoError::InvalidInput(format!("invalid CIDR prefix in {:?}", cidr)))?;
    if len > 32 {
        return Err(StratoError::InvalidInput(format!(
            "invalid CIDR prefix /{}",
            len
        )));
    }
    Ok((addr, len))
}

/// Overlay/VPC CIDRs must be RFC1918 ranges with prefix length 16..=28 and
/// no host bits set.
pub fn validate_overlay_cidr(cidr: &str) -> Result<()> {
    let (addr, len) = parse_cidr(cidr)?;
    if !(16..=28).contains(&len) {
        return Err(StratoError::InvalidInput(format!(
            "CIDR prefix /{} outside the allowed 16..=28 range",
            len
        )));
    }
    if !addr.is_private() {
        return Err(StratoError::InvalidInput(format!(
            "{} is not a private (RFC1918) range",
            cidr
        )));
    }
    let mask = u32::MAX << (32 - len as u32);
    let raw = u32::from(addr);
    if raw & !mask != 0 {
        return Err(StratoError::InvalidInput(format!(
            "{} has host bits set",
            cidr
        )));
    }
    Ok(())
}

/// Deterministically pick the next unused 10.n.0.0/16 range.
pub fn generate_overlay_cidr(used: &[String]) -> Option<String> {
    for n in 1..=254u32 {
        let candidate = format!("10.{}.0.0/16", n);
        if !used.contains(&candidate) {
            return Some(candidate);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cidr_validation_accepts_private_ranges() {
        assert!(validate_overlay_cidr("10.20.0.0/24").is_ok());
        assert!(validate_overlay_cidr("172.16.4.0/22").is_ok());
        assert!(validate_overlay_cidr("192.168.0.0/16").is_ok());
    }

    #[test]
    fn cidr_validation_rejects_bad_input() {
        // Public range
        assert!(validate_overlay_cidr("8.8.0.0/16").is_err());
        // Prefix out of range
        assert!(validate_overlay_cidr("10.0.0.0/8").is_err());
        assert!(validate_overlay_cidr("10.0.0.0/30").is_err());
        // Host bits set
        assert!(validate_overlay_cidr("10.0.0.1/24").is_err());
        // Garbage
        assert!(validate_overlay_cidr("not-a-cidr").is_err());
        assert!(validate_overlay_cidr("10.0.0.0").is_err());
    }

    #[test]
    fn generated_cidrs_skip_used_ranges() {
        assert_eq!(generate_overlay_cidr(&[]).unwrap(), "10.1.0.0/16");
        let used = vec!["10.1.0.0/16".to_string(), "10.2.0.0/16".to_string()];
        assert_eq!(generate_overlay_cidr(&used).unwrap(), "10.3.0.0/16");
    }
}
