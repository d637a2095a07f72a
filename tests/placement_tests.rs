// Integration tests for fleet placement
use chrono::Utc;
use std::collections::BTreeMap;
use strato::config::TimeoutConfig;
use strato::fleet::{FleetRegistry, Host, HostMetrics, HostSpecs, HostStatus, ProbeReport};
use strato::store::JsonStore;
use tempfile::TempDir;

fn seeded_host(id: &str, cores: u32, memory_mb: u64, disk_gb: u64) -> Host {
    let mut host = Host::new(id, id, &format!("{}.lab", id));
    host.key_path = Some("/root/.ssh/id_ed25519".to_string());
    host.status = HostStatus::Online;
    host.cpu_cores = cores;
    host.memory_mb = memory_mb;
    host.disk_gb = disk_gb;
    host
}

fn sample(cpu: f64, mem_used: u64, disk_used: u64) -> HostMetrics {
    HostMetrics {
        cpu_usage: cpu,
        memory_total_mb: 0,
        memory_used_mb: mem_used,
        disk_total_gb: 0,
        disk_used_gb: disk_used,
        network_rx_bytes: 0,
        network_tx_bytes: 0,
        timestamp: Utc::now(),
    }
}

fn online_report(host: &Host, metrics: HostMetrics) -> ProbeReport {
    ProbeReport {
        status: HostStatus::Online,
        specs: Some(HostSpecs {
            cpu_cores: host.cpu_cores,
            memory_mb: host.memory_mb,
            disk_gb: host.disk_gb,
            vm_count: None,
        }),
        sample: Some(metrics),
    }
}

fn registry_with(dir: &TempDir, hosts: Vec<Host>) -> FleetRegistry {
    let mut map = BTreeMap::new();
    for host in hosts {
        map.insert(host.id.clone(), host);
    }
    JsonStore::new(dir.path().join("hosts.json"))
        .save(&map)
        .expect("seeding hosts.json");
    FleetRegistry::load(dir.path(), TimeoutConfig::default()).expect("loading registry")
}

#[test]
fn select_prefers_the_least_loaded_host() {
    let dir = TempDir::new().unwrap();
    let h1 = seeded_host("h1", 8, 16_384, 200);
    let h2 = seeded_host("h2", 8, 32_768, 200);
    let fleet = registry_with(&dir, vec![h1.clone(), h2.clone()]);

    fleet
        .apply_probe("h1", online_report(&h1, sample(50.0, 8_192, 50)))
        .unwrap();
    fleet
        .apply_probe("h2", online_report(&h2, sample(10.0, 4_096, 10)))
        .unwrap();

    let selected = fleet.select_for(2, 4_096, 20).expect("a host should fit");
    assert_eq!(selected.id, "h2");
}

#[test]
fn select_requires_a_probe_in_this_process() {
    let dir = TempDir::new().unwrap();
    let mut host = seeded_host("h1", 8, 16_384, 200);
    host.metrics_history.push(sample(10.0, 1_024, 10));
    let fleet = registry_with(&dir, vec![host.clone()]);

    // Loaded from disk but never probed by this process: not eligible.
    assert!(fleet.select_for(1, 512, 1).is_none());

    fleet
        .apply_probe("h1", online_report(&host, sample(10.0, 1_024, 10)))
        .unwrap();
    assert!(fleet.select_for(1, 512, 1).is_some());
}

#[test]
fn selected_host_satisfies_the_request() {
    let dir = TempDir::new().unwrap();
    let host = seeded_host("h1", 4, 8_192, 100);
    let fleet = registry_with(&dir, vec![host.clone()]);
    fleet
        .apply_probe("h1", online_report(&host, sample(25.0, 2_048, 30)))
        .unwrap();

    let selected = fleet.select_for(2, 4_096, 50).expect("fits");
    assert!(FleetRegistry::host_fits(&selected, 2, 4_096, 50));

    // Oversized requests find nothing.
    assert!(fleet.select_for(2, 4_096, 90).is_none());
    assert!(fleet.select_for(4, 4_096, 50).is_none());
}

#[test]
fn full_hosts_are_never_selected() {
    let dir = TempDir::new().unwrap();
    let mut host = seeded_host("h1", 16, 65_536, 500);
    host.vm_capacity = 2;
    host.vm_count = 2;
    let fleet = registry_with(&dir, vec![host.clone()]);
    fleet
        .apply_probe("h1", online_report(&host, sample(5.0, 1_024, 10)))
        .unwrap();

    assert!(fleet.select_for(1, 512, 1).is_none());
}

#[test]
fn offline_hosts_are_never_selected() {
    let dir = TempDir::new().unwrap();
    let host = seeded_host("h1", 8, 16_384, 200);
    let fleet = registry_with(&dir, vec![host.clone()]);

    fleet
        .apply_probe(
            "h1",
            ProbeReport {
                status: HostStatus::Offline,
                specs: None,
                sample: None,
            },
        )
        .unwrap();

    assert!(fleet.select_for(1, 512, 1).is_none());
    assert_eq!(fleet.get("h1").unwrap().status, HostStatus::Offline);
}

#[test]
fn vm_count_adjustments_persist() {
    let dir = TempDir::new().unwrap();
    let host = seeded_host("h1", 8, 16_384, 200);
    let fleet = registry_with(&dir, vec![host]);

    fleet.adjust_vm_count("h1", 1).unwrap();
    fleet.adjust_vm_count("h1", 1).unwrap();
    fleet.adjust_vm_count("h1", -1).unwrap();
    assert_eq!(fleet.get("h1").unwrap().vm_count, 1);

    // Never goes below zero.
    fleet.adjust_vm_count("h1", -5).unwrap();
    assert_eq!(fleet.get("h1").unwrap().vm_count, 0);

    // Survives a reload.
    let reloaded = FleetRegistry::load(dir.path(), TimeoutConfig::default()).unwrap();
    assert_eq!(reloaded.get("h1").unwrap().vm_count, 0);
}

#[test]
fn metrics_ring_keeps_timestamps_increasing() {
    let dir = TempDir::new().unwrap();
    let host = seeded_host("h1", 8, 16_384, 200);
    let fleet = registry_with(&dir, vec![host.clone()]);

    let newer = sample(10.0, 1_024, 10);
    let mut older = sample(20.0, 2_048, 20);
    older.timestamp = newer.timestamp - chrono::Duration::seconds(30);

    fleet
        .apply_probe("h1", online_report(&host, newer))
        .unwrap();
    // Out-of-order sample is dropped, status still refreshed.
    fleet
        .apply_probe("h1", online_report(&host, older))
        .unwrap();

    let stored = fleet.get("h1").unwrap();
    assert_eq!(stored.metrics_history.len(), 1);
    assert!((stored.latest_metrics().unwrap().cpu_usage - 10.0).abs() < 1e-9);
}

#[test]
fn probe_state_round_trips_through_disk() {
    let dir = TempDir::new().unwrap();
    let host = seeded_host("h1", 8, 16_384, 200);
    let fleet = registry_with(&dir, vec![host.clone()]);
    fleet
        .apply_probe("h1", online_report(&host, sample(42.0, 3_000, 70)))
        .unwrap();

    let reloaded = FleetRegistry::load(dir.path(), TimeoutConfig::default()).unwrap();
    let stored = reloaded.get("h1").unwrap();
    assert_eq!(stored.status, HostStatus::Online);
    assert_eq!(stored.metrics_history.len(), 1);
    assert!((stored.latest_metrics().unwrap().cpu_usage - 42.0).abs() < 1e-9);
}
