//! Shared fixtures for the integration tests

#![allow(dead_code)]

use ghosty_core::{EventBus, GhostyConfig, Orchestrator, SimulatedHost};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

pub const ORIGINAL: &str = "aa:bb:cc:dd:ee:01";

/// Default configuration with millisecond-scale waits
pub fn fast_config() -> GhostyConfig {
    let mut config = GhostyConfig::default();
    config.tunnel.startup_grace_ms = 20;
    config.tunnel.stop_timeout_ms = 50;
    config.tunnel.establish_settle_ms = 0;
    config.anonymity.service_settle_ms = 0;
    config.anonymity.full_settle_ms = 0;
    config.anonymity.rotation_stop_timeout_ms = 50;
    config
}

pub fn orchestrator(host: &SimulatedHost) -> Orchestrator {
    orchestrator_with(host, fast_config())
}

pub fn orchestrator_with(host: &SimulatedHost, config: GhostyConfig) -> Orchestrator {
    Orchestrator::new(Arc::new(host.clone()), &config, EventBus::new())
}

/// A temp dir holding an existing tunnel config file
pub fn tunnel_config() -> (TempDir, PathBuf) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("client.ovpn");
    std::fs::write(&path, "client\ndev tun\nremote vpn.example.net 1194\n").unwrap();
    (dir, path)
}

/// Index of the first journal entry equal to `entry`
pub fn position(journal: &[String], entry: &str) -> usize {
    journal
        .iter()
        .position(|e| e == entry)
        .unwrap_or_else(|| panic!("{:?} not in journal {:#?}", entry, journal))
}
