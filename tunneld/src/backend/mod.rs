// Platform collaborators driven by the orchestrator

//! Platform collaborators
//!
//! The orchestrator never touches the kernel directly. It sequences calls on
//! these traits, which a platform implements once and injects at startup.
//! Every method is blocking and must be idempotent: creating something that
//! exists or deleting something that is already gone counts as success.

use crate::interface::{InterfaceConfig, IpPrefix};
use anyhow::{Context, Result};
use std::process::Command;

pub mod hook;
pub mod iputils;
pub mod linux;
pub mod resolved;
pub mod routes;
pub mod wireguard;

#[cfg(test)]
pub mod mock;

/// Live statistics for one WireGuard peer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerStatus {
    /// Base64 public key
    pub public_key: String,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    /// Milliseconds since the Unix epoch, 0 if no handshake happened yet
    pub last_handshake_ms: u64,
}

/// Phase passed to the platform run hook
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOp {
    Up,
    Down,
}

/// WireGuard interface, peer and route manipulation
pub trait WireguardUtils {
    fn interface_exists(&self) -> bool;

    fn interface_name(&self) -> &str;

    fn add_interface(&mut self, config: &InterfaceConfig) -> Result<()>;

    fn delete_interface(&mut self) -> Result<()>;

    /// Install or replace the peer described by `config`
    fn update_peer(&mut self, config: &InterfaceConfig) -> Result<()>;

    fn delete_peer(&mut self, config: &InterfaceConfig) -> Result<()>;

    fn get_peer_status(&self) -> Result<Vec<PeerStatus>>;

    /// Route `prefix` through the tunnel for the given hop
    fn update_route_prefix(&mut self, prefix: &IpPrefix, hop_index: u8) -> Result<()>;

    fn delete_route_prefix(&mut self, prefix: &IpPrefix, hop_index: u8) -> Result<()>;

    /// Force traffic to `address` to bypass the tunnel
    fn add_exclusion_route(&mut self, address: &IpPrefix) -> Result<()>;

    fn delete_exclusion_route(&mut self, address: &IpPrefix) -> Result<()>;
}

/// System resolver configuration
pub trait DnsUtils {
    fn update_resolvers(&mut self, ifname: &str, resolvers: &[std::net::IpAddr]) -> Result<()>;

    /// Put resolvers back the way they were before `update_resolvers`
    fn restore_resolvers(&mut self) -> Result<()>;
}

/// Interface address and link configuration
pub trait IpUtils {
    fn add_interface_ips(&mut self, config: &InterfaceConfig) -> Result<()>;

    fn set_mtu_and_up(&mut self, config: &InterfaceConfig) -> Result<()>;
}

/// The capability set of one platform.
///
/// Resolver and IP configuration are optional: platforms whose tunnel engine
/// handles them return `None`.
pub trait Platform {
    fn wireguard(&mut self) -> &mut dyn WireguardUtils;

    fn dns(&mut self) -> Option<&mut dyn DnsUtils> {
        None
    }

    fn ip(&mut self) -> Option<&mut dyn IpUtils> {
        None
    }

    /// Platform-specific finishing step after bring-up or before teardown
    fn run(&mut self, _op: RunOp, _config: &InterfaceConfig) -> bool {
        true
    }
}

/// Run `ip` with `args`.
///
/// A failure whose stderr contains one of `tolerated` counts as success; this
/// is how "already exists" and "no such route" become no-ops.
pub(crate) fn run_ip(args: &[String], tolerated: &[&str]) -> Result<()> {
    log::debug!("ip {}", args.join(" "));

    let output = Command::new("ip")
        .args(args)
        .output()
        .context("Failed to execute ip")?;

    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    if tolerated.iter().any(|msg| stderr.contains(msg)) {
        log::debug!("Ignoring: ip {}: {}", args.join(" "), stderr.trim());
        return Ok(());
    }

    anyhow::bail!("ip {} failed: {}", args.join(" "), stderr.trim())
}
