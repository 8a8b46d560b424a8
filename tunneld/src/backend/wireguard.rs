// Kernel WireGuard device control

//! WireGuard device and peer management through the kernel netlink API
//!
//! [`LinuxWireguard`] creates and deletes the interface, installs one peer
//! per hop and reads peer statistics with `wireguard-control`. Routing goes
//! through the owned [`RouteManager`], whose policy rules live as long as the
//! interface.

use super::routes::RouteManager;
use super::{PeerStatus, WireguardUtils};
use crate::interface::{short_key, InterfaceConfig, IpPrefix};
use anyhow::{Context, Result};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use wireguard_control::{Backend, Device, DeviceUpdate, InterfaceName, Key, PeerConfigBuilder};

/// Linux limit on interface names (IFNAMSIZ - 1)
const MAX_INTERFACE_NAME: usize = 15;

/// Validates that a name is safe to use in `ip` command lines.
/// Only allows alphanumeric characters, hyphens, and underscores.
fn validate_name(name: &str, field_name: &str) -> Result<()> {
    if name.is_empty() {
        anyhow::bail!("{} cannot be empty", field_name);
    }

    if name.len() > MAX_INTERFACE_NAME {
        anyhow::bail!(
            "{} '{}' is longer than {} bytes",
            field_name,
            name,
            MAX_INTERFACE_NAME
        );
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        anyhow::bail!(
            "{} contains invalid characters: '{}'. Only alphanumeric, hyphens, and underscores are allowed",
            field_name,
            name
        );
    }

    Ok(())
}

/// Validates that the interface name is usable for a kernel link.
///
/// # Errors
///
/// Returns an error if the name is empty, too long, or contains characters
/// other than alphanumerics, hyphens, and underscores.
pub fn validate_interface_name(name: &str) -> Result<()> {
    validate_name(name, "Interface name")
}

fn parse_key(base64: &str, what: &str) -> Result<Key> {
    Key::from_base64(base64.trim()).map_err(|_| anyhow::anyhow!("Invalid {}", what))
}

/// Peer settings applied to every hop
#[derive(Debug, Clone, Copy)]
pub struct PeerSettings {
    pub persistent_keepalive: u16,
    pub fwmark: u32,
}

/// Build the peer for one hop: endpoint plus every allowed-IP prefix
fn peer_builder(config: &InterfaceConfig, settings: PeerSettings) -> Result<PeerConfigBuilder> {
    let key = parse_key(&config.server_public_key, "server public key")?;
    let endpoint = config
        .endpoint()
        .context("Configuration has no server address")?;

    let mut peer = PeerConfigBuilder::new(&key)
        .set_endpoint(endpoint)
        .replace_allowed_ips();
    for prefix in &config.allowed_ips {
        peer = peer.add_allowed_ip(prefix.address(), prefix.prefix_len());
    }
    if settings.persistent_keepalive > 0 {
        peer = peer.set_persistent_keepalive_interval(settings.persistent_keepalive);
    }
    Ok(peer)
}

/// Milliseconds since the epoch, 0 for "never"
fn handshake_millis(time: Option<SystemTime>) -> u64 {
    time.and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Controller for the kernel WireGuard interface
pub struct LinuxWireguard {
    interface: String,
    name: InterfaceName,
    settings: PeerSettings,
    routes: RouteManager,
}

impl LinuxWireguard {
    /// # Errors
    ///
    /// Returns an error if the interface name is not a valid link name.
    pub fn new(interface: String, settings: PeerSettings, route_table: u32) -> Result<Self> {
        validate_interface_name(&interface)?;
        let name: InterfaceName = interface
            .parse()
            .with_context(|| format!("Invalid interface name: {}", interface))?;
        let routes = RouteManager::new(interface.clone(), route_table, settings.fwmark);

        Ok(Self {
            interface,
            name,
            settings,
            routes,
        })
    }

    fn device(&self) -> Result<Device> {
        Device::get(&self.name, Backend::Kernel).context("Failed to get WireGuard device info")
    }
}

impl WireguardUtils for LinuxWireguard {
    fn interface_exists(&self) -> bool {
        Path::new("/sys/class/net").join(&self.interface).exists()
    }

    fn interface_name(&self) -> &str {
        &self.interface
    }

    fn add_interface(&mut self, config: &InterfaceConfig) -> Result<()> {
        log::info!("Creating WireGuard interface: {}", self.interface);

        let args: Vec<String> = [
            "link",
            "add",
            "dev",
            self.interface.as_str(),
            "type",
            "wireguard",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        super::run_ip(&args, &["File exists"])?;

        let private_key = parse_key(config.private_key.expose(), "private key")?;
        DeviceUpdate::new()
            .set_private_key(private_key)
            .set_fwmark(self.settings.fwmark)
            .replace_peers()
            .apply(&self.name, Backend::Kernel)
            .context("Failed to configure WireGuard device")?;

        self.routes.install_rules()?;

        log::info!("WireGuard interface {} is up", self.interface);
        Ok(())
    }

    fn delete_interface(&mut self) -> Result<()> {
        log::info!("Deleting WireGuard interface: {}", self.interface);

        self.routes.remove_rules();

        let args: Vec<String> = ["link", "delete", "dev", self.interface.as_str()]
            .iter()
            .map(|s| s.to_string())
            .collect();
        super::run_ip(&args, &["Cannot find device"])?;

        log::info!("WireGuard interface {} is down", self.interface);
        Ok(())
    }

    fn update_peer(&mut self, config: &InterfaceConfig) -> Result<()> {
        let peer = peer_builder(config, self.settings)?;
        DeviceUpdate::new()
            .add_peer(peer)
            .apply(&self.name, Backend::Kernel)
            .with_context(|| {
                format!(
                    "Failed to install peer {}",
                    short_key(&config.server_public_key)
                )
            })?;

        log::info!(
            "Peer {} installed for hop {} ({} allowed prefixes)",
            short_key(&config.server_public_key),
            config.hop_index,
            config.allowed_ips.len()
        );
        Ok(())
    }

    fn delete_peer(&mut self, config: &InterfaceConfig) -> Result<()> {
        let key = parse_key(&config.server_public_key, "server public key")?;
        DeviceUpdate::new()
            .remove_peer_by_key(&key)
            .apply(&self.name, Backend::Kernel)
            .with_context(|| {
                format!(
                    "Failed to remove peer {}",
                    short_key(&config.server_public_key)
                )
            })?;

        log::info!("Peer {} removed", short_key(&config.server_public_key));
        Ok(())
    }

    fn get_peer_status(&self) -> Result<Vec<PeerStatus>> {
        let device = self.device()?;

        Ok(device
            .peers
            .into_iter()
            .map(|peer| PeerStatus {
                public_key: peer.config.public_key.to_base64(),
                rx_bytes: peer.stats.rx_bytes,
                tx_bytes: peer.stats.tx_bytes,
                last_handshake_ms: handshake_millis(peer.stats.last_handshake_time),
            })
            .collect())
    }

    fn update_route_prefix(&mut self, prefix: &IpPrefix, hop_index: u8) -> Result<()> {
        self.routes.add_route(prefix, hop_index)
    }

    fn delete_route_prefix(&mut self, prefix: &IpPrefix, hop_index: u8) -> Result<()> {
        self.routes.delete_route(prefix, hop_index)
    }

    fn add_exclusion_route(&mut self, address: &IpPrefix) -> Result<()> {
        self.routes.add_exclusion(address)
    }

    fn delete_exclusion_route(&mut self, address: &IpPrefix) -> Result<()> {
        self.routes.delete_exclusion(address)
    }
}
