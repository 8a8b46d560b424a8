// Connection orchestrator

//! Connection orchestrator
//!
//! [`Daemon`] decides which network configuration must exist at any moment
//! and drives it into place through the platform collaborators: interface,
//! peers, allowed-IP routes, exclusion routes and resolvers, for one or two
//! hops. It owns the per-hop connection map, the exclusion refcount table and
//! the handshake monitor, and publishes `connected` / `disconnected`
//! notifications on a broadcast channel.
//!
//! Every entry point runs to completion on the caller's thread; the event
//! loop in `main` is the only caller, which serialises them.

use crate::backend::{Platform, RunOp};
use crate::exclusions::ExclusionTable;
use crate::handshake::HandshakeMonitor;
use crate::interface::{short_key, InterfaceConfig, IpPrefix, PRIMARY_HOP};
use crate::types::DaemonState;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Instant;
use tokio::sync::broadcast;

/// Capacity of the notification channel
const EVENT_CHANNEL_SIZE: usize = 32;

/// Notifications for control clients
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonEvent {
    /// The handshake with this peer completed
    Connected { pubkey: String },
    Disconnected,
    /// The interface disappeared underneath an active connection
    BackendFailure,
}

/// Runtime record of one active hop
#[derive(Debug, Clone)]
pub struct ConnectionState {
    pub config: InterfaceConfig,
    /// Time of the first confirmed handshake, `None` while pending
    pub handshake: Option<DateTime<Utc>>,
}

impl ConnectionState {
    pub fn new(config: InterfaceConfig) -> Self {
        Self {
            config,
            handshake: None,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.handshake.is_some()
    }
}

/// Reply to a `status` request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_ipv4_gateway: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_ipv4_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rx_bytes: Option<u64>,
}

impl Status {
    pub fn disconnected() -> Self {
        Self::default()
    }
}

pub struct Daemon<P: Platform> {
    platform: P,
    connections: BTreeMap<u8, ConnectionState>,
    exclusions: ExclusionTable,
    handshake: HandshakeMonitor,
    events: broadcast::Sender<DaemonEvent>,
}

impl<P: Platform> Daemon<P> {
    pub fn new(platform: P, handshake: HandshakeMonitor) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        log::debug!("Daemon created");
        Self {
            platform,
            connections: BTreeMap::new(),
            exclusions: ExclusionTable::new(),
            handshake,
            events,
        }
    }

    /// Receive `connected` / `disconnected` / `backendFailure` notifications
    pub fn subscribe(&self) -> broadcast::Receiver<DaemonEvent> {
        self.events.subscribe()
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }

    pub fn connections(&self) -> &BTreeMap<u8, ConnectionState> {
        &self.connections
    }

    pub fn exclusions(&self) -> &ExclusionTable {
        &self.exclusions
    }

    pub fn state(&self) -> DaemonState {
        if self.connections.is_empty() {
            DaemonState::Inactive
        } else if self.connections.values().all(ConnectionState::is_confirmed) {
            DaemonState::Connected
        } else {
            DaemonState::Connecting
        }
    }

    /// When the handshake monitor wants to run next, if at all
    pub fn handshake_deadline(&self) -> Option<Instant> {
        self.handshake.deadline()
    }

    /// Bring up (or update) the hop described by `config`.
    ///
    /// An already connected hop with the same device identity gets its server
    /// switched in place; any other change tears the whole interface down
    /// first. Aborts at the first failing step without rolling back earlier
    /// steps, so on error the caller should `deactivate` to get a clean state.
    pub fn activate(&mut self, config: InterfaceConfig) -> Result<()> {
        let hop = config.hop_index;

        let same_device = self
            .connections
            .get(&hop)
            .map(|current| current.config.same_device(&config));

        match same_device {
            Some(true) => {
                log::debug!("Hop {} already connected, switching server", hop);
                self.switch_server(config)
            }
            Some(false) => {
                log::warn!(
                    "Hop {} already connected with a different device, reconnecting",
                    hop
                );
                self.deactivate(false)
                    .context("Failed to tear down the previous connection")?;
                self.activate(config)
            }
            None => self.activate_hop(config),
        }
    }

    fn activate_hop(&mut self, config: InterfaceConfig) -> Result<()> {
        let hop = config.hop_index;
        log::info!(
            "Activating hop {} with server {}",
            hop,
            short_key(&config.server_public_key)
        );

        let wg = self.platform.wireguard();
        if !wg.interface_exists() {
            wg.add_interface(&config)
                .context("Interface creation failed")?;
        }

        self.add_exclusions(&config.excluded_addresses)?;

        self.platform
            .wireguard()
            .update_peer(&config)
            .context("Peer creation failed")?;

        if config.is_primary() {
            self.update_resolvers(&config)?;
        }

        if let Some(ip) = self.platform.ip() {
            ip.add_interface_ips(&config)
                .context("Failed to assign interface addresses")?;
            ip.set_mtu_and_up(&config)
                .context("Failed to bring the interface up")?;
        }

        for prefix in &config.allowed_ips {
            self.platform
                .wireguard()
                .update_route_prefix(prefix, hop)
                .with_context(|| format!("Routing configuration failed for {}", prefix))?;
        }

        let status = self.platform.run(RunOp::Up, &config);
        log::debug!("Hop {} connection status: {}", hop, status);
        if !status {
            anyhow::bail!("Platform bring-up failed for hop {}", hop);
        }

        self.connections.insert(hop, ConnectionState::new(config));
        self.handshake.start(Instant::now());
        Ok(())
    }

    /// Take a reference on each address, installing routes for first references.
    ///
    /// A reference is only counted once its route is in place.
    fn add_exclusions(&mut self, addresses: &[IpPrefix]) -> Result<()> {
        for address in addresses {
            if self.exclusions.count(address) == 0 {
                self.platform
                    .wireguard()
                    .add_exclusion_route(address)
                    .with_context(|| format!("Failed to exclude {} from the tunnel", address))?;
            }
            self.exclusions.increment(*address);
        }
        Ok(())
    }

    fn update_resolvers(&mut self, config: &InterfaceConfig) -> Result<()> {
        let ifname = self.platform.wireguard().interface_name().to_string();
        let Some(dns) = self.platform.dns() else {
            return Ok(());
        };

        let resolvers = config.resolvers();
        if resolvers.is_empty() {
            log::warn!("No resolver or gateway address available, leaving DNS untouched");
            return Ok(());
        }

        log::debug!("Setting resolvers for {}: {:?}", ifname, resolvers);
        dns.update_resolvers(&ifname, &resolvers)
            .context("Failed to update DNS resolvers")
    }

    /// Tear down every hop and the interface.
    ///
    /// Best effort: individual backend failures are logged and teardown
    /// continues, and the connection map and exclusion table are always
    /// emptied. Calling this while already torn down succeeds without
    /// touching the backend.
    pub fn deactivate(&mut self, emit_signals: bool) -> Result<()> {
        if self.connections.is_empty()
            && self.exclusions.is_empty()
            && !self.platform.wireguard().interface_exists()
        {
            log::debug!("Already deactivated");
            self.handshake.cancel();
            if emit_signals {
                self.emit(DaemonEvent::Disconnected);
            }
            return Ok(());
        }

        log::info!("Deactivating {} hop(s)", self.connections.len());

        // The primary hop's hook goes first so clients see the disconnect early
        let mut primary_down = true;
        if let Some(primary) = self.connections.values().next() {
            if !self.platform.run(RunOp::Down, &primary.config) {
                log::error!("Platform teardown failed for hop {}", primary.config.hop_index);
                primary_down = false;
            }
        }

        if let Some(dns) = self.platform.dns() {
            if let Err(e) = dns.restore_resolvers() {
                log::warn!("Failed to restore DNS resolvers: {:#}", e);
            }
        }

        let mut result = Ok(());
        let interface_present = self.platform.wireguard().interface_exists();

        if interface_present {
            for (hop, state) in &self.connections {
                log::debug!("Deleting routes for hop {}", hop);
                let wg = self.platform.wireguard();
                for prefix in &state.config.allowed_ips {
                    if let Err(e) = wg.delete_route_prefix(prefix, *hop) {
                        log::warn!("Failed to delete route {} for hop {}: {:#}", prefix, hop, e);
                    }
                }
                if let Err(e) = wg.delete_peer(&state.config) {
                    log::warn!("Failed to delete peer for hop {}: {:#}", hop, e);
                }
            }
        } else {
            log::error!(
                "Interface {} is missing during teardown",
                self.platform.wireguard().interface_name()
            );
            result = Err(anyhow::anyhow!("Interface missing during teardown"));
        }

        // Cleared even if some deletions fail; the kernel may keep stale routes
        for address in self.exclusions.drain() {
            if let Err(e) = self.platform.wireguard().delete_exclusion_route(&address) {
                log::warn!("Failed to delete exclusion route {}: {:#}", address, e);
            }
        }

        if interface_present {
            if let Err(e) = self.platform.wireguard().delete_interface() {
                log::error!("Failed to delete interface: {:#}", e);
                result = Err(e.context("Interface deletion failed"));
            }
        }

        self.connections.clear();
        self.handshake.cancel();

        if !primary_down {
            result = result.and(Err(anyhow::anyhow!("Platform teardown failed")));
        } else if emit_signals {
            self.emit(DaemonEvent::Disconnected);
        }

        result
    }

    /// Replace the peer of an already connected hop without touching the
    /// interface or resolvers.
    ///
    /// Route failures for the new peer are logged but do not abort the switch.
    pub fn switch_server(&mut self, config: InterfaceConfig) -> Result<()> {
        let hop = config.hop_index;
        let last = self
            .connections
            .get(&hop)
            .map(|state| state.config.clone())
            .with_context(|| format!("Hop {} is not connected", hop))?;

        log::info!(
            "Switching hop {} from {} to {}",
            hop,
            short_key(&last.server_public_key),
            short_key(&config.server_public_key)
        );

        let added: Vec<IpPrefix> = config
            .excluded_addresses
            .iter()
            .filter(|address| !last.excluded_addresses.contains(address))
            .copied()
            .collect();
        self.add_exclusions(&added)?;

        let wg = self.platform.wireguard();
        wg.update_peer(&config)
            .context("Server switch failed to update the peer")?;
        for prefix in &config.allowed_ips {
            if let Err(e) = wg.update_route_prefix(prefix, hop) {
                log::error!("Server switch failed to route {}: {:#}", prefix, e);
            }
        }

        for prefix in last
            .allowed_ips
            .iter()
            .filter(|prefix| !config.allowed_ips.contains(prefix))
        {
            if let Err(e) = wg.delete_route_prefix(prefix, hop) {
                log::warn!("Failed to delete stale route {}: {:#}", prefix, e);
            }
        }

        for address in last
            .excluded_addresses
            .iter()
            .filter(|address| !config.excluded_addresses.contains(address))
        {
            if self.exclusions.decrement(*address) {
                if let Err(e) = self.platform.wireguard().delete_exclusion_route(address) {
                    log::warn!("Failed to delete exclusion route {}: {:#}", address, e);
                }
            }
        }

        if config.server_public_key != last.server_public_key {
            self.platform
                .wireguard()
                .delete_peer(&last)
                .context("Server switch failed to remove the previous peer")?;
        }

        self.connections.insert(hop, ConnectionState::new(config));
        self.handshake.start(Instant::now());
        Ok(())
    }

    /// Status of the primary hop as seen by the kernel
    pub fn get_status(&mut self) -> Status {
        let Some(connection) = self.connections.get(&PRIMARY_HOP) else {
            return Status::disconnected();
        };

        let wg = self.platform.wireguard();
        if !wg.interface_exists() {
            return Status::disconnected();
        }

        let peers = match wg.get_peer_status() {
            Ok(peers) => peers,
            Err(e) => {
                log::warn!("Failed to query peer status: {:#}", e);
                return Status::disconnected();
            }
        };

        let config = &connection.config;
        match peers
            .iter()
            .find(|peer| peer.public_key == config.server_public_key)
        {
            Some(peer) => Status {
                connected: true,
                server_ipv4_gateway: config.server_ipv4_gateway.map(|gw| gw.to_string()),
                device_ipv4_address: config.device_ipv4_address.map(|addr| addr.to_string()),
                date: connection.handshake.map(|date| date.to_rfc3339()),
                tx_bytes: Some(peer.tx_bytes),
                rx_bytes: Some(peer.rx_bytes),
            },
            None => {
                log::warn!(
                    "Peer {} is not on the interface, reporting disconnected",
                    short_key(&config.server_public_key)
                );
                Status::disconnected()
            }
        }
    }

    /// One handshake monitor tick: a single peer query shared by all hops
    pub fn check_handshake(&mut self) {
        log::debug!("Checking for handshake...");

        if self.connections.is_empty() {
            self.handshake.cancel();
            return;
        }

        let wg = self.platform.wireguard();
        if !wg.interface_exists() {
            log::error!(
                "Interface {} disappeared while hops are active",
                wg.interface_name()
            );
            self.handshake.cancel();
            self.emit(DaemonEvent::BackendFailure);
            return;
        }

        let peers = wg.get_peer_status().unwrap_or_else(|e| {
            log::warn!("Failed to query peer status: {:#}", e);
            Vec::new()
        });

        let confirmed = self
            .handshake
            .tick(&peers, &mut self.connections, Instant::now());
        for pubkey in confirmed {
            self.emit(DaemonEvent::Connected { pubkey });
        }
    }

    fn emit(&self, event: DaemonEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}
