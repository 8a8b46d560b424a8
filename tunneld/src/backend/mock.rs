//! Recording fake platform for orchestrator tests

use super::{DnsUtils, IpUtils, PeerStatus, Platform, RunOp, WireguardUtils};
use crate::interface::{InterfaceConfig, IpPrefix};
use anyhow::Result;
use std::collections::{BTreeSet, HashSet};
use std::net::IpAddr;

/// One backend call, in the order the orchestrator made it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    AddInterface,
    DeleteInterface,
    UpdatePeer(String),
    DeletePeer(String),
    UpdateRoute(String, u8),
    DeleteRoute(String, u8),
    AddExclusion(String),
    DeleteExclusion(String),
    UpdateResolvers(Vec<IpAddr>),
    RestoreResolvers,
    AddInterfaceIps(u8),
    SetMtuAndUp(u8),
    Run(RunOp, u8),
}

#[derive(Debug, Default)]
pub struct MockPlatform {
    pub calls: Vec<Call>,
    pub interface_up: bool,
    /// Peers installed on the fake interface, by public key
    pub peers: BTreeSet<String>,
    pub routes: BTreeSet<(String, u8)>,
    pub exclusions: BTreeSet<String>,
    /// Handshake times reported by `get_peer_status`, by public key
    pub handshakes: Vec<(String, u64)>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    /// Operation names that should fail, e.g. "update_peer"
    pub failing: HashSet<&'static str>,
    /// Hide the DNS and IP collaborators
    pub minimal: bool,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&mut self, op: &'static str) {
        self.failing.insert(op);
    }

    pub fn succeed(&mut self, op: &'static str) {
        self.failing.remove(op);
    }

    /// Make the fake kernel report a completed handshake for `public_key`
    pub fn handshake(&mut self, public_key: &str, at_ms: u64) {
        self.handshakes.retain(|(k, _)| k != public_key);
        self.handshakes.push((public_key.to_string(), at_ms));
    }

    pub fn count(&self, call: &Call) -> usize {
        self.calls.iter().filter(|c| *c == call).count()
    }

    pub fn clear_calls(&mut self) {
        self.calls.clear();
    }

    fn check(&self, op: &'static str) -> Result<()> {
        if self.failing.contains(op) {
            anyhow::bail!("mock {} failure", op);
        }
        Ok(())
    }
}

impl WireguardUtils for MockPlatform {
    fn interface_exists(&self) -> bool {
        self.interface_up
    }

    fn interface_name(&self) -> &str {
        "wgmock0"
    }

    fn add_interface(&mut self, _config: &InterfaceConfig) -> Result<()> {
        self.calls.push(Call::AddInterface);
        self.check("add_interface")?;
        self.interface_up = true;
        Ok(())
    }

    fn delete_interface(&mut self) -> Result<()> {
        self.calls.push(Call::DeleteInterface);
        self.check("delete_interface")?;
        self.interface_up = false;
        self.peers.clear();
        self.routes.clear();
        Ok(())
    }

    fn update_peer(&mut self, config: &InterfaceConfig) -> Result<()> {
        self.calls
            .push(Call::UpdatePeer(config.server_public_key.clone()));
        self.check("update_peer")?;
        self.peers.insert(config.server_public_key.clone());
        Ok(())
    }

    fn delete_peer(&mut self, config: &InterfaceConfig) -> Result<()> {
        self.calls
            .push(Call::DeletePeer(config.server_public_key.clone()));
        self.check("delete_peer")?;
        self.peers.remove(&config.server_public_key);
        Ok(())
    }

    fn get_peer_status(&self) -> Result<Vec<PeerStatus>> {
        self.check("get_peer_status")?;
        Ok(self
            .peers
            .iter()
            .map(|key| PeerStatus {
                public_key: key.clone(),
                rx_bytes: self.rx_bytes,
                tx_bytes: self.tx_bytes,
                last_handshake_ms: self
                    .handshakes
                    .iter()
                    .find(|(k, _)| k == key)
                    .map(|(_, ms)| *ms)
                    .unwrap_or(0),
            })
            .collect())
    }

    fn update_route_prefix(&mut self, prefix: &IpPrefix, hop_index: u8) -> Result<()> {
        self.calls
            .push(Call::UpdateRoute(prefix.to_string(), hop_index));
        self.check("update_route_prefix")?;
        self.routes.insert((prefix.to_string(), hop_index));
        Ok(())
    }

    fn delete_route_prefix(&mut self, prefix: &IpPrefix, hop_index: u8) -> Result<()> {
        self.calls
            .push(Call::DeleteRoute(prefix.to_string(), hop_index));
        self.check("delete_route_prefix")?;
        self.routes.remove(&(prefix.to_string(), hop_index));
        Ok(())
    }

    fn add_exclusion_route(&mut self, address: &IpPrefix) -> Result<()> {
        self.calls.push(Call::AddExclusion(address.to_string()));
        self.check("add_exclusion_route")?;
        self.exclusions.insert(address.to_string());
        Ok(())
    }

    fn delete_exclusion_route(&mut self, address: &IpPrefix) -> Result<()> {
        self.calls.push(Call::DeleteExclusion(address.to_string()));
        self.check("delete_exclusion_route")?;
        self.exclusions.remove(&address.to_string());
        Ok(())
    }
}

impl DnsUtils for MockPlatform {
    fn update_resolvers(&mut self, _ifname: &str, resolvers: &[IpAddr]) -> Result<()> {
        self.calls.push(Call::UpdateResolvers(resolvers.to_vec()));
        self.check("update_resolvers")
    }

    fn restore_resolvers(&mut self) -> Result<()> {
        self.calls.push(Call::RestoreResolvers);
        self.check("restore_resolvers")
    }
}

impl IpUtils for MockPlatform {
    fn add_interface_ips(&mut self, config: &InterfaceConfig) -> Result<()> {
        self.calls.push(Call::AddInterfaceIps(config.hop_index));
        self.check("add_interface_ips")
    }

    fn set_mtu_and_up(&mut self, config: &InterfaceConfig) -> Result<()> {
        self.calls.push(Call::SetMtuAndUp(config.hop_index));
        self.check("set_mtu_and_up")
    }
}

impl Platform for MockPlatform {
    fn wireguard(&mut self) -> &mut dyn WireguardUtils {
        self
    }

    fn dns(&mut self) -> Option<&mut dyn DnsUtils> {
        if self.minimal {
            None
        } else {
            Some(self)
        }
    }

    fn ip(&mut self) -> Option<&mut dyn IpUtils> {
        if self.minimal {
            None
        } else {
            Some(self)
        }
    }

    fn run(&mut self, op: RunOp, config: &InterfaceConfig) -> bool {
        self.calls.push(Call::Run(op, config.hop_index));
        let name = match op {
            RunOp::Up => "run_up",
            RunOp::Down => "run_down",
        };
        !self.failing.contains(name)
    }
}
