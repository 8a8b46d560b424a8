//! Interface address and link configuration via `ip`

use super::{run_ip, IpUtils};
use crate::interface::{InterfaceConfig, IpPrefix};
use anyhow::{Context, Result};
use std::net::IpAddr;

/// Addresses currently assigned to `interface`
fn interface_addresses(interface: &str) -> Result<Vec<IpAddr>> {
    let interfaces = if_addrs::get_if_addrs().context("Failed to get interface addresses")?;

    Ok(interfaces
        .into_iter()
        .filter(|iface| iface.name == interface)
        .map(|iface| iface.ip())
        .collect())
}

/// Device prefixes not yet present in `assigned`
fn missing_addresses(config: &InterfaceConfig, assigned: &[IpAddr]) -> Vec<IpPrefix> {
    [config.device_ipv4_address, config.device_ipv6_address]
        .into_iter()
        .flatten()
        .filter(|prefix| !assigned.contains(&prefix.address()))
        .collect()
}

pub struct LinuxIpUtils {
    interface: String,
    mtu: u16,
}

impl LinuxIpUtils {
    pub fn new(interface: String, mtu: u16) -> Self {
        Self { interface, mtu }
    }
}

impl IpUtils for LinuxIpUtils {
    fn add_interface_ips(&mut self, config: &InterfaceConfig) -> Result<()> {
        let assigned = interface_addresses(&self.interface).unwrap_or_else(|e| {
            log::warn!("{:#}", e);
            Vec::new()
        });

        for prefix in missing_addresses(config, &assigned) {
            let args = vec![
                "addr".to_string(),
                "replace".to_string(),
                prefix.to_string(),
                "dev".to_string(),
                self.interface.clone(),
            ];
            run_ip(&args, &[])
                .with_context(|| format!("Failed to assign {} to {}", prefix, self.interface))?;
            log::info!("Assigned {} to {}", prefix, self.interface);
        }
        Ok(())
    }

    fn set_mtu_and_up(&mut self, _config: &InterfaceConfig) -> Result<()> {
        let args = vec![
            "link".to_string(),
            "set".to_string(),
            "dev".to_string(),
            self.interface.clone(),
            "mtu".to_string(),
            self.mtu.to_string(),
            "up".to_string(),
        ];
        run_ip(&args, &[]).with_context(|| format!("Failed to bring up {}", self.interface))?;
        log::debug!("{} is up with mtu {}", self.interface, self.mtu);
        Ok(())
    }
}
