// systemd-resolved integration via D-Bus

//! Per-link DNS configuration through systemd-resolved
//!
//! The tunnel link gets the resolver list, the catch-all routing domain `~.`
//! and the default-route flag, so every query goes through the tunnel.
//! Restoring is a `RevertLink` on the same link.

use super::DnsUtils;
use anyhow::{Context, Result};
use std::fs;
use std::net::IpAddr;
use zbus::blocking::Connection;
use zbus::proxy;

const AF_INET: i32 = 2;
const AF_INET6: i32 = 10;

/// D-Bus proxy for the resolved manager object
#[proxy(
    interface = "org.freedesktop.resolve1.Manager",
    default_service = "org.freedesktop.resolve1",
    default_path = "/org/freedesktop/resolve1"
)]
trait Resolve1Manager {
    /// Set the DNS servers of a link as (address family, address bytes)
    #[zbus(name = "SetLinkDNS")]
    fn set_link_dns(&self, ifindex: i32, addresses: &[(i32, Vec<u8>)]) -> zbus::Result<()>;

    /// Set the search and routing domains of a link
    fn set_link_domains(&self, ifindex: i32, domains: &[(&str, bool)]) -> zbus::Result<()>;

    fn set_link_default_route(&self, ifindex: i32, enable: bool) -> zbus::Result<()>;

    /// Drop all per-link settings
    fn revert_link(&self, ifindex: i32) -> zbus::Result<()>;
}

/// Resolver entries in the wire form `SetLinkDNS` expects
fn dns_entries(resolvers: &[IpAddr]) -> Vec<(i32, Vec<u8>)> {
    resolvers
        .iter()
        .map(|addr| match addr {
            IpAddr::V4(v4) => (AF_INET, v4.octets().to_vec()),
            IpAddr::V6(v6) => (AF_INET6, v6.octets().to_vec()),
        })
        .collect()
}

fn link_index(ifname: &str) -> Result<i32> {
    let path = format!("/sys/class/net/{}/ifindex", ifname);
    let contents =
        fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path))?;
    contents
        .trim()
        .parse()
        .with_context(|| format!("Invalid ifindex for {}", ifname))
}

/// DNS control through systemd-resolved
#[derive(Default)]
pub struct ResolvedDns {
    connection: Option<Connection>,
    /// Link whose settings we changed
    link: Option<i32>,
}

impl ResolvedDns {
    pub fn new() -> Self {
        Self::default()
    }

    fn proxy(&mut self) -> Result<Resolve1ManagerProxyBlocking<'static>> {
        let connection = match &self.connection {
            Some(connection) => connection.clone(),
            None => {
                let connection =
                    Connection::system().context("Failed to connect to system D-Bus")?;
                self.connection = Some(connection.clone());
                connection
            }
        };

        Resolve1ManagerProxyBlocking::new(&connection)
            .context("Failed to create systemd-resolved proxy")
    }
}

impl DnsUtils for ResolvedDns {
    fn update_resolvers(&mut self, ifname: &str, resolvers: &[IpAddr]) -> Result<()> {
        let ifindex = link_index(ifname)?;
        let proxy = self.proxy()?;

        proxy
            .set_link_dns(ifindex, &dns_entries(resolvers))
            .context("SetLinkDNS failed")?;
        self.link = Some(ifindex);

        proxy
            .set_link_domains(ifindex, &[("~.", true)])
            .context("SetLinkDomains failed")?;

        // Not available before systemd 240
        if let Err(e) = proxy.set_link_default_route(ifindex, true) {
            log::warn!("SetLinkDefaultRoute failed: {}", e);
        }

        log::info!("DNS for {} (link {}) set to {:?}", ifname, ifindex, resolvers);
        Ok(())
    }

    fn restore_resolvers(&mut self) -> Result<()> {
        let Some(ifindex) = self.link.take() else {
            return Ok(());
        };

        self.proxy()?
            .revert_link(ifindex)
            .with_context(|| format!("RevertLink failed for link {}", ifindex))?;
        log::info!("DNS settings reverted for link {}", ifindex);
        Ok(())
    }
}
