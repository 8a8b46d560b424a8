// Per-hop tunnel configuration

//! Per-hop tunnel configuration
//!
//! This module turns the payload of an `activate` control request into a
//! validated [`InterfaceConfig`]: one hop's keys, addresses, peer endpoint,
//! resolver, allowed-IP prefixes and excluded addresses.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use zeroize::Zeroize;

/// Hop index of the primary (or only) hop
pub const PRIMARY_HOP: u8 = 0;

/// Hop index of the entry server of a two-hop connection
pub const ENTRY_HOP: u8 = 1;

/// An address with a prefix length, e.g. `10.0.0.0/8` or a single host `10.0.0.1/32`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IpPrefix {
    address: IpAddr,
    prefix_len: u8,
}

impl IpPrefix {
    /// Create a prefix, rejecting lengths longer than the address family allows
    pub fn new(address: IpAddr, prefix_len: u8) -> Result<Self> {
        let max = max_prefix_len(&address);
        if prefix_len > max {
            anyhow::bail!(
                "Prefix length {} exceeds {} for {}",
                prefix_len,
                max,
                address
            );
        }
        Ok(Self {
            address,
            prefix_len,
        })
    }

    /// A single-host prefix (/32 or /128)
    pub fn host(address: IpAddr) -> Self {
        Self {
            prefix_len: max_prefix_len(&address),
            address,
        }
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn is_ipv6(&self) -> bool {
        self.address.is_ipv6()
    }
}

fn max_prefix_len(address: &IpAddr) -> u8 {
    match address {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

impl fmt::Display for IpPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

impl FromStr for IpPrefix {
    type Err = anyhow::Error;

    /// Accepts `addr/len` or a bare address literal (treated as a host prefix)
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        match s.split_once('/') {
            Some((address, len)) => {
                let address: IpAddr = address
                    .parse()
                    .with_context(|| format!("Invalid IP address: {}", address))?;
                let len: u8 = len
                    .parse()
                    .with_context(|| format!("Invalid prefix length: {}", len))?;
                Self::new(address, len)
            }
            None => {
                let address: IpAddr = s
                    .parse()
                    .with_context(|| format!("Invalid IP address: {}", s))?;
                Ok(Self::host(address))
            }
        }
    }
}

/// WireGuard private key material (base64)
///
/// The key is redacted from `Debug` output and wiped from memory on drop.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct PrivateKey(String);

impl PrivateKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Access the base64 key material
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(<redacted>)")
    }
}

impl Drop for PrivateKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// Abbreviate a base64 public key for log output
pub fn short_key(key: &str) -> &str {
    key.get(..8).unwrap_or(key)
}

/// One entry of `allowedIPAddressRanges` as sent by the client
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawAddressRange {
    pub address: String,
    pub range: f64,
    pub is_ipv6: bool,
}

/// `activate` request payload exactly as it appears on the wire
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawInterfaceConfig {
    pub private_key: PrivateKey,
    pub server_public_key: String,
    pub server_port: f64,
    pub device_ipv4_address: Option<String>,
    pub device_ipv6_address: Option<String>,
    pub server_ipv4_addr_in: Option<String>,
    pub server_ipv6_addr_in: Option<String>,
    pub server_ipv4_gateway: Option<String>,
    pub server_ipv6_gateway: Option<String>,
    pub dns_server: Option<String>,
    #[serde(rename = "hopindex")]
    pub hop_index: Option<u8>,
    #[serde(rename = "allowedIPAddressRanges")]
    pub allowed_ip_address_ranges: Vec<RawAddressRange>,
    #[serde(default)]
    pub excluded_addresses: Vec<String>,
    #[serde(default)]
    pub vpn_disabled_apps: Vec<String>,
}

/// Validated configuration for one hop of the tunnel
#[derive(Debug, Clone, PartialEq)]
pub struct InterfaceConfig {
    pub hop_index: u8,
    pub private_key: PrivateKey,
    pub device_ipv4_address: Option<IpPrefix>,
    pub device_ipv6_address: Option<IpPrefix>,
    pub server_public_key: String,
    pub server_ipv4_addr_in: Option<Ipv4Addr>,
    pub server_ipv6_addr_in: Option<Ipv6Addr>,
    pub server_port: u16,
    pub server_ipv4_gateway: Option<Ipv4Addr>,
    pub server_ipv6_gateway: Option<Ipv6Addr>,
    pub dns_server: Option<IpAddr>,
    /// Sorted longest-prefix-first
    pub allowed_ips: Vec<IpPrefix>,
    /// Deduplicated, in request order
    pub excluded_addresses: Vec<IpPrefix>,
    pub vpn_disabled_apps: Vec<String>,
}

impl InterfaceConfig {
    pub fn is_primary(&self) -> bool {
        self.hop_index == PRIMARY_HOP
    }

    /// True when `other` only differs from `self` in its server/peer.
    ///
    /// Such a change can be applied in place by replacing the peer instead of
    /// rebuilding the interface.
    pub fn same_device(&self, other: &InterfaceConfig) -> bool {
        self.private_key == other.private_key
            && self.device_ipv4_address == other.device_ipv4_address
            && self.device_ipv6_address == other.device_ipv6_address
            && self.server_ipv4_gateway == other.server_ipv4_gateway
            && self.server_ipv6_gateway == other.server_ipv6_gateway
    }

    /// Peer endpoint, preferring IPv4
    pub fn endpoint(&self) -> Option<SocketAddr> {
        self.server_ipv4_addr_in
            .map(IpAddr::V4)
            .or(self.server_ipv6_addr_in.map(IpAddr::V6))
            .map(|ip| SocketAddr::new(ip, self.server_port))
    }

    /// Resolvers to push for this hop.
    ///
    /// The explicit `dnsServer` wins, otherwise the peer's gateway is used. A
    /// resolver that is the IPv4 gateway also gets the IPv6 gateway; a
    /// user-supplied resolver is used alone.
    pub fn resolvers(&self) -> Vec<IpAddr> {
        let ipv4_gateway = self.server_ipv4_gateway.map(IpAddr::V4);
        let ipv6_gateway = self.server_ipv6_gateway.map(IpAddr::V6);

        match self.dns_server.or(ipv4_gateway) {
            Some(resolver) => {
                let mut resolvers = vec![resolver];
                if Some(resolver) == ipv4_gateway {
                    resolvers.extend(ipv6_gateway);
                }
                resolvers
            }
            None => ipv6_gateway.into_iter().collect(),
        }
    }
}

impl TryFrom<RawInterfaceConfig> for InterfaceConfig {
    type Error = anyhow::Error;

    fn try_from(raw: RawInterfaceConfig) -> Result<Self> {
        if raw.private_key.expose().trim().is_empty() {
            anyhow::bail!("privateKey cannot be empty");
        }
        if raw.server_public_key.trim().is_empty() {
            anyhow::bail!("serverPublicKey cannot be empty");
        }

        let hop_index = raw.hop_index.unwrap_or(PRIMARY_HOP);
        if hop_index > ENTRY_HOP {
            anyhow::bail!("hopindex {} is not a known hop", hop_index);
        }

        let server_port = parse_integer(raw.server_port, "serverPort")?;
        let server_port = u16::try_from(server_port)
            .ok()
            .filter(|port| *port != 0)
            .with_context(|| format!("serverPort out of range: {}", raw.server_port))?;

        let device_ipv4_address: Option<IpPrefix> =
            optional(raw.device_ipv4_address.as_deref(), "deviceIpv4Address")?;
        let device_ipv6_address: Option<IpPrefix> =
            optional(raw.device_ipv6_address.as_deref(), "deviceIpv6Address")?;
        if device_ipv4_address.is_none() && device_ipv6_address.is_none() {
            anyhow::bail!("No device addresses found in the configuration");
        }
        if device_ipv4_address.is_some_and(|a| a.is_ipv6()) {
            anyhow::bail!("deviceIpv4Address is not an IPv4 address");
        }
        if device_ipv6_address.is_some_and(|a| !a.is_ipv6()) {
            anyhow::bail!("deviceIpv6Address is not an IPv6 address");
        }

        let server_ipv4_addr_in: Option<Ipv4Addr> =
            optional(raw.server_ipv4_addr_in.as_deref(), "serverIpv4AddrIn")?;
        let server_ipv6_addr_in: Option<Ipv6Addr> =
            optional(raw.server_ipv6_addr_in.as_deref(), "serverIpv6AddrIn")?;
        if server_ipv4_addr_in.is_none() && server_ipv6_addr_in.is_none() {
            anyhow::bail!("No server addresses found in the configuration");
        }

        let server_ipv4_gateway: Option<Ipv4Addr> =
            optional(raw.server_ipv4_gateway.as_deref(), "serverIpv4Gateway")?;
        let server_ipv6_gateway: Option<Ipv6Addr> =
            optional(raw.server_ipv6_gateway.as_deref(), "serverIpv6Gateway")?;
        let dns_server: Option<IpAddr> = optional(raw.dns_server.as_deref(), "dnsServer")?;

        let mut allowed_ips = raw
            .allowed_ip_address_ranges
            .iter()
            .map(parse_range)
            .collect::<Result<Vec<_>>>()?;
        // Longest prefix first, ties keep request order
        allowed_ips.sort_by(|a, b| b.prefix_len().cmp(&a.prefix_len()));

        let mut excluded_addresses: Vec<IpPrefix> = Vec::new();
        for address in &raw.excluded_addresses {
            let prefix: IpPrefix = address
                .parse()
                .with_context(|| format!("Invalid excluded address: {}", address))?;
            if !excluded_addresses.contains(&prefix) {
                excluded_addresses.push(prefix);
            }
        }

        Ok(Self {
            hop_index,
            private_key: raw.private_key,
            device_ipv4_address,
            device_ipv6_address,
            server_public_key: raw.server_public_key,
            server_ipv4_addr_in,
            server_ipv6_addr_in,
            server_port,
            server_ipv4_gateway,
            server_ipv6_gateway,
            dns_server,
            allowed_ips,
            excluded_addresses,
            vpn_disabled_apps: raw.vpn_disabled_apps,
        })
    }
}

/// Parse and validate the JSON body of an `activate` request
pub fn parse_config(value: serde_json::Value) -> Result<InterfaceConfig> {
    let raw: RawInterfaceConfig =
        serde_json::from_value(value).context("Malformed interface configuration")?;
    raw.try_into()
}

fn parse_range(range: &RawAddressRange) -> Result<IpPrefix> {
    let address: IpAddr = range
        .address
        .parse()
        .with_context(|| format!("allowedIPAddressRanges: invalid address {}", range.address))?;
    if address.is_ipv6() != range.is_ipv6 {
        anyhow::bail!(
            "allowedIPAddressRanges: {} does not match isIpv6={}",
            range.address,
            range.is_ipv6
        );
    }
    let len = parse_integer(range.range, "allowedIPAddressRanges.range")?;
    let len = u8::try_from(len)
        .with_context(|| format!("allowedIPAddressRanges: invalid range {}", range.range))?;
    IpPrefix::new(address, len)
}

fn parse_integer(value: f64, field: &str) -> Result<u64> {
    if !value.is_finite() || value < 0.0 || value.fract() != 0.0 || value > u32::MAX as f64 {
        anyhow::bail!("{} must be a non-negative integer, got {}", field, value);
    }
    Ok(value as u64)
}

/// Empty strings count as absent
fn optional<T>(value: Option<&str>, field: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match value.map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) => s
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{} is invalid ({}): {}", field, s, e)),
    }
}
