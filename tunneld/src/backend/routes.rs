//! Policy routing for the tunnel
//!
//! Allowed-IP routes and exclusion routes live in a dedicated routing table.
//! Two policy rules per address family make that table authoritative for
//! everything except the tunnel's own encrypted traffic (which carries the
//! interface fwmark) and the more specific routes of the main table:
//!
//! ```text
//! ip rule add not fwmark <fwmark> table <table>
//! ip rule add table main suppress_prefixlength 0
//! ```
//!
//! Exclusions are `throw` routes: lookup leaves the tunnel table and falls
//! through to the main table, so the address keeps using the physical uplink.

use super::run_ip;
use crate::interface::IpPrefix;
use anyhow::{Context, Result};

/// Errors from `ip route del` meaning the route is already gone
const ROUTE_GONE: &[&str] = &["No such process", "Cannot find device"];

/// Error from `ip route/rule add` meaning it is already there
const ALREADY_EXISTS: &[&str] = &["File exists"];

/// Error from `ip rule del` meaning the rule is already gone
const RULE_GONE: &[&str] = &["No such file or directory"];

fn family(is_ipv6: bool) -> &'static str {
    if is_ipv6 {
        "-6"
    } else {
        "-4"
    }
}

/// Manages the tunnel routing table and its policy rules
pub struct RouteManager {
    interface: String,
    table: u32,
    fwmark: u32,
    rules_installed: bool,
}

impl RouteManager {
    pub fn new(interface: String, table: u32, fwmark: u32) -> Self {
        Self {
            interface,
            table,
            fwmark,
            rules_installed: false,
        }
    }

    pub fn table(&self) -> u32 {
        self.table
    }

    pub fn has_rules(&self) -> bool {
        self.rules_installed
    }

    fn rule_args(&self, is_ipv6: bool, action: &str) -> [Vec<String>; 2] {
        let af = family(is_ipv6).to_string();
        [
            vec![
                af.clone(),
                "rule".into(),
                action.into(),
                "not".into(),
                "fwmark".into(),
                self.fwmark.to_string(),
                "table".into(),
                self.table.to_string(),
            ],
            vec![
                af,
                "rule".into(),
                action.into(),
                "table".into(),
                "main".into(),
                "suppress_prefixlength".into(),
                "0".into(),
            ],
        ]
    }

    fn route_args(&self, prefix: &IpPrefix, metric: u8, action: &str) -> Vec<String> {
        vec![
            family(prefix.is_ipv6()).into(),
            "route".into(),
            action.into(),
            prefix.to_string(),
            "dev".into(),
            self.interface.clone(),
            "table".into(),
            self.table.to_string(),
            "metric".into(),
            metric.to_string(),
        ]
    }

    fn throw_args(&self, prefix: &IpPrefix, action: &str) -> Vec<String> {
        vec![
            family(prefix.is_ipv6()).into(),
            "route".into(),
            action.into(),
            "throw".into(),
            prefix.to_string(),
            "table".into(),
            self.table.to_string(),
        ]
    }

    /// Install the policy rules for both families
    pub fn install_rules(&mut self) -> Result<()> {
        if self.rules_installed {
            return Ok(());
        }

        for args in self.rule_args(false, "add") {
            run_ip(&args, ALREADY_EXISTS).context("Failed to add IPv4 policy rule")?;
        }
        // Hosts with IPv6 disabled reject these
        for args in self.rule_args(true, "add") {
            if let Err(e) = run_ip(&args, ALREADY_EXISTS) {
                log::warn!("Failed to add IPv6 policy rule: {:#}", e);
            }
        }

        log::info!(
            "Policy rules active: table {} for traffic without fwmark {:#x}",
            self.table,
            self.fwmark
        );
        self.rules_installed = true;
        Ok(())
    }

    /// Remove the policy rules, logging failures
    pub fn remove_rules(&mut self) {
        if !self.rules_installed {
            return;
        }

        for is_ipv6 in [false, true] {
            for args in self.rule_args(is_ipv6, "del") {
                if let Err(e) = run_ip(&args, RULE_GONE) {
                    log::warn!("Failed to remove policy rule: {:#}", e);
                }
            }
        }

        log::info!("Removed policy rules for table {}", self.table);
        self.rules_installed = false;
    }

    /// Route `prefix` through the tunnel with the given metric
    pub fn add_route(&self, prefix: &IpPrefix, metric: u8) -> Result<()> {
        run_ip(&self.route_args(prefix, metric, "replace"), &[])
            .with_context(|| format!("Failed to add route {}", prefix))?;
        log::info!(
            "Route active: {} dev {} table {} metric {}",
            prefix,
            self.interface,
            self.table,
            metric
        );
        Ok(())
    }

    pub fn delete_route(&self, prefix: &IpPrefix, metric: u8) -> Result<()> {
        run_ip(&self.route_args(prefix, metric, "del"), ROUTE_GONE)
            .with_context(|| format!("Failed to delete route {}", prefix))?;
        log::info!("Removed route: {} metric {}", prefix, metric);
        Ok(())
    }

    /// Send `prefix` back to the main table
    pub fn add_exclusion(&self, prefix: &IpPrefix) -> Result<()> {
        run_ip(&self.throw_args(prefix, "replace"), &[])
            .with_context(|| format!("Failed to add exclusion route {}", prefix))?;
        log::info!("Excluded from tunnel: {}", prefix);
        Ok(())
    }

    pub fn delete_exclusion(&self, prefix: &IpPrefix) -> Result<()> {
        run_ip(&self.throw_args(prefix, "del"), ROUTE_GONE)
            .with_context(|| format!("Failed to delete exclusion route {}", prefix))?;
        log::info!("Exclusion removed: {}", prefix);
        Ok(())
    }
}

impl Drop for RouteManager {
    fn drop(&mut self) {
        self.remove_rules();
    }
}
