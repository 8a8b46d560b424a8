//! The Linux capability set

use super::hook::CommandHook;
use super::iputils::LinuxIpUtils;
use super::resolved::ResolvedDns;
use super::wireguard::{LinuxWireguard, PeerSettings};
use super::{DnsUtils, IpUtils, Platform, RunOp, WireguardUtils};
use crate::interface::InterfaceConfig;
use crate::types::Config;
use anyhow::Result;

pub struct LinuxPlatform {
    wireguard: LinuxWireguard,
    dns: Option<ResolvedDns>,
    ip: LinuxIpUtils,
    hook: CommandHook,
}

impl LinuxPlatform {
    pub fn from_config(config: &Config) -> Result<Self> {
        let wg = &config.wireguard;
        let settings = PeerSettings {
            persistent_keepalive: wg.persistent_keepalive,
            fwmark: wg.fwmark,
        };

        let dns = if config.dns.enabled {
            Some(ResolvedDns::new())
        } else {
            log::info!("DNS management disabled");
            None
        };

        Ok(Self {
            wireguard: LinuxWireguard::new(wg.interface.clone(), settings, wg.route_table)?,
            dns,
            ip: LinuxIpUtils::new(wg.interface.clone(), wg.mtu),
            hook: CommandHook::new(config.hooks.up.clone(), config.hooks.down.clone()),
        })
    }
}

impl Platform for LinuxPlatform {
    fn wireguard(&mut self) -> &mut dyn WireguardUtils {
        &mut self.wireguard
    }

    fn dns(&mut self) -> Option<&mut dyn DnsUtils> {
        self.dns.as_mut().map(|dns| dns as &mut dyn DnsUtils)
    }

    fn ip(&mut self) -> Option<&mut dyn IpUtils> {
        Some(&mut self.ip)
    }

    fn run(&mut self, op: RunOp, config: &InterfaceConfig) -> bool {
        // Per-app split tunnelling needs an external driver
        if op == RunOp::Up && !config.vpn_disabled_apps.is_empty() {
            log::debug!(
                "Ignoring {} app exclusion(s) for hop {}: {:?}",
                config.vpn_disabled_apps.len(),
                config.hop_index,
                config.vpn_disabled_apps
            );
        }

        self.hook
            .run(self.wireguard.interface_name(), op, config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::tests::config_with;
    use serde_json::json;

    #[test]
    fn test_from_default_config() {
        let mut platform = LinuxPlatform::from_config(&Config::default()).unwrap();
        assert_eq!(platform.wireguard().interface_name(), "wg0");
        assert!(platform.dns().is_some());
        assert!(platform.ip().is_some());
    }

    #[test]
    fn test_dns_can_be_disabled() {
        let mut config = Config::default();
        config.dns.enabled = false;
        let mut platform = LinuxPlatform::from_config(&config).unwrap();
        assert!(platform.dns().is_none());
    }

    #[test]
    fn test_invalid_interface_rejected() {
        let mut config = Config::default();
        config.wireguard.interface = "bad name".to_string();
        assert!(LinuxPlatform::from_config(&config).is_err());
    }

    #[test]
    fn test_run_without_hooks_succeeds() {
        let mut platform = LinuxPlatform::from_config(&Config::default()).unwrap();
        let config = config_with(json!({"vpnDisabledApps": ["firefox"]}));
        assert!(platform.run(RunOp::Up, &config));
        assert!(platform.run(RunOp::Down, &config));
    }
}
