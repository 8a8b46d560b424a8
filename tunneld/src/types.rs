// Shared daemon types

//! Shared data structures
//!
//! Daemon configuration structures (every field has a serde default, so an
//! empty or partial TOML file is valid) and the coarse daemon state used by
//! the state file and caller authorisation.

use serde::Deserialize;
use std::path::PathBuf;

/// Coarse daemon state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    /// No hop recorded
    Inactive,
    /// At least one hop waits for its first handshake
    Connecting,
    /// Every hop completed a handshake
    Connected,
}

impl DaemonState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DaemonState::Inactive => "inactive",
            DaemonState::Connecting => "connecting",
            DaemonState::Connected => "connected",
        }
    }

    pub fn is_active(&self) -> bool {
        *self != DaemonState::Inactive
    }
}

/// Main configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub control: ControlConfig,
    pub wireguard: WireguardConfig,
    pub dns: DnsConfig,
    pub hooks: HookConfig,
}

/// General configuration options
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GeneralConfig {
    pub log_level: String,
    /// Where to publish the daemon state, if anywhere
    pub state_file: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            state_file: None,
        }
    }
}

/// Control socket options
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ControlConfig {
    pub socket_path: PathBuf,
    pub socket_mode: u32,
    /// Only the uid that activated may control an active connection
    pub session_owner_only: bool,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            socket_mode: 0o660,
            session_owner_only: false,
        }
    }
}

/// WireGuard interface options
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WireguardConfig {
    pub interface: String,
    pub mtu: u16,
    /// Seconds, 0 disables
    pub persistent_keepalive: u16,
    pub fwmark: u32,
    pub route_table: u32,
    pub handshake_poll_ms: u64,
}

impl Default for WireguardConfig {
    fn default() -> Self {
        Self {
            interface: "wg0".to_string(),
            mtu: 1420,
            persistent_keepalive: 25,
            fwmark: 51820,
            route_table: 51820,
            handshake_poll_ms: 250,
        }
    }
}

/// Resolver options
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DnsConfig {
    /// Configure systemd-resolved for the tunnel link
    pub enabled: bool,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Scripts run by the platform hook
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct HookConfig {
    pub up: Option<String>,
    pub down: Option<String>,
}

pub const DEFAULT_SOCKET_PATH: &str = "/run/tunneld/daemon.sock";

fn default_log_level() -> String {
    "info".to_string()
}
