// Configuration file parser

//! Configuration file parsing and validation
//!
//! The daemon reads an optional TOML file. Missing sections and fields fall
//! back to their defaults; the values are checked before anything touches
//! the system.

use crate::backend::wireguard::validate_interface_name;
use crate::types::Config;
use anyhow::{Context, Result};
use std::fs;
use std::ops::RangeInclusive;
use std::path::Path;

/// Accepted MTU range (IPv4 minimum up to jumbo frames)
const MTU_RANGE: RangeInclusive<u16> = 576..=9000;

/// Load configuration from TOML file, or the defaults when `path` is None
pub fn load_config<P: AsRef<Path>>(path: Option<P>) -> Result<Config> {
    let config = match path {
        Some(path) => {
            let contents =
                fs::read_to_string(path.as_ref()).context("Failed to read config file")?;
            parse_config(&contents)?
        }
        None => Config::default(),
    };

    validate_config(&config)?;
    Ok(config)
}

fn parse_config(contents: &str) -> Result<Config> {
    toml::from_str(contents).context("Failed to parse config file")
}

/// Validate configuration values
pub fn validate_config(config: &Config) -> Result<()> {
    validate_interface_name(&config.wireguard.interface)
        .context("Invalid wireguard.interface")?;

    anyhow::ensure!(
        MTU_RANGE.contains(&config.wireguard.mtu),
        "wireguard.mtu must be within {}..={}, got {}",
        MTU_RANGE.start(),
        MTU_RANGE.end(),
        config.wireguard.mtu
    );

    if config.wireguard.handshake_poll_ms == 0 {
        anyhow::bail!("wireguard.handshake_poll_ms must be > 0");
    }

    if config.control.socket_path.as_os_str().is_empty() {
        anyhow::bail!("control.socket_path cannot be empty");
    }

    Ok(())
}
