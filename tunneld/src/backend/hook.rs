//! User scripts run after bring-up and before teardown
//!
//! The script runs through `/bin/sh -c` with the connection described in
//! `TUNNELD_*` environment variables. No script configured means success.

use super::RunOp;
use crate::interface::InterfaceConfig;
use anyhow::{Context, Result};
use std::process::{Command, Stdio};

/// Environment handed to a hook script
fn script_env(
    interface: &str,
    op: RunOp,
    config: &InterfaceConfig,
) -> Vec<(&'static str, String)> {
    let phase = match op {
        RunOp::Up => "up",
        RunOp::Down => "down",
    };
    let optional = |value: Option<String>| value.unwrap_or_default();

    vec![
        ("TUNNELD_PHASE", phase.to_string()),
        ("TUNNELD_INTERFACE", interface.to_string()),
        ("TUNNELD_HOP", config.hop_index.to_string()),
        ("TUNNELD_SERVER_PUBLIC_KEY", config.server_public_key.clone()),
        (
            "TUNNELD_ENDPOINT",
            optional(config.endpoint().map(|e| e.to_string())),
        ),
        (
            "TUNNELD_DEVICE_IPV4",
            optional(config.device_ipv4_address.map(|a| a.to_string())),
        ),
        (
            "TUNNELD_DEVICE_IPV6",
            optional(config.device_ipv6_address.map(|a| a.to_string())),
        ),
    ]
}

fn run_script(script: &str, env: Vec<(&'static str, String)>) -> Result<()> {
    log::info!("Running script: {}", script);

    let output = Command::new("/bin/sh")
        .arg("-c")
        .arg(script)
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .context("Failed to execute script")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let exit_code = output.status.code().unwrap_or(-1);
        anyhow::bail!("Script exited with code {}: {}", exit_code, stderr.trim());
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !stdout.trim().is_empty() {
        log::debug!("Script output: {}", stdout.trim());
    }
    Ok(())
}

/// Optional up/down scripts
#[derive(Debug, Clone, Default)]
pub struct CommandHook {
    up: Option<String>,
    down: Option<String>,
}

impl CommandHook {
    pub fn new(up: Option<String>, down: Option<String>) -> Self {
        Self { up, down }
    }

    /// Run the script for `op`. Returns false if it failed.
    pub fn run(&self, interface: &str, op: RunOp, config: &InterfaceConfig) -> bool {
        let script = match op {
            RunOp::Up => self.up.as_deref(),
            RunOp::Down => self.down.as_deref(),
        };
        let Some(script) = script else {
            return true;
        };

        match run_script(script, script_env(interface, op, config)) {
            Ok(()) => {
                log::info!("{:?} script completed successfully", op);
                true
            }
            Err(e) => {
                log::error!("{:?} script failed: {:#}", op, e);
                false
            }
        }
    }
}
