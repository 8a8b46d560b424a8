// State file writer for external monitoring
//!
//! Writes the current daemon state to a file for consumption by external
//! tools like status bar widgets:
//!
//! ```text
//! STATE=connected
//! HOPS=0,1
//! TIMESTAMP=1700000000
//! ```

use crate::types::DaemonState;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write current state; `hops` are the active hop indices
    pub fn write(&self, state: DaemonState, hops: &[u8]) -> Result<()> {
        // Create directory if it doesn't exist
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                fs::create_dir_all(dir).context("Failed to create state directory")?;
            }
        }

        let timestamp = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        fs::write(&self.path, render(state, hops, timestamp))
            .context("Failed to write state file")?;

        Ok(())
    }

    /// Remove state file on shutdown
    pub fn cleanup(&self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn render(state: DaemonState, hops: &[u8], timestamp: u64) -> String {
    let hops = hops
        .iter()
        .map(|hop| hop.to_string())
        .collect::<Vec<_>>()
        .join(",");
    format!(
        "STATE={}\nHOPS={}\nTIMESTAMP={}\n",
        state.as_str(),
        hops,
        timestamp
    )
}
