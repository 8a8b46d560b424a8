// tunneld: privileged WireGuard connection daemon
// Shared modules for the daemon and tests

//! tunneld library
//!
//! This library holds the core of a privileged VPN daemon: it receives
//! connection requests from an unprivileged client over a local socket and
//! drives a WireGuard interface, its peers, routes and resolvers into the
//! requested state, for single-hop and two-hop connections.
//!
//! # Main Components
//!
//! - [`daemon`]: Connection orchestrator (activate / deactivate / switch server / status)
//! - [`interface`]: Validated interface configuration and its wire form
//! - [`exclusions`]: Reference counting for addresses that bypass the tunnel
//! - [`handshake`]: Handshake confirmation polling
//! - [`backend`]: Platform collaborator traits and the Linux implementation
//! - [`control`]: Local control protocol and Unix socket server
//! - [`config`]: Configuration file parsing and validation
//! - [`logs`]: In-memory log buffer for the `logs` request
//! - [`state_file`]: State file for external monitoring
//! - [`types`]: Shared data structures

pub mod backend;
pub mod config;
pub mod control;
pub mod daemon;
pub mod exclusions;
pub mod handshake;
pub mod interface;
pub mod logs;
pub mod state_file;
pub mod types;
