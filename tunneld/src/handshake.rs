// Handshake confirmation polling

//! Handshake monitor
//!
//! A freshly installed peer is not "connected" until WireGuard reports a
//! completed handshake. The monitor polls peer statistics on a short fixed
//! interval while at least one hop is still waiting, records the handshake
//! time on the hop's [`ConnectionState`], and reports each confirmation once.
//!
//! The monitor only keeps a deadline; the event loop sleeps until it and then
//! calls back into the daemon, which owns the peer query and the connection map.

use crate::backend::PeerStatus;
use crate::daemon::ConnectionState;
use crate::interface::short_key;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Default polling interval
pub const HANDSHAKE_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug)]
pub struct HandshakeMonitor {
    interval: Duration,
    deadline: Option<Instant>,
}

impl Default for HandshakeMonitor {
    fn default() -> Self {
        Self::new(HANDSHAKE_POLL_INTERVAL)
    }
}

impl HandshakeMonitor {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            deadline: None,
        }
    }

    /// Schedule the next check one interval from `now`, replacing any pending one
    pub fn start(&mut self, now: Instant) {
        self.deadline = Some(now + self.interval);
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run one check against a single snapshot of peer statistics.
    ///
    /// Returns the public keys of the hops confirmed by this tick. The
    /// monitor re-arms itself only if some hop is still pending.
    pub fn tick(
        &mut self,
        peers: &[PeerStatus],
        connections: &mut BTreeMap<u8, ConnectionState>,
        now: Instant,
    ) -> Vec<String> {
        self.deadline = None;

        let mut confirmed = Vec::new();
        let mut pending = 0usize;

        for (hop, connection) in connections.iter_mut() {
            if connection.is_confirmed() {
                continue;
            }
            let key = &connection.config.server_public_key;
            log::debug!("Hop {} awaiting handshake from {}", hop, short_key(key));

            let handshake_ms = peers
                .iter()
                .find(|peer| &peer.public_key == key)
                .map(|peer| peer.last_handshake_ms)
                .unwrap_or(0);

            if handshake_ms != 0 {
                let at = i64::try_from(handshake_ms)
                    .ok()
                    .and_then(DateTime::<Utc>::from_timestamp_millis)
                    .unwrap_or_else(Utc::now);
                log::info!("Hop {} handshake completed with {}", hop, short_key(key));
                connection.handshake = Some(at);
                confirmed.push(key.clone());
            } else {
                pending += 1;
            }
        }

        if pending > 0 {
            self.start(now);
        }

        confirmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::tests::config_with;
    use serde_json::json;

    fn connections(keys: &[(u8, &str)]) -> BTreeMap<u8, ConnectionState> {
        keys.iter()
            .map(|(hop, key)| {
                (
                    *hop,
                    ConnectionState::new(config_with(json!({
                        "hopindex": hop,
                        "serverPublicKey": key
                    }))),
                )
            })
            .collect()
    }

    fn peer(key: &str, handshake_ms: u64) -> PeerStatus {
        PeerStatus {
            public_key: key.to_string(),
            last_handshake_ms: handshake_ms,
            ..Default::default()
        }
    }

    #[test]
    fn test_start_and_cancel() {
        let mut monitor = HandshakeMonitor::default();
        assert!(!monitor.is_armed());
        assert_eq!(monitor.interval(), Duration::from_millis(250));

        let now = Instant::now();
        monitor.start(now);
        assert_eq!(monitor.deadline(), Some(now + HANDSHAKE_POLL_INTERVAL));

        monitor.cancel();
        assert!(!monitor.is_armed());
    }

    #[test]
    fn test_pending_hop_rearms() {
        let mut monitor = HandshakeMonitor::default();
        let mut conns = connections(&[(0, "peerA")]);
        let now = Instant::now();

        let confirmed = monitor.tick(&[peer("peerA", 0)], &mut conns, now);
        assert!(confirmed.is_empty());
        assert!(monitor.is_armed());
        assert!(!conns[&0].is_confirmed());
    }

    #[test]
    fn test_missing_peer_is_pending() {
        let mut monitor = HandshakeMonitor::default();
        let mut conns = connections(&[(0, "peerA")]);

        let confirmed = monitor.tick(&[], &mut conns, Instant::now());
        assert!(confirmed.is_empty());
        assert!(monitor.is_armed());
    }

    #[test]
    fn test_handshake_confirms_once() {
        let mut monitor = HandshakeMonitor::default();
        let mut conns = connections(&[(0, "peerA")]);
        let peers = [peer("peerA", 1_700_000_000_123)];

        let confirmed = monitor.tick(&peers, &mut conns, Instant::now());
        assert_eq!(confirmed, vec!["peerA".to_string()]);
        assert!(!monitor.is_armed());
        assert_eq!(
            conns[&0].handshake.map(|d| d.timestamp_millis()),
            Some(1_700_000_000_123)
        );

        // Already confirmed hops are not reported again
        let confirmed = monitor.tick(&peers, &mut conns, Instant::now());
        assert!(confirmed.is_empty());
    }

    #[test]
    fn test_multihop_partial_confirmation() {
        let mut monitor = HandshakeMonitor::default();
        let mut conns = connections(&[(0, "exit"), (1, "entry")]);

        let confirmed = monitor.tick(
            &[peer("exit", 0), peer("entry", 5_000)],
            &mut conns,
            Instant::now(),
        );
        assert_eq!(confirmed, vec!["entry".to_string()]);
        assert!(monitor.is_armed());

        let confirmed = monitor.tick(
            &[peer("exit", 6_000), peer("entry", 5_000)],
            &mut conns,
            Instant::now(),
        );
        assert_eq!(confirmed, vec!["exit".to_string()]);
        assert!(!monitor.is_armed());
    }

    #[test]
    fn test_empty_map_stays_cancelled() {
        let mut monitor = HandshakeMonitor::default();
        monitor.start(Instant::now());
        let mut conns = BTreeMap::new();

        let confirmed = monitor.tick(&[peer("peerA", 1)], &mut conns, Instant::now());
        assert!(confirmed.is_empty());
        assert!(!monitor.is_armed());
    }
}
