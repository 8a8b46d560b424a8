//! Local control protocol
//!
//! Clients talk to the daemon over a Unix domain socket with one JSON object
//! per line. The `type` field selects the request:
//!
//! ```text
//! {"type":"activate", ...interface configuration...}
//! {"type":"deactivate"} {"type":"status"} {"type":"logs"} {"type":"cleanlogs"}
//! ```
//!
//! Each connection runs in its own task and forwards parsed requests to the
//! event loop, which owns the [`Daemon`] and answers through a oneshot
//! channel. Daemon notifications reach every connection over a broadcast
//! channel. Malformed requests are logged and ignored; the connection stays
//! open.

use crate::backend::Platform;
use crate::daemon::{Daemon, DaemonEvent, Status};
use crate::interface::parse_config;
use crate::logs::LogBuffer;
use crate::types::DaemonState;
use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};

/// A decoded client request
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// Raw configuration object, validated by the dispatcher
    Activate(Value),
    Deactivate,
    Status,
    Logs,
    CleanLogs,
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::Activate(_) => "activate",
            Request::Deactivate => "deactivate",
            Request::Status => "status",
            Request::Logs => "logs",
            Request::CleanLogs => "cleanlogs",
        }
    }
}

/// Decode one request line
pub fn parse_request(line: &str) -> Result<Request> {
    let value: Value = serde_json::from_str(line).context("Invalid input")?;
    anyhow::ensure!(value.is_object(), "Invalid input: not a JSON object");

    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .context("No type command")?;

    Ok(match kind.as_str() {
        "activate" => Request::Activate(value),
        "deactivate" => Request::Deactivate,
        "status" => Request::Status,
        "logs" => Request::Logs,
        "cleanlogs" => Request::CleanLogs,
        other => anyhow::bail!("Invalid command: {}", other),
    })
}

/// Daemon -> client messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    Connected { pubkey: String },
    Disconnected,
    BackendFailure,
    Status(Status),
    Logs { logs: String },
}

impl From<DaemonEvent> for ClientMessage {
    fn from(event: DaemonEvent) -> Self {
        match event {
            DaemonEvent::Connected { pubkey } => ClientMessage::Connected { pubkey },
            DaemonEvent::Disconnected => ClientMessage::Disconnected,
            DaemonEvent::BackendFailure => ClientMessage::BackendFailure,
        }
    }
}

/// Session-owner access control.
///
/// When enabled, root may always issue requests. While a connection is
/// active only the uid that activated it may; while inactive anyone may ask
/// for `status`, and an `activate` makes its caller the new owner.
#[derive(Debug, Default)]
pub struct Authorizer {
    enabled: bool,
    owner: Option<u32>,
}

impl Authorizer {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            owner: None,
        }
    }

    pub fn owner(&self) -> Option<u32> {
        self.owner
    }

    /// Forget the session owner
    pub fn reset(&mut self) {
        self.owner = None;
    }

    pub fn authorize(&mut self, uid: Option<u32>, request: &Request, state: DaemonState) -> bool {
        if !self.enabled {
            return true;
        }

        let Some(uid) = uid else {
            log::error!("Unable to determine the caller, assuming unauthorized");
            return false;
        };

        if uid == 0 {
            log::debug!("Command issued by root");
            return true;
        }

        if state.is_active() {
            if self.owner == Some(uid) {
                return true;
            }
            log::error!("Command issued by unexpected user {}", uid);
            return false;
        }

        match request {
            Request::Status => true,
            Request::Activate(_) => {
                log::debug!("New session started by user {}", uid);
                self.owner = Some(uid);
                true
            }
            _ => {
                log::debug!("User {} is not authorized, no ongoing session", uid);
                false
            }
        }
    }
}

/// Applies requests to the daemon
pub struct Dispatcher {
    authorizer: Authorizer,
    logs: LogBuffer,
}

impl Dispatcher {
    pub fn new(session_owner_only: bool, logs: LogBuffer) -> Self {
        Self {
            authorizer: Authorizer::new(session_owner_only),
            logs,
        }
    }

    pub fn authorizer(&self) -> &Authorizer {
        &self.authorizer
    }

    /// Handle one request, returning the reply for the requesting client
    pub fn handle<P: Platform>(
        &mut self,
        daemon: &mut Daemon<P>,
        request: Request,
        uid: Option<u32>,
    ) -> Option<ClientMessage> {
        log::debug!("Command received: {}", request.name());

        if !self.authorizer.authorize(uid, &request, daemon.state()) {
            log::warn!("Caller is unauthorized. Ignoring command.");
            return None;
        }

        let reply = match request {
            Request::Activate(value) => match parse_config(value) {
                Ok(config) => match daemon.activate(config) {
                    Ok(()) => None,
                    Err(e) => {
                        log::error!("Failed to activate the interface: {:#}", e);
                        Some(ClientMessage::Disconnected)
                    }
                },
                Err(e) => {
                    log::error!("Invalid configuration: {:#}", e);
                    Some(ClientMessage::Disconnected)
                }
            },
            Request::Deactivate => {
                if let Err(e) = daemon.deactivate(true) {
                    log::error!("Failed to deactivate: {:#}", e);
                }
                None
            }
            Request::Status => Some(ClientMessage::Status(daemon.get_status())),
            Request::Logs => Some(ClientMessage::Logs {
                logs: self.logs.contents().replace('\n', "|"),
            }),
            Request::CleanLogs => {
                self.logs.clear();
                None
            }
        };

        if !daemon.state().is_active() {
            self.authorizer.reset();
        }

        reply
    }
}

/// A request on its way to the event loop
#[derive(Debug)]
pub struct ControlCommand {
    pub request: Request,
    /// Caller uid from the socket peer credentials
    pub uid: Option<u32>,
    pub reply: oneshot::Sender<Option<ClientMessage>>,
}

async fn write_message(writer: &mut OwnedWriteHalf, message: &ClientMessage) -> Result<()> {
    let mut json = serde_json::to_string(message).context("Failed to serialize message")?;
    json.push('\n');
    writer
        .write_all(json.as_bytes())
        .await
        .context("Failed to write message")
}

/// Serve one client until it disconnects
pub async fn handle_connection(
    stream: UnixStream,
    commands: mpsc::Sender<ControlCommand>,
    mut events: broadcast::Receiver<DaemonEvent>,
) -> Result<()> {
    let uid = match stream.peer_cred() {
        Ok(cred) => Some(cred.uid()),
        Err(e) => {
            log::warn!("Failed to read peer credentials: {}", e);
            None
        }
    };
    log::debug!("Connection created (uid {:?})", uid);

    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read request")? else {
                    break;
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                let request = match parse_request(line) {
                    Ok(request) => request,
                    Err(e) => {
                        log::warn!("{:#}. Ignoring request.", e);
                        continue;
                    }
                };

                let (reply, response) = oneshot::channel();
                commands
                    .send(ControlCommand { request, uid, reply })
                    .await
                    .map_err(|_| anyhow::anyhow!("Event loop has stopped"))?;

                if let Ok(Some(message)) = response.await {
                    write_message(&mut writer, &message).await?;
                }
            }

            event = events.recv() => match event {
                Ok(event) => write_message(&mut writer, &ClientMessage::from(event)).await?,
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("Control client missed {} notifications", skipped);
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    log::debug!("Connection released");
    Ok(())
}

/// Control socket server
pub struct ControlServer {
    socket_path: PathBuf,
    listener: UnixListener,
}

impl ControlServer {
    /// Bind the socket, replacing a stale one, and apply `mode`
    pub fn bind(socket_path: impl AsRef<Path>, mode: u32) -> Result<Self> {
        use std::os::unix::fs::PermissionsExt;

        let socket_path = socket_path.as_ref().to_path_buf();

        // Remove existing socket file
        let _ = std::fs::remove_file(&socket_path);

        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {:?}", parent))?;
        }

        let listener = UnixListener::bind(&socket_path)
            .with_context(|| format!("Failed to bind control socket {:?}", socket_path))?;

        std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(mode))
            .context("Failed to set control socket permissions")?;

        log::info!("Control socket listening on {:?}", socket_path);
        Ok(Self {
            socket_path,
            listener,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Accept clients forever
    pub async fn run(
        self,
        commands: mpsc::Sender<ControlCommand>,
        events: broadcast::Receiver<DaemonEvent>,
    ) -> Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, _)) => {
                    let commands = commands.clone();
                    let events = events.resubscribe();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, commands, events).await {
                            log::debug!("Control connection error: {:#}", e);
                        }
                    });
                }
                Err(e) => {
                    log::warn!("Control socket accept error: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockPlatform;
    use crate::handshake::HandshakeMonitor;
    use crate::interface::tests::activate_json;
    use serde_json::json;
    use std::time::Duration;
    use tokio::io::Lines;
    use tokio::net::unix::OwnedReadHalf;

    fn daemon() -> Daemon<MockPlatform> {
        Daemon::new(MockPlatform::new(), HandshakeMonitor::default())
    }

    #[test]
    fn test_parse_requests() {
        assert_eq!(parse_request(r#"{"type":"status"}"#).unwrap(), Request::Status);
        assert_eq!(
            parse_request(r#"{"type":"deactivate"}"#).unwrap(),
            Request::Deactivate
        );
        assert_eq!(parse_request(r#"{"type":"logs"}"#).unwrap(), Request::Logs);
        assert_eq!(
            parse_request(r#"{"type":"cleanlogs"}"#).unwrap(),
            Request::CleanLogs
        );

        let request = parse_request(&activate_json().to_string()).unwrap();
        assert_eq!(request.name(), "activate");
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(parse_request("not json").is_err());
        assert!(parse_request("[1, 2]").is_err());
        assert!(parse_request(r#"{"kind":"status"}"#).is_err());
        assert!(parse_request(r#"{"type":7}"#).is_err());
        assert!(parse_request(r#"{"type":"reboot"}"#).is_err());
    }

    #[test]
    fn test_client_message_shapes() {
        let connected = ClientMessage::Connected {
            pubkey: "abc=".into(),
        };
        assert_eq!(
            serde_json::to_value(&connected).unwrap(),
            json!({"type": "connected", "pubkey": "abc="})
        );
        assert_eq!(
            serde_json::to_value(ClientMessage::Disconnected).unwrap(),
            json!({"type": "disconnected"})
        );
        assert_eq!(
            serde_json::to_value(ClientMessage::BackendFailure).unwrap(),
            json!({"type": "backendFailure"})
        );
        assert_eq!(
            serde_json::to_value(ClientMessage::Status(Status::disconnected())).unwrap(),
            json!({"type": "status", "connected": false})
        );
        assert_eq!(
            serde_json::to_value(ClientMessage::Logs { logs: "a|b".into() }).unwrap(),
            json!({"type": "logs", "logs": "a|b"})
        );
    }

    #[test]
    fn test_dispatch_activate_and_status() {
        let mut daemon = daemon();
        let mut dispatcher = Dispatcher::new(false, LogBuffer::default());

        let reply = dispatcher.handle(&mut daemon, Request::Activate(activate_json()), None);
        assert_eq!(reply, None);
        assert_eq!(daemon.connections().len(), 1);

        let reply = dispatcher.handle(&mut daemon, Request::Status, None);
        match reply {
            Some(ClientMessage::Status(status)) => assert!(status.connected),
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[test]
    fn test_dispatch_invalid_config_reports_disconnected() {
        let mut daemon = daemon();
        let mut dispatcher = Dispatcher::new(false, LogBuffer::default());

        let reply = dispatcher.handle(
            &mut daemon,
            Request::Activate(json!({"type": "activate", "privateKey": ""})),
            None,
        );
        assert_eq!(reply, Some(ClientMessage::Disconnected));
        assert!(daemon.platform().calls.is_empty());
    }

    #[test]
    fn test_dispatch_failed_activation_reports_disconnected() {
        let mut daemon = daemon();
        daemon.platform_mut().fail("add_interface");
        let mut dispatcher = Dispatcher::new(false, LogBuffer::default());

        let reply = dispatcher.handle(&mut daemon, Request::Activate(activate_json()), None);
        assert_eq!(reply, Some(ClientMessage::Disconnected));
    }

    #[test]
    fn test_dispatch_logs() {
        let mut daemon = daemon();
        let logs = LogBuffer::default();
        logs.append("line one\nline two\n");
        let mut dispatcher = Dispatcher::new(false, logs.clone());

        assert_eq!(
            dispatcher.handle(&mut daemon, Request::Logs, None),
            Some(ClientMessage::Logs {
                logs: "line one|line two|".into()
            })
        );

        assert_eq!(dispatcher.handle(&mut daemon, Request::CleanLogs, None), None);
        assert_eq!(logs.contents(), "");
    }

    #[test]
    fn test_authorizer_disabled_allows_everything() {
        let mut auth = Authorizer::new(false);
        assert!(auth.authorize(None, &Request::Deactivate, DaemonState::Connected));
        assert!(auth.authorize(Some(1000), &Request::Logs, DaemonState::Inactive));
    }

    #[test]
    fn test_authorizer_session_owner() {
        let mut auth = Authorizer::new(true);

        // Inactive: status and activate only
        assert!(auth.authorize(Some(1000), &Request::Status, DaemonState::Inactive));
        assert!(!auth.authorize(Some(1000), &Request::Logs, DaemonState::Inactive));
        assert!(auth.authorize(
            Some(1000),
            &Request::Activate(Value::Null),
            DaemonState::Inactive
        ));
        assert_eq!(auth.owner(), Some(1000));

        // Active: owner and root only
        assert!(auth.authorize(Some(1000), &Request::Deactivate, DaemonState::Connecting));
        assert!(!auth.authorize(Some(1001), &Request::Status, DaemonState::Connected));
        assert!(auth.authorize(Some(0), &Request::Deactivate, DaemonState::Connected));

        // Unknown caller
        assert!(!auth.authorize(None, &Request::Status, DaemonState::Inactive));
    }

    #[test]
    fn test_dispatch_forgets_owner_after_deactivate() {
        let mut daemon = daemon();
        let mut dispatcher = Dispatcher::new(true, LogBuffer::default());

        dispatcher.handle(&mut daemon, Request::Activate(activate_json()), Some(1000));
        assert_eq!(dispatcher.authorizer().owner(), Some(1000));

        // Another user cannot tear the session down
        dispatcher.handle(&mut daemon, Request::Deactivate, Some(1001));
        assert_eq!(daemon.connections().len(), 1);

        dispatcher.handle(&mut daemon, Request::Deactivate, Some(1000));
        assert!(daemon.connections().is_empty());
        assert_eq!(dispatcher.authorizer().owner(), None);
    }

    #[test]
    fn test_dispatch_failed_activation_forgets_owner() {
        let mut daemon = daemon();
        daemon.platform_mut().fail("update_peer");
        let mut dispatcher = Dispatcher::new(true, LogBuffer::default());

        dispatcher.handle(&mut daemon, Request::Activate(activate_json()), Some(1000));
        assert_eq!(dispatcher.authorizer().owner(), None);
    }

    /// Stand-in for the event loop: dispatch, then complete every pending handshake
    fn spawn_event_loop(
        mut daemon: Daemon<MockPlatform>,
        mut commands: mpsc::Receiver<ControlCommand>,
    ) {
        let mut dispatcher = Dispatcher::new(false, LogBuffer::default());
        tokio::spawn(async move {
            while let Some(command) = commands.recv().await {
                let reply = dispatcher.handle(&mut daemon, command.request, command.uid);
                let _ = command.reply.send(reply);

                let peers: Vec<String> = daemon.platform().peers.iter().cloned().collect();
                for peer in peers {
                    daemon.platform_mut().handshake(&peer, 1_700_000_000_000);
                }
                daemon.check_handshake();
            }
        });
    }

    async fn next_message(lines: &mut Lines<BufReader<OwnedReadHalf>>) -> Value {
        let line = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
            .await
            .expect("timed out waiting for the daemon")
            .unwrap()
            .expect("connection closed");
        serde_json::from_str(&line).unwrap()
    }

    #[tokio::test]
    async fn test_connection_end_to_end() {
        let (client, server) = UnixStream::pair().unwrap();
        let (commands_tx, commands_rx) = mpsc::channel(8);

        let daemon = daemon();
        let events = daemon.subscribe();
        spawn_event_loop(daemon, commands_rx);
        tokio::spawn(handle_connection(server, commands_tx, events));

        let (reader, mut writer) = client.into_split();
        let mut lines = BufReader::new(reader).lines();

        writer.write_all(b"{\"type\":\"status\"}\n").await.unwrap();
        assert_eq!(
            next_message(&mut lines).await,
            json!({"type": "status", "connected": false})
        );

        // Garbage is ignored, the connection survives
        writer.write_all(b"garbage\n\n{\"type\":\"bogus\"}\n").await.unwrap();
        writer
            .write_all(b"{\"type\":\"activate\",\"privateKey\":\"\"}\n")
            .await
            .unwrap();
        assert_eq!(
            next_message(&mut lines).await,
            json!({"type": "disconnected"})
        );

        let pubkey = activate_json()["serverPublicKey"].clone();
        let mut activate = activate_json().to_string();
        activate.push('\n');
        writer.write_all(activate.as_bytes()).await.unwrap();
        assert_eq!(
            next_message(&mut lines).await,
            json!({"type": "connected", "pubkey": pubkey})
        );

        writer.write_all(b"{\"type\":\"status\"}\n").await.unwrap();
        let status = next_message(&mut lines).await;
        assert_eq!(status["connected"], json!(true));
        assert_eq!(status["serverIpv4Gateway"], json!("10.64.0.1"));

        writer.write_all(b"{\"type\":\"deactivate\"}\n").await.unwrap();
        assert_eq!(
            next_message(&mut lines).await,
            json!({"type": "disconnected"})
        );
    }

    #[tokio::test]
    async fn test_server_binds_with_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub/daemon.sock");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"stale").unwrap();

        let server = ControlServer::bind(&path, 0o600).unwrap();
        assert_eq!(server.socket_path(), path.as_path());
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        let (commands_tx, commands_rx) = mpsc::channel(8);
        let daemon = daemon();
        let events = daemon.subscribe();
        spawn_event_loop(daemon, commands_rx);
        tokio::spawn(server.run(commands_tx, events));

        let client = UnixStream::connect(&path).await.unwrap();
        let (reader, mut writer) = client.into_split();
        let mut lines = BufReader::new(reader).lines();
        writer.write_all(b"{\"type\":\"status\"}\n").await.unwrap();
        assert_eq!(next_message(&mut lines).await["type"], json!("status"));
    }
}
