// tunneld: privileged WireGuard connection daemon

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::signal;
use tokio::sync::mpsc;
use tunneld::{
    backend::{linux::LinuxPlatform, Platform},
    config::load_config,
    control::{ControlCommand, ControlServer, Dispatcher},
    daemon::Daemon,
    handshake::HandshakeMonitor,
    logs::LogBuffer,
    state_file::StateFile,
};

/// Size of the channel buffer for control requests
const CONTROL_COMMAND_CHANNEL_SIZE: usize = 32;

#[derive(Parser)]
#[command(name = "tunneld")]
#[command(about = "Privileged WireGuard connection daemon", long_about = None)]
struct Args {
    /// Path to configuration file (built-in defaults when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

/// Sleep until the handshake monitor is due, forever if it is not armed
async fn handshake_due(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => {
            tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await
        }
        None => std::future::pending().await,
    }
}

/// Write the state file after any state change
fn publish_state<P: Platform>(state_file: Option<&StateFile>, daemon: &Daemon<P>) {
    let Some(state_file) = state_file else {
        return;
    };
    let hops: Vec<u8> = daemon.connections().keys().copied().collect();
    if let Err(e) = state_file.write(daemon.state(), &hops) {
        log::warn!("Failed to write state file: {:#}", e);
    }
}

/// Perform graceful shutdown: clean up resources before exiting
fn graceful_shutdown<P: Platform>(
    daemon: &mut Daemon<P>,
    socket_path: &Path,
    state_file: Option<&StateFile>,
) {
    log::info!("Shutting down gracefully...");

    if daemon.state().is_active() {
        log::info!("Tearing down the active connection...");
        if let Err(e) = tokio::task::block_in_place(|| daemon.deactivate(true)) {
            log::error!("Failed to deactivate: {:#}", e);
        }
    }

    let _ = std::fs::remove_file(socket_path);
    if let Some(state_file) = state_file {
        state_file.cleanup();
    }

    log::info!("Shutdown complete");
}

fn main() -> Result<()> {
    // 2 threads: the event loop blocks on backend calls, control clients use the other
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("tunneld")
        .thread_stack_size(2 * 1024 * 1024) // 2MB stack (vs 8MB default)
        .enable_time()
        .enable_io()
        .build()?;

    runtime.block_on(async_main())
}

async fn async_main() -> Result<()> {
    let args = Args::parse();

    let config = load_config(args.config.as_deref())
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    // Initialize logging; records are also kept for the `logs` request
    let logs = LogBuffer::default();
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(&config.general.log_level),
    )
    .target(env_logger::Target::Pipe(Box::new(logs.writer())))
    .init();

    log::info!("Starting tunneld daemon");
    log::info!("WireGuard interface: {}", config.wireguard.interface);
    log::info!(
        "Routing table {} with fwmark {}",
        config.wireguard.route_table,
        config.wireguard.fwmark
    );

    let platform =
        LinuxPlatform::from_config(&config).context("Failed to set up the Linux platform")?;
    let monitor = HandshakeMonitor::new(Duration::from_millis(
        config.wireguard.handshake_poll_ms,
    ));
    let mut daemon = Daemon::new(platform, monitor);
    let mut dispatcher = Dispatcher::new(config.control.session_owner_only, logs.clone());
    let state_file = config.general.state_file.clone().map(StateFile::new);

    let server = ControlServer::bind(&config.control.socket_path, config.control.socket_mode)
        .context("Failed to start control server")?;
    let socket_path = server.socket_path().to_path_buf();

    let (command_tx, mut command_rx) =
        mpsc::channel::<ControlCommand>(CONTROL_COMMAND_CHANNEL_SIZE);

    // Store the handle so we can monitor it for failures
    let mut server_handle = tokio::spawn(server.run(command_tx, daemon.subscribe()));

    // Set up signal handlers for graceful shutdown
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("Failed to set up SIGTERM handler")?;
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .context("Failed to set up SIGINT handler")?;

    publish_state(state_file.as_ref(), &daemon);
    log::info!("Daemon started successfully");

    // Main event loop
    loop {
        tokio::select! {
            // Shutdown signals
            _ = sigterm.recv() => {
                log::info!("Received SIGTERM");
                break;
            }
            _ = sigint.recv() => {
                log::info!("Received SIGINT");
                break;
            }

            // Control server failure is fatal (fail-fast for systemd restart)
            server_result = &mut server_handle => {
                match server_result {
                    Ok(Ok(())) => log::error!("Control server exited unexpectedly"),
                    Ok(Err(e)) => log::error!("Control server failed: {:#}", e),
                    Err(e) => log::error!("Control server task panicked: {}", e),
                }
                graceful_shutdown(&mut daemon, &socket_path, state_file.as_ref());
                anyhow::bail!("Control server terminated, aborting daemon for systemd restart");
            }

            // Control requests, one at a time in arrival order
            Some(command) = command_rx.recv() => {
                let ControlCommand { request, uid, reply } = command;
                let message =
                    tokio::task::block_in_place(|| dispatcher.handle(&mut daemon, request, uid));
                // The client may have gone away
                let _ = reply.send(message);
                publish_state(state_file.as_ref(), &daemon);
            }

            // Handshake monitor tick
            _ = handshake_due(daemon.handshake_deadline()) => {
                tokio::task::block_in_place(|| daemon.check_handshake());
                publish_state(state_file.as_ref(), &daemon);
            }
        }
    }

    graceful_shutdown(&mut daemon, &socket_path, state_file.as_ref());

    Ok(())
}
