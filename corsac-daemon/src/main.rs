/*!
 * CORSAC Bluetooth Audio Session Daemon
 * One phone, one session, zero fiddling
 * Onyx Digital Intelligence Development LLC
 */

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{error, info, warn};

mod artwork;
mod bluetooth;
mod bus;
mod calls;
mod config;
mod error;
mod events;
mod ipc;
mod mixer;
mod push;
mod router;
mod state;

use artwork::ArtworkResolver;
use bluetooth::admission::{AdmissionController, Session, SessionState};
use bluetooth::playback::PlaybackFacade;
use bluetooth::volume::VolumeBridge;
use bluetooth::{DeviceRegistry, BLUEZ_SERVICE};
use bus::Bus;
use calls::CallTracker;
use config::DaemonConfig;
use error::DaemonError;
use events::{EventBus, SessionEvent};
use ipc::{IpcContext, IpcServer};
use mixer::PactlMixer;
use push::StatePusher;
use router::EventRouter;
use state::StateStore;

#[derive(Parser)]
#[command(name = "corsacd")]
#[command(about = "CORSAC Bluetooth Audio Session Daemon")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(short, long, default_value = "/etc/corsac/corsacd.toml")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon
    Run,
    /// Query a running daemon over its socket
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("corsac_daemon={}", log_level))
        .init();

    info!("CORSAC Bluetooth Audio Session Daemon starting...");

    // Load configuration
    let config = DaemonConfig::load(&cli.config)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_daemon(config).await,
        Commands::Status => check_status(&config.socket_path).await,
    }
}

async fn run_daemon(config: DaemonConfig) -> Result<()> {
    info!("Initializing bluetooth session systems...");

    let bus = Arc::new(Bus::connect_system().await?);
    let store = Arc::new(StateStore::new());
    let events = EventBus::new(64);
    let registry = Arc::new(DeviceRegistry::new());
    let session = Arc::new(RwLock::new(Session::new()));

    // Adapter and agent come up before anything else; there is no session
    // daemon without them.
    let admission = Arc::new(AdmissionController::new(
        bus.clone(),
        config.bluetooth.clone(),
        session.clone(),
    ));
    let agent_rx = admission.initialize().await?;
    tokio::spawn(admission.clone().run_agent(agent_rx));

    let facade = Arc::new(PlaybackFacade::new(bus.clone(), session.clone()));
    let objects = bus.managed_objects(BLUEZ_SERVICE).await?;
    registry.seed(&objects).await;
    facade.seed_paths(&objects).await;

    let (raw_tx, raw_rx) = mpsc::unbounded_channel();
    bus.subscribe_bluez(raw_tx.clone()).await?;

    let calls = if config.telephony.enabled {
        match CallTracker::connect(events.clone(), raw_tx.clone()).await {
            Ok(tracker) => Some(Arc::new(tracker)),
            Err(e) => {
                error!("Telephony enabled but unavailable: {}", e);
                None
            }
        }
    } else {
        None
    };
    drop(raw_tx);

    let artwork = Arc::new(ArtworkResolver::new(config.artwork.clone()));

    let router = EventRouter {
        bus: bus.clone(),
        store: store.clone(),
        events: events.clone(),
        registry: registry.clone(),
        admission: admission.clone(),
        facade: facade.clone(),
        volume: VolumeBridge::new(PactlMixer, config.bluetooth.volume_max),
        calls: calls.clone(),
    };
    tokio::spawn(router.run(raw_rx));

    if let Some(endpoint) = config.push.endpoint.clone() {
        info!("Pushing playback state to {}", endpoint);
        let pusher = StatePusher::new(endpoint, artwork.clone());
        tokio::spawn(pusher.run(events.clone()));
    }

    spawn_connection_supervisor(admission.clone(), session.clone(), events.clone());

    // IPC socket
    if let Some(parent) = std::path::Path::new(&config.socket_path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let _ = std::fs::remove_file(&config.socket_path);
    let listener = UnixListener::bind(&config.socket_path)?;
    let context = Arc::new(IpcContext {
        facade,
        store,
        registry: registry.clone(),
        session,
        admission: admission.clone(),
        artwork,
        calls,
    });
    let server = IpcServer::new(listener, context);

    info!("CORSAC daemon ready on socket: {}", config.socket_path);

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down, disconnecting devices...");
            admission.disconnect_all(&registry).await;
        }
    }

    Ok(())
}

/// Holds the admission loop: wait for a device, sit out the session,
/// start over when it ends. A timeout just means nobody connected yet.
fn spawn_connection_supervisor(
    admission: Arc<AdmissionController>,
    session: Arc<RwLock<Session>>,
    events: EventBus,
) {
    tokio::spawn(async move {
        loop {
            match admission.await_connection().await {
                Ok(device) => {
                    let mut rx = events.subscribe();
                    loop {
                        match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
                            Ok(Ok(SessionEvent::DeviceDisconnected { address }))
                                if address == device.address =>
                            {
                                break;
                            }
                            Ok(Ok(_)) => {}
                            Ok(Err(broadcast::error::RecvError::Lagged(_))) => {}
                            Ok(Err(broadcast::error::RecvError::Closed)) => return,
                            Err(_) => {
                                // Periodic cross-check against the session
                                // itself, in case the disconnect event
                                // slipped past the subscription window.
                                if session.read().await.state != SessionState::Active {
                                    break;
                                }
                            }
                        }
                    }
                }
                Err(DaemonError::ConnectionTimeout) => {
                    warn!("No device connected before the deadline; waiting again");
                }
                Err(e) => {
                    error!("Connection watch failed: {}", e);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    });
}

async fn check_status(socket_path: &str) -> Result<()> {
    let mut stream = UnixStream::connect(socket_path).await?;
    stream.write_all(b"{\"type\":\"Status\"}\n").await?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line).await?;
    println!("{}", line.trim());
    Ok(())
}
