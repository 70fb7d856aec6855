//! meshline CLI - starts the local node: loads (or generates) its identity,
//! brings up whichever transports are configured, and relays inbound
//! messages to stdout while draining the outbox in the background.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::{Parser, Subcommand};

use meshline::boundary::BoundaryAdapter;
use meshline::config::MeshlineConfig;
use meshline::crypto::Identity;
#[cfg(feature = "sqlite")]
use meshline::message::outbox::OutboxStore;
#[cfg(feature = "sqlite")]
use meshline::message::MessageManager;
use meshline::session::SessionManager;
use meshline::transport::{RelayPool, Transport, TransportAddress, TransportEvent, TransportMultiplexer};
use meshline::Result;

#[derive(Parser, Debug)]
#[command(name = "meshline", author, version, about = "A decentralized, end-to-end encrypted mesh messenger", long_about = None)]
struct Cli {
    /// Path to a meshline.toml config file. Defaults to ./meshline.toml if present.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the node and stay running, relaying messages to stdout.
    Run,
    /// Print the local identity's fingerprint and peer id, then exit.
    Fingerprint,
}

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

fn load_or_generate_identity(path: &std::path::Path) -> Result<Identity> {
    if let Ok(bytes) = std::fs::read(path) {
        let array: [u8; 64] = bytes
            .try_into()
            .map_err(|_| meshline::Error::Config(format!("identity file at {} is malformed", path.display())))?;
        return Ok(Identity::from_bytes(&array));
    }

    let identity = Identity::generate();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, identity.to_bytes())?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(path)?.permissions();
        perms.set_mode(0o600);
        std::fs::set_permissions(path, perms)?;
    }
    Ok(identity)
}

#[tokio::main]
async fn main() -> Result<()> {
    meshline::logging::init();

    let cli = Cli::parse();
    let config = MeshlineConfig::load(cli.config.as_deref())?;

    let identity = Arc::new(load_or_generate_identity(&config.identity.key_path)?);
    tracing::info!(fingerprint = %identity.fingerprint(), peer_id = %identity.peer_id(), "identity loaded");

    match cli.command.unwrap_or(Command::Run) {
        Command::Fingerprint => {
            println!("peer id:     {}", identity.peer_id());
            println!("fingerprint: {}", identity.fingerprint());
            Ok(())
        }
        Command::Run => run(config, identity).await,
    }
}

async fn run(config: MeshlineConfig, identity: Arc<Identity>) -> Result<()> {
    let local_peer = identity.peer_id();

    let (sessions, session_events) = SessionManager::new(identity.clone());
    tokio::spawn(sessions.clone().run_idle_sweep());

    let mut multiplexer = TransportMultiplexer::new(local_peer, sessions.clone());

    #[cfg(feature = "bluetooth")]
    match meshline::transport::BluetoothTransport::new(local_peer).await {
        Ok(mut ble) => {
            let address = TransportAddress::Bluetooth(local_peer.to_string());
            if let Err(err) = ble.listen(address).await {
                tracing::warn!(%err, "failed to start Bluetooth listening, continuing without BLE");
            }
            multiplexer.set_ble_transport(Box::new(ble));
        }
        Err(err) => tracing::warn!(%err, "no Bluetooth adapter available, continuing without BLE"),
    }

    let mut nostr_inbound = None;
    if config.nostr.enabled {
        let (pool, inbound_rx) = RelayPool::new();
        let pool = Arc::new(pool);
        for url in &config.nostr.relay_urls {
            pool.add_relay(url.clone()).await;
        }
        multiplexer.set_nostr_pool(pool, identity.derive_nostr_keypair());
        nostr_inbound = Some(inbound_rx);
    }

    let multiplexer = Arc::new(multiplexer);

    // The durable outbox/message manager only exist with the `sqlite`
    // feature; without it the node still runs, just without persisted
    // send-retry-offline-delivery (BoundaryAdapter::send isn't available).
    #[cfg(feature = "sqlite")]
    let boundary = {
        let outbox = Arc::new(OutboxStore::open(&config.outbox.sqlite_path)?);
        let (messages, message_events) =
            MessageManager::new(local_peer, outbox, multiplexer.clone(), config.outbox.max_attempts);
        messages.rehydrate()?;
        tokio::spawn(messages.clone().run_worker());

        let boundary = Arc::new(BoundaryAdapter::new(identity.clone(), sessions.clone(), multiplexer.clone(), messages));
        let relay = boundary.clone();
        tokio::spawn(async move { relay.relay_message_events(message_events).await });
        boundary
    };
    #[cfg(not(feature = "sqlite"))]
    let boundary = Arc::new(BoundaryAdapter::new(identity.clone(), sessions.clone(), multiplexer.clone()));

    {
        let boundary = boundary.clone();
        tokio::spawn(async move { boundary.relay_session_events(session_events).await });
    }

    if let Some(mut inbound_rx) = nostr_inbound {
        let multiplexer = multiplexer.clone();
        let boundary = boundary.clone();
        tokio::spawn(async move {
            while let Some((_relay_url, event)) = inbound_rx.recv().await {
                match multiplexer.ingest_nostr_event(&event, now_ms()).await {
                    Ok(Some(delivered)) => boundary.publish_delivered(delivered.from, delivered.plaintext),
                    Ok(None) => {}
                    Err(err) => tracing::warn!(%err, "failed to process inbound Nostr event"),
                }
            }
        });
    }

    let mut subscription = boundary.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = subscription.recv().await {
            tracing::info!(?event, "boundary event");
        }
    });

    tracing::info!("meshline node running; Ctrl-C to stop");
    loop {
        tokio::select! {
            event = multiplexer.next_ble_event() => {
                match event {
                    Some(TransportEvent::DataReceived { peer_id, data }) => {
                        match multiplexer.ingest_ble_frame(peer_id, &data, now_ms()).await {
                            Ok(Some(delivered)) => boundary.publish_delivered(delivered.from, delivered.plaintext),
                            Ok(None) => {}
                            Err(err) => tracing::warn!(%err, "failed to process inbound BLE frame"),
                        }
                    }
                    Some(other) => boundary.publish_transport(&other),
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                break;
            }
        }
    }

    Ok(())
}
