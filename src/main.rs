//! BitChat CLI application

use bitchat::{Config, Result};
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log filter (tracing EnvFilter syntax)
    #[arg(short, long, default_value = "info")]
    verbosity: String,

    /// Path to the data directory
    #[arg(short, long)]
    data_dir: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a mesh node and print events
    Start {
        /// Nickname announced to the mesh
        #[arg(short, long)]
        nickname: Option<String>,

        /// Battery class: normal, powersave, ultralow
        #[arg(short, long, default_value = "normal")]
        power_mode: String,
    },
    /// Print this node's identity (short ID and fingerprint)
    Identity,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    use tracing_subscriber::{fmt, EnvFilter};
    fmt()
        .with_env_filter(EnvFilter::new(&args.verbosity))
        .init();

    let mut config = Config::from_env();
    if let Some(dir) = args.data_dir {
        config.data_dir = dir.into();
    }

    match args.command {
        Command::Start {
            nickname,
            power_mode,
        } => {
            config.power_mode = match power_mode.to_lowercase().as_str() {
                "powersave" | "power-save" => bitchat::transport::PowerMode::PowerSave,
                "ultralow" | "ultra-low" => bitchat::transport::PowerMode::UltraLow,
                _ => bitchat::transport::PowerMode::Normal,
            };
            run_node(config, nickname).await
        }
        Command::Identity => show_identity(config).await,
    }
}

#[cfg(feature = "bluetooth")]
async fn run_node(config: Config, nickname: Option<String>) -> Result<()> {
    use bitchat::protocol::short_id;
    use bitchat::transport::ble::BleTransport;
    use bitchat::{BitchatApp, MeshEvent, MessageContent};
    use tokio::sync::mpsc;

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let transport = BleTransport::new(events_tx, None).await?;
    let app = BitchatApp::new(config, transport, events_rx);

    app.initialize().await?;
    let peer_id = app.start(nickname).await?;
    println!("bitchat up as {}", short_id(&peer_id));

    let mut events = app.events();
    let mut sigint = Box::pin(tokio::signal::ctrl_c());
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(MeshEvent::PeerFound { peer_id, nickname }) => {
                    println!("+ {} ({})", short_id(&peer_id), nickname);
                }
                Ok(MeshEvent::PeerLost { peer_id }) => {
                    println!("- {}", short_id(&peer_id));
                }
                Ok(MeshEvent::MessageReceived { from, content, is_private, .. }) => {
                    let tag = if is_private { "pm" } else { "msg" };
                    match content {
                        MessageContent::Text(text) => {
                            println!("[{}] {}: {}", tag, short_id(&from), text);
                        }
                        MessageContent::File { file_name, size, .. } => {
                            println!("[{}] {}: file {} ({} bytes)", tag, short_id(&from), file_name, size);
                        }
                    }
                }
                Ok(MeshEvent::SessionEstablished { peer_id, .. }) => {
                    println!("* secure session with {}", short_id(&peer_id));
                }
                Ok(_) => {}
                Err(_) => break,
            },
            _ = &mut sigint => break,
        }
    }

    app.stop().await
}

#[cfg(not(feature = "bluetooth"))]
async fn run_node(_config: Config, _nickname: Option<String>) -> Result<()> {
    Err(bitchat::Error::RadioUnavailable(
        "built without the `bluetooth` feature".into(),
    ))
}

async fn show_identity(config: Config) -> Result<()> {
    use bitchat::storage::SecureStorage;
    use std::sync::Arc;

    let storage = Arc::new(SecureStorage::open(&config.data_dir).await?);
    let identity = bitchat::identity::IdentityStore::open(storage).await?;
    println!("short id:    {}", bitchat::protocol::short_id(&identity.peer_id()));
    println!("fingerprint: {}", identity.local().fingerprint);
    Ok(())
}
