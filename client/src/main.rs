use clap::Parser;
use client::identity_store::JsonIdentityStore;
use client::network::{Client, ClientMessage, ClientSchemas};
use client::supervisor::ClientContext;
use client::world::MemoryClientWorld;
use log::{error, info};
use shared::assets::DirectoryModuleRegistry;
use shared::config::{NetworkConfig, ViewDistance};
use shared::join_status::JoinStatus;
use shared::protocol::JoinRequest;
use shared::serialization::{FieldReplication, FieldSchema, TypeSchema};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:25777")]
    server: String,

    /// Player name; the server makes it unique
    #[arg(short = 'n', long, default_value = "Player")]
    name: String,

    /// Player color as RGBA hex
    #[arg(long, default_value = "ffffffff", value_parser = parse_color)]
    color: u32,

    /// View distance index, 0 (near) to 5 (extreme)
    #[arg(short = 'v', long, default_value = "0")]
    view_distance: u8,

    /// Directory holding identities and downloaded modules
    #[arg(short = 'd', long, default_value = "client-data")]
    data_dir: PathBuf,

    /// JSON network configuration file
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,
}

fn parse_color(value: &str) -> Result<u32, String> {
    u32::from_str_radix(value.trim_start_matches('#'), 16).map_err(|e| e.to_string())
}

/// Component and event types this client understands.
fn builtin_schemas() -> ClientSchemas {
    ClientSchemas {
        components: vec![
            TypeSchema::new(
                "Client",
                vec![
                    FieldSchema::new("peer_id", FieldReplication::ServerToAll),
                    FieldSchema::new("name", FieldReplication::ServerToAll),
                    FieldSchema::new("color", FieldReplication::ServerToAll),
                ],
            ),
            TypeSchema::new(
                "Location",
                vec![
                    FieldSchema::new("position", FieldReplication::OwnerToServer),
                    FieldSchema::new("rotation", FieldReplication::OwnerToServer),
                ],
            ),
        ],
        events: vec![TypeSchema::new(
            "Chat",
            vec![FieldSchema::new("message", FieldReplication::ServerToAll)],
        )],
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => NetworkConfig::load(path)?,
        None => NetworkConfig::default(),
    };
    let view_distance = ViewDistance::from_index(args.view_distance)
        .ok_or_else(|| format!("invalid view distance {}", args.view_distance))?;

    std::fs::create_dir_all(&args.data_dir)?;
    let install_dir = args.data_dir.join("modules");
    let modules = DirectoryModuleRegistry::open(&install_dir)?;
    let identities = JsonIdentityStore::load(args.data_dir.join("identities.json"))?;
    let join_status = Arc::new(JoinStatus::new());

    info!("Starting client...");
    info!("Connecting to: {}", args.server);

    let ctx = ClientContext {
        config,
        identities: Box::new(identities),
        modules: Box::new(modules),
        install_dir,
        join_status: Arc::clone(&join_status),
        join: JoinRequest {
            name: args.name,
            view_distance,
            color: args.color,
        },
    };

    let mut client = match Client::connect(&args.server, ctx, builtin_schemas()).await {
        Ok(client) => client,
        Err(e) => {
            let reason = join_status.error_message().unwrap_or_else(|| e.to_string());
            error!("Unable to join {}: {}", args.server, reason);
            return Err(reason.into());
        }
    };

    let shutdown = client.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, disconnecting...");
            let _ = shutdown.send(ClientMessage::Shutdown);
        }
    });

    let mut world = MemoryClientWorld::new();
    if let Some(reason) = client.run(&mut world).await {
        info!("Server closed the connection: {}", reason);
    }

    Ok(())
}
