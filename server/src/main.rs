use clap::Parser;
use log::{error, info};
use server::connect_list::JsonConnectList;
use server::context::{load_or_generate_identity, ServerContext};
use server::network::{Server, ServerMessage};
use server::world::{MemoryEntityStore, MemoryPlayerStore};
use shared::assets::DirectoryModuleRegistry;
use shared::config::NetworkConfig;
use shared::serialization::{FieldReplication, FieldSchema, SerializationTables, TypeSchema};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server IP address to bind to
    #[clap(short = 'H', long, default_value = "127.0.0.1")]
    host: String,
    /// Server port to listen on
    #[clap(short, long, default_value = "25777")]
    port: u16,
    /// JSON network configuration file
    #[clap(short, long)]
    config: Option<PathBuf>,
    /// Directory holding the identity, connect list and modules
    #[clap(short, long, default_value = "server-data")]
    data_dir: PathBuf,
    /// Message of the day, overrides the configuration file
    #[clap(long)]
    motd: Option<String>,
    /// Maximum number of connected clients, overrides the configuration file
    #[clap(long)]
    max_clients: Option<usize>,
}

/// Component and event types known to the built-in entity store.
fn builtin_tables() -> SerializationTables {
    SerializationTables::generate(
        &[
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
        &[TypeSchema::new(
            "Chat",
            vec![FieldSchema::new("message", FieldReplication::ServerToAll)],
        )],
    )
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => NetworkConfig::load(path)?,
        None => NetworkConfig::default(),
    };
    if args.motd.is_some() {
        config.server_motd = args.motd.clone();
    }
    if let Some(max_clients) = args.max_clients {
        config.max_clients = max_clients;
    }

    std::fs::create_dir_all(&args.data_dir)?;
    let identity = load_or_generate_identity(&args.data_dir.join("server-identity.json"))?;
    let modules = DirectoryModuleRegistry::open(args.data_dir.join("modules"))?;
    let connect_list = JsonConnectList::load(args.data_dir.join("connect-list.json"))?;
    info!("Server identity {}", identity.id());

    let ctx = Arc::new(ServerContext::new(
        config,
        identity,
        builtin_tables(),
        Box::new(modules),
        Box::new(connect_list),
    ));

    let address = format!("{}:{}", args.host, args.port);
    let mut server = Server::bind(
        &address,
        ctx,
        Box::new(MemoryEntityStore::new().with_server_events(["Chat"])),
        Box::new(MemoryPlayerStore::new()),
    )
    .await?;

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, shutting down gracefully...");
                let _ = shutdown.send(ServerMessage::Shutdown);
            }
            Err(e) => error!("Unable to listen for Ctrl+C: {}", e),
        }
    });

    server.run().await
}
