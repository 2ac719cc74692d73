//! # Replication Server Library
//!
//! This library hosts the authoritative side of the network layer. It
//! authenticates peers, brings their module catalog in line with the server's,
//! and then keeps each client's view of the world in sync with the simulation.
//!
//! ## Connection Lifecycle
//!
//! Every connection walks the same states:
//! `Connecting → Handshaking → CatalogSync → Joined → Active`, ending in
//! `Disconnected`. A watchdog closes connections that stop making progress
//! before they reach `Joined`; after that the tick cadence implies liveness.
//!
//! ### Handshake (`handshake`)
//! Mutual authentication with identity certificates. New peers get a
//! certificate pair issued by the server's root identity; returning peers
//! prove possession of theirs by signing both hello messages.
//!
//! ### Catalog Sync (`catalog`)
//! Answers server info and module requests and streams module archives in
//! fixed-size chunks. The join request is checked against the connect list
//! and the player limit here; refused peers receive a final server info with
//! an error message before the connection closes.
//!
//! ### Replication (`directory`, `client_session`)
//! The directory assigns network ids, keeps the owner forest, and tells every
//! session what became relevant, changed, or went away. Each session flushes
//! its pending state once per tick in a fixed order and applies updates from
//! its client only for entities that client owns.
//!
//! ## Architecture Design
//!
//! ### Single-Threaded Tick
//! All directory and session state is touched only by the tick loop. Network
//! tasks hand over newly joined and disconnected clients through channels, and
//! each session reads its client's messages from its own inbound queue.
//!
//! ### One Task Per Connection
//! Each TCP connection runs a reader task, which also drives handshake and
//! catalog sync, plus a writer task draining that connection's outbound queue.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::connect_list::JsonConnectList;
//! use server::context::ServerContext;
//! use server::network::Server;
//! use server::world::{MemoryEntityStore, MemoryPlayerStore};
//! use shared::assets::MemoryModuleRegistry;
//! use shared::config::NetworkConfig;
//! use shared::identity::CertificateGenerator;
//! use shared::serialization::SerializationTables;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let ctx = ServerContext::new(
//!         NetworkConfig::default(),
//!         CertificateGenerator::generate_self_signed(),
//!         SerializationTables::default(),
//!         Box::new(MemoryModuleRegistry::new()),
//!         Box::new(JsonConnectList::in_memory()),
//!     );
//!     let mut server = Server::bind(
//!         "127.0.0.1:25777",
//!         Arc::new(ctx),
//!         Box::new(MemoryEntityStore::new()),
//!         Box::new(MemoryPlayerStore::new()),
//!     )
//!     .await?;
//!
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod catalog;
pub mod client_session;
pub mod connect_list;
pub mod context;
pub mod directory;
pub mod handshake;
pub mod network;
pub mod session;
pub mod supervisor;
pub mod world;
