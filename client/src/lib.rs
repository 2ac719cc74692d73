//! # Replication Client Library
//!
//! This library provides the client side of the voxel world replication layer.
//! It connects to a server, proves or obtains an identity, downloads the
//! modules the server runs, joins, and then keeps a local copy of the world in
//! sync with the server's authoritative state.
//!
//! ## Architecture Overview
//!
//! A connection moves through three stages, each owned by one state machine:
//!
//! ### Handshake
//! The server speaks first with its self-signed certificate. A client that
//! already holds an identity issued by that server signs both hellos and checks
//! the server's countersignature. Otherwise it seals a fresh secret to the
//! server and receives a new certificate pair encrypted under the derived keys.
//!
//! ### Catalog Sync
//! The client asks for the server info, compares the module list against its
//! local registry and downloads whatever is missing. Archives are written to a
//! temporary file and only installed once their declared size has arrived.
//!
//! ### Replication
//! After the join completes, every network tick sends a heartbeat and the
//! owner-authoritative changes made locally, then applies entity, block, chunk
//! and event traffic from the server to the [`world::ClientWorld`].
//!
//! ## Module Organization
//!
//! ### Identity Store Module (`identity_store`)
//! Identities issued by servers, kept in memory or in a JSON file.
//!
//! ### Handshake Module (`handshake`)
//! The client side of identity provisioning and verification.
//!
//! ### Catalog Module (`catalog`)
//! Server info, module downloads and the join request.
//!
//! ### Supervisor Module (`supervisor`)
//! Sequences the stages, runs the connect watchdog and reports progress on the
//! shared join status.
//!
//! ### Server Session Module (`server_session`)
//! Per-tick replication once joined.
//!
//! ### World Module (`world`)
//! The seam between replication and the game's local world.
//!
//! ### Network Module (`network`)
//! TCP transport, reader and writer tasks, and the tick loop.
//!
//! ## Usage Example
//!
//! ```no_run
//! use client::identity_store::MemoryIdentityStore;
//! use client::network::{Client, ClientSchemas};
//! use client::supervisor::ClientContext;
//! use client::world::MemoryClientWorld;
//! use shared::assets::MemoryModuleRegistry;
//! use shared::config::{NetworkConfig, ViewDistance};
//! use shared::join_status::JoinStatus;
//! use shared::protocol::JoinRequest;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), shared::ProtocolError> {
//! let ctx = ClientContext {
//!     config: NetworkConfig::default(),
//!     identities: Box::new(MemoryIdentityStore::new()),
//!     modules: Box::new(MemoryModuleRegistry::new()),
//!     install_dir: "modules".into(),
//!     join_status: Arc::new(JoinStatus::new()),
//!     join: JoinRequest {
//!         name: "player".into(),
//!         view_distance: ViewDistance::Moderate,
//!         color: 0xffffffff,
//!     },
//! };
//!
//! let mut client = Client::connect("127.0.0.1:25777", ctx, ClientSchemas::default()).await?;
//! let mut world = MemoryClientWorld::new();
//! client.run(&mut world).await;
//! # Ok(())
//! # }
//! ```

pub mod catalog;
pub mod handshake;
pub mod identity_store;
pub mod network;
pub mod server_session;
pub mod supervisor;
pub mod world;
