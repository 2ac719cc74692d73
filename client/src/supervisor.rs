//! Per-connection state machine on the client.
//!
//! Mirrors the server's supervisor: the handshake, then catalog sync, then the
//! joined session. Until the join completes, every failure is reported through
//! the shared [`JoinStatus`] so a UI polling it sees why the join failed.

use crate::catalog::{CatalogStep, ClientCatalogSync};
use crate::handshake::{ClientHandshake, HandshakeStep};
use crate::identity_store::IdentityStore;
use log::{error, info};
use shared::assets::ModuleRegistry;
use shared::config::NetworkConfig;
use shared::error::ProtocolError;
use shared::identity::PublicIdentityCertificate;
use shared::join_status::JoinStatus;
use shared::lifecycle::{ConnectionState, Watchdog};
use shared::protocol::{JoinRequest, Payload, ServerInfo};
use shared::{NetMessage, NetworkEntityId};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

/// Everything a client needs to join a server.
pub struct ClientContext {
    pub config: NetworkConfig,
    pub identities: Box<dyn IdentityStore>,
    pub modules: Box<dyn ModuleRegistry>,
    /// Where downloaded module archives are installed.
    pub install_dir: PathBuf,
    pub join_status: Arc<JoinStatus>,
    pub join: JoinRequest,
}

enum Stage {
    Handshake(ClientHandshake),
    Catalog(ClientCatalogSync),
    Joined,
    Closed,
}

#[derive(Debug)]
pub enum Step {
    Reply(Vec<NetMessage>),
    /// Close the transport; the join failed with this error.
    Close(ProtocolError),
    Joined {
        client_id: NetworkEntityId,
        server_info: ServerInfo,
    },
    /// Replication traffic for the joined session.
    Forward(NetMessage),
}

pub struct ClientConnection {
    ctx: ClientContext,
    stage: Stage,
    state: ConnectionState,
    watchdog: Watchdog,
    server: Option<PublicIdentityCertificate>,
}

impl ClientConnection {
    pub fn new(ctx: ClientContext, now: Instant) -> Self {
        let watchdog = Watchdog::new(ctx.config.connect_timeout(), now);
        Self {
            ctx,
            stage: Stage::Handshake(ClientHandshake::new()),
            state: ConnectionState::Connecting,
            watchdog,
            server: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn join_status(&self) -> Arc<JoinStatus> {
        Arc::clone(&self.ctx.join_status)
    }

    pub fn server(&self) -> Option<&PublicIdentityCertificate> {
        self.server.as_ref()
    }

    pub fn context(&self) -> &ClientContext {
        &self.ctx
    }

    /// The transport is up; the server speaks first.
    pub fn on_open(&mut self, now: Instant) {
        self.watchdog.reset(now);
        self.state = ConnectionState::Handshaking;
        self.ctx.join_status.set_current_activity("Authenticating");
    }

    pub fn on_message(&mut self, message: NetMessage, now: Instant) -> Step {
        if self.state.is_watched() {
            self.watchdog.reset(now);
        }
        if let Payload::Disconnect { reason } = &message.payload {
            if !matches!(self.stage, Stage::Joined) {
                let reason = reason.clone();
                return self.fail(ProtocolError::Authorization(reason));
            }
        }

        let stage = std::mem::replace(&mut self.stage, Stage::Closed);
        match stage {
            Stage::Handshake(mut handshake) => match handshake.on_message(message, self.ctx.identities.as_mut()) {
                Ok(HandshakeStep::Reply(replies)) => {
                    self.stage = Stage::Handshake(handshake);
                    Step::Reply(replies)
                }
                Ok(HandshakeStep::Done { server }) => {
                    info!("Authenticated server {}", server.id);
                    self.server = Some(server);
                    self.state = ConnectionState::CatalogSync;
                    let mut catalog = ClientCatalogSync::new(
                        Arc::clone(&self.ctx.join_status),
                        self.ctx.install_dir.clone(),
                        self.ctx.join.clone(),
                    );
                    let replies = catalog.start();
                    self.stage = Stage::Catalog(catalog);
                    Step::Reply(replies)
                }
                Err(e) => self.fail(e),
            },
            Stage::Catalog(mut catalog) => match catalog.on_message(message, self.ctx.modules.as_mut()) {
                Ok(CatalogStep::Reply(replies)) => {
                    self.stage = Stage::Catalog(catalog);
                    Step::Reply(replies)
                }
                Ok(CatalogStep::Joined { client_id, server_info }) => {
                    self.stage = Stage::Joined;
                    self.state = ConnectionState::Joined;
                    Step::Joined { client_id, server_info }
                }
                Err(e) => self.fail(e),
            },
            Stage::Joined => {
                self.stage = Stage::Joined;
                self.state = ConnectionState::Active;
                Step::Forward(message)
            }
            Stage::Closed => Step::Close(ProtocolError::UnexpectedMessage(message.payload.name())),
        }
    }

    pub fn check_timeout(&mut self, now: Instant) -> Option<Step> {
        if self.state.is_watched() && self.watchdog.is_expired(now) {
            return Some(self.fail(ProtocolError::Timeout));
        }
        None
    }

    pub fn timeout_deadline(&self) -> Option<Instant> {
        self.state.is_watched().then(|| self.watchdog.deadline())
    }

    /// The transport closed. A join still in flight fails.
    pub fn on_close(&mut self) {
        if !matches!(self.stage, Stage::Joined | Stage::Closed) {
            self.ctx.join_status.set_error_message("Connection to server lost");
        }
        self.stage = Stage::Closed;
        self.state = ConnectionState::Disconnected;
    }

    fn fail(&mut self, err: ProtocolError) -> Step {
        error!("Failed to join server: {}", err);
        self.ctx.join_status.set_error_message(err.to_string());
        self.stage = Stage::Closed;
        self.state = ConnectionState::Disconnected;
        Step::Close(err)
    }
}
