//! Per-connection state machine on the server.
//!
//! Exactly one stage owns a connection at a time: the handshake, then catalog
//! sync, then the replication session living in the directory. The network
//! task drives it with three events: [`ServerConnection::on_open`],
//! [`ServerConnection::on_message`] and [`ServerConnection::on_close`].

use crate::catalog::{CatalogStep, ServerCatalog};
use crate::context::{ServerContext, SlotReservation};
use crate::handshake::{HandshakeStep, ServerHandshake};
use log::{error, info};
use shared::error::ProtocolError;
use shared::identity::PublicIdentityCertificate;
use shared::lifecycle::{ConnectionState, Watchdog};
use shared::protocol::{JoinRequest, Payload};
use shared::NetMessage;
use std::sync::Arc;
use std::time::Instant;

enum Stage {
    Handshake(ServerHandshake),
    Catalog(ServerCatalog),
    Active,
    Closed,
}

/// What the network task must do after an event.
#[derive(Debug)]
pub enum Step {
    Reply(Vec<NetMessage>),
    /// Send these, then close the transport.
    Close(Vec<NetMessage>),
    /// Catalog sync is done; hand the connection to the directory.
    Join {
        peer: PublicIdentityCertificate,
        request: JoinRequest,
        slot: SlotReservation,
    },
    /// Replication traffic for the session's inbound queue.
    Forward(NetMessage),
}

pub struct ServerConnection {
    ctx: Arc<ServerContext>,
    stage: Stage,
    state: ConnectionState,
    watchdog: Watchdog,
    peer: Option<PublicIdentityCertificate>,
}

impl ServerConnection {
    pub fn new(ctx: Arc<ServerContext>, now: Instant) -> Self {
        let watchdog = Watchdog::new(ctx.config.connect_timeout(), now);
        let handshake = ServerHandshake::new(ctx.identity.clone());
        Self {
            ctx,
            stage: Stage::Handshake(handshake),
            state: ConnectionState::Connecting,
            watchdog,
            peer: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn peer(&self) -> Option<&PublicIdentityCertificate> {
        self.peer.as_ref()
    }

    pub fn on_open(&mut self, now: Instant) -> Vec<NetMessage> {
        self.watchdog.reset(now);
        match &mut self.stage {
            Stage::Handshake(handshake) => {
                self.state = ConnectionState::Handshaking;
                vec![handshake.start()]
            }
            _ => Vec::new(),
        }
    }

    pub fn on_message(&mut self, message: NetMessage, now: Instant) -> Step {
        if self.state.is_watched() {
            self.watchdog.reset(now);
        }

        let stage = std::mem::replace(&mut self.stage, Stage::Closed);
        match stage {
            Stage::Handshake(mut handshake) => match handshake.on_message(message) {
                Ok(HandshakeStep::Reply(replies)) => {
                    self.stage = Stage::Handshake(handshake);
                    Step::Reply(replies)
                }
                Ok(HandshakeStep::Done { replies, peer }) => {
                    info!("Peer {} authenticated", peer.id);
                    self.stage = Stage::Catalog(ServerCatalog::new(Arc::clone(&self.ctx), peer.clone()));
                    self.state = ConnectionState::CatalogSync;
                    self.peer = Some(peer);
                    Step::Reply(replies)
                }
                Err(e) => self.fail(e),
            },
            Stage::Catalog(mut catalog) => match catalog.on_message(message) {
                Ok(CatalogStep::Reply(replies)) => {
                    self.stage = Stage::Catalog(catalog);
                    Step::Reply(replies)
                }
                Ok(CatalogStep::Reject(replies)) => {
                    self.state = ConnectionState::Disconnected;
                    Step::Close(replies)
                }
                Ok(CatalogStep::Join { request, slot }) => match self.peer.clone() {
                    Some(peer) => {
                        self.stage = Stage::Active;
                        self.state = ConnectionState::Joined;
                        Step::Join { peer, request, slot }
                    }
                    None => self.fail(ProtocolError::UnexpectedMessage("Join")),
                },
                Err(e) => self.fail(e),
            },
            Stage::Active => {
                self.stage = Stage::Active;
                self.state = ConnectionState::Active;
                Step::Forward(message)
            }
            Stage::Closed => Step::Close(Vec::new()),
        }
    }

    /// Closes the connection if it made no progress within the threshold.
    pub fn check_timeout(&mut self, now: Instant) -> Option<Step> {
        if self.state.is_watched() && self.watchdog.is_expired(now) {
            return Some(self.fail(ProtocolError::Timeout));
        }
        None
    }

    pub fn timeout_deadline(&self) -> Option<Instant> {
        self.state.is_watched().then(|| self.watchdog.deadline())
    }

    /// Returns whether the connection had been handed to the directory.
    pub fn on_close(&mut self) -> bool {
        let joined = matches!(self.stage, Stage::Active);
        self.stage = Stage::Closed;
        self.state = ConnectionState::Disconnected;
        joined
    }

    fn fail(&mut self, err: ProtocolError) -> Step {
        error!("Closing connection: {}", err);
        self.stage = Stage::Closed;
        self.state = ConnectionState::Disconnected;
        Step::Close(vec![NetMessage::new(Payload::Disconnect {
            reason: err.to_string(),
        })])
    }
}
