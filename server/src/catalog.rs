//! Server side of catalog sync: answers server info and module requests, then
//! authorizes the join.

use crate::context::{ServerContext, SlotReservation};
use log::{info, warn};
use shared::error::ProtocolError;
use shared::identity::PublicIdentityCertificate;
use shared::protocol::{JoinRequest, ModuleDataHeader, Payload, ServerInfo};
use shared::NetMessage;
use std::sync::Arc;

/// Size of each `ModuleData` chunk.
pub const MODULE_CHUNK_SIZE: usize = 1024;

#[derive(Debug)]
pub enum CatalogStep {
    Reply(Vec<NetMessage>),
    /// The join was refused: send these, then close.
    Reject(Vec<NetMessage>),
    /// Authorized; `slot` holds a client slot until the directory admits the client.
    Join {
        request: JoinRequest,
        slot: SlotReservation,
    },
}

pub struct ServerCatalog {
    ctx: Arc<ServerContext>,
    peer: PublicIdentityCertificate,
}

impl ServerCatalog {
    pub fn new(ctx: Arc<ServerContext>, peer: PublicIdentityCertificate) -> Self {
        Self { ctx, peer }
    }

    pub fn on_message(&mut self, message: NetMessage) -> Result<CatalogStep, ProtocolError> {
        match message.payload {
            Payload::ServerInfoRequest => Ok(CatalogStep::Reply(vec![NetMessage::with_time(
                Payload::ServerInfo(self.ctx.server_info()),
                self.ctx.game_time(),
            )])),
            Payload::ModuleRequest { module_id } => Ok(CatalogStep::Reply(self.module_messages(&module_id))),
            Payload::Join(request) => Ok(self.authorize(request)),
            other => Err(ProtocolError::UnexpectedMessage(other.name())),
        }
    }

    fn error_header(module_id: &str, error: String) -> Vec<NetMessage> {
        vec![NetMessage::new(Payload::ModuleDataHeader(ModuleDataHeader {
            id: module_id.to_string(),
            version: String::new(),
            size: 0,
            error: Some(error),
        }))]
    }

    fn module_messages(&self, module_id: &str) -> Vec<NetMessage> {
        let shared = self
            .ctx
            .modules
            .shared_modules()
            .iter()
            .any(|m| m.id.eq_ignore_ascii_case(module_id));
        if !shared {
            warn!("Refused module {} to {}: not shared with clients", module_id, self.peer.id);
            return Self::error_header(module_id, format!("module '{}' is not available", module_id));
        }

        match self.ctx.modules.read_archive(module_id) {
            Ok((module, data)) => {
                info!(
                    "Sending module {} {} ({} bytes) to {}",
                    module.id,
                    module.version,
                    data.len(),
                    self.peer.id
                );
                let mut messages = vec![NetMessage::new(Payload::ModuleDataHeader(ModuleDataHeader {
                    id: module.id,
                    version: module.version,
                    size: data.len() as u64,
                    error: None,
                }))];
                messages.extend(data.chunks(MODULE_CHUNK_SIZE).map(|chunk| {
                    NetMessage::new(Payload::ModuleData {
                        data: chunk.to_vec(),
                    })
                }));
                messages
            }
            Err(e) => {
                warn!("Unable to send module {} to {}: {}", module_id, self.peer.id, e);
                Self::error_header(module_id, e.to_string())
            }
        }
    }

    fn authorize(&self, request: JoinRequest) -> CatalogStep {
        let reason = if !self.ctx.connect_list.is_allowed(&self.peer.id) {
            self.ctx.connect_list.reason_denied(&self.peer.id)
        } else {
            match self.ctx.try_reserve_slot() {
                Some(slot) => return CatalogStep::Join { request, slot },
                None => "Server is full".to_string(),
            }
        };

        info!("Refused join from {}: {}", self.peer.id, reason);
        CatalogStep::Reject(vec![NetMessage::new(Payload::ServerInfo(ServerInfo::rejection(
            reason,
        )))])
    }
}
