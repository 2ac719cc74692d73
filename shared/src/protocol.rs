//! The message envelope and its framing.
//!
//! Each frame on the byte stream is a 4-byte big-endian body length followed by
//! a bincode-encoded [`NetMessage`]. The body starts with the protocol version,
//! which is checked before anything else is decoded.

use crate::assets::ModuleInfo;
use crate::config::ViewDistance;
use crate::crypto::{Random, SealedSecret};
use crate::entity::{NetworkEntityId, PackedEntity, PackedEvent};
use crate::error::CodecError;
use crate::identity::PublicIdentityCertificate;
use crate::serialization::SerializationInfo;
use crate::world::{BlockFamilyRegistration, BlockPos, ChunkPos, RegionSnapshot};
use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u16 = 1;
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
pub const FRAME_HEADER_LEN: usize = 4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetMessage {
    pub version: u16,
    /// Server game time in milliseconds, for clock reconciliation.
    pub server_time: Option<u64>,
    pub payload: Payload,
}

impl NetMessage {
    pub fn new(payload: Payload) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            server_time: None,
            payload,
        }
    }

    pub fn with_time(payload: Payload, server_time: u64) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            server_time: Some(server_time),
            payload,
        }
    }
}

impl From<Payload> for NetMessage {
    fn from(payload: Payload) -> Self {
        NetMessage::new(payload)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeHello {
    pub random: Random,
    pub certificate: PublicIdentityCertificate,
    pub timestamp: u64,
}

impl HandshakeHello {
    /// Bytes both parties sign to prove they saw the same pair of hellos.
    pub fn signing_bytes(server: &HandshakeHello, client: &HandshakeHello) -> Result<Vec<u8>, CodecError> {
        let mut data = bincode::serialize(server)?;
        data.extend(bincode::serialize(client)?);
        Ok(data)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldInfo {
    pub title: String,
    pub time: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub time: u64,
    pub motd: Option<String>,
    pub online_players: u32,
    pub worlds: Vec<WorldInfo>,
    pub modules: Vec<ModuleInfo>,
    pub block_ids: Vec<(String, u16)>,
    pub registered_block_families: Vec<String>,
    pub components: Vec<SerializationInfo>,
    pub events: Vec<SerializationInfo>,
    /// Set when the server refuses the connection.
    pub error_message: Option<String>,
}

impl ServerInfo {
    pub fn rejection(message: impl Into<String>) -> Self {
        Self {
            error_message: Some(message.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDataHeader {
    pub id: String,
    pub version: String,
    pub size: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub name: String,
    pub view_distance: ViewDistance,
    /// RGBA.
    pub color: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    // Handshake
    HandshakeHello(HandshakeHello),
    HandshakeVerification {
        signature: Vec<u8>,
    },
    NewIdentityRequest {
        pre_master: SealedSecret,
        random: Random,
    },
    ProvisionIdentity {
        encrypted_certificates: Vec<u8>,
    },

    // Catalog sync
    ServerInfoRequest,
    ServerInfo(ServerInfo),
    ModuleRequest {
        module_id: String,
    },
    ModuleDataHeader(ModuleDataHeader),
    ModuleData {
        data: Vec<u8>,
    },
    Join(JoinRequest),
    JoinComplete {
        client_id: NetworkEntityId,
    },

    // Replication
    HeartBeat {
        time: u64,
    },
    CreateEntity {
        net_id: NetworkEntityId,
        entity: PackedEntity,
    },
    UpdateEntity {
        net_id: NetworkEntityId,
        entity: PackedEntity,
    },
    RemoveEntity {
        net_ids: Vec<NetworkEntityId>,
    },
    BlockChange {
        pos: BlockPos,
        block: u16,
    },
    ExtraDataChange {
        index: u32,
        pos: BlockPos,
        value: i32,
    },
    Event {
        target_id: NetworkEntityId,
        event: PackedEvent,
    },
    BlockEvent {
        target: BlockPos,
        event: PackedEvent,
    },
    ChunkData(RegionSnapshot),
    InvalidateChunk {
        pos: ChunkPos,
    },
    BlockFamilyRegistered(BlockFamilyRegistration),

    Disconnect {
        reason: String,
    },
}

impl Payload {
    pub fn name(&self) -> &'static str {
        match self {
            Payload::HandshakeHello(_) => "HandshakeHello",
            Payload::HandshakeVerification { .. } => "HandshakeVerification",
            Payload::NewIdentityRequest { .. } => "NewIdentityRequest",
            Payload::ProvisionIdentity { .. } => "ProvisionIdentity",
            Payload::ServerInfoRequest => "ServerInfoRequest",
            Payload::ServerInfo(_) => "ServerInfo",
            Payload::ModuleRequest { .. } => "ModuleRequest",
            Payload::ModuleDataHeader(_) => "ModuleDataHeader",
            Payload::ModuleData { .. } => "ModuleData",
            Payload::Join(_) => "Join",
            Payload::JoinComplete { .. } => "JoinComplete",
            Payload::HeartBeat { .. } => "HeartBeat",
            Payload::CreateEntity { .. } => "CreateEntity",
            Payload::UpdateEntity { .. } => "UpdateEntity",
            Payload::RemoveEntity { .. } => "RemoveEntity",
            Payload::BlockChange { .. } => "BlockChange",
            Payload::ExtraDataChange { .. } => "ExtraDataChange",
            Payload::Event { .. } => "Event",
            Payload::BlockEvent { .. } => "BlockEvent",
            Payload::ChunkData(_) => "ChunkData",
            Payload::InvalidateChunk { .. } => "InvalidateChunk",
            Payload::BlockFamilyRegistered(_) => "BlockFamilyRegistered",
            Payload::Disconnect { .. } => "Disconnect",
        }
    }
}

/// Encodes a message as one length-prefixed frame.
pub fn encode(message: &NetMessage) -> Result<Vec<u8>, CodecError> {
    let body = bincode::serialize(message)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge(body.len()));
    }

    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decodes a frame body (without the length prefix).
pub fn decode_body(body: &[u8]) -> Result<NetMessage, CodecError> {
    if body.len() >= 2 {
        // bincode writes the leading u16 little-endian.
        let version = u16::from_le_bytes([body[0], body[1]]);
        if version != PROTOCOL_VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }
    }
    Ok(bincode::deserialize(body)?)
}

/// Reads the body length out of a frame header.
pub fn frame_length(header: [u8; FRAME_HEADER_LEN]) -> Result<usize, CodecError> {
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge(len));
    }
    Ok(len)
}

/// Splits complete frames out of a growing byte buffer.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Returns the next complete message, or `None` if more bytes are needed.
    pub fn next_message(&mut self) -> Result<Option<NetMessage>, CodecError> {
        if self.buffer.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let mut header = [0u8; FRAME_HEADER_LEN];
        header.copy_from_slice(&self.buffer[..FRAME_HEADER_LEN]);
        let len = frame_length(header)?;
        if self.buffer.len() < FRAME_HEADER_LEN + len {
            return Ok(None);
        }

        let message = decode_body(&self.buffer[FRAME_HEADER_LEN..FRAME_HEADER_LEN + len]);
        self.buffer.drain(..FRAME_HEADER_LEN + len);
        message.map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heartbeat() -> NetMessage {
        NetMessage::with_time(Payload::HeartBeat { time: 42 }, 42)
    }

    #[test]
    fn test_frame_has_big_endian_length_prefix() {
        let frame = encode(&heartbeat()).unwrap();
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len, frame.len() - FRAME_HEADER_LEN);
        assert_eq!(decode_body(&frame[FRAME_HEADER_LEN..]).unwrap(), heartbeat());
    }

    #[test]
    fn test_unsupported_version_is_rejected() {
        let mut message = heartbeat();
        message.version = 99;
        let frame = encode(&message).unwrap();

        assert!(matches!(
            decode_body(&frame[FRAME_HEADER_LEN..]),
            Err(CodecError::UnsupportedVersion(99))
        ));
    }

    #[test]
    fn test_oversized_frame_header_is_rejected() {
        let header = ((MAX_FRAME_SIZE + 1) as u32).to_be_bytes();
        assert!(matches!(frame_length(header), Err(CodecError::FrameTooLarge(_))));
    }

    #[test]
    fn test_decoder_handles_split_and_joined_frames() {
        let first = encode(&heartbeat()).unwrap();
        let second = encode(&NetMessage::new(Payload::ServerInfoRequest)).unwrap();
        let mut stream = first.clone();
        stream.extend_from_slice(&second);

        let mut decoder = FrameDecoder::new();
        decoder.extend(&stream[..3]);
        assert!(decoder.next_message().unwrap().is_none());

        decoder.extend(&stream[3..]);
        assert_eq!(decoder.next_message().unwrap(), Some(heartbeat()));
        assert_eq!(
            decoder.next_message().unwrap().map(|m| m.payload),
            Some(Payload::ServerInfoRequest)
        );
        assert!(decoder.next_message().unwrap().is_none());
    }

    #[test]
    fn test_garbage_body_is_malformed() {
        let body = [PROTOCOL_VERSION.to_le_bytes()[0], PROTOCOL_VERSION.to_le_bytes()[1], 0xff, 0xff];
        assert!(matches!(decode_body(&body), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn test_every_kind_survives_the_wire() {
        let root = crate::identity::CertificateGenerator::generate_self_signed();
        let field = crate::entity::PackedField { id: 3, value: vec![9, 8] };
        let entity = PackedEntity {
            components: vec![crate::entity::PackedComponent {
                type_id: 1,
                fields: vec![field.clone()],
            }],
            removed_components: vec![4],
        };
        let event = PackedEvent {
            type_id: 2,
            fields: vec![field],
        };
        let pos = BlockPos::new(-3, 70, 12);
        let mut families = BlockFamilyRegistration::default();
        families.push("core:stone", 1);

        let payloads = vec![
            Payload::HandshakeHello(HandshakeHello {
                random: [7; 32],
                certificate: root.public.clone(),
                timestamp: 1_700_000_000_000,
            }),
            Payload::HandshakeVerification { signature: vec![1; 64] },
            Payload::NewIdentityRequest {
                pre_master: SealedSecret {
                    ephemeral_key: [5; 32],
                    ciphertext: vec![6; 60],
                },
                random: [8; 32],
            },
            Payload::ProvisionIdentity {
                encrypted_certificates: vec![2; 100],
            },
            Payload::ServerInfoRequest,
            Payload::ServerInfo(ServerInfo {
                time: 10,
                motd: Some("welcome".into()),
                online_players: 2,
                worlds: vec![WorldInfo {
                    title: "World".into(),
                    time: 10,
                }],
                modules: vec![ModuleInfo::new("core", "1.0.0")],
                block_ids: vec![("core:stone".into(), 1)],
                registered_block_families: vec!["core:stone".into()],
                components: vec![SerializationInfo {
                    id: 1,
                    name: "Location".into(),
                    field_names: vec!["position".into()],
                    field_ids: vec![0],
                }],
                events: Vec::new(),
                error_message: None,
            }),
            Payload::ModuleRequest {
                module_id: "core".into(),
            },
            Payload::ModuleDataHeader(ModuleDataHeader {
                id: "core".into(),
                version: "1.0.0".into(),
                size: 3000,
                error: None,
            }),
            Payload::ModuleData { data: vec![0; 1024] },
            Payload::Join(JoinRequest {
                name: "ann".into(),
                view_distance: ViewDistance::Far,
                color: 0xff00ffff,
            }),
            Payload::JoinComplete { client_id: 17 },
            Payload::HeartBeat { time: 99 },
            Payload::CreateEntity {
                net_id: 5,
                entity: entity.clone(),
            },
            Payload::UpdateEntity { net_id: 5, entity },
            Payload::RemoveEntity { net_ids: vec![5, 6] },
            Payload::BlockChange { pos, block: 12 },
            Payload::ExtraDataChange {
                index: 1,
                pos,
                value: -7,
            },
            Payload::Event {
                target_id: 5,
                event: event.clone(),
            },
            Payload::BlockEvent { target: pos, event },
            Payload::ChunkData(RegionSnapshot {
                pos: pos.chunk(),
                data: vec![4; 256],
            }),
            Payload::InvalidateChunk { pos: pos.chunk() },
            Payload::BlockFamilyRegistered(families),
            Payload::Disconnect {
                reason: "bye".into(),
            },
        ];

        for payload in payloads {
            let message = NetMessage::with_time(payload, 1234);
            let frame = encode(&message).unwrap();
            assert_eq!(decode_body(&frame[FRAME_HEADER_LEN..]).unwrap(), message);
        }
    }

    #[test]
    fn test_payload_names() {
        assert_eq!(Payload::ServerInfoRequest.name(), "ServerInfoRequest");
        assert_eq!(Payload::Disconnect { reason: String::new() }.name(), "Disconnect");
    }
}
