//! Client-resident replication state for the server we joined.
//!
//! Once per network tick [`ServerSession::update`] sends a heartbeat and the
//! local player's owned-component changes, then applies everything the server
//! sent since the previous tick to the [`ClientWorld`].

use crate::world::{ClientWorld, EventTarget};
use log::{debug, error, info, warn};
use shared::entity::{EntitySerializer, EventData, FieldCheck, NetworkEntityId};
use shared::error::ProtocolError;
use shared::metrics::NetMetrics;
use shared::protocol::{Payload, ServerInfo};
use shared::serialization::{SerializationTables, TypeSchema};
use shared::transport::Outbound;
use shared::world::{BlockFamilyRegistration, BlockPos, ChunkPos};
use shared::NetMessage;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

/// A point change that arrived before the region holding it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParkedChange {
    Block { pos: BlockPos, block: u16 },
    ExtraData { index: u32, pos: BlockPos, value: i32 },
}

pub struct ServerSession {
    client_id: NetworkEntityId,
    server_info: ServerInfo,
    tables: SerializationTables,
    parked: BTreeMap<ChunkPos, Vec<ParkedChange>>,
    outbound: mpsc::UnboundedSender<Outbound>,
    inbound: mpsc::UnboundedReceiver<NetMessage>,
    metrics: Arc<NetMetrics>,
    server_time: u64,
    connected: bool,
    disconnect_reason: Option<String>,
}

impl ServerSession {
    /// Builds the session, binding the server's serialization ids to the
    /// locally known component and event types.
    pub fn new(
        client_id: NetworkEntityId,
        server_info: ServerInfo,
        component_schemas: &[TypeSchema],
        event_schemas: &[TypeSchema],
        outbound: mpsc::UnboundedSender<Outbound>,
        inbound: mpsc::UnboundedReceiver<NetMessage>,
        metrics: Arc<NetMetrics>,
    ) -> Self {
        let tables = SerializationTables::apply(
            &server_info.components,
            &server_info.events,
            component_schemas,
            event_schemas,
        );
        Self {
            client_id,
            server_time: server_info.time,
            server_info,
            tables,
            parked: BTreeMap::new(),
            outbound,
            inbound,
            metrics,
            connected: true,
            disconnect_reason: None,
        }
    }

    /// Network id of the entity representing us on the server.
    pub fn client_id(&self) -> NetworkEntityId {
        self.client_id
    }

    pub fn server_info(&self) -> &ServerInfo {
        &self.server_info
    }

    pub fn server_time(&self) -> u64 {
        self.server_time
    }

    pub fn metrics(&self) -> Arc<NetMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn disconnect_reason(&self) -> Option<&str> {
        self.disconnect_reason.as_deref()
    }

    /// Block ids the server announced at join time.
    pub fn register_initial_blocks(&self, world: &mut dyn ClientWorld) {
        for (uri, id) in &self.server_info.block_ids {
            world.register_block_family(uri, *id);
        }
    }

    fn send(&mut self, message: NetMessage) {
        if !self.connected {
            return;
        }
        if self.outbound.send(Outbound::Message(message)).is_err() {
            debug!("Outbound queue to the server is closed");
            self.connected = false;
        }
    }

    pub fn close(&mut self) {
        let _ = self.outbound.send(Outbound::Close);
        self.connected = false;
    }

    pub fn send_event(&mut self, target: NetworkEntityId, event: &EventData) {
        match EntitySerializer::new(&self.tables).serialize_event(event) {
            Ok(event) => self.send(NetMessage::new(Payload::Event {
                target_id: target,
                event,
            })),
            Err(e) => error!("Failed to serialize event {}: {}", event.type_name, e),
        }
    }

    pub fn send_block_event(&mut self, target: BlockPos, event: &EventData) {
        match EntitySerializer::new(&self.tables).serialize_event(event) {
            Ok(event) => self.send(NetMessage::new(Payload::BlockEvent { target, event })),
            Err(e) => error!("Failed to serialize event {}: {}", event.type_name, e),
        }
    }

    /// Runs one network tick.
    pub fn update(&mut self, world: &mut dyn ClientWorld) {
        if !self.connected {
            return;
        }

        self.send(NetMessage::new(Payload::HeartBeat { time: self.server_time }));
        self.send_local_changes(world);
        self.process_incoming(world);
    }

    fn send_local_changes(&mut self, world: &mut dyn ClientWorld) {
        let serializer = EntitySerializer::new(&self.tables);
        let mut messages = Vec::new();
        for (net_id, components) in world.take_local_changes() {
            match serializer.serialize(&components, FieldCheck::ClientToServer) {
                Ok(packed) if packed.components.iter().all(|c| c.fields.is_empty()) => {}
                Ok(entity) => messages.push(NetMessage::new(Payload::UpdateEntity { net_id, entity })),
                Err(e) => error!("Failed to serialize local changes to entity {}: {}", net_id, e),
            }
        }
        for message in messages {
            self.send(message);
        }
    }

    fn process_incoming(&mut self, world: &mut dyn ClientWorld) {
        loop {
            let message = match self.inbound.try_recv() {
                Ok(message) => message,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.connected = false;
                    break;
                }
            };

            if let Err(e) = self.apply(message, world) {
                warn!("Dropped message from server: {}", e);
            }
            if !self.connected {
                break;
            }
        }
    }

    fn apply(&mut self, message: NetMessage, world: &mut dyn ClientWorld) -> Result<(), ProtocolError> {
        let serializer = EntitySerializer::new(&self.tables);
        match message.payload {
            Payload::HeartBeat { time } => {
                self.server_time = message.server_time.unwrap_or(time);
                world.set_time(self.server_time);
            }
            Payload::CreateEntity { net_id, entity } => {
                let update = serializer.deserialize(&entity, FieldCheck::All)?;
                world.create_entity(net_id, update);
            }
            Payload::UpdateEntity { net_id, entity } => {
                if !world.has_entity(net_id) {
                    warn!("Received update for unknown entity {}", net_id);
                    return Ok(());
                }
                let update = serializer.deserialize(&entity, FieldCheck::All)?;
                world.update_entity(net_id, update);
            }
            Payload::RemoveEntity { net_ids } => {
                for net_id in net_ids {
                    world.remove_entity(net_id);
                }
            }
            Payload::BlockChange { pos, block } => {
                self.apply_or_park(world, ParkedChange::Block { pos, block });
            }
            Payload::ExtraDataChange { index, pos, value } => {
                self.apply_or_park(world, ParkedChange::ExtraData { index, pos, value });
            }
            Payload::ChunkData(snapshot) => {
                let pos = snapshot.pos;
                world.load_chunk(snapshot);
                for change in self.parked.remove(&pos).unwrap_or_default() {
                    apply_change(world, change);
                }
            }
            Payload::InvalidateChunk { pos } => {
                self.parked.remove(&pos);
                world.unload_chunk(pos);
            }
            Payload::BlockFamilyRegistered(registration) => register_families(world, &registration),
            Payload::Event { target_id, event } => {
                let event = serializer.deserialize_event(&event)?;
                world.deliver_event(EventTarget::Entity(target_id), event);
            }
            Payload::BlockEvent { target, event } => {
                let event = serializer.deserialize_event(&event)?;
                world.deliver_event(EventTarget::Block(target), event);
            }
            Payload::Disconnect { reason } => {
                info!("Disconnected by server: {}", reason);
                self.disconnect_reason = Some(reason);
                self.connected = false;
            }
            other => warn!("Unexpected {} from server", other.name()),
        }
        Ok(())
    }

    fn apply_or_park(&mut self, world: &mut dyn ClientWorld, change: ParkedChange) {
        let chunk = change.pos().chunk();
        if world.is_chunk_loaded(chunk) {
            apply_change(world, change);
        } else {
            self.parked.entry(chunk).or_default().push(change);
        }
    }

    /// Point changes waiting on regions that have not arrived.
    pub fn parked_changes(&self) -> usize {
        self.parked.values().map(Vec::len).sum()
    }
}

impl ParkedChange {
    fn pos(&self) -> BlockPos {
        match self {
            ParkedChange::Block { pos, .. } | ParkedChange::ExtraData { pos, .. } => *pos,
        }
    }
}

fn apply_change(world: &mut dyn ClientWorld, change: ParkedChange) {
    match change {
        ParkedChange::Block { pos, block } => world.set_block(pos, block),
        ParkedChange::ExtraData { index, pos, value } => world.set_extra_data(index, pos, value),
    }
}

fn register_families(world: &mut dyn ClientWorld, registration: &BlockFamilyRegistration) {
    match registration.entries() {
        Some(entries) if !entries.is_empty() => {
            for (uri, id) in entries {
                world.register_block_family(uri, id);
            }
        }
        _ => warn!("Received malformed block family registration"),
    }
}
