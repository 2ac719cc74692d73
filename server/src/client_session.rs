//! Server-resident replication state for one remote client.
//!
//! Each remote client tracks which network entities it has been told about and
//! what has changed since the last flush:
//! - `initial`: entities the client has not been sent yet
//! - `dirty`: known entities with pending component changes
//! - `removed`: known entities the client must be told to drop
//! - `relevant`: every entity the client currently knows about
//!
//! An id is in at most one of `initial`, `dirty` and `removed` at any time.
//! Everything is flushed once per network tick by [`ClientSession::update`].

use crate::directory::ReplicationView;
use crate::session::SessionCore;
use crate::world::{EntityRef, EntityStore};
use indexmap::IndexMap;
use log::{debug, error, warn};
use shared::entity::{EntitySerializer, EventData, FieldCheck, NetworkEntityId, PackedEntity, PackedEvent};
use shared::error::{ProtocolError, SerializationError};
use shared::metrics::NetMetrics;
use shared::protocol::Payload;
use shared::transport::Outbound;
use shared::world::{BlockFamilyRegistration, BlockPos, ChunkPos, RegionSnapshot};
use shared::{NetMessage, NULL_NET_ID};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

/// Regions per second granted for each KB/s of per-client bandwidth.
pub const CHUNK_SEND_RATE: f64 = 0.05469;

/// Block family registrations waiting to be flushed. Appended to from outside
/// the tick, hence the lock.
pub type FamilyQueue = Arc<Mutex<BlockFamilyRegistration>>;

type ComponentMap = BTreeMap<NetworkEntityId, BTreeSet<String>>;

fn map_insert(map: &mut ComponentMap, id: NetworkEntityId, component: &str) {
    map.entry(id).or_default().insert(component.to_string());
}

fn map_remove(map: &mut ComponentMap, id: NetworkEntityId, component: &str) -> bool {
    let Some(set) = map.get_mut(&id) else {
        return false;
    };
    let removed = set.remove(component);
    if set.is_empty() {
        map.remove(&id);
    }
    removed
}

fn map_contains(map: &ComponentMap, id: NetworkEntityId, component: &str) -> bool {
    map.get(&id).is_some_and(|set| set.contains(component))
}

/// Pending component changes for one dirty entity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirtyEntity {
    pub id: NetworkEntityId,
    pub added: BTreeSet<String>,
    pub changed: BTreeSet<String>,
    pub removed: BTreeSet<String>,
}

#[derive(Debug, Default)]
pub struct ReplicationState {
    initial: BTreeSet<NetworkEntityId>,
    dirty: BTreeSet<NetworkEntityId>,
    removed: BTreeSet<NetworkEntityId>,
    relevant: BTreeSet<NetworkEntityId>,
    added_components: ComponentMap,
    removed_components: ComponentMap,
    changed_components: ComponentMap,
}

impl ReplicationState {
    pub fn initial(&self) -> &BTreeSet<NetworkEntityId> {
        &self.initial
    }

    pub fn dirty(&self) -> &BTreeSet<NetworkEntityId> {
        &self.dirty
    }

    pub fn removed(&self) -> &BTreeSet<NetworkEntityId> {
        &self.removed
    }

    pub fn relevant(&self) -> &BTreeSet<NetworkEntityId> {
        &self.relevant
    }

    fn clear_components(&mut self, id: NetworkEntityId) {
        self.added_components.remove(&id);
        self.removed_components.remove(&id);
        self.changed_components.remove(&id);
    }

    fn has_pending_components(&self, id: NetworkEntityId) -> bool {
        self.added_components.contains_key(&id)
            || self.removed_components.contains_key(&id)
            || self.changed_components.contains_key(&id)
    }

    /// The entity became relevant; its full state goes out on the next flush.
    /// `relevant` keeps ids the client still holds, so a later removal is sent.
    pub fn set_net_initial(&mut self, id: NetworkEntityId) {
        if self.removed.remove(&id) {
            self.relevant.insert(id);
        }
        self.dirty.remove(&id);
        self.clear_components(id);
        self.initial.insert(id);
    }

    /// The entity stopped being relevant. Entities the client never received
    /// are simply dropped.
    pub fn set_net_removed(&mut self, id: NetworkEntityId) {
        self.initial.remove(&id);
        let was_relevant = self.relevant.remove(&id);
        self.dirty.remove(&id);
        self.clear_components(id);
        if was_relevant {
            self.removed.insert(id);
        }
    }

    pub fn set_component_added(&mut self, id: NetworkEntityId, component: &str) {
        if !self.relevant.contains(&id) || self.initial.contains(&id) {
            return;
        }
        // Re-adding a component pending removal is just a change.
        if map_remove(&mut self.removed_components, id, component) {
            map_insert(&mut self.changed_components, id, component);
        } else {
            map_insert(&mut self.added_components, id, component);
        }
        self.dirty.insert(id);
    }

    pub fn set_component_removed(&mut self, id: NetworkEntityId, component: &str) {
        if !self.relevant.contains(&id) || self.initial.contains(&id) {
            return;
        }
        // Removing a component the client never saw cancels the add.
        if !map_remove(&mut self.added_components, id, component) {
            map_remove(&mut self.changed_components, id, component);
            map_insert(&mut self.removed_components, id, component);
        }
        if self.has_pending_components(id) {
            self.dirty.insert(id);
        } else {
            self.dirty.remove(&id);
        }
    }

    pub fn set_component_dirty(&mut self, id: NetworkEntityId, component: &str) {
        if !self.relevant.contains(&id)
            || self.initial.contains(&id)
            || map_contains(&self.added_components, id, component)
        {
            return;
        }
        map_insert(&mut self.changed_components, id, component);
        self.dirty.insert(id);
    }

    /// Drains `initial` in ascending id order, marking each id relevant.
    fn take_initial(&mut self) -> Vec<NetworkEntityId> {
        let ids: Vec<_> = std::mem::take(&mut self.initial).into_iter().collect();
        self.relevant.extend(ids.iter().copied());
        ids
    }

    fn take_removed(&mut self) -> Vec<NetworkEntityId> {
        std::mem::take(&mut self.removed).into_iter().collect()
    }

    fn take_dirty(&mut self) -> Vec<DirtyEntity> {
        let ids = std::mem::take(&mut self.dirty);
        let mut added = std::mem::take(&mut self.added_components);
        let mut changed = std::mem::take(&mut self.changed_components);
        let mut removed = std::mem::take(&mut self.removed_components);

        ids.into_iter()
            .map(|id| DirtyEntity {
                id,
                added: added.remove(&id).unwrap_or_default(),
                changed: changed.remove(&id).unwrap_or_default(),
                removed: removed.remove(&id).unwrap_or_default(),
            })
            .collect()
    }
}

/// Region snapshots waiting to be streamed to one client.
#[derive(Debug)]
pub struct ChunkStreamingQueue {
    ready: IndexMap<ChunkPos, RegionSnapshot>,
    invalidated: BTreeSet<ChunkPos>,
    relevant: HashSet<ChunkPos>,
    counter: f64,
}

impl Default for ChunkStreamingQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkStreamingQueue {
    pub fn new() -> Self {
        Self {
            ready: IndexMap::new(),
            invalidated: BTreeSet::new(),
            relevant: HashSet::new(),
            counter: 1.0,
        }
    }

    pub fn on_chunk_ready(&mut self, snapshot: RegionSnapshot) {
        self.invalidated.remove(&snapshot.pos);
        self.ready.insert(snapshot.pos, snapshot);
    }

    pub fn on_chunk_invalidated(&mut self, pos: ChunkPos) {
        self.ready.shift_remove(&pos);
        if self.relevant.remove(&pos) {
            self.invalidated.insert(pos);
        }
    }

    /// Whether the client holds this region, so point changes in it are sent.
    pub fn is_relevant(&self, pos: &ChunkPos) -> bool {
        self.relevant.contains(pos)
    }

    pub fn pending(&self) -> usize {
        self.ready.len()
    }

    fn take_invalidated(&mut self) -> Vec<ChunkPos> {
        std::mem::take(&mut self.invalidated).into_iter().collect()
    }

    /// Advances the throttle by one tick and returns at most one region,
    /// nearest to `center` first.
    pub fn next_chunk(&mut self, center: Option<ChunkPos>, increment: f64) -> Option<RegionSnapshot> {
        if self.ready.is_empty() {
            self.counter = 1.0;
            return None;
        }

        self.counter += increment;
        if self.counter <= 1.0 {
            return None;
        }

        let index = match center {
            Some(center) => self
                .ready
                .keys()
                .enumerate()
                .min_by_key(|(_, pos)| pos.distance_squared(&center))
                .map(|(index, _)| index)?,
            None => 0,
        };
        let (pos, snapshot) = self.ready.shift_remove_index(index)?;
        self.counter -= 1.0;
        self.relevant.insert(pos);
        Some(snapshot)
    }
}

/// Per-tick inputs shared by every session.
#[derive(Debug, Clone, Copy)]
pub struct TickContext {
    pub time: u64,
    pub tick_seconds: f64,
    pub bandwidth_per_client: f64,
}

/// A component the client changed on an entity it owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedChange {
    pub entity: EntityRef,
    pub component: String,
}

pub struct ClientSession {
    core: SessionCore,
    replication: ReplicationState,
    chunks: ChunkStreamingQueue,
    families: FamilyQueue,
    queued: Vec<Payload>,
    outbound: mpsc::UnboundedSender<Outbound>,
    inbound: mpsc::UnboundedReceiver<NetMessage>,
    metrics: Arc<NetMetrics>,
    connected: bool,
}

impl ClientSession {
    pub fn new(
        core: SessionCore,
        outbound: mpsc::UnboundedSender<Outbound>,
        inbound: mpsc::UnboundedReceiver<NetMessage>,
        metrics: Arc<NetMetrics>,
    ) -> Self {
        Self {
            core,
            replication: ReplicationState::default(),
            chunks: ChunkStreamingQueue::new(),
            families: Arc::new(Mutex::new(BlockFamilyRegistration::default())),
            queued: Vec::new(),
            outbound,
            inbound,
            metrics,
            connected: true,
        }
    }

    pub fn core(&self) -> &SessionCore {
        &self.core
    }

    pub(crate) fn core_mut(&mut self) -> &mut SessionCore {
        &mut self.core
    }

    pub fn replication(&self) -> &ReplicationState {
        &self.replication
    }

    pub fn chunks(&self) -> &ChunkStreamingQueue {
        &self.chunks
    }

    pub fn family_queue(&self) -> FamilyQueue {
        Arc::clone(&self.families)
    }

    pub fn metrics(&self) -> Arc<NetMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn send(&mut self, message: NetMessage) {
        if !self.connected {
            return;
        }
        if self.outbound.send(Outbound::Message(message)).is_err() {
            debug!("Outbound queue for {} is closed", self.core.name);
            self.connected = false;
        }
    }

    /// Sends an optional reason and closes the connection.
    pub fn close(&mut self, reason: Option<&str>) {
        if let Some(reason) = reason {
            self.send(NetMessage::new(Payload::Disconnect {
                reason: reason.to_string(),
            }));
        }
        let _ = self.outbound.send(Outbound::Close);
        self.connected = false;
    }

    pub fn set_net_initial(&mut self, id: NetworkEntityId) {
        self.replication.set_net_initial(id);
    }

    pub fn set_net_removed(&mut self, id: NetworkEntityId) {
        self.replication.set_net_removed(id);
    }

    pub fn set_component_added(&mut self, id: NetworkEntityId, component: &str) {
        self.replication.set_component_added(id, component);
    }

    pub fn set_component_removed(&mut self, id: NetworkEntityId, component: &str) {
        self.replication.set_component_removed(id, component);
    }

    pub fn set_component_dirty(&mut self, id: NetworkEntityId, component: &str) {
        self.replication.set_component_dirty(id, component);
    }

    pub fn on_chunk_ready(&mut self, snapshot: RegionSnapshot) {
        self.chunks.on_chunk_ready(snapshot);
    }

    pub fn on_chunk_invalidated(&mut self, pos: ChunkPos) {
        self.chunks.on_chunk_invalidated(pos);
    }

    pub fn on_block_changed(&mut self, pos: BlockPos, block: u16) {
        if self.chunks.is_relevant(&pos.chunk()) {
            self.queued.push(Payload::BlockChange { pos, block });
        }
    }

    pub fn on_extra_data_changed(&mut self, index: u32, pos: BlockPos, value: i32) {
        if self.chunks.is_relevant(&pos.chunk()) {
            self.queued.push(Payload::ExtraDataChange { index, pos, value });
        }
    }

    /// Queues an event for an entity this client knows about.
    pub fn send_event(&mut self, view: &ReplicationView<'_>, target: EntityRef, event: &EventData) {
        let Some(net_id) = view.net_id(target) else {
            return;
        };
        if !self.replication.relevant.contains(&net_id) && !self.replication.initial.contains(&net_id) {
            return;
        }
        match EntitySerializer::new(view.tables).serialize_event(event) {
            Ok(event) => self.queued.push(Payload::Event {
                target_id: net_id,
                event,
            }),
            Err(e) => error!("Failed to serialize event {}: {}", event.type_name, e),
        }
    }

    pub fn send_block_event(&mut self, view: &ReplicationView<'_>, pos: BlockPos, event: &EventData) {
        if !self.chunks.is_relevant(&pos.chunk()) {
            return;
        }
        match EntitySerializer::new(view.tables).serialize_event(event) {
            Ok(event) => self.queued.push(Payload::BlockEvent { target: pos, event }),
            Err(e) => error!("Failed to serialize event {}: {}", event.type_name, e),
        }
    }

    /// Runs one network tick: flushes everything pending in a fixed order, then
    /// applies what the client sent. Returns the changes to fan out to others.
    pub fn update(
        &mut self,
        view: &ReplicationView<'_>,
        store: &mut dyn EntityStore,
        tick: &TickContext,
    ) -> Vec<AppliedChange> {
        if !self.connected {
            return Vec::new();
        }

        self.send(NetMessage::with_time(Payload::HeartBeat { time: tick.time }, tick.time));
        self.send_registered_families();
        self.send_invalidations();
        self.send_chunk(&*store, tick);
        self.send_removed_entities();
        self.send_initial_entities(view, &*store);
        self.send_dirty_entities(view, &*store);
        self.send_queued();

        self.process_incoming(view, store)
    }

    fn send_registered_families(&mut self) {
        let registration = {
            let mut families = self
                .families
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::take(&mut *families)
        };
        if !registration.is_empty() {
            self.send(NetMessage::new(Payload::BlockFamilyRegistered(registration)));
        }
    }

    fn send_invalidations(&mut self) {
        for pos in self.chunks.take_invalidated() {
            self.send(NetMessage::new(Payload::InvalidateChunk { pos }));
        }
    }

    fn send_chunk(&mut self, store: &dyn EntityStore, tick: &TickContext) {
        let center = self
            .core
            .entity
            .and_then(|entity| store.client_position(entity))
            .map(ChunkPos::containing);
        let increment = CHUNK_SEND_RATE * tick.tick_seconds * tick.bandwidth_per_client;

        if let Some(snapshot) = self.chunks.next_chunk(center, increment) {
            debug!("Sending chunk {:?} to {}", snapshot.pos, self.core.name);
            self.send(NetMessage::new(Payload::ChunkData(snapshot)));
        }
    }

    fn send_removed_entities(&mut self) {
        let net_ids = self.replication.take_removed();
        if !net_ids.is_empty() {
            self.send(NetMessage::new(Payload::RemoveEntity { net_ids }));
        }
    }

    fn send_initial_entities(&mut self, view: &ReplicationView<'_>, store: &dyn EntityStore) {
        let serializer = EntitySerializer::new(view.tables);
        for net_id in self.replication.take_initial() {
            let Some(entity) = view.entity(net_id) else {
                warn!("Initial entity {} is no longer registered", net_id);
                continue;
            };
            let check = FieldCheck::ServerToClient {
                is_owner: view.owner_client(entity) == Some(self.core.id),
                initial: true,
            };
            match serializer.serialize(&store.components(entity), check) {
                Ok(packed) => self.send(NetMessage::new(Payload::CreateEntity {
                    net_id,
                    entity: packed,
                })),
                Err(e) => error!("Failed to serialize entity {}: {}", net_id, e),
            }
        }
    }

    fn send_dirty_entities(&mut self, view: &ReplicationView<'_>, store: &dyn EntityStore) {
        let serializer = EntitySerializer::new(view.tables);
        for dirty in self.replication.take_dirty() {
            let Some(entity) = view.entity(dirty.id) else {
                continue;
            };
            let check = FieldCheck::ServerToClient {
                is_owner: view.owner_client(entity) == Some(self.core.id),
                initial: false,
            };
            let delta = serializer.serialize_delta(
                &store.components(entity),
                &dirty.added,
                &dirty.changed,
                &dirty.removed,
                check,
            );
            match delta {
                Ok(Some(packed)) => self.send(NetMessage::new(Payload::UpdateEntity {
                    net_id: dirty.id,
                    entity: packed,
                })),
                Ok(None) => {}
                Err(e) => error!("Failed to serialize update for entity {}: {}", dirty.id, e),
            }
        }
    }

    fn send_queued(&mut self) {
        for payload in std::mem::take(&mut self.queued) {
            self.send(NetMessage::new(payload));
        }
    }

    fn process_incoming(&mut self, view: &ReplicationView<'_>, store: &mut dyn EntityStore) -> Vec<AppliedChange> {
        let mut changes = Vec::new();
        loop {
            let message = match self.inbound.try_recv() {
                Ok(message) => message,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.connected = false;
                    break;
                }
            };

            let result = match message.payload {
                Payload::UpdateEntity { net_id, entity } => self
                    .apply_entity_update(net_id, &entity, view, store)
                    .map(|applied| changes.extend(applied)),
                Payload::Event { target_id, event } => {
                    let target = view.entity(target_id);
                    self.deliver_event(target_id, target, &event, view, store)
                }
                Payload::BlockEvent { target, event } => {
                    let entity = store.block_entity_at(target);
                    let net_id = entity.and_then(|e| view.net_id(e)).unwrap_or(NULL_NET_ID);
                    self.deliver_event(net_id, entity, &event, view, store)
                }
                Payload::HeartBeat { .. } => Ok(()),
                other => {
                    warn!("Unexpected {} from {}", other.name(), self.core.name);
                    Ok(())
                }
            };

            match result {
                Ok(()) => {}
                Err(e) if e.is_fatal() => {
                    error!("Closing connection to {}: {}", self.core.name, e);
                    self.close(Some(&e.to_string()));
                    break;
                }
                Err(e) => warn!("Dropped message from {}: {}", self.core.name, e),
            }
        }
        changes
    }

    fn apply_entity_update(
        &self,
        net_id: NetworkEntityId,
        packed: &PackedEntity,
        view: &ReplicationView<'_>,
        store: &mut dyn EntityStore,
    ) -> Result<Vec<AppliedChange>, ProtocolError> {
        let entity = view
            .entity(net_id)
            .ok_or(SerializationError::MissingEntity(net_id as u64))?;
        if view.owner_client(entity) != Some(self.core.id) {
            return Err(ProtocolError::StaleOwnership { net_id });
        }

        let update = EntitySerializer::new(view.tables).deserialize(packed, FieldCheck::ClientToServer)?;
        Ok(store
            .apply_update(entity, &update)
            .into_iter()
            .map(|component| AppliedChange { entity, component })
            .collect())
    }

    fn deliver_event(
        &self,
        net_id: NetworkEntityId,
        target: Option<EntityRef>,
        packed: &PackedEvent,
        view: &ReplicationView<'_>,
        store: &mut dyn EntityStore,
    ) -> Result<(), ProtocolError> {
        let event = EntitySerializer::new(view.tables).deserialize_event(packed)?;
        if !store.is_server_event(&event.type_name) {
            warn!("{} sent non-server event {}", self.core.name, event.type_name);
            return Ok(());
        }
        let target = target
            .filter(|t| store.exists(*t))
            .ok_or(SerializationError::MissingEntity(net_id as u64))?;
        if view.owner_client(target) != Some(self.core.id) {
            return Err(ProtocolError::StaleOwnership { net_id });
        }

        store.deliver_event(target, event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(x: i32) -> RegionSnapshot {
        RegionSnapshot {
            pos: ChunkPos::new(x, 0, 0),
            data: vec![x as u8],
        }
    }

    fn relevant_state(ids: &[NetworkEntityId]) -> ReplicationState {
        let mut state = ReplicationState::default();
        for id in ids {
            state.set_net_initial(*id);
        }
        state.take_initial();
        state
    }

    #[test]
    fn test_initial_is_taken_in_ascending_order() {
        let mut state = ReplicationState::default();
        for id in [9, 2, 5] {
            state.set_net_initial(id);
        }

        assert_eq!(state.take_initial(), vec![2, 5, 9]);
        assert!(state.initial().is_empty());
        assert_eq!(state.relevant().len(), 3);
    }

    #[test]
    fn test_removing_unsent_entity_drops_it() {
        let mut state = ReplicationState::default();
        state.set_net_initial(4);
        state.set_net_removed(4);

        assert!(state.initial().is_empty());
        assert!(state.removed().is_empty());
    }

    #[test]
    fn test_removing_unknown_entity_sends_nothing() {
        let mut state = ReplicationState::default();
        state.set_net_removed(4);
        assert!(state.removed().is_empty());
    }

    #[test]
    fn test_removing_known_entity_clears_dirty() {
        let mut state = relevant_state(&[4]);
        state.set_component_dirty(4, "Health");
        state.set_net_removed(4);

        assert!(state.dirty().is_empty());
        assert_eq!(state.removed().iter().copied().collect::<Vec<_>>(), vec![4]);
        assert!(!state.relevant().contains(&4));
    }

    #[test]
    fn test_add_after_remove_becomes_change() {
        let mut state = relevant_state(&[1]);
        state.set_component_removed(1, "Health");
        state.set_component_added(1, "Health");

        let dirty = state.take_dirty();
        assert_eq!(dirty.len(), 1);
        assert!(dirty[0].added.is_empty());
        assert!(dirty[0].removed.is_empty());
        assert!(dirty[0].changed.contains("Health"));
    }

    #[test]
    fn test_remove_after_add_cancels() {
        let mut state = relevant_state(&[1]);
        state.set_component_added(1, "Health");
        state.set_component_removed(1, "Health");

        assert!(state.dirty().is_empty());
        assert!(state.take_dirty().is_empty());
    }

    #[test]
    fn test_changes_to_unsent_entities_are_ignored() {
        let mut state = ReplicationState::default();
        state.set_net_initial(3);
        state.set_component_dirty(3, "Health");
        state.set_component_added(3, "Name");

        assert!(state.dirty().is_empty());
        assert_eq!(state.initial().len(), 1);
    }

    #[test]
    fn test_change_on_pending_add_is_absorbed() {
        let mut state = relevant_state(&[1]);
        state.set_component_added(1, "Health");
        state.set_component_dirty(1, "Health");

        let dirty = state.take_dirty();
        assert!(dirty[0].added.contains("Health"));
        assert!(dirty[0].changed.is_empty());
    }

    #[test]
    fn test_reinitialising_cancels_pending_removal() {
        let mut state = relevant_state(&[6]);
        state.set_net_removed(6);
        state.set_net_initial(6);

        assert!(state.removed().is_empty());
        assert!(state.initial().contains(&6));
    }

    #[test]
    fn test_removal_after_cancelled_removal_is_sent() {
        let mut state = relevant_state(&[6]);
        state.set_net_removed(6);
        state.set_net_initial(6);
        state.set_net_removed(6);

        assert!(state.initial().is_empty());
        assert_eq!(state.take_removed(), vec![6]);
        assert!(!state.relevant().contains(&6));
    }

    #[test]
    fn test_unsent_entity_removal_is_dropped() {
        let mut state = ReplicationState::default();
        state.set_net_initial(2);
        state.set_net_removed(2);

        assert!(state.initial().is_empty());
        assert!(state.removed().is_empty());
    }

    #[test]
    fn test_chunk_queue_sends_nearest_first() {
        let mut queue = ChunkStreamingQueue::new();
        for x in [5, -1, 3] {
            queue.on_chunk_ready(snapshot(x));
        }

        let first = queue.next_chunk(Some(ChunkPos::new(0, 0, 0)), 10.0).unwrap();
        assert_eq!(first.pos, ChunkPos::new(-1, 0, 0));
        assert!(queue.is_relevant(&ChunkPos::new(-1, 0, 0)));
        assert_eq!(queue.pending(), 2);
    }

    #[test]
    fn test_chunk_queue_sends_at_most_one_per_tick() {
        let mut queue = ChunkStreamingQueue::new();
        for x in 0..4 {
            queue.on_chunk_ready(snapshot(x));
        }

        assert!(queue.next_chunk(None, 100.0).is_some());
        assert_eq!(queue.pending(), 3);
    }

    #[test]
    fn test_chunk_queue_waits_for_budget() {
        let mut queue = ChunkStreamingQueue::new();
        queue.on_chunk_ready(snapshot(0));
        queue.on_chunk_ready(snapshot(1));

        // The counter starts full, so the first region goes out immediately.
        assert!(queue.next_chunk(None, 0.4).is_some());
        assert!(queue.next_chunk(None, 0.4).is_none());
        assert!(queue.next_chunk(None, 0.4).is_some());
    }

    #[test]
    fn test_invalidation_only_reported_for_sent_chunks() {
        let mut queue = ChunkStreamingQueue::new();
        queue.on_chunk_ready(snapshot(0));
        queue.on_chunk_ready(snapshot(1));
        queue.next_chunk(Some(ChunkPos::new(0, 0, 0)), 1.0);

        queue.on_chunk_invalidated(ChunkPos::new(0, 0, 0));
        queue.on_chunk_invalidated(ChunkPos::new(1, 0, 0));

        assert_eq!(queue.take_invalidated(), vec![ChunkPos::new(0, 0, 0)]);
        assert_eq!(queue.pending(), 0);
        assert!(!queue.is_relevant(&ChunkPos::new(0, 0, 0)));
    }
}
