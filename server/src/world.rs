//! The simulation state the replication layer reads from and writes into.
//!
//! The real engine owns entity storage; the directory only talks to it through
//! [`EntityStore`]. [`MemoryEntityStore`] is a small in-process store used by
//! the binary and the tests.

use log::{debug, warn};
use shared::entity::{ComponentData, EntityUpdate, EventData, ReplicateMode};
use shared::world::BlockPos;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Local handle of a simulation entity.
pub type EntityRef = u64;

pub const CLIENT_COMPONENT: &str = "Client";

pub trait EntityStore {
    fn exists(&self, entity: EntityRef) -> bool;

    /// `None` for entities that are not network-replicated at all.
    fn replicate_mode(&self, entity: EntityRef) -> Option<ReplicateMode>;

    fn owner(&self, entity: EntityRef) -> Option<EntityRef>;

    fn components(&self, entity: EntityRef) -> Vec<ComponentData>;

    /// Merges received component state; returns the component types touched.
    fn apply_update(&mut self, entity: EntityRef, update: &EntityUpdate) -> Vec<String>;

    /// World position of the character a client entity controls.
    fn client_position(&self, client_entity: EntityRef) -> Option<[f32; 3]>;

    fn create_client_entity(&mut self, peer_id: &str, name: &str, color: u32) -> EntityRef;

    fn destroy_entity(&mut self, entity: EntityRef);

    fn deliver_event(&mut self, target: EntityRef, event: EventData);

    fn block_entity_at(&self, pos: BlockPos) -> Option<EntityRef>;

    /// Whether clients may send this event type to the server.
    fn is_server_event(&self, type_name: &str) -> bool;
}

#[derive(Debug, Clone, Default)]
pub struct StoredEntity {
    pub mode: Option<ReplicateMode>,
    pub owner: Option<EntityRef>,
    pub components: Vec<ComponentData>,
    pub position: Option<[f32; 3]>,
    pub events: Vec<EventData>,
}

#[derive(Debug, Default)]
pub struct MemoryEntityStore {
    next_entity: EntityRef,
    entities: BTreeMap<EntityRef, StoredEntity>,
    block_entities: HashMap<BlockPos, EntityRef>,
    server_events: BTreeSet<String>,
}

impl MemoryEntityStore {
    pub fn new() -> Self {
        Self {
            next_entity: 1,
            ..Self::default()
        }
    }

    pub fn with_server_events<I, S>(mut self, events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.server_events = events.into_iter().map(Into::into).collect();
        self
    }

    pub fn spawn(&mut self, mode: Option<ReplicateMode>, owner: Option<EntityRef>) -> EntityRef {
        let entity = self.next_entity;
        self.next_entity += 1;
        self.entities.insert(
            entity,
            StoredEntity {
                mode,
                owner,
                ..StoredEntity::default()
            },
        );
        entity
    }

    pub fn get(&self, entity: EntityRef) -> Option<&StoredEntity> {
        self.entities.get(&entity)
    }

    pub fn set_owner(&mut self, entity: EntityRef, owner: Option<EntityRef>) {
        if let Some(stored) = self.entities.get_mut(&entity) {
            stored.owner = owner;
        }
    }

    pub fn set_position(&mut self, entity: EntityRef, position: [f32; 3]) {
        if let Some(stored) = self.entities.get_mut(&entity) {
            stored.position = Some(position);
        }
    }

    /// Adds or replaces a whole component.
    pub fn put_component(&mut self, entity: EntityRef, component: ComponentData) {
        if let Some(stored) = self.entities.get_mut(&entity) {
            stored.components.retain(|c| c.type_name != component.type_name);
            stored.components.push(component);
        }
    }

    pub fn remove_component(&mut self, entity: EntityRef, type_name: &str) -> bool {
        match self.entities.get_mut(&entity) {
            Some(stored) => {
                let before = stored.components.len();
                stored.components.retain(|c| c.type_name != type_name);
                stored.components.len() != before
            }
            None => false,
        }
    }

    pub fn place_block_entity(&mut self, pos: BlockPos, entity: EntityRef) {
        self.block_entities.insert(pos, entity);
    }

    pub fn take_events(&mut self, entity: EntityRef) -> Vec<EventData> {
        self.entities
            .get_mut(&entity)
            .map(|stored| std::mem::take(&mut stored.events))
            .unwrap_or_default()
    }
}

impl EntityStore for MemoryEntityStore {
    fn exists(&self, entity: EntityRef) -> bool {
        self.entities.contains_key(&entity)
    }

    fn replicate_mode(&self, entity: EntityRef) -> Option<ReplicateMode> {
        self.entities.get(&entity).and_then(|e| e.mode)
    }

    fn owner(&self, entity: EntityRef) -> Option<EntityRef> {
        self.entities.get(&entity).and_then(|e| e.owner)
    }

    fn components(&self, entity: EntityRef) -> Vec<ComponentData> {
        self.entities
            .get(&entity)
            .map(|e| e.components.clone())
            .unwrap_or_default()
    }

    fn apply_update(&mut self, entity: EntityRef, update: &EntityUpdate) -> Vec<String> {
        let Some(stored) = self.entities.get_mut(&entity) else {
            warn!("Update for missing entity {}", entity);
            return Vec::new();
        };

        let mut touched = Vec::new();
        for component in &update.components {
            if component.fields.is_empty() {
                continue;
            }
            match stored
                .components
                .iter_mut()
                .find(|c| c.type_name == component.type_name)
            {
                Some(existing) => existing.merge(component),
                None => stored.components.push(component.clone()),
            }
            touched.push(component.type_name.clone());
        }
        for type_name in &update.removed {
            stored.components.retain(|c| &c.type_name != type_name);
            touched.push(type_name.clone());
        }
        touched
    }

    fn client_position(&self, client_entity: EntityRef) -> Option<[f32; 3]> {
        if let Some(position) = self.entities.get(&client_entity).and_then(|e| e.position) {
            return Some(position);
        }
        // Fall back to the first positioned entity the client owns directly.
        self.entities
            .values()
            .filter(|e| e.owner == Some(client_entity))
            .find_map(|e| e.position)
    }

    fn create_client_entity(&mut self, peer_id: &str, name: &str, color: u32) -> EntityRef {
        let entity = self.spawn(Some(ReplicateMode::Owner), None);
        self.put_component(
            entity,
            ComponentData::new(CLIENT_COMPONENT)
                .with_field("peer_id", peer_id.as_bytes().to_vec())
                .with_field("name", name.as_bytes().to_vec())
                .with_field("color", color.to_be_bytes().to_vec()),
        );
        debug!("Created client entity {} for {}", entity, name);
        entity
    }

    fn destroy_entity(&mut self, entity: EntityRef) {
        self.entities.remove(&entity);
        self.block_entities.retain(|_, e| *e != entity);
    }

    fn deliver_event(&mut self, target: EntityRef, event: EventData) {
        match self.entities.get_mut(&target) {
            Some(stored) => stored.events.push(event),
            None => warn!("Event {} for missing entity {}", event.type_name, target),
        }
    }

    fn block_entity_at(&self, pos: BlockPos) -> Option<EntityRef> {
        self.block_entities.get(&pos).copied()
    }

    fn is_server_event(&self, type_name: &str) -> bool {
        self.server_events.contains(type_name)
    }
}

/// Per-player saved state, keyed by peer id.
pub trait PlayerStore {
    fn activate(&mut self, peer_id: &str, client_entity: EntityRef);
    fn deactivate(&mut self, peer_id: &str, client_entity: EntityRef);
}

#[derive(Debug, Default)]
pub struct MemoryPlayerStore {
    active: BTreeMap<String, EntityRef>,
    known: BTreeSet<String>,
}

impl MemoryPlayerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self, peer_id: &str) -> bool {
        self.active.contains_key(peer_id)
    }

    pub fn has_played(&self, peer_id: &str) -> bool {
        self.known.contains(peer_id)
    }
}

impl PlayerStore for MemoryPlayerStore {
    fn activate(&mut self, peer_id: &str, client_entity: EntityRef) {
        self.known.insert(peer_id.to_string());
        self.active.insert(peer_id.to_string(), client_entity);
    }

    fn deactivate(&mut self, peer_id: &str, _client_entity: EntityRef) {
        self.active.remove(peer_id);
    }
}
