//! The client's local copy of the world, as seen by the replication layer.
//!
//! The game engine implements [`ClientWorld`]; [`MemoryClientWorld`] keeps
//! everything in maps and backs the binary and the tests.

use log::{debug, warn};
use shared::entity::{ComponentData, EntityUpdate, EventData};
use shared::world::{BlockPos, ChunkPos, RegionSnapshot};
use shared::NetworkEntityId;
use std::collections::{BTreeMap, HashMap};

/// Where a received event is aimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventTarget {
    Entity(NetworkEntityId),
    Block(BlockPos),
}

pub trait ClientWorld {
    /// Server game time from the latest heartbeat.
    fn set_time(&mut self, time: u64);

    fn has_entity(&self, net_id: NetworkEntityId) -> bool;
    fn create_entity(&mut self, net_id: NetworkEntityId, update: EntityUpdate);
    fn update_entity(&mut self, net_id: NetworkEntityId, update: EntityUpdate);
    fn remove_entity(&mut self, net_id: NetworkEntityId);

    fn is_chunk_loaded(&self, pos: ChunkPos) -> bool;
    fn load_chunk(&mut self, snapshot: RegionSnapshot);
    fn unload_chunk(&mut self, pos: ChunkPos);
    fn set_block(&mut self, pos: BlockPos, block: u16);
    fn set_extra_data(&mut self, index: u32, pos: BlockPos, value: i32);

    fn register_block_family(&mut self, uri: &str, id: u16);
    fn deliver_event(&mut self, target: EventTarget, event: EventData);

    /// Components the local player changed on entities it controls, drained
    /// once per tick.
    fn take_local_changes(&mut self) -> Vec<(NetworkEntityId, Vec<ComponentData>)>;
}

#[derive(Debug, Default)]
pub struct MemoryClientWorld {
    time: u64,
    entities: BTreeMap<NetworkEntityId, Vec<ComponentData>>,
    chunks: BTreeMap<ChunkPos, RegionSnapshot>,
    blocks: HashMap<BlockPos, u16>,
    extra_data: HashMap<(u32, BlockPos), i32>,
    families: BTreeMap<String, u16>,
    events: Vec<(EventTarget, EventData)>,
    local_changes: BTreeMap<NetworkEntityId, Vec<ComponentData>>,
}

fn merge_components(target: &mut Vec<ComponentData>, update: EntityUpdate) {
    for component in update.components {
        match target.iter_mut().find(|c| c.type_name == component.type_name) {
            Some(existing) => existing.merge(&component),
            None => target.push(component),
        }
    }
    target.retain(|c| !update.removed.contains(&c.type_name));
}

impl MemoryClientWorld {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn time(&self) -> u64 {
        self.time
    }

    pub fn components(&self, net_id: NetworkEntityId) -> Option<&[ComponentData]> {
        self.entities.get(&net_id).map(Vec::as_slice)
    }

    pub fn entity_ids(&self) -> Vec<NetworkEntityId> {
        self.entities.keys().copied().collect()
    }

    pub fn block(&self, pos: BlockPos) -> Option<u16> {
        self.blocks.get(&pos).copied()
    }

    pub fn extra_data(&self, index: u32, pos: BlockPos) -> Option<i32> {
        self.extra_data.get(&(index, pos)).copied()
    }

    pub fn block_family(&self, uri: &str) -> Option<u16> {
        self.families.get(uri).copied()
    }

    pub fn take_events(&mut self) -> Vec<(EventTarget, EventData)> {
        std::mem::take(&mut self.events)
    }

    /// Changes a component locally and queues it for the server.
    pub fn set_local_component(&mut self, net_id: NetworkEntityId, component: ComponentData) {
        let Some(components) = self.entities.get_mut(&net_id) else {
            warn!("Local change for unknown entity {}", net_id);
            return;
        };
        match components.iter_mut().find(|c| c.type_name == component.type_name) {
            Some(existing) => existing.merge(&component),
            None => components.push(component.clone()),
        }
        self.local_changes.entry(net_id).or_default().push(component);
    }
}

impl ClientWorld for MemoryClientWorld {
    fn set_time(&mut self, time: u64) {
        self.time = time;
    }

    fn has_entity(&self, net_id: NetworkEntityId) -> bool {
        self.entities.contains_key(&net_id)
    }

    fn create_entity(&mut self, net_id: NetworkEntityId, update: EntityUpdate) {
        let mut components = Vec::new();
        merge_components(&mut components, update);
        if self.entities.insert(net_id, components).is_some() {
            debug!("Entity {} was recreated", net_id);
        }
    }

    fn update_entity(&mut self, net_id: NetworkEntityId, update: EntityUpdate) {
        match self.entities.get_mut(&net_id) {
            Some(components) => merge_components(components, update),
            None => warn!("Update for unknown entity {}", net_id),
        }
    }

    fn remove_entity(&mut self, net_id: NetworkEntityId) {
        self.entities.remove(&net_id);
        self.local_changes.remove(&net_id);
    }

    fn is_chunk_loaded(&self, pos: ChunkPos) -> bool {
        self.chunks.contains_key(&pos)
    }

    fn load_chunk(&mut self, snapshot: RegionSnapshot) {
        self.chunks.insert(snapshot.pos, snapshot);
    }

    fn unload_chunk(&mut self, pos: ChunkPos) {
        self.chunks.remove(&pos);
        self.blocks.retain(|block, _| block.chunk() != pos);
        self.extra_data.retain(|(_, block), _| block.chunk() != pos);
    }

    fn set_block(&mut self, pos: BlockPos, block: u16) {
        self.blocks.insert(pos, block);
    }

    fn set_extra_data(&mut self, index: u32, pos: BlockPos, value: i32) {
        self.extra_data.insert((index, pos), value);
    }

    fn register_block_family(&mut self, uri: &str, id: u16) {
        self.families.insert(uri.to_string(), id);
    }

    fn deliver_event(&mut self, target: EventTarget, event: EventData) {
        self.events.push((target, event));
    }

    fn take_local_changes(&mut self) -> Vec<(NetworkEntityId, Vec<ComponentData>)> {
        std::mem::take(&mut self.local_changes).into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_merges_fields_and_drops_removed() {
        let mut world = MemoryClientWorld::new();
        world.create_entity(
            3,
            EntityUpdate {
                components: vec![
                    ComponentData::new("Health").with_field("current", vec![10]).with_field("max", vec![10]),
                    ComponentData::new("Name").with_field("text", b"ann".to_vec()),
                ],
                removed: Vec::new(),
            },
        );

        world.update_entity(
            3,
            EntityUpdate {
                components: vec![ComponentData::new("Health").with_field("current", vec![4])],
                removed: vec!["Name".into()],
            },
        );

        let components = world.components(3).unwrap();
        assert_eq!(components.len(), 1);
        assert_eq!(components[0].field("current"), Some(&[4u8][..]));
        assert_eq!(components[0].field("max"), Some(&[10u8][..]));
    }

    #[test]
    fn test_local_changes_are_drained() {
        let mut world = MemoryClientWorld::new();
        world.create_entity(1, EntityUpdate::default());
        world.set_local_component(1, ComponentData::new("Location").with_field("position", vec![1]));
        world.set_local_component(9, ComponentData::new("Location"));

        let changes = world.take_local_changes();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].0, 1);
        assert!(world.take_local_changes().is_empty());
    }

    #[test]
    fn test_unloading_chunk_forgets_its_blocks() {
        let mut world = MemoryClientWorld::new();
        let pos = BlockPos::new(1, 2, 3);
        world.load_chunk(RegionSnapshot {
            pos: pos.chunk(),
            data: Vec::new(),
        });
        world.set_block(pos, 5);

        world.unload_chunk(pos.chunk());
        assert!(!world.is_chunk_loaded(pos.chunk()));
        assert_eq!(world.block(pos), None);
    }
}
