//! The server's replication directory.
//!
//! Assigns network ids to simulation entities, tracks who owns what, and fans
//! structural changes out to every session. All mutation happens on the tick
//! task; network tasks only hand over joins and hang-ups through
//! [`ReplicationDirectory::queue_client`] and
//! [`ReplicationDirectory::queue_disconnect`].

use crate::client_session::{ClientSession, TickContext};
use crate::context::{ServerContext, SlotReservation};
use crate::session::{unique_name, ClientId, LocalSession, Session, SessionCore};
use crate::world::{EntityRef, EntityStore, PlayerStore};
use log::{debug, info, warn};
use shared::entity::{EventData, NetworkEntityId, ReplicateMode};
use shared::metrics::NetMetrics;
use shared::protocol::{JoinRequest, Payload};
use shared::serialization::SerializationTables;
use shared::transport::Outbound;
use shared::world::{BlockPos, ChunkPos, RegionSnapshot};
use shared::NetMessage;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Maximum number of owner hops followed when resolving an owning client.
pub const OWNER_DEPTH_LIMIT: usize = 50;

/// Id used for the listen-server host. Remote connections start at 1.
pub const LOCAL_CLIENT_ID: ClientId = 0;

/// Bidirectional map between network ids and entities.
#[derive(Debug)]
pub struct EntityIndex {
    next_net_id: NetworkEntityId,
    by_net_id: HashMap<NetworkEntityId, EntityRef>,
    by_entity: HashMap<EntityRef, NetworkEntityId>,
}

impl Default for EntityIndex {
    fn default() -> Self {
        Self {
            next_net_id: 1,
            by_net_id: HashMap::new(),
            by_entity: HashMap::new(),
        }
    }
}

impl EntityIndex {
    fn allocate(&mut self, entity: EntityRef) -> NetworkEntityId {
        let id = self.next_net_id;
        self.next_net_id += 1;
        self.by_net_id.insert(id, entity);
        self.by_entity.insert(entity, id);
        id
    }

    fn remove(&mut self, entity: EntityRef) -> Option<NetworkEntityId> {
        let id = self.by_entity.remove(&entity)?;
        self.by_net_id.remove(&id);
        Some(id)
    }

    pub fn net_id(&self, entity: EntityRef) -> Option<NetworkEntityId> {
        self.by_entity.get(&entity).copied()
    }

    pub fn entity(&self, net_id: NetworkEntityId) -> Option<EntityRef> {
        self.by_net_id.get(&net_id).copied()
    }

    pub fn len(&self) -> usize {
        self.by_net_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_net_id.is_empty()
    }

    fn registered(&self) -> Vec<(NetworkEntityId, EntityRef)> {
        let mut all: Vec<_> = self.by_net_id.iter().map(|(id, e)| (*id, *e)).collect();
        all.sort_unstable();
        all
    }
}

/// The owner forest, stored as two maps instead of back-pointers.
#[derive(Debug, Default)]
pub struct OwnershipIndex {
    parent: HashMap<EntityRef, EntityRef>,
    children: HashMap<EntityRef, BTreeSet<EntityRef>>,
}

impl OwnershipIndex {
    pub fn owner(&self, entity: EntityRef) -> Option<EntityRef> {
        self.parent.get(&entity).copied()
    }

    pub fn owned(&self, entity: EntityRef) -> Vec<EntityRef> {
        self.children
            .get(&entity)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    fn detach(&mut self, entity: EntityRef) {
        if let Some(old) = self.parent.remove(&entity) {
            if let Some(siblings) = self.children.get_mut(&old) {
                siblings.remove(&entity);
                if siblings.is_empty() {
                    self.children.remove(&old);
                }
            }
        }
    }

    fn set_owner(&mut self, entity: EntityRef, owner: Option<EntityRef>) {
        self.detach(entity);
        if let Some(owner) = owner.filter(|o| *o != entity) {
            self.parent.insert(entity, owner);
            self.children.entry(owner).or_default().insert(entity);
        }
    }

    fn remove(&mut self, entity: EntityRef) {
        self.detach(entity);
        if let Some(children) = self.children.remove(&entity) {
            for child in children {
                self.parent.remove(&child);
            }
        }
    }
}

fn resolve_owner(
    ownership: &OwnershipIndex,
    client_entities: &HashMap<EntityRef, ClientId>,
    entity: EntityRef,
) -> Option<ClientId> {
    let mut current = entity;
    for _ in 0..OWNER_DEPTH_LIMIT {
        if let Some(client) = client_entities.get(&current) {
            return Some(*client);
        }
        current = ownership.owner(current)?;
    }
    warn!(
        "Owner chain of entity {} is longer than {} hops",
        entity, OWNER_DEPTH_LIMIT
    );
    None
}

/// Read-only view of the directory handed to sessions during a tick.
pub struct ReplicationView<'a> {
    pub tables: &'a SerializationTables,
    entities: &'a EntityIndex,
    ownership: &'a OwnershipIndex,
    client_entities: &'a HashMap<EntityRef, ClientId>,
}

impl<'a> ReplicationView<'a> {
    pub fn entity(&self, net_id: NetworkEntityId) -> Option<EntityRef> {
        self.entities.entity(net_id)
    }

    pub fn net_id(&self, entity: EntityRef) -> Option<NetworkEntityId> {
        self.entities.net_id(entity)
    }

    pub fn owner_client(&self, entity: EntityRef) -> Option<ClientId> {
        resolve_owner(self.ownership, self.client_entities, entity)
    }
}

/// A connection that finished catalog sync and is waiting to be admitted.
pub struct PendingClient {
    pub id: ClientId,
    pub peer_id: String,
    pub request: JoinRequest,
    pub outbound: mpsc::UnboundedSender<Outbound>,
    pub inbound: mpsc::UnboundedReceiver<NetMessage>,
    pub metrics: Arc<NetMetrics>,
    /// Held until the client counts as online.
    pub slot: Option<SlotReservation>,
}

impl fmt::Debug for PendingClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingClient")
            .field("id", &self.id)
            .field("peer_id", &self.peer_id)
            .field("name", &self.request.name)
            .finish()
    }
}

/// The network-task side of a pending client's queues.
pub struct ConnectionLink {
    pub outbound: mpsc::UnboundedReceiver<Outbound>,
    pub inbound: mpsc::UnboundedSender<NetMessage>,
    pub metrics: Arc<NetMetrics>,
}

impl PendingClient {
    pub fn with_channels(id: ClientId, peer_id: impl Into<String>, request: JoinRequest) -> (Self, ConnectionLink) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let metrics = Arc::new(NetMetrics::new());
        (
            Self {
                id,
                peer_id: peer_id.into(),
                request,
                outbound: outbound_tx,
                inbound: inbound_rx,
                metrics: Arc::clone(&metrics),
                slot: None,
            },
            ConnectionLink {
                outbound: outbound_rx,
                inbound: inbound_tx,
                metrics,
            },
        )
    }
}

pub struct ReplicationDirectory {
    ctx: Arc<ServerContext>,
    entities: EntityIndex,
    ownership: OwnershipIndex,
    client_entities: HashMap<EntityRef, ClientId>,
    sessions: BTreeMap<ClientId, Session>,
    pending_connects: VecDeque<PendingClient>,
    pending_disconnects: VecDeque<ClientId>,
    kicked: HashSet<ClientId>,
}

impl ReplicationDirectory {
    pub fn new(ctx: Arc<ServerContext>) -> Self {
        Self {
            ctx,
            entities: EntityIndex::default(),
            ownership: OwnershipIndex::default(),
            client_entities: HashMap::new(),
            sessions: BTreeMap::new(),
            pending_connects: VecDeque::new(),
            pending_disconnects: VecDeque::new(),
            kicked: HashSet::new(),
        }
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    pub fn view(&self) -> ReplicationView<'_> {
        ReplicationView {
            tables: &self.ctx.tables,
            entities: &self.entities,
            ownership: &self.ownership,
            client_entities: &self.client_entities,
        }
    }

    pub fn net_id(&self, entity: EntityRef) -> Option<NetworkEntityId> {
        self.entities.net_id(entity)
    }

    pub fn entity(&self, net_id: NetworkEntityId) -> Option<EntityRef> {
        self.entities.entity(net_id)
    }

    pub fn registered_count(&self) -> usize {
        self.entities.len()
    }

    pub fn owner_client(&self, entity: EntityRef) -> Option<ClientId> {
        resolve_owner(&self.ownership, &self.client_entities, entity)
    }

    pub fn session(&self, id: ClientId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn remote(&self, id: ClientId) -> Option<&ClientSession> {
        self.sessions.get(&id).and_then(Session::as_remote)
    }

    fn remote_mut(&mut self, id: ClientId) -> Option<&mut ClientSession> {
        self.sessions.get_mut(&id).and_then(Session::as_remote_mut)
    }

    fn remotes_mut(&mut self) -> impl Iterator<Item = &mut ClientSession> {
        self.sessions.values_mut().filter_map(Session::as_remote_mut)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    /// Number of connected remote clients.
    pub fn client_count(&self) -> usize {
        self.sessions.values().filter(|s| !s.is_local()).count()
    }

    /// Upstream bandwidth divided evenly across remote clients, in KB/s.
    pub fn bandwidth_per_client(&self) -> f64 {
        self.ctx.config.upstream_bandwidth as f64 / self.client_count().max(1) as f64
    }

    fn update_online_count(&self) {
        self.ctx.set_online_players(self.sessions.len() as u32);
    }

    /// Assigns a network id and announces the entity to the clients allowed to
    /// see it. Registering twice returns the existing id.
    pub fn register_entity(&mut self, entity: EntityRef, store: &dyn EntityStore) -> NetworkEntityId {
        if let Some(id) = self.entities.net_id(entity) {
            return id;
        }

        let id = self.entities.allocate(entity);
        if let Some(owner) = store.owner(entity) {
            self.ownership.set_owner(entity, Some(owner));
        }

        match store.replicate_mode(entity).unwrap_or(ReplicateMode::Always) {
            ReplicateMode::Owner => {
                if let Some(client) = self.owner_client(entity) {
                    if let Some(session) = self.remote_mut(client) {
                        session.set_net_initial(id);
                    }
                }
            }
            ReplicateMode::Always => {
                for session in self.remotes_mut() {
                    session.set_net_initial(id);
                }
            }
        }

        debug!("Registered entity {} as {}", entity, id);
        id
    }

    pub fn unregister_entity(&mut self, entity: EntityRef) -> Option<NetworkEntityId> {
        let id = self.entities.remove(entity)?;
        self.ownership.remove(entity);
        for session in self.remotes_mut() {
            session.set_net_removed(id);
        }
        debug!("Unregistered entity {} ({})", entity, id);
        Some(id)
    }

    /// Changes an entity's owner and moves every owner-only entity in its
    /// owned subtree from the old owning client to the new one. Completes
    /// before returning so no flush can observe a half-moved subtree.
    pub fn update_ownership(&mut self, entity: EntityRef, new_owner: Option<EntityRef>, store: &dyn EntityStore) {
        let old_client = self.owner_client(entity);
        self.ownership.set_owner(entity, new_owner);
        let new_client = self.owner_client(entity);

        if old_client == new_client {
            return;
        }
        debug!(
            "Entity {} moved from client {:?} to {:?}",
            entity, old_client, new_client
        );
        let mut visited = HashSet::new();
        self.cascade_ownership(entity, old_client, new_client, store, 0, &mut visited);
    }

    fn cascade_ownership(
        &mut self,
        entity: EntityRef,
        old_client: Option<ClientId>,
        new_client: Option<ClientId>,
        store: &dyn EntityStore,
        depth: usize,
        visited: &mut HashSet<EntityRef>,
    ) {
        if depth >= OWNER_DEPTH_LIMIT || !visited.insert(entity) {
            return;
        }

        if let Some(id) = self.entities.net_id(entity) {
            match store.replicate_mode(entity) {
                Some(ReplicateMode::Owner) => {
                    if let Some(session) = old_client.and_then(|c| self.remote_mut(c)) {
                        session.set_net_removed(id);
                    }
                    if let Some(session) = new_client.and_then(|c| self.remote_mut(c)) {
                        session.set_net_initial(id);
                    }
                }
                _ => {
                    // The new owner may now see owner-only fields.
                    let tables = Arc::clone(&self.ctx.tables);
                    if let Some(session) = new_client.and_then(|c| self.remote_mut(c)) {
                        for component in store.components(entity) {
                            if tables.components.is_replicated(&component.type_name) {
                                session.set_component_dirty(id, &component.type_name);
                            }
                        }
                    }
                }
            }
        }

        for child in self.ownership.owned(entity) {
            // A client entity further down starts its own ownership scope.
            if self.client_entities.contains_key(&child) {
                continue;
            }
            self.cascade_ownership(child, old_client, new_client, store, depth + 1, visited);
        }
    }

    fn fan_out(&mut self, entity: EntityRef, component: &str, apply: impl Fn(&mut ClientSession, NetworkEntityId, &str)) {
        if !self.ctx.tables.components.is_replicated(component) {
            return;
        }
        let Some(id) = self.entities.net_id(entity) else {
            return;
        };
        for session in self.remotes_mut() {
            apply(session, id, component);
        }
    }

    pub fn on_component_added(&mut self, entity: EntityRef, component: &str) {
        self.fan_out(entity, component, ClientSession::set_component_added);
    }

    pub fn on_component_removed(&mut self, entity: EntityRef, component: &str) {
        self.fan_out(entity, component, ClientSession::set_component_removed);
    }

    pub fn on_component_changed(&mut self, entity: EntityRef, component: &str) {
        self.fan_out(entity, component, ClientSession::set_component_dirty);
    }

    pub fn on_chunk_ready(&mut self, client: ClientId, snapshot: RegionSnapshot) {
        if let Some(session) = self.remote_mut(client) {
            session.on_chunk_ready(snapshot);
        }
    }

    pub fn on_chunk_invalidated(&mut self, client: ClientId, pos: ChunkPos) {
        if let Some(session) = self.remote_mut(client) {
            session.on_chunk_invalidated(pos);
        }
    }

    pub fn on_block_changed(&mut self, pos: BlockPos, block: u16) {
        for session in self.remotes_mut() {
            session.on_block_changed(pos, block);
        }
    }

    pub fn on_extra_data_changed(&mut self, index: u32, pos: BlockPos, value: i32) {
        for session in self.remotes_mut() {
            session.on_extra_data_changed(index, pos, value);
        }
    }

    pub fn on_block_family_registered(&mut self, uri: &str, id: u16) {
        self.ctx.record_block_family(uri);
        for session in self.remotes_mut() {
            let queue = session.family_queue();
            let mut families = queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            families.push(uri, id);
        }
    }

    /// Sends an event to every client that knows the target entity.
    pub fn broadcast_event(&mut self, entity: EntityRef, event: &EventData) {
        let view = ReplicationView {
            tables: &self.ctx.tables,
            entities: &self.entities,
            ownership: &self.ownership,
            client_entities: &self.client_entities,
        };
        for session in self.sessions.values_mut().filter_map(Session::as_remote_mut) {
            session.send_event(&view, entity, event);
        }
    }

    /// Sends an event only to the client owning the target entity.
    pub fn send_owner_event(&mut self, entity: EntityRef, event: &EventData) {
        let Some(owner) = self.owner_client(entity) else {
            return;
        };
        let view = ReplicationView {
            tables: &self.ctx.tables,
            entities: &self.entities,
            ownership: &self.ownership,
            client_entities: &self.client_entities,
        };
        if let Some(session) = self.sessions.get_mut(&owner).and_then(Session::as_remote_mut) {
            session.send_event(&view, entity, event);
        }
    }

    pub fn broadcast_block_event(&mut self, pos: BlockPos, event: &EventData) {
        let tables = Arc::clone(&self.ctx.tables);
        let view = ReplicationView {
            tables: &tables,
            entities: &self.entities,
            ownership: &self.ownership,
            client_entities: &self.client_entities,
        };
        for session in self.sessions.values_mut().filter_map(Session::as_remote_mut) {
            session.send_block_event(&view, pos, event);
        }
    }

    /// Hands over a connection that finished catalog sync. It is admitted at
    /// the start of the next update.
    pub fn queue_client(&mut self, client: PendingClient) {
        self.pending_connects.push_back(client);
    }

    /// Reports that a connection went away.
    pub fn queue_disconnect(&mut self, id: ClientId) {
        self.pending_disconnects.push_back(id);
    }

    /// Adds the listen-server host as a local participant.
    pub fn add_local_player(
        &mut self,
        peer_id: &str,
        name: &str,
        color: u32,
        store: &mut dyn EntityStore,
        players: &mut dyn PlayerStore,
    ) -> Option<NetworkEntityId> {
        let name = unique_name(name, self.sessions.values().map(|s| s.core().name.as_str()));
        let core = SessionCore::new(LOCAL_CLIENT_ID, peer_id, name, color);
        self.sessions
            .insert(LOCAL_CLIENT_ID, Session::Local(LocalSession::new(core)));
        let net_id = self.attach_client_entity(LOCAL_CLIENT_ID, store, players);
        self.update_online_count();
        net_id
    }

    fn process_new_client(
        &mut self,
        pending: PendingClient,
        store: &mut dyn EntityStore,
        players: &mut dyn PlayerStore,
    ) {
        let name = unique_name(
            &pending.request.name,
            self.sessions.values().map(|s| s.core().name.as_str()),
        );
        let mut core = SessionCore::new(pending.id, pending.peer_id, name, pending.request.color);
        core.view_distance = pending.request.view_distance;
        let id = core.id;

        self.sessions.insert(
            id,
            Session::Remote(ClientSession::new(
                core,
                pending.outbound,
                pending.inbound,
                pending.metrics,
            )),
        );
        // The session now counts as online, so its reserved slot can go.
        self.update_online_count();
        drop(pending.slot);

        let Some(net_id) = self.attach_client_entity(id, store, players) else {
            return;
        };
        let time = self.ctx.game_time();
        if let Some(session) = self.remote_mut(id) {
            session.send(NetMessage::with_time(Payload::JoinComplete { client_id: net_id }, time));
            info!("{} joined as client {}", session.core().name, net_id);
        }
    }

    fn attach_client_entity(
        &mut self,
        id: ClientId,
        store: &mut dyn EntityStore,
        players: &mut dyn PlayerStore,
    ) -> Option<NetworkEntityId> {
        let core = self.sessions.get(&id)?.core().clone();
        let entity = store.create_client_entity(&core.peer_id, &core.name, core.color);
        self.client_entities.insert(entity, id);
        if let Some(session) = self.sessions.get_mut(&id) {
            session.core_mut().entity = Some(entity);
        }

        // Everything already registered that this client may see.
        let visible: Vec<NetworkEntityId> = self
            .entities
            .registered()
            .into_iter()
            .filter(|(_, e)| match store.replicate_mode(*e) {
                Some(ReplicateMode::Owner) => self.owner_client(*e) == Some(id),
                _ => true,
            })
            .map(|(net_id, _)| net_id)
            .collect();
        if let Some(session) = self.remote_mut(id) {
            for net_id in visible {
                session.set_net_initial(net_id);
            }
        }

        let net_id = self.register_entity(entity, &*store);
        players.activate(&core.peer_id, entity);
        Some(net_id)
    }

    fn remove_session(&mut self, id: ClientId, store: &mut dyn EntityStore, players: &mut dyn PlayerStore) {
        let Some(session) = self.sessions.remove(&id) else {
            return;
        };
        let core = session.core();
        if let Some(entity) = core.entity {
            self.client_entities.remove(&entity);
            self.unregister_entity(entity);
            players.deactivate(&core.peer_id, entity);
            store.destroy_entity(entity);
        }
        info!("{} left", core.name);
        self.update_online_count();
    }

    /// Kicks a client. The later hang-up report for it is ignored.
    pub fn force_disconnect(
        &mut self,
        id: ClientId,
        reason: &str,
        store: &mut dyn EntityStore,
        players: &mut dyn PlayerStore,
    ) {
        if let Some(session) = self.remote_mut(id) {
            session.close(Some(reason));
            self.kicked.insert(id);
        }
        self.remove_session(id, store, players);
    }

    /// Closes every connection and forgets all ids. The next registered entity
    /// gets id 1 again.
    pub fn shutdown(&mut self) {
        for session in self.remotes_mut() {
            session.close(Some("Server shutting down"));
        }
        self.sessions.clear();
        self.entities = EntityIndex::default();
        self.ownership = OwnershipIndex::default();
        self.client_entities.clear();
        self.pending_connects.clear();
        self.pending_disconnects.clear();
        self.kicked.clear();
        self.update_online_count();
    }

    /// Admits queued clients, drops hung-up ones, then runs one network tick
    /// for every session.
    pub fn update(&mut self, store: &mut dyn EntityStore, players: &mut dyn PlayerStore) {
        while let Some(pending) = self.pending_connects.pop_front() {
            self.process_new_client(pending, store, players);
        }
        while let Some(id) = self.pending_disconnects.pop_front() {
            if !self.kicked.remove(&id) {
                self.remove_session(id, store, players);
            }
        }

        let tick = TickContext {
            time: self.ctx.game_time(),
            tick_seconds: self.ctx.config.net_tick().as_secs_f64(),
            bandwidth_per_client: self.bandwidth_per_client(),
        };
        let view = ReplicationView {
            tables: &self.ctx.tables,
            entities: &self.entities,
            ownership: &self.ownership,
            client_entities: &self.client_entities,
        };
        let mut changes = Vec::new();
        for session in self.sessions.values_mut().filter_map(Session::as_remote_mut) {
            changes.extend(session.update(&view, store, &tick));
        }

        for change in changes {
            self.on_component_changed(change.entity, &change.component);
        }

        let dropped: Vec<ClientId> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.as_remote().is_some_and(|r| !r.is_connected()))
            .map(|(id, _)| *id)
            .collect();
        for id in dropped {
            self.remove_session(id, store, players);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connect_list::JsonConnectList;
    use crate::world::{MemoryEntityStore, MemoryPlayerStore};
    use shared::assets::MemoryModuleRegistry;
    use shared::config::{NetworkConfig, ViewDistance};
    use shared::identity::CertificateGenerator;

    fn directory() -> ReplicationDirectory {
        let ctx = ServerContext::new(
            NetworkConfig::default(),
            CertificateGenerator::generate_self_signed(),
            SerializationTables::default(),
            Box::new(MemoryModuleRegistry::new()),
            Box::new(JsonConnectList::in_memory()),
        );
        ReplicationDirectory::new(Arc::new(ctx))
    }

    fn request(name: &str) -> JoinRequest {
        JoinRequest {
            name: name.to_string(),
            view_distance: ViewDistance::Far,
            color: 0,
        }
    }

    #[test]
    fn test_ids_start_at_one_and_reset_on_shutdown() {
        let mut dir = directory();
        let mut store = MemoryEntityStore::new();
        let a = store.spawn(Some(ReplicateMode::Always), None);
        let b = store.spawn(Some(ReplicateMode::Always), None);

        assert_eq!(dir.register_entity(a, &store), 1);
        assert_eq!(dir.register_entity(b, &store), 2);
        assert_eq!(dir.register_entity(a, &store), 1);

        dir.shutdown();
        assert_eq!(dir.registered_count(), 0);
        assert_eq!(dir.register_entity(b, &store), 1);
    }

    #[test]
    fn test_owner_chain_resolves_to_client() {
        let mut dir = directory();
        let mut store = MemoryEntityStore::new();
        let mut players = MemoryPlayerStore::new();
        let (pending, _link) = PendingClient::with_channels(1, "peer", request("ann"));
        dir.queue_client(pending);
        dir.update(&mut store, &mut players);

        let client_entity = dir.session(1).unwrap().core().entity.unwrap();
        let character = store.spawn(Some(ReplicateMode::Always), Some(client_entity));
        let item = store.spawn(Some(ReplicateMode::Owner), Some(character));
        dir.register_entity(character, &store);
        dir.register_entity(item, &store);

        assert_eq!(dir.owner_client(item), Some(1));
        assert!(players.is_active("peer"));
    }

    #[test]
    fn test_owner_cycle_is_bounded() {
        let mut dir = directory();
        let mut store = MemoryEntityStore::new();
        let a = store.spawn(Some(ReplicateMode::Always), None);
        let b = store.spawn(Some(ReplicateMode::Always), Some(a));
        dir.register_entity(a, &store);
        dir.register_entity(b, &store);
        dir.update_ownership(a, Some(b), &store);

        assert_eq!(dir.owner_client(a), None);
    }

    #[test]
    fn test_bandwidth_is_split_between_clients() {
        let mut dir = directory();
        let mut store = MemoryEntityStore::new();
        let mut players = MemoryPlayerStore::new();
        assert_eq!(dir.bandwidth_per_client(), 1024.0);

        let mut links = Vec::new();
        for id in 1..=4 {
            let (pending, link) = PendingClient::with_channels(id, format!("peer{}", id), request("p"));
            dir.queue_client(pending);
            links.push(link);
        }
        dir.update(&mut store, &mut players);

        assert_eq!(dir.client_count(), 4);
        assert_eq!(dir.bandwidth_per_client(), 256.0);
        assert_eq!(dir.context().online_players(), 4);
    }

    #[test]
    fn test_admission_releases_reserved_slot() {
        let mut dir = directory();
        let mut store = MemoryEntityStore::new();
        let mut players = MemoryPlayerStore::new();
        let (mut pending, _link) = PendingClient::with_channels(1, "peer", request("ann"));
        pending.slot = dir.context().try_reserve_slot();
        dir.queue_client(pending);
        assert_eq!(dir.context().reserved_slots(), 1);
        assert_eq!(dir.context().online_players(), 0);

        dir.update(&mut store, &mut players);
        assert_eq!(dir.context().reserved_slots(), 0);
        assert_eq!(dir.context().online_players(), 1);
    }

    #[test]
    fn test_duplicate_names_are_suffixed() {
        let mut dir = directory();
        let mut store = MemoryEntityStore::new();
        let mut players = MemoryPlayerStore::new();
        dir.add_local_player("host", "ann", 0, &mut store, &mut players);

        let (pending, _link) = PendingClient::with_channels(1, "peer", request("ann"));
        dir.queue_client(pending);
        dir.update(&mut store, &mut players);

        assert_eq!(dir.session(1).unwrap().core().name, "ann(2)");
        assert_eq!(dir.session(1).unwrap().core().view_distance, ViewDistance::Far);
    }

    #[test]
    fn test_kicked_client_hang_up_is_ignored() {
        let mut dir = directory();
        let mut store = MemoryEntityStore::new();
        let mut players = MemoryPlayerStore::new();
        let (pending, mut link) = PendingClient::with_channels(1, "peer", request("ann"));
        dir.queue_client(pending);
        dir.update(&mut store, &mut players);

        dir.force_disconnect(1, "Kicked", &mut store, &mut players);
        assert!(dir.session(1).is_none());
        assert!(!players.is_active("peer"));

        let mut saw_reason = false;
        while let Ok(item) = link.outbound.try_recv() {
            if let Outbound::Message(NetMessage {
                payload: Payload::Disconnect { reason },
                ..
            }) = item
            {
                saw_reason = reason == "Kicked";
            }
        }
        assert!(saw_reason);

        // A new client reusing the id is not affected by the stale report.
        let (pending, _link2) = PendingClient::with_channels(1, "peer2", request("bob"));
        dir.queue_client(pending);
        dir.queue_disconnect(1);
        dir.update(&mut store, &mut players);
        assert!(dir.session(1).is_some());
    }
}
