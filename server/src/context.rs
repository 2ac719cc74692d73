//! Collaborators shared by every connection of a hosting session.

use crate::connect_list::ConnectList;
use log::info;
use shared::assets::ModuleRegistry;
use shared::config::NetworkConfig;
use shared::identity::{CertificateGenerator, CertificatePair};
use shared::protocol::{ServerInfo, WorldInfo};
use shared::serialization::SerializationTables;
use std::fmt;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub struct ServerContext {
    pub config: NetworkConfig,
    pub identity: CertificatePair,
    pub tables: Arc<SerializationTables>,
    pub modules: Box<dyn ModuleRegistry>,
    pub connect_list: Box<dyn ConnectList>,
    pub world: WorldInfo,
    pub block_ids: Vec<(String, u16)>,
    registered_families: Mutex<Vec<String>>,
    online_players: AtomicU32,
    reserved_slots: AtomicU32,
    game_time: AtomicU64,
}

/// A client slot held from join authorization until the directory admits the
/// client. Dropping it frees the slot.
pub struct SlotReservation {
    ctx: Arc<ServerContext>,
}

impl fmt::Debug for SlotReservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotReservation").finish_non_exhaustive()
    }
}

impl Drop for SlotReservation {
    fn drop(&mut self) {
        self.ctx.reserved_slots.fetch_sub(1, Ordering::AcqRel);
    }
}

impl ServerContext {
    pub fn new(
        config: NetworkConfig,
        identity: CertificatePair,
        tables: SerializationTables,
        modules: Box<dyn ModuleRegistry>,
        connect_list: Box<dyn ConnectList>,
    ) -> Self {
        Self {
            config,
            identity,
            tables: Arc::new(tables),
            modules,
            connect_list,
            world: WorldInfo {
                title: "World".to_string(),
                time: 0,
            },
            block_ids: Vec::new(),
            registered_families: Mutex::new(Vec::new()),
            online_players: AtomicU32::new(0),
            reserved_slots: AtomicU32::new(0),
            game_time: AtomicU64::new(0),
        }
    }

    pub fn with_world(mut self, world: WorldInfo, block_ids: Vec<(String, u16)>) -> Self {
        self.world = world;
        self.block_ids = block_ids;
        self
    }

    pub fn online_players(&self) -> u32 {
        self.online_players.load(Ordering::Relaxed)
    }

    pub(crate) fn set_online_players(&self, count: u32) {
        self.online_players.store(count, Ordering::Relaxed);
    }

    /// Joins authorized but not yet admitted.
    pub fn reserved_slots(&self) -> u32 {
        self.reserved_slots.load(Ordering::Acquire)
    }

    /// Takes a client slot unless online players plus outstanding reservations
    /// already reach `max_clients`.
    pub fn try_reserve_slot(self: &Arc<Self>) -> Option<SlotReservation> {
        let max_clients = self.config.max_clients;
        self.reserved_slots
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |reserved| {
                let taken = self.online_players() as usize + reserved as usize;
                (taken < max_clients).then_some(reserved + 1)
            })
            .ok()?;
        Some(SlotReservation { ctx: Arc::clone(self) })
    }

    pub fn game_time(&self) -> u64 {
        self.game_time.load(Ordering::Relaxed)
    }

    pub fn set_game_time(&self, time: u64) {
        self.game_time.store(time, Ordering::Relaxed);
    }

    pub fn record_block_family(&self, uri: &str) {
        let mut families = self
            .registered_families
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        families.push(uri.to_string());
    }

    pub fn server_info(&self) -> ServerInfo {
        let registered_block_families = self
            .registered_families
            .lock()
            .map(|f| f.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone());

        ServerInfo {
            time: self.game_time(),
            motd: self.config.server_motd.clone(),
            online_players: self.online_players(),
            worlds: vec![WorldInfo {
                title: self.world.title.clone(),
                time: self.game_time(),
            }],
            modules: self.modules.shared_modules(),
            block_ids: self.block_ids.clone(),
            registered_block_families,
            components: self.tables.components.to_info(),
            events: self.tables.events.to_info(),
            error_message: None,
        }
    }
}

/// Loads the server's root certificate, generating and saving one on first start.
pub fn load_or_generate_identity(path: &Path) -> io::Result<CertificatePair> {
    if path.exists() {
        let text = std::fs::read_to_string(path)?;
        let identity: CertificatePair =
            serde_json::from_str(&text).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if identity.public.verify_self_signed().is_err() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "stored server certificate is not self-signed",
            ));
        }
        return Ok(identity);
    }

    let identity = CertificateGenerator::generate_self_signed();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let text =
        serde_json::to_string_pretty(&identity).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    std::fs::write(path, text)?;
    info!("Generated server identity {}", identity.id());
    Ok(identity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connect_list::JsonConnectList;
    use shared::assets::{MemoryModuleRegistry, ModuleInfo};
    use shared::serialization::{FieldReplication, FieldSchema, TypeSchema};

    fn context() -> ServerContext {
        let tables = SerializationTables::generate(
            &[TypeSchema::new(
                "Location",
                vec![FieldSchema::new("position", FieldReplication::ServerToAll)],
            )],
            &[],
        );
        ServerContext::new(
            NetworkConfig {
                server_motd: Some("welcome".into()),
                ..NetworkConfig::default()
            },
            CertificateGenerator::generate_self_signed(),
            tables,
            Box::new(
                MemoryModuleRegistry::new()
                    .with_module(ModuleInfo::new("core", "1.0"), vec![0; 10])
                    .with_server_only_module(ModuleInfo::new("admin", "1.0"), vec![]),
            ),
            Box::new(JsonConnectList::in_memory()),
        )
    }

    #[test]
    fn test_server_info_contents() {
        let ctx = context();
        ctx.set_game_time(500);
        ctx.set_online_players(3);
        ctx.record_block_family("core:stone");

        let info = ctx.server_info();
        assert_eq!(info.time, 500);
        assert_eq!(info.motd.as_deref(), Some("welcome"));
        assert_eq!(info.online_players, 3);
        assert_eq!(info.modules, vec![ModuleInfo::new("core", "1.0")]);
        assert_eq!(info.registered_block_families, vec!["core:stone".to_string()]);
        assert_eq!(info.components.len(), 1);
        assert!(info.error_message.is_none());
    }

    #[test]
    fn test_slots_are_reserved_until_dropped() {
        let mut ctx = context();
        ctx.config.max_clients = 2;
        let ctx = Arc::new(ctx);
        ctx.set_online_players(1);

        let slot = ctx.try_reserve_slot().unwrap();
        assert_eq!(ctx.reserved_slots(), 1);
        assert!(ctx.try_reserve_slot().is_none());

        drop(slot);
        assert_eq!(ctx.reserved_slots(), 0);
        assert!(ctx.try_reserve_slot().is_some());
    }

    #[test]
    fn test_identity_is_generated_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server-identity.json");

        let first = load_or_generate_identity(&path).unwrap();
        let second = load_or_generate_identity(&path).unwrap();
        assert_eq!(first, second);
    }
}
