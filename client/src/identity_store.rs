//! Where a client keeps the identities servers have issued to it.

use log::info;
use shared::identity::ClientIdentity;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

/// Identities keyed by the issuing server's certificate id.
pub trait IdentityStore: Send {
    fn load(&self, server_id: &str) -> Option<ClientIdentity>;
    fn save(&mut self, identity: ClientIdentity) -> io::Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    identities: BTreeMap<String, ClientIdentity>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn load(&self, server_id: &str) -> Option<ClientIdentity> {
        self.identities.get(server_id).cloned()
    }

    fn save(&mut self, identity: ClientIdentity) -> io::Result<()> {
        self.identities.insert(identity.server.id.clone(), identity);
        Ok(())
    }
}

/// Identities persisted as one JSON document, rewritten on every save.
#[derive(Debug)]
pub struct JsonIdentityStore {
    path: PathBuf,
    identities: BTreeMap<String, ClientIdentity>,
}

impl JsonIdentityStore {
    pub fn load(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let identities = if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            serde_json::from_str(&text).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
        } else {
            BTreeMap::new()
        };
        Ok(Self { path, identities })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl IdentityStore for JsonIdentityStore {
    fn load(&self, server_id: &str) -> Option<ClientIdentity> {
        self.identities.get(server_id).cloned()
    }

    fn save(&mut self, identity: ClientIdentity) -> io::Result<()> {
        info!(
            "Storing identity {} for server {}",
            identity.identity.id(),
            identity.server.id
        );
        self.identities.insert(identity.server.id.clone(), identity);

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(&self.identities)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        std::fs::write(&self.path, text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::identity::CertificateGenerator;

    fn identity() -> ClientIdentity {
        let server = CertificateGenerator::generate_self_signed();
        ClientIdentity {
            identity: CertificateGenerator::generate(&server.private),
            server: server.public,
        }
    }

    #[test]
    fn test_json_store_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identities.json");
        let identity = identity();

        let mut store = JsonIdentityStore::load(&path).unwrap();
        store.save(identity.clone()).unwrap();

        let reloaded = JsonIdentityStore::load(&path).unwrap();
        assert_eq!(reloaded.load(&identity.server.id), Some(identity));
        assert_eq!(reloaded.load("someone-else"), None);
    }

    #[test]
    fn test_memory_store_replaces_identity() {
        let mut store = MemoryIdentityStore::new();
        let first = identity();
        let mut second = identity();
        second.server = first.server.clone();

        store.save(first).unwrap();
        store.save(second.clone()).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.load(&second.server.id), Some(second));
    }
}
