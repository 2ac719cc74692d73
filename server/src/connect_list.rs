//! Allow and deny lists for joining peers.

use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

pub trait ConnectList: Send + Sync {
    fn is_allowed(&self, peer_id: &str) -> bool;
    fn reason_denied(&self, peer_id: &str) -> String;
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
struct Lists {
    whitelist: BTreeSet<String>,
    blacklist: BTreeSet<String>,
}

/// Lists persisted as JSON. An empty whitelist admits everyone not blacklisted.
#[derive(Debug, Default)]
pub struct JsonConnectList {
    path: Option<PathBuf>,
    lists: RwLock<Lists>,
}

impl JsonConnectList {
    /// A list that is never written to disk.
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn load(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let lists = if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            serde_json::from_str(&text).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
        } else {
            Lists::default()
        };
        info!(
            "Loaded connect list from {} ({} whitelisted, {} blacklisted)",
            path.display(),
            lists.whitelist.len(),
            lists.blacklist.len()
        );
        Ok(Self {
            path: Some(path),
            lists: RwLock::new(lists),
        })
    }

    fn read(&self) -> Lists {
        self.lists
            .read()
            .map(|l| l.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    fn modify(&self, change: impl FnOnce(&mut Lists)) {
        let snapshot = {
            let mut lists = self.lists.write().unwrap_or_else(|poisoned| poisoned.into_inner());
            change(&mut lists);
            lists.clone()
        };
        if let Some(path) = &self.path {
            if let Err(e) = save(path, &snapshot) {
                warn!("Failed to save connect list to {}: {}", path.display(), e);
            }
        }
    }

    pub fn add_to_whitelist(&self, peer_id: &str) {
        self.modify(|l| {
            l.whitelist.insert(peer_id.to_string());
        });
    }

    pub fn add_to_blacklist(&self, peer_id: &str) {
        self.modify(|l| {
            l.blacklist.insert(peer_id.to_string());
        });
    }

    pub fn remove_from_blacklist(&self, peer_id: &str) {
        self.modify(|l| {
            l.blacklist.remove(peer_id);
        });
    }
}

fn save(path: &Path, lists: &Lists) -> io::Result<()> {
    let text = serde_json::to_string_pretty(lists).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    std::fs::write(path, text)
}

impl ConnectList for JsonConnectList {
    fn is_allowed(&self, peer_id: &str) -> bool {
        let lists = self.read();
        !lists.blacklist.contains(peer_id)
            && (lists.whitelist.is_empty() || lists.whitelist.contains(peer_id))
    }

    fn reason_denied(&self, peer_id: &str) -> String {
        let lists = self.read();
        if lists.blacklist.contains(peer_id) {
            "Your identity is blacklisted on this server".to_string()
        } else if !lists.whitelist.is_empty() && !lists.whitelist.contains(peer_id) {
            "Your identity is not on the whitelist of this server".to_string()
        } else {
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_lists_allow_everyone() {
        let list = JsonConnectList::in_memory();
        assert!(list.is_allowed("anyone"));
        assert!(list.reason_denied("anyone").is_empty());
    }

    #[test]
    fn test_blacklist_wins_over_whitelist() {
        let list = JsonConnectList::in_memory();
        list.add_to_whitelist("peer");
        list.add_to_blacklist("peer");

        assert!(!list.is_allowed("peer"));
        assert!(list.reason_denied("peer").contains("blacklisted"));
        assert!(!list.is_allowed("stranger"));
        assert!(list.reason_denied("stranger").contains("whitelist"));
    }

    #[test]
    fn test_lists_persist_to_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("connect.json");

        let list = JsonConnectList::load(&path).unwrap();
        list.add_to_blacklist("griefer");

        let reloaded = JsonConnectList::load(&path).unwrap();
        assert!(!reloaded.is_allowed("griefer"));

        reloaded.remove_from_blacklist("griefer");
        assert!(JsonConnectList::load(&path).unwrap().is_allowed("griefer"));
    }
}
