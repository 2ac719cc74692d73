//! Module archives shared between server and clients.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModuleInfo {
    pub id: String,
    pub version: String,
}

impl ModuleInfo {
    pub fn new(id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
        }
    }

    /// File name an installed archive of this module carries.
    pub fn archive_name(&self) -> String {
        format!("{}-{}.zip", self.id, self.version)
    }

    /// Parses `<id>-<version>.zip`. The version is everything after the last dash.
    pub fn from_archive_name(name: &str) -> Option<Self> {
        let stem = name.strip_suffix(".zip")?;
        let (id, version) = stem.rsplit_once('-')?;
        if id.is_empty() || version.is_empty() {
            return None;
        }
        Some(Self::new(id, version))
    }
}

/// Source and sink of module archives.
pub trait ModuleRegistry: Send + Sync {
    /// Modules that clients need; server-side-only modules are excluded.
    fn shared_modules(&self) -> Vec<ModuleInfo>;

    fn contains(&self, module: &ModuleInfo) -> bool;

    /// Full archive bytes of the module with `id` (case-insensitive).
    fn read_archive(&self, id: &str) -> io::Result<(ModuleInfo, Vec<u8>)>;

    /// Registers an archive that has been installed at `path`.
    fn register_archive(&mut self, path: &Path) -> io::Result<ModuleInfo>;
}

#[derive(Debug, Clone)]
struct InstalledModule {
    info: ModuleInfo,
    path: PathBuf,
    server_only: bool,
}

/// Archives stored as `<id>-<version>.zip` in one directory.
#[derive(Debug, Clone)]
pub struct DirectoryModuleRegistry {
    root: PathBuf,
    modules: BTreeMap<String, InstalledModule>,
}

impl DirectoryModuleRegistry {
    /// Scans `root` for archives, creating the directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;

        let mut registry = Self {
            root,
            modules: BTreeMap::new(),
        };
        for entry in fs::read_dir(&registry.root)? {
            let path = entry?.path();
            match registry.register_archive(&path) {
                Ok(info) => debug!("Found module {} {}", info.id, info.version),
                Err(e) => warn!("Ignoring {}: {}", path.display(), e),
            }
        }
        Ok(registry)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Marks a module as needed only on the server.
    pub fn set_server_only(&mut self, id: &str, server_only: bool) {
        if let Some(module) = self.modules.get_mut(&id.to_lowercase()) {
            module.server_only = server_only;
        }
    }
}

impl ModuleRegistry for DirectoryModuleRegistry {
    fn shared_modules(&self) -> Vec<ModuleInfo> {
        self.modules
            .values()
            .filter(|m| !m.server_only)
            .map(|m| m.info.clone())
            .collect()
    }

    fn contains(&self, module: &ModuleInfo) -> bool {
        self.modules
            .get(&module.id.to_lowercase())
            .map(|m| m.info.version == module.version)
            .unwrap_or(false)
    }

    fn read_archive(&self, id: &str) -> io::Result<(ModuleInfo, Vec<u8>)> {
        let module = self.modules.get(&id.to_lowercase()).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("module '{}' is not installed", id))
        })?;
        let data = fs::read(&module.path)?;
        Ok((module.info.clone(), data))
    }

    fn register_archive(&mut self, path: &Path) -> io::Result<ModuleInfo> {
        let info = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(ModuleInfo::from_archive_name)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "not a module archive"))?;

        self.modules.insert(
            info.id.to_lowercase(),
            InstalledModule {
                info: info.clone(),
                path: path.to_path_buf(),
                server_only: false,
            },
        );
        Ok(info)
    }
}

/// Registry kept entirely in memory; registered archives are read back from disk.
#[derive(Debug, Clone, Default)]
pub struct MemoryModuleRegistry {
    modules: BTreeMap<String, (ModuleInfo, Vec<u8>, bool)>,
}

impl MemoryModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_module(mut self, info: ModuleInfo, data: Vec<u8>) -> Self {
        self.modules.insert(info.id.to_lowercase(), (info, data, false));
        self
    }

    pub fn with_server_only_module(mut self, info: ModuleInfo, data: Vec<u8>) -> Self {
        self.modules.insert(info.id.to_lowercase(), (info, data, true));
        self
    }
}

impl ModuleRegistry for MemoryModuleRegistry {
    fn shared_modules(&self) -> Vec<ModuleInfo> {
        self.modules
            .values()
            .filter(|(_, _, server_only)| !server_only)
            .map(|(info, _, _)| info.clone())
            .collect()
    }

    fn contains(&self, module: &ModuleInfo) -> bool {
        self.modules
            .get(&module.id.to_lowercase())
            .map(|(info, _, _)| info.version == module.version)
            .unwrap_or(false)
    }

    fn read_archive(&self, id: &str) -> io::Result<(ModuleInfo, Vec<u8>)> {
        self.modules
            .get(&id.to_lowercase())
            .map(|(info, data, _)| (info.clone(), data.clone()))
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("module '{}' is not installed", id))
            })
    }

    fn register_archive(&mut self, path: &Path) -> io::Result<ModuleInfo> {
        let info = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(ModuleInfo::from_archive_name)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "not a module archive"))?;
        let data = fs::read(path)?;
        self.modules
            .insert(info.id.to_lowercase(), (info.clone(), data, false));
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_archive_name_round_trip() {
        let info = ModuleInfo::new("core-blocks", "1.2.0");
        assert_eq!(info.archive_name(), "core-blocks-1.2.0.zip");
        assert_eq!(ModuleInfo::from_archive_name("core-blocks-1.2.0.zip"), Some(info));
        assert_eq!(ModuleInfo::from_archive_name("notes.txt"), None);
        assert_eq!(ModuleInfo::from_archive_name("-1.0.zip"), None);
    }

    #[test]
    fn test_directory_registry_scans_archives() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("core-1.0.zip"), b"core").unwrap();
        fs::write(dir.path().join("readme.md"), b"ignored").unwrap();

        let mut registry = DirectoryModuleRegistry::open(dir.path()).unwrap();
        assert!(registry.contains(&ModuleInfo::new("Core", "1.0")));
        assert!(!registry.contains(&ModuleInfo::new("core", "2.0")));
        assert_eq!(registry.read_archive("CORE").unwrap().1, b"core");

        registry.set_server_only("core", true);
        assert!(registry.shared_modules().is_empty());
    }

    #[test]
    fn test_memory_registry_excludes_server_only() {
        let registry = MemoryModuleRegistry::new()
            .with_module(ModuleInfo::new("world", "1.0"), vec![1, 2, 3])
            .with_server_only_module(ModuleInfo::new("admin", "1.0"), vec![]);

        assert_eq!(registry.shared_modules(), vec![ModuleInfo::new("world", "1.0")]);
        assert!(registry.read_archive("missing").is_err());
    }
}
