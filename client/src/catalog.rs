//! Client side of catalog sync.
//!
//! Asks for the server info, downloads every module the local registry lacks,
//! installs each archive once its declared size has arrived, and then sends
//! the join request. Any transfer problem ends the connection.

use log::{debug, info};
use shared::assets::{ModuleInfo, ModuleRegistry};
use shared::error::ProtocolError;
use shared::join_status::JoinStatus;
use shared::protocol::{JoinRequest, ModuleDataHeader, Payload, ServerInfo};
use shared::{format_size, NetMessage, NetworkEntityId};
use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;

#[derive(Debug)]
pub enum CatalogStep {
    Reply(Vec<NetMessage>),
    Joined {
        client_id: NetworkEntityId,
        server_info: ServerInfo,
    },
}

struct Download {
    header: ModuleDataHeader,
    file: NamedTempFile,
    received: u64,
}

fn transfer_error(message: impl Into<String>) -> ProtocolError {
    ProtocolError::AssetTransfer(message.into())
}

pub struct ClientCatalogSync {
    join_status: Arc<JoinStatus>,
    install_dir: PathBuf,
    request: JoinRequest,
    server_info: Option<ServerInfo>,
    missing: BTreeSet<String>,
    download: Option<Download>,
    join_sent: bool,
}

impl ClientCatalogSync {
    pub fn new(join_status: Arc<JoinStatus>, install_dir: impl Into<PathBuf>, request: JoinRequest) -> Self {
        Self {
            join_status,
            install_dir: install_dir.into(),
            request,
            server_info: None,
            missing: BTreeSet::new(),
            download: None,
            join_sent: false,
        }
    }

    pub fn start(&mut self) -> Vec<NetMessage> {
        self.join_status.set_current_activity("Requesting server info");
        vec![NetMessage::new(Payload::ServerInfoRequest)]
    }

    /// Module ids (lowercase) still to be downloaded.
    pub fn missing(&self) -> &BTreeSet<String> {
        &self.missing
    }

    pub fn on_message(
        &mut self,
        message: NetMessage,
        modules: &mut dyn ModuleRegistry,
    ) -> Result<CatalogStep, ProtocolError> {
        match message.payload {
            Payload::ServerInfo(info) => self.on_server_info(info, &*modules),
            Payload::ModuleDataHeader(header) => self.on_module_header(header, modules),
            Payload::ModuleData { data } => self.on_module_data(&data, modules),
            Payload::JoinComplete { client_id } if self.join_sent => {
                let server_info = self.server_info.take().unwrap_or_default();
                self.join_status.set_complete();
                info!("Joined as client {}", client_id);
                Ok(CatalogStep::Joined { client_id, server_info })
            }
            other => Err(ProtocolError::UnexpectedMessage(other.name())),
        }
    }

    fn on_server_info(
        &mut self,
        info: ServerInfo,
        modules: &dyn ModuleRegistry,
    ) -> Result<CatalogStep, ProtocolError> {
        if let Some(reason) = info.error_message.clone().filter(|m| !m.is_empty()) {
            self.join_status.set_error_message(reason.clone());
            return Err(ProtocolError::Authorization(reason));
        }

        if let Some(motd) = &info.motd {
            info!("Server message of the day: {}", motd);
        }
        self.missing = info
            .modules
            .iter()
            .filter(|module| !modules.contains(module))
            .map(|module| module.id.to_lowercase())
            .collect();
        self.server_info = Some(info);

        if self.missing.is_empty() {
            return Ok(CatalogStep::Reply(vec![self.join()]));
        }

        info!("Downloading {} missing modules", self.missing.len());
        self.join_status.set_current_activity("Downloading modules");
        Ok(CatalogStep::Reply(
            self.missing
                .iter()
                .map(|id| NetMessage::new(Payload::ModuleRequest { module_id: id.clone() }))
                .collect(),
        ))
    }

    fn on_module_header(
        &mut self,
        header: ModuleDataHeader,
        modules: &mut dyn ModuleRegistry,
    ) -> Result<CatalogStep, ProtocolError> {
        if let Some(current) = &self.download {
            return Err(transfer_error(format!(
                "received header for {} while {} is still downloading",
                header.id, current.header.id
            )));
        }
        if let Some(error) = &header.error {
            return Err(transfer_error(format!("{}: {}", header.id, error)));
        }
        if !self.missing.contains(&header.id.to_lowercase()) {
            return Err(transfer_error(format!("received unwanted module {}", header.id)));
        }

        let file = NamedTempFile::new_in(&self.install_dir)
            .map_err(|e| transfer_error(format!("unable to stage {}: {}", header.id, e)))?;
        self.join_status.set_current_activity(format!(
            "Downloading {}:{} ({}, {} modules remain)",
            header.id,
            header.version,
            format_size(header.size),
            self.missing.len()
        ));
        debug!("Receiving {} bytes for {}", header.size, header.id);

        let size = header.size;
        self.download = Some(Download {
            header,
            file,
            received: 0,
        });
        // No data messages follow an empty archive.
        if size == 0 {
            return self.finish_download(modules);
        }
        Ok(CatalogStep::Reply(Vec::new()))
    }

    fn on_module_data(
        &mut self,
        data: &[u8],
        modules: &mut dyn ModuleRegistry,
    ) -> Result<CatalogStep, ProtocolError> {
        let download = self
            .download
            .as_mut()
            .ok_or_else(|| transfer_error("received module data without a header"))?;

        let received = download.received + data.len() as u64;
        if received > download.header.size {
            return Err(transfer_error(format!(
                "{} sent more data than the declared {}",
                download.header.id,
                format_size(download.header.size)
            )));
        }
        download
            .file
            .write_all(data)
            .map_err(|e| transfer_error(format!("unable to write {}: {}", download.header.id, e)))?;
        download.received = received;
        self.join_status
            .set_current_progress(received as f32 / download.header.size as f32);

        if received < download.header.size {
            return Ok(CatalogStep::Reply(Vec::new()));
        }
        self.finish_download(modules)
    }

    fn finish_download(&mut self, modules: &mut dyn ModuleRegistry) -> Result<CatalogStep, ProtocolError> {
        let Some(download) = self.download.take() else {
            return Ok(CatalogStep::Reply(Vec::new()));
        };
        let module = ModuleInfo::new(download.header.id.clone(), download.header.version.clone());
        let destination = self.destination(&module)?;

        if destination.exists() {
            return Err(transfer_error(format!("destination exists: {}", destination.display())));
        }
        download
            .file
            .persist_noclobber(&destination)
            .map_err(|e| match e.error.kind() {
                std::io::ErrorKind::AlreadyExists => {
                    transfer_error(format!("destination exists: {}", destination.display()))
                }
                _ => transfer_error(format!("unable to install {}: {}", module.id, e.error)),
            })?;
        modules
            .register_archive(&destination)
            .map_err(|e| transfer_error(format!("unable to register {}: {}", module.id, e)))?;
        info!("Installed module {} {}", module.id, module.version);

        self.missing.remove(&module.id.to_lowercase());
        if self.missing.is_empty() {
            return Ok(CatalogStep::Reply(vec![self.join()]));
        }
        Ok(CatalogStep::Reply(Vec::new()))
    }

    /// Archive path for `module`, refusing names that escape the install directory.
    fn destination(&self, module: &ModuleInfo) -> Result<PathBuf, ProtocolError> {
        let name = module.archive_name();
        let mut components = Path::new(&name).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Ok(self.install_dir.join(name)),
            _ => Err(transfer_error(format!(
                "module {} would be installed outside the module directory",
                module.id
            ))),
        }
    }

    fn join(&mut self) -> NetMessage {
        self.join_sent = true;
        self.join_status.set_current_activity("Joining");
        NetMessage::new(Payload::Join(self.request.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use shared::assets::MemoryModuleRegistry;
    use shared::config::ViewDistance;
    use shared::error::ErrorKind;
    use shared::join_status::JoinState;

    fn request() -> JoinRequest {
        JoinRequest {
            name: "ann".into(),
            view_distance: ViewDistance::Near,
            color: 0,
        }
    }

    fn server_info(modules: &[ModuleInfo]) -> NetMessage {
        NetMessage::new(Payload::ServerInfo(ServerInfo {
            modules: modules.to_vec(),
            ..ServerInfo::default()
        }))
    }

    fn header(id: &str, size: u64) -> NetMessage {
        NetMessage::new(Payload::ModuleDataHeader(ModuleDataHeader {
            id: id.into(),
            version: "1.0".into(),
            size,
            error: None,
        }))
    }

    fn data(bytes: &[u8]) -> NetMessage {
        NetMessage::new(Payload::ModuleData { data: bytes.to_vec() })
    }

    fn replies(step: Result<CatalogStep, ProtocolError>) -> Vec<NetMessage> {
        match step.unwrap() {
            CatalogStep::Reply(messages) => messages,
            other => panic!("expected reply, got {:?}", other),
        }
    }

    #[test]
    fn test_nothing_missing_joins_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let status = Arc::new(JoinStatus::new());
        let mut modules = MemoryModuleRegistry::new().with_module(ModuleInfo::new("core", "1.0"), vec![]);
        let mut sync = ClientCatalogSync::new(Arc::clone(&status), dir.path(), request());

        let messages = replies(sync.on_message(server_info(&[ModuleInfo::new("core", "1.0")]), &mut modules));
        assert!(matches!(messages[0].payload, Payload::Join(_)));

        let step = sync
            .on_message(NetMessage::new(Payload::JoinComplete { client_id: 7 }), &mut modules)
            .unwrap();
        assert!(matches!(step, CatalogStep::Joined { client_id: 7, .. }));
        assert_eq!(status.state(), JoinState::Complete);
    }

    #[test]
    fn test_missing_module_is_downloaded_and_installed() {
        let dir = tempfile::tempdir().unwrap();
        let status = Arc::new(JoinStatus::new());
        let mut modules = MemoryModuleRegistry::new();
        let mut sync = ClientCatalogSync::new(Arc::clone(&status), dir.path(), request());

        let messages = replies(sync.on_message(server_info(&[ModuleInfo::new("Core", "1.0")]), &mut modules));
        assert!(matches!(&messages[0].payload, Payload::ModuleRequest { module_id } if module_id == "core"));

        assert!(replies(sync.on_message(header("Core", 6), &mut modules)).is_empty());
        assert!(replies(sync.on_message(data(&[1, 2, 3, 4]), &mut modules)).is_empty());
        assert_approx_eq!(status.current_progress(), 4.0 / 6.0, 1e-6);

        let messages = replies(sync.on_message(data(&[5, 6]), &mut modules));
        assert!(matches!(messages[0].payload, Payload::Join(_)));
        assert!(modules.contains(&ModuleInfo::new("Core", "1.0")));
        assert_eq!(std::fs::read(dir.path().join("Core-1.0.zip")).unwrap(), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_oversized_transfer_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut modules = MemoryModuleRegistry::new();
        let mut sync = ClientCatalogSync::new(Arc::new(JoinStatus::new()), dir.path(), request());
        sync.on_message(server_info(&[ModuleInfo::new("core", "1.0")]), &mut modules)
            .unwrap();
        sync.on_message(header("core", 2), &mut modules).unwrap();

        let err = sync.on_message(data(&[1, 2, 3]), &mut modules).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AssetTransfer);
    }

    #[test]
    fn test_unwanted_module_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut modules = MemoryModuleRegistry::new();
        let mut sync = ClientCatalogSync::new(Arc::new(JoinStatus::new()), dir.path(), request());
        sync.on_message(server_info(&[ModuleInfo::new("core", "1.0")]), &mut modules)
            .unwrap();

        let err = sync.on_message(header("other", 2), &mut modules).unwrap_err();
        assert!(err.to_string().contains("unwanted"));
    }

    #[test]
    fn test_second_header_during_download_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut modules = MemoryModuleRegistry::new();
        let mut sync = ClientCatalogSync::new(Arc::new(JoinStatus::new()), dir.path(), request());
        sync.on_message(
            server_info(&[ModuleInfo::new("a", "1.0"), ModuleInfo::new("b", "1.0")]),
            &mut modules,
        )
        .unwrap();
        sync.on_message(header("a", 4), &mut modules).unwrap();

        let err = sync.on_message(header("b", 4), &mut modules).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AssetTransfer);
    }

    #[test]
    fn test_path_escape_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let mut modules = MemoryModuleRegistry::new();
        let mut sync = ClientCatalogSync::new(Arc::new(JoinStatus::new()), dir.path(), request());
        sync.on_message(server_info(&[ModuleInfo::new("../evil", "1.0")]), &mut modules)
            .unwrap();
        sync.on_message(header("../evil", 1), &mut modules).unwrap();

        let err = sync.on_message(data(&[0]), &mut modules).unwrap_err();
        assert!(err.to_string().contains("outside the module directory"));
    }

    #[test]
    fn test_server_error_header_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut modules = MemoryModuleRegistry::new();
        let mut sync = ClientCatalogSync::new(Arc::new(JoinStatus::new()), dir.path(), request());
        sync.on_message(server_info(&[ModuleInfo::new("core", "1.0")]), &mut modules)
            .unwrap();

        let err = sync
            .on_message(
                NetMessage::new(Payload::ModuleDataHeader(ModuleDataHeader {
                    id: "core".into(),
                    version: String::new(),
                    size: 0,
                    error: Some("module 'core' is not installed".into()),
                })),
                &mut modules,
            )
            .unwrap_err();
        assert!(err.to_string().starts_with("Module download error"));
    }

    #[test]
    fn test_rejection_fails_join_status() {
        let dir = tempfile::tempdir().unwrap();
        let status = Arc::new(JoinStatus::new());
        let mut modules = MemoryModuleRegistry::new();
        let mut sync = ClientCatalogSync::new(Arc::clone(&status), dir.path(), request());

        let err = sync
            .on_message(
                NetMessage::new(Payload::ServerInfo(ServerInfo::rejection("Server is full"))),
                &mut modules,
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authorization);
        assert_eq!(status.state(), JoinState::Failed);
        assert_eq!(status.error_message().as_deref(), Some("Server is full"));
    }
}
