//! Participants in a hosting session: remote clients and the local host player.

use crate::client_session::ClientSession;
use crate::world::EntityRef;
use shared::config::ViewDistance;

/// Identifies one connection for its whole lifetime.
pub type ClientId = u64;

/// State every kind of participant has.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionCore {
    pub id: ClientId,
    pub peer_id: String,
    pub name: String,
    pub color: u32,
    pub view_distance: ViewDistance,
    /// The client entity, once created.
    pub entity: Option<EntityRef>,
}

impl SessionCore {
    pub fn new(id: ClientId, peer_id: impl Into<String>, name: impl Into<String>, color: u32) -> Self {
        Self {
            id,
            peer_id: peer_id.into(),
            name: name.into(),
            color,
            view_distance: ViewDistance::default(),
            entity: None,
        }
    }
}

/// The player hosting a listen server. Owns entities like any other client
/// but never receives replication traffic.
#[derive(Debug)]
pub struct LocalSession {
    core: SessionCore,
}

impl LocalSession {
    pub fn new(core: SessionCore) -> Self {
        Self { core }
    }
}

pub enum Session {
    Local(LocalSession),
    Remote(ClientSession),
}

impl Session {
    pub fn core(&self) -> &SessionCore {
        match self {
            Session::Local(local) => &local.core,
            Session::Remote(remote) => remote.core(),
        }
    }

    pub fn core_mut(&mut self) -> &mut SessionCore {
        match self {
            Session::Local(local) => &mut local.core,
            Session::Remote(remote) => remote.core_mut(),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Session::Local(_))
    }

    pub fn as_remote(&self) -> Option<&ClientSession> {
        match self {
            Session::Remote(remote) => Some(remote),
            Session::Local(_) => None,
        }
    }

    pub fn as_remote_mut(&mut self) -> Option<&mut ClientSession> {
        match self {
            Session::Remote(remote) => Some(remote),
            Session::Local(_) => None,
        }
    }
}

/// Makes `preferred` unique among `taken` by appending `(n)`, smallest n >= 2.
pub fn unique_name<'a>(preferred: &str, taken: impl IntoIterator<Item = &'a str>) -> String {
    let taken: Vec<&str> = taken.into_iter().collect();
    if !taken.contains(&preferred) {
        return preferred.to_string();
    }
    (2..)
        .map(|n| format!("{}({})", preferred, n))
        .find(|candidate| !taken.contains(&candidate.as_str()))
        .unwrap_or_else(|| preferred.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_name_keeps_free_name() {
        assert_eq!(unique_name("ann", ["bob"]), "ann");
    }

    #[test]
    fn test_unique_name_picks_smallest_suffix() {
        assert_eq!(unique_name("ann", ["ann"]), "ann(2)");
        assert_eq!(unique_name("ann", ["ann", "ann(2)", "ann(4)"]), "ann(3)");
    }

    #[test]
    fn test_local_session_core() {
        let session = Session::Local(LocalSession::new(SessionCore::new(0, "host", "host", 1)));
        assert!(session.is_local());
        assert!(session.as_remote().is_none());
        assert_eq!(session.core().name, "host");
    }
}
