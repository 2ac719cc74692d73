use crate::lifecycle::DEFAULT_TIMEOUT;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// How far around the player the world is streamed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ViewDistance {
    #[default]
    Near,
    Moderate,
    Far,
    Ultra,
    Mega,
    Extreme,
}

impl ViewDistance {
    pub fn index(self) -> u8 {
        self as u8
    }

    pub fn from_index(index: u8) -> Option<Self> {
        Some(match index {
            0 => ViewDistance::Near,
            1 => ViewDistance::Moderate,
            2 => ViewDistance::Far,
            3 => ViewDistance::Ultra,
            4 => ViewDistance::Mega,
            5 => ViewDistance::Extreme,
            _ => return None,
        })
    }

    /// Radius in chunks around the player.
    pub fn chunk_radius(self) -> i32 {
        match self {
            ViewDistance::Near => 4,
            ViewDistance::Moderate => 6,
            ViewDistance::Far => 8,
            ViewDistance::Ultra => 12,
            ViewDistance::Mega => 16,
            ViewDistance::Extreme => 24,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Upstream budget in KB/s, shared evenly by all connected clients.
    pub upstream_bandwidth: u32,
    pub server_motd: Option<String>,
    pub max_clients: usize,
    pub view_distance: ViewDistance,
    pub connect_timeout_ms: u64,
    pub net_tick_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            upstream_bandwidth: 1024,
            server_motd: None,
            max_clients: 32,
            view_distance: ViewDistance::Near,
            connect_timeout_ms: DEFAULT_TIMEOUT.as_millis() as u64,
            net_tick_ms: 50,
        }
    }
}

impl NetworkConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn net_tick(&self) -> Duration {
        Duration::from_millis(self.net_tick_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NetworkConfig::default();
        assert_eq!(config.upstream_bandwidth, 1024);
        assert_eq!(config.connect_timeout(), Duration::from_secs(120));
        assert_eq!(config.net_tick(), Duration::from_millis(50));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("network.json");
        std::fs::write(&path, r#"{"upstream_bandwidth": 256, "server_motd": "hello"}"#).unwrap();

        let config = NetworkConfig::load(&path).unwrap();
        assert_eq!(config.upstream_bandwidth, 256);
        assert_eq!(config.server_motd.as_deref(), Some("hello"));
        assert_eq!(config.max_clients, 32);
    }

    #[test]
    fn test_bad_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("network.json");
        std::fs::write(&path, "not json").unwrap();

        assert!(matches!(NetworkConfig::load(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_view_distance_index() {
        assert_eq!(ViewDistance::from_index(ViewDistance::Far.index()), Some(ViewDistance::Far));
        assert_eq!(ViewDistance::from_index(9), None);
    }
}
