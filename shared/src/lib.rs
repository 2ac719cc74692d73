//! Types and protocol pieces used by both the server and the client.

pub mod assets;
pub mod config;
pub mod crypto;
pub mod entity;
pub mod error;
pub mod identity;
pub mod join_status;
pub mod lifecycle;
pub mod metrics;
pub mod protocol;
pub mod serialization;
pub mod transport;
pub mod world;

pub use entity::{NetworkEntityId, NULL_NET_ID};
pub use error::{ErrorKind, ProtocolError};
pub use protocol::{NetMessage, Payload};

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Wall-clock time in milliseconds.
pub fn get_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

/// Human readable byte count as shown in download status text.
pub fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} bytes", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.2} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.2} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
