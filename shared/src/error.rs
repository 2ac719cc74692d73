//! Error taxonomy for the connection lifecycle.
//!
//! Every handshake, catalog and replication step returns one of these types.
//! [`ProtocolError::kind`] classifies a failure into the categories the
//! supervisors act on: integrity failures close the connection, data-level
//! failures are logged and skipped.

use std::io;
use thiserror::Error;

/// Failures while framing or decoding the message envelope.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(usize),
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u16),
    #[error("malformed message body: {0}")]
    Malformed(#[from] bincode::Error),
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
}

/// Failures inside identity certificates and session key handling.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("invalid signature encoding")]
    InvalidSignature,
    #[error("signature verification failed")]
    VerificationFailed,
    #[error("encryption failed")]
    Encryption,
    #[error("decryption failed")]
    Decryption,
    #[error("malformed certificate payload")]
    MalformedPayload,
}

/// Failures while packing or unpacking a single entity, event or component.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SerializationError {
    #[error("type '{0}' has no serialization id")]
    UnknownType(String),
    #[error("serialization id {0} is not known")]
    UnknownTypeId(u16),
    #[error("entity {0} does not exist")]
    MissingEntity(u64),
}

/// Classification of a [`ProtocolError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Authentication,
    AssetTransfer,
    Authorization,
    Serialization,
    StaleOwnership,
    Timeout,
    Transport,
}

/// Connection-level failure.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("Module download error: {0}")]
    AssetTransfer(String),
    #[error("{0}")]
    Authorization(String),
    #[error("serialization failed: {0}")]
    Serialization(#[from] SerializationError),
    #[error("entity {net_id} is not owned by the sender")]
    StaleOwnership { net_id: u32 },
    #[error("Server stopped responding.")]
    Timeout,
    #[error("unexpected {0} message")]
    UnexpectedMessage(&'static str),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
}

impl ProtocolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProtocolError::Authentication(_) => ErrorKind::Authentication,
            ProtocolError::AssetTransfer(_) => ErrorKind::AssetTransfer,
            ProtocolError::Authorization(_) => ErrorKind::Authorization,
            ProtocolError::Serialization(_) => ErrorKind::Serialization,
            ProtocolError::StaleOwnership { .. } => ErrorKind::StaleOwnership,
            ProtocolError::Timeout => ErrorKind::Timeout,
            ProtocolError::UnexpectedMessage(_) | ProtocolError::Codec(_) | ProtocolError::Io(_) => {
                ErrorKind::Transport
            }
        }
    }

    /// Whether this failure must close the connection.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self.kind(),
            ErrorKind::Serialization | ErrorKind::StaleOwnership
        )
    }
}

impl From<CryptoError> for ProtocolError {
    fn from(err: CryptoError) -> Self {
        ProtocolError::Authentication(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(ProtocolError::Authentication("bad".into()).is_fatal());
        assert!(ProtocolError::AssetTransfer("size".into()).is_fatal());
        assert!(ProtocolError::Authorization("denied".into()).is_fatal());
        assert!(ProtocolError::Timeout.is_fatal());
        assert!(ProtocolError::UnexpectedMessage("Join").is_fatal());

        assert!(!ProtocolError::StaleOwnership { net_id: 4 }.is_fatal());
        assert!(
            !ProtocolError::Serialization(SerializationError::UnknownTypeId(9)).is_fatal()
        );
    }

    #[test]
    fn test_crypto_errors_are_authentication_failures() {
        let err: ProtocolError = CryptoError::VerificationFailed.into();
        assert_eq!(err.kind(), ErrorKind::Authentication);
    }

    #[test]
    fn test_timeout_message() {
        assert_eq!(ProtocolError::Timeout.to_string(), "Server stopped responding.");
    }
}
