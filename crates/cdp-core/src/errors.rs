//! Error types for the session core.

use thiserror::Error;

use crate::transport::TransportError;
use cdp_crypto::{CryptorError, KeyAgreementError};
use cdp_proto::ProtoError;

#[derive(Debug, Error)]
pub enum SessionError {
    /// Frame addressed to a local session id that is not registered.
    #[error("session not found: {0:#x}")]
    SessionNotFound(u32),

    /// Frame whose remote session id disagrees with the registered value.
    #[error("session id mismatch: expected {expected:#x}, got {got:#x}")]
    SessionMismatch { expected: u32, got: u32 },

    #[error("session disposed")]
    SessionDisposed,

    /// Protocol violation. After cryptor activation an unexpected message
    /// implies either a bug or tampering, so this surfaces as a security
    /// fault rather than being silently dropped.
    #[error("unexpected message: {0}")]
    UnexpectedMessage(&'static str),

    /// HMAC verification failure. Terminal for the session.
    #[error("payload integrity check failed")]
    CryptoIntegrity,

    /// Authentication thumbprint mismatch. Terminal for the session.
    #[error("authentication thumbprint mismatch")]
    InvalidThumbprint,

    /// Fragment outside the declared message bounds; the partial message is
    /// dropped, the session stays alive.
    #[error("fragment outside declared message bounds")]
    ReassemblyOverflow,

    #[error("no channel with id {0}")]
    ChannelNotFound(u64),

    #[error("no app registered for ({id}, {name})")]
    UnknownApp { id: String, name: String },

    #[error("frame decode failed: {0}")]
    Proto(#[from] ProtoError),

    #[error("key agreement failed: {0}")]
    KeyAgreement(#[from] KeyAgreementError),

    #[error("crypto failure: {0}")]
    Crypto(CryptorError),

    #[error("transport send failed: {0}")]
    Transport(#[from] TransportError),
}

impl SessionError {
    /// Terminal errors dispose the session; everything else aborts only the
    /// current frame.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::CryptoIntegrity | Self::InvalidThumbprint)
    }
}

impl From<CryptorError> for SessionError {
    fn from(e: CryptorError) -> Self {
        match e {
            CryptorError::Integrity => Self::CryptoIntegrity,
            other => Self::Crypto(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(SessionError::CryptoIntegrity.is_fatal());
        assert!(SessionError::InvalidThumbprint.is_fatal());
        assert!(!SessionError::SessionNotFound(1).is_fatal());
        assert!(!SessionError::ReassemblyOverflow.is_fatal());
        assert!(!SessionError::UnexpectedMessage("test").is_fatal());
    }

    #[test]
    fn test_integrity_error_maps_to_fatal_kind() {
        let e = SessionError::from(CryptorError::Integrity);
        assert!(matches!(e, SessionError::CryptoIntegrity));
        let e = SessionError::from(CryptorError::Decrypt);
        assert!(matches!(e, SessionError::Crypto(CryptorError::Decrypt)));
    }
}
