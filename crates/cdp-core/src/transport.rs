//! Outbound frame sink and transport-upgrade constants.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// TCP port advertised for transport upgrades.
pub const UPGRADE_TCP_PORT: &str = "5040";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport disconnected")]
    Disconnected,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport error: {0}")]
    Other(String),
}

/// Transport kinds carried in upgrade messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Rfcomm = 1,
    Tcp = 2,
    Cloud = 3,
}

impl TransportKind {
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            1 => Some(Self::Rfcomm),
            2 => Some(Self::Tcp),
            3 => Some(Self::Cloud),
            _ => None,
        }
    }
}

/// Write half of whatever socket currently backs a session.
///
/// One call delivers one complete wire frame; implementations must not
/// interleave bytes from concurrent calls, which keeps every reply atomic
/// on the wire. The concrete socket I/O lives outside the session core.
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn send(&self, frame: Bytes) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_kind_round_trip() {
        for kind in [TransportKind::Rfcomm, TransportKind::Tcp, TransportKind::Cloud] {
            assert_eq!(TransportKind::from_u16(kind.as_u16()), Some(kind));
        }
        assert_eq!(TransportKind::from_u16(0), None);
        assert_eq!(TransportKind::from_u16(99), None);
    }
}
