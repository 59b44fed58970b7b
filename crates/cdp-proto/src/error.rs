use thiserror::Error;

/// Errors produced while encoding or decoding wire structures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtoError {
    #[error("buffer too short: need {need} bytes, have {have}")]
    BufferTooShort { need: usize, have: usize },

    #[error("bad frame signature: {0:#06x}")]
    BadSignature(u16),

    #[error("unknown connection message type: {0}")]
    UnknownConnectionType(u8),

    #[error("unknown control message type: {0}")]
    UnknownControlType(u8),

    #[error("additional header overruns the frame")]
    AdditionalHeaderOverrun,

    #[error("invalid field: {0}")]
    InvalidField(&'static str),
}

pub type Result<T> = std::result::Result<T, ProtoError>;
