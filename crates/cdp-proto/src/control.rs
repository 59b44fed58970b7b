//! Control-plane messages: channel open.
//!
//! Inbound control payloads start with a one-byte `ControlHeader` whose
//! message type selects the body. The channel reply travels as a bare
//! `status: u8 || channel_id: u64` body with no control header.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::connection::{get_lpstring, put_lpstring};
use crate::error::{ProtoError, Result};

/// Additional header attached to every StartChannelResponse. Carried
/// verbatim; the value has no documented meaning.
pub const CHANNEL_RESPONSE_HEADER_TYPE: u8 = 129;
pub const CHANNEL_RESPONSE_HEADER_VALUE: [u8; 4] = [0x30, 0x00, 0x00, 0x01];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ControlType {
    StartChannelRequest = 0,
    StartChannelResponse = 1,
}

impl ControlType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::StartChannelRequest),
            1 => Some(Self::StartChannelResponse),
            _ => None,
        }
    }
}

/// Control-plane message union.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlMessage {
    StartChannelRequest { app_id: String, app_name: String },
    StartChannelResponse { status: u8, channel_id: u64 },
}

impl ControlMessage {
    pub fn control_type(&self) -> ControlType {
        match self {
            Self::StartChannelRequest { .. } => ControlType::StartChannelRequest,
            Self::StartChannelResponse { .. } => ControlType::StartChannelResponse,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(32);
        match self {
            Self::StartChannelRequest { app_id, app_name } => {
                buf.put_u8(ControlType::StartChannelRequest as u8);
                put_lpstring(&mut buf, app_id);
                put_lpstring(&mut buf, app_name);
            }
            // the reply body carries no control header
            Self::StartChannelResponse { status, channel_id } => {
                buf.put_u8(*status);
                buf.put_u64(*channel_id);
            }
        }
        buf.freeze()
    }

    /// Decode an inbound control payload by its `ControlHeader`. Only
    /// requests travel this path; replies are parsed with
    /// [`ControlMessage::decode_response`].
    pub fn decode(buf: &mut Bytes) -> Result<Self> {
        if buf.is_empty() {
            return Err(ProtoError::BufferTooShort { need: 1, have: 0 });
        }
        let raw = buf.get_u8();
        match ControlType::from_u8(raw) {
            Some(ControlType::StartChannelRequest) => {
                let app_id = get_lpstring(buf)?;
                let app_name = get_lpstring(buf)?;
                Ok(Self::StartChannelRequest { app_id, app_name })
            }
            _ => Err(ProtoError::UnknownControlType(raw)),
        }
    }

    /// Decode a channel reply body: bare `status || channel_id`.
    pub fn decode_response(buf: &mut Bytes) -> Result<Self> {
        if buf.len() < 9 {
            return Err(ProtoError::BufferTooShort { need: 9, have: buf.len() });
        }
        let status = buf.get_u8();
        let channel_id = buf.get_u64();
        Ok(Self::StartChannelResponse { status, channel_id })
    }
}
