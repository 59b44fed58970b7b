//! Wire types and frame codec for the CDP session core.
//!
//! This crate defines the common frame header, the additional-header TLVs,
//! and the connection-plane / control-plane message unions, together with
//! their big-endian binary codecs. Payload encryption lives in
//! `cdp-crypto`; the state machines that consume these types live in
//! `cdp-core`.

#![forbid(unsafe_code)]

pub mod connection;
pub mod control;
pub mod error;
pub mod header;

pub use connection::{
    AuthenticationPayload, ConnectRequest, ConnectResponse, ConnectionMessage, ConnectionType,
    HostEndpoint, UpgradeRequest, UpgradeResponse, CONNECT_RESULT_PENDING, CURVE_P256,
};
pub use control::{
    ControlMessage, ControlType, CHANNEL_RESPONSE_HEADER_TYPE, CHANNEL_RESPONSE_HEADER_VALUE,
};
pub use error::ProtoError;
pub use header::{
    compose_session_id, AdditionalHeader, CommonHeader, Frame, MessageKind, FLAG_ENCRYPTED,
    FRAME_SIGNATURE, SESSION_ID_HOST_FLAG,
};
