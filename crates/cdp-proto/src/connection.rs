//! Connection-plane messages.
//!
//! Every connection-plane payload starts with a two-byte connection header
//! `{ message_type: u8, connection_mode: u8 }`; the message type selects the
//! body that follows. Decoding produces the exhaustive [`ConnectionMessage`]
//! union so dispatch can match on variants instead of raw bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ProtoError, Result};

/// Curve identifier carried in ConnectRequest/Response. Only P-256 is
/// defined.
pub const CURVE_P256: u8 = 0;

/// ConnectResponse result code: handshake accepted, authentication pending.
pub const CONNECT_RESULT_PENDING: u8 = 0;

/// Connection sub-protocol message types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionType {
    ConnectRequest = 0,
    ConnectResponse = 1,
    DeviceAuthRequest = 2,
    DeviceAuthResponse = 3,
    UserDeviceAuthRequest = 4,
    UserDeviceAuthResponse = 5,
    AuthDoneRequest = 6,
    AuthDoneResponse = 7,
    UpgradeRequest = 9,
    UpgradeResponse = 10,
    UpgradeFinalization = 11,
    UpgradeFinalizationResponse = 12,
    TransportRequest = 13,
    TransportConfirmation = 14,
    UpgradeFailure = 15,
    DeviceInfoMessage = 16,
    DeviceInfoResponseMessage = 17,
}

impl ConnectionType {
    pub fn from_u8(v: u8) -> Option<Self> {
        use ConnectionType::*;
        Some(match v {
            0 => ConnectRequest,
            1 => ConnectResponse,
            2 => DeviceAuthRequest,
            3 => DeviceAuthResponse,
            4 => UserDeviceAuthRequest,
            5 => UserDeviceAuthResponse,
            6 => AuthDoneRequest,
            7 => AuthDoneResponse,
            9 => UpgradeRequest,
            10 => UpgradeResponse,
            11 => UpgradeFinalization,
            12 => UpgradeFinalizationResponse,
            13 => TransportRequest,
            14 => TransportConfirmation,
            15 => UpgradeFailure,
            16 => DeviceInfoMessage,
            17 => DeviceInfoResponseMessage,
            _ => return None,
        })
    }
}

/// Opening of an ECDH handshake: the peer's public key coordinates, its
/// nonce, and the cryptor parameters it wants to use.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectRequest {
    pub curve_type: u8,
    pub hmac_size: u16,
    pub nonce: u64,
    pub message_fragment_size: u32,
    pub x: Bytes,
    pub y: Bytes,
}

/// Mirror of [`ConnectRequest`] carrying this endpoint's key material.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectResponse {
    pub result: u8,
    pub hmac_size: u16,
    pub nonce: u64,
    pub message_fragment_size: u32,
    pub x: Bytes,
    pub y: Bytes,
}

/// Certificate-backed authentication payload shared by the device and user
/// auth exchanges. The thumbprint binds the certificate to both session
/// nonces.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthenticationPayload {
    pub certificate: Bytes,
    pub thumbprint: [u8; 32],
}

/// One endpoint a peer can be reached at after a transport upgrade.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostEndpoint {
    pub kind: u16,
    pub host: String,
    pub port: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpgradeRequest {
    pub upgrade_id: [u8; 16],
    pub endpoints: Vec<u16>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpgradeResponse {
    pub endpoints: Vec<HostEndpoint>,
    pub transports: Vec<u16>,
}

/// Exhaustive connection-plane message union.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionMessage {
    ConnectRequest(ConnectRequest),
    ConnectResponse(ConnectResponse),
    DeviceAuthRequest(AuthenticationPayload),
    DeviceAuthResponse(AuthenticationPayload),
    UserDeviceAuthRequest(AuthenticationPayload),
    UserDeviceAuthResponse(AuthenticationPayload),
    AuthDoneRequest,
    AuthDoneResponse { status: u32 },
    UpgradeRequest(UpgradeRequest),
    UpgradeResponse(UpgradeResponse),
    UpgradeFinalization,
    UpgradeFinalizationResponse,
    TransportRequest { body: Bytes },
    TransportConfirmation { body: Bytes },
    UpgradeFailure { hresult: u32 },
    DeviceInfoMessage { info: Bytes },
    DeviceInfoResponseMessage,
}

impl ConnectionMessage {
    pub fn connection_type(&self) -> ConnectionType {
        use ConnectionMessage::*;
        match self {
            ConnectRequest(_) => ConnectionType::ConnectRequest,
            ConnectResponse(_) => ConnectionType::ConnectResponse,
            DeviceAuthRequest(_) => ConnectionType::DeviceAuthRequest,
            DeviceAuthResponse(_) => ConnectionType::DeviceAuthResponse,
            UserDeviceAuthRequest(_) => ConnectionType::UserDeviceAuthRequest,
            UserDeviceAuthResponse(_) => ConnectionType::UserDeviceAuthResponse,
            AuthDoneRequest => ConnectionType::AuthDoneRequest,
            AuthDoneResponse { .. } => ConnectionType::AuthDoneResponse,
            UpgradeRequest(_) => ConnectionType::UpgradeRequest,
            UpgradeResponse(_) => ConnectionType::UpgradeResponse,
            UpgradeFinalization => ConnectionType::UpgradeFinalization,
            UpgradeFinalizationResponse => ConnectionType::UpgradeFinalizationResponse,
            TransportRequest { .. } => ConnectionType::TransportRequest,
            TransportConfirmation { .. } => ConnectionType::TransportConfirmation,
            UpgradeFailure { .. } => ConnectionType::UpgradeFailure,
            DeviceInfoMessage { .. } => ConnectionType::DeviceInfoMessage,
            DeviceInfoResponseMessage => ConnectionType::DeviceInfoResponseMessage,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u8(self.connection_type() as u8);
        buf.put_u8(0); // connection mode: proximal
        use ConnectionMessage::*;
        match self {
            ConnectRequest(r) => {
                buf.put_u8(r.curve_type);
                buf.put_u16(r.hmac_size);
                buf.put_u64(r.nonce);
                buf.put_u32(r.message_fragment_size);
                put_lpbytes(&mut buf, &r.x);
                put_lpbytes(&mut buf, &r.y);
            }
            ConnectResponse(r) => {
                buf.put_u8(r.result);
                buf.put_u16(r.hmac_size);
                buf.put_u64(r.nonce);
                buf.put_u32(r.message_fragment_size);
                put_lpbytes(&mut buf, &r.x);
                put_lpbytes(&mut buf, &r.y);
            }
            DeviceAuthRequest(p)
            | DeviceAuthResponse(p)
            | UserDeviceAuthRequest(p)
            | UserDeviceAuthResponse(p) => {
                put_lpbytes(&mut buf, &p.certificate);
                buf.put_slice(&p.thumbprint);
            }
            AuthDoneRequest | UpgradeFinalization | UpgradeFinalizationResponse
            | DeviceInfoResponseMessage => {}
            AuthDoneResponse { status } => buf.put_u32(*status),
            UpgradeRequest(r) => {
                buf.put_slice(&r.upgrade_id);
                buf.put_u16(r.endpoints.len() as u16);
                for e in &r.endpoints {
                    buf.put_u16(*e);
                }
            }
            UpgradeResponse(r) => {
                buf.put_u16(r.endpoints.len() as u16);
                for e in &r.endpoints {
                    buf.put_u16(e.kind);
                    put_lpstring(&mut buf, &e.host);
                    put_lpstring(&mut buf, &e.port);
                }
                buf.put_u16(r.transports.len() as u16);
                for t in &r.transports {
                    buf.put_u16(*t);
                }
            }
            TransportRequest { body } | TransportConfirmation { body } => {
                put_lpbytes(&mut buf, body);
            }
            UpgradeFailure { hresult } => buf.put_u32(*hresult),
            DeviceInfoMessage { info } => put_lpbytes(&mut buf, info),
        }
        buf.freeze()
    }

    /// Decode one connection-plane message, advancing `buf` past it.
    pub fn decode(buf: &mut Bytes) -> Result<Self> {
        need(buf, 2)?;
        let raw = buf.get_u8();
        let kind = ConnectionType::from_u8(raw)
            .ok_or(ProtoError::UnknownConnectionType(raw))?;
        let _connection_mode = buf.get_u8();

        use ConnectionType as T;
        Ok(match kind {
            T::ConnectRequest => {
                need(buf, 1 + 2 + 8 + 4)?;
                let curve_type = buf.get_u8();
                let hmac_size = buf.get_u16();
                let nonce = buf.get_u64();
                let message_fragment_size = buf.get_u32();
                let x = get_lpbytes(buf)?;
                let y = get_lpbytes(buf)?;
                ConnectionMessage::ConnectRequest(ConnectRequest {
                    curve_type,
                    hmac_size,
                    nonce,
                    message_fragment_size,
                    x,
                    y,
                })
            }
            T::ConnectResponse => {
                need(buf, 1 + 2 + 8 + 4)?;
                let result = buf.get_u8();
                let hmac_size = buf.get_u16();
                let nonce = buf.get_u64();
                let message_fragment_size = buf.get_u32();
                let x = get_lpbytes(buf)?;
                let y = get_lpbytes(buf)?;
                ConnectionMessage::ConnectResponse(ConnectResponse {
                    result,
                    hmac_size,
                    nonce,
                    message_fragment_size,
                    x,
                    y,
                })
            }
            T::DeviceAuthRequest
            | T::DeviceAuthResponse
            | T::UserDeviceAuthRequest
            | T::UserDeviceAuthResponse => {
                let certificate = get_lpbytes(buf)?;
                need(buf, 32)?;
                let mut thumbprint = [0u8; 32];
                buf.copy_to_slice(&mut thumbprint);
                let payload = AuthenticationPayload { certificate, thumbprint };
                match kind {
                    T::DeviceAuthRequest => ConnectionMessage::DeviceAuthRequest(payload),
                    T::DeviceAuthResponse => ConnectionMessage::DeviceAuthResponse(payload),
                    T::UserDeviceAuthRequest => {
                        ConnectionMessage::UserDeviceAuthRequest(payload)
                    }
                    _ => ConnectionMessage::UserDeviceAuthResponse(payload),
                }
            }
            T::AuthDoneRequest => ConnectionMessage::AuthDoneRequest,
            T::AuthDoneResponse => {
                need(buf, 4)?;
                ConnectionMessage::AuthDoneResponse { status: buf.get_u32() }
            }
            T::UpgradeRequest => {
                need(buf, 16 + 2)?;
                let mut upgrade_id = [0u8; 16];
                buf.copy_to_slice(&mut upgrade_id);
                let count = buf.get_u16() as usize;
                need(buf, count * 2)?;
                let mut endpoints = Vec::with_capacity(count);
                for _ in 0..count {
                    endpoints.push(buf.get_u16());
                }
                ConnectionMessage::UpgradeRequest(UpgradeRequest { upgrade_id, endpoints })
            }
            T::UpgradeResponse => {
                need(buf, 2)?;
                let count = buf.get_u16() as usize;
                let mut endpoints = Vec::with_capacity(count);
                for _ in 0..count {
                    need(buf, 2)?;
                    let kind = buf.get_u16();
                    let host = get_lpstring(buf)?;
                    let port = get_lpstring(buf)?;
                    endpoints.push(HostEndpoint { kind, host, port });
                }
                need(buf, 2)?;
                let tcount = buf.get_u16() as usize;
                need(buf, tcount * 2)?;
                let mut transports = Vec::with_capacity(tcount);
                for _ in 0..tcount {
                    transports.push(buf.get_u16());
                }
                ConnectionMessage::UpgradeResponse(UpgradeResponse { endpoints, transports })
            }
            T::UpgradeFinalization => ConnectionMessage::UpgradeFinalization,
            T::UpgradeFinalizationResponse => ConnectionMessage::UpgradeFinalizationResponse,
            T::TransportRequest => {
                ConnectionMessage::TransportRequest { body: get_lpbytes(buf)? }
            }
            T::TransportConfirmation => {
                ConnectionMessage::TransportConfirmation { body: get_lpbytes(buf)? }
            }
            T::UpgradeFailure => {
                need(buf, 4)?;
                ConnectionMessage::UpgradeFailure { hresult: buf.get_u32() }
            }
            T::DeviceInfoMessage => {
                ConnectionMessage::DeviceInfoMessage { info: get_lpbytes(buf)? }
            }
            T::DeviceInfoResponseMessage => ConnectionMessage::DeviceInfoResponseMessage,
        })
    }
}

fn need(buf: &Bytes, n: usize) -> Result<()> {
    if buf.len() < n {
        return Err(ProtoError::BufferTooShort { need: n, have: buf.len() });
    }
    Ok(())
}

pub(crate) fn put_lpbytes(buf: &mut BytesMut, data: &[u8]) {
    debug_assert!(data.len() <= u16::MAX as usize);
    buf.put_u16(data.len() as u16);
    buf.put_slice(data);
}

pub(crate) fn get_lpbytes(buf: &mut Bytes) -> Result<Bytes> {
    need(buf, 2)?;
    let len = buf.get_u16() as usize;
    need(buf, len)?;
    Ok(buf.split_to(len))
}

pub(crate) fn put_lpstring(buf: &mut BytesMut, s: &str) {
    put_lpbytes(buf, s.as_bytes());
}

pub(crate) fn get_lpstring(buf: &mut Bytes) -> Result<String> {
    let raw = get_lpbytes(buf)?;
    String::from_utf8(raw.to_vec()).map_err(|_| ProtoError::InvalidField("utf-8 string"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: ConnectionMessage) {
        let mut bytes = msg.encode();
        let decoded = ConnectionMessage::decode(&mut bytes).unwrap();
        assert_eq!(msg, decoded);
        assert!(bytes.is_empty());
    }

    #[test]
    fn test_connect_request_round_trip() {
        round_trip(ConnectionMessage::ConnectRequest(ConnectRequest {
            curve_type: CURVE_P256,
            hmac_size: 32,
            nonce: 0x1111_2222_3333_4444,
            message_fragment_size: 16384,
            x: Bytes::from(vec![1u8; 32]),
            y: Bytes::from(vec![2u8; 32]),
        }));
    }

    #[test]
    fn test_connect_response_round_trip() {
        round_trip(ConnectionMessage::ConnectResponse(ConnectResponse {
            result: CONNECT_RESULT_PENDING,
            hmac_size: 32,
            nonce: 99,
            message_fragment_size: 16384,
            x: Bytes::from(vec![3u8; 32]),
            y: Bytes::from(vec![4u8; 32]),
        }));
    }

    #[test]
    fn test_auth_round_trip() {
        round_trip(ConnectionMessage::DeviceAuthRequest(AuthenticationPayload {
            certificate: Bytes::from_static(b"not a real cert"),
            thumbprint: [7u8; 32],
        }));
        round_trip(ConnectionMessage::UserDeviceAuthResponse(AuthenticationPayload {
            certificate: Bytes::new(),
            thumbprint: [0u8; 32],
        }));
    }

    #[test]
    fn test_empty_bodied_messages() {
        round_trip(ConnectionMessage::AuthDoneRequest);
        round_trip(ConnectionMessage::UpgradeFinalization);
        round_trip(ConnectionMessage::UpgradeFinalizationResponse);
        round_trip(ConnectionMessage::DeviceInfoResponseMessage);
    }

    #[test]
    fn test_upgrade_round_trip() {
        round_trip(ConnectionMessage::UpgradeRequest(UpgradeRequest {
            upgrade_id: [9u8; 16],
            endpoints: vec![1],
        }));
        round_trip(ConnectionMessage::UpgradeResponse(UpgradeResponse {
            endpoints: vec![HostEndpoint {
                kind: 2,
                host: "192.168.1.10".into(),
                port: "5040".into(),
            }],
            transports: vec![2],
        }));
        round_trip(ConnectionMessage::UpgradeFailure { hresult: 0x8000_4005 });
    }

    #[test]
    fn test_transport_echo_round_trip() {
        let body = Bytes::from_static(&[0xDE, 0xAD, 0xBE, 0xEF]);
        round_trip(ConnectionMessage::TransportRequest { body: body.clone() });
        round_trip(ConnectionMessage::TransportConfirmation { body });
    }

    #[test]
    fn test_device_info_round_trip() {
        round_trip(ConnectionMessage::DeviceInfoMessage {
            info: Bytes::from_static(b"{\"name\":\"desk\"}"),
        });
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut bytes = Bytes::from_static(&[8, 0]); // 8 is unassigned
        let result = ConnectionMessage::decode(&mut bytes);
        assert!(matches!(result, Err(ProtoError::UnknownConnectionType(8))));
    }

    #[test]
    fn test_truncated_body_rejected() {
        let msg = ConnectionMessage::ConnectRequest(ConnectRequest {
            curve_type: 0,
            hmac_size: 32,
            nonce: 1,
            message_fragment_size: 500,
            x: Bytes::from(vec![1u8; 32]),
            y: Bytes::from(vec![2u8; 32]),
        });
        let full = msg.encode();
        let mut cut = full.slice(..full.len() - 10);
        assert!(ConnectionMessage::decode(&mut cut).is_err());
    }
}
