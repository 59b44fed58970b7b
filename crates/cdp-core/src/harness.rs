//! Test harness: a scripted peer that drives the session core from the
//! other side of the wire, plus in-memory collaborators for tests.

use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use bytes::Bytes;

use cdp_crypto::{
    auth_thumbprint, derive_shared_secret, Cryptor, EncryptionInfo, DEFAULT_HMAC_SIZE,
};
use cdp_proto::{
    compose_session_id, AuthenticationPayload, CommonHeader, ConnectRequest, ConnectResponse,
    ConnectionMessage, ControlMessage, Frame, MessageKind, CURVE_P256,
};

use crate::apps::AppHandler;
use crate::session::{RemoteDevice, DEFAULT_MESSAGE_FRAGMENT_SIZE};
use crate::transport::{FrameSink, TransportError};

/// Frame sink that stores every outbound frame for inspection.
#[derive(Default)]
pub struct CollectSink {
    frames: StdMutex<Vec<Bytes>>,
}

impl CollectSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return all captured frames.
    pub fn take_all(&self) -> Vec<Bytes> {
        std::mem::take(&mut *self.frames.lock().expect("sink lock"))
    }

    /// Remove and return the most recent frame.
    pub fn take_last(&self) -> Option<Bytes> {
        self.frames.lock().expect("sink lock").pop()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().expect("sink lock").is_empty()
    }
}

#[async_trait]
impl FrameSink for CollectSink {
    async fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        self.frames.lock().expect("sink lock").push(frame);
        Ok(())
    }
}

/// App handler that records every delivered message.
#[derive(Default)]
pub struct RecordingApp {
    received: StdMutex<Vec<(u64, Bytes)>>,
}

impl RecordingApp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn received(&self) -> Vec<(u64, Bytes)> {
        self.received.lock().expect("app lock").clone()
    }
}

#[async_trait]
impl AppHandler for RecordingApp {
    async fn handle_message(&self, channel_id: u64, payload: Bytes) -> anyhow::Result<()> {
        self.received.lock().expect("app lock").push((channel_id, payload));
        Ok(())
    }
}

/// App handler that always fails; the session must survive it.
pub struct FailingApp;

#[async_trait]
impl AppHandler for FailingApp {
    async fn handle_message(&self, _channel_id: u64, _payload: Bytes) -> anyhow::Result<()> {
        anyhow::bail!("handler failure")
    }
}

pub fn test_device() -> RemoteDevice {
    RemoteDevice { name: "scripted-peer".into(), address: "aa:bb:cc:dd:ee:ff".into() }
}

/// The client side of the wire, driven directly from tests: builds request
/// frames, completes the handshake, and decrypts replies.
pub struct ScriptedPeer {
    pub encryption: EncryptionInfo,
    pub cryptor: Option<Arc<Cryptor>>,
    /// Id this peer assigned for the session (low half on the wire).
    pub peer_session_id: u32,
    /// Id the responding endpoint assigned, learned from ConnectResponse.
    pub host_session_id: u32,
    /// Nonce the responding endpoint advertised in ConnectResponse.
    pub host_nonce: u64,
    next_sequence: u32,
}

impl ScriptedPeer {
    pub fn new(peer_session_id: u32) -> Self {
        let encryption = EncryptionInfo::create()
            .expect("rng")
            .with_certificate(Bytes::from_static(b"scripted peer certificate"));
        Self {
            encryption,
            cryptor: None,
            peer_session_id,
            host_session_id: 0,
            host_nonce: 0,
            next_sequence: 0,
        }
    }

    fn next_seq(&mut self) -> u32 {
        self.next_sequence += 1;
        self.next_sequence
    }

    fn base_header(&mut self, kind: MessageKind) -> CommonHeader {
        let mut header = CommonHeader::new(kind);
        header.session_id =
            compose_session_id(self.host_session_id, self.peer_session_id, false);
        header.sequence_number = self.next_seq();
        header
    }

    fn cryptor(&self) -> &Arc<Cryptor> {
        self.cryptor.as_ref().expect("handshake not completed")
    }

    /// Unencrypted opening frame carrying this peer's key material.
    pub fn connect_request(&mut self) -> Bytes {
        let header = self.base_header(MessageKind::Connect);
        let body = ConnectionMessage::ConnectRequest(ConnectRequest {
            curve_type: CURVE_P256,
            hmac_size: DEFAULT_HMAC_SIZE,
            nonce: self.encryption.nonce,
            message_fragment_size: DEFAULT_MESSAGE_FRAGMENT_SIZE,
            x: Bytes::copy_from_slice(&self.encryption.public_x()),
            y: Bytes::copy_from_slice(&self.encryption.public_y()),
        })
        .encode();
        Frame::encode_plain(header, &body)
    }

    /// Consume the ConnectResponse: learn the host's session id and nonce,
    /// derive the shared secret and install the cryptor.
    pub fn complete_connect(&mut self, reply: Bytes) -> ConnectResponse {
        let frame = Frame::parse(reply).expect("parse connect response");
        assert!(!frame.header.is_encrypted(), "connect response must travel in the clear");
        self.host_session_id = frame.header.local_session_id();

        let mut payload = frame.payload.clone();
        let message = ConnectionMessage::decode(&mut payload).expect("decode connect response");
        let ConnectionMessage::ConnectResponse(response) = message else {
            panic!("expected connect response, got {message:?}");
        };

        let host = EncryptionInfo::from_remote(&response.x, &response.y, response.nonce)
            .expect("host public key");
        let secret =
            derive_shared_secret(&self.encryption, &host, false).expect("shared secret");
        self.cryptor =
            Some(Arc::new(Cryptor::new(&secret, response.hmac_size).expect("cryptor")));
        self.host_nonce = response.nonce;
        response
    }

    /// Encrypted connection-plane frame.
    pub fn connection_frame(&mut self, message: ConnectionMessage) -> Bytes {
        let mut header = self.base_header(MessageKind::Connect);
        let body = message.encode();
        self.cryptor().seal(&mut header, &body)
    }

    fn auth_payload(&self) -> AuthenticationPayload {
        let certificate = self.encryption.certificate_bytes();
        let thumbprint =
            auth_thumbprint(&certificate, self.host_nonce, self.encryption.nonce);
        AuthenticationPayload { certificate, thumbprint }
    }

    /// Device auth request with a valid thumbprint over both nonces.
    pub fn device_auth_request(&mut self) -> Bytes {
        let payload = self.auth_payload();
        self.connection_frame(ConnectionMessage::DeviceAuthRequest(payload))
    }

    /// Device auth request with a deliberately wrong thumbprint.
    pub fn device_auth_request_bad(&mut self) -> Bytes {
        let mut payload = self.auth_payload();
        payload.thumbprint = [0xAB; 32];
        self.connection_frame(ConnectionMessage::DeviceAuthRequest(payload))
    }

    pub fn user_auth_request(&mut self) -> Bytes {
        let payload = self.auth_payload();
        self.connection_frame(ConnectionMessage::UserDeviceAuthRequest(payload))
    }

    pub fn auth_done_request(&mut self) -> Bytes {
        self.connection_frame(ConnectionMessage::AuthDoneRequest)
    }

    /// Encrypted StartChannelRequest with the given request id.
    pub fn start_channel_request(
        &mut self,
        request_id: u64,
        app_id: &str,
        app_name: &str,
    ) -> Bytes {
        let mut header = self.base_header(MessageKind::Control);
        header.request_id = request_id;
        let body = ControlMessage::StartChannelRequest {
            app_id: app_id.into(),
            app_name: app_name.into(),
        }
        .encode();
        self.cryptor().seal(&mut header, &body)
    }

    /// One session-plane message split into `chunks` fragments sharing a
    /// sequence number.
    pub fn session_message(&mut self, channel_id: u64, chunks: &[&[u8]]) -> Vec<Bytes> {
        let sequence = self.next_seq();
        let count = chunks.len() as u16;
        chunks
            .iter()
            .enumerate()
            .map(|(index, chunk)| {
                let mut header = CommonHeader::new(MessageKind::Session);
                header.session_id =
                    compose_session_id(self.host_session_id, self.peer_session_id, false);
                header.sequence_number = sequence;
                header.fragment_index = index as u16;
                header.fragment_count = count;
                header.channel_id = channel_id;
                self.cryptor().seal(&mut header, chunk)
            })
            .collect()
    }

    /// Arbitrary encrypted frame addressed to a chosen host session id.
    pub fn frame_for_session(&mut self, host_session_id: u32) -> Bytes {
        let mut header = self.base_header(MessageKind::Connect);
        header.session_id = compose_session_id(host_session_id, self.peer_session_id, false);
        let body = ConnectionMessage::AuthDoneRequest.encode();
        self.cryptor().seal(&mut header, &body)
    }

    /// Decrypt one reply frame.
    pub fn open(&self, frame_bytes: Bytes) -> (CommonHeader, Bytes) {
        let frame = Frame::parse(frame_bytes).expect("parse reply");
        let plaintext = self.cryptor().open(&frame).expect("decrypt reply");
        (frame.header, Bytes::from(plaintext))
    }

    pub fn open_connection(&self, frame_bytes: Bytes) -> (CommonHeader, ConnectionMessage) {
        let (header, mut payload) = self.open(frame_bytes);
        let message = ConnectionMessage::decode(&mut payload).expect("decode reply");
        (header, message)
    }

    /// Decrypt and parse a channel reply (bare body, no control header).
    pub fn open_control(&self, frame_bytes: Bytes) -> (CommonHeader, ControlMessage) {
        let (header, mut payload) = self.open(frame_bytes);
        let message = ControlMessage::decode_response(&mut payload).expect("decode reply");
        (header, message)
    }
}
