//! Session state machine.
//!
//! A session takes two endpoints from unauthenticated strangers to a
//! mutually authenticated, encrypted association: key agreement on the
//! first ConnectRequest, certificate-backed auth, then free control-plane
//! and session-plane traffic. The underlying socket may be swapped by the
//! transport manager at any time; the session only ever sees frame sinks.
//!
//! All inbound connect- and control-plane frames are serialized by the
//! per-session handshake mutex so reply-emitting handlers observe a
//! consistent state. Session-plane dispatch runs concurrently on spawned
//! tasks.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use cdp_crypto::{auth_thumbprint, derive_shared_secret, Cryptor, EncryptionInfo};
use cdp_proto::{
    AdditionalHeader, AuthenticationPayload, CommonHeader, ConnectResponse, ConnectionMessage,
    ControlMessage, Frame, HostEndpoint, MessageKind, ProtoError, UpgradeResponse,
    CHANNEL_RESPONSE_HEADER_TYPE, CHANNEL_RESPONSE_HEADER_VALUE, CONNECT_RESULT_PENDING,
    CURVE_P256,
};

use crate::apps::AppRegistry;
use crate::channel::ChannelRegistry;
use crate::errors::SessionError;
use crate::platform::PlatformHandler;
use crate::reassembly::ReassemblyTable;
use crate::transport::{FrameSink, TransportKind, UPGRADE_TCP_PORT};

/// Fragment size advertised in ConnectResponse.
pub const DEFAULT_MESSAGE_FRAGMENT_SIZE: u32 = 16 * 1024;

/// Handshake phase of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionPhase {
    /// Cryptor absent, remote key absent.
    AwaitingConnectRequest,
    /// Keys agreed, peer not yet authenticated.
    AwaitingAuth,
    /// Device authenticated; upgrade or auth-done flows may arrive.
    AwaitingUpgradeOrAuthDone,
    /// Fully established; control- and session-plane traffic flows freely.
    Established,
    /// Terminal.
    Disposed,
}

/// Descriptor of the peer this session talks to.
#[derive(Clone, Debug)]
pub struct RemoteDevice {
    pub name: String,
    pub address: String,
}

struct HandshakeState {
    phase: SessionPhase,
    remote_encryption: Option<EncryptionInfo>,
}

/// One session with a peer device.
pub struct Session {
    local_id: u32,
    remote_id: u32,
    is_host: bool,
    device: RemoteDevice,
    local_encryption: EncryptionInfo,
    cryptor: OnceLock<Arc<Cryptor>>,
    state: Mutex<HandshakeState>,
    reassembly: Mutex<ReassemblyTable>,
    channels: Mutex<ChannelRegistry>,
    apps: Arc<AppRegistry>,
    platform: Arc<dyn PlatformHandler>,
    next_sequence: AtomicU32,
    disposed: AtomicBool,
}

impl Session {
    pub(crate) fn new(
        local_id: u32,
        remote_id: u32,
        device: RemoteDevice,
        certificate: Option<Bytes>,
        apps: Arc<AppRegistry>,
        platform: Arc<dyn PlatformHandler>,
    ) -> Result<Arc<Self>, SessionError> {
        let mut local_encryption = EncryptionInfo::create()?;
        if let Some(cert) = certificate {
            local_encryption = local_encryption.with_certificate(cert);
        }
        Ok(Arc::new(Self {
            local_id,
            remote_id,
            is_host: true,
            device,
            local_encryption,
            cryptor: OnceLock::new(),
            state: Mutex::new(HandshakeState {
                phase: SessionPhase::AwaitingConnectRequest,
                remote_encryption: None,
            }),
            reassembly: Mutex::new(ReassemblyTable::new()),
            channels: Mutex::new(ChannelRegistry::new()),
            apps,
            platform,
            next_sequence: AtomicU32::new(0),
            disposed: AtomicBool::new(false),
        }))
    }

    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    pub fn remote_id(&self) -> u32 {
        self.remote_id
    }

    pub fn device(&self) -> &RemoteDevice {
        &self.device
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Set once during key agreement, immutable afterwards.
    pub fn cryptor(&self) -> Option<Arc<Cryptor>> {
        self.cryptor.get().cloned()
    }

    pub async fn phase(&self) -> SessionPhase {
        self.state.lock().await.phase
    }

    pub async fn channel_count(&self) -> usize {
        self.channels.lock().await.len()
    }

    pub async fn pending_reassemblies(&self) -> usize {
        self.reassembly.lock().await.len()
    }

    /// Next outbound sequence number. All fragments of one outbound message
    /// share the value returned by a single call.
    pub fn next_sequence_number(&self) -> u32 {
        self.next_sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Entry point for every inbound frame addressed to this session.
    pub async fn handle_frame(
        self: &Arc<Self>,
        sink: &Arc<dyn FrameSink>,
        frame: Frame,
    ) -> Result<(), SessionError> {
        if self.is_disposed() {
            return Err(SessionError::SessionDisposed);
        }
        match frame.header.kind() {
            Some(MessageKind::Connect) => self.handle_connect(sink, frame).await,
            Some(MessageKind::Control) => self.handle_control(sink, frame).await,
            Some(MessageKind::Session) => self.handle_session_plane(frame).await,
            Some(MessageKind::ReliabilityResponse) | None => {
                debug!(
                    session = self.local_id,
                    msg_type = frame.header.msg_type,
                    "dropping unhandled frame kind"
                );
                Ok(())
            }
        }
    }

    /// Past the ConnectResponse phase the payload region is always
    /// ciphertext; before that it is the raw stream.
    fn decrypt_payload(&self, frame: &Frame) -> Result<Bytes, SessionError> {
        match self.cryptor() {
            Some(cryptor) => Ok(Bytes::from(cryptor.open(frame)?)),
            None => Ok(frame.payload.clone()),
        }
    }

    // ------------------------------------------------------------------
    // Connect plane
    // ------------------------------------------------------------------

    async fn handle_connect(
        self: &Arc<Self>,
        sink: &Arc<dyn FrameSink>,
        frame: Frame,
    ) -> Result<(), SessionError> {
        let mut st = self.state.lock().await;
        let mut payload = self.decrypt_payload(&frame)?;
        let message = ConnectionMessage::decode(&mut payload)?;
        debug!(
            session = self.local_id,
            kind = ?message.connection_type(),
            phase = ?st.phase,
            "connect frame"
        );
        match message {
            ConnectionMessage::ConnectRequest(req) => {
                self.on_connect_request(&mut st, sink, &frame, req).await
            }
            ConnectionMessage::DeviceAuthRequest(payload) => {
                self.on_auth_request(&mut st, sink, &frame, payload, true).await
            }
            ConnectionMessage::UserDeviceAuthRequest(payload) => {
                self.on_auth_request(&mut st, sink, &frame, payload, false).await
            }
            ConnectionMessage::AuthDoneRequest => self.on_auth_done(&mut st, sink, &frame).await,
            ConnectionMessage::UpgradeRequest(req) => {
                if st.phase != SessionPhase::Established {
                    return Err(SessionError::UnexpectedMessage(
                        "upgrade request before session established",
                    ));
                }
                let response = ConnectionMessage::UpgradeResponse(UpgradeResponse {
                    endpoints: vec![HostEndpoint {
                        kind: TransportKind::Tcp.as_u16(),
                        host: self.platform.local_ip(),
                        port: UPGRADE_TCP_PORT.into(),
                    }],
                    transports: vec![TransportKind::Tcp.as_u16()],
                });
                info!(
                    session = self.local_id,
                    upgrade_id = %hex::encode(req.upgrade_id),
                    "transport upgrade requested"
                );
                self.send_connect_reply(sink, &frame.header, response, true).await
            }
            ConnectionMessage::UpgradeFinalization => {
                if st.phase != SessionPhase::Established {
                    return Err(SessionError::UnexpectedMessage(
                        "upgrade finalization before session established",
                    ));
                }
                // the socket swap itself is the transport manager's job
                self.send_connect_reply(
                    sink,
                    &frame.header,
                    ConnectionMessage::UpgradeFinalizationResponse,
                    true,
                )
                .await
            }
            ConnectionMessage::UpgradeFailure { hresult } => {
                if !matches!(
                    st.phase,
                    SessionPhase::AwaitingUpgradeOrAuthDone | SessionPhase::Established
                ) {
                    return Err(SessionError::UnexpectedMessage(
                        "upgrade failure before authentication",
                    ));
                }
                warn!(
                    session = self.local_id,
                    hresult = %hex::encode(hresult.to_be_bytes()),
                    "transport upgrade failed"
                );
                Ok(())
            }
            ConnectionMessage::TransportRequest { body } => {
                if st.phase != SessionPhase::Established {
                    return Err(SessionError::UnexpectedMessage(
                        "transport request before session established",
                    ));
                }
                self.send_connect_reply(
                    sink,
                    &frame.header,
                    ConnectionMessage::TransportConfirmation { body },
                    true,
                )
                .await
            }
            ConnectionMessage::DeviceInfoMessage { info } => {
                if st.phase != SessionPhase::Established {
                    return Err(SessionError::UnexpectedMessage(
                        "device info before session established",
                    ));
                }
                debug!(session = self.local_id, info_len = info.len(), "device info received");
                self.send_connect_reply(
                    sink,
                    &frame.header,
                    ConnectionMessage::DeviceInfoResponseMessage,
                    true,
                )
                .await
            }
            ConnectionMessage::ConnectResponse(_)
            | ConnectionMessage::DeviceAuthResponse(_)
            | ConnectionMessage::UserDeviceAuthResponse(_)
            | ConnectionMessage::AuthDoneResponse { .. }
            | ConnectionMessage::UpgradeResponse(_)
            | ConnectionMessage::UpgradeFinalizationResponse
            | ConnectionMessage::TransportConfirmation { .. }
            | ConnectionMessage::DeviceInfoResponseMessage => {
                Err(SessionError::UnexpectedMessage("unsolicited response message"))
            }
        }
    }

    async fn on_connect_request(
        &self,
        st: &mut HandshakeState,
        sink: &Arc<dyn FrameSink>,
        frame: &Frame,
        req: cdp_proto::ConnectRequest,
    ) -> Result<(), SessionError> {
        if st.phase != SessionPhase::AwaitingConnectRequest {
            // never re-key a live session
            return Err(SessionError::UnexpectedMessage("duplicate connect request"));
        }
        if req.curve_type != CURVE_P256 {
            return Err(SessionError::UnexpectedMessage("unsupported curve"));
        }

        let remote = EncryptionInfo::from_remote(&req.x, &req.y, req.nonce)?;
        let secret = derive_shared_secret(&self.local_encryption, &remote, self.is_host)?;
        let cryptor = Arc::new(Cryptor::new(&secret, req.hmac_size)?);
        self.cryptor
            .set(cryptor)
            .map_err(|_| SessionError::UnexpectedMessage("duplicate connect request"))?;
        st.remote_encryption = Some(remote);
        st.phase = SessionPhase::AwaitingAuth;

        let response = ConnectionMessage::ConnectResponse(ConnectResponse {
            result: CONNECT_RESULT_PENDING,
            hmac_size: req.hmac_size,
            nonce: self.local_encryption.nonce,
            message_fragment_size: DEFAULT_MESSAGE_FRAGMENT_SIZE,
            x: Bytes::copy_from_slice(&self.local_encryption.public_x()),
            y: Bytes::copy_from_slice(&self.local_encryption.public_y()),
        });
        // the response itself travels in the clear; everything after it is
        // encrypted
        self.send_connect_reply(sink, &frame.header, response, false).await?;
        info!(
            session = self.local_id,
            device = %self.device.name,
            "key agreement complete, awaiting authentication"
        );
        Ok(())
    }

    async fn on_auth_request(
        &self,
        st: &mut HandshakeState,
        sink: &Arc<dyn FrameSink>,
        frame: &Frame,
        payload: AuthenticationPayload,
        device_auth: bool,
    ) -> Result<(), SessionError> {
        if !matches!(
            st.phase,
            SessionPhase::AwaitingAuth
                | SessionPhase::AwaitingUpgradeOrAuthDone
                | SessionPhase::Established
        ) {
            return Err(SessionError::UnexpectedMessage("auth request before key agreement"));
        }
        let remote = st
            .remote_encryption
            .as_ref()
            .ok_or(SessionError::UnexpectedMessage("auth request before key agreement"))?;

        let (host_nonce, client_nonce) = if self.is_host {
            (self.local_encryption.nonce, remote.nonce)
        } else {
            (remote.nonce, self.local_encryption.nonce)
        };
        let expected = auth_thumbprint(&payload.certificate, host_nonce, client_nonce);
        if expected != payload.thumbprint {
            return Err(SessionError::InvalidThumbprint);
        }

        let certificate = self.local_encryption.certificate_bytes();
        let our_payload = AuthenticationPayload {
            thumbprint: auth_thumbprint(&certificate, host_nonce, client_nonce),
            certificate,
        };
        let response = if device_auth {
            ConnectionMessage::DeviceAuthResponse(our_payload)
        } else {
            ConnectionMessage::UserDeviceAuthResponse(our_payload)
        };
        self.send_connect_reply(sink, &frame.header, response, true).await?;

        if device_auth && st.phase == SessionPhase::AwaitingAuth {
            st.phase = SessionPhase::AwaitingUpgradeOrAuthDone;
        }
        info!(session = self.local_id, device_auth, "peer authenticated");
        Ok(())
    }

    async fn on_auth_done(
        &self,
        st: &mut HandshakeState,
        sink: &Arc<dyn FrameSink>,
        frame: &Frame,
    ) -> Result<(), SessionError> {
        if !matches!(
            st.phase,
            SessionPhase::AwaitingAuth | SessionPhase::AwaitingUpgradeOrAuthDone
        ) {
            return Err(SessionError::UnexpectedMessage("auth done out of order"));
        }
        self.send_connect_reply(
            sink,
            &frame.header,
            ConnectionMessage::AuthDoneResponse { status: 0 },
            true,
        )
        .await?;
        st.phase = SessionPhase::Established;
        info!(session = self.local_id, device = %self.device.name, "session established");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Control plane
    // ------------------------------------------------------------------

    async fn handle_control(
        self: &Arc<Self>,
        sink: &Arc<dyn FrameSink>,
        frame: Frame,
    ) -> Result<(), SessionError> {
        // serialized with the connect plane by the handshake mutex
        let st = self.state.lock().await;
        if st.phase != SessionPhase::Established {
            return Err(SessionError::UnexpectedMessage(
                "control frame before session established",
            ));
        }

        let mut payload = self.decrypt_payload(&frame)?;
        let message = match ControlMessage::decode(&mut payload) {
            Ok(message) => message,
            // any other control type has no inbound handler
            Err(ProtoError::UnknownControlType(_)) => {
                return Err(SessionError::UnexpectedMessage("unsupported control message"));
            }
            Err(e) => return Err(e.into()),
        };
        let ControlMessage::StartChannelRequest { app_id, app_name } = message else {
            return Err(SessionError::UnexpectedMessage("unsolicited channel response"));
        };

        let app = self.apps.create(&app_id, &app_name).await.ok_or_else(|| {
            SessionError::UnknownApp { id: app_id.clone(), name: app_name.clone() }
        })?;
        let channel_id = {
            let mut channels = self.channels.lock().await;
            channels.start_channel(app, sink.clone(), Arc::downgrade(self))
        };

        let mut header = self.reply_header(&frame.header, MessageKind::Control);
        header.additional_headers.clear();
        header.reply_to_id = frame.header.request_id;
        header.request_id = 0;
        header.additional_headers.push(AdditionalHeader::new(
            CHANNEL_RESPONSE_HEADER_TYPE,
            CHANNEL_RESPONSE_HEADER_VALUE.to_vec(),
        ));
        let body = ControlMessage::StartChannelResponse { status: 0, channel_id }.encode();
        self.send_encrypted(sink, header, &body).await?;
        info!(session = self.local_id, channel_id, app_id = %app_id, "channel opened");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Session plane
    // ------------------------------------------------------------------

    async fn handle_session_plane(self: &Arc<Self>, frame: Frame) -> Result<(), SessionError> {
        let cryptor = self
            .cryptor()
            .ok_or(SessionError::UnexpectedMessage("session frame before key agreement"))?;
        let plaintext = Bytes::from(cryptor.open(&frame)?);

        let assembled = {
            let mut table = self.reassembly.lock().await;
            table.insert_fragment(
                frame.header.sequence_number,
                frame.header.fragment_count,
                frame.header.fragment_index,
                plaintext,
            )?
        };
        let Some(message) = assembled else { return Ok(()) };

        let channel = { self.channels.lock().await.get(frame.header.channel_id) };
        let Some(channel) = channel else {
            // not session-fatal: drop the message, keep the session
            let e = SessionError::ChannelNotFound(frame.header.channel_id);
            warn!(session = self.local_id, error = %e, "dropping session-plane message");
            return Ok(());
        };

        // the dispatch task shares ownership of the session for its lifetime
        let session = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = channel.deliver(message).await {
                warn!(
                    session = session.local_id,
                    channel_id = channel.id(),
                    error = %e,
                    "channel handler failed"
                );
            }
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Replies and teardown
    // ------------------------------------------------------------------

    /// Outbound header for a reply: host-role bit corrected, our session id
    /// in the high half, a fresh sequence number, single fragment.
    fn reply_header(&self, incoming: &CommonHeader, kind: MessageKind) -> CommonHeader {
        let mut header = incoming.correct_client_session_bit();
        header.msg_type = kind as u8;
        header.session_id =
            (header.session_id & 0xFFFF_FFFF) | ((self.local_id as u64) << 32);
        header.sequence_number = self.next_sequence_number();
        header.fragment_index = 0;
        header.fragment_count = 1;
        header.payload_size = 0;
        header
    }

    async fn send_connect_reply(
        &self,
        sink: &Arc<dyn FrameSink>,
        incoming: &CommonHeader,
        message: ConnectionMessage,
        encrypted: bool,
    ) -> Result<(), SessionError> {
        let header = self.reply_header(incoming, MessageKind::Connect);
        let body = message.encode();
        if encrypted {
            self.send_encrypted(sink, header, &body).await
        } else {
            sink.send(Frame::encode_plain(header, &body)).await?;
            Ok(())
        }
    }

    async fn send_encrypted(
        &self,
        sink: &Arc<dyn FrameSink>,
        mut header: CommonHeader,
        body: &[u8],
    ) -> Result<(), SessionError> {
        let cryptor = self
            .cryptor()
            .ok_or(SessionError::UnexpectedMessage("encrypted send before key agreement"))?;
        let frame = cryptor.seal(&mut header, body);
        sink.send(frame).await?;
        Ok(())
    }

    /// Mark disposed and release every channel and pending reassembly.
    /// In-flight handler tasks observe `SessionDisposed` on their next
    /// interaction; they are not force-cancelled.
    pub(crate) async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut st = self.state.lock().await;
            st.phase = SessionPhase::Disposed;
        }
        let channels = { self.channels.lock().await.drain() };
        for channel in &channels {
            debug!(session = self.local_id, channel_id = channel.id(), "channel released");
        }
        self.reassembly.lock().await.clear();
        info!(session = self.local_id, device = %self.device.name, "session disposed");
    }
}
