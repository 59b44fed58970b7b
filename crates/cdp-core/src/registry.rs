//! Session registry: resolves inbound frames to sessions.
//!
//! The registry is an explicit object owned by whatever drives the
//! transports, so several endpoints can coexist in one process and tests
//! stay hermetic. One mutex guards the map and the id counter; session
//! interior locking is separate.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use cdp_proto::{CommonHeader, Frame};

use crate::apps::AppRegistry;
use crate::errors::SessionError;
use crate::platform::PlatformHandler;
use crate::session::{RemoteDevice, Session};
use crate::transport::FrameSink;

/// First local session id handed out.
pub const FIRST_SESSION_ID: u32 = 0xE;

struct RegistryInner {
    sessions: HashMap<u32, Arc<Session>>,
    next_id: u32,
}

/// Allocate the next local session id: monotonic, never zero, never one
/// that is still in use.
fn next_session_id(next: &mut u32, in_use: &HashMap<u32, Arc<Session>>) -> u32 {
    loop {
        let id = *next;
        *next = match next.checked_add(1) {
            Some(n) => n,
            None => 1, // skip zero on wrap
        };
        if id != 0 && !in_use.contains_key(&id) {
            return id;
        }
    }
}

pub struct SessionRegistry {
    inner: Mutex<RegistryInner>,
    apps: Arc<AppRegistry>,
    platform: Arc<dyn PlatformHandler>,
    certificate: Option<Bytes>,
}

impl SessionRegistry {
    pub fn new(apps: Arc<AppRegistry>, platform: Arc<dyn PlatformHandler>) -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                sessions: HashMap::new(),
                next_id: FIRST_SESSION_ID,
            }),
            apps,
            platform,
            certificate: None,
        }
    }

    /// Device certificate handed to every new session's key material.
    pub fn with_certificate(mut self, certificate: impl Into<Bytes>) -> Self {
        self.certificate = Some(certificate.into());
        self
    }

    /// Single entry point for resolving a session from an inbound header.
    ///
    /// A zero local id is the wire sentinel for "no session yet": the peer
    /// is originating, so a fresh session is registered. Anything else must
    /// match an existing, undisposed session with the same remote id.
    pub async fn get_or_create(
        &self,
        device: RemoteDevice,
        header: &CommonHeader,
    ) -> Result<Arc<Session>, SessionError> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let local_id = header.local_session_id();
        if local_id == 0 {
            let id = next_session_id(&mut inner.next_id, &inner.sessions);
            let session = Session::new(
                id,
                header.remote_session_id(),
                device,
                self.certificate.clone(),
                self.apps.clone(),
                self.platform.clone(),
            )?;
            inner.sessions.insert(id, session.clone());
            debug!(session = id, remote = header.remote_session_id(), "session created");
            return Ok(session);
        }

        let session = inner
            .sessions
            .get(&local_id)
            .ok_or(SessionError::SessionNotFound(local_id))?;
        if session.is_disposed() {
            return Err(SessionError::SessionDisposed);
        }
        if session.remote_id() != header.remote_session_id() {
            return Err(SessionError::SessionMismatch {
                expected: session.remote_id(),
                got: header.remote_session_id(),
            });
        }
        Ok(session.clone())
    }

    /// Inbound data path: parse the frame, resolve the session, dispatch.
    /// Terminal errors dispose the session before surfacing.
    pub async fn handle_frame(
        &self,
        device: RemoteDevice,
        sink: &Arc<dyn FrameSink>,
        bytes: Bytes,
    ) -> Result<(), SessionError> {
        let frame = Frame::parse(bytes)?;
        let session = self.get_or_create(device, &frame.header).await?;
        match session.handle_frame(sink, frame).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_fatal() => {
                warn!(session = session.local_id(), error = %e, "fatal session error, disposing");
                self.dispose_session(&session).await;
                Err(e)
            }
            Err(e) => {
                warn!(session = session.local_id(), error = %e, "frame handling failed");
                Err(e)
            }
        }
    }

    /// Remove and dispose one session. In-flight tasks holding the session
    /// observe the disposed flag on their next interaction.
    pub async fn dispose_session(&self, session: &Arc<Session>) {
        self.inner.lock().await.sessions.remove(&session.local_id());
        session.dispose().await;
    }

    pub async fn get(&self, local_id: u32) -> Option<Arc<Session>> {
        self.inner.lock().await.sessions.get(&local_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.sessions.is_empty()
    }

    /// Dispose every session, releasing all channels and reassemblies.
    pub async fn shutdown(&self) {
        let sessions: Vec<_> = {
            let mut inner = self.inner.lock().await;
            inner.sessions.drain().map(|(_, s)| s).collect()
        };
        for session in sessions {
            session.dispose().await;
        }
    }
}
