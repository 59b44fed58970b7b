//! Logical in-session channels and their registry.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use tracing::debug;

use crate::apps::AppHandler;
use crate::session::Session;
use crate::transport::FrameSink;

/// One logical channel: an application instance bound to a session and the
/// socket currently backing it. The session owns the channel; the channel
/// only holds a non-owning reference back.
pub struct Channel {
    id: u64,
    app: Arc<dyn AppHandler>,
    sink: Arc<dyn FrameSink>,
    session: Weak<Session>,
}

impl Channel {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn sink(&self) -> &Arc<dyn FrameSink> {
        &self.sink
    }

    /// Owning session, if it is still alive.
    pub fn session(&self) -> Option<Arc<Session>> {
        self.session.upgrade()
    }

    /// Hand one reassembled message to the application.
    pub async fn deliver(&self, payload: Bytes) -> anyhow::Result<()> {
        self.app.handle_message(self.id, payload).await
    }
}

/// Per-session channel table. Ids are 1-based and strictly increasing;
/// an id is never reused within a session. Guarded by the session's
/// channel mutex.
pub struct ChannelRegistry {
    channels: BTreeMap<u64, Arc<Channel>>,
    next_id: u64,
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self { channels: BTreeMap::new(), next_id: 1 }
    }

    /// Allocate the next channel id and insert the channel.
    pub fn start_channel(
        &mut self,
        app: Arc<dyn AppHandler>,
        sink: Arc<dyn FrameSink>,
        session: Weak<Session>,
    ) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.channels.insert(id, Arc::new(Channel { id, app, sink, session }));
        id
    }

    pub fn get(&self, id: u64) -> Option<Arc<Channel>> {
        self.channels.get(&id).cloned()
    }

    pub fn unregister(&mut self, id: u64) -> Option<Arc<Channel>> {
        let removed = self.channels.remove(&id);
        if removed.is_some() {
            debug!(channel_id = id, "channel unregistered");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Remove every channel, in insertion order (ids are monotonic, so key
    /// order is insertion order).
    pub fn drain(&mut self) -> Vec<Arc<Channel>> {
        let drained: Vec<_> = std::mem::take(&mut self.channels).into_values().collect();
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct NullApp;

    #[async_trait]
    impl crate::apps::AppHandler for NullApp {
        async fn handle_message(&self, _channel_id: u64, _payload: Bytes) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct NullSink;

    #[async_trait]
    impl FrameSink for NullSink {
        async fn send(&self, _frame: Bytes) -> Result<(), crate::transport::TransportError> {
            Ok(())
        }
    }

    fn start(registry: &mut ChannelRegistry) -> u64 {
        registry.start_channel(Arc::new(NullApp), Arc::new(NullSink), Weak::new())
    }

    #[test]
    fn test_ids_start_at_one_and_increase() {
        let mut registry = ChannelRegistry::new();
        assert_eq!(start(&mut registry), 1);
        assert_eq!(start(&mut registry), 2);
        assert_eq!(start(&mut registry), 3);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_ids_never_reused() {
        let mut registry = ChannelRegistry::new();
        let first = start(&mut registry);
        registry.unregister(first);
        let second = start(&mut registry);
        assert!(second > first);
    }

    #[test]
    fn test_get_and_unregister() {
        let mut registry = ChannelRegistry::new();
        let id = start(&mut registry);
        assert!(registry.get(id).is_some());
        assert!(registry.unregister(id).is_some());
        assert!(registry.get(id).is_none());
        assert!(registry.unregister(id).is_none());
    }

    #[test]
    fn test_drain_in_insertion_order() {
        let mut registry = ChannelRegistry::new();
        let a = start(&mut registry);
        let b = start(&mut registry);
        let c = start(&mut registry);
        let drained = registry.drain();
        assert_eq!(drained.iter().map(|ch| ch.id()).collect::<Vec<_>>(), vec![a, b, c]);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_dead_session_back_reference() {
        let mut registry = ChannelRegistry::new();
        let id = start(&mut registry);
        let channel = registry.get(id).unwrap();
        assert!(channel.session().is_none());
    }
}
