//! Application registration and the channel-handler capability.
//!
//! Channels carry one application's messages. The session core never
//! interprets those messages; it instantiates the app through a
//! registration lookup keyed by `(app_id, app_name)` and hands completed
//! session-plane messages to [`AppHandler::handle_message`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;
use tracing::debug;

/// One application instance bound to a channel.
#[async_trait]
pub trait AppHandler: Send + Sync {
    /// Called once per fully reassembled session-plane message. Runs on a
    /// task pool; may suspend freely. A failure releases the message but
    /// keeps the session and channel alive.
    async fn handle_message(&self, channel_id: u64, payload: Bytes) -> anyhow::Result<()>;
}

/// Produces a fresh app instance each time a channel is opened.
pub trait AppFactory: Send + Sync {
    fn create(&self) -> Arc<dyn AppHandler>;
}

impl<F> AppFactory for F
where
    F: Fn() -> Arc<dyn AppHandler> + Send + Sync,
{
    fn create(&self) -> Arc<dyn AppHandler> {
        self()
    }
}

/// Registration table mapping `(app_id, app_name)` to an app factory.
#[derive(Default)]
pub struct AppRegistry {
    factories: RwLock<HashMap<(String, String), Arc<dyn AppFactory>>>,
}

impl AppRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, app_id: &str, app_name: &str, factory: Arc<dyn AppFactory>) {
        let mut factories = self.factories.write().await;
        factories.insert((app_id.to_string(), app_name.to_string()), factory);
        debug!(app_id, app_name, "app registered");
    }

    pub async fn unregister(&self, app_id: &str, app_name: &str) {
        let mut factories = self.factories.write().await;
        factories.remove(&(app_id.to_string(), app_name.to_string()));
        debug!(app_id, app_name, "app unregistered");
    }

    /// Instantiate the app registered under `(app_id, app_name)`.
    pub async fn create(&self, app_id: &str, app_name: &str) -> Option<Arc<dyn AppHandler>> {
        let factories = self.factories.read().await;
        factories
            .get(&(app_id.to_string(), app_name.to_string()))
            .map(|f| f.create())
    }

    pub async fn is_registered(&self, app_id: &str, app_name: &str) -> bool {
        let factories = self.factories.read().await;
        factories.contains_key(&(app_id.to_string(), app_name.to_string()))
    }
}
