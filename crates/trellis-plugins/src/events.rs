//! Forwarding of subscribed events to plugin handlers

use async_trait::async_trait;
use http::{HeaderMap, Method};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;
use trellis_bridge::{invoke, InvokeBody, InvokeOptions};
use trellis_core::{Error, Result, SharedHandler};
use trellis_events::{Event, EventHandler};
use trellis_runner::Manager;

/// POSTs each event it receives, as JSON, to a plugin-declared target
///
/// A `run://` target is resolved through the runner manager on every event,
/// so it follows the runner across restarts. Any other target is resolved
/// once and reused. Error bodies are read up to the configured request body
/// limit.
#[derive(Debug)]
pub struct PluginEventHandler {
    manager: Arc<Manager>,
    plugin: String,
    post: String,
    opts: InvokeOptions,
    resolved: Mutex<Option<SharedHandler>>,
}

impl PluginEventHandler {
    /// Forward events to `post` on behalf of `plugin`
    pub fn new(manager: Arc<Manager>, plugin: impl Into<String>, post: impl Into<String>) -> Self {
        let opts = InvokeOptions {
            max_error_body: manager.config().request_body_limit,
            buffer: manager.config().stream_buffer,
            verbose: manager.config().verbose,
        };
        Self {
            manager,
            plugin: plugin.into(),
            post: post.into(),
            opts,
            resolved: Mutex::new(None),
        }
    }

    /// Target events are posted to
    pub fn target(&self) -> &str {
        &self.post
    }

    fn handler(&self) -> Result<SharedHandler> {
        if self.post.starts_with("run://") {
            return self.manager.get_handler(&self.plugin, &self.post);
        }
        let mut resolved = self.resolved.lock();
        if let Some(handler) = resolved.as_ref() {
            return Ok(Arc::clone(handler));
        }
        let handler = self.handler()?;
        *resolved = Some(Arc::clone(&handler));
        Ok(handler)
    }
}

#[async_trait]
impl EventHandler for PluginEventHandler {
    async fn handle_event(&self, event: &Event) -> Result<()> {
        let handler = self.handler()?;

        debug!(plugin = %self.plugin, event = %event.event, target_url = %self.post, "Forwarding event");
        let res = invoke(
            handler,
            Method::POST,
            "/",
            InvokeBody::json(event)?,
            HeaderMap::new(),
            &self.opts,
        )
        .await?;
        // drain so the producer finishes
        res.body
            .bytes()
            .await
            .map_err(|e| Error::Upstream(format!("{}: {e}", self.post)))?;
        Ok(())
    }
}
