//! Concurrency-safe set of event handlers

use crate::event::{Event, EventHandler};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::warn;
use trellis_core::{Error, Result};

/// A set of handlers that all receive every fired event
///
/// Handlers are compared by identity, so adding the same `Arc` twice is a
/// no-op. Each handler runs in its own task on fire; a failing or panicking
/// handler does not affect the others.
#[derive(Debug, Default)]
pub struct MultiHandler {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

/// Whether two handler references point at the same handler instance
pub(crate) fn same_handler(a: &Arc<dyn EventHandler>, b: &Arc<dyn EventHandler>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

impl MultiHandler {
    /// Create an empty handler set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler. Adding a handler that is already present does nothing.
    pub fn add_handler(&self, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.write();
        if !handlers.iter().any(|h| same_handler(h, &handler)) {
            handlers.push(handler);
        }
    }

    /// Remove a handler
    pub fn remove_handler(&self, handler: &Arc<dyn EventHandler>) -> Result<()> {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|h| !same_handler(h, handler));
        if handlers.len() == before {
            return Err(Error::NotFound("event subscription".to_string()));
        }
        Ok(())
    }

    /// Number of handlers in the set
    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }

    /// Fan the event out to every handler without waiting for them
    pub fn fire(&self, event: &Arc<Event>) {
        let handlers = self.handlers.read().clone();
        if handlers.is_empty() {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(event = %event.event, "No async runtime available, dropping event");
            return;
        };

        for handler in handlers {
            let event = Arc::clone(event);
            runtime.spawn(async move {
                if let Err(e) = handler.handle_event(&event).await {
                    warn!(event = %event.event, handler = ?handler, error = %e, "Event handler failed");
                }
            });
        }
    }
}
