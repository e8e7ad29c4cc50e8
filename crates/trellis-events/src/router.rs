//! Event router with per-name and catch-all subscriptions

use crate::event::{Event, EventHandler};
use crate::multi::MultiHandler;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use trellis_core::{Error, Result};

/// Handlers sharing one field filter
#[derive(Debug)]
struct Subscription {
    filter: Event,
    handlers: MultiHandler,
}

#[derive(Debug, Default)]
struct Lists {
    by_name: HashMap<String, Vec<Subscription>>,
    catch_all: Vec<Subscription>,
}

impl Lists {
    fn list_mut(&mut self, name: &str) -> &mut Vec<Subscription> {
        if is_catch_all(name) {
            &mut self.catch_all
        } else {
            self.by_name.entry(name.to_string()).or_default()
        }
    }
}

fn is_catch_all(name: &str) -> bool {
    name.is_empty() || name == "*"
}

/// Routes fired events to matching subscribers
///
/// Subscriptions with an empty or `"*"` event name go into a single
/// catch-all list. Firing checks the list for the event's name and the
/// catch-all list. A router is itself an [`EventHandler`], so a plugin's
/// router can be attached to the global one.
#[derive(Debug, Default)]
pub struct Router {
    lists: RwLock<Lists>,
}

impl Router {
    /// Create an empty router
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `handler` to events matching `filter`
    ///
    /// Subscribing the same handler with the same filter twice is a no-op.
    pub fn subscribe(&self, filter: Event, handler: Arc<dyn EventHandler>) {
        let mut lists = self.lists.write();
        let list = lists.list_mut(&filter.event);

        match list.iter().find(|s| s.filter.same_filter(&filter)) {
            Some(sub) => sub.handlers.add_handler(handler),
            None => {
                let handlers = MultiHandler::new();
                handlers.add_handler(handler);
                debug!(event = %filter.event, "Subscription added");
                list.push(Subscription { filter, handlers });
            }
        }
    }

    /// Remove a previous subscription
    pub fn unsubscribe(&self, filter: &Event, handler: &Arc<dyn EventHandler>) -> Result<()> {
        let mut lists = self.lists.write();
        let name = filter.event.as_str();
        let list = lists.list_mut(name);

        let idx = list
            .iter()
            .position(|s| s.filter.same_filter(filter))
            .ok_or_else(|| Error::NotFound(format!("subscription to '{name}'")))?;

        list[idx].handlers.remove_handler(handler)?;
        if list[idx].handlers.is_empty() {
            list.remove(idx);
        }

        if !is_catch_all(name) && lists.by_name.get(name).is_some_and(Vec::is_empty) {
            lists.by_name.remove(name);
        }
        Ok(())
    }

    /// Remove every subscription of `handler`, whatever its filter
    pub fn unsubscribe_all(&self, handler: &Arc<dyn EventHandler>) {
        let mut lists = self.lists.write();
        let Lists { by_name, catch_all } = &mut *lists;
        for list in by_name.values_mut().chain(std::iter::once(catch_all)) {
            list.retain(|s| {
                let _ = s.handlers.remove_handler(handler);
                !s.handlers.is_empty()
            });
        }
        by_name.retain(|_, list| !list.is_empty());
    }

    /// Whether nothing is subscribed
    pub fn is_empty(&self) -> bool {
        let lists = self.lists.read();
        lists.catch_all.is_empty() && lists.by_name.values().all(Vec::is_empty)
    }

    /// Dispatch an event to every matching subscription without waiting
    pub fn fire(&self, event: Event) {
        let event = Arc::new(event);
        let lists = self.lists.read();

        let named = lists.by_name.get(&event.event).into_iter().flatten();
        for sub in named.chain(lists.catch_all.iter()) {
            if sub.filter.matches(&event) {
                sub.handlers.fire(&event);
            }
        }
    }
}

#[async_trait]
impl EventHandler for Router {
    async fn handle_event(&self, event: &Event) -> Result<()> {
        self.fire(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[derive(Debug)]
    struct Recorder(mpsc::UnboundedSender<Event>);

    #[async_trait]
    impl EventHandler for Recorder {
        async fn handle_event(&self, event: &Event) -> Result<()> {
            let _ = self.0.send(event.clone());
            Ok(())
        }
    }

    fn recorder() -> (Arc<dyn EventHandler>, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Recorder(tx)), rx)
    }

    async fn assert_silent(rx: &mut mpsc::UnboundedReceiver<Event>) {
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_named_and_catch_all() {
        let router = Router::new();
        let (named, mut named_rx) = recorder();
        let (all, mut all_rx) = recorder();

        router.subscribe(Event::new("user_create"), named);
        router.subscribe(Event::new("*"), all);

        router.fire(Event::new("user_create").user("alice"));
        assert_eq!(named_rx.recv().await.unwrap().user, "alice");
        assert_eq!(all_rx.recv().await.unwrap().event, "user_create");

        router.fire(Event::new("app_delete"));
        assert_eq!(all_rx.recv().await.unwrap().event, "app_delete");
        assert_silent(&mut named_rx).await;
    }

    #[tokio::test]
    async fn test_field_filters() {
        let router = Router::new();
        let (handler, mut rx) = recorder();
        router.subscribe(Event::new("app_update").app("foo"), handler);

        router.fire(Event::new("app_update").app("bar"));
        router.fire(Event::new("app_update"));
        assert_silent(&mut rx).await;

        router.fire(Event::new("app_update").app("foo"));
        assert_eq!(rx.recv().await.unwrap().app, "foo");
    }

    #[tokio::test]
    async fn test_unsubscribe_all_empties_router() {
        let router = Router::new();
        let (handler, _rx) = recorder();
        assert!(router.is_empty());

        router.subscribe(Event::new("*"), Arc::clone(&handler));
        router.subscribe(Event::new("app_create").app("foo"), Arc::clone(&handler));
        assert!(!router.is_empty());

        router.unsubscribe_all(&handler);
        assert!(router.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_subscription_fires_once() {
        let router = Router::new();
        let (handler, mut rx) = recorder();
        router.subscribe(Event::new("user_create").user("*"), Arc::clone(&handler));
        router.subscribe(Event::new("user_create").user("*"), Arc::clone(&handler));

        router.fire(Event::new("user_create").user("bob"));
        assert!(rx.recv().await.is_some());
        assert_silent(&mut rx).await;
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let router = Router::new();
        let (handler, mut rx) = recorder();
        let filter = Event::new("source_delete").user("alice");
        router.subscribe(filter.clone(), Arc::clone(&handler));

        router.unsubscribe(&filter, &handler).unwrap();
        assert!(router.unsubscribe(&filter, &handler).is_err());

        router.fire(Event::new("source_delete").user("alice"));
        assert_silent(&mut rx).await;
    }

    #[tokio::test]
    async fn test_unsubscribe_catch_all_with_empty_name() {
        let router = Router::new();
        let (handler, _rx) = recorder();
        router.subscribe(Event::new("*").plugin("notify"), Arc::clone(&handler));

        // "" and "*" name the same catch-all list
        router
            .unsubscribe(&Event::new("").plugin("notify"), &handler)
            .unwrap();
    }

    #[tokio::test]
    async fn test_nested_router() {
        let global = Router::new();
        let plugin = Arc::new(Router::new());
        let (handler, mut rx) = recorder();
        plugin.subscribe(Event::new("user_delete").user("*"), handler);

        let attached: Arc<dyn EventHandler> = plugin.clone();
        global.subscribe(Event::new("*"), Arc::clone(&attached));

        global.fire(Event::new("user_delete").user("carol"));
        assert_eq!(rx.recv().await.unwrap().user, "carol");

        global.unsubscribe_all(&attached);
        global.fire(Event::new("user_delete").user("carol"));
        assert_silent(&mut rx).await;
    }
}
