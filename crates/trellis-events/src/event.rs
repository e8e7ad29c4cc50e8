//! Event record and handler trait

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use trellis_core::Result;

/// A flat event record
///
/// Correlation fields are empty when not applicable. When an `Event` is used
/// as a subscription filter, an empty field or `"*"` matches any value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Event name, e.g. `source_delete`
    pub event: String,

    /// Owning user
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user: String,

    /// App id
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub app: String,

    /// Object (source) id
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub object: String,

    /// Originating plugin
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub plugin: String,

    /// Plugin-defined key
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key: String,

    /// Object type
    #[serde(default, rename = "type", skip_serializing_if = "String::is_empty")]
    pub event_type: String,

    /// Arbitrary payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Event {
    /// Create an event with only a name set
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            event: name.into(),
            ..Default::default()
        }
    }

    /// Set the user
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    /// Set the app
    pub fn app(mut self, app: impl Into<String>) -> Self {
        self.app = app.into();
        self
    }

    /// Set the object
    pub fn object(mut self, object: impl Into<String>) -> Self {
        self.object = object.into();
        self
    }

    /// Set the plugin
    pub fn plugin(mut self, plugin: impl Into<String>) -> Self {
        self.plugin = plugin.into();
        self
    }

    /// Set the key
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    /// Set the type
    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = event_type.into();
        self
    }

    /// Set the payload
    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Whether this event, used as a filter, matches `event`
    ///
    /// The event name is not compared; routing by name happens in the router.
    pub fn matches(&self, event: &Event) -> bool {
        field_matches(&self.user, &event.user)
            && field_matches(&self.app, &event.app)
            && field_matches(&self.object, &event.object)
            && field_matches(&self.plugin, &event.plugin)
            && field_matches(&self.key, &event.key)
            && field_matches(&self.event_type, &event.event_type)
    }

    /// Whether two filters select the same events, ignoring the name
    pub(crate) fn same_filter(&self, other: &Event) -> bool {
        self.user == other.user
            && self.app == other.app
            && self.object == other.object
            && self.plugin == other.plugin
            && self.key == other.key
            && self.event_type == other.event_type
    }
}

fn field_matches(filter: &str, value: &str) -> bool {
    filter.is_empty() || filter == "*" || filter == value
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.event)?;
        if !self.user.is_empty() {
            write!(f, " user={}", self.user)?;
        }
        if !self.object.is_empty() {
            write!(f, " object={}", self.object)?;
        }
        Ok(())
    }
}

/// Receives fired events
#[async_trait]
pub trait EventHandler: Send + Sync + fmt::Debug {
    /// Handle one event
    ///
    /// Errors are logged by the dispatcher and never reach the event source.
    async fn handle_event(&self, event: &Event) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_matches_any_value() {
        let filter = Event::new("app_create").app("*");
        assert!(filter.matches(&Event::new("app_create").app("foo")));
        assert!(filter.matches(&Event::new("app_create")));
    }

    #[test]
    fn test_exact_filter() {
        let filter = Event::new("app_create").app("foo");
        assert!(filter.matches(&Event::new("app_create").app("foo")));
        assert!(!filter.matches(&Event::new("app_create").app("bar")));
        assert!(!filter.matches(&Event::new("app_create")));
    }

    #[test]
    fn test_all_fields_must_match() {
        let filter = Event::new("*").user("alice").plugin("notify:inbox");
        assert!(filter.matches(
            &Event::new("source_create")
                .user("alice")
                .plugin("notify:inbox")
                .key("mail")
        ));
        assert!(!filter.matches(&Event::new("source_create").user("alice")));
    }

    #[test]
    fn test_serialized_field_names() {
        let evt = Event::new("source_delete")
            .user("alice")
            .event_type("timeseries");
        let json = serde_json::to_value(&evt).unwrap();
        assert_eq!(json["event"], "source_delete");
        assert_eq!(json["type"], "timeseries");
        assert!(json.get("app").is_none());
    }
}
