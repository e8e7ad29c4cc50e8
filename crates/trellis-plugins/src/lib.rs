//! # Trellis Plugins
//!
//! Orchestration of the active plugins:
//! - Ordered startup with rollback on failure and exact-reverse teardown
//! - The overlay chain: each route-bearing plugin sees a request before the
//!   plugins loaded earlier, with `X-Overlay: none|next` to skip ahead
//! - Forwarding of subscribed database events to plugin handlers
//! - Provisioning of plugin-declared apps and sources for every user

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod events;
pub mod manager;
pub mod mux;
pub mod plugin;

pub use events::PluginEventHandler;
pub use manager::{PluginManager, Status, USER_CREATE};
pub use mux::{PathPattern, PluginMux};
pub use plugin::Plugin;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::manager::{PluginManager, Status};
    pub use crate::plugin::Plugin;
}
