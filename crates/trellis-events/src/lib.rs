//! # Trellis Events
//!
//! Publish/subscribe event routing for Trellis.
//!
//! ## Features
//!
//! - **Router**: per-event-name and catch-all subscription lists with
//!   wildcard field filters
//! - **MultiHandler**: a concurrency-safe handler set with isolated fan-out
//! - **CDC**: SQLite update/pre-update hooks that turn committed row
//!   mutations into [`Event`]s

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod cdc;
pub mod event;
pub mod multi;
pub mod router;

pub use cdc::{Cdc, Op, WatchedTable};
pub use event::{Event, EventHandler};
pub use multi::MultiHandler;
pub use router::Router;

/// Prelude module with commonly used types
pub mod prelude {
    pub use crate::event::{Event, EventHandler};
    pub use crate::multi::MultiHandler;
    pub use crate::router::Router;
}
