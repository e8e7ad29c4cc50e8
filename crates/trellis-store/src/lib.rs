//! # Trellis Store
//!
//! Embedded SQLite store backing Trellis:
//! - Users, apps and sources, the rows plugins are notified about
//! - Per-plugin schema versions for builtin migrations
//! - Change-data-capture: every committed mutation of a watched table is
//!   turned into an event on the shared [`Router`](trellis_events::Router)
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use trellis_events::Router;
//! use trellis_store::Database;
//!
//! # fn example() -> trellis_store::Result<()> {
//! let router = Arc::new(Router::new());
//! let db = Database::open("trellis.db", router)?;
//! db.create_user("alice")?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

mod database;
mod error;
mod schema;

pub use database::{Database, NewApp, NewSource};
pub use error::{Result, StoreError};
pub use schema::watched_tables;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::database::{Database, NewApp, NewSource};
    pub use crate::error::{Result, StoreError};
}
