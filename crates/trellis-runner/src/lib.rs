//! # Trellis Runner
//!
//! Lifecycle management for the long-running processes and in-binary
//! handlers that back each plugin.
//!
//! ## Run types
//!
//! - **exec**: an external command, started in its own process group and
//!   handed its identity on stdin. Requests reach it through a reverse proxy
//!   to the endpoint it declares.
//! - **builtin**: start/stop hooks and a handler compiled into the host.
//!
//! Either kind may instead carry a cron expression, in which case it runs to
//! completion on every trigger and never serves requests.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use trellis_config::{Config, RunConfig};
//! use trellis_events::Router;
//! use trellis_runner::{BuiltinRegistry, Manager};
//! use trellis_store::Database;
//!
//! # async fn example() -> trellis_core::Result<()> {
//! let db = Database::open_in_memory(Arc::new(Router::new()))?;
//! let manager = Manager::new(Arc::new(Config::default()), db, BuiltinRegistry::builder().build())?;
//!
//! let mut run = RunConfig::default();
//! run.config.insert("cmd".into(), serde_json::json!(["./server"]));
//! run.config.insert("api".into(), "unix://notes.sock".into());
//! manager.start("notes", "server", &run).await?;
//!
//! let handler = manager.get_handler("notes", "run://server/api")?;
//! # let _ = handler;
//! manager.stop_plugin("notes").await;
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

pub mod builtin;
pub mod exec;
pub mod info;
pub mod manager;
pub mod runtype;
pub mod schedule;

pub use builtin::{
    lifecycle_fn, with_version, BuiltinHandler, BuiltinRegistration, BuiltinRegistry,
    BuiltinRegistryBuilder, LifecycleFn,
};
pub use exec::{ExecHandler, ExecProcess};
pub use info::{generate_api_key, RunnerInfo};
pub use manager::{Manager, Runner, CORE_PLUGIN, CORE_RUNNER};
pub use runtype::{RunType, TypeHandler};
pub use schedule::{JobId, Scheduler};

/// Prelude module with commonly used types
pub mod prelude {
    pub use crate::builtin::{lifecycle_fn, with_version, BuiltinRegistration, BuiltinRegistry};
    pub use crate::info::RunnerInfo;
    pub use crate::manager::{Manager, Runner};
    pub use crate::runtype::{RunType, TypeHandler};
}
