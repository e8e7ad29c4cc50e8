//! # Trellis Runtime
//!
//! Serves a Trellis installation over HTTP:
//! - wires the database, event bus, runner manager and plugin manager
//! - dispatches every request through the plugin overlay chain
//! - loads plugins in the background while answering with a loading status
//! - on SIGINT/SIGTERM stops accepting, closes plugins in reverse order and
//!   kills whatever runners remain
//!
//! ```no_run
//! use trellis_runtime::{Server, SignalHandler};
//!
//! # async fn run(config: trellis_config::Config) -> trellis_core::Result<()> {
//! let server = Server::builder().config(config).build()?;
//! tokio::spawn(SignalHandler::new(server.shutdown_signal()).run());
//! server.run().await
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod server;
pub mod shutdown;

pub use server::{Server, ServerBuilder};
pub use shutdown::{ShutdownSignal, SignalHandler};

/// Runtime state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    /// Server is initializing
    Initializing,
    /// Server is running
    Running,
    /// Server is shutting down
    ShuttingDown,
    /// Server is stopped
    Stopped,
}

/// Re-export commonly used types
pub mod prelude {
    pub use crate::server::{Server, ServerBuilder};
    pub use crate::shutdown::{ShutdownSignal, SignalHandler};
    pub use crate::RuntimeState;
}
