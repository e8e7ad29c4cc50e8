//! # Trellis Request Streaming Bridge
//!
//! Lets one component call another's request handler as if across a network:
//! - [`invoke`] runs an in-process handler on its own task and hands back the
//!   response as soon as its status is known, streaming the body through a
//!   bounded channel
//! - [`build_reverse_proxy`] builds a handler forwarding to a TCP or
//!   unix-domain-socket endpoint
//! - [`wait_for_endpoint`] polls a freshly spawned process's endpoint until it
//!   accepts connections

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod client;
pub mod endpoint;
pub mod invoke;
pub mod proxy;

pub use client::UnixConnector;
pub use endpoint::{parse_unix_sock, wait_for_endpoint, Endpoint};
pub use invoke::{
    invoke, invoke_streamer, InvokeBody, InvokeOptions, InvokeResponse, ResponseStreamer,
    StreamingBody,
};
pub use proxy::{build_reverse_proxy, single_joining_slash, ReverseProxy};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::endpoint::{wait_for_endpoint, Endpoint};
    pub use crate::invoke::{invoke, InvokeBody, InvokeOptions, InvokeResponse};
    pub use crate::proxy::{build_reverse_proxy, ReverseProxy};
}
