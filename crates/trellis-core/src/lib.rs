//! # Trellis Core
//!
//! Core types, traits, and error handling shared by every Trellis crate.
//!
//! This crate provides the foundational abstractions:
//! - The streaming [`Body`] type and body helpers
//! - The [`Handler`] trait used for every request handler in the system
//! - The [`Error`] taxonomy and the structured [`ErrorResponse`] body
//! - The control headers understood by the overlay chain

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod body;
pub mod error;
pub mod handler;
pub mod headers;
pub mod response;

pub use body::{Body, BoxError};
pub use error::{Error, Result};
pub use handler::{handler_fn, FnHandler, Handler, SharedHandler};
pub use response::{ErrorResponse, ResponseBuilder};

// Re-export commonly used HTTP types
pub use bytes::Bytes;
pub use http::{Method, Request, Response, StatusCode};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::body::{self, Body, BoxError};
    pub use crate::error::{Error, Result};
    pub use crate::handler::{handler_fn, Handler, SharedHandler};
    pub use crate::headers;
    pub use crate::response::{responses, ErrorResponse, ResponseBuilder};
}
