//! Streaming body type shared by handlers, the bridge, and the proxy

use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};

/// Boxed error carried by body frames
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type alias
///
/// Every request and response in Trellis uses this boxed streaming body so
/// that proxied upstream bodies, in-process handler bodies and bridge pipes
/// can be passed around interchangeably.
pub type Body = UnsyncBoxBody<Bytes, BoxError>;

/// Body holding the given bytes
pub fn full(data: impl Into<Bytes>) -> Body {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Empty body
pub fn empty() -> Body {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Box any compatible body into a [`Body`]
pub fn boxed<B>(body: B) -> Body
where
    B: http_body::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    body.map_err(Into::into).boxed_unsync()
}
