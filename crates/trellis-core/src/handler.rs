//! Request handler trait and utilities

use crate::body::Body;
use async_trait::async_trait;
use http::{Request, Response};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// A request handler
///
/// Runner handlers, reverse proxies, plugin overlays and the core API all
/// implement this trait. Handlers are infallible: failures are reported as
/// error responses carrying an [`ErrorResponse`](crate::ErrorResponse) body.
#[async_trait]
pub trait Handler: Send + Sync + fmt::Debug {
    /// Handle a request
    async fn call(&self, req: Request<Body>) -> Response<Body>;
}

/// Shared, type-erased handler
pub type SharedHandler = Arc<dyn Handler>;

/// Handler built from an async closure
pub struct FnHandler<F> {
    name: &'static str,
    func: F,
}

/// Create a handler from an async closure
///
/// The name is only used for debug output.
pub fn handler_fn<F, Fut>(name: &'static str, func: F) -> FnHandler<F>
where
    F: Fn(Request<Body>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response<Body>> + Send + 'static,
{
    FnHandler { name, func }
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Request<Body>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response<Body>> + Send + 'static,
{
    async fn call(&self, req: Request<Body>) -> Response<Body> {
        (self.func)(req).await
    }
}

impl<F> fmt::Debug for FnHandler<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnHandler").field("name", &self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body;
    use http::StatusCode;
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn test_fn_handler() {
        let handler: SharedHandler = Arc::new(handler_fn("echo", |req: Request<Body>| async move {
            let path = req.uri().path().to_string();
            Response::new(body::full(path))
        }));

        let req = Request::builder()
            .uri("/hello/world")
            .body(body::empty())
            .unwrap();

        let res = handler.call(req).await;
        assert_eq!(res.status(), StatusCode::OK);
        let bytes = res.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"/hello/world");
    }
}
