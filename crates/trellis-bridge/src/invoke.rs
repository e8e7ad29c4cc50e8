//! In-process request invocation with a streamed response

use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_TYPE};
use http::response::Parts;
use http::{HeaderMap, Method, Request, Response, StatusCode};
use http_body::{Body as HttpBody, Frame, SizeHint};
use http_body_util::BodyExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, info};
use trellis_core::{body, Body, BoxError, ErrorResponse, SharedHandler};

type FrameResult = Result<Frame<Bytes>, BoxError>;

/// Limits applied to one invocation
#[derive(Debug, Clone)]
pub struct InvokeOptions {
    /// Maximum bytes read from an error response body
    pub max_error_body: usize,

    /// Number of body frames buffered between producer and reader
    pub buffer: usize,

    /// Log every invocation at info level
    pub verbose: bool,
}

impl Default for InvokeOptions {
    fn default() -> Self {
        Self {
            max_error_body: 1024 * 1024,
            buffer: 16,
            verbose: false,
        }
    }
}

/// Request body for [`invoke`]
#[derive(Debug, Clone, Default)]
pub enum InvokeBody {
    /// No body
    #[default]
    Empty,
    /// Raw bytes, passed through unchanged
    Raw(Bytes),
    /// JSON-encoded value
    Json(Bytes),
}

impl InvokeBody {
    /// JSON-encode a value
    pub fn json<T: Serialize + ?Sized>(value: &T) -> serde_json::Result<Self> {
        Ok(InvokeBody::Json(Bytes::from(serde_json::to_vec(value)?)))
    }
}

impl From<Bytes> for InvokeBody {
    fn from(b: Bytes) -> Self {
        InvokeBody::Raw(b)
    }
}

impl From<Vec<u8>> for InvokeBody {
    fn from(b: Vec<u8>) -> Self {
        InvokeBody::Raw(Bytes::from(b))
    }
}

/// Producer side of one invocation
///
/// The response head is handed to the caller exactly once; later attempts to
/// write it are ignored. Body frames go through a bounded channel, so a slow
/// reader holds back the producer.
#[derive(Debug)]
pub struct ResponseStreamer {
    head: Mutex<Option<oneshot::Sender<Parts>>>,
    frames: mpsc::Sender<FrameResult>,
}

impl ResponseStreamer {
    fn channel(buffer: usize) -> (Self, oneshot::Receiver<Parts>, mpsc::Receiver<FrameResult>) {
        let (head_tx, head_rx) = oneshot::channel();
        let (frames_tx, frames_rx) = mpsc::channel(buffer.max(1));
        let streamer = Self {
            head: Mutex::new(Some(head_tx)),
            frames: frames_tx,
        };
        (streamer, head_rx, frames_rx)
    }

    /// Send the response head. Returns `false` if it was already sent.
    pub fn write_header(&self, parts: Parts) -> bool {
        let Some(tx) = self.head.lock().take() else {
            debug!(status = %parts.status, "Response header already written, ignoring");
            return false;
        };
        // the caller may have given up waiting
        let _ = tx.send(parts);
        true
    }

    /// Send just a status as the response head
    pub fn write_status(&self, status: StatusCode) -> bool {
        let (mut parts, ()) = Response::new(()).into_parts();
        parts.status = status;
        self.write_header(parts)
    }

    /// Whether the head has been sent
    pub fn header_written(&self) -> bool {
        self.head.lock().is_none()
    }

    /// Write a chunk of body, sending a `200 OK` head first if none was sent
    ///
    /// Fails once the reader has gone away.
    pub async fn write(&self, chunk: impl Into<Bytes>) -> Result<(), BoxError> {
        if !self.header_written() {
            self.write_status(StatusCode::OK);
        }
        self.frames
            .send(Ok(Frame::data(chunk.into())))
            .await
            .map_err(|_| BoxError::from("response reader closed"))
    }

    /// Forward every frame of `body` to the reader
    pub async fn pump(&self, mut body: Body) {
        while let Some(frame) = body.frame().await {
            let failed = frame.is_err();
            if self.frames.send(frame).await.is_err() || failed {
                return;
            }
        }
    }
}

/// Aborts the producer task when dropped
#[derive(Debug)]
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Response body read from an invocation's channel
///
/// Dropping or closing the body aborts the producer if it is still running.
#[derive(Debug)]
pub struct StreamingBody {
    frames: mpsc::Receiver<FrameResult>,
    _producer: AbortOnDrop,
}

impl StreamingBody {
    /// Stop reading and abort the producer
    pub fn close(self) {}

    /// Read the remaining body into memory
    pub async fn bytes(self) -> Result<Bytes, BoxError> {
        Ok(self.collect().await?.to_bytes())
    }
}

impl HttpBody for StreamingBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        self.frames.poll_recv(cx)
    }

    fn size_hint(&self) -> SizeHint {
        SizeHint::default()
    }
}

/// Successful invocation result
#[derive(Debug)]
pub struct InvokeResponse {
    /// Response status
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
    /// Body, possibly still being produced
    pub body: StreamingBody,
}

impl InvokeResponse {
    /// Convert into a response whose body keeps streaming
    pub fn into_response(self) -> Response<Body> {
        let mut res = Response::new(body::boxed(self.body));
        *res.status_mut() = self.status;
        *res.headers_mut() = self.headers;
        res
    }
}

/// Run a writer-style producer and wait until it sends its response head
///
/// `produce` runs on its own task. A producer that finishes without writing
/// a head yields an empty `200 OK`. See [`invoke`] for how errors are
/// reported.
pub async fn invoke_streamer<F, Fut>(
    produce: F,
    opts: &InvokeOptions,
) -> Result<InvokeResponse, ErrorResponse>
where
    F: FnOnce(Arc<ResponseStreamer>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (streamer, head_rx, frames_rx) = ResponseStreamer::channel(opts.buffer);
    let streamer = Arc::new(streamer);

    let task = tokio::spawn({
        let streamer = Arc::clone(&streamer);
        async move {
            produce(Arc::clone(&streamer)).await;
            streamer.write_status(StatusCode::OK);
        }
    });
    // only the producer task may keep the channel open
    drop(streamer);

    let body = StreamingBody {
        frames: frames_rx,
        _producer: AbortOnDrop(task.abort_handle()),
    };

    let parts = match head_rx.await {
        Ok(parts) => parts,
        Err(_) => {
            return Err(ErrorResponse::new(
                "internal_error",
                "handler stopped before writing a response",
            ))
        }
    };

    if parts.status.as_u16() >= 400 {
        return Err(read_error(parts.status, body, opts.max_error_body).await);
    }

    Ok(InvokeResponse {
        status: parts.status,
        headers: parts.headers,
        body,
    })
}

/// Invoke a handler without a network hop
///
/// The handler runs to completion on its own task while this returns as soon
/// as the response status is known. A status of 400 or above is returned as
/// the structured error read from the body (bounded by
/// [`InvokeOptions::max_error_body`]); otherwise the still-streaming body is
/// returned.
pub async fn invoke(
    handler: SharedHandler,
    method: Method,
    path: &str,
    body: InvokeBody,
    headers: HeaderMap,
    opts: &InvokeOptions,
) -> Result<InvokeResponse, ErrorResponse> {
    let req = build_request(method.clone(), path, body, headers)
        .map_err(|e| ErrorResponse::new("bad_request", e.to_string()))?;

    let result = invoke_streamer(
        move |streamer| async move {
            let (parts, body) = handler.call(req).await.into_parts();
            streamer.write_header(parts);
            streamer.pump(body).await;
        },
        opts,
    )
    .await;

    if opts.verbose {
        match &result {
            Ok(res) => info!(method = %method, path, status = %res.status, "Invoked handler"),
            Err(e) => info!(method = %method, path, error = %e, "Invoked handler"),
        }
    }
    result
}

fn build_request(
    method: Method,
    path: &str,
    body: InvokeBody,
    headers: HeaderMap,
) -> Result<Request<Body>, http::Error> {
    let (content_type, body) = match body {
        InvokeBody::Empty => (None, body::empty()),
        InvokeBody::Raw(b) => (None, body::full(b)),
        InvokeBody::Json(b) => (Some(HeaderValue::from_static("application/json")), body::full(b)),
    };

    let mut req = Request::builder().method(method).uri(path).body(body)?;
    req.headers_mut().extend(headers);
    if let Some(ct) = content_type {
        req.headers_mut().entry(CONTENT_TYPE).or_insert(ct);
    }
    Ok(req)
}

async fn read_error(status: StatusCode, mut body: StreamingBody, limit: usize) -> ErrorResponse {
    let mut buf = Vec::new();
    while let Some(frame) = body.frame().await {
        let Ok(frame) = frame else { break };
        if let Ok(data) = frame.into_data() {
            let room = limit.saturating_sub(buf.len());
            buf.extend_from_slice(&data[..data.len().min(room)]);
            if buf.len() >= limit {
                break;
            }
        }
    }

    serde_json::from_slice::<ErrorResponse>(&buf).unwrap_or_else(|_| {
        let snippet = String::from_utf8_lossy(&buf[..buf.len().min(256)]);
        ErrorResponse::new("plugin_error", format!("{status}: {snippet}"))
    })
}
