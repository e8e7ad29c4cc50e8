//! Reverse proxy to runner endpoints

use crate::client::UnixConnector;
use crate::endpoint::parse_unix_sock;
use async_trait::async_trait;
use http::header::{self, HeaderName, HeaderValue};
use http::uri::{PathAndQuery, Uri};
use http::{HeaderMap, Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use trellis_core::response::responses;
use trellis_core::{body, Body, Error, Handler, Result, SharedHandler};
use url::Url;

const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Headers that only apply to a single connection
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Clone)]
enum Transport {
    Tcp(Client<HttpConnector, Body>),
    Unix(Client<UnixConnector, Body>),
}

/// Handler forwarding every request to one upstream
#[derive(Clone)]
pub struct ReverseProxy {
    transport: Transport,
    /// Scheme and authority requests are sent to
    authority: String,
    /// Host header sent upstream, for TCP targets
    host: Option<HeaderValue>,
    /// Path prefix joined with each request path
    base_path: String,
    target: Arc<str>,
    verbose: bool,
}

impl fmt::Debug for ReverseProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReverseProxy")
            .field("target", &self.target)
            .field("base_path", &self.base_path)
            .finish()
    }
}

impl ReverseProxy {
    /// Proxy to an `http://` URL or a `unix://` pseudo-URL
    pub fn new(data_dir: &Path, target: &str) -> Result<Self> {
        if target.starts_with("unix://") {
            Self::unix(data_dir, target)
        } else {
            Self::tcp(target)
        }
    }

    /// Proxy to an `http://` URL
    pub fn tcp(target: &str) -> Result<Self> {
        let url =
            Url::parse(target).map_err(|e| Error::config(format!("invalid url '{target}': {e}")))?;
        match url.scheme() {
            "http" => {}
            "https" => {
                return Err(Error::config(format!(
                    "'{target}': https upstreams are not supported"
                )))
            }
            other => {
                return Err(Error::config(format!(
                    "'{target}': unsupported scheme '{other}'"
                )))
            }
        }

        let host = url
            .host_str()
            .ok_or_else(|| Error::config(format!("url '{target}' has no host")))?;
        let authority = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        let host_header = HeaderValue::from_str(&authority)
            .map_err(|e| Error::config(format!("invalid host in '{target}': {e}")))?;

        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());

        Ok(Self {
            transport: Transport::Tcp(client),
            authority: format!("http://{authority}"),
            host: Some(host_header),
            base_path: url.path().to_string(),
            target: Arc::from(target),
            verbose: false,
        })
    }

    /// Proxy to a `unix://<file>.sock[/path]` pseudo-URL
    pub fn unix(data_dir: &Path, target: &str) -> Result<Self> {
        let (file, base_path) = parse_unix_sock(data_dir, target)?;

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .pool_timer(TokioTimer::new())
            .build(UnixConnector::new(file));

        Ok(Self {
            transport: Transport::Unix(client),
            authority: "http://unix".to_string(),
            host: None,
            base_path,
            target: Arc::from(target),
            verbose: false,
        })
    }

    /// Log every forwarded request at info level
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// URL this proxy was built from
    pub fn target(&self) -> &str {
        &self.target
    }

    fn upstream_uri(&self, uri: &Uri) -> Result<Uri> {
        let path = single_joining_slash(&self.base_path, uri.path());
        let pq = match uri.query() {
            Some(q) => format!("{path}?{q}"),
            None => path,
        };
        let pq: PathAndQuery = pq
            .parse()
            .map_err(|e| Error::Upstream(format!("invalid upstream path: {e}")))?;
        format!("{}{}", self.authority, pq)
            .parse()
            .map_err(|e| Error::Upstream(format!("invalid upstream uri: {e}")))
    }

    async fn forward(&self, mut req: Request<Body>) -> Result<Response<Body>> {
        let uri = self.upstream_uri(req.uri())?;
        *req.uri_mut() = uri;
        remove_hop_headers(req.headers_mut());
        if let Some(host) = &self.host {
            req.headers_mut().insert(header::HOST, host.clone());
        }

        let res = match &self.transport {
            Transport::Tcp(client) => client.request(req).await,
            Transport::Unix(client) => client.request(req).await,
        }
        .map_err(|e| Error::Upstream(e.to_string()))?;

        let (mut parts, incoming) = res.into_parts();
        remove_hop_headers(&mut parts.headers);
        Ok(Response::from_parts(parts, body::boxed(incoming)))
    }
}

#[async_trait]
impl Handler for ReverseProxy {
    async fn call(&self, req: Request<Body>) -> Response<Body> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        match self.forward(req).await {
            Ok(res) => {
                if self.verbose {
                    info!(target_url = %self.target, method = %method, path = %path, status = %res.status(), "Forwarded request");
                } else {
                    debug!(target_url = %self.target, method = %method, path = %path, status = %res.status(), "Forwarded request");
                }
                res
            }
            Err(e) => {
                warn!(target_url = %self.target, method = %method, path = %path, error = %e, "Upstream request failed");
                responses::bad_gateway(format!("{}: {}", self.target, e))
            }
        }
    }
}

fn remove_hop_headers(headers: &mut HeaderMap) {
    if let Some(listed) = headers.get(header::CONNECTION).cloned() {
        if let Ok(listed) = listed.to_str() {
            for name in listed.split(',') {
                if let Ok(name) = HeaderName::from_bytes(name.trim().as_bytes()) {
                    headers.remove(name);
                }
            }
        }
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// Join two URL paths with exactly one slash between them
pub fn single_joining_slash(a: &str, b: &str) -> String {
    match (a.ends_with('/'), b.starts_with('/')) {
        (true, true) => format!("{}{}", a, &b[1..]),
        (false, false) => format!("{a}/{b}"),
        _ => format!("{a}{b}"),
    }
}

/// Build a proxy handler for an `http://` URL or a `unix://` pseudo-URL
pub fn build_reverse_proxy(data_dir: &Path, uri: &str) -> Result<SharedHandler> {
    Ok(Arc::new(ReverseProxy::new(data_dir, uri)?))
}
