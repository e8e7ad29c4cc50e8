//! Runner endpoints and readiness polling

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::Duration;
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;
use trellis_core::{Error, Result};
use url::Url;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Address a runner listens on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// TCP `host:port`
    Tcp(String),
    /// Unix domain socket file
    Unix(PathBuf),
}

impl Endpoint {
    /// Parse the endpoint out of an `http(s)://` URL or `unix://` pseudo-URL
    pub fn parse(data_dir: &Path, uri: &str) -> Result<Self> {
        if uri.starts_with("unix://") {
            let (path, _) = parse_unix_sock(data_dir, uri)?;
            return Ok(Endpoint::Unix(path));
        }

        let url = Url::parse(uri).map_err(|e| Error::config(format!("invalid url '{uri}': {e}")))?;
        let host = url
            .host_str()
            .ok_or_else(|| Error::config(format!("url '{uri}' has no host")))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| Error::config(format!("url '{uri}' has no port")))?;
        Ok(Endpoint::Tcp(format!("{host}:{port}")))
    }

    async fn try_connect(&self) -> std::io::Result<()> {
        match self {
            Endpoint::Tcp(addr) => TcpStream::connect(addr).await.map(drop),
            Endpoint::Unix(path) => UnixStream::connect(path).await.map(drop),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "tcp://{addr}"),
            Endpoint::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

/// Split a `unix://<file>.sock[/path]` pseudo-URL into the socket file and
/// the request path prefix
///
/// A relative socket path is resolved against `data_dir`. The request path
/// defaults to `/`.
pub fn parse_unix_sock(data_dir: &Path, uri: &str) -> Result<(PathBuf, String)> {
    let rest = uri
        .strip_prefix("unix://")
        .ok_or_else(|| Error::config(format!("'{uri}' is not a unix:// url")))?;

    // the file is the first path segment ending in .sock
    let end = rest
        .match_indices(".sock")
        .map(|(idx, m)| idx + m.len())
        .find(|&end| rest[end..].is_empty() || rest[end..].starts_with('/'));
    let Some(end) = end else {
        return Err(Error::config(format!(
            "unix socket url '{uri}' must name a file ending in .sock"
        )));
    };
    let (file, path) = rest.split_at(end);

    if file == ".sock" {
        return Err(Error::config(format!("unix socket url '{uri}' has no file name")));
    }
    let path = if path.is_empty() { "/" } else { path };
    if !path.starts_with('/') {
        return Err(Error::config(format!(
            "unix socket url '{uri}' has an invalid request path '{path}'"
        )));
    }

    let file = Path::new(file);
    let file = if file.is_absolute() {
        file.to_path_buf()
    } else {
        data_dir.join(file)
    };
    Ok((file, path.to_string()))
}

/// Wait until `endpoint` accepts connections
///
/// Polls every 100ms. Fails with [`Error::ProcessExited`] as soon as `exited`
/// reports an exit status, or with [`Error::EndpointTimeout`] once `timeout`
/// has elapsed.
pub async fn wait_for_endpoint(
    endpoint: &Endpoint,
    timeout: Duration,
    mut exited: watch::Receiver<Option<ExitStatus>>,
) -> Result<()> {
    let deadline = Instant::now() + timeout;

    loop {
        if let Some(status) = *exited.borrow_and_update() {
            return Err(Error::ProcessExited(format!(
                "process exited with {status} before {endpoint} opened"
            )));
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining.min(POLL_INTERVAL * 10), endpoint.try_connect()).await
        {
            Ok(Ok(())) => {
                debug!(endpoint = %endpoint, "Endpoint is accepting connections");
                return Ok(());
            }
            Ok(Err(e)) => debug!(endpoint = %endpoint, error = %e, "Endpoint not ready"),
            Err(_) => debug!(endpoint = %endpoint, "Connection attempt timed out"),
        }

        if Instant::now() >= deadline {
            return Err(Error::EndpointTimeout {
                endpoint: endpoint.to_string(),
                timeout,
            });
        }

        tokio::select! {
            changed = exited.changed() => {
                // a dropped sender means the waiter is gone; fall back to polling
                if changed.is_err() {
                    tokio::time::sleep_until(deadline.min(Instant::now() + POLL_INTERVAL)).await;
                }
            }
            _ = tokio::time::sleep_until(deadline.min(Instant::now() + POLL_INTERVAL)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;
    use tokio::net::{TcpListener, UnixListener};

    #[test]
    fn test_parse_unix_sock() {
        let data = Path::new("/var/trellis");

        let (file, path) = parse_unix_sock(data, "unix://api.sock").unwrap();
        assert_eq!(file, PathBuf::from("/var/trellis/api.sock"));
        assert_eq!(path, "/");

        let (file, path) = parse_unix_sock(data, "unix:///tmp/x/api.sock/v1/notes").unwrap();
        assert_eq!(file, PathBuf::from("/tmp/x/api.sock"));
        assert_eq!(path, "/v1/notes");

        let (file, path) = parse_unix_sock(data, "unix:///tmp/a.sock.d/b.sock/events").unwrap();
        assert_eq!(file, PathBuf::from("/tmp/a.sock.d/b.sock"));
        assert_eq!(path, "/events");

        assert!(parse_unix_sock(data, "unix://api").is_err());
        assert!(parse_unix_sock(data, "unix://api.sockets").is_err());
        assert!(parse_unix_sock(data, "http://api.sock").is_err());
    }

    #[test]
    fn test_endpoint_parse() {
        let data = Path::new("/data");
        assert_eq!(
            Endpoint::parse(data, "http://localhost:8000/api").unwrap(),
            Endpoint::Tcp("localhost:8000".into())
        );
        assert_eq!(
            Endpoint::parse(data, "http://example.com").unwrap(),
            Endpoint::Tcp("example.com:80".into())
        );
        assert_eq!(
            Endpoint::parse(data, "unix://p/api.sock/x").unwrap(),
            Endpoint::Unix("/data/p/api.sock".into())
        );
        assert!(Endpoint::parse(data, "not a url").is_err());
    }

    #[tokio::test]
    async fn test_wait_succeeds_once_listening() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = Endpoint::Tcp(listener.local_addr().unwrap().to_string());
        let (_tx, rx) = watch::channel(None);

        wait_for_endpoint(&endpoint, Duration::from_secs(2), rx)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_late_unix_socket() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("late.sock");
        let endpoint = Endpoint::Unix(sock.clone());
        let (_tx, rx) = watch::channel(None);

        let bind = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            UnixListener::bind(sock).unwrap()
        });

        wait_for_endpoint(&endpoint, Duration::from_secs(5), rx)
            .await
            .unwrap();
        drop(bind.await.unwrap());
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = Endpoint::Unix(dir.path().join("never.sock"));
        let (_tx, rx) = watch::channel(None);

        let err = wait_for_endpoint(&endpoint, Duration::from_millis(300), rx)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EndpointTimeout { .. }));
    }

    #[tokio::test]
    async fn test_wait_stops_when_process_exits() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = Endpoint::Unix(dir.path().join("never.sock"));
        let (tx, rx) = watch::channel(None);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            let _ = tx.send(Some(ExitStatus::from_raw(1 << 8)));
        });

        let started = Instant::now();
        let err = wait_for_endpoint(&endpoint, Duration::from_secs(30), rx)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProcessExited(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
