//! HTTP server implementation

use crate::shutdown::ShutdownSignal;
use crate::RuntimeState;
use http_body_util::Limited;
use hyper::body::Incoming;
use parking_lot::RwLock;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use trellis_config::{validate_config, Config};
use trellis_core::response::responses;
use trellis_core::{body, handler_fn, Body, Error, Handler, Request, Result, SharedHandler};
use trellis_events::{Event, EventHandler, Router};
use trellis_plugins::{PluginManager, USER_CREATE};
use trellis_runner::{BuiltinRegistry, Manager};
use trellis_store::Database;

/// How long in-flight requests get to finish once shutdown begins
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Database file inside the data directory
const DATABASE_FILE: &str = "trellis.db";

/// Counts a request as in flight until dropped
struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// HTTP server fronting the plugin overlay chain
pub struct Server {
    config: Arc<Config>,
    plugins: Arc<PluginManager>,
    runners: Arc<Manager>,
    db: Database,
    bus: Arc<Router>,
    state: Arc<RwLock<RuntimeState>>,
    shutdown: ShutdownSignal,
    active: Arc<AtomicUsize>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("listen", &self.config.server.listen)
            .field("state", &*self.state.read())
            .field("plugins", &self.plugins)
            .field("active_requests", &self.active_requests())
            .finish()
    }
}

impl Server {
    /// Create a new server builder
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Get the current state
    pub fn state(&self) -> RuntimeState {
        *self.state.read()
    }

    /// Configured listen address
    pub fn listen_addr(&self) -> SocketAddr {
        self.config.server.listen
    }

    /// Plugin orchestrator every request is dispatched to
    pub fn plugins(&self) -> &Arc<PluginManager> {
        &self.plugins
    }

    /// Runner manager
    pub fn runners(&self) -> &Arc<Manager> {
        &self.runners
    }

    /// Embedded database
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Event bus fed by the database
    pub fn bus(&self) -> &Arc<Router> {
        &self.bus
    }

    /// Requests currently being handled
    pub fn active_requests(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Get shutdown signal
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(self.listen_addr()).await.map_err(|e| {
            tracing::error!(listen = %self.listen_addr(), error = %e, "Failed to bind");
            Error::Io(e)
        })?;
        self.serve(listener).await
    }

    /// Serve connections from `listener` until shutdown
    ///
    /// Plugins are loaded in the background; requests arriving before they
    /// are ready get a loading response. A failed plugin load stops the
    /// server and is returned.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let mut shutdown_rx = self.shutdown.subscribe();
        *self.state.write() = RuntimeState::Running;

        let local = listener.local_addr()?;
        tracing::info!(listen = %local, "Server starting");

        let mut loading = self.spawn_reload();
        let mut loaded = false;

        let result = if self.shutdown.is_triggered() {
            Ok(())
        } else {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, addr)) => {
                            tracing::trace!(peer = %addr, "Accepted connection");
                            self.spawn_connection(stream);
                        }
                        Err(e) => tracing::error!(error = %e, "Failed to accept connection"),
                    },
                    joined = &mut loading, if !loaded => {
                        loaded = true;
                        match joined {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => {
                                tracing::error!(error = %e, "Plugins failed to load");
                                break Err(e);
                            }
                            Err(e) => break Err(Error::Internal(format!("plugin loading task failed: {e}"))),
                        }
                    },
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Shutdown signal received");
                        break Ok(());
                    }
                }
            }
        };
        drop(listener);

        *self.state.write() = RuntimeState::ShuttingDown;
        let start = Instant::now();
        self.drain().await;

        if let Err(e) = self.plugins.close().await {
            tracing::warn!(error = %e, "Closing plugins");
        }
        if !loaded {
            let _ = loading.await;
        }
        self.runners.kill().await;

        *self.state.write() = RuntimeState::Stopped;
        tracing::info!(
            shutdown_duration_ms = start.elapsed().as_millis(),
            "Server stopped"
        );
        result
    }

    fn spawn_reload(&self) -> JoinHandle<Result<()>> {
        let plugins = Arc::clone(&self.plugins);
        let config = Arc::clone(&self.config);
        tokio::spawn(async move { plugins.reload(&config).await })
    }

    fn spawn_connection(&self, stream: tokio::net::TcpStream) {
        let plugins = Arc::clone(&self.plugins);
        let active = Arc::clone(&self.active);
        let limit = self.config.request_body_limit;

        tokio::spawn(async move {
            let service = hyper::service::service_fn(move |req: Request<Incoming>| {
                let plugins = Arc::clone(&plugins);
                let active = Arc::clone(&active);
                async move {
                    let _in_flight = InFlight::enter(&active);
                    let req = req.map(|incoming| body::boxed(Limited::new(incoming, limit)));
                    Ok::<_, Infallible>(plugins.call(req).await)
                }
            });

            let io = hyper_util::rt::TokioIo::new(stream);
            if let Err(e) = hyper::server::conn::http1::Builder::new()
                .serve_connection(io, service)
                .await
            {
                tracing::debug!(error = %e, "HTTP connection error");
            }
        });
    }

    /// Wait for in-flight requests, up to [`DRAIN_TIMEOUT`]
    async fn drain(&self) {
        let start = Instant::now();
        loop {
            let active = self.active_requests();
            if active == 0 {
                break;
            }
            if start.elapsed() >= DRAIN_TIMEOUT {
                tracing::warn!(active_requests = active, "Shutdown timeout reached, closing anyway");
                break;
            }
            tracing::debug!(active_requests = active, "Waiting for active requests to complete");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

/// Server builder
#[derive(Default)]
pub struct ServerBuilder {
    config: Option<Config>,
    builtins: Option<Arc<BuiltinRegistry>>,
    core: Option<SharedHandler>,
    in_memory: bool,
}

impl std::fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerBuilder")
            .field("config", &self.config.is_some())
            .field("builtins", &self.builtins)
            .field("core", &self.core.is_some())
            .field("in_memory", &self.in_memory)
            .finish()
    }
}

impl ServerBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the configuration
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// In-process runners available to `builtin` run configurations
    pub fn builtins(mut self, registry: Arc<BuiltinRegistry>) -> Self {
        self.builtins = Some(registry);
        self
    }

    /// Handler answering requests no plugin claims
    pub fn core_handler(mut self, handler: SharedHandler) -> Self {
        self.core = Some(handler);
        self
    }

    /// Keep the database in memory instead of the data directory
    pub fn in_memory_database(mut self, in_memory: bool) -> Self {
        self.in_memory = in_memory;
        self
    }

    /// Validate the configuration and wire up the server
    pub fn build(self) -> Result<Server> {
        let config = self
            .config
            .ok_or_else(|| Error::config("configuration is required"))?;
        validate_config(&config)?;
        let config = Arc::new(config);

        let bus = Arc::new(Router::new());
        let db = if self.in_memory {
            Database::open_in_memory(Arc::clone(&bus))?
        } else {
            std::fs::create_dir_all(&config.server.data_dir)?;
            Database::open(config.server.data_dir.join(DATABASE_FILE), Arc::clone(&bus))?
        };

        let builtins = self
            .builtins
            .unwrap_or_else(|| BuiltinRegistry::builder().build());
        let runners = Arc::new(Manager::new(Arc::clone(&config), db.clone(), builtins)?);

        let core = self.core.unwrap_or_else(default_core);
        let plugins = Arc::new(PluginManager::new(
            Arc::clone(&runners),
            db.clone(),
            Arc::clone(&bus),
            core,
        ));
        bus.subscribe(Event::new(USER_CREATE), Arc::clone(&plugins) as Arc<dyn EventHandler>);

        tracing::debug!(data_dir = %config.server.data_dir.display(), "Server built");
        Ok(Server {
            config,
            plugins,
            runners,
            db,
            bus,
            state: Arc::new(RwLock::new(RuntimeState::Initializing)),
            shutdown: ShutdownSignal::new(),
            active: Arc::new(AtomicUsize::new(0)),
        })
    }
}

fn default_core() -> SharedHandler {
    Arc::new(handler_fn("core", |_req: Request<Body>| async {
        responses::not_found("no handler for this path")
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_config::ConfigBuilder;

    #[test]
    fn test_server_builder() {
        let config = ConfigBuilder::new()
            .listen("127.0.0.1:8080".parse().unwrap())
            .build()
            .unwrap();
        let server = ServerBuilder::new()
            .config(config)
            .in_memory_database(true)
            .build()
            .unwrap();

        assert_eq!(server.listen_addr(), "127.0.0.1:8080".parse().unwrap());
        assert_eq!(server.state(), RuntimeState::Initializing);
        assert_eq!(server.active_requests(), 0);
        assert!(server.runners().find("trellis", "core").is_some());
    }

    #[test]
    fn test_server_builder_no_config() {
        assert!(ServerBuilder::new().build().is_err());
    }

    #[test]
    fn test_database_lands_in_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConfigBuilder::new()
            .data_dir(dir.path().join("data"))
            .build()
            .unwrap();
        Server::builder().config(config).build().unwrap();
        assert!(dir.path().join("data").join(DATABASE_FILE).exists());
    }
}
