//! Plugin orchestration and the overlay chain

use crate::mux::PluginMux;
use crate::plugin::Plugin;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use trellis_config::Config;
use http::HeaderValue;
use trellis_core::headers::{self, OVERLAY_NEXT, OVERLAY_NONE, X_OVERLAY, X_PLUGIN_ID};
use trellis_core::response::{responses, ErrorResponse};
use trellis_core::{Body, Error, Handler, Request, Response, Result, SharedHandler, StatusCode};
use trellis_events::{Event, EventHandler, Router};
use trellis_runner::{Manager, RunnerInfo};
use trellis_store::Database;

/// Head value for an empty chain
const NO_PLUGIN: &str = "none";

/// Event fired when a user row is inserted
pub const USER_CREATE: &str = "user_create";

/// Lifecycle state of the plugin manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// No plugins loaded
    Closed,
    /// Plugins are being started in order
    Loading,
    /// Every active plugin started
    Ready,
    /// Plugins are being stopped in reverse order
    Closing,
}

struct State {
    order: Vec<String>,
    plugins: HashMap<String, Arc<Plugin>>,
    head: String,
    status: Status,
}

impl State {
    fn new() -> Self {
        Self {
            order: Vec::new(),
            plugins: HashMap::new(),
            head: NO_PLUGIN.to_string(),
            status: Status::Closed,
        }
    }

    fn has_routes(&self, name: &str) -> bool {
        self.plugins.get(name).is_some_and(|p| p.has_routes())
    }

    /// Last route-bearing plugin in load order
    fn compute_head(&self) -> String {
        self.order
            .iter()
            .rev()
            .find(|name| self.has_routes(name))
            .cloned()
            .unwrap_or_else(|| NO_PLUGIN.to_string())
    }

    /// Route-bearing plugin loaded before `name`
    fn next_of(&self, name: &str) -> String {
        let Some(idx) = self.order.iter().position(|n| n == name) else {
            return NO_PLUGIN.to_string();
        };
        self.order[..idx]
            .iter()
            .rev()
            .find(|name| self.has_routes(name))
            .cloned()
            .unwrap_or_else(|| NO_PLUGIN.to_string())
    }

    /// Muxes to try, in order, when serving from `start`
    fn chain_from(&self, start: &str) -> Vec<Arc<PluginMux>> {
        let Some(idx) = self.order.iter().position(|n| n == start) else {
            return Vec::new();
        };
        self.order[..=idx]
            .iter()
            .rev()
            .filter_map(|name| self.plugins.get(name))
            .filter_map(|p| p.mux().cloned())
            .collect()
    }
}

/// Owns the active plugins and serves requests through their overlay chain
///
/// Plugins are started in configured order and stopped in exact reverse.
/// Each route-bearing plugin overlays the ones loaded before it: a request
/// is offered to the most recently loaded plugin first, falls through any
/// plugin whose routes do not match, and finally reaches the core handler.
pub struct PluginManager {
    state: RwLock<State>,
    manager: Arc<Manager>,
    db: Database,
    bus: Arc<Router>,
    core: SharedHandler,
}

impl fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("PluginManager")
            .field("status", &state.status)
            .field("order", &state.order)
            .field("head", &state.head)
            .finish()
    }
}

impl PluginManager {
    /// Create a closed plugin manager
    ///
    /// `core` answers every request no plugin claims. It also becomes the
    /// handler of the core runner, so `run://trellis:core` reaches it.
    pub fn new(manager: Arc<Manager>, db: Database, bus: Arc<Router>, core: SharedHandler) -> Self {
        manager.set_core_handler(Arc::clone(&core));
        Self {
            state: RwLock::new(State::new()),
            manager,
            db,
            bus,
            core,
        }
    }

    /// Runner manager
    pub fn runners(&self) -> &Arc<Manager> {
        &self.manager
    }

    /// Current lifecycle state
    pub fn status(&self) -> Status {
        self.state.read().status
    }

    /// Loaded plugins, in load order
    pub fn plugins(&self) -> Vec<String> {
        self.state.read().order.clone()
    }

    /// Plugin requests are offered to first, or `"none"`
    pub fn head(&self) -> String {
        self.state.read().head.clone()
    }

    /// Identity of the runner holding `api_key`
    pub fn get_info_by_key(&self, api_key: &str) -> Option<Arc<RunnerInfo>> {
        self.manager.get_info_by_key(api_key)
    }

    /// Start every active plugin of `config`, in order
    ///
    /// On failure everything started so far is stopped in reverse order and
    /// the manager is left closed.
    pub async fn reload(&self, config: &Config) -> Result<()> {
        {
            let mut state = self.state.write();
            if state.status != Status::Closed {
                return Err(Error::AlreadyLoading);
            }
            state.status = Status::Loading;
        }

        let mut order: Vec<&str> = Vec::with_capacity(config.plugins.len());
        for name in &config.plugins {
            if !order.contains(&name.as_str()) {
                order.push(name);
            }
        }
        info!(plugins = ?order, "Loading plugins");

        for name in order {
            if let Err(e) = self.load(config, name).await {
                error!(plugin = %name, error = %e, "Plugin failed to start");
                if !matches!(e, Error::ConcurrentClose) {
                    if let Err(close_err) = self.close().await {
                        warn!(error = %close_err, "Unloading after failed start");
                    }
                }
                return Err(e);
            }
        }

        {
            let mut state = self.state.write();
            if state.status != Status::Loading {
                return Err(Error::ConcurrentClose);
            }
            state.status = Status::Ready;
        }
        info!("Plugins ready");
        Ok(())
    }

    async fn load(&self, config: &Config, name: &str) -> Result<()> {
        let plugin = Arc::new(Plugin::new(
            name,
            config,
            Arc::clone(&self.manager),
            self.db.clone(),
            Arc::clone(&self.bus),
        )?);

        let started = match plugin.before_start().await {
            Ok(()) => plugin.start().await,
            Err(e) => Err(e),
        };
        if let Err(e) = started {
            plugin.close().await;
            return Err(e);
        }

        let inserted = {
            let mut state = self.state.write();
            if state.status == Status::Loading {
                state.plugins.insert(name.to_string(), Arc::clone(&plugin));
                state.order.push(name.to_string());
                if plugin.has_routes() {
                    state.head = name.to_string();
                }
                true
            } else {
                false
            }
        };
        if !inserted {
            plugin.close().await;
            return Err(Error::ConcurrentClose);
        }

        plugin.after_start().await?;

        // a close that took the plugin before it subscribed would miss
        // those subscriptions
        let still_loaded = {
            let state = self.state.read();
            state.status == Status::Loading
                && state.plugins.get(name).is_some_and(|p| Arc::ptr_eq(p, &plugin))
        };
        if !still_loaded {
            plugin.detach();
            return Err(Error::ConcurrentClose);
        }
        Ok(())
    }

    /// Stop every plugin, most recently loaded first
    ///
    /// Each plugin leaves the chain before its runners are stopped, so the
    /// plugins loaded before it keep serving while it shuts down.
    pub async fn close(&self) -> Result<()> {
        let order = {
            let mut state = self.state.write();
            if state.status == Status::Closing {
                return Err(Error::AlreadyClosing);
            }
            state.status = Status::Closing;
            state.order.clone()
        };
        if !order.is_empty() {
            info!(plugins = ?order, "Closing plugins");
        }

        for name in order.iter().rev() {
            let plugin = {
                let mut state = self.state.write();
                let plugin = state.plugins.remove(name);
                state.order.retain(|n| n != name);
                state.head = state.compute_head();
                plugin
            };
            if let Some(plugin) = plugin {
                plugin.close().await;
            }
        }

        let mut state = self.state.write();
        state.order.clear();
        state.plugins.clear();
        state.head = NO_PLUGIN.to_string();
        state.status = Status::Closed;
        Ok(())
    }

    /// Forget every plugin and kill every runner
    pub async fn kill(&self) {
        {
            let mut state = self.state.write();
            for plugin in state.plugins.values() {
                plugin.detach();
            }
            *state = State::new();
        }
        self.manager.kill().await;
    }

    /// Replace any client-supplied `X-Plugin-Id` with the plugin owning the
    /// runner key the request presents
    fn identify(&self, req: &mut Request<Body>) {
        req.headers_mut().remove(&X_PLUGIN_ID);
        let Some(info) = headers::plugin_key(req.headers()).and_then(|key| self.manager.get_info_by_key(key)) else {
            return;
        };
        match HeaderValue::from_str(&info.plugin) {
            Ok(value) => {
                req.headers_mut().insert(X_PLUGIN_ID, value);
            }
            Err(e) => warn!(plugin = %info.plugin, error = %e, "Plugin name is not a valid header value"),
        }
    }

    /// Pick the muxes a request walks through, or the response to send
    /// straight away
    fn chain_for(&self, req: &Request<Body>) -> std::result::Result<Vec<Arc<PluginMux>>, Response<Body>> {
        let state = self.state.read();
        let from = headers::plugin_id(req.headers());

        if state.status != Status::Ready && from.is_none() {
            return Err(responses::loading());
        }

        let mut overlay = req.headers().get_all(&X_OVERLAY).iter();
        let start = match (overlay.next(), overlay.next()) {
            (None, _) => state.head.clone(),
            (Some(_), Some(_)) => {
                return Err(ErrorResponse::new("plugin_error", "invalid overlay")
                    .into_response(StatusCode::BAD_REQUEST))
            }
            (Some(value), None) => match value.to_str() {
                Ok(OVERLAY_NONE) => NO_PLUGIN.to_string(),
                Ok(OVERLAY_NEXT) => from.map_or_else(|| NO_PLUGIN.to_string(), |p| state.next_of(p)),
                _ => state.head.clone(),
            },
        };

        Ok(state.chain_from(&start))
    }
}

#[async_trait]
impl Handler for PluginManager {
    async fn call(&self, mut req: Request<Body>) -> Response<Body> {
        self.identify(&mut req);
        let chain = match self.chain_for(&req) {
            Ok(chain) => chain,
            Err(res) => return res,
        };
        req.headers_mut().remove(&X_OVERLAY);

        let method = req.method().clone();
        let path = req.uri().path().to_string();
        for mux in chain {
            if let Some(handler) = mux.route(&method, &path) {
                let handler = Arc::clone(handler);
                debug!(method = %method, path = %path, "Serving from plugin overlay");
                return handler.call(req).await;
            }
        }
        self.core.call(req).await
    }
}

/// Provisions every loaded plugin's apps and sources for new users
///
/// A user that cannot be provisioned is deleted again.
#[async_trait]
impl EventHandler for PluginManager {
    async fn handle_event(&self, event: &Event) -> Result<()> {
        if event.event != USER_CREATE {
            return Ok(());
        }
        let plugins: Vec<Arc<Plugin>> = {
            let state = self.state.read();
            state
                .order
                .iter()
                .filter_map(|name| state.plugins.get(name).cloned())
                .collect()
        };
        for plugin in plugins {
            if let Err(e) = plugin.provision().await {
                error!(user = %event.user, plugin = %plugin.name(), error = %e, "Provisioning new user failed, removing user");
                if let Err(del) = self.db.delete_user(&event.user) {
                    warn!(user = %event.user, error = %del, "Removing unprovisioned user");
                }
                return Err(e);
            }
        }
        debug!(user = %event.user, "Provisioned plugins for new user");
        Ok(())
    }
}
