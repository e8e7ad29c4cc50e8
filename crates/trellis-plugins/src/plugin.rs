//! A single active plugin

use crate::events::PluginEventHandler;
use crate::mux::PluginMux;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};
use trellis_config::{Config, EventForward, PluginConfig};
use trellis_core::response::responses;
use trellis_core::{Body, Error, Handler, Request, Response, Result, SharedHandler};
use trellis_events::{Event, EventHandler, Router};
use trellis_runner::Manager;
use trellis_store::{Database, NewApp, NewSource};

/// Resolves a `run://` route target on every request
///
/// Routes are built before the plugin's runners start, so the runner is
/// looked up lazily.
#[derive(Debug)]
struct RunnerRoute {
    manager: Arc<Manager>,
    plugin: String,
    target: String,
}

#[async_trait]
impl Handler for RunnerRoute {
    async fn call(&self, req: Request<Body>) -> Response<Body> {
        match self.manager.get_handler(&self.plugin, &self.target) {
            Ok(handler) => handler.call(req).await,
            Err(e) => responses::from_error(&e),
        }
    }
}

/// Plugin routes, subscriptions and provisioning
pub struct Plugin {
    name: String,
    config: PluginConfig,
    mux: Option<Arc<PluginMux>>,
    events: Arc<Router>,
    manager: Arc<Manager>,
    db: Database,
    bus: Arc<Router>,
}

impl fmt::Debug for Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plugin")
            .field("name", &self.name)
            .field("routes", &self.mux.as_ref().map_or(0, |m| m.len()))
            .finish()
    }
}

impl Plugin {
    /// Build a plugin's route table and event subscriptions
    ///
    /// Nothing is started and nothing is attached to `bus` yet.
    pub fn new(
        name: &str,
        config: &Config,
        manager: Arc<Manager>,
        db: Database,
        bus: Arc<Router>,
    ) -> Result<Self> {
        let pconfig = config
            .plugin
            .get(name)
            .cloned()
            .ok_or_else(|| Error::config(format!("plugin '{name}' is not defined")))?;
        debug!(plugin = %name, "Loading plugin");

        let mux = if pconfig.routes.is_empty() {
            None
        } else {
            let mut mux = PluginMux::new();
            for (route, target) in &pconfig.routes {
                let handler: SharedHandler = if target.starts_with("run://") {
                    Arc::new(RunnerRoute {
                        manager: Arc::clone(&manager),
                        plugin: name.to_string(),
                        target: target.clone(),
                    })
                } else {
                    manager.get_handler(name, target)?
                };
                debug!(plugin = %name, route = %route, target_url = %target, "Forwarding route");
                mux.handle(route, handler)?;
            }
            Some(Arc::new(mux))
        };

        let events = Arc::new(Router::new());
        let subscribe = |filter: Event, forward: &EventForward| {
            debug!(plugin = %name, event = %filter.event, target_url = %forward.post, "Forwarding event");
            let handler = PluginEventHandler::new(Arc::clone(&manager), name, forward.post.clone());
            events.subscribe(filter, Arc::new(handler));
        };

        for (event, forward) in &pconfig.on {
            subscribe(Event::new(event.as_str()), forward);
        }
        for (app_name, app) in &pconfig.apps {
            let app_key = format!("{name}:{app_name}");
            for (event, forward) in &app.on {
                subscribe(Event::new(event.as_str()).plugin(app_key.as_str()), forward);
            }
            for (source_key, source) in &app.sources {
                for (event, forward) in &source.on {
                    subscribe(
                        Event::new(event.as_str())
                            .plugin(app_key.as_str())
                            .key(source_key.as_str()),
                        forward,
                    );
                }
            }
        }

        Ok(Self {
            name: name.to_string(),
            config: pconfig,
            mux,
            events,
            manager,
            db,
            bus,
        })
    }

    /// Plugin name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Route table, when the plugin declares routes
    pub fn mux(&self) -> Option<&Arc<PluginMux>> {
        self.mux.as_ref()
    }

    /// Whether the plugin takes part in the overlay chain
    pub fn has_routes(&self) -> bool {
        self.mux.is_some()
    }

    /// This plugin's own subscriptions
    pub fn event_router(&self) -> &Arc<Router> {
        &self.events
    }

    /// Create apps for users lacking them, and their non-deferred sources
    pub async fn before_start(&self) -> Result<()> {
        for (app_name, app) in &self.config.apps {
            let app_key = format!("{}:{app_name}", self.name);

            let users = self.db.users_without_app(&app_key)?;
            if !users.is_empty() {
                debug!(plugin = %self.name, app = %app_key, users = users.len(), "Creating app for all users");
            }
            for owner in users {
                self.db.create_app(&NewApp {
                    owner,
                    name: app.name.clone(),
                    plugin: Some(app_key.clone()),
                    description: app.description.clone().unwrap_or_default(),
                })?;
            }
        }
        self.provision_sources(false)
    }

    /// Create every missing app and source, deferred or not
    pub async fn provision(&self) -> Result<()> {
        self.before_start().await?;
        self.provision_sources(true)
    }

    /// Start every runner of the plugin
    pub async fn start(&self) -> Result<()> {
        for (runner, run) in &self.config.run {
            self.manager.start(&self.name, runner, run).await?;
        }
        Ok(())
    }

    /// Create deferred sources, then attach the plugin's subscriptions
    pub async fn after_start(&self) -> Result<()> {
        self.provision_sources(true)?;
        self.bus.subscribe(Event::new("*"), self.bus_handler());
        info!(plugin = %self.name, "Plugin started");
        Ok(())
    }

    fn provision_sources(&self, deferred: bool) -> Result<()> {
        for (app_name, app) in &self.config.apps {
            let app_key = format!("{}:{app_name}", self.name);

            for (key, source) in app.sources.iter().filter(|(_, s)| s.defer == deferred) {
                let apps = self.db.apps_without_source(&app_key, key)?;
                if !apps.is_empty() {
                    debug!(plugin = %self.name, app = %app_key, source = %key, "Creating source for all users");
                }
                for (app_id, owner) in apps {
                    self.db.create_source(&NewSource {
                        owner,
                        app: Some(app_id),
                        key: Some(key.clone()),
                        source_type: source.source_type.clone(),
                        name: source.name.clone(),
                    })?;
                }
            }
        }
        Ok(())
    }

    fn bus_handler(&self) -> Arc<dyn EventHandler> {
        Arc::clone(&self.events) as Arc<dyn EventHandler>
    }

    /// Stop receiving events from the bus
    pub fn detach(&self) {
        self.bus.unsubscribe_all(&self.bus_handler());
    }

    /// Detach subscriptions and stop every runner of the plugin
    pub async fn close(&self) {
        self.detach();
        self.manager.stop_plugin(&self.name).await;
        info!(plugin = %self.name, "Plugin stopped");
    }
}
