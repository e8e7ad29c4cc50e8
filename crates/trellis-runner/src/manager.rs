//! Registry of live runners

use crate::builtin::{BuiltinHandler, BuiltinRegistry};
use crate::exec::ExecHandler;
use crate::info::{generate_api_key, RunnerInfo};
use crate::runtype::{RunType, TypeHandler};
use crate::schedule::{JobId, Scheduler};
use async_trait::async_trait;
use http::uri::{PathAndQuery, Uri};
use http::HeaderValue;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info};
use trellis_bridge::{single_joining_slash, ReverseProxy};
use trellis_config::{parse_cron, Config, RunConfig};
use trellis_core::response::responses;
use trellis_core::{headers, Body, Error, Handler, Request, Response, Result, SharedHandler};
use trellis_store::Database;

/// Plugin name of the core runner
pub const CORE_PLUGIN: &str = "trellis";

/// Runner name of the core runner
pub const CORE_RUNNER: &str = "core";

/// A live runner
#[derive(Debug, Clone)]
pub struct Runner {
    /// Runner identity
    pub info: Arc<RunnerInfo>,

    /// Request handler, once the runner has started
    pub handler: Option<SharedHandler>,

    job: Option<JobId>,
}

/// Owns every live runner, keyed by api key
#[derive(Debug)]
pub struct Manager {
    config: Arc<Config>,
    config_json: serde_json::Value,
    exec: Arc<ExecHandler>,
    builtin: Arc<BuiltinHandler>,
    runners: RwLock<HashMap<String, Runner>>,
    scheduler: Scheduler,
    core_key: String,
}

impl Manager {
    /// Create a manager and register the core runner
    pub fn new(config: Arc<Config>, db: Database, builtins: Arc<BuiltinRegistry>) -> Result<Self> {
        let config_json = serde_json::to_value(config.as_ref())?;

        let core = Arc::new(RunnerInfo {
            plugin: CORE_PLUGIN.to_string(),
            name: CORE_RUNNER.to_string(),
            api_key: generate_api_key(),
            run: RunConfig::default(),
            root_dir: config.server.root_dir.clone(),
            data_dir: config.server.data_dir.clone(),
            plugin_dir: config.server.root_dir.clone(),
            config: config_json.clone(),
        });
        let core_key = core.api_key.clone();

        let mut runners = HashMap::new();
        runners.insert(
            core_key.clone(),
            Runner {
                info: core,
                handler: None,
                job: None,
            },
        );

        Ok(Self {
            exec: Arc::new(ExecHandler::new(&config)),
            builtin: Arc::new(BuiltinHandler::new(builtins, db)),
            config,
            config_json,
            runners: RwLock::new(runners),
            scheduler: Scheduler::new(),
            core_key,
        })
    }

    /// Global configuration
    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Api key of the core runner
    pub fn core_key(&self) -> &str {
        &self.core_key
    }

    /// Serve `handler` as the core runner's handler
    pub fn set_core_handler(&self, handler: SharedHandler) {
        if let Some(core) = self.runners.write().get_mut(&self.core_key) {
            core.handler = Some(handler);
        }
    }

    fn type_handler(&self, run_type: RunType) -> Arc<dyn TypeHandler> {
        match run_type {
            RunType::Exec => self.exec.clone(),
            RunType::Builtin => self.builtin.clone(),
        }
    }

    /// Start a runner
    ///
    /// Periodic runners are scheduled and have no handler; others are
    /// started immediately and their handler stored.
    pub async fn start(&self, plugin: &str, name: &str, run: &RunConfig) -> Result<()> {
        if !run.is_enabled() {
            debug!(plugin = %plugin, runner = %name, "Runner disabled, skipping");
            return Ok(());
        }

        let run_type: RunType = run.run_type().parse()?;
        let type_handler = self.type_handler(run_type);

        let info = Arc::new(RunnerInfo {
            plugin: plugin.to_string(),
            name: name.to_string(),
            api_key: generate_api_key(),
            run: run.clone(),
            root_dir: self.config.server.root_dir.clone(),
            data_dir: self.config.server.data_dir.clone(),
            plugin_dir: self.config.plugin_dir(plugin),
            config: self.config_json.clone(),
        });

        let job = match &run.cron {
            Some(expr) => {
                let schedule = parse_cron(expr)
                    .map_err(|e| Error::config(format!("{}: invalid cron '{expr}': {e}", info.id())))?;
                Some(schedule)
            }
            None => None,
        };

        // registered before starting so the runner can be resolved by key
        // while it comes up
        let key = info.api_key.clone();
        self.runners.write().insert(
            key.clone(),
            Runner {
                info: Arc::clone(&info),
                handler: None,
                job: None,
            },
        );

        match job {
            Some(schedule) => {
                let job = self.scheduler.add(info.id(), schedule, {
                    let info = Arc::clone(&info);
                    move || {
                        let type_handler = Arc::clone(&type_handler);
                        let info = Arc::clone(&info);
                        async move {
                            debug!(runner = %info.id(), "Running scheduled job");
                            if let Err(e) = type_handler.run(Arc::clone(&info)).await {
                                error!(runner = %info.id(), error = %e, "Scheduled run failed");
                            }
                        }
                    }
                });
                let registered = match self.runners.write().get_mut(&key) {
                    Some(runner) => {
                        runner.job = Some(job);
                        true
                    }
                    None => false,
                };
                if !registered {
                    // stopped while being scheduled
                    self.scheduler.remove(job);
                    return Err(Error::NotFound(format!("runner {}", info.id())));
                }
                info!(plugin = %plugin, runner = %name, cron = ?run.cron, "Runner scheduled");
            }
            None => {
                let handler = match type_handler.start(Arc::clone(&info)).await {
                    Ok(handler) => handler,
                    Err(e) => {
                        self.runners.write().remove(&key);
                        return Err(e);
                    }
                };
                let registered = match self.runners.write().get_mut(&key) {
                    Some(runner) => {
                        runner.handler = handler;
                        true
                    }
                    None => false,
                };
                if !registered {
                    // stopped while starting
                    type_handler.kill(&key).await?;
                    return Err(Error::NotFound(format!("runner {}", info.id())));
                }
                info!(plugin = %plugin, runner = %name, runtype = %run_type, "Runner started");
            }
        }
        Ok(())
    }

    /// Stop a runner
    pub async fn stop(&self, plugin: &str, name: &str) -> Result<()> {
        let runner = {
            let mut runners = self.runners.write();
            let key = runners
                .iter()
                .find(|(key, r)| {
                    **key != self.core_key && r.info.plugin == plugin && r.info.name == name
                })
                .map(|(key, _)| key.clone())
                .ok_or_else(|| Error::NotFound(format!("runner {plugin}/{name}")))?;
            runners.remove(&key)
        };
        let Some(runner) = runner else {
            return Err(Error::NotFound(format!("runner {plugin}/{name}")));
        };

        self.teardown(runner, false).await
    }

    async fn teardown(&self, runner: Runner, force: bool) -> Result<()> {
        if let Some(job) = runner.job {
            self.scheduler.remove(job);
        }

        let run_type: RunType = runner.info.run.run_type().parse()?;
        let type_handler = self.type_handler(run_type);
        if force {
            type_handler.kill(&runner.info.api_key).await?;
        } else {
            type_handler.stop(&runner.info.api_key).await?;
        }
        info!(plugin = %runner.info.plugin, runner = %runner.info.name, "Runner stopped");
        Ok(())
    }

    /// Stop every runner of a plugin, one at a time
    pub async fn stop_plugin(&self, plugin: &str) {
        let mut names: Vec<String> = self
            .runners
            .read()
            .iter()
            .filter(|(key, r)| **key != self.core_key && r.info.plugin == plugin)
            .map(|(_, r)| r.info.name.clone())
            .collect();
        names.sort();

        for name in names {
            if let Err(e) = self.stop(plugin, &name).await {
                error!(plugin = %plugin, runner = %name, error = %e, "Failed to stop runner");
            }
        }
    }

    /// Forcefully stop every runner
    pub async fn kill(&self) {
        let runners: Vec<Runner> = {
            let mut runners = self.runners.write();
            let keys: Vec<String> = runners
                .keys()
                .filter(|key| **key != self.core_key)
                .cloned()
                .collect();
            keys.iter().filter_map(|key| runners.remove(key)).collect()
        };

        for runner in runners {
            let id = runner.info.id();
            if let Err(e) = self.teardown(runner, true).await {
                error!(runner = %id, error = %e, "Failed to kill runner");
            }
        }
    }

    /// Find a runner by plugin and name
    pub fn find(&self, plugin: &str, name: &str) -> Option<Runner> {
        self.runners
            .read()
            .values()
            .find(|r| r.info.plugin == plugin && r.info.name == name)
            .cloned()
    }

    /// Identity of the runner holding `api_key`
    pub fn get_info_by_key(&self, api_key: &str) -> Option<Arc<RunnerInfo>> {
        self.runners
            .read()
            .get(api_key)
            .map(|r| Arc::clone(&r.info))
    }

    /// Number of live runners, including the core runner
    pub fn len(&self) -> usize {
        self.runners.read().len()
    }

    /// Whether only the core runner is registered
    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }

    /// Resolve a handler for `uri` on behalf of `plugin`
    ///
    /// `run://[plugin:]name[/path]` resolves to a live runner's handler, the
    /// plugin defaulting to the caller's. Anything else is treated as a proxy
    /// target.
    pub fn get_handler(&self, plugin: &str, uri: &str) -> Result<SharedHandler> {
        let Some(reference) = uri.strip_prefix("run://") else {
            let proxy = ReverseProxy::new(&self.config.server.data_dir, uri)?
                .with_verbose(self.config.verbose);
            return Ok(Arc::new(proxy));
        };

        let (target, path) = match reference.find('/') {
            Some(idx) => reference.split_at(idx),
            None => (reference, ""),
        };
        let (owner, name) = target.split_once(':').unwrap_or((plugin, target));
        if name.is_empty() {
            return Err(Error::config(format!("'{uri}' does not name a runner")));
        }

        let runner = self
            .find(owner, name)
            .ok_or_else(|| Error::NotFound(format!("runner {owner}/{name}")))?;
        let inner = runner
            .handler
            .ok_or_else(|| Error::NoHandler(format!("{owner}/{name}")))?;
        let api_key = HeaderValue::from_str(&runner.info.api_key)
            .map_err(|e| Error::Internal(format!("invalid api key: {e}")))?;

        Ok(Arc::new(RunnerHandler {
            api_key,
            prefix: (!path.is_empty() && path != "/").then(|| path.to_string()),
            inner,
        }))
    }
}

/// Forwards to a runner's handler, tagging requests with the runner's key
/// and prepending the path named in the `run://` reference
#[derive(Debug)]
struct RunnerHandler {
    api_key: HeaderValue,
    prefix: Option<String>,
    inner: SharedHandler,
}

impl RunnerHandler {
    fn rewrite(&self, uri: &Uri) -> std::result::Result<Option<Uri>, http::Error> {
        let Some(prefix) = &self.prefix else {
            return Ok(None);
        };
        let path = single_joining_slash(prefix, uri.path());
        let pq = match uri.query() {
            Some(q) => format!("{path}?{q}"),
            None => path,
        };
        let mut parts = uri.clone().into_parts();
        parts.path_and_query = Some(PathAndQuery::try_from(pq)?);
        Ok(Some(Uri::from_parts(parts)?))
    }
}

#[async_trait]
impl Handler for RunnerHandler {
    async fn call(&self, mut req: Request<Body>) -> Response<Body> {
        match self.rewrite(req.uri()) {
            Ok(Some(uri)) => *req.uri_mut() = uri,
            Ok(None) => {}
            Err(e) => return responses::bad_request(format!("invalid path: {e}")),
        }
        req.headers_mut()
            .insert(headers::X_PLUGIN_KEY, self.api_key.clone());
        self.inner.call(req).await
    }
}
