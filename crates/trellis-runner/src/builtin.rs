//! `builtin` runtime: runners compiled into the host binary

use crate::info::RunnerInfo;
use crate::runtype::TypeHandler;
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info};
use trellis_core::{Error, Result, SharedHandler};
use trellis_store::Database;

/// Start or stop hook of a builtin
pub type LifecycleFn =
    Arc<dyn Fn(Database, Arc<RunnerInfo>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Wrap an async closure as a [`LifecycleFn`]
pub fn lifecycle_fn<F, Fut>(f: F) -> LifecycleFn
where
    F: Fn(Database, Arc<RunnerInfo>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(
        move |db: Database, info: Arc<RunnerInfo>| -> BoxFuture<'static, Result<()>> {
            Box::pin(f(db, info))
        },
    )
}

/// One builtin's hooks and request handler
#[derive(Clone, Default)]
pub struct BuiltinRegistration {
    /// Called when a runner using this builtin starts
    pub start: Option<LifecycleFn>,
    /// Called when a runner using this builtin stops
    pub stop: Option<LifecycleFn>,
    /// Request handler served for the runner
    pub handler: Option<SharedHandler>,
}

impl BuiltinRegistration {
    /// Empty registration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the start hook
    pub fn on_start(mut self, f: LifecycleFn) -> Self {
        self.start = Some(f);
        self
    }

    /// Set the stop hook
    pub fn on_stop(mut self, f: LifecycleFn) -> Self {
        self.stop = Some(f);
        self
    }

    /// Set the request handler
    pub fn with_handler(mut self, handler: SharedHandler) -> Self {
        self.handler = Some(handler);
        self
    }
}

impl fmt::Debug for BuiltinRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuiltinRegistration")
            .field("start", &self.start.is_some())
            .field("stop", &self.stop.is_some())
            .field("handler", &self.handler)
            .finish()
    }
}

/// Builtins available to the host, fixed once built
#[derive(Debug, Default)]
pub struct BuiltinRegistry {
    entries: HashMap<String, BuiltinRegistration>,
}

impl BuiltinRegistry {
    /// Start building a registry
    pub fn builder() -> BuiltinRegistryBuilder {
        BuiltinRegistryBuilder::default()
    }

    /// Look up a builtin by key
    pub fn get(&self, key: &str) -> Option<&BuiltinRegistration> {
        self.entries.get(key)
    }

    /// Registered keys
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

/// Builder for [`BuiltinRegistry`]
#[derive(Debug, Default)]
pub struct BuiltinRegistryBuilder {
    entries: HashMap<String, BuiltinRegistration>,
}

impl BuiltinRegistryBuilder {
    /// Register a builtin, replacing any earlier registration of `key`
    pub fn register(mut self, key: impl Into<String>, registration: BuiltinRegistration) -> Self {
        self.entries.insert(key.into(), registration);
        self
    }

    /// Freeze the registry
    pub fn build(self) -> Arc<BuiltinRegistry> {
        Arc::new(BuiltinRegistry {
            entries: self.entries,
        })
    }
}

/// Wrap a migration as a start hook that tracks the plugin's schema version
///
/// `migrate` is called on every start with the stored version (0 when none
/// was stored) and must do nothing once at `target_version`. The new version
/// is persisted only when it differs from the stored one.
pub fn with_version<F, Fut>(plugin: impl Into<String>, target_version: i64, migrate: F) -> LifecycleFn
where
    F: Fn(Database, Arc<RunnerInfo>, i64) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let plugin: Arc<str> = Arc::from(plugin.into());
    let migrate = Arc::new(migrate);

    Arc::new(move |db: Database, info: Arc<RunnerInfo>| -> BoxFuture<'static, Result<()>> {
        let plugin = Arc::clone(&plugin);
        let migrate = Arc::clone(&migrate);
        Box::pin(async move {
            let current = db.plugin_version(&plugin)?.unwrap_or(0);
            migrate(db.clone(), info, current).await?;
            if current != target_version {
                info!(plugin = %plugin, from = current, to = target_version, "Plugin schema migrated");
                db.set_plugin_version(&plugin, target_version)?;
            }
            Ok(())
        })
    })
}

/// Handler for `builtin` runners
#[derive(Debug)]
pub struct BuiltinHandler {
    registry: Arc<BuiltinRegistry>,
    db: Database,
    running: Mutex<HashMap<String, (String, Arc<RunnerInfo>)>>,
}

impl BuiltinHandler {
    /// Create a handler over a frozen registry
    pub fn new(registry: Arc<BuiltinRegistry>, db: Database) -> Self {
        Self {
            registry,
            db,
            running: Mutex::new(HashMap::new()),
        }
    }

    fn registration(&self, info: &RunnerInfo) -> Result<(String, &BuiltinRegistration)> {
        let key = info
            .setting("key")
            .ok_or_else(|| Error::config(format!("{}: builtin runners need a key", info.id())))?;
        let registration = self
            .registry
            .get(key)
            .ok_or_else(|| Error::UnknownBuiltinKey(key.to_string()))?;
        Ok((key.to_string(), registration))
    }
}

#[async_trait]
impl TypeHandler for BuiltinHandler {
    async fn start(&self, info: Arc<RunnerInfo>) -> Result<Option<SharedHandler>> {
        let (key, registration) = self.registration(&info)?;

        if let Some(start) = &registration.start {
            start(self.db.clone(), Arc::clone(&info)).await?;
        }
        debug!(runner = %info.id(), key = %key, "Builtin started");

        let handler = registration.handler.clone();
        self.running
            .lock()
            .insert(info.api_key.clone(), (key, info));
        Ok(handler)
    }

    async fn run(&self, info: Arc<RunnerInfo>) -> Result<()> {
        let api_key = info.api_key.clone();
        self.start(info).await?;
        self.stop(&api_key).await
    }

    async fn stop(&self, api_key: &str) -> Result<()> {
        let Some((key, info)) = self.running.lock().remove(api_key) else {
            return Ok(());
        };
        let Some(registration) = self.registry.get(&key) else {
            return Ok(());
        };

        if let Some(stop) = &registration.stop {
            stop(self.db.clone(), Arc::clone(&info)).await?;
        }
        debug!(runner = %info.id(), key = %key, "Builtin stopped");
        Ok(())
    }

    async fn kill(&self, api_key: &str) -> Result<()> {
        self.running.lock().remove(api_key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
    use trellis_config::RunConfig;
    use trellis_core::{body, handler_fn, Body, Request, Response};
    use trellis_events::Router;

    fn db() -> Database {
        Database::open_in_memory(Arc::new(Router::new())).unwrap()
    }

    fn info(key: &str) -> Arc<RunnerInfo> {
        let mut run = RunConfig::default();
        run.run_type = Some("builtin".into());
        run.config.insert("key".into(), key.into());
        Arc::new(RunnerInfo {
            plugin: "notes".into(),
            name: "core".into(),
            api_key: crate::info::generate_api_key(),
            run,
            root_dir: ".".into(),
            data_dir: ".".into(),
            plugin_dir: ".".into(),
            config: serde_json::Value::Null,
        })
    }

    #[tokio::test]
    async fn test_start_and_stop_hooks() {
        let starts = Arc::new(AtomicUsize::new(0));
        let stops = Arc::new(AtomicUsize::new(0));

        let registry = BuiltinRegistry::builder()
            .register(
                "notes",
                BuiltinRegistration::new()
                    .on_start(lifecycle_fn({
                        let starts = Arc::clone(&starts);
                        move |_db, _info| {
                            let starts = Arc::clone(&starts);
                            async move {
                                starts.fetch_add(1, Ordering::SeqCst);
                                Ok(())
                            }
                        }
                    }))
                    .on_stop(lifecycle_fn({
                        let stops = Arc::clone(&stops);
                        move |_db, _info| {
                            let stops = Arc::clone(&stops);
                            async move {
                                stops.fetch_add(1, Ordering::SeqCst);
                                Ok(())
                            }
                        }
                    }))
                    .with_handler(Arc::new(handler_fn("notes", |_req: Request<Body>| async {
                        Response::new(body::full("notes"))
                    }))),
            )
            .build();

        let handler = BuiltinHandler::new(registry, db());
        let info = info("notes");

        assert!(handler.start(Arc::clone(&info)).await.unwrap().is_some());
        assert_eq!(starts.load(Ordering::SeqCst), 1);

        handler.stop(&info.api_key).await.unwrap();
        handler.stop(&info.api_key).await.unwrap();
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_key() {
        let handler = BuiltinHandler::new(BuiltinRegistry::builder().build(), db());
        let err = handler.start(info("missing")).await.unwrap_err();
        assert!(matches!(err, Error::UnknownBuiltinKey(k) if k == "missing"));
    }

    #[tokio::test]
    async fn test_with_version() {
        let db = db();
        let seen = Arc::new(AtomicI64::new(-1));

        let start = with_version("notes", 2, {
            let seen = Arc::clone(&seen);
            move |_db, _info, current| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.store(current, Ordering::SeqCst);
                    Ok(())
                }
            }
        });

        start(db.clone(), info("notes")).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 0);
        assert_eq!(db.plugin_version("notes").unwrap(), Some(2));

        // migrate still runs once at the target version
        start(db.clone(), info("notes")).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(db.plugin_version("notes").unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_failed_migration_keeps_version() {
        let db = db();
        let start = with_version("notes", 3, |_db, _info, _current| async {
            Err(Error::Database("migration failed".into()))
        });

        assert!(start(db.clone(), info("notes")).await.is_err());
        assert_eq!(db.plugin_version("notes").unwrap(), None);
    }
}
