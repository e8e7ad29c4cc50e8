//! Shared fixtures for orchestrator tests

#![allow(dead_code)]

use http_body_util::BodyExt;
use std::sync::{Arc, Mutex};
use trellis_config::{Config, PluginConfig, RunConfig};
use trellis_core::response::responses;
use trellis_core::{body, handler_fn, Body, Error, Request, Response, SharedHandler, StatusCode};
use trellis_events::Router;
use trellis_plugins::PluginManager;
use trellis_runner::{lifecycle_fn, BuiltinRegistration, BuiltinRegistry, Manager, RunnerInfo};
use trellis_store::Database;

pub type Log = Arc<Mutex<Vec<String>>>;

pub struct Harness {
    pub pm: Arc<PluginManager>,
    pub manager: Arc<Manager>,
    pub db: Database,
    pub bus: Arc<Router>,
    pub log: Log,
}

impl Harness {
    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

/// Builtin runner bound to `key`
pub fn builtin(key: &str) -> RunConfig {
    let mut run = RunConfig::default();
    run.run_type = Some("builtin".into());
    run.config.insert("key".into(), key.into());
    run
}

/// Plugin with one builtin runner named `api`, keyed by the plugin name
pub fn plugin(name: &str, routes: &[(&str, &str)]) -> PluginConfig {
    let mut config = PluginConfig::default();
    config.run.insert("api".into(), builtin(name));
    for (route, target) in routes {
        config.routes.insert(route.to_string(), target.to_string());
    }
    config
}

/// Registry with one builtin per key. Each logs its start and stop and
/// answers requests with its key. Keys in `failing` refuse to start.
pub fn registry(keys: &[&str], failing: &[&str], log: &Log) -> Arc<BuiltinRegistry> {
    let mut builder = BuiltinRegistry::builder();
    for key in keys {
        let key: &'static str = Box::leak(key.to_string().into_boxed_str());
        let fails = failing.contains(&key);

        let start_log = Arc::clone(log);
        let stop_log = Arc::clone(log);
        let registration = BuiltinRegistration::new()
            .on_start(lifecycle_fn(move |_db, info: Arc<RunnerInfo>| {
                let log = Arc::clone(&start_log);
                async move {
                    if fails {
                        return Err(Error::Internal(format!("{} refused to start", info.plugin)));
                    }
                    log.lock().unwrap().push(format!("start:{}", info.plugin));
                    Ok(())
                }
            }))
            .on_stop(lifecycle_fn(move |_db, info: Arc<RunnerInfo>| {
                let log = Arc::clone(&stop_log);
                async move {
                    log.lock().unwrap().push(format!("stop:{}", info.plugin));
                    Ok(())
                }
            }))
            .with_handler(Arc::new(handler_fn(key, move |req: Request<Body>| async move {
                let overlay = req.headers().contains_key("x-overlay");
                Response::builder()
                    .header("x-saw-overlay", overlay.to_string())
                    .body(body::full(key))
                    .unwrap()
            })));
        builder = builder.register(key, registration);
    }
    builder.build()
}

/// Core handler answering 404 with body `core`
pub fn core() -> SharedHandler {
    Arc::new(handler_fn("core", |_req: Request<Body>| async {
        let mut res = responses::not_found("core");
        res.headers_mut().insert("x-core", "1".parse().unwrap());
        res
    }))
}

pub fn harness(config: &Config, keys: &[&str], failing: &[&str]) -> Harness {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let bus = Arc::new(Router::new());
    let db = Database::open_in_memory(Arc::clone(&bus)).unwrap();
    let manager = Arc::new(
        Manager::new(
            Arc::new(config.clone()),
            db.clone(),
            registry(keys, failing, &log),
        )
        .unwrap(),
    );
    let pm = Arc::new(PluginManager::new(
        Arc::clone(&manager),
        db.clone(),
        Arc::clone(&bus),
        core(),
    ));
    Harness {
        pm,
        manager,
        db,
        bus,
        log,
    }
}

/// Send a GET through the plugin manager, returning status, whether the
/// core answered, and the body
pub async fn get(h: &Harness, path: &str, headers: &[(&str, &str)]) -> (StatusCode, bool, String) {
    use trellis_core::Handler;

    let mut req = Request::builder().uri(path);
    for (name, value) in headers {
        req = req.header(*name, *value);
    }
    let res = h.pm.call(req.body(body::empty()).unwrap()).await;
    let status = res.status();
    let from_core = res.headers().contains_key("x-core");
    let bytes = res.into_body().collect().await.unwrap().to_bytes();
    (status, from_core, String::from_utf8(bytes.to_vec()).unwrap())
}
