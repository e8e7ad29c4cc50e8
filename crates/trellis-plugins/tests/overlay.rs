//! Request routing through the overlay chain

mod common;

use common::{get, harness, plugin, Harness};
use trellis_config::{Config, ConfigBuilder, PluginConfig};
use trellis_core::{body, Handler, Request, StatusCode};

/// `a` and `c` carry routes; `b` sits between them without any
fn config() -> Config {
    ConfigBuilder::new()
        .plugin("a", plugin("a", &[("/x/*", "run://api"), ("/a", "run://api")]))
        .plugin("b", plugin("b", &[]))
        .plugin("c", plugin("c", &[("/x/*", "run://api")]))
        .build()
        .unwrap()
}

/// Api key of the runner `plugin` started, or of the core runner for `trellis`
fn key(h: &Harness, plugin: &str) -> String {
    let name = if plugin == "trellis" { "core" } else { "api" };
    h.manager.find(plugin, name).unwrap().info.api_key.clone()
}

async fn ready() -> Harness {
    let config = config();
    let h = harness(&config, &["a", "b", "c"], &[]);
    h.pm.reload(&config).await.unwrap();
    h
}

#[tokio::test]
async fn test_latest_plugin_sees_request_first() {
    let h = ready().await;
    assert_eq!(h.pm.head(), "c");

    let (status, from_core, body) = get(&h, "/x/1", &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert!(!from_core);
    assert_eq!(body, "c");
}

#[tokio::test]
async fn test_unmatched_routes_fall_through() {
    let h = ready().await;

    let (status, _, body) = get(&h, "/a", &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "a");

    let (status, from_core, _) = get(&h, "/elsewhere", &[]).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(from_core);
}

#[tokio::test]
async fn test_overlay_none_goes_to_core() {
    let h = ready().await;

    let (status, from_core, _) = get(&h, "/x/1", &[("x-overlay", "none")]).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(from_core);
}

#[tokio::test]
async fn test_overlay_next_skips_originating_plugin() {
    let h = ready().await;
    let (c, b, a) = (key(&h, "c"), key(&h, "b"), key(&h, "a"));

    let (_, _, body) = get(&h, "/x/1", &[("x-overlay", "next"), ("x-plugin-key", c.as_str())]).await;
    assert_eq!(body, "a");

    // b has no routes, so next of b is still a
    let (_, _, body) = get(&h, "/x/1", &[("x-overlay", "next"), ("x-plugin-key", b.as_str())]).await;
    assert_eq!(body, "a");

    let (_, from_core, _) = get(&h, "/x/1", &[("x-overlay", "next"), ("x-plugin-key", a.as_str())]).await;
    assert!(from_core);
}

#[tokio::test]
async fn test_client_plugin_id_is_ignored() {
    let h = ready().await;

    // without a runner key there is no originating plugin to skip past
    let (_, from_core, _) = get(&h, "/x/1", &[("x-overlay", "next"), ("x-plugin-id", "c")]).await;
    assert!(from_core);

    let (_, from_core, _) = get(&h, "/x/1", &[("x-overlay", "next"), ("x-plugin-key", "bogus")]).await;
    assert!(from_core);
}

#[tokio::test]
async fn test_overlay_header_is_stripped() {
    let h = ready().await;

    let req = Request::builder()
        .uri("/x/1")
        .header("x-overlay", "next")
        .header("x-plugin-key", key(&h, "c"))
        .body(body::empty())
        .unwrap();
    let res = h.pm.call(req).await;
    assert_eq!(res.headers()["x-saw-overlay"], "false");
}

#[tokio::test]
async fn test_multiple_overlay_values_rejected() {
    let h = ready().await;

    let (status, _, body) = get(&h, "/x/1", &[("x-overlay", "none"), ("x-overlay", "next")]).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let er: trellis_core::ErrorResponse = serde_json::from_str(&body).unwrap();
    assert_eq!(er.error, "plugin_error");
    assert_eq!(er.error_description, "invalid overlay");
}

#[tokio::test]
async fn test_loading_gate() {
    let config = config();
    let h = harness(&config, &["a", "b", "c"], &[]);

    let (status, _, body) = get(&h, "/x/1", &[]).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let er: trellis_core::ErrorResponse = serde_json::from_str(&body).unwrap();
    assert_eq!(er.error, "loading");

    // a client cannot claim to be a plugin
    let (status, _, _) = get(&h, "/x/1", &[("x-plugin-id", "a")]).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let (status, _, _) = get(&h, "/x/1", &[("x-plugin-key", "bogus")]).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    // runner traffic is let through while loading
    let core = key(&h, "trellis");
    let (status, from_core, _) = get(&h, "/x/1", &[("x-plugin-key", core.as_str())]).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(from_core);
}

#[tokio::test]
async fn test_closing_plugin_leaves_chain() {
    let h = ready().await;
    h.pm.close().await.unwrap();

    let (status, _, _) = get(&h, "/x/1", &[]).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_chain_without_routes() {
    let config = ConfigBuilder::new()
        .plugin("quiet", PluginConfig::default())
        .build()
        .unwrap();
    let h = harness(&config, &[], &[]);
    h.pm.reload(&config).await.unwrap();
    assert_eq!(h.pm.head(), "none");

    let (_, from_core, _) = get(&h, "/x/1", &[]).await;
    assert!(from_core);
}

#[tokio::test]
async fn test_core_runner_reaches_core_handler() {
    let h = ready().await;
    let handler = h
        .manager
        .get_handler("a", "run://trellis:core")
        .unwrap();
    let res = handler
        .call(Request::builder().uri("/").body(body::empty()).unwrap())
        .await;
    assert!(res.headers().contains_key("x-core"));
}
