//! Control headers understood by the overlay chain

use http::{HeaderMap, HeaderName};

/// Skip-ahead control header (`none` or `next`)
pub const X_OVERLAY: HeaderName = HeaderName::from_static("x-overlay");

/// Identifies the plugin that originated an internal request
pub const X_PLUGIN_ID: HeaderName = HeaderName::from_static("x-plugin-id");

/// Carries the api key of the runner a request was forwarded to or came from
pub const X_PLUGIN_KEY: HeaderName = HeaderName::from_static("x-plugin-key");

/// `X-Overlay` value that bypasses every plugin
pub const OVERLAY_NONE: &str = "none";

/// `X-Overlay` value that advances past the originating plugin
pub const OVERLAY_NEXT: &str = "next";

/// Plugin that originated the request, if any
pub fn plugin_id(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(&X_PLUGIN_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

/// Runner api key presented with the request, if any
pub fn plugin_key(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(&X_PLUGIN_KEY)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}
