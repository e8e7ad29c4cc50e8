//! Route table of one plugin

use http::Method;
use regex::Regex;
use std::cmp::Reverse;
use trellis_core::{Error, Result, SharedHandler};

/// Path pattern
///
/// Patterns:
/// - `/notes` - static path
/// - `/notes/:id` - one segment captured per parameter
/// - `/notes/*` - everything below `/notes/` (must be last)
#[derive(Debug)]
pub struct PathPattern {
    pattern: String,
    regex: Option<Regex>,
}

impl PathPattern {
    /// Compile a pattern
    pub fn new(pattern: impl Into<String>) -> Result<Self> {
        let pattern = pattern.into();
        if !pattern.starts_with('/') {
            return Err(Error::config(format!(
                "route pattern '{pattern}' must start with '/'"
            )));
        }

        let segments: Vec<&str> = pattern.split('/').skip(1).collect();
        let is_static = !segments
            .iter()
            .any(|s| s.starts_with(':') || s.starts_with('*'));
        if is_static {
            return Ok(Self {
                pattern,
                regex: None,
            });
        }

        let mut re = String::from("^");
        for (i, segment) in segments.iter().enumerate() {
            re.push('/');
            if let Some(name) = segment.strip_prefix(':') {
                if name.is_empty() {
                    return Err(Error::config(format!(
                        "route pattern '{pattern}' has an unnamed parameter"
                    )));
                }
                re.push_str("[^/]+");
            } else if segment.starts_with('*') {
                if i + 1 != segments.len() {
                    return Err(Error::config(format!(
                        "route pattern '{pattern}': '*' must be the last segment"
                    )));
                }
                re.push_str(".*");
            } else {
                re.push_str(&regex::escape(segment));
            }
        }
        re.push('$');

        let regex = Regex::new(&re)
            .map_err(|e| Error::config(format!("route pattern '{pattern}': {e}")))?;
        Ok(Self {
            pattern,
            regex: Some(regex),
        })
    }

    /// Whether `path` matches
    pub fn matches(&self, path: &str) -> bool {
        match &self.regex {
            None => path == self.pattern,
            Some(re) => re.is_match(path),
        }
    }

    /// The pattern as written
    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    /// Whether the pattern has no parameters or wildcard
    pub fn is_static(&self) -> bool {
        self.regex.is_none()
    }
}

#[derive(Debug)]
struct Route {
    method: Option<Method>,
    pattern: PathPattern,
    handler: SharedHandler,
}

/// Maps `[METHOD ]pattern` keys to handlers
///
/// Static patterns win over dynamic ones; among dynamic patterns the longer
/// one wins.
#[derive(Debug, Default)]
pub struct PluginMux {
    routes: Vec<Route>,
}

impl PluginMux {
    /// Create an empty mux
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a route, keyed `"/path"` or `"METHOD /path"`
    pub fn handle(&mut self, key: &str, handler: SharedHandler) -> Result<()> {
        let key = key.trim();
        let (method, pattern) = match key.split_once(char::is_whitespace) {
            Some((method, pattern)) => {
                let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
                    .map_err(|e| Error::config(format!("route '{key}': {e}")))?;
                (Some(method), pattern.trim())
            }
            None => (None, key),
        };

        self.routes.push(Route {
            method,
            pattern: PathPattern::new(pattern)?,
            handler,
        });
        self.routes.sort_by_key(|r| {
            (
                !r.pattern.is_static(),
                Reverse(r.pattern.as_str().len()),
                r.method.is_none(),
            )
        });
        Ok(())
    }

    /// Handler for a request, if any route matches
    pub fn route(&self, method: &Method, path: &str) -> Option<&SharedHandler> {
        self.routes
            .iter()
            .find(|r| r.method.as_ref().map_or(true, |m| m == method) && r.pattern.matches(path))
            .map(|r| &r.handler)
    }

    /// Number of routes
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether there are no routes
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
