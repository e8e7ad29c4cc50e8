//! Response builder and the structured error body

use crate::body::{self, Body};
use http::{header, Response, StatusCode};
use serde::{Deserialize, Serialize};

/// Structured error body returned by any handler whose status is >= 400
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{error}:{error_description}")]
pub struct ErrorResponse {
    /// Short machine-readable code
    pub error: String,

    /// Human readable description
    #[serde(default)]
    pub error_description: String,

    /// Optional request or resource id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl ErrorResponse {
    /// Create a new error body
    pub fn new(error: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            error_description: description.into(),
            id: None,
        }
    }

    /// Attach an id
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Render this error as a JSON response with the given status
    pub fn into_response(self, status: StatusCode) -> Response<Body> {
        // Serializing a struct of plain strings cannot fail
        let json = serde_json::to_vec(&self).unwrap_or_default();
        let mut response = Response::new(body::full(json));
        *response.status_mut() = status;
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        response
    }
}

/// Response builder for convenient response construction
#[derive(Debug)]
pub struct ResponseBuilder {
    status: StatusCode,
    headers: Vec<(header::HeaderName, header::HeaderValue)>,
}

impl ResponseBuilder {
    /// Create a new response builder
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Vec::new(),
        }
    }

    /// Set a header
    pub fn header(mut self, name: header::HeaderName, value: header::HeaderValue) -> Self {
        self.headers.push((name, value));
        self
    }

    /// Build response with the given body
    pub fn body(self, body: Body) -> Response<Body> {
        let mut response = Response::new(body);
        *response.status_mut() = self.status;
        for (name, value) in self.headers {
            response.headers_mut().append(name, value);
        }
        response
    }

    /// Build response with JSON body
    pub fn json<T: Serialize>(self, value: &T) -> crate::Result<Response<Body>> {
        let json = serde_json::to_vec(value)?;
        Ok(self
            .header(
                header::CONTENT_TYPE,
                header::HeaderValue::from_static("application/json"),
            )
            .body(body::full(json)))
    }
}

/// Convenience functions for common responses
pub mod responses {
    use super::*;

    /// Error response for any [`Error`](crate::Error)
    pub fn from_error(err: &crate::Error) -> Response<Body> {
        err.to_error_response().into_response(err.to_status_code())
    }

    /// 400 `plugin_error` response
    pub fn bad_request(description: impl Into<String>) -> Response<Body> {
        ErrorResponse::new("plugin_error", description).into_response(StatusCode::BAD_REQUEST)
    }

    /// 404 Not Found
    pub fn not_found(description: impl Into<String>) -> Response<Body> {
        ErrorResponse::new("not_found", description).into_response(StatusCode::NOT_FOUND)
    }

    /// 500 Internal Server Error
    pub fn internal_error(description: impl Into<String>) -> Response<Body> {
        ErrorResponse::new("internal_error", description)
            .into_response(StatusCode::INTERNAL_SERVER_ERROR)
    }

    /// 502 Bad Gateway reported as a plugin error
    pub fn bad_gateway(description: impl Into<String>) -> Response<Body> {
        ErrorResponse::new("plugin_error", description).into_response(StatusCode::BAD_GATEWAY)
    }

    /// 503 Service Unavailable while plugins load
    pub fn loading() -> Response<Body> {
        ErrorResponse::new("loading", "trellis is currently loading plugins")
            .into_response(StatusCode::SERVICE_UNAVAILABLE)
    }
}
