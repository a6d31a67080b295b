use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

/// The §7 error taxonomy. Every fallible core operation returns one of these;
/// the `IntoResponse` impl is the only place that decides the status code and
/// the (deliberately generic) message a client sees.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("invalid credentials")]
    AuthFailed,

    #[error("spawn failed: {0}")]
    SpawnFailed(String),

    #[error("proxy error: {0}")]
    ProxyError(String),

    #[error("not found")]
    NotFound,

    #[error("store error: {0}")]
    StoreError(String),
}

impl From<turso::Error> for HubError {
    fn from(e: turso::Error) -> Self {
        HubError::StoreError(e.to_string())
    }
}

impl From<reqwest::Error> for HubError {
    fn from(e: reqwest::Error) -> Self {
        HubError::ProxyError(e.to_string())
    }
}

impl From<std::io::Error> for HubError {
    fn from(e: std::io::Error) -> Self {
        HubError::SpawnFailed(e.to_string())
    }
}

impl IntoResponse for HubError {
    fn into_response(self) -> Response {
        let status = match &self {
            HubError::AuthFailed => StatusCode::FORBIDDEN,
            HubError::SpawnFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            HubError::ProxyError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            HubError::NotFound => StatusCode::NOT_FOUND,
            HubError::StoreError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        match &self {
            HubError::StoreError(_) => tracing::error!(error = %self, "store error"),
            _ => tracing::warn!(error = %self, "request failed"),
        }

        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
