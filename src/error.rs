//! Error types for fedlink
//!
//! All federation failures are converted to `AppError`, which implements
//! `IntoResponse` so the HTTP boundary can map them to status codes.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Application-wide error type
///
/// The first five variants are the federation failure taxonomy. Each has a
/// fixed recovery policy:
///
/// - `Resolution` and `LocalLookup` are skipped and logged inside batches
/// - `Authentication` aborts the single inbound request with a 4xx
/// - `MalformedActivity` is a 400 inline, or aborts one background task
/// - `Delivery` is logged and swallowed by background callers
#[derive(Debug, Error)]
pub enum AppError {
    /// WebFinger or actor fetch miss (502)
    #[error("Resolution failed: {0}")]
    Resolution(String),

    /// Signature missing, malformed or not verifiable (400)
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Required activity field missing or of the wrong shape (400)
    #[error("Malformed activity: {0}")]
    MalformedActivity(String),

    /// Outbound POST failed or was rejected (502)
    #[error("Delivery failed: {0}")]
    Delivery(String),

    /// Unknown local user or actor mapping (404)
    #[error("Local lookup failed: {0}")]
    LocalLookup(String),

    /// Resource not found (404)
    #[error("Resource not found")]
    NotFound,

    /// Validation error (400)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Configuration error (500)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal server error (500)
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl AppError {
    /// Short label used for metrics and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Resolution(_) => "resolution",
            AppError::Authentication(_) => "authentication",
            AppError::MalformedActivity(_) => "malformed_activity",
            AppError::Delivery(_) => "delivery",
            AppError::LocalLookup(_) => "local_lookup",
            AppError::NotFound => "not_found",
            AppError::Validation(_) => "validation",
            AppError::Config(_) => "config",
            AppError::Internal(_) => "internal",
        }
    }

    /// HTTP status for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::NotFound | AppError::LocalLookup(_) => StatusCode::NOT_FOUND,
            AppError::Authentication(_)
            | AppError::MalformedActivity(_)
            | AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Resolution(_) | AppError::Delivery(_) => StatusCode::BAD_GATEWAY,
            AppError::Config(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    /// Convert error to HTTP response
    ///
    /// Peers only ever see the status code and a small JSON body; internal
    /// details are not echoed for 5xx errors.
    fn into_response(self) -> Response {
        use axum::Json;

        let status = self.status_code();
        let error_message = match &self {
            AppError::Config(_) | AppError::Internal(_) => "Internal server error".to_string(),
            _ => self.to_string(),
        };

        crate::metrics::ERRORS_TOTAL
            .with_label_values(&[self.kind()])
            .inc();

        let body = Json(serde_json::json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;
