//! Unified application error model and mapping helpers.
//! One error enum is shared by the HTTP handlers, the bookmark facade and the
//! sync client, with helpers mapping it onto HTTP responses and back.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AppError {
    Validation { code: String, message: String },
    NotFound { code: String, message: String },
    Auth { code: String, message: String },
    Csrf { code: String, message: String },
    Upstream { code: String, message: String },
    Io { code: String, message: String },
    Internal { code: String, message: String },
}

impl AppError {
    pub fn code_str(&self) -> &str {
        match self {
            AppError::Validation { code, .. }
            | AppError::NotFound { code, .. }
            | AppError::Auth { code, .. }
            | AppError::Csrf { code, .. }
            | AppError::Upstream { code, .. }
            | AppError::Io { code, .. }
            | AppError::Internal { code, .. } => code.as_str(),
        }
    }

    pub fn message(&self) -> &str {
        match self {
            AppError::Validation { message, .. }
            | AppError::NotFound { message, .. }
            | AppError::Auth { message, .. }
            | AppError::Csrf { message, .. }
            | AppError::Upstream { message, .. }
            | AppError::Io { message, .. }
            | AppError::Internal { message, .. } => message.as_str(),
        }
    }

    pub fn validation<S: Into<String>>(code: S, msg: S) -> Self { AppError::Validation { code: code.into(), message: msg.into() } }
    pub fn not_found<S: Into<String>>(code: S, msg: S) -> Self { AppError::NotFound { code: code.into(), message: msg.into() } }
    pub fn auth<S: Into<String>>(code: S, msg: S) -> Self { AppError::Auth { code: code.into(), message: msg.into() } }
    pub fn csrf<S: Into<String>>(code: S, msg: S) -> Self { AppError::Csrf { code: code.into(), message: msg.into() } }
    pub fn upstream<S: Into<String>>(code: S, msg: S) -> Self { AppError::Upstream { code: code.into(), message: msg.into() } }
    pub fn io<S: Into<String>>(code: S, msg: S) -> Self { AppError::Io { code: code.into(), message: msg.into() } }
    pub fn internal<S: Into<String>>(code: S, msg: S) -> Self { AppError::Internal { code: code.into(), message: msg.into() } }

    /// The facade refuses to run without a resolved identity.
    pub fn anonymous() -> Self { AppError::auth("auth_absent", "no authenticated session") }

    pub fn is_validation(&self) -> bool { matches!(self, AppError::Validation { .. }) }

    /// Map to HTTP status code.
    pub fn http_status(&self) -> u16 {
        match self {
            AppError::Validation { .. } => 400,
            AppError::NotFound { .. } => 404,
            AppError::Auth { .. } => 401,
            AppError::Csrf { .. } => 403,
            AppError::Upstream { .. } => 502,
            AppError::Io { .. } => 503,
            AppError::Internal { .. } => 500,
        }
    }

    /// Rebuild an error from a remote `{"status":"error","code","message"}` body.
    /// Used by HTTP clients so a 400 from the server is still a validation error locally.
    pub fn from_wire(status: u16, body: &serde_json::Value) -> Self {
        let code = body.get("code").and_then(|v| v.as_str()).unwrap_or("remote_error").to_string();
        let message = body.get("message").and_then(|v| v.as_str()).unwrap_or("remote error").to_string();
        match status {
            400 => AppError::Validation { code, message },
            401 => AppError::Auth { code, message },
            403 => AppError::Csrf { code, message },
            404 => AppError::NotFound { code, message },
            502 => AppError::Upstream { code, message },
            503 => AppError::Io { code, message },
            _ => AppError::Internal { code, message },
        }
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code_str(), self.message())
    }
}

impl std::error::Error for AppError {}

pub type AppResult<T> = Result<T, AppError>;

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        // Default mapping: treat as Internal unless downcasted elsewhere
        if let Some(app) = err.downcast_ref::<AppError>() { return app.clone(); }
        AppError::Internal { code: "internal_error".into(), message: err.to_string() }
    }
}

impl From<crate::identity::SessionError> for AppError {
    fn from(err: crate::identity::SessionError) -> Self {
        use crate::identity::SessionError;
        match err {
            SessionError::Entropy(_) => AppError::Internal { code: "entropy_unavailable".into(), message: err.to_string() },
            other => AppError::Auth { code: "session_invalid".into(), message: other.to_string() },
        }
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::Io { code: "transport_error".into(), message: err.to_string() }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(code = self.code_str(), "{}", self.message());
        }
        (status, Json(serde_json::json!({
            "status": "error",
            "code": self.code_str(),
            "message": self.message(),
        }))).into_response()
    }
}
