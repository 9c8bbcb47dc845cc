//! Error model for the aggregator
//!
//! Errors are typed per layer with `thiserror`. Only [`AppError`] ever reaches
//! an HTTP client as a failed request; the per-account errors are folded into
//! the `error`/`warning` fields of an account result and never cross account
//! boundaries.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

/// Request-level error
///
/// Raised only when the request as a whole cannot be served (the token
/// directory cannot be enumerated, invalid parameters, account management
/// failures). Individual account failures never produce an `AppError`.
#[derive(Debug, Error)]
pub enum AppError {
    /// Invalid user input (bad query parameter, malformed body)
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Resource not found (unknown account)
    #[error("not found: {0}")]
    NotFound(String),
    /// Invalid or missing configuration
    #[error("configuration error: {0}")]
    Config(String),
    /// Token store I/O failure (directory unreadable, delete failed)
    #[error("token store error: {0}")]
    Store(String),
    /// Google rejected an enrollment step (code exchange, profile lookup)
    #[error("upstream error: {0}")]
    Upstream(String),
    /// Internal error (unexpected failure, external crate error)
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Convenience constructor for `InvalidInput`
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// HTTP status for this error
    ///
    /// # Mappings
    ///
    /// - `InvalidInput` → `400 Bad Request`
    /// - `NotFound` → `404 Not Found`
    /// - `Upstream` → `502 Bad Gateway`
    /// - `Config`, `Store`, `Internal` → `500 Internal Server Error`
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::Config(_) | Self::Store(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, "request rejected");
        }
        let message = match self {
            Self::InvalidInput(msg) | Self::NotFound(msg) => msg,
            other => other.to_string(),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// Type alias for fallible request-level operations
pub type AppResult<T> = Result<T, AppError>;

/// Failure to obtain an authenticated handle for one account
#[derive(Debug, Error)]
pub enum CredentialError {
    /// No token file exists for the identifier
    #[error("Token not found: {0}")]
    NotFound(String),
    /// Token file exists but could not be read or parsed
    #[error("Token unreadable: {0}")]
    Unreadable(String),
    /// Token is not valid and carries nothing to refresh it with
    #[error("Token invalid and cannot refresh: {0}")]
    Unrefreshable(String),
    /// The refresh grant was attempted and failed
    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),
    /// The authorization-code grant was attempted and failed
    #[error("Authorization code exchange failed: {0}")]
    ExchangeFailed(String),
}

/// Failure of one Mail Provider API call
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Transport failure (connect, TLS, body read)
    #[error("request failed: {0}")]
    Transport(String),
    /// Non-success HTTP status from the API
    #[error("API returned {status}: {body}")]
    Status { status: u16, body: String },
    /// Response body did not match the expected shape
    #[error("unexpected response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

/// Anything that ends one account's unit of work
///
/// Always rendered into `AccountResult::error`; the display strings are what
/// clients see.
#[derive(Debug, Error)]
pub enum AccountError {
    #[error(transparent)]
    Credential(#[from] CredentialError),
    /// Listing or identity lookup failed
    #[error(transparent)]
    Provider(#[from] ProviderError),
    /// Opt-in per-account deadline elapsed
    #[error("timed out after {0} ms")]
    Timeout(u64),
    /// The account task panicked or was cancelled
    #[error("account task aborted: {0}")]
    Aborted(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_matches_variant() {
        assert_eq!(AppError::invalid("x").status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            AppError::NotFound("x".to_owned()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::Store("x".to_owned()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            AppError::Upstream("x".to_owned()).status(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn account_error_displays_inner_credential_message() {
        let err = AccountError::from(CredentialError::NotFound("a@example.com".to_owned()));
        assert_eq!(err.to_string(), "Token not found: a@example.com");
    }
}
