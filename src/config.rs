//! Configuration for the token directory, HTTP surface, and OAuth client
//!
//! All configuration is loaded from environment variables prefixed with
//! `GMAIL_AGG_`, plus the conventional `PORT`, `GOOGLE_CLIENT_ID`,
//! `GOOGLE_CLIENT_SECRET`, and `GOOGLE_REDIRECT_URI`. The resulting
//! [`AppConfig`] is built once at startup and handed to the aggregator and
//! HTTP state explicitly.

use std::env;
use std::env::VarError;
use std::net::SocketAddr;
use std::path::PathBuf;

use secrecy::SecretString;

use crate::errors::{AppError, AppResult};

/// Gmail REST API base used when `GMAIL_AGG_API_BASE` is unset
pub const DEFAULT_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1";

/// Per-account cap applied by the HTTP surface when `max` is omitted
pub const DEFAULT_HTTP_MAX: u32 = 7;

/// Read-only Gmail scope requested during enrollment by default
pub const GMAIL_READONLY_SCOPE: &str = "https://www.googleapis.com/auth/gmail.readonly";

/// Google OAuth2 consent endpoint
pub const DEFAULT_AUTH_URI: &str = "https://accounts.google.com/o/oauth2/auth";

/// Google OAuth2 token endpoint
pub const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// OAuth client used for enrollment, and for refresh when a token file
/// does not carry its own client credentials
///
/// Secrets are stored using `SecretString` to prevent accidental logging.
#[derive(Debug, Clone)]
pub struct OAuthClient {
    /// OAuth client ID
    pub client_id: Option<String>,
    /// OAuth client secret
    pub client_secret: Option<SecretString>,
    /// Consent page base URL
    pub auth_uri: String,
    /// Token endpoint for code exchange and refresh
    pub token_uri: String,
    /// Fixed callback URL; derived from the request host when unset
    pub redirect_uri: Option<String>,
    /// Scopes requested at enrollment
    pub scopes: Vec<String>,
}

impl Default for OAuthClient {
    fn default() -> Self {
        Self {
            client_id: None,
            client_secret: None,
            auth_uri: DEFAULT_AUTH_URI.to_owned(),
            token_uri: DEFAULT_TOKEN_URI.to_owned(),
            redirect_uri: None,
            scopes: vec![GMAIL_READONLY_SCOPE.to_owned()],
        }
    }
}

/// Application-wide configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Directory holding one `<email>.json` token per account
    pub tokens_dir: PathBuf,
    /// HTTP listen address
    pub bind: SocketAddr,
    /// Per-account cap used by `/unread` and `/latest` when `max` is omitted
    pub default_max: u32,
    /// Largest accepted `max` value
    pub max_limit: u32,
    /// Optional per-account deadline in milliseconds (unset = wait forever)
    pub account_timeout_ms: Option<u64>,
    /// Static page served at `/` when it exists
    pub frontend_path: PathBuf,
    /// Allowed CORS origins (empty = permissive)
    pub cors_origins: Vec<String>,
    /// OAuth client settings for enrollment and refresh
    pub oauth: OAuthClient,
    /// Gmail REST API base URL
    pub api_base: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            tokens_dir: PathBuf::from("tokens"),
            bind: SocketAddr::from(([0, 0, 0, 0], 5000)),
            default_max: DEFAULT_HTTP_MAX,
            max_limit: 100,
            account_timeout_ms: None,
            frontend_path: PathBuf::from("frontend.html"),
            cors_origins: Vec::new(),
            oauth: OAuthClient::default(),
            api_base: DEFAULT_API_BASE.to_owned(),
        }
    }
}

impl AppConfig {
    /// Load all configuration from environment variables
    ///
    /// Unset variables take their defaults; set-but-malformed variables are
    /// rejected rather than silently ignored.
    ///
    /// # Errors
    ///
    /// Returns `Config` if a variable is set to an unparseable value.
    ///
    /// # Example Environment
    ///
    /// ```text
    /// GMAIL_AGG_TOKENS_DIR=/var/lib/gmail-aggregator/tokens
    /// PORT=8080
    /// GMAIL_AGG_DEFAULT_MAX=7
    /// GMAIL_AGG_ACCOUNT_TIMEOUT_MS=20000
    /// GOOGLE_CLIENT_ID=1234.apps.googleusercontent.com
    /// GOOGLE_CLIENT_SECRET=secret
    /// GOOGLE_REDIRECT_URI=https://mail.example.com/oauth2callback
    /// GMAIL_AGG_SCOPES=https://www.googleapis.com/auth/gmail.readonly
    /// ```
    pub fn load_from_env() -> AppResult<Self> {
        let defaults = Self::default();

        let bind = match optional_env("GMAIL_AGG_BIND")? {
            Some(raw) => raw.parse::<SocketAddr>().map_err(|_| {
                AppError::Config(format!("invalid socket address GMAIL_AGG_BIND: '{raw}'"))
            })?,
            None => SocketAddr::from(([0, 0, 0, 0], parse_u16_env("PORT", 5000)?)),
        };

        let default_max = parse_u32_env("GMAIL_AGG_DEFAULT_MAX", defaults.default_max)?;
        let max_limit = parse_u32_env("GMAIL_AGG_MAX_LIMIT", defaults.max_limit)?;
        if default_max == 0 || default_max > max_limit {
            return Err(AppError::Config(format!(
                "GMAIL_AGG_DEFAULT_MAX must be in range 1..={max_limit}"
            )));
        }

        let account_timeout_ms = match optional_env("GMAIL_AGG_ACCOUNT_TIMEOUT_MS")? {
            Some(raw) => Some(raw.parse::<u64>().map_err(|_| {
                AppError::Config(format!(
                    "invalid u64 environment variable GMAIL_AGG_ACCOUNT_TIMEOUT_MS: '{raw}'"
                ))
            })?),
            None => None,
        }
        .filter(|ms| *ms > 0);

        Ok(Self {
            tokens_dir: optional_env("GMAIL_AGG_TOKENS_DIR")?
                .map(PathBuf::from)
                .unwrap_or(defaults.tokens_dir),
            bind,
            default_max,
            max_limit,
            account_timeout_ms,
            frontend_path: optional_env("GMAIL_AGG_FRONTEND")?
                .map(PathBuf::from)
                .unwrap_or(defaults.frontend_path),
            cors_origins: optional_env("GMAIL_AGG_CORS_ORIGINS")?
                .map(|raw| parse_list(&raw))
                .unwrap_or_default(),
            oauth: OAuthClient {
                client_id: optional_env("GOOGLE_CLIENT_ID")?,
                client_secret: optional_env("GOOGLE_CLIENT_SECRET")?
                    .map(|s| SecretString::new(s.into())),
                auth_uri: optional_env("GMAIL_AGG_AUTH_URI")?
                    .unwrap_or(defaults.oauth.auth_uri),
                token_uri: optional_env("GMAIL_AGG_TOKEN_URI")?
                    .unwrap_or(defaults.oauth.token_uri),
                redirect_uri: optional_env("GOOGLE_REDIRECT_URI")?,
                scopes: match optional_env("GMAIL_AGG_SCOPES")? {
                    Some(raw) => parse_list(&raw),
                    None => defaults.oauth.scopes,
                },
            },
            api_base: optional_env("GMAIL_AGG_API_BASE")?
                .map(|s| s.trim_end_matches('/').to_owned())
                .unwrap_or(defaults.api_base),
        })
    }

    /// Validate a requested per-account cap against `max_limit`
    ///
    /// `None` resolves to `default_max`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` when the value is 0 or above `max_limit`.
    pub fn resolve_max(&self, requested: Option<u32>) -> AppResult<u32> {
        let max = requested.unwrap_or(self.default_max);
        if max == 0 || max > self.max_limit {
            return Err(AppError::InvalidInput(format!(
                "max must be in range 1..={}",
                self.max_limit
            )));
        }
        Ok(max)
    }
}

/// Read an optional environment variable, treating blank values as unset
fn optional_env(key: &str) -> AppResult<Option<String>> {
    match env::var(key) {
        Ok(v) if v.trim().is_empty() => Ok(None),
        Ok(v) => Ok(Some(v.trim().to_owned())),
        Err(VarError::NotPresent) => Ok(None),
        Err(VarError::NotUnicode(_)) => Err(AppError::Config(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

/// Split a comma-separated list, dropping empty items
fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Parse a `u16` environment variable with default fallback
///
/// # Errors
///
/// Returns `Config` if the variable is set but not a valid `u16`.
fn parse_u16_env(key: &str, default: u16) -> AppResult<u16> {
    match optional_env(key)? {
        Some(v) => v.parse::<u16>().map_err(|_| {
            AppError::Config(format!("invalid u16 environment variable {key}: '{v}'"))
        }),
        None => Ok(default),
    }
}

/// Parse a `u32` environment variable with default fallback
///
/// # Errors
///
/// Returns `Config` if the variable is set but not a valid `u32`.
fn parse_u32_env(key: &str, default: u32) -> AppResult<u32> {
    match optional_env(key)? {
        Some(v) => v.parse::<u32>().map_err(|_| {
            AppError::Config(format!("invalid u32 environment variable {key}: '{v}'"))
        }),
        None => Ok(default),
    }
}
