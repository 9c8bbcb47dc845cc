//! HTTP surface
//!
//! Exposes the aggregator over `axum`: `/unread` and `/latest` return one
//! merged JSON document for every authenticated account, plus account
//! enrollment, account management, and health routes. Handlers validate
//! input, delegate to the aggregator or token store, and map `AppError` into
//! JSON responses.

use std::path::Path;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::response::{Html, Redirect};
use axum::routing::{get, post};
use axum::{Json, Router};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::services::ServeFile;
use tower_http::trace::TraceLayer;

use crate::aggregator::Aggregator;
use crate::config::{AppConfig, OAuthClient};
use crate::enrollment::{self, CALLBACK_PATH, CallbackParams, PendingStates};
use crate::errors::{AppError, AppResult};
use crate::models::{AggregateResult, FetchMode};
use crate::oauth;
use crate::token_store::{self, TokenStore, validate_identifier};

/// Shared handler state, built once at startup
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: Arc<dyn TokenStore>,
    pub aggregator: Arc<Aggregator>,
    pub http: Client,
    pub pending: Arc<Mutex<PendingStates>>,
}

#[derive(Debug, Default, Deserialize)]
struct MaxQuery {
    max: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeleteUserRequest {
    email: Option<String>,
}

/// Build the application router
///
/// `/` serves the configured frontend page when the file exists.
pub fn router(state: AppState) -> Router {
    let cors = build_cors_layer(&state.config.cors_origins);
    let frontend = state.config.frontend_path.clone();

    let app = Router::new()
        .route("/health", get(health))
        .route("/unread", get(unread))
        .route("/latest", get(latest))
        .route("/accounts", get(accounts))
        .route("/delete_user", post(delete_user))
        .route("/add_user", get(add_user))
        .route(CALLBACK_PATH, get(oauth2callback));

    let app = if Path::new(&frontend).is_file() {
        tracing::info!(path = %frontend.display(), "serving frontend");
        app.route_service("/", ServeFile::new(frontend))
    } else {
        tracing::info!(path = %frontend.display(), "frontend not found, serving API only");
        app
    };

    app.layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn unread(
    State(state): State<AppState>,
    Query(query): Query<MaxQuery>,
) -> AppResult<Json<AggregateResult>> {
    aggregate(&state, FetchMode::Unread, query).await
}

async fn latest(
    State(state): State<AppState>,
    Query(query): Query<MaxQuery>,
) -> AppResult<Json<AggregateResult>> {
    aggregate(&state, FetchMode::Latest, query).await
}

async fn aggregate(
    state: &AppState,
    mode: FetchMode,
    query: MaxQuery,
) -> AppResult<Json<AggregateResult>> {
    let max = state.config.resolve_max(parse_max(query.max.as_deref())?)?;
    let result = state
        .aggregator
        .aggregate_all(&state.store, mode, max)
        .await?;
    Ok(Json(result))
}

async fn accounts(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let identifiers = token_store::run_blocking(&state.store, |s| s.list_identifiers()).await?;
    Ok(Json(json!({ "accounts": identifiers })))
}

async fn delete_user(
    State(state): State<AppState>,
    Json(body): Json<DeleteUserRequest>,
) -> AppResult<Json<Value>> {
    let email = body
        .email
        .map(|e| e.trim().to_owned())
        .filter(|e| !e.is_empty())
        .ok_or_else(|| AppError::invalid("Email is required"))?;
    validate_identifier(&email)?;

    let target = email.clone();
    token_store::run_blocking(&state.store, move |s| s.delete(&target))
        .await
        .map_err(|e| match e {
            AppError::NotFound(_) => AppError::NotFound(format!("User {email} not found")),
            other => other,
        })?;
    tracing::info!(%email, "removed account token");

    Ok(Json(json!({
        "message": format!("User {email} deleted successfully")
    })))
}

/// Start enrollment by redirecting to Google's consent page
async fn add_user(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Redirect> {
    let redirect_uri = callback_url(&state.config.oauth, &headers)?;
    let csrf = state.pending.lock().await.issue(redirect_uri.clone());
    let url = oauth::authorization_url(&state.config.oauth, &redirect_uri, &csrf)?;
    tracing::info!(%redirect_uri, "starting account enrollment");
    Ok(Redirect::to(&url))
}

/// Finish enrollment: verify `state`, exchange the code, store the token
async fn oauth2callback(
    State(state): State<AppState>,
    Query(params): Query<CallbackParams>,
) -> AppResult<Html<String>> {
    let issued = match params.state.as_deref() {
        Some(csrf) => state.pending.lock().await.take(csrf),
        None => None,
    };
    let redirect_uri = issued.ok_or_else(|| AppError::invalid("Unknown or expired OAuth state"))?;
    let code = params.into_code()?;

    let email = enrollment::enroll(
        &state.http,
        &state.config.oauth,
        &state.config.api_base,
        &state.store,
        &code,
        &redirect_uri,
    )
    .await?;
    Ok(Html(format!("Successfully added account: {email}")))
}

/// OAuth callback URL: the configured one, else derived from the request
///
/// `X-Forwarded-Proto: https` from a fronting proxy selects the https scheme.
fn callback_url(oauth: &OAuthClient, headers: &HeaderMap) -> AppResult<String> {
    if let Some(uri) = &oauth.redirect_uri {
        return Ok(uri.clone());
    }
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .filter(|h| !h.is_empty())
        .ok_or_else(|| AppError::invalid("Host header is required to derive the OAuth callback URL"))?;
    let scheme = match headers.get("x-forwarded-proto").and_then(|v| v.to_str().ok()) {
        Some(proto) if proto.eq_ignore_ascii_case("https") => "https",
        _ => "http",
    };
    Ok(format!("{scheme}://{host}{CALLBACK_PATH}"))
}

/// Parse the optional `max` query parameter; blank means absent
fn parse_max(raw: Option<&str>) -> AppResult<Option<u32>> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        Some(v) => v
            .parse::<u32>()
            .map(Some)
            .map_err(|_| AppError::invalid(format!("max must be a positive integer, got '{v}'"))),
        None => Ok(None),
    }
}

/// CORS policy from configured origins; empty means permissive
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match o.parse::<HeaderValue>() {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(origin = %o, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    if parsed.is_empty() {
        tracing::debug!("using permissive CORS");
        return CorsLayer::permissive();
    }

    tracing::info!(origins = ?parsed, "CORS restricted to configured origins");
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(parsed))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
}
