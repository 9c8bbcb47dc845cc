//! Loopback stand-in for Google's token and Gmail endpoints
//!
//! Behaviour is keyed on naming conventions so tests read at a glance:
//!
//! - refresh token `rt-<name>` and authorization code `code-<name>` grant
//!   access token `tok-<name>`; refresh token `revoked` is rejected
//! - bearer `tok-<name>` is the mailbox `<name>@example.com`; anything
//!   else gets a 401
//! - every mailbox lists `<name>-1` and `<name>-2`

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::extract::{Path as UrlPath, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use secrecy::SecretString;
use serde_json::json;

use crate::config::{AppConfig, OAuthClient};

/// Serve `app` on an ephemeral loopback port and return its base URL
pub async fn spawn_router(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind loopback");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("test server");
    });
    format!("http://{addr}")
}

#[derive(Clone, Default)]
pub struct FakeGoogle {
    /// 429 responses still to serve on message listing
    pub throttled_listings: Arc<AtomicUsize>,
    /// Message listing requests received, throttled ones included
    pub listing_calls: Arc<AtomicUsize>,
}

/// Where a running [`FakeGoogle`] answers
pub struct FakeEndpoints {
    pub token_uri: String,
    pub api_base: String,
}

impl FakeEndpoints {
    /// Configuration pointing every Google URL at the fake
    pub fn config(&self, tokens_dir: &Path) -> AppConfig {
        AppConfig {
            tokens_dir: tokens_dir.to_path_buf(),
            frontend_path: tokens_dir.join("missing-frontend.html"),
            api_base: self.api_base.clone(),
            oauth: OAuthClient {
                client_id: Some("client-id".to_owned()),
                client_secret: Some(SecretString::new("client-secret".into())),
                token_uri: self.token_uri.clone(),
                ..OAuthClient::default()
            },
            ..AppConfig::default()
        }
    }
}

impl FakeGoogle {
    pub fn router(&self) -> Router {
        Router::new()
            .route("/token", post(token))
            .route("/gmail/users/me/profile", get(profile))
            .route("/gmail/users/me/messages", get(list_messages))
            .route("/gmail/users/me/messages/{id}", get(get_message))
            .with_state(self.clone())
    }

    pub async fn spawn(&self) -> FakeEndpoints {
        let base = spawn_router(self.router()).await;
        FakeEndpoints {
            token_uri: format!("{base}/token"),
            api_base: format!("{base}/gmail"),
        }
    }
}

async fn token(Form(form): Form<HashMap<String, String>>) -> Response {
    let field = |name: &str| form.get(name).map(String::as_str).unwrap_or_default();
    if field("client_id").is_empty() || field("client_secret").is_empty() {
        return grant_error(StatusCode::UNAUTHORIZED, "invalid_client", "The OAuth client was not found.");
    }
    match field("grant_type") {
        "refresh_token" => match field("refresh_token").strip_prefix("rt-") {
            Some(name) => Json(json!({
                "access_token": format!("tok-{name}"),
                "expires_in": 3599,
                "token_type": "Bearer",
            }))
            .into_response(),
            None => grant_error(StatusCode::BAD_REQUEST, "invalid_grant", "Token has been expired or revoked."),
        },
        "authorization_code" => match field("code").strip_prefix("code-") {
            Some(name) if !field("redirect_uri").is_empty() => Json(json!({
                "access_token": format!("tok-{name}"),
                "expires_in": 3599,
                "refresh_token": format!("rt-{name}"),
                "scope": "https://www.googleapis.com/auth/gmail.readonly",
                "token_type": "Bearer",
            }))
            .into_response(),
            _ => grant_error(StatusCode::BAD_REQUEST, "invalid_grant", "Malformed auth code."),
        },
        _ => grant_error(StatusCode::BAD_REQUEST, "unsupported_grant_type", "Invalid grant_type."),
    }
}

fn grant_error(status: StatusCode, error: &str, description: &str) -> Response {
    (
        status,
        Json(json!({ "error": error, "error_description": description })),
    )
        .into_response()
}

/// Mailbox name carried by a `Bearer tok-<name>` header
fn mailbox(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer tok-")
        .map(str::to_owned)
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({
            "error": {
                "code": 401,
                "message": "Request had invalid authentication credentials.",
                "status": "UNAUTHENTICATED"
            }
        })),
    )
        .into_response()
}

async fn profile(headers: HeaderMap) -> Response {
    match mailbox(&headers) {
        Some(name) => Json(json!({
            "emailAddress": format!("{name}@example.com"),
            "messagesTotal": 2,
        }))
        .into_response(),
        None => unauthorized(),
    }
}

async fn list_messages(State(fake): State<FakeGoogle>, headers: HeaderMap) -> Response {
    let Some(name) = mailbox(&headers) else {
        return unauthorized();
    };
    fake.listing_calls.fetch_add(1, Ordering::SeqCst);
    let throttled = fake
        .throttled_listings
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if throttled {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            [(header::RETRY_AFTER, "0")],
            "rate limited",
        )
            .into_response();
    }
    Json(json!({
        "messages": [
            { "id": format!("{name}-1"), "threadId": format!("{name}-1") },
            { "id": format!("{name}-2"), "threadId": format!("{name}-2") },
        ],
        "resultSizeEstimate": 2,
    }))
    .into_response()
}

async fn get_message(UrlPath(id): UrlPath<String>, headers: HeaderMap) -> Response {
    if mailbox(&headers).is_none() {
        return unauthorized();
    }
    Json(json!({
        "id": id,
        "snippet": format!("snippet {id}"),
        "payload": {
            "headers": [
                { "name": "From", "value": "sender@example.com" },
                { "name": "Subject", "value": format!("subject {id}") },
                { "name": "Date", "value": "Mon, 1 Jan 2024 15:00:00 +0000" },
            ]
        }
    }))
    .into_response()
}
