//! Account enrollment
//!
//! Completes Google's consent flow for one account: the authorization code
//! is exchanged for a token, Gmail is asked which address the grant belongs
//! to, and the token file is written under that address. The HTTP surface
//! tracks outstanding `state` values in [`PendingStates`]; the CLI runs a
//! one-shot loopback listener through [`LoopbackFlow`].

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::Query;
use axum::response::Html;
use axum::routing::get;
use reqwest::Client;
use secrecy::SecretString;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, oneshot};
use uuid::Uuid;

use crate::config::OAuthClient;
use crate::errors::{AppError, AppResult};
use crate::gmail::GmailClient;
use crate::oauth;
use crate::provider::MailProvider;
use crate::token_store::{self, TokenStore, validate_identifier};

/// Path Google redirects back to after consent
pub const CALLBACK_PATH: &str = "/oauth2callback";

/// Lifetime of an issued `state` value
pub const STATE_TTL_SECS: u64 = 600;

/// Outstanding consent attempts kept at once
pub const MAX_PENDING_STATES: usize = 64;

/// Query parameters Google appends to the callback URL
#[derive(Debug, Default, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

impl CallbackParams {
    /// The authorization code, unless consent was denied or the code is absent
    pub fn into_code(self) -> AppResult<String> {
        if let Some(error) = self.error {
            return Err(AppError::invalid(format!("Authorization denied: {error}")));
        }
        self.code
            .filter(|c| !c.is_empty())
            .ok_or_else(|| AppError::invalid("Authorization code is required"))
    }
}

#[derive(Debug, Clone)]
struct PendingState {
    redirect_uri: String,
    expires_at: Instant,
}

/// Issued OAuth `state` values awaiting their callback
///
/// Each state is bound to the redirect URI it was issued with, since the
/// code exchange must repeat it exactly. States are single-use and expire
/// after the configured TTL; the oldest are evicted past `max_entries`.
#[derive(Debug)]
pub struct PendingStates {
    ttl: Duration,
    max_entries: usize,
    entries: HashMap<String, PendingState>,
}

impl Default for PendingStates {
    fn default() -> Self {
        Self::new(Duration::from_secs(STATE_TTL_SECS), MAX_PENDING_STATES)
    }
}

impl PendingStates {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries,
            entries: HashMap::new(),
        }
    }

    /// Issue a fresh state bound to `redirect_uri`
    pub fn issue(&mut self, redirect_uri: String) -> String {
        self.cleanup();
        let state = Uuid::new_v4().to_string();
        self.entries.insert(
            state.clone(),
            PendingState {
                redirect_uri,
                expires_at: Instant::now() + self.ttl,
            },
        );
        self.evict_if_needed();
        state
    }

    /// Consume `state`, returning the redirect URI it was issued with
    pub fn take(&mut self, state: &str) -> Option<String> {
        self.cleanup();
        self.entries.remove(state).map(|e| e.redirect_uri)
    }

    fn cleanup(&mut self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.expires_at > now);
    }

    fn evict_if_needed(&mut self) {
        if self.entries.len() <= self.max_entries {
            return;
        }

        let overflow = self.entries.len() - self.max_entries;
        let mut by_expiry: Vec<(String, Instant)> = self
            .entries
            .iter()
            .map(|(state, entry)| (state.clone(), entry.expires_at))
            .collect();
        by_expiry.sort_by_key(|(_, expires_at)| *expires_at);

        for (state, _) in by_expiry.into_iter().take(overflow) {
            self.entries.remove(&state);
        }
    }
}

/// Exchange `code`, identify the account, and persist its token
///
/// Returns the enrolled address, which is also the new token identifier.
/// Enrolling an address that already has a token replaces it.
///
/// # Errors
///
/// - `Upstream` if Google rejects the code or the profile lookup fails
/// - `InvalidInput` if the profile address is not a usable identifier
/// - `Store` if the token file cannot be written
pub async fn enroll(
    http: &Client,
    oauth: &OAuthClient,
    api_base: &str,
    store: &Arc<dyn TokenStore>,
    code: &str,
    redirect_uri: &str,
) -> AppResult<String> {
    let token = oauth::exchange_code(http, oauth, code, redirect_uri)
        .await
        .map_err(|e| AppError::Upstream(e.to_string()))?;

    let access = token.token.clone().unwrap_or_default();
    let gmail = GmailClient::new(http.clone(), api_base, SecretString::new(access.into()));
    let email = gmail
        .get_profile()
        .await
        .map_err(|e| AppError::Upstream(format!("profile lookup failed: {e}")))?
        .email_address;
    validate_identifier(&email)?;

    let identifier = email.clone();
    token_store::run_blocking(store, move |s| s.save(&identifier, &token)).await?;
    tracing::info!(%email, "enrolled account");
    Ok(email)
}

/// Consent flow for a terminal user
///
/// Listens on an ephemeral loopback port for Google's redirect, which is
/// what installed-app OAuth clients expect. Call
/// [`finish`](Self::finish) after showing [`authorization_url`](Self::authorization_url).
pub struct LoopbackFlow {
    pub authorization_url: String,
    redirect_uri: String,
    state: String,
    callback: oneshot::Receiver<CallbackParams>,
    shutdown: oneshot::Sender<()>,
}

impl LoopbackFlow {
    /// Bind the loopback listener and build the consent URL
    ///
    /// # Errors
    ///
    /// Returns `Config` if no OAuth client id is configured, or `Internal`
    /// if the listener cannot be bound.
    pub async fn start(oauth: &OAuthClient) -> AppResult<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .map_err(|e| AppError::Internal(format!("failed to bind loopback listener: {e}")))?;
        let addr = listener
            .local_addr()
            .map_err(|e| AppError::Internal(format!("loopback listener has no address: {e}")))?;
        let redirect_uri = format!("http://{addr}{CALLBACK_PATH}");
        let state = Uuid::new_v4().to_string();
        let authorization_url = oauth::authorization_url(oauth, &redirect_uri, &state)?;

        let (callback_tx, callback) = oneshot::channel();
        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let callback_tx = Arc::new(Mutex::new(Some(callback_tx)));

        let app = Router::new().route(
            CALLBACK_PATH,
            get(move |Query(params): Query<CallbackParams>| {
                let callback_tx = Arc::clone(&callback_tx);
                async move {
                    if let Some(tx) = callback_tx.lock().await.take() {
                        let _ = tx.send(params);
                    }
                    Html("Authorization received. You can close this window.")
                }
            }),
        );
        tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = served {
                tracing::warn!(error = %e, "loopback listener failed");
            }
        });
        tracing::debug!(%redirect_uri, "waiting for OAuth callback");

        Ok(Self {
            authorization_url,
            redirect_uri,
            state,
            callback,
            shutdown,
        })
    }

    /// Wait for the redirect, then [`enroll`] the account
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` on a state mismatch or denied consent, plus
    /// anything [`enroll`] returns.
    pub async fn finish(
        self,
        http: &Client,
        oauth: &OAuthClient,
        api_base: &str,
        store: &Arc<dyn TokenStore>,
    ) -> AppResult<String> {
        let params = self
            .callback
            .await
            .map_err(|_| AppError::Internal("loopback listener stopped".to_owned()))?;
        let _ = self.shutdown.send(());

        if params.state.as_deref() != Some(self.state.as_str()) {
            return Err(AppError::invalid("OAuth state mismatch"));
        }
        let code = params.into_code()?;
        enroll(http, oauth, api_base, store, &code, &self.redirect_uri).await
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::test_support::FakeGoogle;
    use crate::token_store::FileTokenStore;

    #[test]
    fn issued_state_is_single_use_and_keeps_redirect() {
        let mut states = PendingStates::default();
        let state = states.issue("http://localhost:5000/oauth2callback".to_owned());
        assert_eq!(
            states.take(&state).as_deref(),
            Some("http://localhost:5000/oauth2callback")
        );
        assert!(states.take(&state).is_none());
        assert!(states.take("never-issued").is_none());
    }

    #[test]
    fn states_expire() {
        let mut states = PendingStates::new(Duration::from_millis(5), 8);
        let state = states.issue("http://x/cb".to_owned());
        thread::sleep(Duration::from_millis(20));
        assert!(states.take(&state).is_none());
    }

    #[test]
    fn oldest_states_are_evicted() {
        let mut states = PendingStates::new(Duration::from_secs(60), 2);
        let first = states.issue("a".to_owned());
        thread::sleep(Duration::from_millis(2));
        let second = states.issue("b".to_owned());
        thread::sleep(Duration::from_millis(2));
        let third = states.issue("c".to_owned());
        assert!(states.take(&first).is_none());
        assert!(states.take(&second).is_some());
        assert!(states.take(&third).is_some());
    }

    #[test]
    fn denied_consent_is_invalid_input() {
        let params = CallbackParams {
            error: Some("access_denied".to_owned()),
            ..CallbackParams::default()
        };
        let err = params.into_code().expect_err("must fail");
        assert_eq!(err.to_string(), "invalid input: Authorization denied: access_denied");
        assert!(CallbackParams::default().into_code().is_err());
    }

    #[tokio::test]
    async fn enroll_writes_token_under_profile_address() {
        let endpoints = FakeGoogle::default().spawn().await;
        let dir = tempfile::tempdir().expect("tempdir");
        let config = endpoints.config(dir.path());
        let store: Arc<dyn TokenStore> = Arc::new(FileTokenStore::new(dir.path()));

        let email = enroll(
            &Client::new(),
            &config.oauth,
            &config.api_base,
            &store,
            "code-frank",
            "http://localhost/oauth2callback",
        )
        .await
        .expect("enrollment succeeds");
        assert_eq!(email, "frank@example.com");

        let saved = store.load("frank@example.com").expect("token written");
        assert_eq!(saved.token.as_deref(), Some("tok-frank"));
        assert_eq!(saved.refresh_token.as_deref(), Some("rt-frank"));
        assert_eq!(saved.client_id.as_deref(), Some("client-id"));
        assert_eq!(store.list_identifiers().expect("list"), ["frank@example.com"]);
    }

    #[tokio::test]
    async fn rejected_code_writes_nothing() {
        let endpoints = FakeGoogle::default().spawn().await;
        let dir = tempfile::tempdir().expect("tempdir");
        let config = endpoints.config(dir.path());
        let store: Arc<dyn TokenStore> = Arc::new(FileTokenStore::new(dir.path()));

        let err = enroll(
            &Client::new(),
            &config.oauth,
            &config.api_base,
            &store,
            "stale",
            "http://localhost/oauth2callback",
        )
        .await
        .expect_err("must fail");
        assert!(matches!(err, AppError::Upstream(_)));
        assert!(store.list_identifiers().expect("list").is_empty());
    }

    #[tokio::test]
    async fn loopback_flow_enrolls_after_redirect() {
        let endpoints = FakeGoogle::default().spawn().await;
        let dir = tempfile::tempdir().expect("tempdir");
        let config = endpoints.config(dir.path());
        let store: Arc<dyn TokenStore> = Arc::new(FileTokenStore::new(dir.path()));

        let flow = LoopbackFlow::start(&config.oauth).await.expect("flow starts");
        assert!(flow.authorization_url.contains("access_type=offline"));
        let callback = format!(
            "{}?code=code-gina&state={}",
            flow.redirect_uri, flow.state
        );

        let browser = tokio::spawn(async move {
            Client::new()
                .get(callback)
                .send()
                .await
                .expect("callback reachable")
                .status()
        });
        let email = flow
            .finish(&Client::new(), &config.oauth, &config.api_base, &store)
            .await
            .expect("enrollment succeeds");
        assert_eq!(email, "gina@example.com");
        assert!(browser.await.expect("browser task").is_success());
        assert!(dir.path().join("gina@example.com.json").is_file());
    }

    #[tokio::test]
    async fn loopback_flow_rejects_foreign_state() {
        let endpoints = FakeGoogle::default().spawn().await;
        let dir = tempfile::tempdir().expect("tempdir");
        let config = endpoints.config(dir.path());
        let store: Arc<dyn TokenStore> = Arc::new(FileTokenStore::new(dir.path()));

        let flow = LoopbackFlow::start(&config.oauth).await.expect("flow starts");
        let callback = format!("{}?code=code-gina&state=forged", flow.redirect_uri);
        tokio::spawn(async move { Client::new().get(callback).send().await });

        let err = flow
            .finish(&Client::new(), &config.oauth, &config.api_base, &store)
            .await
            .expect_err("must fail");
        assert_eq!(err.to_string(), "invalid input: OAuth state mismatch");
        assert!(store.list_identifiers().expect("list").is_empty());
    }
}
