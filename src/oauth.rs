//! OAuth2 grants against Google's token endpoint
//!
//! Two grants are used: the authorization-code exchange that enrolls an
//! account, and the refresh grant that keeps a stored access token usable.

use chrono::{Duration, Utc};
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::Deserialize;

use crate::config::OAuthClient;
use crate::errors::{AppError, AppResult, CredentialError};
use crate::token_store::StoredToken;

/// Lifetime assumed when the endpoint omits `expires_in`
const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

/// Success body shared by both grants
#[derive(Debug, Deserialize)]
struct GrantResponse {
    access_token: String,
    expires_in: Option<i64>,
    refresh_token: Option<String>,
    /// Space-separated scopes actually granted
    scope: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GrantErrorResponse {
    error: Option<String>,
    error_description: Option<String>,
}

/// Consent page URL for one enrollment attempt
///
/// Requests offline access with a forced consent prompt so Google always
/// returns a refresh token, even for an account that authorized before.
///
/// # Errors
///
/// Returns `Config` if no OAuth client id is configured.
pub fn authorization_url(oauth: &OAuthClient, redirect_uri: &str, state: &str) -> AppResult<String> {
    let client_id = oauth
        .client_id
        .as_deref()
        .ok_or_else(|| AppError::Config("GOOGLE_CLIENT_ID is not set".to_owned()))?;
    let scope = oauth.scopes.join(" ");
    let params = [
        ("client_id", client_id),
        ("redirect_uri", redirect_uri),
        ("response_type", "code"),
        ("scope", scope.as_str()),
        ("access_type", "offline"),
        ("include_granted_scopes", "true"),
        ("prompt", "consent"),
        ("state", state),
    ];
    let query = params
        .iter()
        .map(|(k, v)| format!("{k}={}", urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&");
    let separator = if oauth.auth_uri.contains('?') { '&' } else { '?' };
    Ok(format!("{}{separator}{query}", oauth.auth_uri))
}

/// Exchange an authorization `code` for a storable token
///
/// `redirect_uri` must be the exact value sent to the consent page.
///
/// # Errors
///
/// Returns `ExchangeFailed` if client credentials are missing, the request
/// fails, or Google rejects the code.
pub async fn exchange_code(
    http: &Client,
    oauth: &OAuthClient,
    code: &str,
    redirect_uri: &str,
) -> Result<StoredToken, CredentialError> {
    let client_id = oauth
        .client_id
        .as_deref()
        .ok_or_else(|| CredentialError::ExchangeFailed("no OAuth client id".to_owned()))?;
    let client_secret = oauth
        .client_secret
        .as_ref()
        .map(|s| s.expose_secret())
        .ok_or_else(|| CredentialError::ExchangeFailed("no OAuth client secret".to_owned()))?;

    tracing::debug!(token_uri = %oauth.token_uri, "exchanging authorization code");

    let body = post_grant(
        http,
        &oauth.token_uri,
        &[
            ("client_id", client_id),
            ("client_secret", client_secret),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("grant_type", "authorization_code"),
        ],
    )
    .await
    .map_err(CredentialError::ExchangeFailed)?;

    let granted: GrantResponse = serde_json::from_str(&body)
        .map_err(|e| CredentialError::ExchangeFailed(format!("malformed token response: {e}")))?;
    Ok(token_from_grant(granted, oauth, client_id, client_secret))
}

/// Authorized-user token file contents for a fresh code grant
fn token_from_grant(
    granted: GrantResponse,
    oauth: &OAuthClient,
    client_id: &str,
    client_secret: &str,
) -> StoredToken {
    let refresh_token = granted.refresh_token.filter(|t| !t.is_empty());
    if refresh_token.is_none() {
        tracing::warn!("code grant returned no refresh token; re-enroll once the access token expires");
    }
    let scopes = granted
        .scope
        .map(|s| s.split_whitespace().map(str::to_owned).collect::<Vec<_>>())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| oauth.scopes.clone());
    let expires_in = granted.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS);

    StoredToken {
        token: Some(granted.access_token),
        refresh_token,
        token_uri: Some(oauth.token_uri.clone()),
        client_id: Some(client_id.to_owned()),
        client_secret: Some(client_secret.to_owned()),
        scopes: Some(scopes),
        expiry: Some(Utc::now() + Duration::seconds(expires_in)),
        ..StoredToken::default()
    }
}

/// Refresh `token`, returning the updated credential
///
/// Client credentials and the token endpoint come from the token file
/// first and `oauth` second. Google may rotate the refresh token; when it
/// does not, the existing one is kept. Unknown fields are carried over
/// unchanged.
///
/// # Errors
///
/// - `Unrefreshable` if the refresh token or client credentials are missing
/// - `RefreshFailed` if the grant request fails or is rejected
pub async fn refresh(
    http: &Client,
    token: &StoredToken,
    oauth: &OAuthClient,
) -> Result<StoredToken, CredentialError> {
    let refresh_token = token
        .refresh_token
        .as_deref()
        .filter(|t| !t.is_empty())
        .ok_or_else(|| CredentialError::Unrefreshable("no refresh token".to_owned()))?;
    let client_id = token
        .client_id
        .as_deref()
        .or(oauth.client_id.as_deref())
        .ok_or_else(|| CredentialError::Unrefreshable("no OAuth client id".to_owned()))?;
    let client_secret = token
        .client_secret
        .as_deref()
        .or(oauth.client_secret.as_ref().map(|s| s.expose_secret()))
        .ok_or_else(|| CredentialError::Unrefreshable("no OAuth client secret".to_owned()))?;
    let token_uri = token.token_uri.as_deref().unwrap_or(&oauth.token_uri);

    tracing::debug!(token_uri, "refreshing access token");

    let body = post_grant(
        http,
        token_uri,
        &[
            ("client_id", client_id),
            ("client_secret", client_secret),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ],
    )
    .await
    .map_err(CredentialError::RefreshFailed)?;

    let granted: GrantResponse = serde_json::from_str(&body)
        .map_err(|e| CredentialError::RefreshFailed(format!("malformed token response: {e}")))?;

    Ok(apply_refresh(token, granted))
}

/// POST a grant form, returning the success body or `"<status> (<reason>)"`
async fn post_grant(http: &Client, token_uri: &str, form: &[(&str, &str)]) -> Result<String, String> {
    let response = http
        .post(token_uri)
        .form(form)
        .send()
        .await
        .map_err(|e| format!("token request failed: {e}"))?;

    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| format!("token response unreadable: {e}"))?;

    if !status.is_success() {
        let reason = serde_json::from_str::<GrantErrorResponse>(&body)
            .ok()
            .and_then(|e| e.error_description.or(e.error))
            .unwrap_or_else(|| "unknown error".to_owned());
        return Err(format!("{} ({reason})", status.as_u16()));
    }
    Ok(body)
}

fn apply_refresh(token: &StoredToken, granted: GrantResponse) -> StoredToken {
    let expires_in = granted.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS);
    let mut updated = token.clone();
    updated.token = Some(granted.access_token);
    updated.expiry = Some(Utc::now() + Duration::seconds(expires_in));
    if let Some(rotated) = granted.refresh_token.filter(|t| !t.is_empty()) {
        updated.refresh_token = Some(rotated);
    }
    updated
}
