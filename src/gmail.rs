//! Gmail REST client
//!
//! Thin `reqwest` wrapper over the three Gmail v1 endpoints the aggregator
//! needs: message listing, metadata fetch, and profile lookup. Rate-limited
//! responses (429) are retried with `Retry-After` or exponential backoff.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::errors::ProviderError;
use crate::models::MessageFilter;
use crate::provider::{MailProvider, Profile, RawMessage};

/// Headers requested with `format=metadata`
const METADATA_HEADERS: [&str; 3] = ["From", "Subject", "Date"];
const MAX_RATE_LIMIT_RETRIES: usize = 3;
const MAX_BACKOFF_SECS: u64 = 16;
/// Longest error body echoed into a `ProviderError`
const ERROR_BODY_MAX_CHARS: usize = 200;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageList {
    #[serde(default)]
    messages: Vec<MessageRef>,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailMessage {
    id: String,
    snippet: Option<String>,
    payload: Option<GmailPayload>,
}

#[derive(Debug, Deserialize)]
struct GmailPayload {
    #[serde(default)]
    headers: Vec<GmailHeader>,
}

#[derive(Debug, Deserialize)]
struct GmailHeader {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailProfile {
    #[serde(default)]
    email_address: String,
}

/// One account's authenticated Gmail handle
pub struct GmailClient {
    http: Client,
    base_url: String,
    access_token: SecretString,
}

impl GmailClient {
    /// Build a client against `base_url` (normally the Gmail v1 root)
    pub fn new(http: Client, base_url: &str, access_token: SecretString) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_owned(),
            access_token,
        }
    }

    /// GET `path` relative to the base URL and decode the JSON body
    ///
    /// # Errors
    ///
    /// - `Transport` on connection failures
    /// - `Status` on non-success responses (after 429 retries are exhausted)
    /// - `Decode` when the body does not match `T`
    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ProviderError> {
        let url = format!("{}{path}", self.base_url);
        let mut backoff_secs = 1u64;

        for attempt in 0..=MAX_RATE_LIMIT_RETRIES {
            let response = self
                .http
                .get(&url)
                .bearer_auth(self.access_token.expose_secret())
                .header("accept", "application/json")
                .query(query)
                .send()
                .await?;

            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS && attempt < MAX_RATE_LIMIT_RETRIES {
                let wait = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(backoff_secs)
                    .min(MAX_BACKOFF_SECS);
                tracing::debug!(path, attempt, wait, "gmail rate limited, retrying");
                tokio::time::sleep(Duration::from_secs(wait)).await;
                backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
                continue;
            }

            let body = response.text().await?;
            if !status.is_success() {
                return Err(ProviderError::Status {
                    status: status.as_u16(),
                    body: truncate_body(&body),
                });
            }
            return serde_json::from_str(&body)
                .map_err(|e| ProviderError::Decode(format!("{path}: {e}")));
        }

        Err(ProviderError::Status {
            status: StatusCode::TOO_MANY_REQUESTS.as_u16(),
            body: "rate limit retries exhausted".to_owned(),
        })
    }
}

#[async_trait]
impl MailProvider for GmailClient {
    async fn list_message_ids(
        &self,
        filter: &MessageFilter,
        cap: u32,
    ) -> Result<Vec<String>, ProviderError> {
        let list: MessageList = self
            .get_json("/users/me/messages", &list_query(filter, cap))
            .await?;
        Ok(list.messages.into_iter().map(|m| m.id).collect())
    }

    async fn get_message(&self, id: &str) -> Result<RawMessage, ProviderError> {
        let path = format!("/users/me/messages/{}", urlencoding::encode(id));
        let mut query = vec![("format", "metadata".to_owned())];
        query.extend(
            METADATA_HEADERS
                .iter()
                .map(|h| ("metadataHeaders", (*h).to_owned())),
        );
        let message: GmailMessage = self.get_json(&path, &query).await?;
        Ok(message.into())
    }

    async fn get_profile(&self) -> Result<Profile, ProviderError> {
        let profile: GmailProfile = self.get_json("/users/me/profile", &[]).await?;
        Ok(Profile {
            email_address: profile.email_address,
        })
    }
}

impl From<GmailMessage> for RawMessage {
    fn from(message: GmailMessage) -> Self {
        Self {
            id: message.id,
            headers: message
                .payload
                .map(|p| p.headers.into_iter().map(|h| (h.name, h.value)).collect())
                .unwrap_or_default(),
            snippet: message.snippet,
        }
    }
}

/// Query parameters for `users.messages.list`
fn list_query(filter: &MessageFilter, cap: u32) -> Vec<(&'static str, String)> {
    let mut query = vec![("maxResults", cap.to_string())];
    match filter {
        MessageFilter::Query(q) => query.push(("q", q.clone())),
        MessageFilter::Label(label) => query.push(("labelIds", label.clone())),
    }
    query
}

fn truncate_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= ERROR_BODY_MAX_CHARS {
        trimmed.to_owned()
    } else {
        let head: String = trimmed.chars().take(ERROR_BODY_MAX_CHARS).collect();
        format!("{head}...")
    }
}
