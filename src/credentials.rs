//! Credential resolution
//!
//! Turns a token identifier into an authenticated [`MailProvider`], loading
//! the stored token and refreshing it when expired.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::SecretString;

use crate::config::{AppConfig, OAuthClient};
use crate::errors::CredentialError;
use crate::gmail::GmailClient;
use crate::oauth;
use crate::provider::MailProvider;
use crate::token_store::TokenStore;

/// Produces an authenticated mailbox handle for a token identifier
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    /// Load, validate, and if needed refresh the credential for `identifier`
    ///
    /// # Errors
    ///
    /// Returns a [`CredentialError`] when no usable credential can be built.
    async fn resolve(&self, identifier: &str) -> Result<Box<dyn MailProvider>, CredentialError>;
}

/// Resolver backed by a [`TokenStore`] and the Gmail REST API
pub struct GmailResolver {
    store: Arc<dyn TokenStore>,
    http: Client,
    oauth: OAuthClient,
    api_base: String,
}

impl GmailResolver {
    pub fn new(store: Arc<dyn TokenStore>, http: Client, config: &AppConfig) -> Self {
        Self {
            store,
            http,
            oauth: config.oauth.clone(),
            api_base: config.api_base.clone(),
        }
    }
}

#[async_trait]
impl CredentialResolver for GmailResolver {
    async fn resolve(&self, identifier: &str) -> Result<Box<dyn MailProvider>, CredentialError> {
        let mut token = self.store.load(identifier)?;

        if !token.is_valid() {
            if !token.has_refresh_token() {
                return Err(CredentialError::Unrefreshable(identifier.to_owned()));
            }
            token = oauth::refresh(&self.http, &token, &self.oauth).await?;
            tracing::debug!(identifier, "access token refreshed");
            // The refreshed token is still usable for this call even if it
            // cannot be written back.
            if let Err(e) = self.store.save(identifier, &token) {
                tracing::warn!(identifier, error = %e, "failed to persist refreshed token");
            }
        }

        let access = token
            .token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| CredentialError::Unrefreshable(identifier.to_owned()))?;

        Ok(Box::new(GmailClient::new(
            self.http.clone(),
            &self.api_base,
            SecretString::new(access.into()),
        )))
    }
}
