//! Multi-account fan-out/fan-in
//!
//! Every aggregate call spawns one task per account, waits for all of them,
//! and merges the results in submission order. Each task always produces an
//! [`AccountResult`]; nothing an account does can fail its siblings or the
//! request as a whole.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tracing::Instrument;

use crate::credentials::CredentialResolver;
use crate::errors::{AccountError, AppResult};
use crate::fetcher;
use crate::models::{AccountResult, AggregateResult, FetchMode};
use crate::token_store::{self, TokenStore};

/// Fans fetches out across accounts
pub struct Aggregator {
    resolver: Arc<dyn CredentialResolver>,
    account_timeout: Option<Duration>,
}

impl Aggregator {
    pub fn new(resolver: Arc<dyn CredentialResolver>) -> Self {
        Self {
            resolver,
            account_timeout: None,
        }
    }

    /// Bound each account's unit of work; `None` waits indefinitely
    pub fn with_account_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.account_timeout = timeout;
        self
    }

    /// Fetch `mode` messages for every identifier concurrently
    ///
    /// Returns exactly one entry per identifier, in the order given. An
    /// empty list returns the no-accounts message without touching the
    /// resolver.
    pub async fn aggregate(
        &self,
        identifiers: Vec<String>,
        mode: FetchMode,
        max_per_account: u32,
    ) -> AggregateResult {
        if identifiers.is_empty() {
            tracing::info!(mode = mode.as_str(), "no accounts to aggregate");
            return AggregateResult::no_accounts();
        }

        let started = Instant::now();
        tracing::info!(
            mode = mode.as_str(),
            accounts = identifiers.len(),
            max_per_account,
            "aggregating accounts"
        );

        let handles: Vec<_> = identifiers
            .iter()
            .map(|identifier| {
                let resolver = Arc::clone(&self.resolver);
                let identifier = identifier.clone();
                let timeout = self.account_timeout;
                let span = tracing::info_span!("account", %identifier, mode = mode.as_str());
                tokio::spawn(
                    async move {
                        run_account(resolver.as_ref(), &identifier, mode, max_per_account, timeout)
                            .await
                    }
                    .instrument(span),
                )
            })
            .collect();

        let accounts: Vec<AccountResult> = join_all(handles)
            .await
            .into_iter()
            .zip(identifiers)
            .map(|(joined, identifier)| {
                joined.unwrap_or_else(|e| {
                    tracing::warn!(%identifier, error = %e, "account task aborted");
                    AccountResult::failure(identifier, &AccountError::Aborted(e.to_string()))
                })
            })
            .collect();

        let failed = accounts.iter().filter(|a| a.is_error()).count();
        tracing::info!(
            mode = mode.as_str(),
            accounts = accounts.len(),
            failed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "aggregation complete"
        );

        AggregateResult {
            accounts,
            message: None,
        }
    }

    /// Discover identifiers from `store`, then [`aggregate`](Self::aggregate)
    ///
    /// The directory scan runs on the blocking pool.
    ///
    /// # Errors
    ///
    /// Returns `Store` if the token directory cannot be enumerated. This is
    /// the only aggregate-level failure.
    pub async fn aggregate_all(
        &self,
        store: &Arc<dyn TokenStore>,
        mode: FetchMode,
        max_per_account: u32,
    ) -> AppResult<AggregateResult> {
        let identifiers = token_store::run_blocking(store, |s| s.list_identifiers()).await?;
        Ok(self.aggregate(identifiers, mode, max_per_account).await)
    }
}

/// One account's unit of work, always yielding a result
async fn run_account(
    resolver: &dyn CredentialResolver,
    identifier: &str,
    mode: FetchMode,
    max_results: u32,
    timeout: Option<Duration>,
) -> AccountResult {
    // Upgraded to the real address once the profile lookup succeeds.
    let mut label = identifier.to_owned();

    let work = fetch_account(resolver, identifier, mode, max_results, &mut label);
    let result = match timeout {
        Some(limit) => tokio::time::timeout(limit, work)
            .await
            .unwrap_or_else(|_| Err(AccountError::Timeout(limit.as_millis() as u64))),
        None => work.await,
    };

    result.unwrap_or_else(|e| {
        tracing::warn!(email = %label, error = %e, "account fetch failed");
        AccountResult::failure(label, &e)
    })
}

async fn fetch_account(
    resolver: &dyn CredentialResolver,
    identifier: &str,
    mode: FetchMode,
    max_results: u32,
    label: &mut String,
) -> Result<AccountResult, AccountError> {
    let provider = resolver.resolve(identifier).await?;

    let profile = provider.get_profile().await?;
    if !profile.email_address.is_empty() {
        *label = profile.email_address;
    }

    let outcome = fetcher::fetch_messages(provider.as_ref(), mode, max_results).await?;
    if outcome.failed > 0 {
        tracing::warn!(email = %label, failed = outcome.failed, "some messages could not be loaded");
    }
    Ok(AccountResult::success(
        label.clone(),
        outcome.messages,
        outcome.failed,
    ))
}
