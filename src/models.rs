//! Response DTOs and fetch modes
//!
//! Everything here serializes directly into the JSON returned by `/unread`
//! and `/latest`. Optional fields are omitted rather than emitted as `null`.

use serde::{Deserialize, Serialize};

use crate::errors::AccountError;

/// Default cap for the unread fetcher when called without an explicit value
///
/// Independent of the HTTP surface default (`config::DEFAULT_HTTP_MAX`).
pub const DEFAULT_UNREAD_MAX: u32 = 10;

/// Informational message returned when no token files exist
pub const NO_ACCOUNTS_MESSAGE: &str =
    "No authenticated accounts found. Add a token file to the tokens directory first.";

/// One message's metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSummary {
    /// Provider message ID (present in unread mode only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Raw `From` header, `""` when absent
    pub from: String,
    /// Raw `Subject` header, `""` when absent
    pub subject: String,
    /// Normalized or raw `Date` header depending on mode
    pub date: String,
    /// Provider snippet, `""` when absent
    pub snippet: String,
}

/// One account's fetch outcome
///
/// On failure `error` is set, `messages` is empty and `count` is 0. A
/// `warning` may accompany a successful message list when some individual
/// messages could not be loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountResult {
    /// Account address, or the token identifier when it could not be determined
    pub email: String,
    /// Number of entries in `messages`
    pub count: usize,
    /// Messages in provider listing order
    pub messages: Vec<MessageSummary>,
    /// Non-fatal partial failure note
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    /// Fatal failure for this account
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AccountResult {
    /// Successful (possibly partial) result
    pub fn success(email: String, messages: Vec<MessageSummary>, failed: usize) -> Self {
        Self {
            email,
            count: messages.len(),
            messages,
            warning: warning_for(failed),
            error: None,
        }
    }

    /// Failed result keyed by the best-effort account label
    pub fn failure(email: impl Into<String>, error: &AccountError) -> Self {
        Self {
            email: email.into(),
            count: 0,
            messages: Vec::new(),
            warning: None,
            error: Some(error.to_string()),
        }
    }

    /// Whether this entry carries an error
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Warning text for `failed` skipped messages, `None` when nothing failed
pub fn warning_for(failed: usize) -> Option<String> {
    (failed > 0).then(|| format!("Failed to load {failed} messages due to API errors"))
}

/// Merged response across all accounts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateResult {
    /// One entry per token identifier, in discovery order
    pub accounts: Vec<AccountResult>,
    /// Set only when there are no accounts at all
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl AggregateResult {
    /// Response for an empty token directory
    pub fn no_accounts() -> Self {
        Self {
            accounts: Vec::new(),
            message: Some(NO_ACCOUNTS_MESSAGE.to_owned()),
        }
    }
}

/// How the `Date` header is rendered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateStyle {
    /// ISO-8601 in the local timezone, `""` when unparseable
    LocalIso,
    /// Header text passed through unchanged
    Raw,
}

/// Which messages to list for each account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchMode {
    /// `is:unread` search across all labels
    Unread,
    /// Newest messages carrying the `INBOX` label
    Latest,
}

impl FetchMode {
    /// Listing filter for this mode
    pub fn filter(self) -> MessageFilter {
        match self {
            Self::Unread => MessageFilter::Query("is:unread".to_owned()),
            Self::Latest => MessageFilter::Label("INBOX".to_owned()),
        }
    }

    /// Date rendering for this mode
    ///
    /// Unread normalizes to local ISO-8601; latest passes the header
    /// through unchanged.
    pub fn date_style(self) -> DateStyle {
        match self {
            Self::Unread => DateStyle::LocalIso,
            Self::Latest => DateStyle::Raw,
        }
    }

    /// Whether summaries carry the provider message ID
    pub fn includes_id(self) -> bool {
        matches!(self, Self::Unread)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unread => "unread",
            Self::Latest => "latest",
        }
    }
}

/// Provider-side listing filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageFilter {
    /// Gmail search query (`q=`)
    Query(String),
    /// Single label ID (`labelIds=`)
    Label(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::CredentialError;

    #[test]
    fn success_result_counts_messages_and_sets_warning() {
        let msg = MessageSummary {
            id: None,
            from: "a@example.com".to_owned(),
            subject: "hi".to_owned(),
            date: String::new(),
            snippet: String::new(),
        };
        let result = AccountResult::success("me@example.com".to_owned(), vec![msg], 2);
        assert_eq!(result.count, 1);
        assert_eq!(
            result.warning.as_deref(),
            Some("Failed to load 2 messages due to API errors")
        );
        assert!(!result.is_error());
    }

    #[test]
    fn failure_result_serializes_without_warning_field() {
        let err = AccountError::from(CredentialError::NotFound("x".to_owned()));
        let result = AccountResult::failure("x", &err);
        let value = serde_json::to_value(&result).expect("must serialize");
        assert_eq!(value["count"], 0);
        assert_eq!(value["messages"].as_array().map(Vec::len), Some(0));
        assert_eq!(value["error"], "Token not found: x");
        assert!(value.get("warning").is_none());
    }

    #[test]
    fn latest_summaries_omit_id_in_json() {
        let msg = MessageSummary {
            id: None,
            from: String::new(),
            subject: String::new(),
            date: "Tue, 1 Jan 2024 10:00:00 -0500".to_owned(),
            snippet: String::new(),
        };
        let value = serde_json::to_value(&msg).expect("must serialize");
        assert!(value.get("id").is_none());
        assert_eq!(value["date"], "Tue, 1 Jan 2024 10:00:00 -0500");
    }

    #[test]
    fn modes_differ_in_filter_and_date_style() {
        assert_eq!(
            FetchMode::Unread.filter(),
            MessageFilter::Query("is:unread".to_owned())
        );
        assert_eq!(
            FetchMode::Latest.filter(),
            MessageFilter::Label("INBOX".to_owned())
        );
        assert_eq!(FetchMode::Unread.date_style(), DateStyle::LocalIso);
        assert_eq!(FetchMode::Latest.date_style(), DateStyle::Raw);
        assert!(FetchMode::Unread.includes_id());
        assert!(!FetchMode::Latest.includes_id());
    }
}
