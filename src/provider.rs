//! Mail Provider API abstraction
//!
//! The aggregator only ever talks to a mailbox through [`MailProvider`]. The
//! production implementation is [`crate::gmail::GmailClient`]; tests swap in
//! scripted providers.

use async_trait::async_trait;

use crate::errors::ProviderError;
use crate::models::MessageFilter;

/// Header/snippet metadata for one message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawMessage {
    /// Provider message ID
    pub id: String,
    /// Header name/value pairs in provider order
    pub headers: Vec<(String, String)>,
    /// Short plain-text preview
    pub snippet: Option<String>,
}

/// Authenticated account identity
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Profile {
    pub email_address: String,
}

/// One authenticated mailbox
#[async_trait]
pub trait MailProvider: Send + Sync {
    /// List up to `cap` message IDs matching `filter`, newest first
    async fn list_message_ids(
        &self,
        filter: &MessageFilter,
        cap: u32,
    ) -> Result<Vec<String>, ProviderError>;

    /// Fetch `From`/`Subject`/`Date` headers and snippet for one message
    async fn get_message(&self, id: &str) -> Result<RawMessage, ProviderError>;

    /// Resolve the mailbox's own address
    async fn get_profile(&self) -> Result<Profile, ProviderError>;
}

#[cfg(test)]
pub mod mock {
    use std::collections::{HashMap, HashSet};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    /// Scripted in-memory mailbox
    #[derive(Debug, Clone, Default)]
    pub struct MockProvider {
        pub email: String,
        pub ids: Vec<String>,
        pub messages: HashMap<String, RawMessage>,
        pub failing_messages: HashSet<String>,
        pub fail_listing: bool,
        pub fail_profile: bool,
        pub delay: Duration,
        pub calls: Arc<AtomicUsize>,
        pub last_filter: Arc<std::sync::Mutex<Option<(MessageFilter, u32)>>>,
    }

    impl MockProvider {
        pub fn new(email: &str) -> Self {
            Self {
                email: email.to_owned(),
                ..Self::default()
            }
        }

        /// Add a message with the given headers; order of calls is listing order
        pub fn with_message(mut self, id: &str, headers: &[(&str, &str)], snippet: &str) -> Self {
            self.ids.push(id.to_owned());
            self.messages.insert(
                id.to_owned(),
                RawMessage {
                    id: id.to_owned(),
                    headers: headers
                        .iter()
                        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                        .collect(),
                    snippet: Some(snippet.to_owned()),
                },
            );
            self
        }

        pub fn with_failing_message(mut self, id: &str) -> Self {
            self.ids.push(id.to_owned());
            self.failing_messages.insert(id.to_owned());
            self
        }
    }

    #[async_trait]
    impl MailProvider for MockProvider {
        async fn list_message_ids(
            &self,
            filter: &MessageFilter,
            cap: u32,
        ) -> Result<Vec<String>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut last) = self.last_filter.lock() {
                *last = Some((filter.clone(), cap));
            }
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail_listing {
                return Err(ProviderError::Status {
                    status: 500,
                    body: "backend error".to_owned(),
                });
            }
            Ok(self.ids.iter().take(cap as usize).cloned().collect())
        }

        async fn get_message(&self, id: &str) -> Result<RawMessage, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing_messages.contains(id) {
                return Err(ProviderError::Status {
                    status: 404,
                    body: "Requested entity was not found.".to_owned(),
                });
            }
            self.messages
                .get(id)
                .cloned()
                .ok_or_else(|| ProviderError::Decode(format!("unknown message {id}")))
        }

        async fn get_profile(&self) -> Result<Profile, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_profile {
                return Err(ProviderError::Transport("connection reset".to_owned()));
            }
            Ok(Profile {
                email_address: self.email.clone(),
            })
        }
    }
}
