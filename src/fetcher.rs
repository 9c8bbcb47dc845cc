//! Per-account message fetching
//!
//! Lists message IDs for one mailbox, fetches each message's metadata, and
//! shapes it into [`MessageSummary`] values. A single message that cannot be
//! loaded is skipped and counted; only a listing failure fails the account.

use chrono::{DateTime, FixedOffset, Local, SecondsFormat};

use crate::errors::ProviderError;
use crate::models::{DateStyle, FetchMode, MessageSummary};
use crate::provider::{MailProvider, RawMessage};

/// Messages fetched for one account plus the number that were skipped
#[derive(Debug, Default)]
pub struct FetchOutcome {
    pub messages: Vec<MessageSummary>,
    pub failed: usize,
}

/// Fetch up to `max_results` messages in `mode`
///
/// Message order follows the provider listing.
///
/// # Errors
///
/// Returns the listing error; per-message errors are absorbed into
/// `FetchOutcome::failed`.
pub async fn fetch_messages(
    provider: &dyn MailProvider,
    mode: FetchMode,
    max_results: u32,
) -> Result<FetchOutcome, ProviderError> {
    let ids = provider
        .list_message_ids(&mode.filter(), max_results)
        .await?;
    tracing::debug!(mode = mode.as_str(), listed = ids.len(), "listed messages");

    let mut outcome = FetchOutcome::default();
    for id in ids.iter().take(max_results as usize) {
        match provider.get_message(id).await {
            Ok(raw) => outcome.messages.push(summarize(id, &raw, mode)),
            Err(e) => {
                tracing::warn!(message_id = %id, error = %e, "skipping message");
                outcome.failed += 1;
            }
        }
    }
    Ok(outcome)
}

fn summarize(id: &str, raw: &RawMessage, mode: FetchMode) -> MessageSummary {
    let date = header_value(&raw.headers, "Date").unwrap_or_default();
    MessageSummary {
        id: mode.includes_id().then(|| id.to_owned()),
        from: header_value(&raw.headers, "From").unwrap_or_default(),
        subject: header_value(&raw.headers, "Subject").unwrap_or_default(),
        date: normalize_date(&date, mode.date_style()),
        snippet: raw.snippet.clone().unwrap_or_default(),
    }
}

/// First header value matching `name`, ignoring ASCII case
pub fn header_value(headers: &[(String, String)], name: &str) -> Option<String> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.clone())
}

/// Render a `Date` header per `style`
///
/// `LocalIso` yields ISO-8601 with offset in the process's local timezone,
/// or `""` when the header is empty or unparseable. `Raw` returns the input.
pub fn normalize_date(raw: &str, style: DateStyle) -> String {
    match style {
        DateStyle::Raw => raw.to_owned(),
        DateStyle::LocalIso => parse_mail_date(raw)
            .map(|dt| {
                dt.with_timezone(&Local)
                    .to_rfc3339_opts(SecondsFormat::Secs, false)
            })
            .unwrap_or_default(),
    }
}

/// Strict RFC 2822, retried once without the weekday and trailing comment
///
/// The retry accepts real-world headers chrono rejects, such as a weekday
/// that does not match the date or a `(UTC)` zone comment. Impossible
/// calendar dates are rejected either way.
fn parse_mail_date(raw: &str) -> Option<DateTime<FixedOffset>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(trimmed) {
        return Some(dt);
    }
    let relaxed = strip_trailing_comment(strip_weekday(trimmed));
    DateTime::parse_from_rfc2822(relaxed).ok()
}

/// Drop a leading `Day,` prefix
fn strip_weekday(value: &str) -> &str {
    match value.split_once(',') {
        Some((day, rest)) if day.trim().chars().all(|c| c.is_ascii_alphabetic()) => {
            rest.trim_start()
        }
        _ => value,
    }
}

/// Drop a trailing `(comment)`
fn strip_trailing_comment(value: &str) -> &str {
    let value = value.trim_end();
    match value.strip_suffix(')').and_then(|v| v.rfind('(')) {
        Some(open) => value[..open].trim_end(),
        None => value,
    }
}
