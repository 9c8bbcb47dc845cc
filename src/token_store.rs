//! File-backed OAuth token storage
//!
//! One JSON file per account, named `<email>.json`, in Google's "authorized
//! user" layout. The file stem is the account's token identifier. Listing
//! preserves directory order; nothing is sorted.

use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::{AppError, AppResult, CredentialError};

/// Tokens expiring within this window are treated as already expired
pub const REFRESH_SKEW_SECS: i64 = 60;

const TOKEN_EXTENSION: &str = "json";

static IDENTIFIER_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_%+@-][A-Za-z0-9._%+@-]{0,253}$").expect("static regex is valid")
});

/// Stored credential for one account
///
/// Unknown fields written by other tools are preserved on save.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct StoredToken {
    /// Short-lived access token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Long-lived refresh token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Token endpoint for the refresh grant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<String>>,
    /// Access token expiry (UTC); `None` means the expiry is unknown
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl StoredToken {
    /// Whether the access token can be used as-is at `now`
    ///
    /// A token without an expiry is trusted until the API rejects it.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        let has_token = self.token.as_deref().is_some_and(|t| !t.is_empty());
        has_token
            && self
                .expiry
                .is_none_or(|exp| exp - Duration::seconds(REFRESH_SKEW_SECS) > now)
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }

    /// Whether a refresh token is present
    pub fn has_refresh_token(&self) -> bool {
        self.refresh_token.as_deref().is_some_and(|t| !t.is_empty())
    }
}

impl fmt::Debug for StoredToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredToken")
            .field("token", &self.token.as_deref().map(mask))
            .field("refresh_token", &self.refresh_token.as_deref().map(mask))
            .field("token_uri", &self.token_uri)
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_deref().map(mask))
            .field("expiry", &self.expiry)
            .finish_non_exhaustive()
    }
}

/// Mask a secret for debug output: first 4 chars, then `***`
fn mask(secret: &str) -> String {
    match secret.char_indices().nth(4) {
        Some((idx, _)) => format!("{}***", &secret[..idx]),
        None => "***".to_owned(),
    }
}

/// Credential Store collaborator
///
/// Persistence of refreshed tokens is the store's responsibility; callers
/// only trigger it through [`TokenStore::save`].
pub trait TokenStore: Send + Sync {
    /// Token identifiers in discovery order
    ///
    /// # Errors
    ///
    /// Returns `Store` if the backing storage cannot be enumerated.
    fn list_identifiers(&self) -> AppResult<Vec<String>>;

    /// Load the token for `identifier`
    fn load(&self, identifier: &str) -> Result<StoredToken, CredentialError>;

    /// Persist a (refreshed) token for `identifier`
    fn save(&self, identifier: &str, token: &StoredToken) -> AppResult<()>;

    /// Remove the token for `identifier`
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no token exists for the identifier.
    fn delete(&self, identifier: &str) -> AppResult<()>;
}

/// Run a store operation on the blocking thread pool
///
/// Store implementations do synchronous file I/O; async callers go through
/// here so directory scans never stall a runtime worker.
///
/// # Errors
///
/// Returns the operation's error, or `Internal` if the blocking task panicked.
pub async fn run_blocking<T, F>(store: &Arc<dyn TokenStore>, op: F) -> AppResult<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn TokenStore) -> AppResult<T> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || op(store.as_ref()))
        .await
        .map_err(|e| AppError::Internal(format!("token store task failed: {e}")))?
}

/// Token store backed by a directory of `<identifier>.json` files
#[derive(Debug, Clone)]
pub struct FileTokenStore {
    dir: PathBuf,
}

impl FileTokenStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Path of the token file for `identifier`
    pub fn path_for(&self, identifier: &str) -> PathBuf {
        self.dir.join(format!("{identifier}.{TOKEN_EXTENSION}"))
    }

    /// Create the token directory if it does not exist yet
    pub fn ensure_dir(&self) -> AppResult<()> {
        fs::create_dir_all(&self.dir).map_err(|e| {
            AppError::Store(format!(
                "failed to create token directory '{}': {e}",
                self.dir.display()
            ))
        })
    }
}

impl TokenStore for FileTokenStore {
    fn list_identifiers(&self) -> AppResult<Vec<String>> {
        self.ensure_dir()?;
        let entries = fs::read_dir(&self.dir).map_err(|e| {
            AppError::Store(format!(
                "failed to read token directory '{}': {e}",
                self.dir.display()
            ))
        })?;

        let mut identifiers = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| {
                AppError::Store(format!(
                    "failed to read token directory entry in '{}': {e}",
                    self.dir.display()
                ))
            })?;
            let path = entry.path();
            if !path.is_file()
                || path.extension().and_then(|ext| ext.to_str()) != Some(TOKEN_EXTENSION)
            {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                identifiers.push(stem.to_owned());
            }
        }
        Ok(identifiers)
    }

    fn load(&self, identifier: &str) -> Result<StoredToken, CredentialError> {
        let path = self.path_for(identifier);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(CredentialError::NotFound(path.display().to_string()));
            }
            Err(e) => {
                return Err(CredentialError::Unreadable(format!(
                    "{}: {e}",
                    path.display()
                )));
            }
        };

        let token: StoredToken = serde_json::from_str(&content)
            .map_err(|e| CredentialError::Unreadable(format!("{}: {e}", path.display())))?;
        tracing::debug!(
            identifier,
            expiry = ?token.expiry,
            "loaded token"
        );
        Ok(token)
    }

    fn save(&self, identifier: &str, token: &StoredToken) -> AppResult<()> {
        validate_identifier(identifier)?;
        self.ensure_dir()?;

        let path = self.path_for(identifier);
        let tmp = self.dir.join(format!(".{identifier}.{TOKEN_EXTENSION}.tmp"));
        let content = serde_json::to_string_pretty(token)
            .map_err(|e| AppError::Internal(format!("failed to serialize token: {e}")))?;

        fs::write(&tmp, content).map_err(|e| {
            AppError::Store(format!("failed to write token file '{}': {e}", tmp.display()))
        })?;
        set_owner_only(&tmp)?;
        fs::rename(&tmp, &path).map_err(|e| {
            AppError::Store(format!(
                "failed to replace token file '{}': {e}",
                path.display()
            ))
        })?;

        tracing::debug!(identifier, "saved token");
        Ok(())
    }

    fn delete(&self, identifier: &str) -> AppResult<()> {
        validate_identifier(identifier)?;
        let path = self.path_for(identifier);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(AppError::NotFound(format!("account '{identifier}'")))
            }
            Err(e) => Err(AppError::Store(format!(
                "failed to delete token file '{}': {e}",
                path.display()
            ))),
        }
    }
}

/// Validate an identifier before using it to build a file path
///
/// Rejects path separators, leading dots, and anything outside the
/// characters an email address can reasonably contain.
pub fn validate_identifier(identifier: &str) -> AppResult<()> {
    if !IDENTIFIER_PATTERN.is_match(identifier) || identifier.contains("..") {
        return Err(AppError::InvalidInput(format!(
            "invalid account identifier '{identifier}'"
        )));
    }
    Ok(())
}

#[cfg(unix)]
fn set_owner_only(path: &Path) -> AppResult<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| {
        AppError::Store(format!(
            "failed to set permissions on '{}': {e}",
            path.display()
        ))
    })
}

#[cfg(not(unix))]
fn set_owner_only(_path: &Path) -> AppResult<()> {
    Ok(())
}
