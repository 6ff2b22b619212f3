//! Persistent account and user-settings storage.
//!
//! The forwarder only ever talks to [`AccountStore`]; the bundled
//! implementation keeps everything in a single JSON document.

mod audit;
mod json;
mod records;

use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

pub use audit::{Severity, StoreIssue};
pub use json::{JsonStore, StoreData, UserDefaults};
pub use records::{Account, AccountId, NewAccount, UserId, UserSettings};

/// Errors raised by the account store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to access store file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse store file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Unknown account: {0}")]
    UnknownAccount(AccountId),

    #[error("Unknown user: {0}")]
    UnknownUser(UserId),
}

/// Persisted accounts and per-user settings.
///
/// Rows are keyed by a single account or user id and every write is
/// last-write-wins, so forwarders may read concurrently with writers.
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Looks up one account.
    async fn account(&self, id: AccountId) -> Result<Option<Account>, StoreError>;

    /// Returns every account, ordered by id.
    async fn all_accounts(&self) -> Result<Vec<Account>, StoreError>;

    /// Returns the accounts owned by a user, ordered by id.
    async fn accounts_for_owner(&self, owner_id: UserId) -> Result<Vec<Account>, StoreError>;

    /// Returns the accounts whose forwarding flag is set.
    async fn forwarding_accounts(&self) -> Result<Vec<Account>, StoreError>;

    /// Persists the forwarding flag. A missing account is not an error.
    async fn set_forwarding(&self, id: AccountId, enabled: bool) -> Result<(), StoreError>;

    /// Creates an account record and assigns its session file path.
    async fn insert_account(&self, account: NewAccount) -> Result<Account, StoreError>;

    /// Removes an account record, returning it if it existed.
    async fn remove_account(&self, id: AccountId) -> Result<Option<Account>, StoreError>;

    /// Looks up a user's settings.
    async fn user_settings(&self, user_id: UserId) -> Result<Option<UserSettings>, StoreError>;

    /// Returns a user's settings, creating them (with a trial) if missing.
    async fn ensure_user(&self, user_id: UserId) -> Result<UserSettings, StoreError>;

    /// Inserts or replaces a user's settings.
    async fn upsert_user(&self, settings: UserSettings) -> Result<(), StoreError>;

    /// Changes a user's delay between forward passes.
    async fn set_delay(&self, user_id: UserId, delay_secs: u64) -> Result<(), StoreError>;
}

/// Deletes a session file together with the SQLite side files next to it.
pub fn remove_session_files(session_path: &Path) {
    let base = session_path.as_os_str().to_owned();

    for suffix in ["", "-journal", "-wal", "-shm"] {
        let mut candidate = base.clone();
        candidate.push(suffix);
        let candidate = Path::new(&candidate);

        if candidate.exists() {
            match std::fs::remove_file(candidate) {
                Ok(()) => debug!("Removed session file {}", candidate.display()),
                Err(e) => debug!("Could not remove {}: {}", candidate.display(), e),
            }
        }
    }
}
