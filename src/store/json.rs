//! JSON file backed store.
//!
//! The whole document is small (one row per account and per user), so every
//! write reloads it under a file lock, applies the change, and rewrites the
//! file atomically.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, RwLockReadGuard};
use tracing::{debug, info};

use super::{Account, AccountId, AccountStore, NewAccount, StoreError, UserId, UserSettings};
use crate::config::DEFAULT_DELAY_SECS;

/// Values applied to users created implicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserDefaults {
    pub delay_secs: u64,
    pub trial_days: i64,
}

impl Default for UserDefaults {
    fn default() -> Self {
        Self {
            delay_secs: DEFAULT_DELAY_SECS,
            trial_days: 7,
        }
    }
}

/// Serialized document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreData {
    /// Next id handed out by `insert_account`.
    pub next_account_id: AccountId,

    #[serde(default)]
    pub accounts: BTreeMap<AccountId, Account>,

    #[serde(default)]
    pub users: BTreeMap<UserId, UserSettings>,
}

impl Default for StoreData {
    fn default() -> Self {
        Self {
            next_account_id: 1,
            accounts: BTreeMap::new(),
            users: BTreeMap::new(),
        }
    }
}

impl StoreData {
    /// Loads the document, returning an empty one if the file does not exist.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        match std::fs::read_to_string(path) {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Writes the document through a temporary file and a rename.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");

        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// Advisory lock on `<store>.lock`, released on drop.
struct StoreLock {
    file: File,
}

impl StoreLock {
    fn open(store_path: &Path) -> Result<File, StoreError> {
        let mut lock_path = store_path.as_os_str().to_owned();
        lock_path.push(".lock");

        if let Some(parent) = store_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        Ok(OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path)?)
    }

    /// Blocks until no other handle holds the lock.
    fn exclusive(store_path: &Path) -> Result<Self, StoreError> {
        let file = Self::open(store_path)?;
        FileExt::lock_exclusive(&file)?;
        Ok(Self { file })
    }

    /// Blocks while a writer holds the lock.
    fn shared(store_path: &Path) -> Result<Self, StoreError> {
        let file = Self::open(store_path)?;
        FileExt::lock_shared(&file)?;
        Ok(Self { file })
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Account store persisted as one JSON document.
///
/// Several processes (the service, `login`, `delete`) may open the same file.
/// Every read reloads the document and every write is a locked
/// read-modify-write, so no process overwrites another's changes.
#[derive(Debug)]
pub struct JsonStore {
    /// `None` keeps the store in memory only.
    path: Option<PathBuf>,

    /// Directory for newly allocated session files.
    sessions_dir: PathBuf,

    defaults: UserDefaults,

    /// Last document read or written.
    data: RwLock<StoreData>,
}

impl JsonStore {
    /// Opens (or creates) the store at `path`.
    pub fn open(
        path: impl Into<PathBuf>,
        sessions_dir: impl Into<PathBuf>,
        defaults: UserDefaults,
    ) -> Result<Self, StoreError> {
        let path = path.into();
        let data = {
            let _lock = StoreLock::shared(&path)?;
            StoreData::load_from_file(&path)?
        };

        info!(
            "Opened store {} ({} accounts, {} users)",
            path.display(),
            data.accounts.len(),
            data.users.len()
        );

        Ok(Self {
            path: Some(path),
            sessions_dir: sessions_dir.into(),
            defaults,
            data: RwLock::new(data),
        })
    }

    /// Creates a store that never touches the disk.
    #[must_use]
    pub fn in_memory(sessions_dir: impl Into<PathBuf>, defaults: UserDefaults) -> Self {
        Self {
            path: None,
            sessions_dir: sessions_dir.into(),
            defaults,
            data: RwLock::new(StoreData::default()),
        }
    }

    /// Returns the current document, reloaded from disk for file stores.
    async fn current(&self) -> Result<RwLockReadGuard<'_, StoreData>, StoreError> {
        let Some(path) = &self.path else {
            return Ok(self.data.read().await);
        };

        let mut data = self.data.write().await;
        let fresh = {
            let _lock = StoreLock::shared(path)?;
            StoreData::load_from_file(path)?
        };
        *data = fresh;
        Ok(data.downgrade())
    }

    /// Applies `change` to the latest document, persists it, then commits.
    ///
    /// File stores hold the exclusive lock from the reload to the rename.
    async fn update<T>(
        &self,
        change: impl FnOnce(&mut StoreData) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut data = self.data.write().await;

        let Some(path) = &self.path else {
            let mut draft = data.clone();
            let out = change(&mut draft)?;
            *data = draft;
            return Ok(out);
        };

        let _lock = StoreLock::exclusive(path)?;
        let mut draft = StoreData::load_from_file(path)?;
        let out = change(&mut draft)?;
        draft.save_to_file(path)?;

        *data = draft;
        Ok(out)
    }

    fn session_path_for(&self, owner_id: UserId, account_id: AccountId) -> PathBuf {
        self.sessions_dir
            .join(format!("user_{owner_id}_acc_{account_id}.session"))
    }
}

#[async_trait]
impl AccountStore for JsonStore {
    async fn account(&self, id: AccountId) -> Result<Option<Account>, StoreError> {
        Ok(self.current().await?.accounts.get(&id).cloned())
    }

    async fn all_accounts(&self) -> Result<Vec<Account>, StoreError> {
        Ok(self.current().await?.accounts.values().cloned().collect())
    }

    async fn accounts_for_owner(&self, owner_id: UserId) -> Result<Vec<Account>, StoreError> {
        Ok(self
            .current()
            .await?
            .accounts
            .values()
            .filter(|a| a.owner_id == owner_id)
            .cloned()
            .collect())
    }

    async fn forwarding_accounts(&self) -> Result<Vec<Account>, StoreError> {
        Ok(self
            .current()
            .await?
            .accounts
            .values()
            .filter(|a| a.forwarding_enabled)
            .cloned()
            .collect())
    }

    async fn set_forwarding(&self, id: AccountId, enabled: bool) -> Result<(), StoreError> {
        {
            let data = self.current().await?;
            match data.accounts.get(&id) {
                Some(account) if account.forwarding_enabled == enabled => return Ok(()),
                Some(_) => {}
                None => {
                    debug!("Account {} no longer exists, forwarding flag not stored", id);
                    return Ok(());
                }
            }
        }

        self.update(|data| {
            if let Some(account) = data.accounts.get_mut(&id) {
                account.forwarding_enabled = enabled;
            }
            Ok(())
        })
        .await
    }

    async fn insert_account(&self, new: NewAccount) -> Result<Account, StoreError> {
        let sessions_dir_exists = self.sessions_dir.exists();
        if self.path.is_some() && !sessions_dir_exists {
            std::fs::create_dir_all(&self.sessions_dir)?;
        }

        let account = self
            .update(|data| {
                let id = data.next_account_id;
                data.next_account_id += 1;

                let account = Account {
                    id,
                    owner_id: new.owner_id,
                    phone: new.phone,
                    api_id: new.api_id,
                    api_hash: new.api_hash,
                    session_path: self.session_path_for(new.owner_id, id),
                    forwarding_enabled: false,
                    created_at: Utc::now(),
                };
                data.accounts.insert(id, account.clone());
                Ok(account)
            })
            .await?;

        info!(
            "Stored account {} ({}) for user {}",
            account.id,
            account.masked_phone(),
            account.owner_id
        );
        Ok(account)
    }

    async fn remove_account(&self, id: AccountId) -> Result<Option<Account>, StoreError> {
        self.update(|data| Ok(data.accounts.remove(&id))).await
    }

    async fn user_settings(&self, user_id: UserId) -> Result<Option<UserSettings>, StoreError> {
        Ok(self.current().await?.users.get(&user_id).cloned())
    }

    async fn ensure_user(&self, user_id: UserId) -> Result<UserSettings, StoreError> {
        if let Some(settings) = self.user_settings(user_id).await? {
            return Ok(settings);
        }

        let defaults = self.defaults;
        self.update(|data| {
            let settings = data
                .users
                .entry(user_id)
                .or_insert_with(|| {
                    UserSettings::with_trial(user_id, defaults.delay_secs, defaults.trial_days, Utc::now())
                })
                .clone();
            Ok(settings)
        })
        .await
    }

    async fn upsert_user(&self, settings: UserSettings) -> Result<(), StoreError> {
        self.update(|data| {
            data.users.insert(settings.user_id, settings);
            Ok(())
        })
        .await
    }

    async fn set_delay(&self, user_id: UserId, delay_secs: u64) -> Result<(), StoreError> {
        self.update(|data| {
            let settings = data
                .users
                .get_mut(&user_id)
                .ok_or(StoreError::UnknownUser(user_id))?;
            settings.delay_secs = delay_secs;
            Ok(())
        })
        .await
    }
}
