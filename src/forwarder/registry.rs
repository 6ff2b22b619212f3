//! Registry of running forwarders.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::store::{AccountId, AccountStore, UserId};

/// Live forwarder as seen by the supervisor.
#[derive(Debug)]
pub(crate) struct Entry {
    pub owner_id: UserId,
    /// Distinguishes successive forwarders of the same account.
    pub generation: u64,
    pub cancel: CancellationToken,
    pub handle: JoinHandle<()>,
}

/// At most one entry per account id.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    entries: Mutex<HashMap<AccountId, Entry>>,
}

impl Registry {
    pub async fn lock(&self) -> MutexGuard<'_, HashMap<AccountId, Entry>> {
        self.entries.lock().await
    }

    /// Removes the entry only if it still belongs to `generation`, and clears
    /// the persisted flag before the slot can be claimed again.
    pub async fn release(
        &self,
        account_id: AccountId,
        generation: u64,
        store: &dyn AccountStore,
    ) -> bool {
        let mut entries = self.entries.lock().await;
        if !entries
            .get(&account_id)
            .is_some_and(|entry| entry.generation == generation)
        {
            return false;
        }

        entries.remove(&account_id);
        if let Err(e) = store.set_forwarding(account_id, false).await {
            warn!(account = account_id, "Failed to clear forwarding flag: {}", e);
        }
        true
    }
}

/// A forwarder's claim on its registry slot.
#[derive(Debug, Clone)]
pub(crate) struct Registration {
    pub registry: Arc<Registry>,
    pub account_id: AccountId,
    pub generation: u64,
}

impl Registration {
    /// Gives the slot back and clears the flag.
    ///
    /// Returns `false` (leaving the flag alone) if someone else already took it.
    pub async fn release(&self, store: &dyn AccountStore) -> bool {
        self.registry
            .release(self.account_id, self.generation, store)
            .await
    }
}
