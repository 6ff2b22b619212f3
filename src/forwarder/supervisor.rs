//! Forwarder supervisor.
//!
//! Owns the registry of running forwarders and is the only place that
//! starts or stops them. The persisted forwarding flag is written here on
//! start and stop, and by the forwarder itself when it ends on its own.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::SupervisorError;
use super::registry::{Entry, Registration, Registry};
use super::runner::{AccountForwarder, ForwarderContext};
use crate::config::ForwarderPolicy;
use crate::notify::Notifier;
use crate::store::{AccountId, AccountStore, UserId, remove_session_files};
use crate::telegram::SessionConnector;

/// A forwarder currently registered with the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunningForwarder {
    pub account_id: AccountId,
    pub owner_id: UserId,
}

/// Starts, stops and tracks account forwarders.
pub struct Supervisor {
    context: ForwarderContext,
    registry: Arc<Registry>,
    shutdown: CancellationToken,
    next_generation: AtomicU64,
}

impl Supervisor {
    /// Creates a supervisor with no running forwarders.
    pub fn new(
        store: Arc<dyn AccountStore>,
        connector: Arc<dyn SessionConnector>,
        notifier: Arc<dyn Notifier>,
        policy: ForwarderPolicy,
    ) -> Self {
        Self {
            context: ForwarderContext {
                store,
                connector,
                notifier,
                policy,
            },
            registry: Arc::new(Registry::default()),
            shutdown: CancellationToken::new(),
            next_generation: AtomicU64::new(1),
        }
    }

    /// The store this supervisor persists flags to.
    pub fn store(&self) -> &Arc<dyn AccountStore> {
        &self.context.store
    }

    /// Starts forwarding for an account.
    ///
    /// Returns `Ok(false)` if a forwarder for the account is already running.
    pub async fn start(&self, account_id: AccountId) -> Result<bool, SupervisorError> {
        if self.shutdown.is_cancelled() {
            return Err(SupervisorError::ShuttingDown);
        }

        let account = self
            .context
            .store
            .account(account_id)
            .await?
            .ok_or(SupervisorError::UnknownAccount(account_id))?;

        let mut entries = self.registry.lock().await;
        if self.shutdown.is_cancelled() {
            return Err(SupervisorError::ShuttingDown);
        }
        if entries.contains_key(&account_id) {
            debug!(account = account_id, "Forwarder already running");
            return Ok(false);
        }

        self.context.store.set_forwarding(account_id, true).await?;

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = self.shutdown.child_token();
        let registration = Registration {
            registry: Arc::clone(&self.registry),
            account_id,
            generation,
        };

        let owner_id = account.owner_id;
        let forwarder =
            AccountForwarder::new(account, self.context.clone(), cancel.clone(), registration);
        let handle = tokio::spawn(async move {
            forwarder.run().await;
        });

        entries.insert(
            account_id,
            Entry {
                owner_id,
                generation,
                cancel,
                handle,
            },
        );

        info!(account = account_id, owner = owner_id, "Forwarder started");
        Ok(true)
    }

    /// Stops forwarding for an account and clears its persisted flag.
    ///
    /// Returns whether a forwarder was running. The flag is cleared even when
    /// none was, unless a `start` racing this call registered a new forwarder.
    pub async fn stop(&self, account_id: AccountId) -> Result<bool, SupervisorError> {
        let entry = self.registry.lock().await.remove(&account_id);

        let was_running = if let Some(entry) = entry {
            entry.cancel.cancel();
            if let Err(e) = entry.handle.await {
                warn!(account = account_id, "Forwarder task failed: {}", e);
            }
            info!(account = account_id, "Forwarder stopped");
            true
        } else {
            debug!(account = account_id, "No forwarder to stop");
            false
        };

        let entries = self.registry.lock().await;
        if entries.contains_key(&account_id) {
            debug!(account = account_id, "Restarted while stopping, flag kept");
        } else {
            self.context.store.set_forwarding(account_id, false).await?;
        }
        drop(entries);

        Ok(was_running)
    }

    /// Starts a forwarder for every account whose flag is set.
    ///
    /// Failures are logged per account and never abort the others.
    /// Returns how many forwarders were started.
    pub async fn resume_all(&self) -> usize {
        let accounts = match self.context.store.forwarding_accounts().await {
            Ok(accounts) => accounts,
            Err(e) => {
                warn!("Could not list accounts to resume: {}", e);
                return 0;
            }
        };

        let mut started = 0;
        for account in accounts {
            match self.start(account.id).await {
                Ok(true) => started += 1,
                Ok(false) => {}
                Err(e) => warn!(account = account.id, "Could not resume forwarder: {}", e),
            }
        }

        info!("Resumed {} forwarders", started);
        started
    }

    /// Stops an account's forwarder, then deletes its record and session.
    pub async fn delete_account(&self, account_id: AccountId) -> Result<(), SupervisorError> {
        self.stop(account_id).await?;

        let account = self
            .context
            .store
            .remove_account(account_id)
            .await?
            .ok_or(SupervisorError::UnknownAccount(account_id))?;

        remove_session_files(&account.session_path);
        info!(account = account_id, "Deleted account {}", account.masked_phone());
        Ok(())
    }

    /// Forwarders currently registered, ordered by account id.
    pub async fn running(&self) -> Vec<RunningForwarder> {
        let mut running: Vec<_> = self
            .registry
            .lock()
            .await
            .iter()
            .map(|(&account_id, entry)| RunningForwarder {
                account_id,
                owner_id: entry.owner_id,
            })
            .collect();
        running.sort_by_key(|r| r.account_id);
        running
    }

    /// Whether a forwarder for the account is registered.
    pub async fn is_running(&self, account_id: AccountId) -> bool {
        self.registry.lock().await.contains_key(&account_id)
    }

    /// Cancels every forwarder and waits for them to finish.
    ///
    /// Persisted flags are left untouched so the next start resumes them.
    pub async fn shutdown(&self) {
        let entries: Vec<_> = {
            let mut registry = self.registry.lock().await;
            self.shutdown.cancel();
            registry.drain().collect()
        };

        info!("Shutting down {} forwarders", entries.len());
        for (account_id, entry) in entries {
            if let Err(e) = entry.handle.await {
                warn!(account = account_id, "Forwarder task failed: {}", e);
            }
        }
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("policy", &self.context.policy)
            .field("shutting_down", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}
