//! In-process fakes for forwarder tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::Supervisor;
use crate::config::ForwarderPolicy;
use crate::notify::Notifier;
use crate::store::{
    Account, AccountId, AccountStore, JsonStore, NewAccount, StoreError, UserDefaults, UserId,
    UserSettings,
};
use crate::telegram::{
    ChatClient, Conversation, ConversationKind, Recipient, RecipientPeer, SelfMessage,
    SessionConnector, TelegramError,
};

pub const MARKER: &str = "By @HinariAdsBot";

/// Error a scripted client call returns instead of its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// Network hiccup; the call may succeed later.
    Transient,
    /// The session was revoked; the account must log in again.
    Revoked,
}

impl Failure {
    fn error(self) -> TelegramError {
        match self {
            Self::Transient => TelegramError::Connection("connection reset by peer".to_owned()),
            Self::Revoked => TelegramError::SessionRevoked("AUTH_KEY_UNREGISTERED".to_owned()),
        }
    }
}

fn next_failure(queue: &Mutex<VecDeque<Failure>>) -> Result<(), TelegramError> {
    match queue.lock().unwrap().pop_front() {
        Some(failure) => Err(failure.error()),
        None => Ok(()),
    }
}

/// Scripted behaviour of one fake account.
#[derive(Debug, Default)]
pub struct FakeState {
    pub bio: Mutex<String>,
    pub unauthorized: AtomicBool,
    pub connect_fails: AtomicBool,
    pub conversations: Mutex<Vec<Conversation>>,
    /// Failures returned by the next calls, one per call.
    pub bio_failures: Mutex<VecDeque<Failure>>,
    pub listing_failures: Mutex<VecDeque<Failure>>,
    pub poll_failures: Mutex<VecDeque<Failure>>,
    pub forward_failures: Mutex<VecDeque<Failure>>,
    pub listings: AtomicUsize,
    /// Poll results in order; the last one repeats.
    pub messages: Mutex<VecDeque<Option<SelfMessage>>>,
    /// Recipient titles whose forwards fail.
    pub failing: Mutex<HashSet<String>>,
    /// Successful forwards as `(title, message id)`.
    pub forwards: Mutex<Vec<(String, i32)>>,
    pub polls: AtomicUsize,
    pub disconnected: AtomicBool,
}

impl FakeState {
    pub fn set_bio(&self, bio: &str) {
        *self.bio.lock().unwrap() = bio.to_owned();
    }

    pub fn set_messages(&self, ids: &[i32]) {
        *self.messages.lock().unwrap() = ids
            .iter()
            .map(|&id| {
                Some(SelfMessage {
                    id,
                    text: format!("ad {id}"),
                })
            })
            .collect();
    }

    pub fn set_groups(&self, count: usize) {
        *self.conversations.lock().unwrap() = (1..=count)
            .map(|i| Conversation {
                recipient: Recipient {
                    peer: RecipientPeer::Chat {
                        chat_id: i64::try_from(i).unwrap(),
                    },
                    title: format!("g{i}"),
                },
                kind: ConversationKind::Group,
                left: false,
            })
            .collect();
    }

    pub fn fail_for(&self, title: &str) {
        self.failing.lock().unwrap().insert(title.to_owned());
    }

    pub fn fail_bio(&self, failures: &[Failure]) {
        self.bio_failures.lock().unwrap().extend(failures);
    }

    pub fn fail_listing(&self, failures: &[Failure]) {
        self.listing_failures.lock().unwrap().extend(failures);
    }

    pub fn fail_polls(&self, failures: &[Failure]) {
        self.poll_failures.lock().unwrap().extend(failures);
    }

    pub fn fail_forwards(&self, failures: &[Failure]) {
        self.forward_failures.lock().unwrap().extend(failures);
    }

    pub fn pending_bio_failures(&self) -> usize {
        self.bio_failures.lock().unwrap().len()
    }

    pub fn listings(&self) -> usize {
        self.listings.load(Ordering::SeqCst)
    }

    pub fn forwards(&self) -> Vec<(String, i32)> {
        self.forwards.lock().unwrap().clone()
    }

    pub fn forward_count(&self) -> usize {
        self.forwards.lock().unwrap().len()
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct FakeClient {
    state: Arc<FakeState>,
}

#[async_trait]
impl ChatClient for FakeClient {
    async fn is_authorized(&self) -> Result<bool, TelegramError> {
        Ok(!self.state.unauthorized.load(Ordering::SeqCst))
    }

    async fn own_bio(&self) -> Result<String, TelegramError> {
        next_failure(&self.state.bio_failures)?;
        Ok(self.state.bio.lock().unwrap().clone())
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>, TelegramError> {
        self.state.listings.fetch_add(1, Ordering::SeqCst);
        next_failure(&self.state.listing_failures)?;
        Ok(self.state.conversations.lock().unwrap().clone())
    }

    async fn last_self_message(&self) -> Result<Option<SelfMessage>, TelegramError> {
        self.state.polls.fetch_add(1, Ordering::SeqCst);
        next_failure(&self.state.poll_failures)?;
        let mut messages = self.state.messages.lock().unwrap();
        let next = if messages.len() > 1 {
            messages.pop_front().flatten()
        } else {
            messages.front().cloned().flatten()
        };
        Ok(next)
    }

    async fn forward_message(&self, recipient: &Recipient, message_id: i32) -> Result<(), TelegramError> {
        next_failure(&self.state.forward_failures)?;
        if self.state.failing.lock().unwrap().contains(&recipient.title) {
            return Err(TelegramError::ForwardFailed {
                recipient: recipient.title.clone(),
                reason: "CHAT_WRITE_FORBIDDEN".to_owned(),
            });
        }
        self.state
            .forwards
            .lock()
            .unwrap()
            .push((recipient.title.clone(), message_id));
        Ok(())
    }

    fn disconnect(&self) {
        self.state.disconnected.store(true, Ordering::SeqCst);
    }
}

/// Hands out fake clients, one scripted state per account.
#[derive(Debug, Default)]
pub struct FakeConnector {
    states: Mutex<HashMap<AccountId, Arc<FakeState>>>,
}

impl FakeConnector {
    pub fn state(&self, account_id: AccountId) -> Arc<FakeState> {
        Arc::clone(self.states.lock().unwrap().entry(account_id).or_default())
    }
}

#[async_trait]
impl SessionConnector for FakeConnector {
    async fn connect(&self, account: &Account) -> Result<Arc<dyn ChatClient>, TelegramError> {
        let state = self.state(account.id);
        if state.connect_fails.load(Ordering::SeqCst) {
            return Err(TelegramError::Session("session file missing".to_owned()));
        }
        Ok(Arc::new(FakeClient { state }))
    }
}

#[derive(Debug, Default)]
pub struct RecordingNotifier {
    pub messages: Mutex<Vec<(UserId, String)>>,
}

impl RecordingNotifier {
    pub fn messages(&self) -> Vec<(UserId, String)> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, owner_id: UserId, text: &str) {
        self.messages.lock().unwrap().push((owner_id, text.to_owned()));
    }
}

/// Store whose account lookups fail for chosen ids, and whose flag
/// clearing takes `clear_delay`.
#[derive(Debug)]
pub struct FlakyStore {
    pub inner: Arc<JsonStore>,
    pub broken: HashSet<AccountId>,
    pub clear_delay: Duration,
}

#[async_trait]
impl AccountStore for FlakyStore {
    async fn account(&self, id: AccountId) -> Result<Option<Account>, StoreError> {
        if self.broken.contains(&id) {
            return Err(StoreError::Io(std::io::Error::other("disk unavailable")));
        }
        self.inner.account(id).await
    }

    async fn all_accounts(&self) -> Result<Vec<Account>, StoreError> {
        self.inner.all_accounts().await
    }

    async fn accounts_for_owner(&self, owner_id: UserId) -> Result<Vec<Account>, StoreError> {
        self.inner.accounts_for_owner(owner_id).await
    }

    async fn forwarding_accounts(&self) -> Result<Vec<Account>, StoreError> {
        self.inner.forwarding_accounts().await
    }

    async fn set_forwarding(&self, id: AccountId, enabled: bool) -> Result<(), StoreError> {
        if !enabled && !self.clear_delay.is_zero() {
            tokio::time::sleep(self.clear_delay).await;
        }
        self.inner.set_forwarding(id, enabled).await
    }

    async fn insert_account(&self, account: NewAccount) -> Result<Account, StoreError> {
        self.inner.insert_account(account).await
    }

    async fn remove_account(&self, id: AccountId) -> Result<Option<Account>, StoreError> {
        self.inner.remove_account(id).await
    }

    async fn user_settings(&self, user_id: UserId) -> Result<Option<UserSettings>, StoreError> {
        self.inner.user_settings(user_id).await
    }

    async fn ensure_user(&self, user_id: UserId) -> Result<UserSettings, StoreError> {
        self.inner.ensure_user(user_id).await
    }

    async fn upsert_user(&self, settings: UserSettings) -> Result<(), StoreError> {
        self.inner.upsert_user(settings).await
    }

    async fn set_delay(&self, user_id: UserId, delay_secs: u64) -> Result<(), StoreError> {
        self.inner.set_delay(user_id, delay_secs).await
    }
}

pub fn test_policy() -> ForwarderPolicy {
    ForwarderPolicy {
        bio_marker: MARKER.to_owned(),
        pacing: Duration::from_millis(10),
        recovery_pause: Duration::from_secs(30),
        default_delay: Duration::from_secs(300),
        min_delay: Duration::from_secs(60),
        require_premium: true,
    }
}

/// Supervisor wired to fakes and an in-memory store.
pub struct Harness {
    pub store: Arc<JsonStore>,
    pub connector: Arc<FakeConnector>,
    pub notifier: Arc<RecordingNotifier>,
    pub supervisor: Arc<Supervisor>,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(Path::new("sessions"), |store| store as Arc<dyn AccountStore>)
    }

    /// Builds a harness whose supervisor sees the store through `wrap`.
    pub fn build(
        sessions_dir: &Path,
        wrap: impl FnOnce(Arc<JsonStore>) -> Arc<dyn AccountStore>,
    ) -> Self {
        let store = Arc::new(JsonStore::in_memory(
            sessions_dir,
            UserDefaults {
                delay_secs: 300,
                trial_days: 7,
            },
        ));
        let connector = Arc::new(FakeConnector::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let supervisor = Arc::new(Supervisor::new(
            wrap(Arc::clone(&store)),
            Arc::clone(&connector) as Arc<dyn SessionConnector>,
            Arc::clone(&notifier) as Arc<dyn Notifier>,
            test_policy(),
        ));

        Self {
            store,
            connector,
            notifier,
            supervisor,
        }
    }

    /// Adds an eligible account with `groups` recipients and a message script.
    pub async fn add_account(&self, owner_id: UserId, groups: usize, messages: &[i32]) -> (Account, Arc<FakeState>) {
        self.store.ensure_user(owner_id).await.unwrap();
        let account = self
            .store
            .insert_account(NewAccount {
                owner_id,
                phone: format!("+1555000{owner_id:04}"),
                api_id: 12345,
                api_hash: "0123456789abcdef".to_owned(),
            })
            .await
            .unwrap();

        let state = self.connector.state(account.id);
        state.set_bio(&format!("Ads daily | {MARKER}"));
        state.set_groups(groups);
        state.set_messages(messages);
        (account, state)
    }

    pub async fn flag(&self, account_id: AccountId) -> bool {
        self.store
            .account(account_id)
            .await
            .unwrap()
            .is_some_and(|a| a.forwarding_enabled)
    }
}

/// Waits (in virtual time) until `condition` holds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    panic!("condition not reached");
}

/// Waits (in virtual time) until the account's forwarder has deregistered.
pub async fn until_stopped(supervisor: &Supervisor, account_id: AccountId) {
    for _ in 0..10_000 {
        if !supervisor.is_running(account_id).await {
            return;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    panic!("forwarder {account_id} still running");
}
