//! Account forwarder loop.
//!
//! The forwarder follows a simple state machine:
//! 1. Authenticate the account's session
//! 2. Check eligibility (bio marker, ban, subscription)
//! 3. Discover recipients once and cache them
//! 4. Loop:
//!    - From the second cycle on, re-check eligibility
//!    - Poll the latest Saved Messages entry
//!    - If it is new → forward it to every recipient, paced
//!    - Re-read the owner's delay and sleep
//! 5. Terminate: release the registry slot, clear the persisted flag,
//!    notify the owner on fatal errors, disconnect
//!
//! Every network call and sleep is raced against the cancellation token.

use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::registry::Registration;
use super::{ForwarderError, PolicyViolation};
use crate::config::ForwarderPolicy;
use crate::notify::Notifier;
use crate::store::{Account, AccountStore};
use crate::telegram::{
    ChatClient, RateLimiter, Recipient, SelfMessage, SessionConnector, TelegramError,
    truncate_for_log,
};

/// Collaborators shared by every forwarder of a supervisor.
#[derive(Clone)]
pub(crate) struct ForwarderContext {
    pub store: Arc<dyn AccountStore>,
    pub connector: Arc<dyn SessionConnector>,
    pub notifier: Arc<dyn Notifier>,
    pub policy: ForwarderPolicy,
}

/// Background task forwarding one account's latest saved message.
pub(crate) struct AccountForwarder {
    account: Account,
    context: ForwarderContext,
    cancel: CancellationToken,
    registration: Registration,

    /// Spaces the sends of one fan-out.
    pacer: RateLimiter,

    /// Id of the message forwarded by the previous fan-out.
    last_forwarded: Option<i32>,

    /// Discovered once per forwarder lifetime.
    recipients: Vec<Recipient>,

    /// Last delay read from the owner's settings.
    delay: Duration,
}

impl AccountForwarder {
    pub fn new(
        account: Account,
        context: ForwarderContext,
        cancel: CancellationToken,
        registration: Registration,
    ) -> Self {
        let pacer = RateLimiter::new(context.policy.pacing);
        let delay = context.policy.default_delay;

        Self {
            account,
            context,
            cancel,
            registration,
            pacer,
            last_forwarded: None,
            recipients: Vec::new(),
            delay,
        }
    }

    /// Runs until cancelled or a fatal error, then cleans up.
    ///
    /// Returns the reason the forwarder stopped.
    pub async fn run(mut self) -> ForwarderError {
        info!(
            account = self.account.id,
            owner = self.account.owner_id,
            "Forwarder starting for {}",
            self.account.masked_phone()
        );

        let mut client = None;
        let reason = match self.drive(&mut client).await {
            Ok(never) => match never {},
            Err(reason) => reason,
        };

        self.terminate(&reason, client).await;
        reason
    }

    async fn drive(
        &mut self,
        slot: &mut Option<Arc<dyn ChatClient>>,
    ) -> Result<Infallible, ForwarderError> {
        let client = self.authenticate().await?;
        *slot = Some(Arc::clone(&client));

        self.check_eligibility(client.as_ref(), true).await?;
        self.discover_recipients(client.as_ref()).await?;

        let mut recheck = false;
        loop {
            self.cycle(client.as_ref(), recheck).await?;
            recheck = true;
        }
    }

    async fn authenticate(&self) -> Result<Arc<dyn ChatClient>, ForwarderError> {
        let client = self
            .guard(self.context.connector.connect(&self.account))
            .await?
            .map_err(|e| ForwarderError::Authentication(e.to_string()))?;

        match self.guard(client.is_authorized()).await? {
            Ok(true) => {
                debug!(account = self.account.id, "Session authorized");
                Ok(client)
            }
            Ok(false) => {
                client.disconnect();
                Err(ForwarderError::Authentication(
                    TelegramError::NotAuthorized.to_string(),
                ))
            }
            Err(e) => {
                client.disconnect();
                Err(ForwarderError::Authentication(e.to_string()))
            }
        }
    }

    /// Checks the bio marker and the owner's standing.
    ///
    /// On the initial check a failed bio fetch is fatal; on rechecks only
    /// session errors are, anything else skips the bio check for this cycle.
    async fn check_eligibility(
        &self,
        client: &dyn ChatClient,
        initial: bool,
    ) -> Result<(), ForwarderError> {
        match self.guard(client.own_bio()).await? {
            Ok(bio) => {
                let marker = &self.context.policy.bio_marker;
                if !bio.contains(marker.as_str()) {
                    return Err(PolicyViolation::MissingBioMarker {
                        marker: marker.clone(),
                    }
                    .into());
                }
            }
            Err(e) if initial || e.is_session_fatal() => {
                return Err(ForwarderError::Authentication(format!(
                    "could not read profile: {e}"
                )));
            }
            Err(e) => {
                warn!(account = self.account.id, "Skipping bio check this cycle: {}", e);
            }
        }

        self.check_owner().await
    }

    async fn check_owner(&self) -> Result<(), ForwarderError> {
        let settings = match self.context.store.user_settings(self.account.owner_id).await {
            Ok(settings) => settings,
            Err(e) => {
                warn!(account = self.account.id, "Could not read owner settings: {}", e);
                return Ok(());
            }
        };

        match settings {
            Some(s) if s.is_banned => Err(PolicyViolation::Banned.into()),
            Some(s) if self.context.policy.require_premium && !s.is_premium_at(Utc::now()) => {
                Err(PolicyViolation::SubscriptionExpired.into())
            }
            None if self.context.policy.require_premium => {
                Err(PolicyViolation::SubscriptionExpired.into())
            }
            _ => Ok(()),
        }
    }

    async fn discover_recipients(&mut self, client: &dyn ChatClient) -> Result<(), ForwarderError> {
        loop {
            match self.guard(client.list_conversations()).await? {
                Ok(conversations) => {
                    let total = conversations.len();
                    self.recipients = conversations
                        .into_iter()
                        .filter(|c| c.accepts_forwards())
                        .map(|c| c.recipient)
                        .collect();

                    if self.recipients.is_empty() {
                        warn!(account = self.account.id, "Account has no groups to forward to");
                    }
                    info!(
                        account = self.account.id,
                        "Using {} of {} group/channel dialogs as recipients",
                        self.recipients.len(),
                        total
                    );
                    return Ok(());
                }
                Err(e) if e.is_session_fatal() => {
                    return Err(ForwarderError::Authentication(e.to_string()));
                }
                Err(e) => {
                    warn!(
                        account = self.account.id,
                        "Failed to list dialogs, retrying in {:?}: {}",
                        self.context.policy.recovery_pause,
                        e
                    );
                    self.sleep(self.context.policy.recovery_pause).await?;
                }
            }
        }
    }

    /// One poll-and-forward pass followed by the inter-cycle sleep.
    async fn cycle(&mut self, client: &dyn ChatClient, recheck: bool) -> Result<(), ForwarderError> {
        if recheck {
            self.check_eligibility(client, false).await?;
        }

        match self.guard(client.last_self_message()).await? {
            Ok(Some(message)) if self.last_forwarded != Some(message.id) => {
                self.fan_out(client, &message).await?;
                self.last_forwarded = Some(message.id);
            }
            Ok(Some(message)) => {
                debug!(account = self.account.id, "Message {} already forwarded", message.id);
            }
            Ok(None) => {
                debug!(account = self.account.id, "Saved Messages is empty");
            }
            Err(e) if e.is_session_fatal() => {
                return Err(ForwarderError::Authentication(e.to_string()));
            }
            Err(e) => {
                warn!(account = self.account.id, "{}", ForwarderError::TransientFetch(e));
                return self.sleep(self.context.policy.recovery_pause).await;
            }
        }

        self.refresh_delay().await;
        debug!(account = self.account.id, "Next pass in {:?}", self.delay);
        self.sleep(self.delay).await
    }

    async fn fan_out(
        &self,
        client: &dyn ChatClient,
        message: &SelfMessage,
    ) -> Result<(), ForwarderError> {
        info!(
            account = self.account.id,
            "Forwarding message {} (\"{}\") to {} recipients",
            message.id,
            truncate_for_log(&message.text, 40),
            self.recipients.len()
        );

        let mut delivered = 0;
        let mut failed = 0;

        for recipient in &self.recipients {
            self.guard(self.pacer.wait_and_acquire()).await?;

            match self.guard(client.forward_message(recipient, message.id)).await? {
                Ok(()) => delivered += 1,
                Err(e) if e.is_session_fatal() => {
                    return Err(ForwarderError::Authentication(e.to_string()));
                }
                Err(e) => {
                    if let TelegramError::FloodWait(seconds) = &e {
                        self.pacer.handle_flood_wait(*seconds).await;
                    }
                    let err = ForwarderError::TransientDelivery {
                        recipient: recipient.to_string(),
                        source: e,
                    };
                    warn!(account = self.account.id, "{}", err);
                    failed += 1;
                }
            }
        }

        info!(
            account = self.account.id,
            "Message {} delivered to {}, failed for {}",
            message.id,
            delivered,
            failed
        );
        Ok(())
    }

    /// Picks up delay changes made while running.
    async fn refresh_delay(&mut self) {
        match self.context.store.user_settings(self.account.owner_id).await {
            Ok(Some(settings)) => self.delay = self.context.policy.clamp_delay(settings.delay_secs),
            Ok(None) => self.delay = self.context.policy.default_delay,
            Err(e) => warn!(
                account = self.account.id,
                "Could not read delay, keeping {:?}: {}",
                self.delay,
                e
            ),
        }
    }

    async fn terminate(&self, reason: &ForwarderError, client: Option<Arc<dyn ChatClient>>) {
        if !self.registration.release(self.context.store.as_ref()).await {
            debug!(account = self.account.id, "Registry slot already released");
        }

        if let Some(text) = reason.owner_message(&self.account) {
            warn!(account = self.account.id, "Forwarder terminated: {}", reason);
            self.context.notifier.notify(self.account.owner_id, &text).await;
        } else {
            info!(account = self.account.id, "Forwarder stopped");
        }

        if let Some(client) = client
            && Arc::strong_count(&client) == 1
        {
            client.disconnect();
        }
    }

    /// Races `fut` against cancellation.
    async fn guard<F: Future>(&self, fut: F) -> Result<F::Output, ForwarderError> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(ForwarderError::Cancelled),
            out = fut => Ok(out),
        }
    }

    async fn sleep(&self, duration: Duration) -> Result<(), ForwarderError> {
        self.guard(tokio::time::sleep(duration)).await
    }
}

impl std::fmt::Debug for AccountForwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountForwarder")
            .field("account", &self.account.id)
            .field("last_forwarded", &self.last_forwarded)
            .field("recipients", &self.recipients.len())
            .field("delay", &self.delay)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use chrono::Duration as ChronoDuration;

    use crate::forwarder::testing::{Failure, Harness, MARKER, eventually, until_stopped};
    use crate::store::AccountStore;

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_message_is_not_resent() {
        let h = Harness::new();
        let (account, state) = h.add_account(1, 3, &[10]).await;

        h.supervisor.start(account.id).await.unwrap();
        eventually(|| state.polls() >= 3).await;

        assert_eq!(state.forward_count(), 3);
        h.supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_message_is_forwarded_once_per_recipient() {
        let h = Harness::new();
        let (account, state) = h.add_account(1, 2, &[10, 10, 11]).await;

        h.supervisor.start(account.id).await.unwrap();
        eventually(|| state.polls() >= 4).await;

        let forwards = state.forwards();
        assert_eq!(forwards.len(), 4);
        assert_eq!(forwards.iter().filter(|(_, id)| *id == 10).count(), 2);
        assert_eq!(forwards.iter().filter(|(_, id)| *id == 11).count(), 2);
        h.supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_recipient_does_not_block_others() {
        let h = Harness::new();
        let (account, state) = h.add_account(1, 5, &[10]).await;
        state.fail_for("g3");

        h.supervisor.start(account.id).await.unwrap();
        eventually(|| state.polls() >= 2).await;

        let titles: Vec<_> = state.forwards().into_iter().map(|(title, _)| title).collect();
        assert_eq!(titles, ["g1", "g2", "g4", "g5"]);
        assert!(h.supervisor.is_running(account.id).await);
        h.supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_bio_removed_mid_run_stops_forwarder() {
        let h = Harness::new();
        let (account, state) = h.add_account(1, 2, &[10, 11]).await;

        h.supervisor.start(account.id).await.unwrap();
        eventually(|| state.forward_count() == 2).await;
        state.set_bio("just a bio");

        until_stopped(&h.supervisor, account.id).await;

        assert_eq!(state.forward_count(), 2);
        assert!(!h.flag(account.id).await);
        assert!(state.disconnected.load(Ordering::SeqCst));

        let messages = h.notifier.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, account.owner_id);
        assert!(messages[0].1.contains("By @HinariAdsBot"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthorized_session_notifies_owner() {
        let h = Harness::new();
        let (account, state) = h.add_account(1, 2, &[10]).await;
        state.unauthorized.store(true, Ordering::SeqCst);

        h.supervisor.start(account.id).await.unwrap();
        until_stopped(&h.supervisor, account.id).await;

        assert_eq!(state.polls(), 0);
        assert!(!h.flag(account.id).await);
        assert_eq!(h.notifier.messages().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_notifies_owner() {
        let h = Harness::new();
        let (account, state) = h.add_account(1, 2, &[10]).await;
        state.connect_fails.store(true, Ordering::SeqCst);

        h.supervisor.start(account.id).await.unwrap();
        until_stopped(&h.supervisor, account.id).await;

        assert!(!h.flag(account.id).await);
        let messages = h.notifier.messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].1.contains("Log in again"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_subscription_stops_forwarder() {
        let h = Harness::new();
        let (account, state) = h.add_account(1, 2, &[10]).await;

        let mut settings = h.store.user_settings(account.owner_id).await.unwrap().unwrap();
        settings.premium_expiry = Some(chrono::Utc::now() - ChronoDuration::days(1));
        h.store.upsert_user(settings).await.unwrap();

        h.supervisor.start(account.id).await.unwrap();
        until_stopped(&h.supervisor, account.id).await;

        assert_eq!(state.forward_count(), 0);
        let messages = h.notifier.messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].1.contains("premium"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_banned_owner_stops_after_next_cycle() {
        let h = Harness::new();
        let (account, state) = h.add_account(1, 1, &[10]).await;

        h.supervisor.start(account.id).await.unwrap();
        eventually(|| state.forward_count() == 1).await;

        let mut settings = h.store.user_settings(account.owner_id).await.unwrap().unwrap();
        settings.is_banned = true;
        h.store.upsert_user(settings).await.unwrap();

        until_stopped(&h.supervisor, account.id).await;
        assert!(h.notifier.messages()[0].1.contains("banned"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_change_is_picked_up() {
        let h = Harness::new();
        let (account, state) = h.add_account(1, 1, &[10]).await;
        h.store.set_delay(account.owner_id, 60).await.unwrap();

        let started = tokio::time::Instant::now();
        h.supervisor.start(account.id).await.unwrap();
        eventually(|| state.polls() >= 3).await;

        // Two 60s sleeps; the 300s default would take ten minutes.
        assert!(started.elapsed() < std::time::Duration::from_secs(300));
        h.supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_fetch_error_is_retried() {
        let h = Harness::new();
        let (account, state) = h.add_account(1, 2, &[10]).await;
        state.fail_polls(&[Failure::Transient, Failure::Transient]);

        h.supervisor.start(account.id).await.unwrap();
        eventually(|| state.forward_count() == 2).await;

        assert_eq!(state.polls(), 3);
        assert!(h.supervisor.is_running(account.id).await);
        assert!(h.flag(account.id).await);
        assert!(h.notifier.messages().is_empty());
        h.supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_revoked_session_during_fan_out_notifies_once() {
        let h = Harness::new();
        let (account, state) = h.add_account(1, 2, &[10, 11]).await;

        h.supervisor.start(account.id).await.unwrap();
        eventually(|| state.forward_count() == 2).await;
        state.fail_forwards(&[Failure::Revoked]);

        until_stopped(&h.supervisor, account.id).await;

        assert_eq!(state.forward_count(), 2);
        assert!(!h.flag(account.id).await);
        assert!(state.disconnected.load(Ordering::SeqCst));

        let messages = h.notifier.messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].1.contains("Log in again"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_revoked_session_during_poll_notifies_once() {
        let h = Harness::new();
        let (account, state) = h.add_account(1, 1, &[10]).await;

        h.supervisor.start(account.id).await.unwrap();
        eventually(|| state.forward_count() == 1).await;
        state.fail_polls(&[Failure::Revoked]);

        until_stopped(&h.supervisor, account.id).await;

        assert!(!h.flag(account.id).await);
        assert_eq!(h.notifier.messages().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_bio_error_skips_only_that_check() {
        let h = Harness::new();
        let (account, state) = h.add_account(1, 1, &[10, 11]).await;

        h.supervisor.start(account.id).await.unwrap();
        eventually(|| state.forward_count() == 1).await;

        // The marker is gone, but the recheck that would notice fails.
        state.set_bio("just a bio");
        state.fail_bio(&[Failure::Transient]);

        eventually(|| state.forward_count() == 2).await;
        assert_eq!(state.pending_bio_failures(), 0);

        until_stopped(&h.supervisor, account.id).await;
        assert_eq!(state.forward_count(), 2);

        let messages = h.notifier.messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].1.contains(MARKER));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bio_error_on_first_check_is_fatal() {
        let h = Harness::new();
        let (account, state) = h.add_account(1, 1, &[10]).await;
        state.fail_bio(&[Failure::Transient]);

        h.supervisor.start(account.id).await.unwrap();
        until_stopped(&h.supervisor, account.id).await;

        assert_eq!(state.polls(), 0);
        assert_eq!(h.notifier.messages().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_retries_after_transient_error() {
        let h = Harness::new();
        let (account, state) = h.add_account(1, 2, &[10]).await;
        state.fail_listing(&[Failure::Transient, Failure::Transient]);

        h.supervisor.start(account.id).await.unwrap();
        eventually(|| state.forward_count() == 2).await;

        assert_eq!(state.listings(), 3);
        assert!(h.notifier.messages().is_empty());
        h.supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_revoked_session_during_discovery_is_fatal() {
        let h = Harness::new();
        let (account, state) = h.add_account(1, 2, &[10]).await;
        state.fail_listing(&[Failure::Revoked]);

        h.supervisor.start(account.id).await.unwrap();
        until_stopped(&h.supervisor, account.id).await;

        assert_eq!(state.listings(), 1);
        assert_eq!(state.polls(), 0);
        assert_eq!(h.notifier.messages().len(), 1);
    }
}
