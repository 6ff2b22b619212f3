//! Record types persisted by the store.

use std::path::PathBuf;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::config::MAX_TRIAL_DAYS;
use crate::telegram::mask_phone;

/// Identifier of a connected account, allocated by the store.
pub type AccountId = i64;

/// Telegram id of the bot user owning accounts.
pub type UserId = i64;

/// A connected Telegram account used as forwarding source and sender.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Account {
    /// Unique account id.
    pub id: AccountId,

    /// Bot user that connected this account.
    pub owner_id: UserId,

    /// Phone number used at login.
    pub phone: String,

    /// Telegram API id supplied by the owner.
    pub api_id: i32,

    /// Telegram API hash supplied by the owner.
    pub api_hash: String,

    /// Path to the grammers SQLite session file.
    pub session_path: PathBuf,

    /// Whether forwarding should run (and be resumed after a restart).
    #[serde(default)]
    pub forwarding_enabled: bool,

    /// When the account was connected.
    pub created_at: DateTime<Utc>,
}

impl Account {
    /// Phone number safe for logs and listings.
    #[must_use]
    pub fn masked_phone(&self) -> String {
        mask_phone(&self.phone)
    }
}

/// Input for creating an account after a successful login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAccount {
    pub owner_id: UserId,
    pub phone: String,
    pub api_id: i32,
    pub api_hash: String,
}

/// Per-user settings read by the forwarders.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserSettings {
    /// Bot user id.
    pub user_id: UserId,

    /// Seconds between forward passes.
    pub delay_secs: u64,

    /// End of the premium (or trial) period.
    #[serde(default)]
    pub premium_expiry: Option<DateTime<Utc>>,

    /// Banned users may not forward.
    #[serde(default)]
    pub is_banned: bool,

    /// When the user first appeared.
    pub joined_at: DateTime<Utc>,
}

impl UserSettings {
    /// Creates settings for a new user with a trial of `trial_days`.
    ///
    /// The trial length is clamped to `0..=MAX_TRIAL_DAYS`. A trial that would
    /// end past the representable range is not granted.
    #[must_use]
    pub fn with_trial(user_id: UserId, delay_secs: u64, trial_days: i64, now: DateTime<Utc>) -> Self {
        let premium_expiry = TimeDelta::try_days(trial_days.clamp(0, MAX_TRIAL_DAYS))
            .and_then(|trial| now.checked_add_signed(trial));

        Self {
            user_id,
            delay_secs,
            premium_expiry,
            is_banned: false,
            joined_at: now,
        }
    }

    /// Whether the premium or trial period is still running at `now`.
    #[must_use]
    pub fn is_premium_at(&self, now: DateTime<Utc>) -> bool {
        self.premium_expiry.is_some_and(|expiry| expiry > now)
    }

    /// Whole days of premium left at `now` (zero once expired).
    #[must_use]
    pub fn premium_days_left(&self, now: DateTime<Utc>) -> i64 {
        self.premium_expiry
            .map_or(0, |expiry| (expiry - now).num_days().max(0))
    }
}
