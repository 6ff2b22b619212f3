//! Forwarder error taxonomy.

use thiserror::Error;

use crate::store::{Account, AccountId, StoreError};
use crate::telegram::TelegramError;

/// Eligibility rules an account or its owner failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyViolation {
    #[error("bio does not contain \"{marker}\"")]
    MissingBioMarker { marker: String },

    #[error("owner is banned")]
    Banned,

    #[error("no active premium or trial")]
    SubscriptionExpired,
}

/// Why a forwarder stopped, or a failure it recovered from.
#[derive(Debug, Error)]
pub enum ForwarderError {
    /// The session could not be opened or is not signed in. Fatal.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The account or owner is not eligible. Fatal until the user acts.
    #[error("Policy violation: {0}")]
    Policy(#[from] PolicyViolation),

    /// One recipient rejected a forward. Logged and skipped.
    #[error("Failed to forward to {recipient}: {source}")]
    TransientDelivery {
        recipient: String,
        #[source]
        source: TelegramError,
    },

    /// Saved Messages could not be read this cycle. Logged and skipped.
    #[error("Failed to fetch the latest saved message: {0}")]
    TransientFetch(#[source] TelegramError),

    /// Cooperative stop.
    #[error("Forwarder cancelled")]
    Cancelled,
}

impl ForwarderError {
    /// Whether this error ends the forwarder.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Authentication(_) | Self::Policy(_))
    }

    /// Text sent to the owner when this error ends the forwarder.
    #[must_use]
    pub fn owner_message(&self, account: &Account) -> Option<String> {
        let phone = account.masked_phone();

        match self {
            Self::Authentication(reason) => Some(format!(
                "⚠️ Forwarding stopped for account {phone} (ID {}): the Telegram session \
                 could not be used ({reason}). Log in again to resume.",
                account.id
            )),
            Self::Policy(PolicyViolation::MissingBioMarker { marker }) => Some(format!(
                "⚠️ Forwarding stopped for account {phone} (ID {}): your bio must contain \
                 \"{marker}\". Add it and start forwarding again.",
                account.id
            )),
            Self::Policy(PolicyViolation::Banned) => Some(format!(
                "❌ Forwarding stopped for account {phone} (ID {}): you are banned.",
                account.id
            )),
            Self::Policy(PolicyViolation::SubscriptionExpired) => Some(format!(
                "💎 Forwarding stopped for account {phone} (ID {}): your premium has expired. \
                 Renew it to continue.",
                account.id
            )),
            Self::TransientDelivery { .. } | Self::TransientFetch(_) | Self::Cancelled => None,
        }
    }
}

/// Errors returned by supervisor operations.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Unknown account: {0}")]
    UnknownAccount(AccountId),

    #[error("Supervisor is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use chrono::Utc;

    use super::*;

    fn account() -> Account {
        Account {
            id: 4,
            owner_id: 9,
            phone: "+919812345678".to_owned(),
            api_id: 1,
            api_hash: "hash".to_owned(),
            session_path: PathBuf::from("sessions/user_9_acc_4.session"),
            forwarding_enabled: true,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_bio_message_names_marker() {
        let err = ForwarderError::from(PolicyViolation::MissingBioMarker {
            marker: "By @HinariAdsBot".to_owned(),
        });
        let text = err.owner_message(&account()).unwrap();
        assert!(text.contains("\"By @HinariAdsBot\""));
        assert!(text.contains("***5678"));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_transient_errors_are_silent() {
        let err = ForwarderError::TransientFetch(TelegramError::Connection("reset".to_owned()));
        assert!(!err.is_fatal());
        assert!(err.owner_message(&account()).is_none());
        assert!(ForwarderError::Cancelled.owner_message(&account()).is_none());
    }
}
