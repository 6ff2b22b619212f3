//! Consistency checks over a loaded store document.

use std::collections::HashSet;
use std::fmt;

use super::{AccountId, StoreData};

/// How serious a finding is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
}

/// One problem found in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreIssue {
    pub severity: Severity,
    /// Account the issue is about, if any.
    pub account_id: Option<AccountId>,
    pub message: String,
}

impl fmt::Display for StoreIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self.severity {
            Severity::Warning => "⚠",
            Severity::Error => "✗",
        };
        match self.account_id {
            Some(id) => write!(f, "{symbol} [account {id}] {}", self.message),
            None => write!(f, "{symbol} {}", self.message),
        }
    }
}

impl StoreData {
    /// Checks accounts and user settings for inconsistencies.
    ///
    /// Session files are looked up on disk.
    #[must_use]
    pub fn audit(&self, min_delay_secs: u64) -> Vec<StoreIssue> {
        let mut issues = Vec::new();
        let mut seen = HashSet::new();

        for (&id, account) in &self.accounts {
            let mut report = |severity, message: String| {
                issues.push(StoreIssue {
                    severity,
                    account_id: Some(id),
                    message,
                });
            };

            if account.id != id {
                report(Severity::Error, format!("record is keyed as {id} but has id {}", account.id));
            }
            if id >= self.next_account_id {
                report(
                    Severity::Error,
                    format!("id is not below next_account_id {}", self.next_account_id),
                );
            }
            if !self.users.contains_key(&account.owner_id) {
                report(Severity::Error, format!("owner {} has no user record", account.owner_id));
            }
            if !account.session_path.exists() {
                report(
                    Severity::Error,
                    format!("session file {} is missing", account.session_path.display()),
                );
            }
            if account.api_id <= 0 || account.api_hash.is_empty() {
                report(Severity::Error, "API credentials are incomplete".to_owned());
            }
            if !seen.insert((account.owner_id, account.phone.clone())) {
                report(
                    Severity::Warning,
                    format!("duplicate login of {} for owner {}", account.masked_phone(), account.owner_id),
                );
            }
        }

        for (&user_id, settings) in &self.users {
            if settings.delay_secs < min_delay_secs {
                issues.push(StoreIssue {
                    severity: Severity::Error,
                    account_id: None,
                    message: format!(
                        "user {user_id} has delay {}s, below the minimum of {min_delay_secs}s",
                        settings.delay_secs
                    ),
                });
            }
        }

        issues
    }
}
