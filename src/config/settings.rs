//! Service settings and forwarder policy.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{DEFAULT_BIO_MARKER, DEFAULT_DELAY_SECS, MAX_TRIAL_DAYS};

/// Service-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSettings {
    /// Path to the JSON store holding accounts and user settings.
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,

    /// Directory where per-account session files are created.
    #[serde(default = "default_sessions_dir")]
    pub sessions_dir: PathBuf,

    /// Substring that must be present in every forwarding account's bio.
    #[serde(default = "default_bio_marker")]
    pub bio_marker: String,

    /// Delay assigned to newly created users, in seconds.
    #[serde(default = "default_delay")]
    pub default_delay_secs: u64,

    /// Lower bound applied to any user delay, in seconds.
    #[serde(default = "default_min_delay")]
    pub min_delay_secs: u64,

    /// Pause between two sends of the same fan-out, in milliseconds.
    #[serde(default = "default_pacing_millis")]
    pub pacing_millis: u64,

    /// Pause after a transient polling error, in seconds.
    #[serde(default = "default_recovery_pause")]
    pub recovery_pause_secs: u64,

    /// Length of the trial granted to new users, in days.
    #[serde(default = "default_trial_days")]
    pub trial_days: i64,

    /// Whether forwarding requires an active premium or trial period.
    #[serde(default = "default_require_premium")]
    pub require_premium: bool,

    /// Number of accounts a user without premium may connect.
    #[serde(default = "default_free_account_limit")]
    pub free_account_limit: usize,

    /// Log level for the application.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_store_path() -> PathBuf {
    PathBuf::from("hinari.json")
}

fn default_sessions_dir() -> PathBuf {
    PathBuf::from("sessions")
}

fn default_bio_marker() -> String {
    DEFAULT_BIO_MARKER.to_owned()
}

fn default_delay() -> u64 {
    DEFAULT_DELAY_SECS
}

fn default_min_delay() -> u64 {
    60
}

fn default_pacing_millis() -> u64 {
    2_000
}

fn default_recovery_pause() -> u64 {
    30
}

fn default_trial_days() -> i64 {
    7
}

fn default_require_premium() -> bool {
    true
}

fn default_free_account_limit() -> usize {
    1
}

fn default_log_level() -> String {
    "info".to_owned()
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            store_path: default_store_path(),
            sessions_dir: default_sessions_dir(),
            bio_marker: default_bio_marker(),
            default_delay_secs: default_delay(),
            min_delay_secs: default_min_delay(),
            pacing_millis: default_pacing_millis(),
            recovery_pause_secs: default_recovery_pause(),
            trial_days: default_trial_days(),
            require_premium: default_require_premium(),
            free_account_limit: default_free_account_limit(),
            log_level: default_log_level(),
        }
    }
}

impl ServiceSettings {
    /// Creates settings from environment variables.
    ///
    /// Missing variables fall back to defaults; malformed ones are errors.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable cannot be parsed or the resulting
    /// settings are inconsistent.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Creates settings from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let settings = Self {
            store_path: lookup("HINARI_STORE_PATH").map_or(defaults.store_path, PathBuf::from),
            sessions_dir: lookup("HINARI_SESSIONS_DIR").map_or(defaults.sessions_dir, PathBuf::from),
            bio_marker: lookup("HINARI_BIO_MARKER").unwrap_or(defaults.bio_marker),
            default_delay_secs: parse_var(&lookup, "HINARI_DEFAULT_DELAY", defaults.default_delay_secs)?,
            min_delay_secs: parse_var(&lookup, "HINARI_MIN_DELAY", defaults.min_delay_secs)?,
            pacing_millis: parse_var(&lookup, "HINARI_PACING_MS", defaults.pacing_millis)?,
            recovery_pause_secs: parse_var(&lookup, "HINARI_RECOVERY_PAUSE", defaults.recovery_pause_secs)?,
            trial_days: parse_var(&lookup, "HINARI_TRIAL_DAYS", defaults.trial_days)?,
            require_premium: parse_flag(&lookup, "HINARI_REQUIRE_PREMIUM", defaults.require_premium)?,
            free_account_limit: parse_var(&lookup, "HINARI_FREE_ACCOUNT_LIMIT", defaults.free_account_limit)?,
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
        };

        settings.validate()?;
        Ok(settings)
    }

    /// Checks that the settings are internally consistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bio_marker.trim().is_empty() {
            return Err(ConfigError::EmptyBioMarker);
        }

        if self.default_delay_secs < self.min_delay_secs {
            return Err(ConfigError::DelayBelowMinimum {
                delay: self.default_delay_secs,
                minimum: self.min_delay_secs,
            });
        }

        if !(0..=MAX_TRIAL_DAYS).contains(&self.trial_days) {
            return Err(ConfigError::InvalidValue {
                var: "HINARI_TRIAL_DAYS",
                value: self.trial_days.to_string(),
            });
        }

        Ok(())
    }

    /// Derives the runtime policy shared by all forwarders.
    #[must_use]
    pub fn forwarder_policy(&self) -> ForwarderPolicy {
        ForwarderPolicy {
            bio_marker: self.bio_marker.clone(),
            pacing: Duration::from_millis(self.pacing_millis),
            recovery_pause: Duration::from_secs(self.recovery_pause_secs),
            default_delay: Duration::from_secs(self.default_delay_secs),
            min_delay: Duration::from_secs(self.min_delay_secs),
            require_premium: self.require_premium,
        }
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(var) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { var, value: raw }),
        None => Ok(default),
    }
}

fn parse_flag(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: bool,
) -> Result<bool, ConfigError> {
    match lookup(var) {
        Some(raw) => match raw.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue { var, value: raw }),
        },
        None => Ok(default),
    }
}

/// Timing and eligibility rules applied by every forwarder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwarderPolicy {
    /// Substring required in the account's bio.
    pub bio_marker: String,

    /// Minimum spacing between two sends of one fan-out.
    pub pacing: Duration,

    /// Pause after a transient polling error.
    pub recovery_pause: Duration,

    /// Delay used when the owner has no settings yet.
    pub default_delay: Duration,

    /// Lower bound for any per-user delay.
    pub min_delay: Duration,

    /// Whether an active premium/trial period is required.
    pub require_premium: bool,
}

impl ForwarderPolicy {
    /// Clamps a user-configured delay to the policy minimum.
    #[must_use]
    pub fn clamp_delay(&self, secs: u64) -> Duration {
        Duration::from_secs(secs).max(self.min_delay)
    }
}

impl Default for ForwarderPolicy {
    fn default() -> Self {
        ServiceSettings::default().forwarder_policy()
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {value:?}")]
    InvalidValue { var: &'static str, value: String },

    #[error("Bio marker must not be empty")]
    EmptyBioMarker,

    #[error("Default delay {delay}s is below the minimum of {minimum}s")]
    DelayBelowMinimum { delay: u64, minimum: u64 },
}
