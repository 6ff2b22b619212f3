//! Configuration module for the forwarder service.
//!
//! Handles loading and validation of service settings from the
//! environment, and derives the runtime policy used by every forwarder.

mod settings;

pub use settings::{ConfigError, ForwarderPolicy, ServiceSettings};

/// Bio text every connected account must carry while forwarding.
pub const DEFAULT_BIO_MARKER: &str = "By @HinariAdsBot";

/// Delay between forward passes for users who never changed it (5 minutes).
pub const DEFAULT_DELAY_SECS: u64 = 300;

/// Longest trial the service accepts (about a century).
pub const MAX_TRIAL_DAYS: i64 = 36_500;
