//! Owner notifications.

use async_trait::async_trait;
use tracing::warn;

use crate::store::UserId;

/// Sink for messages addressed to account owners.
///
/// Delivery is fire-and-forget: implementations swallow their own failures.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, owner_id: UserId, text: &str);
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, owner_id: UserId, text: &str) {
        warn!(owner = owner_id, "Notification: {}", text);
    }
}
