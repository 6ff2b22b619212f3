//! Telegram client layer.
//!
//! [`ChatClient`] is everything a forwarder needs from a connected account;
//! [`TelegramSession`] implements it on top of grammers, and
//! [`SessionConnector`] opens one session per stored account.

mod client;
mod rate_limiter;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

pub use client::{
    GrammersConnector, PwdToken as PasswordToken, TelegramError, TelegramSession,
    Token as LoginToken, mask_phone, truncate_for_log,
};
pub use rate_limiter::RateLimiter;

use crate::store::Account;

/// Addressable destination of a forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecipientPeer {
    /// Basic (legacy) group.
    Chat { chat_id: i64 },
    /// Supergroup, or any other channel-backed chat.
    Channel { channel_id: i64, access_hash: i64 },
}

/// A chat the forwarder sends to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub peer: RecipientPeer,
    pub title: String,
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.peer {
            RecipientPeer::Chat { chat_id } => write!(f, "\"{}\" (chat {chat_id})", self.title),
            RecipientPeer::Channel { channel_id, .. } => {
                write!(f, "\"{}\" (channel {channel_id})", self.title)
            }
        }
    }
}

/// Kind of a joined conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationKind {
    /// Basic group.
    Group,
    /// Channel that members can post in.
    Supergroup,
    /// One-to-many announcement channel.
    Broadcast,
}

/// One entry of the account's dialog list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub recipient: Recipient,
    pub kind: ConversationKind,
    /// The account left or was removed.
    pub left: bool,
}

impl Conversation {
    /// Groups and non-broadcast channels the account is still part of.
    #[must_use]
    pub fn accepts_forwards(&self) -> bool {
        !self.left && matches!(self.kind, ConversationKind::Group | ConversationKind::Supergroup)
    }
}

/// Latest entry of the account's Saved Messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelfMessage {
    pub id: i32,
    pub text: String,
}

/// Operations a forwarder performs on its account.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Whether the session is signed in.
    async fn is_authorized(&self) -> Result<bool, TelegramError>;

    /// The account's own bio text (empty when unset).
    async fn own_bio(&self) -> Result<String, TelegramError>;

    /// Every group and channel the account has a dialog with.
    async fn list_conversations(&self) -> Result<Vec<Conversation>, TelegramError>;

    /// Most recent Saved Messages entry, if any.
    async fn last_self_message(&self) -> Result<Option<SelfMessage>, TelegramError>;

    /// Forwards one Saved Messages entry to `recipient`.
    async fn forward_message(&self, recipient: &Recipient, message_id: i32) -> Result<(), TelegramError>;

    /// Closes the connection.
    fn disconnect(&self);
}

/// Opens an authenticated-or-not session for a stored account.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(&self, account: &Account) -> Result<Arc<dyn ChatClient>, TelegramError>;
}
