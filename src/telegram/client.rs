//! grammers-backed session for one connected account.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use grammers_client::client::{LoginToken, PasswordToken};
use grammers_client::{Client, InvocationError, SenderPool, SignInError, sender};
use grammers_session::storages::SqliteSession;
use grammers_tl_types as tl;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{
    ChatClient, Conversation, ConversationKind, Recipient, RecipientPeer, SelfMessage,
    SessionConnector,
};
use crate::store::Account;

/// Re-export types for external use.
pub use grammers_client::client::{LoginToken as Token, PasswordToken as PwdToken};

/// Dialogs requested per page while discovering recipients.
const DIALOG_PAGE_SIZE: i32 = 100;

/// Upper bound on dialog pages, in case offsets stop advancing.
const MAX_DIALOG_PAGES: usize = 200;

/// RPC errors meaning the stored session can no longer be used.
const SESSION_REVOKED_ERRORS: [&str; 6] = [
    "AUTH_KEY_UNREGISTERED",
    "AUTH_KEY_INVALID",
    "SESSION_REVOKED",
    "SESSION_EXPIRED",
    "USER_DEACTIVATED",
    "USER_DEACTIVATED_BAN",
];

/// Errors that can occur during Telegram operations.
#[derive(Debug, Error)]
pub enum TelegramError {
    #[error("Not authorized. Please sign in first.")]
    NotAuthorized,

    #[error("Session is no longer valid: {0}")]
    SessionRevoked(String),

    #[error("Invalid API credentials: {0}")]
    InvalidCredentials(String),

    #[error("Invalid or expired login code")]
    InvalidCode,

    #[error("Sign in failed: {0}")]
    SignInFailed(String),

    #[error("Password required for 2FA")]
    PasswordRequired(PasswordToken),

    #[error("Invalid password")]
    InvalidPassword(PasswordToken),

    #[error("Failed to forward to {recipient}: {reason}")]
    ForwardFailed { recipient: String, reason: String },

    #[error("Flood wait required: {0} seconds")]
    FloodWait(u32),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("API invocation error: {0}")]
    Invocation(String),
}

impl TelegramError {
    /// Whether the session must be re-created by the user before retrying.
    #[must_use]
    pub const fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            Self::NotAuthorized | Self::SessionRevoked(_) | Self::InvalidCredentials(_)
        )
    }
}

impl From<InvocationError> for TelegramError {
    fn from(err: InvocationError) -> Self {
        if let InvocationError::Rpc(rpc) = &err {
            let name = rpc.name.as_str();
            if matches!(name, "FLOOD_WAIT" | "FLOOD_PREMIUM_WAIT" | "SLOWMODE_WAIT") {
                return Self::FloodWait(rpc.value.unwrap_or(0));
            }
            if SESSION_REVOKED_ERRORS.contains(&name) {
                return Self::SessionRevoked(name.to_owned());
            }
            if matches!(name, "API_ID_INVALID" | "API_ID_PUBLISHED_FLOOD") {
                return Self::InvalidCredentials(name.to_owned());
            }
            return Self::Invocation(err.to_string());
        }

        let err_str = err.to_string();

        // Check for flood wait errors
        if (err_str.contains("FLOOD_WAIT") || err_str.contains("flood"))
            && let Some(seconds) = extract_flood_wait_seconds(&err_str)
        {
            return Self::FloodWait(seconds);
        }

        Self::Connection(err_str)
    }
}

/// Extracts flood wait seconds from an error message.
fn extract_flood_wait_seconds(err_msg: &str) -> Option<u32> {
    let patterns = ["flood_wait_", "flood wait "];
    let lowered = err_msg.to_lowercase();

    for pattern in patterns {
        if let Some(idx) = lowered.find(pattern) {
            let start = idx + pattern.len();
            let num_str: String = lowered[start..]
                .chars()
                .take_while(char::is_ascii_digit)
                .collect();
            if let Ok(seconds) = num_str.parse() {
                return Some(seconds);
            }
        }
    }
    None
}

/// High-level Telegram session of one connected account.
pub struct TelegramSession {
    /// The underlying grammers client.
    client: Client,

    /// Handle to the sender pool for disconnection.
    handle: sender::SenderPoolHandle,

    /// Background task running the sender pool.
    _pool_task: JoinHandle<()>,
}

impl TelegramSession {
    /// Opens the session file and connects to Telegram.
    ///
    /// # Errors
    ///
    /// Returns an error if the session file cannot be opened or the
    /// connection fails.
    pub async fn connect(api_id: i32, session_path: &Path) -> Result<Self, TelegramError> {
        debug!("Opening session {}", session_path.display());

        let session = Arc::new(
            SqliteSession::open(session_path)
                .await
                .map_err(|e| TelegramError::Session(e.to_string()))?,
        );

        let SenderPool {
            runner,
            updates: _updates,
            handle,
        } = SenderPool::new(Arc::clone(&session), api_id);

        let client = Client::new(handle.clone());

        // Spawn the sender pool runner
        let pool_task = tokio::spawn(async move {
            runner.run().await;
        });

        Ok(Self {
            client,
            handle: handle.thin,
            _pool_task: pool_task,
        })
    }

    /// Requests a login code to be sent to the phone number.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    pub async fn request_login_code(
        &self,
        phone: &str,
        api_hash: &str,
    ) -> Result<LoginToken, TelegramError> {
        info!("Requesting login code for phone: {}...", mask_phone(phone));

        self.client
            .request_login_code(phone, api_hash)
            .await
            .map_err(|e| {
                let message = e.to_string();
                if message.contains("API_ID_INVALID") || message.contains("API_ID_PUBLISHED_FLOOD") {
                    TelegramError::InvalidCredentials(message)
                } else {
                    TelegramError::SignInFailed(message)
                }
            })
    }

    /// Signs in with the login code.
    ///
    /// # Errors
    ///
    /// Returns an error if sign in fails.
    pub async fn sign_in(&self, token: &LoginToken, code: &str) -> Result<(), TelegramError> {
        info!("Signing in with login code...");

        match self.client.sign_in(token, code).await {
            Ok(_user) => {
                info!("Successfully signed in!");
                Ok(())
            }
            Err(SignInError::PasswordRequired(password_token)) => {
                debug!("2FA password required, hint: {:?}", password_token.hint());
                Err(TelegramError::PasswordRequired(password_token))
            }
            Err(SignInError::InvalidCode) => Err(TelegramError::InvalidCode),
            Err(e) => Err(TelegramError::SignInFailed(e.to_string())),
        }
    }

    /// Checks the 2FA password.
    ///
    /// # Errors
    ///
    /// Returns an error if the password is invalid.
    pub async fn check_password(
        &self,
        password_token: PasswordToken,
        password: &str,
    ) -> Result<(), TelegramError> {
        info!("Checking 2FA password...");

        match self.client.check_password(password_token, password).await {
            Ok(_user) => {
                info!("Successfully authenticated with 2FA!");
                Ok(())
            }
            Err(SignInError::InvalidPassword(token)) => Err(TelegramError::InvalidPassword(token)),
            Err(e) => Err(TelegramError::SignInFailed(e.to_string())),
        }
    }

    /// Fetches one page of dialogs.
    async fn dialog_page(
        &self,
        offset_date: i32,
        offset_id: i32,
        offset_peer: tl::enums::InputPeer,
    ) -> Result<(tl::types::messages::Dialogs, bool), TelegramError> {
        let request = tl::functions::messages::GetDialogs {
            exclude_pinned: false,
            folder_id: None,
            offset_date,
            offset_id,
            offset_peer,
            limit: DIALOG_PAGE_SIZE,
            hash: 0,
        };

        let page = match self.client.invoke(&request).await? {
            tl::enums::messages::Dialogs::Dialogs(d) => (d, true),
            tl::enums::messages::Dialogs::Slice(d) => (
                tl::types::messages::Dialogs {
                    dialogs: d.dialogs,
                    messages: d.messages,
                    chats: d.chats,
                    users: d.users,
                },
                false,
            ),
            tl::enums::messages::Dialogs::NotModified(_) => (
                tl::types::messages::Dialogs {
                    dialogs: vec![],
                    messages: vec![],
                    chats: vec![],
                    users: vec![],
                },
                true,
            ),
        };

        Ok(page)
    }
}

#[async_trait]
impl ChatClient for TelegramSession {
    async fn is_authorized(&self) -> Result<bool, TelegramError> {
        self.client
            .is_authorized()
            .await
            .map_err(|e| TelegramError::Connection(e.to_string()))
    }

    async fn own_bio(&self) -> Result<String, TelegramError> {
        let request = tl::functions::users::GetFullUser {
            id: tl::enums::InputUser::UserSelf,
        };

        let tl::enums::users::UserFull::Full(full) = self.client.invoke(&request).await?;
        let tl::enums::UserFull::Full(user) = full.full_user;

        Ok(user.about.unwrap_or_default())
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>, TelegramError> {
        let mut conversations: HashMap<RecipientPeer, Conversation> = HashMap::new();
        let mut offset_date = 0;
        let mut offset_id = 0;
        let mut offset_peer = tl::enums::InputPeer::Empty;

        for _ in 0..MAX_DIALOG_PAGES {
            let (page, complete) = self.dialog_page(offset_date, offset_id, offset_peer).await?;

            for chat in &page.chats {
                if let Some(conversation) = conversation_from_chat(chat) {
                    conversations.insert(conversation.recipient.peer, conversation);
                }
            }

            let short_page = page.dialogs.len() < usize::try_from(DIALOG_PAGE_SIZE).unwrap_or(usize::MAX);
            if complete || short_page {
                break;
            }

            let Some(cursor) = next_dialog_cursor(&page) else {
                break;
            };
            (offset_date, offset_id, offset_peer) = cursor;
        }

        debug!("Discovered {} group/channel dialogs", conversations.len());
        Ok(conversations.into_values().collect())
    }

    async fn last_self_message(&self) -> Result<Option<SelfMessage>, TelegramError> {
        let request = tl::functions::messages::GetHistory {
            peer: tl::enums::InputPeer::PeerSelf,
            offset_id: 0,
            offset_date: 0,
            add_offset: 0,
            limit: 1,
            max_id: 0,
            min_id: 0,
            hash: 0,
        };

        let messages = match self.client.invoke(&request).await? {
            tl::enums::messages::Messages::Messages(m) => m.messages,
            tl::enums::messages::Messages::Slice(m) => m.messages,
            tl::enums::messages::Messages::ChannelMessages(m) => m.messages,
            tl::enums::messages::Messages::NotModified(_) => vec![],
        };

        Ok(messages.into_iter().find_map(|message| match message {
            tl::enums::Message::Message(m) => Some(SelfMessage {
                id: m.id,
                text: m.message,
            }),
            tl::enums::Message::Service(_) | tl::enums::Message::Empty(_) => None,
        }))
    }

    async fn forward_message(&self, recipient: &Recipient, message_id: i32) -> Result<(), TelegramError> {
        let request = tl::functions::messages::ForwardMessages {
            silent: false,
            background: false,
            with_my_score: false,
            drop_author: false,
            drop_media_captions: false,
            noforwards: false,
            allow_paid_floodskip: false,
            from_peer: tl::enums::InputPeer::PeerSelf,
            id: vec![message_id],
            random_id: vec![rand::random::<i64>()],
            to_peer: input_peer(recipient.peer),
            top_msg_id: None,
            reply_to: None,
            schedule_date: None,
            schedule_repeat_period: None,
            send_as: None,
            quick_reply_shortcut: None,
            effect: None,
            video_timestamp: None,
            allow_paid_stars: None,
            suggested_post: None,
        };

        match self.client.invoke(&request).await {
            Ok(_updates) => Ok(()),
            Err(e) => match TelegramError::from(e) {
                TelegramError::Invocation(reason) | TelegramError::Connection(reason) => {
                    Err(TelegramError::ForwardFailed {
                        recipient: recipient.to_string(),
                        reason,
                    })
                }
                other => Err(other),
            },
        }
    }

    fn disconnect(&self) {
        info!("Disconnecting from Telegram...");
        self.handle.quit();
    }
}

impl std::fmt::Debug for TelegramSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramSession").finish_non_exhaustive()
    }
}

/// Opens grammers sessions from the account's stored session file.
#[derive(Debug, Default, Clone, Copy)]
pub struct GrammersConnector;

#[async_trait]
impl SessionConnector for GrammersConnector {
    async fn connect(&self, account: &Account) -> Result<Arc<dyn ChatClient>, TelegramError> {
        if !account.session_path.exists() {
            return Err(TelegramError::Session(format!(
                "session file {} is missing",
                account.session_path.display()
            )));
        }

        let session = TelegramSession::connect(account.api_id, &account.session_path).await?;
        Ok(Arc::new(session))
    }
}

/// Maps a dialog-list chat to a conversation, skipping unusable ones.
fn conversation_from_chat(chat: &tl::enums::Chat) -> Option<Conversation> {
    match chat {
        tl::enums::Chat::Chat(c) if !c.deactivated => Some(Conversation {
            recipient: Recipient {
                peer: RecipientPeer::Chat { chat_id: c.id },
                title: c.title.clone(),
            },
            kind: ConversationKind::Group,
            left: c.left,
        }),
        tl::enums::Chat::Channel(c) => Some(Conversation {
            recipient: Recipient {
                peer: RecipientPeer::Channel {
                    channel_id: c.id,
                    access_hash: c.access_hash.unwrap_or(0),
                },
                title: c.title.clone(),
            },
            kind: if c.broadcast {
                ConversationKind::Broadcast
            } else {
                ConversationKind::Supergroup
            },
            left: c.left,
        }),
        _ => None,
    }
}

/// Computes the `(offset_date, offset_id, offset_peer)` of the next page.
fn next_dialog_cursor(
    page: &tl::types::messages::Dialogs,
) -> Option<(i32, i32, tl::enums::InputPeer)> {
    let (top_message, peer) = page.dialogs.iter().rev().find_map(|dialog| match dialog {
        tl::enums::Dialog::Dialog(d) => Some((d.top_message, d.peer.clone())),
        tl::enums::Dialog::Folder(_) => None,
    })?;

    let offset_date = page
        .messages
        .iter()
        .find_map(|message| match message {
            tl::enums::Message::Message(m) if m.id == top_message => Some(m.date),
            tl::enums::Message::Service(m) if m.id == top_message => Some(m.date),
            _ => None,
        })
        .unwrap_or(0);

    let offset_peer = match peer {
        tl::enums::Peer::Chat(p) => tl::enums::InputPeer::Chat(tl::types::InputPeerChat {
            chat_id: p.chat_id,
        }),
        tl::enums::Peer::Channel(p) => {
            let access_hash = page
                .chats
                .iter()
                .find_map(|chat| match chat {
                    tl::enums::Chat::Channel(c) if c.id == p.channel_id => c.access_hash,
                    _ => None,
                })
                .unwrap_or(0);
            tl::enums::InputPeer::Channel(tl::types::InputPeerChannel {
                channel_id: p.channel_id,
                access_hash,
            })
        }
        tl::enums::Peer::User(p) => {
            let access_hash = page
                .users
                .iter()
                .find_map(|user| match user {
                    tl::enums::User::User(u) if u.id == p.user_id => u.access_hash,
                    _ => None,
                })
                .unwrap_or(0);
            tl::enums::InputPeer::User(tl::types::InputPeerUser {
                user_id: p.user_id,
                access_hash,
            })
        }
    };

    Some((offset_date, top_message, offset_peer))
}

fn input_peer(peer: RecipientPeer) -> tl::enums::InputPeer {
    match peer {
        RecipientPeer::Chat { chat_id } => {
            tl::enums::InputPeer::Chat(tl::types::InputPeerChat { chat_id })
        }
        RecipientPeer::Channel {
            channel_id,
            access_hash,
        } => tl::enums::InputPeer::Channel(tl::types::InputPeerChannel {
            channel_id,
            access_hash,
        }),
    }
}

/// Masks a phone number for logging (shows last 4 digits).
pub fn mask_phone(phone: &str) -> String {
    let digits: String = phone.chars().filter(char::is_ascii_digit).collect();
    if digits.len() > 4 {
        format!("***{}", &digits[digits.len() - 4..])
    } else {
        "****".to_owned()
    }
}

/// Truncates a string for logging purposes.
pub fn truncate_for_log(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_owned()
    } else {
        format!("{}...", s.chars().take(max_len).collect::<String>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_phone() {
        assert_eq!(mask_phone("+1234567890"), "***7890");
        assert_eq!(mask_phone("123"), "****");
        assert_eq!(mask_phone("+7 (999) 123-45-67"), "***4567");
    }

    #[test]
    fn test_truncate_for_log() {
        assert_eq!(truncate_for_log("Hello", 10), "Hello");
        assert_eq!(truncate_for_log("Hello, World!", 5), "Hello...");
    }

    #[test]
    fn test_extract_flood_wait() {
        assert_eq!(extract_flood_wait_seconds("FLOOD_WAIT_120"), Some(120));
        assert_eq!(extract_flood_wait_seconds("flood wait 60 seconds"), Some(60));
        assert_eq!(extract_flood_wait_seconds("some other error"), None);
    }

    #[test]
    fn test_extract_flood_wait_after_non_ascii_text() {
        // 'İ' grows by one byte when lowercased.
        assert_eq!(extract_flood_wait_seconds("İİİ FLOOD_WAIT_30"), Some(30));
        assert_eq!(extract_flood_wait_seconds("Ошибка: flood wait 45"), Some(45));
    }

    #[test]
    fn test_session_fatal_kinds() {
        assert!(TelegramError::NotAuthorized.is_session_fatal());
        assert!(TelegramError::SessionRevoked("AUTH_KEY_UNREGISTERED".to_owned()).is_session_fatal());
        assert!(!TelegramError::FloodWait(5).is_session_fatal());
        assert!(!TelegramError::Connection("reset".to_owned()).is_session_fatal());
    }

    #[test]
    fn test_input_peer_for_channel() {
        let peer = input_peer(RecipientPeer::Channel {
            channel_id: 10,
            access_hash: 20,
        });
        assert!(matches!(
            peer,
            tl::enums::InputPeer::Channel(tl::types::InputPeerChannel {
                channel_id: 10,
                access_hash: 20,
            })
        ));
    }
}
