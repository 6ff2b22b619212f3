//! Console command types and parsing.

use std::fmt;

use crate::store::{AccountId, UserId};

/// Delay presets offered to users, as `(label, seconds)`.
pub const DELAY_PRESETS: [(&str, u64); 3] = [("3m", 180), ("5m", 300), ("7m", 420)];

/// Commands accepted on the operator console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// Start forwarding for an account.
    Start(AccountId),

    /// Stop forwarding for an account.
    Stop(AccountId),

    /// Show running forwarders.
    Status,

    /// List stored accounts, optionally for one owner.
    Accounts(Option<UserId>),

    /// Delete an account and its session.
    Delete(AccountId),

    /// Change an owner's delay between forward passes.
    Delay { owner_id: UserId, delay_secs: u64 },

    /// Show help information.
    Help,

    /// Stop every forwarder and exit.
    Quit,
}

impl ConsoleCommand {
    /// Parses one console line.
    ///
    /// Returns `None` if the line is not a valid command.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();

        let (cmd, args) = match text.split_once(char::is_whitespace) {
            Some((cmd, args)) => (cmd.to_lowercase(), Some(args.trim())),
            None => (text.to_lowercase(), None),
        };

        match cmd.as_str() {
            "start" | "run" => parse_id(args?).map(Self::Start),
            "stop" | "pause" => parse_id(args?).map(Self::Stop),
            "status" | "stat" | "s" => Some(Self::Status),
            "accounts" | "list" | "ls" => match args.filter(|a| !a.is_empty()) {
                Some(owner) => parse_id(owner).map(|id| Self::Accounts(Some(id))),
                None => Some(Self::Accounts(None)),
            },
            "delete" | "remove" | "rm" | "del" => parse_id(args?).map(Self::Delete),
            "delay" | "interval" => Self::parse_delay(args?),
            "help" | "h" | "?" => Some(Self::Help),
            "quit" | "exit" | "q" => Some(Self::Quit),
            _ => None,
        }
    }

    /// Parses delay arguments: `<owner_id> <seconds|3m|5m|7m>`
    fn parse_delay(args: &str) -> Option<Self> {
        let mut parts = args.split_whitespace();
        let owner_id = parse_id(parts.next()?)?;
        let delay_secs = parse_delay_value(parts.next()?)?;

        if parts.next().is_some() {
            return None;
        }

        Some(Self::Delay {
            owner_id,
            delay_secs,
        })
    }

    /// Returns the command name as it appears in help.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Start(_) => "start",
            Self::Stop(_) => "stop",
            Self::Status => "status",
            Self::Accounts(_) => "accounts",
            Self::Delete(_) => "delete",
            Self::Delay { .. } => "delay",
            Self::Help => "help",
            Self::Quit => "quit",
        }
    }

    /// Returns all available commands with their descriptions.
    #[must_use]
    pub fn all_commands() -> Vec<(&'static str, &'static str, &'static str)> {
        vec![
            ("start <account>", "", "Start forwarding for an account"),
            ("stop <account>", "", "Stop forwarding for an account"),
            ("status", "(s)", "Show running forwarders"),
            ("accounts [owner]", "(ls)", "List stored accounts"),
            ("delete <account>", "(rm)", "Delete an account and its session"),
            ("delay <owner> <sec|3m|5m|7m>", "", "Change an owner's forwarding delay"),
            ("help", "(h, ?)", "Show this help message"),
            ("quit", "(q)", "Stop all forwarders and exit"),
        ]
    }
}

impl fmt::Display for ConsoleCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start(id) | Self::Stop(id) | Self::Delete(id) => write!(f, "{} {id}", self.name()),
            Self::Accounts(Some(owner)) => write!(f, "accounts {owner}"),
            Self::Delay {
                owner_id,
                delay_secs,
            } => write!(f, "delay {owner_id} {delay_secs}"),
            _ => write!(f, "{}", self.name()),
        }
    }
}

fn parse_id(text: &str) -> Option<i64> {
    text.trim().parse().ok()
}

/// Accepts a preset label or a number of seconds.
fn parse_delay_value(text: &str) -> Option<u64> {
    let text = text.to_lowercase();
    DELAY_PRESETS
        .iter()
        .find(|(label, _)| *label == text)
        .map(|&(_, secs)| secs)
        .or_else(|| text.parse().ok())
}

/// Result of command execution.
#[derive(Debug, Clone)]
pub struct CommandResult {
    /// Whether the command was successful.
    pub success: bool,

    /// Response message to show the operator.
    pub message: String,

    /// Whether the console should shut down.
    pub quit: bool,
}

impl CommandResult {
    /// Creates a successful result.
    #[must_use]
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            quit: false,
        }
    }

    /// Creates a successful result that ends the console.
    #[must_use]
    pub fn quit(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            quit: true,
        }
    }

    /// Creates an error result.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            quit: false,
        }
    }
}
