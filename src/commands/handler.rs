//! Command handler implementation.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use super::types::{CommandResult, ConsoleCommand};
use crate::forwarder::{Supervisor, SupervisorError};
use crate::store::{AccountId, UserId};

/// Executes console commands against the supervisor and its store.
pub struct CommandHandler {
    supervisor: Arc<Supervisor>,

    /// Lowest delay the `delay` command accepts.
    min_delay_secs: u64,
}

impl CommandHandler {
    /// Creates a new command handler.
    #[must_use]
    pub fn new(supervisor: Arc<Supervisor>, min_delay_secs: u64) -> Self {
        Self {
            supervisor,
            min_delay_secs,
        }
    }

    /// Tries to parse and execute a console line.
    ///
    /// Returns `None` if the line is not a command.
    pub async fn try_handle(&self, line: &str) -> Option<CommandResult> {
        let command = ConsoleCommand::parse(line)?;

        debug!("Handling command: {}", command);
        let result = self.execute(command).await;
        info!("Command result: success={}", result.success);

        Some(result)
    }

    /// Executes a parsed command.
    pub async fn execute(&self, command: ConsoleCommand) -> CommandResult {
        match command {
            ConsoleCommand::Start(id) => self.handle_start(id).await,
            ConsoleCommand::Stop(id) => self.handle_stop(id).await,
            ConsoleCommand::Status => self.handle_status().await,
            ConsoleCommand::Accounts(owner) => self.handle_accounts(owner).await,
            ConsoleCommand::Delete(id) => self.handle_delete(id).await,
            ConsoleCommand::Delay {
                owner_id,
                delay_secs,
            } => self.handle_delay(owner_id, delay_secs).await,
            ConsoleCommand::Help => Self::handle_help(),
            ConsoleCommand::Quit => CommandResult::quit("Stopping all forwarders..."),
        }
    }

    async fn handle_start(&self, id: AccountId) -> CommandResult {
        match self.supervisor.start(id).await {
            Ok(true) => CommandResult::success(format!("✓ Forwarding started for account {id}")),
            Ok(false) => CommandResult::error(format!("Forwarding is already running for account {id}")),
            Err(e) => supervisor_error(&e),
        }
    }

    async fn handle_stop(&self, id: AccountId) -> CommandResult {
        match self.supervisor.stop(id).await {
            Ok(true) => CommandResult::success(format!("✓ Forwarding stopped for account {id}")),
            Ok(false) => CommandResult::success(format!("Account {id} was not forwarding")),
            Err(e) => supervisor_error(&e),
        }
    }

    async fn handle_status(&self) -> CommandResult {
        let running = self.supervisor.running().await;

        if running.is_empty() {
            return CommandResult::success("No forwarders running.");
        }

        let store = self.supervisor.store();
        let mut lines = vec![format!("Running forwarders: {}", running.len())];

        for forwarder in running {
            let phone = match store.account(forwarder.account_id).await {
                Ok(Some(account)) => account.masked_phone(),
                _ => "?".to_owned(),
            };
            let delay = match store.user_settings(forwarder.owner_id).await {
                Ok(Some(settings)) => format_duration(settings.delay_secs),
                _ => "default".to_owned(),
            };
            lines.push(format!(
                "  ▶ [{}] {phone} (owner {}, every {delay})",
                forwarder.account_id, forwarder.owner_id
            ));
        }

        CommandResult::success(lines.join("\n"))
    }

    async fn handle_accounts(&self, owner: Option<UserId>) -> CommandResult {
        let store = self.supervisor.store();
        let accounts = match owner {
            Some(owner_id) => store.accounts_for_owner(owner_id).await,
            None => store.all_accounts().await,
        };

        let accounts = match accounts {
            Ok(accounts) => accounts,
            Err(e) => return CommandResult::error(format!("Failed to read accounts: {e}")),
        };

        if accounts.is_empty() {
            return CommandResult::success("No accounts stored.");
        }

        let now = Utc::now();
        let mut lines = vec!["Stored accounts:".to_owned()];

        for account in accounts {
            let marker = if self.supervisor.is_running(account.id).await {
                "▶"
            } else if account.forwarding_enabled {
                "…"
            } else {
                "⏸"
            };

            let plan = match store.user_settings(account.owner_id).await {
                Ok(Some(s)) if s.is_banned => "banned".to_owned(),
                Ok(Some(s)) if s.is_premium_at(now) => {
                    format!("premium, {}d left", s.premium_days_left(now))
                }
                Ok(Some(_)) => "free".to_owned(),
                _ => "unknown owner".to_owned(),
            };

            lines.push(format!(
                "{marker} [{}] {} (owner {}, {plan})",
                account.id,
                account.masked_phone(),
                account.owner_id
            ));
        }

        CommandResult::success(lines.join("\n"))
    }

    async fn handle_delete(&self, id: AccountId) -> CommandResult {
        match self.supervisor.delete_account(id).await {
            Ok(()) => CommandResult::success(format!("✓ Account {id} deleted")),
            Err(e) => supervisor_error(&e),
        }
    }

    async fn handle_delay(&self, owner_id: UserId, delay_secs: u64) -> CommandResult {
        if delay_secs < self.min_delay_secs {
            return CommandResult::error(format!(
                "Delay must be at least {}",
                format_duration(self.min_delay_secs)
            ));
        }

        match self.supervisor.store().set_delay(owner_id, delay_secs).await {
            Ok(()) => CommandResult::success(format!(
                "✓ Delay for user {owner_id} set to {}. Running forwarders pick it up after their current pass.",
                format_duration(delay_secs)
            )),
            Err(e) => CommandResult::error(format!("Failed to set delay: {e}")),
        }
    }

    fn handle_help() -> CommandResult {
        let mut lines = vec!["Available commands:".to_owned()];

        for (usage, aliases, description) in ConsoleCommand::all_commands() {
            if aliases.is_empty() {
                lines.push(format!("  {usage} - {description}"));
            } else {
                lines.push(format!("  {usage} {aliases} - {description}"));
            }
        }

        CommandResult::success(lines.join("\n"))
    }
}

fn supervisor_error(err: &SupervisorError) -> CommandResult {
    CommandResult::error(format!("✗ {err}"))
}

/// Formats a duration in seconds to a human-readable string.
fn format_duration(secs: u64) -> String {
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        let mins = secs / 60;
        let rest = secs % 60;
        if rest == 0 {
            format!("{mins}m")
        } else {
            format!("{mins}m {rest}s")
        }
    } else {
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        if mins == 0 {
            format!("{hours}h")
        } else {
            format!("{hours}h {mins}m")
        }
    }
}
