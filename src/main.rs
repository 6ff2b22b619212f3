//! HinariAdsBot forwarder - Main Entry Point
//!
//! Runs the forwarder supervisor with an operator console, and provides
//! the login and account maintenance commands that feed it.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use dialoguer::{Input, Password};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use hinari_forwarder::commands::{CommandHandler, ConsoleCommand};
use hinari_forwarder::config::ServiceSettings;
use hinari_forwarder::forwarder::Supervisor;
use hinari_forwarder::notify::LogNotifier;
use hinari_forwarder::store::{
    Account, AccountStore, JsonStore, NewAccount, UserDefaults, UserId, remove_session_files,
};
use hinari_forwarder::telegram::{
    ChatClient, GrammersConnector, TelegramError, TelegramSession, mask_phone,
};

/// Forwards each account's latest Saved Message to all of its groups.
#[derive(Parser, Debug)]
#[command(name = "hinari_forwarder")]
#[command(about = "HinariAdsBot forwarder supervisor")]
#[command(version)]
struct Args {
    /// Path to the .env file for environment variables.
    #[arg(long, default_value = ".env", global = true)]
    env_file: String,

    /// Log level (trace, debug, info, warn, error), used when `RUST_LOG` is unset.
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resume flagged forwarders and read console commands (default).
    Run,

    /// Connect a new Telegram account for a user.
    Login {
        /// Bot user who owns the account.
        #[arg(long)]
        owner: UserId,
    },

    /// List stored accounts.
    Accounts {
        /// Only show accounts of this user.
        #[arg(long)]
        owner: Option<UserId>,
    },

    /// Delete an account and its session file.
    Delete {
        /// Account id.
        id: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load environment variables
    let env_loaded = dotenvy::from_filename(&args.env_file);

    let settings = ServiceSettings::from_env().context("Failed to load settings from environment")?;

    init_logging(args.log_level.as_deref().unwrap_or(&settings.log_level));
    if let Err(e) = env_loaded {
        debug!("Could not load .env file ({}): {}", args.env_file, e);
    }

    let store = Arc::new(
        JsonStore::open(
            &settings.store_path,
            &settings.sessions_dir,
            UserDefaults {
                delay_secs: settings.default_delay_secs,
                trial_days: settings.trial_days,
            },
        )
        .context("Failed to open account store")?,
    );

    let supervisor = Arc::new(Supervisor::new(
        Arc::clone(&store) as Arc<dyn AccountStore>,
        Arc::new(GrammersConnector),
        Arc::new(LogNotifier),
        settings.forwarder_policy(),
    ));
    let handler = CommandHandler::new(Arc::clone(&supervisor), settings.min_delay_secs);

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run(&supervisor, &handler).await,
        Command::Login { owner } => login(store.as_ref(), &settings, owner).await,
        Command::Accounts { owner } => {
            println!("{}", handler.execute(ConsoleCommand::Accounts(owner)).await.message);
            Ok(())
        }
        Command::Delete { id } => {
            let result = handler.execute(ConsoleCommand::Delete(id)).await;
            println!("{}", result.message);
            if result.success {
                Ok(())
            } else {
                bail!("delete failed")
            }
        }
    }
}

/// Initializes the logging subsystem.
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Resumes flagged forwarders and serves console commands until quit or Ctrl+C.
async fn run(supervisor: &Supervisor, handler: &CommandHandler) -> Result<()> {
    let resumed = supervisor.resume_all().await;
    info!("Forwarder service running ({} resumed). Type 'help' for commands.", resumed);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read console input")? else {
                    info!("Console closed, shutting down...");
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }

                match handler.try_handle(&line).await {
                    Some(result) => {
                        println!("{}", result.message);
                        if result.quit {
                            break;
                        }
                    }
                    None => println!("Unknown command: '{}'. Type 'help'.", line.trim()),
                }
            }
        }
    }

    supervisor.shutdown().await;
    info!("Shutdown complete");
    Ok(())
}

/// Connects a new account for `owner_id`.
///
/// On any failure the half-created record and its session file are removed.
async fn login(store: &JsonStore, settings: &ServiceSettings, owner_id: UserId) -> Result<()> {
    let user = store.ensure_user(owner_id).await.context("Failed to load user")?;
    if user.is_banned {
        bail!("User {owner_id} is banned");
    }

    let phone: String = Input::new()
        .with_prompt("Enter the phone number (with country code)")
        .interact_text()?;
    let phone = phone.trim().replace(' ', "");

    let existing = store.accounts_for_owner(owner_id).await?;
    let superseded: Vec<Account> = existing.iter().filter(|a| a.phone == phone).cloned().collect();
    let other_accounts = existing.len() - superseded.len();

    if !user.is_premium_at(Utc::now()) && other_accounts >= settings.free_account_limit {
        bail!(
            "Free users can connect {} account(s); user {owner_id} already has {other_accounts}",
            settings.free_account_limit
        );
    }

    let api_id: i32 = Input::new().with_prompt("Enter the API ID").interact_text()?;
    let api_hash: String = Input::new().with_prompt("Enter the API hash").interact_text()?;

    let account = store
        .insert_account(NewAccount {
            owner_id,
            phone: phone.clone(),
            api_id,
            api_hash,
        })
        .await
        .context("Failed to create account record")?;

    if let Err(e) = authenticate(&account).await {
        warn!("Login for {} failed, removing account {}", mask_phone(&phone), account.id);
        if let Err(remove_err) = store.remove_account(account.id).await {
            warn!("Failed to remove account {}: {}", account.id, remove_err);
        }
        remove_session_files(&account.session_path);
        return Err(e);
    }

    for old in superseded {
        info!("Account {} superseded by {}", old.id, account.id);
        store.remove_account(old.id).await?;
        remove_session_files(&old.session_path);
    }

    println!(
        "✓ Account {} ({}) connected for user {owner_id}. Start it with 'start {}'.",
        account.id,
        account.masked_phone(),
        account.id
    );
    Ok(())
}

/// Handles Telegram authentication for a freshly created account.
async fn authenticate(account: &Account) -> Result<()> {
    if let Some(dir) = account.session_path.parent() {
        std::fs::create_dir_all(dir).context("Failed to create sessions directory")?;
    }

    let session = TelegramSession::connect(account.api_id, &account.session_path)
        .await
        .context("Failed to connect to Telegram")?;

    let result = sign_in(&session, account).await;
    session.disconnect();
    result
}

async fn sign_in(session: &TelegramSession, account: &Account) -> Result<()> {
    if session.is_authorized().await.context("Failed to check authorization")? {
        info!("Session is already authorized");
        return Ok(());
    }

    let token = session
        .request_login_code(&account.phone, &account.api_hash)
        .await
        .context("Failed to request login code")?;

    info!("Login code sent to the Telegram app");

    let code: String = Input::new()
        .with_prompt("Enter the login code")
        .interact_text()?;

    match session.sign_in(&token, code.trim()).await {
        Ok(()) => {
            info!("Successfully signed in!");
            Ok(())
        }
        Err(TelegramError::PasswordRequired(password_token)) => {
            info!("Two-factor authentication is enabled");

            let hint = password_token.hint().unwrap_or("no hint");
            info!("Password hint: {}", hint);

            let password: String = Password::new()
                .with_prompt("Enter the 2FA password")
                .interact()?;

            session
                .check_password(password_token, &password)
                .await
                .context("2FA authentication failed")?;

            info!("Successfully signed in with 2FA!");
            Ok(())
        }
        Err(e) => Err(e).context("Authentication failed"),
    }
}
