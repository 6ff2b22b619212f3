//! Standalone validator for the forwarder's store file.
//!
//! Checks that every account has its session file and a known owner, and
//! that every user's delay respects the configured minimum.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;

use hinari_forwarder::config::ServiceSettings;
use hinari_forwarder::store::{Severity, StoreData};

/// Store file validator.
#[derive(Parser, Debug)]
#[command(name = "validate_store")]
#[command(about = "Validates the account store of the HinariAdsBot forwarder")]
#[command(version)]
struct Args {
    /// Path to the store file (defaults to `HINARI_STORE_PATH`).
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Path to the .env file for environment variables.
    #[arg(long, default_value = ".env")]
    env_file: String,

    /// Treat warnings as errors.
    #[arg(long)]
    strict: bool,

    /// List every account, not only the ones with issues.
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    if let Some(warning) = load_env_file(&args.env_file, args.verbose) {
        eprintln!("⚠ {warning}");
    }

    let settings = match ServiceSettings::from_env() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("✗ Invalid settings: {e}");
            return ExitCode::FAILURE;
        }
    };

    let path = args.file.clone().unwrap_or_else(|| settings.store_path.clone());
    validate_store(&path, &settings, &args)
}

/// Loads the .env file, describing any failure worth reporting.
///
/// A missing file is only reported in verbose mode.
fn load_env_file(path: &str, verbose: bool) -> Option<String> {
    match dotenvy::from_filename(path) {
        Ok(_) => None,
        Err(e) if e.not_found() && !verbose => None,
        Err(e) => Some(format!("Could not load .env file ({path}): {e}")),
    }
}

fn validate_store(path: &Path, settings: &ServiceSettings, args: &Args) -> ExitCode {
    println!("Validating: {}", path.display());

    if !path.exists() {
        eprintln!("✗ Store file does not exist");
        return ExitCode::FAILURE;
    }

    let data = match StoreData::load_from_file(path) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("✗ Failed to load store: {e}");
            return ExitCode::FAILURE;
        }
    };

    println!(
        "{} accounts, {} users (minimum delay {}s)\n",
        data.accounts.len(),
        data.users.len(),
        settings.min_delay_secs
    );

    if args.verbose {
        for account in data.accounts.values() {
            println!(
                "[{}] {} owner {} forwarding={}",
                account.id,
                account.masked_phone(),
                account.owner_id,
                account.forwarding_enabled
            );
        }
        println!();
    }

    let issues = data.audit(settings.min_delay_secs);
    for issue in &issues {
        println!("{issue}");
    }

    let errors = issues.iter().filter(|i| i.severity == Severity::Error).count();
    let warnings = issues.len() - errors;

    if errors == 0 && (warnings == 0 || !args.strict) {
        println!("✓ Store is valid");
        if warnings > 0 {
            println!("  ({warnings} warning(s))");
        }
        ExitCode::SUCCESS
    } else {
        println!("✗ Validation failed: {errors} error(s), {warnings} warning(s)");
        ExitCode::FAILURE
    }
}
