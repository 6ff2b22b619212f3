//! Operator console commands.
//!
//! Lines read from stdin while the service runs, such as `start 3` or
//! `delay 77 5m`. There is no prefix.

mod handler;
mod types;

pub use handler::CommandHandler;
pub use types::{CommandResult, ConsoleCommand, DELAY_PRESETS};
