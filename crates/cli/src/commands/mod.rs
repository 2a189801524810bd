//! Subcommand handlers for the `autotrade` binary.

pub mod bracket;
pub mod guardrails;
pub mod manage;

pub use bracket::BracketArgs;
pub use guardrails::{EntryCheckArgs, GuardrailsCommand, LockCommand};

/// Prints a report value as pretty JSON on stdout.
pub(crate) fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
