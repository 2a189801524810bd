//! Entry admission, guardrail switches and lock recovery.

use anyhow::{bail, Result};
use chrono::Utc;
use clap::{Args, Subcommand};
use rust_decimal::Decimal;

use autotrade_store::ResetOptions;

use super::manage::report;
use super::print_json;
use crate::context::AppContext;

/// Arguments for `entry-check`.
#[derive(Args, Debug)]
pub struct EntryCheckArgs {
    /// Ticker to check
    pub ticker: String,
    /// Candidate signal score, used when the book is full
    #[arg(long)]
    pub score: Option<Decimal>,
}

#[derive(Subcommand, Debug)]
pub enum GuardrailsCommand {
    /// Show today's counters and the auto-entry switch
    Status,
    /// Reset today's counters
    Reset {
        #[arg(long)]
        entries: bool,
        #[arg(long)]
        failures: bool,
        #[arg(long)]
        auto_disabled: bool,
        #[arg(long)]
        last_loss: bool,
        /// Reset everything
        #[arg(long)]
        all: bool,
    },
    /// Turn automated entries on
    Enable {
        #[arg(long)]
        reason: Option<String>,
    },
    /// Turn automated entries off
    Disable {
        #[arg(long)]
        reason: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum LockCommand {
    /// Show the holder and TTL of a lock (defaults to the auto-manage lock)
    Inspect { name: Option<String> },
    /// Delete a lock regardless of holder
    Unlock { name: String },
}

pub async fn entry_check(ctx: &AppContext, args: EntryCheckArgs) -> Result<()> {
    let decision = ctx
        .manager
        .entry_gate()
        .check_entry(&args.ticker, args.score, Utc::now())
        .await;
    print_json(&decision)
}

pub async fn run(ctx: &AppContext, command: GuardrailsCommand) -> Result<()> {
    let now = Utc::now();
    let guardrails = ctx.manager.entry_gate().guardrails();
    match command {
        GuardrailsCommand::Status => print_json(&guardrails.state(now).await),
        GuardrailsCommand::Reset {
            entries,
            failures,
            auto_disabled,
            last_loss,
            all,
        } => {
            let options = if all {
                ResetOptions::all()
            } else {
                ResetOptions {
                    entries,
                    failures,
                    auto_disabled,
                    last_loss,
                }
            };
            if options == ResetOptions::default() {
                bail!("nothing to reset; pass --all or at least one field flag");
            }
            report(ctx.manager.reset_guardrails(options, now).await)
        }
        GuardrailsCommand::Enable { reason } => {
            guardrails.set_auto_entry(true, reason.as_deref(), now).await?;
            println!("Automated entries enabled");
            Ok(())
        }
        GuardrailsCommand::Disable { reason } => {
            guardrails.set_auto_entry(false, reason.as_deref(), now).await?;
            println!("Automated entries disabled");
            Ok(())
        }
    }
}

pub async fn lock(ctx: &AppContext, command: LockCommand) -> Result<()> {
    let locks = ctx.manager.locks();
    match command {
        LockCommand::Inspect { name } => {
            let name = name.unwrap_or_else(|| ctx.config.manager.lock_key.clone());
            print_json(&locks.inspect(&name).await?)
        }
        LockCommand::Unlock { name } => {
            if locks.force_unlock(&name).await? {
                println!("Removed lock {name}");
            } else {
                println!("Lock {name} was not held");
            }
            Ok(())
        }
    }
}
