use clap::{Parser, Subcommand};

mod commands;
mod context;

use commands::{BracketArgs, EntryCheckArgs, GuardrailsCommand, LockCommand};

#[derive(Parser)]
#[command(name = "autotrade")]
#[command(about = "Automated stop management and entry guardrails", long_about = None)]
struct Cli {
    /// Config file path
    #[arg(short, long, global = true, default_value = "config/Config.toml")]
    config: String,
    /// Profile overlay (loads Config.{profile}.toml next to the config file)
    #[arg(long, global = true, env = "AUTOTRADE_PROFILE")]
    profile: Option<String>,
    /// Use the in-memory paper broker instead of the REST API
    #[arg(long, global = true)]
    paper: bool,
    /// Optional log file path (logs to file instead of stderr)
    #[arg(long, global = true)]
    log_file: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run auto-manage passes on a fixed interval until interrupted
    Run {
        /// Seconds between passes (defaults to manager.run_interval_secs)
        #[arg(short, long)]
        interval: Option<u64>,
    },
    /// Run a single auto-manage pass
    AutoManage,
    /// Finalize recently closed trades from the fill feed
    Finalize,
    /// Place rescue stops on positions without an active stop
    RescueStops,
    /// Check whether an automated entry would be admitted
    EntryCheck(EntryCheckArgs),
    /// Inspect or change entry guardrails
    Guardrails {
        #[command(subcommand)]
        command: GuardrailsCommand,
    },
    /// Inspect or clear distributed locks
    Lock {
        #[command(subcommand)]
        command: LockCommand,
    },
    /// Preview a tick-legal stop/target bracket
    Bracket(BracketArgs),
    /// Show recent auto-manage runs
    Runs {
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
}

fn init_logging(log_file: Option<&str>) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_file.as_deref())?;

    let config = match &cli.profile {
        Some(profile) => autotrade_core::ConfigLoader::load_with_profile(&cli.config, profile)?,
        None => autotrade_core::ConfigLoader::load(&cli.config)?,
    };

    // bracket preview is pure arithmetic; no broker or store needed
    if let Commands::Bracket(args) = &cli.command {
        return commands::bracket::run(args, &config.ticks);
    }

    let ctx = context::AppContext::build(config, cli.paper).await?;

    match cli.command {
        Commands::Run { interval } => commands::manage::run_service(&ctx, interval).await?,
        Commands::AutoManage => commands::manage::auto_manage(&ctx).await?,
        Commands::Finalize => commands::manage::finalize(&ctx).await?,
        Commands::RescueStops => commands::manage::rescue_stops(&ctx).await?,
        Commands::Runs { limit } => commands::manage::runs(&ctx, limit).await?,
        Commands::EntryCheck(args) => commands::guardrails::entry_check(&ctx, args).await?,
        Commands::Guardrails { command } => commands::guardrails::run(&ctx, command).await?,
        Commands::Lock { command } => commands::guardrails::lock(&ctx, command).await?,
        Commands::Bracket(_) => {}
    }

    Ok(())
}
