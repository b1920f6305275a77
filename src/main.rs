//! # schedule-watch CLI (`swatch`)
//!
//! ## Usage
//!
//! ```bash
//! swatch --config ./config/swatch.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `swatch init` | Write a starter config and create data directories |
//! | `swatch check` | Run one fetch/compare/notify cycle now |
//! | `swatch parse <file>` | Extract a saved page and print it as JSON |
//! | `swatch run` | Scheduler and bot, until Ctrl-C |
//! | `swatch history` | List stored snapshots |
//! | `swatch show [name]` | Print the current or a historical schedule |
//! | `swatch users list\|ban\|unban` | Inspect and moderate users |
//! | `swatch broadcast <message>` | Send a message to all users or one |
//! | `swatch serve` | Start the operator dashboard |
//!
//! ## Examples
//!
//! ```bash
//! # First-time setup
//! swatch init --config ./config/swatch.toml
//!
//! # See what the page currently parses to, without touching the store
//! swatch check --dry-run
//!
//! # Debug extraction against a saved copy of the page
//! swatch parse ./page.htm --encoding windows-1251
//!
//! # Run the watcher and bot
//! SWATCH_BOT_TOKEN=123:abc swatch run
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use schedule_watch::commands;
use schedule_watch::config::{self, LoggingConfig};
use schedule_watch::logging;
use schedule_watch::progress::ProgressMode;
use schedule_watch::server;

/// Watches a published class schedule and notifies subscribers of changes.
///
/// All commands except `init` and `parse` read a TOML configuration file.
/// See `config/swatch.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "swatch",
    about = "schedule-watch: poll a class schedule page and notify subscribers when it changes",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/swatch.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter config if missing and create the data directories.
    Init,

    /// Fetch, extract, and compare once.
    ///
    /// On change the snapshot is stored and subscribers are notified
    /// (when a transport token is configured).
    Check {
        /// Compare only; write nothing and send nothing.
        #[arg(long)]
        dry_run: bool,
    },

    /// Extract a saved schedule page and print the document as JSON.
    Parse {
        file: PathBuf,

        /// Encoding of the saved page.
        #[arg(long, default_value = "windows-1251")]
        encoding: String,
    },

    /// Run the scheduler and the bot until interrupted.
    Run,

    /// List stored snapshots, newest first.
    History {
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Print a snapshot as the bot shows it. Defaults to the current one.
    Show {
        /// History file name, e.g. `20240912_083000_000123.json`.
        name: Option<String>,

        /// Print the stored JSON instead.
        #[arg(long)]
        json: bool,
    },

    /// Inspect and moderate users.
    Users {
        #[command(subcommand)]
        action: UsersAction,
    },

    /// Send a message to every non-blocked user, or to one user.
    Broadcast {
        message: String,

        /// Only this user id.
        #[arg(long)]
        user: Option<i64>,

        /// Progress output on stderr. Defaults to `human` on a TTY.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Start the operator dashboard on `[server].bind`.
    Serve,
}

#[derive(Subcommand)]
enum UsersAction {
    List,

    /// Block a user and tell them why.
    Ban {
        id: i64,

        #[arg(long)]
        reason: Option<String>,
    },

    Unban { id: i64 },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Commands that don't require config
    match &cli.command {
        Commands::Init => {
            let _log = logging::init(&LoggingConfig::default(), false)?;
            return commands::run_init(&cli.config);
        }
        Commands::Parse { file, encoding } => {
            let _log = logging::init(&LoggingConfig::default(), false)?;
            let labels = config::load_config(&cli.config)
                .map(|c| c.labels.labels())
                .unwrap_or_default();
            return commands::run_parse(file, encoding, &labels).await;
        }
        _ => {}
    }

    let cfg = config::load_config(&cli.config)?;
    let long_running = matches!(cli.command, Commands::Run | Commands::Serve);
    let _log = logging::init(&cfg.logging, long_running)?;

    match cli.command {
        Commands::Check { dry_run } => {
            commands::run_check(&cfg, dry_run).await?;
        }
        Commands::Run => {
            commands::run_worker(&cfg).await?;
        }
        Commands::History { limit } => {
            commands::run_history(&cfg, limit)?;
        }
        Commands::Show { name, json } => {
            commands::run_show(&cfg, name.as_deref(), json)?;
        }
        Commands::Users { action } => match action {
            UsersAction::List => commands::run_users_list(&cfg).await?,
            UsersAction::Ban { id, reason } => {
                commands::run_users_ban(&cfg, id, reason.as_deref()).await?
            }
            UsersAction::Unban { id } => commands::run_users_unban(&cfg, id).await?,
        },
        Commands::Broadcast {
            message,
            user,
            progress,
        } => {
            let progress = progress.unwrap_or_else(ProgressMode::default_for_tty);
            commands::run_broadcast(&cfg, &message, user, progress).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg, &cli.config).await?;
        }
        Commands::Init | Commands::Parse { .. } => {
            // Handled above (before config loading)
            unreachable!()
        }
    }

    Ok(())
}
