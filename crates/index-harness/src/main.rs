//! # Index Harness CLI (`ixh`)
//!
//! ## Usage
//!
//! ```bash
//! ixh --config ./config/ixh.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ixh init` | Create the SQLite database and run schema migrations |
//! | `ixh sources` | List configured connectors and their health |
//! | `ixh run create <connector>` | Create a `not_started` indexing run |
//! | `ixh run work <id>` | Claim a run and index it to completion |
//! | `ixh run cancel <id>` | Request cancellation of a run |
//! | `ixh run status [id]` | Show one run in detail, or all runs |
//! | `ixh errors list <run>` | List per-document errors of a run |
//! | `ixh errors resolve <id>` | Mark an error resolved |
//! | `ixh reconcile [--once]` | Fail stalled runs and runs with dead workers |
//! | `ixh perm-sync <connector>` | Resolve and store document access |
//!
//! ## Examples
//!
//! ```bash
//! ixh init
//! ixh run create eng-slack
//! ixh run work 1 --progress json
//! ixh reconcile &
//! ixh run cancel 1
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use index_harness::progress::ProgressMode;
use index_harness::{config, migrate, observability, perm_sync_cmd, reconcile, runs, sources};

/// Index Harness: resumable, checkpointed connector indexing.
#[derive(Parser)]
#[command(
    name = "ixh",
    about = "Index Harness: resumable, checkpointed connector indexing",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ixh.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// List configured connectors and whether their fixtures exist.
    Sources,

    /// Create, work, cancel, and inspect indexing runs.
    Run {
        #[command(subcommand)]
        action: RunAction,
    },

    /// Inspect and resolve per-document errors.
    Errors {
        #[command(subcommand)]
        action: ErrorsAction,
    },

    /// Check in-progress runs for frozen heartbeats and stalled progress.
    ///
    /// Loops every `coordination.monitor_interval_secs` until Ctrl-C.
    Reconcile {
        /// Sweep once and exit.
        #[arg(long)]
        once: bool,
    },

    /// Resolve external access for every document of a connector and
    /// store it.
    PermSync {
        /// Connector name (`name` or `fixture:name`).
        connector: String,
    },
}

#[derive(Subcommand)]
enum RunAction {
    /// Create a run for a connector.
    Create {
        /// Connector name (`name` or `fixture:name`).
        connector: String,

        /// Ignore stored checkpoints and start from scratch.
        #[arg(long)]
        from_beginning: bool,

        /// Search settings the run indexes for.
        #[arg(long, default_value_t = 1)]
        search_settings: i64,

        /// Only fetch items updated on or after this date (YYYY-MM-DD).
        #[arg(long)]
        since: Option<String>,

        /// Only fetch items updated on or before this date (YYYY-MM-DD).
        #[arg(long)]
        until: Option<String>,
    },

    /// Claim a run and index it until it reaches a terminal status.
    Work {
        run_id: i64,

        /// Worker identity recorded on the run. Random if omitted.
        #[arg(long)]
        worker_id: Option<String>,

        /// Progress output on stderr. Defaults to `human` on a TTY, else `off`.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Request cancellation. The worker stops at the next batch boundary.
    Cancel { run_id: i64 },

    /// Show a run, or every run when no id is given.
    Status { run_id: Option<i64> },
}

#[derive(Subcommand)]
enum ErrorsAction {
    /// List open errors for a run.
    List {
        run_id: i64,

        /// Include resolved errors.
        #[arg(long)]
        all: bool,
    },

    /// Mark an error resolved.
    Resolve { error_id: i64 },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    observability::init_logging(cfg.logging.format);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Sources => {
            sources::list_sources(&cfg)?;
        }
        Commands::Run { action } => match action {
            RunAction::Create {
                connector,
                from_beginning,
                search_settings,
                since,
                until,
            } => {
                runs::create_run(&cfg, &connector, search_settings, from_beginning, since, until)
                    .await?;
            }
            RunAction::Work {
                run_id,
                worker_id,
                progress,
            } => {
                runs::work_run(&cfg, run_id, worker_id, progress).await?;
            }
            RunAction::Cancel { run_id } => {
                runs::cancel_run(&cfg, run_id).await?;
            }
            RunAction::Status { run_id } => {
                runs::show_status(&cfg, run_id).await?;
            }
        },
        Commands::Errors { action } => match action {
            ErrorsAction::List { run_id, all } => {
                runs::list_errors(&cfg, run_id, all).await?;
            }
            ErrorsAction::Resolve { error_id } => {
                runs::resolve_error(&cfg, error_id).await?;
            }
        },
        Commands::Reconcile { once } => {
            reconcile::run_reconcile(&cfg, once).await?;
        }
        Commands::PermSync { connector } => {
            perm_sync_cmd::run_perm_sync(&cfg, &connector).await?;
        }
    }

    Ok(())
}
