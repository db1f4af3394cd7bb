//! # cinesync CLI
//!
//! The `cinesync` binary prepares indices, runs the sync loop, and reports
//! watermark status.
//!
//! ## Usage
//!
//! ```bash
//! cinesync --config ./config/cinesync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `cinesync init` | Create missing indices and the SQLite state table |
//! | `cinesync run` | Sync every enabled family until interrupted |
//! | `cinesync run --once` | Run one cycle per family and exit |
//! | `cinesync run --family genres` | Restrict the run to one family |
//! | `cinesync status [--counts]` | Print watermarks (and index document counts) |
//!
//! Logging goes to stderr. `RUST_LOG` overrides `[log] level`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use cinesync::config::{self, LogConfig};
use cinesync::{migrate, status, sync};

/// cinesync: incremental sync from a PostgreSQL movie catalogue into
/// Elasticsearch.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/cinesync.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "cinesync",
    about = "Incremental change-data-capture sync from PostgreSQL into Elasticsearch",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(
        long,
        global = true,
        env = "CINESYNC_CONFIG",
        default_value = "./config/cinesync.toml"
    )]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create every enabled family's index if missing, and the SQLite
    /// checkpoints table when that backend is selected. Idempotent.
    Init,

    /// Run the sync loop.
    ///
    /// Probes the source database and the index first (with the startup
    /// retry budget), creates missing indices, then cycles every enabled
    /// family until Ctrl-C or SIGTERM.
    Run {
        /// Only sync this family (`movies`, `genres` or `persons`).
        #[arg(long)]
        family: Option<String>,

        /// Run a single cycle per family and exit. Exits non-zero if any
        /// family failed.
        #[arg(long)]
        once: bool,
    },

    /// Print committed watermarks.
    Status {
        /// Also query the document count of each index.
        #[arg(long)]
        counts: bool,
    },
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&log.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if log.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let cfg = config::load_config(&cli.config)?;
    init_tracing(&cfg.log);

    match cli.command {
        Commands::Init => {
            migrate::run_init(&cfg).await?;
        }
        Commands::Run { family, once } => {
            sync::run_sync(&cfg, family.as_deref(), once).await?;
        }
        Commands::Status { counts } => {
            status::run_status(&cfg, counts).await?;
        }
    }

    Ok(())
}
