//! # filmsync CLI
//!
//! ## Usage
//!
//! ```bash
//! filmsync --config ./config/filmsync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `filmsync init` | Create the `movies`, `genres` and `persons` indices |
//! | `filmsync sync` | Synchronize Postgres into the indices, forever |
//! | `filmsync sync --once` | Run a single pass and exit |
//! | `filmsync status` | Print every stream's watermark |
//! | `filmsync reset [<stream>]` | Rewind one or all streams to the epoch |
//! | `filmsync serve` | Start the read API |
//!
//! Logging goes through `tracing`; `RUST_LOG` takes precedence over
//! `--log-level`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use filmsync::config;
use filmsync::indices::{self, IndexStatus};
use filmsync::progress::ProgressStore;
use filmsync::server;
use filmsync::streams::Stream;
use filmsync::sync::{self, shutdown_channel};

#[derive(Parser)]
#[command(
    name = "filmsync",
    about = "Incremental Postgres to Elasticsearch sync and read API for a film catalog",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/filmsync.toml")]
    config: PathBuf,

    /// Log filter used when `RUST_LOG` is not set.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the search indices with their mappings.
    ///
    /// Idempotent: existing indices are reported and left untouched.
    Init,

    /// Synchronize changed rows into the search indices.
    ///
    /// Runs a pass over every stream, sleeps `sync.interval_secs`, and
    /// repeats until Ctrl-C. Each stream resumes from its persisted watermark.
    Sync {
        /// Run a single pass and exit. Fails if any stream failed.
        #[arg(long)]
        once: bool,

        /// Only sync this stream (film_work, film_work_persons,
        /// film_work_genres, persons, genres).
        #[arg(long)]
        stream: Option<String>,
    },

    /// Print the persisted watermark of every stream.
    Status,

    /// Rewind watermarks to the epoch so the next pass re-indexes.
    Reset {
        /// Stream to rewind. All streams when omitted.
        stream: Option<String>,
    },

    /// Start the read API on `[server].bind`.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)))
        .with(fmt::layer())
        .init();

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            for (index, status) in indices::create_indices(&cfg.elastic).await? {
                match status {
                    IndexStatus::Created => println!("{:<8} created", index),
                    IndexStatus::AlreadyExists => println!("{:<8} already exists", index),
                }
            }
        }
        Commands::Sync { once, stream } => {
            let only = stream.as_deref().map(str::parse::<Stream>).transpose()?;
            let (trigger, shutdown) = shutdown_channel();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("interrupt received, finishing current batch");
                    trigger.trigger();
                }
            });
            sync::run_sync(&cfg, once, only, shutdown).await?;
        }
        Commands::Status => {
            let store = ProgressStore::open(&cfg.sync.state_path);
            println!("state: {}", store.path().display());
            for stream in Stream::ALL {
                println!("  {:<18} {}", stream.key(), store.get(stream.key()));
            }
            for (key, watermark) in store.entries() {
                if key.parse::<Stream>().is_err() {
                    println!("  {:<18} {} (unknown stream)", key, watermark);
                }
            }
        }
        Commands::Reset { stream } => {
            let targets = match stream {
                Some(name) => vec![name.parse::<Stream>()?],
                None => Stream::ALL.to_vec(),
            };
            let mut store = ProgressStore::open(&cfg.sync.state_path);
            for stream in targets {
                store.reset(stream.key())?;
                println!("reset {}", stream.key());
            }
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
