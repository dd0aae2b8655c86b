//! # Librarian CLI (`librarian`)
//!
//! ## Usage
//!
//! ```bash
//! librarian --config ./config/librarian.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `librarian serve` | Load the index and start the HTTP server |
//! | `librarian fetch` | Run one acquisition attempt and report the status |
//! | `librarian query "<text>"` | Load the index and answer one query |
//! | `librarian pack <dir> <out>` | Pack an index directory into an archive |
//!
//! Logging goes to stderr. `RUST_LOG` overrides `[server].log_level`.

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use librarian::archive;
use librarian::config::{self, Config};
use librarian::lifecycle::IndexStatus;
use librarian::pipeline::ContextQuery;
use librarian::server;
use librarian::service::LibrarianService;

/// Librarian: serves codebase context from a hot-swappable vector index.
#[derive(Parser)]
#[command(name = "librarian", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/librarian.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the index and serve HTTP on `[server].bind`.
    ///
    /// The server starts even when the initial load fails; queries answer
    /// 503 until an index is active.
    Serve,

    /// Run one acquisition attempt and print the resulting status.
    ///
    /// Exits non-zero unless the index ends up LOADED.
    Fetch,

    /// Load the index and answer a single query, printing JSON.
    Query {
        /// Query text.
        query: String,

        /// Maximum number of results.
        #[arg(long)]
        max_results: Option<usize>,

        /// Force reranking on.
        #[arg(long, conflicts_with = "no_rerank")]
        rerank: bool,

        /// Force reranking off.
        #[arg(long)]
        no_rerank: bool,
    },

    /// Pack an unpacked index directory (manifest.json + index.sqlite)
    /// into a ZIP archive and print its sha256.
    Pack {
        /// Directory to pack.
        dir: PathBuf,

        /// Output archive path.
        out: PathBuf,
    },
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Packing needs no config.
    if let Commands::Pack { dir, out } = &cli.command {
        init_tracing("info");
        let entries = archive::pack_dir(dir, out)?;
        let digest = archive::sha256_file(out)?;
        println!("{}  {}", digest, out.display());
        info!(entries, archive = %out.display(), "Archive written");
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;
    init_tracing(&cfg.server.log_level);

    match cli.command {
        Commands::Serve => serve(cfg).await?,
        Commands::Fetch => {
            let service = LibrarianService::build(&cfg).await?;
            let status = service.start().await;
            let report = service.health();
            println!("{}", serde_json::to_string_pretty(&report)?);
            service.shutdown().await;
            if status != IndexStatus::Loaded {
                bail!("index status: {}", status);
            }
        }
        Commands::Query {
            query,
            max_results,
            rerank,
            no_rerank,
        } => {
            let service = LibrarianService::build(&cfg).await?;
            let status = service.start().await;
            if status != IndexStatus::Loaded {
                service.shutdown().await;
                bail!("index not available (status: {})", status);
            }

            let mut request = ContextQuery::new(query);
            if let Some(n) = max_results {
                request = request.with_max_results(n);
            }
            if rerank {
                request = request.with_rerank(true);
            } else if no_rerank {
                request = request.with_rerank(false);
            }

            let answer = service.answer(&request).await;
            service.shutdown().await;
            println!("{}", serde_json::to_string_pretty(&answer?)?);
        }
        Commands::Pack { .. } => {}
    }

    Ok(())
}

async fn serve(cfg: Config) -> Result<()> {
    let service = Arc::new(LibrarianService::build(&cfg).await?);

    // Serve while the initial load runs; queries get 503 until it lands.
    let starter = {
        let service = service.clone();
        tokio::spawn(async move {
            service.start().await;
        })
    };

    let result = server::run_server(service.clone(), &cfg.server.bind).await;

    starter.abort();
    service.shutdown().await;
    result
}
