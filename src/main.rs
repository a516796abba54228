// src/main.rs
//! distq command line
//!
//! `distq run` is what users invoke. `worker` and `discover` are the child
//! processes a master spawns for itself and are not meant to be typed.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use distq::collaborator::ManifestCollaborator;
use distq::observability::{init_metrics, init_tracing};
use distq::runner::{run_discover_process, run_worker_process, Runner};
use distq::utils::config::QueueConfig;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "distq")]
#[command(version)]
#[command(about = "Distribute grouped work items across worker processes and hosts")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run every item the given sources define
    Run(RunArgs),

    /// Pull items from a master until the queue is drained
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        num: usize,

        #[arg(long)]
        endpoint: String,
    },

    /// Enumerate sources and stream discovered groups to stdout
    #[command(hide = true)]
    Discover {
        #[arg(long)]
        loader: usize,

        sources: Vec<PathBuf>,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Manifest files to load work from
    #[arg(required = true)]
    sources: Vec<PathBuf>,

    /// Number of local workers; 0 runs everything in this process
    #[arg(short = 'j', long)]
    concurrency: Option<usize>,

    /// Listening endpoint (socket path or [host:]port)
    #[arg(long)]
    socket: Option<String>,

    /// Join the run served at this endpoint as a relay
    #[arg(long)]
    relay: Option<String>,

    /// Run token shared between the root master and its relays
    #[arg(long)]
    run_token: Option<String>,

    /// Only run these root keys, in this order (comma-separated)
    #[arg(long, value_delimiter = ',')]
    force: Vec<String>,

    /// Prefer items carrying this tag (name=value)
    #[arg(long)]
    preferred_tag: Option<String>,

    /// Enumerate every source before starting workers
    #[arg(long)]
    eager: bool,

    /// Echo all worker output
    #[arg(short, long)]
    verbose: bool,
}

impl RunArgs {
    fn apply(self, config: &mut QueueConfig) -> Vec<PathBuf> {
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
        if let Some(socket) = self.socket {
            config.socket = socket;
        }
        if self.relay.is_some() {
            config.relay = self.relay;
        }
        if self.run_token.is_some() {
            config.run_token = self.run_token;
        }
        if !self.force.is_empty() {
            config.force = self.force;
        }
        if self.preferred_tag.is_some() {
            config.preferred_tag = self.preferred_tag;
        }
        if self.eager {
            config.lazy_discovery = false;
        }
        config.verbose |= self.verbose;
        self.sources
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = QueueConfig::load().context("Failed to load configuration")?;
    let collaborator = ManifestCollaborator::new();

    let code = match cli.command {
        Commands::Run(args) => {
            let sources = args.apply(&mut config);
            init_tracing(config.verbose, config.json_logs)?;
            info!("Starting distq v{}", distq::VERSION);

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("Failed to start async runtime")?;

            let result = runtime.block_on(async {
                init_metrics(config.metrics_addr.as_deref())?;
                Runner::new(config, Arc::new(collaborator)).execute(&sources).await
            });
            result.map_err(|e| {
                error!("Run failed: {}", e);
                e
            })?
        }
        Commands::Worker { num, endpoint } => run_worker_process(&config, &collaborator, num, &endpoint)?,
        Commands::Discover { loader, sources } => run_discover_process(&config, &collaborator, loader, &sources)?,
    };

    std::process::exit(code);
}
