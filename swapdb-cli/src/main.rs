//! # swapdb CLI
//!
//! Offline administration of a swapdb store: inspect, restore, checkpoint
//! and flush. Always opens with persistence on, so existing data is kept.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use swapdb_core::config::{LogFormat, LoggingConfig};
use swapdb_core::Config;
use swapdb_storage::SwapStore;

#[derive(Parser)]
#[command(name = "swapdb")]
#[command(version, about = "swapdb - epoch-rotating LSM store administration")]
struct Cli {
    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Base directory (overrides engine.base_dir)
    #[arg(long)]
    dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print store information
    Info,
    /// Read an engine property
    Property {
        name: String,
        /// Comma or space separated partition names (default: all)
        #[arg(long, default_value = "")]
        partitions: String,
        /// Print the sum instead of one line per partition
        #[arg(long)]
        sum: bool,
    },
    /// Replace the live engine with the one in SOURCE
    Restore { source: PathBuf },
    /// Write a checkpoint of the live engine to DEST
    Checkpoint { dest: PathBuf },
    /// Delete every key of one logical database, or of all of them
    Flush {
        #[arg(long)]
        db: Option<u32>,
    },
}

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match config.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::from_json_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(dir) = cli.dir {
        config.engine.base_dir = dir;
    }
    config.engine.persistence_enabled = true;
    init_logging(&config.logging);

    let mut store = SwapStore::open(config).context("opening store")?;
    let result = run(&mut store, cli.command);
    store.shutdown().context("closing store")?;
    result
}

fn run(store: &mut SwapStore, command: Commands) -> Result<()> {
    match command {
        Commands::Info => {
            // One tick so the stats report is populated
            store.cron();
            store.wait_for_tasks(Duration::from_secs(10));
            print!("{}", store.info());
        }
        Commands::Property {
            name,
            partitions,
            sum,
        } => {
            if sum {
                println!("{}", store.property_sum(&partitions, &name)?);
            } else {
                print!("{}", store.property_report(&partitions, &name)?);
            }
        }
        Commands::Restore { source } => {
            store
                .restore(&source)
                .with_context(|| format!("restoring from {}", source.display()))?;
            info!(epoch = store.epoch(), "Restore complete");
            println!("epoch:{}", store.epoch());
        }
        Commands::Checkpoint { dest } => {
            let handle = store.engine().acquire_read();
            let checkpoint = handle
                .engine()?
                .checkpoint(&dest)
                .with_context(|| format!("checkpoint into {}", dest.display()))?;
            println!("{}:{}", checkpoint.dir.display(), checkpoint.sequence);
        }
        Commands::Flush { db } => {
            let removed = store.flush_range(db)?;
            println!("removed:{}", removed);
        }
    }
    Ok(())
}
