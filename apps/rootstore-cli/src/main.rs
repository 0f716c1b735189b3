use anyhow::Context;
use clap::{Parser, Subcommand};
use rootstore_persist::{Codec, FileStorage, KEY_PREFIX, StorageBackend};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod demo;

#[derive(Parser)]
#[command(name = "rootstore-cli", about = "CLI tool for rootstore operations")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a demo store: persisted partitions plus a lazily injected one
    Demo {
        /// Directory holding persisted partitions
        #[arg(short, long, default_value = "rootstore-data")]
        dir: PathBuf,
        /// YAML file describing which partitions persist and how
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Number of counter increments to dispatch
        #[arg(short, long, default_value = "3")]
        events: u32,
    },
    /// List persisted records and verify their envelopes
    Inspect {
        #[arg(short, long, default_value = "rootstore-data")]
        dir: PathBuf,
    },
    /// Remove a persisted record
    Purge {
        #[arg(short, long, default_value = "rootstore-data")]
        dir: PathBuf,
        /// Storage key, with or without the "persist:" prefix
        #[arg(short, long)]
        key: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match cli.command {
        Commands::Demo {
            dir,
            config,
            events,
        } => {
            let config = match config {
                Some(path) => demo::DemoConfig::load(&path)?,
                None => demo::DemoConfig::default(),
            };
            let state = demo::run(&dir, &config, events).await?;
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
        Commands::Inspect { dir } => {
            let storage = FileStorage::open(&dir)
                .with_context(|| format!("opening {}", dir.display()))?;
            let keys = storage.keys().await?;
            if keys.is_empty() {
                println!("no persisted records in {}", dir.display());
            }
            for key in keys {
                let Some(bytes) = storage.read(&key).await? else {
                    continue;
                };
                let codec = Codec::detect(&bytes);
                match codec.decode(&bytes) {
                    Ok(envelope) => println!(
                        "{key}: codec={codec:?} version={} bytes={} valid=true state={}",
                        envelope.version,
                        bytes.len(),
                        envelope.state
                    ),
                    Err(e) => println!("{key}: codec={codec:?} bytes={} valid=false error={e}", bytes.len()),
                }
            }
        }
        Commands::Purge { dir, key } => {
            let storage = FileStorage::open(&dir)
                .with_context(|| format!("opening {}", dir.display()))?;
            let key = if key.starts_with(KEY_PREFIX) {
                key
            } else {
                format!("{KEY_PREFIX}{key}")
            };
            storage.remove(&key).await?;
            println!("purged {key}");
        }
    }

    Ok(())
}
