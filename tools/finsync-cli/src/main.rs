//! Operator tool for the FinSync offline store.
//!
//! Inspects and drains the on-disk store the worker writes to.
//!
//! ## Usage
//!
//! ```bash
//! # Show requests waiting for replay
//! finsync queue list
//!
//! # Replay them against a staging API
//! finsync queue replay --origin https://staging.example.com
//!
//! # Last good payload for an API path
//! finsync snapshot show /api/accounts
//!
//! # Effective configuration
//! finsync --config worker.json config dump
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use finsync_common::{init_logging, LogConfig, LogFormat, WorkerConfig};
use finsync_net::{Fetcher, HttpFetcher, LoaderConfig, NetError, Request, Response};
use finsync_store::LocalDatabase;
use finsync_worker::{SyncManager, SyncQueueProcessor};
use tracing::info;
use url::Url;

#[derive(Parser)]
#[command(name = "finsync")]
#[command(about = "Inspect and replay the FinSync offline store")]
struct Cli {
    /// Worker configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Database file, overriding the configured path
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Log format: pretty, compact or json
    #[arg(long, default_value = "compact", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Offline request queue
    Queue {
        #[command(subcommand)]
        command: QueueCommand,
    },

    /// Stored API payloads
    Snapshot {
        #[command(subcommand)]
        command: SnapshotCommand,
    },

    /// Worker configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand)]
enum QueueCommand {
    /// List queued requests, oldest first
    List {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Replay every queued request once
    Replay {
        /// Send to this origin instead of the recorded one
        #[arg(long)]
        origin: Option<Url>,
    },
}

#[derive(Subcommand)]
enum SnapshotCommand {
    /// List stored API paths
    List,
    /// Print the payload stored for an API path
    Show {
        /// API path, e.g. /api/accounts
        path: String,
    },
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Print the effective configuration as JSON
    Dump,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(LogConfig::from_verbosity(cli.verbose).with_format(cli.log_format));

    let mut config = match &cli.config {
        Some(path) => WorkerConfig::from_file(path)?,
        None => WorkerConfig::default(),
    };
    if let Some(db) = cli.db {
        config.database.path = db;
    }

    match cli.command {
        Commands::Queue { command } => {
            let database = open_database(&config)?;
            match command {
                QueueCommand::List { json } => list_queue(&database, json).await?,
                QueueCommand::Replay { origin } => replay_queue(&config, database, origin).await?,
            }
        }

        Commands::Snapshot { command } => {
            let database = open_database(&config)?;
            let store = database.open().await?;
            match command {
                SnapshotCommand::List => {
                    for record in store.snapshots().await? {
                        println!("{}  {}", format_millis(record.timestamp), record.id);
                    }
                }
                SnapshotCommand::Show { path } => match store.snapshot(&path).await? {
                    Some(record) => println!("{}", serde_json::to_string_pretty(&record.data)?),
                    None => {
                        eprintln!("No snapshot stored for {}", path);
                        std::process::exit(1);
                    }
                },
            }
        }

        Commands::Config {
            command: ConfigCommand::Dump,
        } => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

fn open_database(config: &WorkerConfig) -> Result<LocalDatabase, Box<dyn std::error::Error>> {
    if let Some(parent) = config.database.path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    info!(path = %config.database.path.display(), "Opening offline store");
    Ok(LocalDatabase::sqlite(
        &config.database.path,
        &config.database.name,
        config.database.version,
    )?)
}

async fn list_queue(database: &LocalDatabase, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let operations = database.open().await?.queued_operations().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&operations)?);
        return Ok(());
    }

    if operations.is_empty() {
        println!("Queue is empty");
        return Ok(());
    }

    for op in &operations {
        println!(
            "{:>6}  {}  {:<6} {}  ({} bytes)",
            op.id.map(|id| id.to_string()).unwrap_or_else(|| "-".to_string()),
            format_millis(op.timestamp),
            op.method,
            op.url,
            op.body.as_ref().map(|b| b.len()).unwrap_or(0)
        );
    }
    println!("{} queued", operations.len());
    Ok(())
}

async fn replay_queue(
    config: &WorkerConfig,
    database: LocalDatabase,
    origin: Option<Url>,
) -> Result<(), Box<dyn std::error::Error>> {
    let http: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new(LoaderConfig::default())?);
    let fetcher: Arc<dyn Fetcher> = match origin {
        Some(origin) => Arc::new(Rebased { inner: http, origin }),
        None => http,
    };

    let processor = SyncQueueProcessor::new(
        fetcher,
        database,
        Arc::new(SyncManager::default()),
        &config.sync_tag,
    );
    let report = processor.replay_all().await?;

    println!("Replay result:");
    println!("  Attempted: {}", report.attempted);
    println!("  Succeeded: {}", report.succeeded);
    println!("  Failed:    {}", report.failed);

    if !report.is_complete() {
        std::process::exit(1);
    }
    Ok(())
}

/// Sends every request to another origin, keeping path and query.
struct Rebased {
    inner: Arc<dyn Fetcher>,
    origin: Url,
}

#[async_trait]
impl Fetcher for Rebased {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        let mut rebased = request.clone();
        rebased.url = rebase(&request.url, &self.origin)?;
        self.inner.fetch(&rebased).await
    }
}

fn rebase(url: &Url, origin: &Url) -> Result<Url, NetError> {
    let mut target = origin.join(url.path()).map_err(|e| NetError::InvalidUrl(e.to_string()))?;
    target.set_query(url.query());
    Ok(target)
}

/// Milliseconds since the epoch as `seconds.millis`.
fn format_millis(millis: i64) -> String {
    format!("{}.{:03}", millis / 1000, millis.rem_euclid(1000))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rebase_keeps_path_and_query() {
        let url = Url::parse("http://localhost:3000/api/transactions?month=3").unwrap();
        let origin = Url::parse("https://staging.example.com").unwrap();
        assert_eq!(
            rebase(&url, &origin).unwrap().as_str(),
            "https://staging.example.com/api/transactions?month=3"
        );
    }

    #[test]
    fn test_cli_parses_replay() {
        let cli = Cli::try_parse_from([
            "finsync",
            "--db",
            "/tmp/offline.sqlite3",
            "queue",
            "replay",
            "--origin",
            "http://127.0.0.1:8080",
        ])
        .unwrap();
        assert_eq!(cli.db, Some(PathBuf::from("/tmp/offline.sqlite3")));
        match cli.command {
            Commands::Queue {
                command: QueueCommand::Replay { origin },
            } => assert_eq!(origin.unwrap().as_str(), "http://127.0.0.1:8080/"),
            _ => panic!("wrong command"),
        }
    }

    #[tokio::test]
    async fn test_open_database_creates_parent() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = WorkerConfig::default();
        config.database.path = dir.path().join("nested").join("offline.sqlite3");

        let database = open_database(&config).unwrap();
        assert_eq!(database.open().await.unwrap().queue_len().await.unwrap(), 0);
        assert!(config.database.path.exists());
    }
}
