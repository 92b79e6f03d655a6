//! SheetGuard administration tool
//!
//! Inspects and maintains the state a SheetGuard deployment keeps in its
//! data directory. It never talks to the document store.
//!
//! # Usage
//!
//! ```bash
//! # Print the effective configuration
//! sheetguard-admin --config sheetguard.toml config show
//!
//! # Write a default configuration file
//! sheetguard-admin config init ./sheetguard.toml
//!
//! # List transactions, then expire the overdue ones
//! sheetguard-admin --data-dir /var/lib/sheetguard txn list
//! sheetguard-admin --data-dir /var/lib/sheetguard txn expire
//!
//! # Show a document's history and snapshots
//! sheetguard-admin -d /var/lib/sheetguard history list S1
//! sheetguard-admin -d /var/lib/sheetguard snapshots list S1
//! ```

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use sheetguard_common::clock::{Clock, SystemClock};
use sheetguard_common::config::GuardConfig;
use sheetguard_common::constants::CONFIG_FILE_NAME;
use sheetguard_common::types::DocumentId;
use sheetguard_core::history::load_history;
use sheetguard_core::store::{load_records, FileStore, RecordKind};
use sheetguard_core::txn::{expire_stored, Transaction, TxnState};
use sheetguard_core::Snapshot;

/// SheetGuard administration tool
#[derive(Parser, Debug)]
#[command(
    name = "sheetguard-admin",
    author = "SheetGuard Team",
    version,
    about = "Inspect and maintain SheetGuard state"
)]
struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, value_name = "FILE", env = "SHEETGUARD_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory (overrides the configuration)
    #[arg(short = 'd', long, value_name = "DIR", env = "SHEETGUARD_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Print records as JSON
    #[arg(long)]
    json: bool,

    /// Enable verbose logging
    #[arg(short = 'v', long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Configuration
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Transactions
    #[command(subcommand)]
    Txn(TxnCommand),
    /// History logs
    #[command(subcommand)]
    History(HistoryCommand),
    /// Snapshot index
    #[command(subcommand)]
    Snapshots(SnapshotCommand),
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Print the effective configuration
    Show,
    /// Write a default configuration file
    Init {
        /// Output path
        #[arg(default_value = CONFIG_FILE_NAME)]
        path: PathBuf,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand, Debug)]
enum TxnCommand {
    /// List transactions
    List {
        /// Only this document
        #[arg(long)]
        document: Option<String>,
        /// Only pending and committing transactions
        #[arg(long)]
        active: bool,
    },
    /// Expire pending transactions idle past their TTL
    Expire,
}

#[derive(Subcommand, Debug)]
enum HistoryCommand {
    /// List a document's history
    List {
        /// Document id
        document: String,
    },
}

#[derive(Subcommand, Debug)]
enum SnapshotCommand {
    /// List a document's snapshots
    List {
        /// Document id
        document: String,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = load_config(&args)?;
    match &args.command {
        Command::Config(ConfigCommand::Show) => {
            print!("{}", config.to_toml()?);
        }
        Command::Config(ConfigCommand::Init { path, force }) => {
            init_config(path, *force)?;
        }
        Command::Txn(TxnCommand::List { document, active }) => {
            let store = open_store(&config)?;
            let mut txns: Vec<Transaction> = load_records(&store, RecordKind::Transaction)?;
            txns.retain(|t| document.as_deref().map_or(true, |d| t.document_id.as_str() == d));
            if *active {
                txns.retain(|t| !t.state.is_terminal());
            }
            txns.sort_by_key(|t| t.id);
            if args.json {
                println!("{}", serde_json::to_string_pretty(&txns)?);
            } else {
                println!("{:<10} {:<16} {:<12} {:>5}  EXPIRES", "ID", "DOCUMENT", "STATE", "OPS");
                for t in &txns {
                    println!(
                        "{:<10} {:<16} {:<12} {:>5}  {}",
                        t.id.to_string(),
                        t.document_id.as_str(),
                        t.state.to_string(),
                        t.queued_ops.len(),
                        t.expires_at
                    );
                }
            }
        }
        Command::Txn(TxnCommand::Expire) => {
            let store = open_store(&config)?;
            let expired = expire_stored(&store, SystemClock.now())?;
            info!(count = expired.len(), "expired idle transactions");
            for id in &expired {
                println!("{id} {}", TxnState::Expired);
            }
        }
        Command::History(HistoryCommand::List { document }) => {
            let store = open_store(&config)?;
            let entries = load_history(&store, &DocumentId::new(document.as_str()))?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                println!("{:<10} {:<14} {:<11} {:<8} {:<10} SNAPSHOT", "OP", "ACTION", "STATUS", "BEFORE", "TXN");
                for e in &entries {
                    println!(
                        "{:<10} {:<14} {:<11} {:<8} {:<10} {}",
                        e.op_id.to_string(),
                        e.operation.action,
                        e.status.to_string(),
                        e.version_before.to_string(),
                        e.txn.map_or_else(|| "-".to_string(), |t| t.to_string()),
                        e.snapshot_before.map_or_else(|| "-".to_string(), |s| s.to_string()),
                    );
                }
            }
        }
        Command::Snapshots(SnapshotCommand::List { document }) => {
            let store = open_store(&config)?;
            let mut snapshots: Vec<Snapshot> = load_records(&store, RecordKind::Snapshot)?;
            snapshots.retain(|s| s.document_id.as_str() == document);
            snapshots.sort_by_key(|s| s.id);
            if args.json {
                println!("{}", serde_json::to_string_pretty(&snapshots)?);
            } else {
                println!("{:<10} {:<10} {:<6} {:<16} NAME", "ID", "VERSION", "AUTO", "CREATED");
                for s in &snapshots {
                    println!(
                        "{:<10} {:<10} {:<6} {:<16} {}",
                        s.id.to_string(),
                        s.fingerprint_at_creation.version.to_string(),
                        s.automatic,
                        s.created_at.to_string(),
                        s.name.as_deref().unwrap_or("-"),
                    );
                }
            }
        }
    }
    Ok(())
}

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_env("SHEETGUARD_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "warn" }));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(args: &Args) -> Result<GuardConfig> {
    let mut config = match &args.config {
        Some(path) => GuardConfig::from_file(path)
            .with_context(|| format!("failed to load config file {}", path.display()))?,
        None => GuardConfig::default(),
    };
    if let Some(dir) = &args.data_dir {
        config.data_dir = Some(dir.clone());
    }
    config.validate().context("invalid configuration")?;
    debug!(?config, "configuration loaded");
    Ok(config)
}

fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    GuardConfig::default()
        .save(path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    println!("wrote {}", path.display());
    Ok(())
}

fn open_store(config: &GuardConfig) -> Result<FileStore> {
    let Some(dir) = &config.data_dir else {
        bail!("no data directory configured (pass --data-dir or set data_dir)");
    };
    if !dir.is_dir() {
        bail!("data directory {} does not exist", dir.display());
    }
    FileStore::open(dir).with_context(|| format!("failed to open store at {}", dir.display()))
}
