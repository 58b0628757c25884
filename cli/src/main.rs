//! shipindex CLI — replay state-history captures through the indexer.
//!
//! Usage:
//! ```bash
//! shipindex replay capture.jsonl --db index.sqlite --contract atomicassets
//! shipindex replay capture.jsonl --config shipindex.json
//! shipindex info
//! ```

mod logging;
mod stream;

use std::env;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use shipindex_atomicassets::{AtomicAssetsConfig, AtomicAssetsHandler, SQLITE_MIGRATIONS};
use shipindex_core::{BlockStore, IndexerBuilder, IndexerConfig, SchemaRegistry};
use shipindex_storage::{InMemoryStorage, SqliteStorage};

use crate::logging::{init_tracing, LogConfig};
use crate::stream::JsonLinesStream;

/// Contents of the `--config` file. Every section is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct CliConfig {
    indexer: IndexerConfig,
    atomicassets: AtomicAssetsConfig,
    log: LogConfig,
}

#[derive(Debug, Default, PartialEq)]
struct ReplayArgs {
    capture: PathBuf,
    db: Option<String>,
    config: Option<PathBuf>,
    contract: Option<String>,
}

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    match args[1].as_str() {
        "info" => cmd_info(),
        "replay" => {
            if let Err(e) = parse_replay(&args[2..]).and_then(cmd_replay) {
                eprintln!("error: {e:#}");
                process::exit(1);
            }
        }
        "version" | "--version" | "-V" => {
            println!("shipindex {}", env!("CARGO_PKG_VERSION"));
        }
        "help" | "--help" | "-h" => print_usage(),
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    }
}

fn print_usage() {
    println!("shipindex {}", env!("CARGO_PKG_VERSION"));
    println!("Fork-aware state-history indexer for AtomicAssets\n");
    println!("USAGE:");
    println!("    shipindex <COMMAND>\n");
    println!("COMMANDS:");
    println!("    replay <capture.jsonl> [--db <path>] [--config <file>] [--contract <account>]");
    println!("             Apply a JSON-lines stream capture");
    println!("    info     Show default configuration");
    println!("    version  Print version");
    println!("    help     Print this help");
}

fn cmd_info() {
    let config = IndexerConfig::default();
    println!("shipindex v{}", env!("CARGO_PKG_VERSION"));
    println!("  Default reader: {}", config.reader);
    println!("  Default block retries: {} (backoff {} ms)", config.max_block_retries, config.retry_backoff_ms);
    println!("  Fork detection window: {} blocks", config.tracker_window);
    println!("  Default contract: {}", AtomicAssetsConfig::default().contract);
    println!("  Storage backends: memory, SQLite (--db)");
}

fn parse_replay(args: &[String]) -> Result<ReplayArgs> {
    let mut parsed = ReplayArgs::default();
    let mut capture = None;
    let mut iter = args.iter();

    while let Some(arg) = iter.next() {
        let mut value = |flag: &str| {
            iter.next()
                .cloned()
                .with_context(|| format!("{flag} needs a value"))
        };
        match arg.as_str() {
            "--db" => parsed.db = Some(value("--db")?),
            "--config" => parsed.config = Some(PathBuf::from(value("--config")?)),
            "--contract" => parsed.contract = Some(value("--contract")?),
            flag if flag.starts_with("--") => bail!("unknown option {flag}"),
            path if capture.is_none() => capture = Some(PathBuf::from(path)),
            extra => bail!("unexpected argument {extra}"),
        }
    }

    parsed.capture = capture.context("missing capture file")?;
    Ok(parsed)
}

fn load_config(args: &ReplayArgs) -> Result<CliConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str::<CliConfig>(&raw)
                .with_context(|| format!("parsing {}", path.display()))?
        }
        None => CliConfig::default(),
    };
    if let Some(contract) = &args.contract {
        config.atomicassets.contract = contract.clone();
    }
    config.indexer.validate()?;
    Ok(config)
}

fn cmd_replay(args: ReplayArgs) -> Result<()> {
    let config = load_config(&args)?;
    init_tracing(&config.log);

    let runtime = tokio::runtime::Runtime::new().context("starting tokio runtime")?;
    runtime.block_on(replay(args, config))
}

async fn replay(args: ReplayArgs, config: CliConfig) -> Result<()> {
    let reader = config.indexer.reader.clone();
    let store: Arc<dyn BlockStore> = match &args.db {
        Some(path) => {
            let store = SqliteStorage::open(path).await?.with_reader(reader);
            store.run_migrations(SQLITE_MIGRATIONS).await?;
            tracing::info!(db = %path, "SQLite store ready");
            Arc::new(store)
        }
        None => {
            tracing::info!("No --db given, indexing into memory");
            Arc::new(InMemoryStorage::new(reader))
        }
    };

    let registry = Arc::new(SchemaRegistry::new());
    let handler = AtomicAssetsHandler::new(config.atomicassets.clone(), registry.clone());
    let mut sequencer = IndexerBuilder::new()
        .config(config.indexer)
        .store(store.clone())
        .handler(Arc::new(handler))
        .registry(registry)
        .build()?;

    let next = sequencer.resume().await?;
    tracing::info!(next, capture = %args.capture.display(), "Replaying capture");

    let mut stream = JsonLinesStream::open(&args.capture).await?;
    let stats = sequencer.run(&mut stream).await?;

    let checkpoint = store.load_checkpoint().await?;
    println!("blocks applied:      {}", stats.blocks_applied);
    println!("duplicates skipped:  {}", stats.duplicates_skipped);
    println!("rollbacks:           {}", stats.rollbacks);
    println!("retries:             {}", stats.retries);
    println!("notifications:       {}", stats.notifications);
    match checkpoint {
        Some(cp) => println!(
            "head:                {} (irreversible {})",
            cp.head_block.map_or_else(|| "-".to_string(), |n| n.to_string()),
            cp.irreversible_block
        ),
        None => println!("head:                -"),
    }
    Ok(())
}
