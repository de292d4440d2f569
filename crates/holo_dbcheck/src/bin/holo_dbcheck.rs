//! Command-line driver: run dbCheck against a JSON catalog fixture, or dump
//! a file-backed replicated log.

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::{json, Map, Value};

use holo_dbcheck::{
    CatalogFixture, DbCheckCommand, DbCheckConfig, FileOpLog, LockManager, MemoryCatalog,
    MemoryOpLog, OpLog, ReplicaSetMember, ServiceContext, TracingHealthLog, UserContext,
};

#[derive(Parser)]
#[command(name = "holo-dbcheck")]
#[command(about = "Replica consistency check for HoloStore collections", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load a catalog fixture, run dbCheck on it and print the replicated entries.
    Run {
        /// JSON catalog fixture (`{"databases": {"<db>": [collections...]}}`).
        #[arg(long)]
        fixture: PathBuf,
        /// Database to check.
        #[arg(long)]
        db: String,
        /// Check a single collection (name or UUID) instead of the whole database.
        #[arg(long)]
        collection: Option<String>,
        /// First key, exclusive. JSON (`5`, `"k"`, `{"$minKey":1}`) or bare text.
        #[arg(long)]
        min_key: Option<String>,
        /// Last key, inclusive.
        #[arg(long)]
        max_key: Option<String>,
        #[arg(long)]
        max_count: Option<u64>,
        #[arg(long)]
        max_size: Option<u64>,
        /// Append to a file-backed log in this directory instead of memory.
        #[arg(long, env = "HOLO_DBCHECK_OPLOG_DIR")]
        oplog_dir: Option<PathBuf>,
        /// Per-batch document ceiling.
        #[arg(long, env = "HOLO_DBCHECK_BATCH_DOCS")]
        batch_docs: Option<u64>,
        /// Per-batch byte ceiling.
        #[arg(long, env = "HOLO_DBCHECK_BATCH_BYTES")]
        batch_bytes: Option<u64>,
    },
    /// Print every entry of a file-backed log.
    Dump {
        #[arg(long, env = "HOLO_DBCHECK_OPLOG_DIR")]
        oplog_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();
    match args.command {
        Command::Run {
            fixture,
            db,
            collection,
            min_key,
            max_key,
            max_count,
            max_size,
            oplog_dir,
            batch_docs,
            batch_bytes,
        } => {
            let mut config = DbCheckConfig::from_env();
            if let Some(docs) = batch_docs {
                config.batch_docs = docs;
            }
            if let Some(bytes) = batch_bytes {
                config.batch_bytes = bytes;
            }
            let cmd = build_command(collection, min_key, max_key, max_count, max_size);
            run_check(&fixture, &db, cmd, oplog_dir, config).await
        }
        Command::Dump { oplog_dir } => dump(&oplog_dir),
    }
}

fn init_tracing() {
    let ansi = std::io::stderr().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();
}

fn build_command(
    collection: Option<String>,
    min_key: Option<String>,
    max_key: Option<String>,
    max_count: Option<u64>,
    max_size: Option<u64>,
) -> Value {
    let Some(collection) = collection else {
        return json!({ "dbCheck": 1 });
    };
    let mut cmd = Map::new();
    cmd.insert("dbCheck".into(), Value::String(collection));
    if let Some(key) = min_key {
        cmd.insert("minKey".into(), key_arg(&key));
    }
    if let Some(key) = max_key {
        cmd.insert("maxKey".into(), key_arg(&key));
    }
    if let Some(count) = max_count {
        cmd.insert("maxCount".into(), json!(count));
    }
    if let Some(size) = max_size {
        cmd.insert("maxSize".into(), json!(size));
    }
    Value::Object(cmd)
}

fn key_arg(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

async fn run_check(
    fixture: &Path,
    db: &str,
    cmd: Value,
    oplog_dir: Option<PathBuf>,
    config: DbCheckConfig,
) -> anyhow::Result<()> {
    let raw = std::fs::read(fixture)
        .with_context(|| format!("read fixture {}", fixture.display()))?;
    let fixture: CatalogFixture =
        serde_json::from_slice(&raw).context("parse catalog fixture")?;
    let catalog = MemoryCatalog::from_fixture(&fixture).context("load catalog fixture")?;

    let oplog: Arc<dyn OpLog> = match oplog_dir {
        Some(dir) => Arc::new(FileOpLog::open_dir(&dir)?),
        None => Arc::new(MemoryOpLog::new()),
    };
    let locks = LockManager::new();
    let member = Arc::new(ReplicaSetMember::primary(locks.clone()));
    let service = ServiceContext::new(
        Arc::new(catalog),
        locks,
        oplog.clone(),
        member,
        Arc::new(TracingHealthLog),
    )
    .with_config(config);

    let command = DbCheckCommand::new(service);
    let (reply, handle) = command.launch(db, &cmd, &UserContext::default()).await;
    println!("{}", serde_json::to_string(&reply)?);
    let Some(handle) = handle else {
        anyhow::bail!(
            "dbCheck rejected: {}",
            reply.errmsg.unwrap_or_else(|| "unknown error".to_string())
        );
    };
    let report = handle
        .wait()
        .await
        .map_err(|err| anyhow::anyhow!("dbCheck job failed: {err}"))?;

    for entry in oplog.entries()? {
        println!("{}", serde_json::to_string(&entry)?);
    }
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn dump(dir: &Path) -> anyhow::Result<()> {
    let oplog = FileOpLog::open_dir(dir)?;
    for entry in oplog.entries()? {
        println!("{}", serde_json::to_string(&entry)?);
    }
    Ok(())
}
