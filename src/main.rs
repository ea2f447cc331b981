//! rollupdb CLI - Command line interface for rollup_db
//!
//! Every invocation opens the database file, runs one command and writes
//! the state back. Proving uses the mock prover and settlement the local
//! chain, whose state lives in the same file.

use anyhow::Context;
use clap::{Parser, Subcommand};
use rollup_db::store::{open_backend, Backend, Blob, BlobType};
use rollup_db::{
    chain::LocalChainState, ActionKind, BackendConfig, CollectionStatus, Config, Database,
    LocalChain, MockProver, PoolOptions, RollupOutcome, RollupPhase, RollupRecord, TaskId,
    WorkerPool,
};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

const CHAIN_KEY: &str = "__chain__/state";
const DEFAULT_DATABASE: &str = "rollup.db";

#[derive(Parser)]
#[command(name = "rollupdb")]
#[command(about = "A Merkle-committed document database with rollup settlement")]
#[command(version)]
struct Cli {
    /// Path to the database file [default: rollup.db]
    #[arg(short, long)]
    database: Option<PathBuf>,

    /// Path to a JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output format (json or text)
    #[arg(short, long, default_value = "json")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    Json,
    Text,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
enum PutKind {
    Insert,
    Update,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new database
    Init,

    // === Collection Commands ===
    /// Create a collection
    Create {
        collection: String,
        /// Tree height (leaf slots = 2^height)
        #[arg(long)]
        height: Option<u8>,
    },

    /// Drop a collection and its state
    Drop { collection: String },

    // === Document Commands ===
    /// Store a document at a leaf index
    Put {
        collection: String,
        index: u64,
        payload: String,
        #[arg(short, long, default_value = "insert")]
        kind: PutKind,
    },

    /// Delete the document at a leaf index
    Delete { collection: String, index: u64 },

    /// Read the document at a leaf index
    Get { collection: String, index: u64 },

    /// Show the current root of a collection
    Root { collection: String },

    /// Show the Merkle witness of a leaf
    Witness { collection: String, index: u64 },

    // === Pipeline Commands ===
    /// Prove every queued task
    Prove { collection: String },

    /// Run one rollup step against the local chain
    Rollup {
        collection: String,
        /// Settle the chain right away and reconcile the result
        #[arg(long)]
        settle: bool,
    },

    /// Show collection status
    Status { collection: Option<String> },

    /// Re-queue a failed task
    Retry { collection: String, task: u64 },

    /// Prove and settle every collection with a worker pool
    Run {
        /// Give up after this many seconds
        #[arg(long, default_value = "30")]
        timeout: u64,
        /// Rollup step interval in milliseconds
        #[arg(long, default_value = "20")]
        interval: u64,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let backend = open_backend(&config)?;
    let chain = Arc::new(load_chain(backend.as_ref())?);
    let db = Arc::new(Database::with_backend(
        config,
        backend,
        Arc::new(MockProver::new()),
        chain.clone(),
    )?);

    // Chain state is written back even when the command fails: a
    // submission may have reached it before the error
    let result = run(&cli, &db, &chain);

    let state = Blob::encode(BlobType::Chain, &chain.snapshot())?;
    db.backend().put(CHAIN_KEY, &state)?;
    db.sync()?;

    output(&cli.format, &result?)
}

fn run(cli: &Cli, db: &Arc<Database>, chain: &LocalChain) -> anyhow::Result<Value> {
    let value = match &cli.command {
        Commands::Init => {
            let quarantined: Vec<_> = db
                .quarantined()
                .into_iter()
                .map(|(name, reason)| json!({"collection": name, "reason": reason}))
                .collect();
            json!({
                "status": "ok",
                "collections": db.collections(),
                "quarantined": quarantined,
            })
        }

        Commands::Create { collection, height } => {
            let created = db.create_collection(collection, *height)?;
            json!({
                "status": "ok",
                "collection": created.name(),
                "height": created.height(),
                "root": created.root().to_hex(),
            })
        }

        Commands::Drop { collection } => {
            db.drop_collection(collection)?;
            json!({"status": "ok", "collection": collection})
        }

        Commands::Put {
            collection,
            index,
            payload,
            kind,
        } => {
            let kind = match kind {
                PutKind::Insert => ActionKind::Insert,
                PutKind::Update => ActionKind::Update,
            };
            let task = db.mutate(collection, *index, kind, payload.as_bytes())?;
            json!({
                "status": "ok",
                "sequence": task.sequence(),
                "task": task.id.0,
                "kind": kind.as_str(),
                "root": task.witness.new_root.to_hex(),
            })
        }

        Commands::Delete { collection, index } => {
            let task = db.delete(collection, *index)?;
            json!({
                "status": "ok",
                "sequence": task.sequence(),
                "task": task.id.0,
                "root": task.witness.new_root.to_hex(),
            })
        }

        Commands::Get { collection, index } => {
            let document = db.get(collection, *index)?;
            json!({
                "collection": collection,
                "index": index,
                "document": document.map(|d| String::from_utf8_lossy(&d).into_owned()),
            })
        }

        Commands::Root { collection } => {
            json!({"collection": collection, "root": db.root(collection)?.to_hex()})
        }

        Commands::Witness { collection, index } => {
            let (leaf, witness) = db.witness(collection, *index)?;
            let root = db.root(collection)?;
            let path: Vec<_> = witness
                .path
                .iter()
                .map(|step| json!({"sibling": step.sibling.to_hex(), "is_left": step.is_left}))
                .collect();
            json!({
                "collection": collection,
                "index": index,
                "leaf": leaf.to_hex(),
                "root": root.to_hex(),
                "valid": rollup_db::verify_witness(&root, &leaf, &witness),
                "path": path,
            })
        }

        Commands::Prove { collection } => {
            let handled = db.prove_pending(collection)?;
            let counts = db.collection(collection)?.queue().counts();
            json!({
                "collection": collection,
                "handled": handled,
                "proved": counts.proved,
                "queued": counts.queued,
                "failed": counts.failed,
            })
        }

        Commands::Rollup { collection, settle } => {
            let mut outcomes = vec![outcome_json(&db.rollup_step(collection)?)];
            if *settle {
                chain.settle();
                outcomes.push(outcome_json(&db.rollup_step(collection)?));
            }
            json!({
                "collection": collection,
                "outcomes": outcomes,
                "status": status_json(&db.status(collection)?),
            })
        }

        Commands::Status { collection } => match collection {
            Some(name) => status_json(&db.status(name)?),
            None => {
                let collections: Vec<_> = db.statuses().iter().map(status_json).collect();
                let quarantined: Vec<_> = db
                    .quarantined()
                    .into_iter()
                    .map(|(name, reason)| json!({"collection": name, "reason": reason}))
                    .collect();
                json!({"collections": collections, "quarantined": quarantined})
            }
        },

        Commands::Retry { collection, task } => {
            db.retry_task(collection, TaskId(*task))?;
            json!({"status": "ok", "collection": collection, "task": task})
        }

        Commands::Run { timeout, interval } => {
            let interval = Duration::from_millis(*interval);
            let pool = WorkerPool::start(
                db.clone(),
                PoolOptions::from(db.config()).with_rollups(interval),
            );
            let deadline = Instant::now() + Duration::from_secs(*timeout);
            let settled = loop {
                chain.settle();
                if db.statuses().iter().all(is_settled) {
                    break true;
                }
                if Instant::now() >= deadline {
                    break false;
                }
                thread::sleep(interval);
            };
            pool.shutdown();

            let collections: Vec<_> = db.statuses().iter().map(status_json).collect();
            json!({
                "status": if settled { "ok" } else { "timeout" },
                "settled": settled,
                "collections": collections,
            })
        }
    };
    Ok(value)
}

/// Config file, then environment, then command-line flags
fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let path = match &cli.config {
        Some(path) => Some(path.clone()),
        None => Config::default_path().ok(),
    };
    let mut config = match path {
        Some(path) => Config::load(&path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    }
    .with_env()?;

    if let Some(database) = &cli.database {
        config.backend = BackendConfig::File {
            path: database.clone(),
        };
    } else if config.backend == BackendConfig::Memory {
        config.backend = BackendConfig::File {
            path: PathBuf::from(DEFAULT_DATABASE),
        };
    }
    config.validate()?;
    Ok(config)
}

fn load_chain(backend: &dyn Backend) -> anyhow::Result<LocalChain> {
    let state = match backend.get(CHAIN_KEY)? {
        Some(blob) => blob.decode::<LocalChainState>(BlobType::Chain)?,
        None => LocalChainState::default(),
    };
    Ok(LocalChain::from_state(state, false))
}

/// Nothing left to prove or settle, or blocked until an operator acts
fn is_settled(status: &CollectionStatus) -> bool {
    let drained = status.pending_action_count == 0 && status.phase == RollupPhase::Idle;
    drained || status.blocked_reason.is_some()
}

fn record_json(record: &RollupRecord) -> Value {
    json!({
        "id": record.id,
        "status": record.status.as_str(),
        "first_sequence": record.first_sequence,
        "last_sequence": record.last_sequence,
        "previous_root": record.previous_root.to_hex(),
        "new_root": record.new_root.to_hex(),
        "previous_action_state": record.previous_action_state.to_hex(),
        "new_action_state": record.new_action_state.to_hex(),
        "rejection": record.rejection,
    })
}

fn outcome_json(outcome: &RollupOutcome) -> Value {
    match outcome {
        RollupOutcome::Idle => json!({"outcome": "idle"}),
        RollupOutcome::BackingOff { until } => json!({"outcome": "backing_off", "until": until}),
        RollupOutcome::Submitted(r) => json!({"outcome": "submitted", "record": record_json(r)}),
        RollupOutcome::Waiting(r) => json!({"outcome": "waiting", "record": record_json(r)}),
        RollupOutcome::Confirmed(r) => json!({"outcome": "confirmed", "record": record_json(r)}),
        RollupOutcome::Repaired {
            checkpoint,
            resubmitted,
        } => json!({
            "outcome": "repaired",
            "checkpoint": checkpoint.sequence,
            "resubmitted": resubmitted.as_ref().map(record_json),
        }),
    }
}

fn status_json(status: &CollectionStatus) -> Value {
    json!({
        "collection": status.name,
        "height": status.height,
        "current_root": status.current_root.to_hex(),
        "confirmed_root": status.confirmed_root.to_hex(),
        "confirmed_action_state": status.confirmed_action_state.to_hex(),
        "pending_action_count": status.pending_action_count,
        "oldest_pending_task": status.oldest_pending_task.map(|t| t.0),
        "failed_task_count": status.failed_task_count,
        "last_rollup_status": status.last_rollup_status.map(|s| s.as_str()),
        "phase": status.phase.as_str(),
        "blocked_reason": status.blocked_reason,
    })
}

fn output(format: &OutputFormat, value: &Value) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string(value)?),
        OutputFormat::Text => println!("{}", serde_json::to_string_pretty(value)?),
    }
    Ok(())
}
