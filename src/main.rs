mod catalog;
mod config;
mod error;
mod index;
mod logging;
mod operation;
mod repl;
mod service;
mod storage;

#[cfg(test)]
mod test_utils;

use clap::Parser;
use logging::{LogConfig, init_logging};
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::catalog::database::Database;
use crate::config::IndexBuildConfig;
use crate::error::IndexBuildError;
use crate::index::{
    AbortProcess, BuildOutcome, IndexBuildCoordinator, IndexBuildRequest, IndexBuilder, IndexSpec,
};
use crate::repl::{HybridLogicalClock, InMemoryReplicationCoordinator, MemberState, ReplicationCoordinator};
use crate::service::ServiceContext;
use crate::storage::{LockMode, Timestamp};

/// CLI arguments for the index build driver
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Index specification as JSON; must name the namespace in "ns"
    #[arg(long, value_name = "JSON", default_value = r#"{"ns": "test.docs", "key": {"a": 1}}"#)]
    spec: String,

    /// Documents to seed the collection with before building
    #[arg(long, default_value_t = 10_000)]
    documents: u64,

    /// Build in the background, letting writers in while scanning
    #[arg(long)]
    background: bool,

    /// Treat an option conflict with an existing index as already satisfied
    #[arg(long)]
    relax_constraints: bool,

    /// Run as a replica set primary, so the commit gets a ghost timestamp
    #[arg(long)]
    replica_set: bool,

    /// Seconds component of the timestamp for catalog writes made during init
    #[arg(long, value_name = "SECS")]
    init_ts: Option<u32>,

    /// Seconds to wait for a background build to report it has started
    #[arg(long, value_name = "SECS")]
    handshake_timeout_secs: Option<u64>,

    /// Lock acquisition timeout in milliseconds (unbounded when omitted)
    #[arg(long, value_name = "MS")]
    lock_timeout_ms: Option<u64>,

    /// Log level (overrides RUST_LOG env var)
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Log file path (overrides INDEX_BUILDER_LOG_FILE env var)
    #[arg(long, value_name = "FILE")]
    log_file: Option<PathBuf>,
}

fn build_config(args: &Args) -> Result<IndexBuildConfig, Box<dyn std::error::Error>> {
    let mut builder = IndexBuildConfig::builder();
    if let Some(secs) = args.handshake_timeout_secs {
        builder = builder.handshake_timeout(Duration::from_secs(secs));
    }
    if let Some(ms) = args.lock_timeout_ms {
        builder = builder.lock_timeout(Duration::from_millis(ms));
    }
    Ok(builder.build()?)
}

fn build_request(args: &Args) -> Result<IndexBuildRequest, Box<dyn std::error::Error>> {
    let mut spec: Value = serde_json::from_str(&args.spec)?;
    if args.background {
        spec["background"] = json!(true);
    }

    let init_ts = args
        .init_ts
        .map(|secs| Timestamp::new(secs, 0))
        .unwrap_or(Timestamp::NULL);
    Ok(IndexBuildRequest::new(
        IndexSpec::from_value(spec)?,
        args.relax_constraints,
        init_ts,
    ))
}

/// Seed documents exercising nested paths, repeated values and missing fields
fn seed_document(i: u64) -> Value {
    let mut doc = json!({
        "_id": i,
        "a": i,
        "b": i % 10,
        "tags": { "group": format!("g{}", i % 3) },
    });
    if i % 5 == 0 {
        doc["optional"] = json!(i / 5);
    }
    doc
}

async fn run_foreground(
    service: &Arc<ServiceContext>,
    coordinator: &Arc<IndexBuildCoordinator>,
    db: &Database,
    request: IndexBuildRequest,
) -> Result<BuildOutcome, Box<dyn std::error::Error>> {
    let op = service.make_operation_context("conn1");
    let lock = service
        .locks
        .lock_database(&op, db.name(), LockMode::Exclusive)
        .await?;

    let mut builder = IndexBuilder::new(Arc::clone(service), Arc::clone(coordinator), request);
    Ok(builder.build_in_foreground(&op, db, &lock).await?)
}

async fn run_background(
    service: &Arc<ServiceContext>,
    coordinator: &Arc<IndexBuildCoordinator>,
    request: IndexBuildRequest,
) -> Result<BuildOutcome, Box<dyn std::error::Error>> {
    let builder = IndexBuilder::new(Arc::clone(service), Arc::clone(coordinator), request);
    let build = coordinator.start_background(builder).await;
    match &build.start {
        Ok(signal) => info!("Background build '{}' reported {:?}", build.name, signal),
        Err(e) => warn!("Background build '{}': {}", build.name, e),
    }
    Ok(build.handle.await?)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging with configuration from env vars and CLI args
    let log_config = LogConfig::from_env().with_overrides(args.log_level.clone(), args.log_file.clone());

    if let Err(e) = init_logging(log_config) {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }

    let config = build_config(&args)?;
    let request = build_request(&args)?;
    let ns = request.spec.namespace()?;

    let repl: Arc<dyn ReplicationCoordinator> = if args.replica_set {
        Arc::new(InMemoryReplicationCoordinator::new(true, MemberState::Primary))
    } else {
        Arc::new(InMemoryReplicationCoordinator::standalone())
    };
    let now = u32::try_from(chrono::Utc::now().timestamp()).unwrap_or(u32::MAX);
    let clock = Arc::new(HybridLogicalClock::new(Timestamp::new(now, 1)));

    let service = Arc::new(ServiceContext::new(&config, clock, repl));
    let coordinator = Arc::new(IndexBuildCoordinator::new(config, Arc::new(AbortProcess)));

    let collection = service.databases.create_collection(&ns);
    for i in 0..args.documents {
        collection.insert_document(seed_document(i))?;
    }
    info!("Seeded {} with {} document(s)", ns, collection.num_records());

    let shutdown = Arc::clone(&coordinator);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.shutdown();
        }
    });

    let outcome = if args.background {
        run_background(&service, &coordinator, request).await?
    } else {
        let db = service
            .databases
            .get(ns.db())
            .ok_or_else(|| IndexBuildError::namespace_not_found(ns.ns()))?;
        run_foreground(&service, &coordinator, &db, request).await?
    };

    let report = json!({
        "outcome": outcome,
        "stats": coordinator.stats(),
        "indexes": collection.indexes(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !outcome.is_success() {
        std::process::exit(1);
    }
    Ok(())
}
