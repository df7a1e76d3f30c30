//! Workload driver for the bridge core.
//!
//! Runs concurrent sessions against an in-process partitioned cluster: each
//! session bulk-loads its own rows, then mixes guarded updates with
//! replicated writes, and finally scans its rows back through a secondary
//! index. A JSON report with per-session results and the process metrics
//! snapshot is written at the end.

use std::ops::Bound;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use holo_bridge::{
    BridgeConfig, BridgeMetrics, BridgeMetricsSnapshot, ConflictAction, ConflictResolver,
    KeyRange, MaxVersion, ReplicatedWrite, RowHandler, ScanSpec, SessionContext,
    SharedExceptionSink, ShareRegistry, UpdateOutcome, WriteOutcome,
};
use holo_cluster::{
    ClusterConnection, ColumnDef, ColumnValue, IndexDef, IndexId, InMemoryCluster,
    InMemoryClusterConfig, KeyTuple, NodeId, Row, TableDef,
};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::time;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const TABLE: &str = "bench.items";
const OWNER_INDEX: usize = 1;
const VERSION_COLUMN: usize = 3;

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "holo-bridge-workload")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Run(RunArgs),
}

/// CLI options for one workload run. Bridge tunables come from
/// `HOLO_BRIDGE_*` variables; flags below override the batching threshold.
#[derive(Parser, Debug, Clone)]
struct RunArgs {
    /// Number of concurrent sessions.
    #[arg(long, default_value_t = 8)]
    sessions: usize,

    /// Rows bulk-loaded by each session.
    #[arg(long, default_value_t = 500)]
    rows: u64,

    /// Read-modify-write operations issued by each session after loading.
    #[arg(long, default_value_t = 200)]
    ops: usize,

    /// Partitions of the benchmark table.
    #[arg(long, default_value_t = 4)]
    partitions: u32,

    /// Comma-separated data node ids, e.g. `1,2,3`.
    #[arg(long, default_value = "1,2,3")]
    nodes: String,

    /// Overrides `HOLO_BRIDGE_BATCH_FLUSH_BYTES`.
    #[arg(long)]
    batch_flush_bytes: Option<usize>,

    /// Percent of operations applied as replicated writes (rest are updates).
    #[arg(long, default_value_t = 30)]
    replicated_pct: u8,

    /// Percent of replicated writes that carry a stale version.
    #[arg(long, default_value_t = 25)]
    stale_pct: u8,

    /// Artificial latency per cluster round trip.
    #[arg(long, default_value = "0s")]
    round_trip_delay: humantime::Duration,

    /// Random seed (0 picks a random seed).
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Write the JSON report here instead of stdout.
    #[arg(long)]
    out: Option<PathBuf>,
}

/// Settings embedded in the report for reproducibility.
#[derive(serde::Serialize, Debug, Clone)]
struct RunMeta {
    sessions: usize,
    rows: u64,
    ops: usize,
    partitions: u32,
    nodes: Vec<NodeId>,
    replicated_pct: u8,
    stale_pct: u8,
    seed: u64,
    batch_flush_bytes: usize,
    scan_batch_rows: usize,
}

#[derive(serde::Serialize, Debug, Clone, Default)]
struct SessionReport {
    session: usize,
    inserted: usize,
    duplicates: usize,
    updates: u64,
    update_conflicts: u64,
    replicated_applied: u64,
    replicated_rejected: u64,
    replicated_escalated: u64,
    scanned: u64,
}

#[derive(serde::Serialize, Debug)]
struct Report {
    meta: RunMeta,
    elapsed: String,
    sessions: Vec<SessionReport>,
    escalations: usize,
    metrics: BridgeMetricsSnapshot,
}

/// Everything one session task needs.
struct SessionPlan {
    index: usize,
    rows: u64,
    ops: usize,
    replicated_pct: u8,
    stale_pct: u8,
    seed: u64,
    conn: Arc<dyn ClusterConnection>,
    registry: Arc<ShareRegistry>,
    metrics: Arc<BridgeMetrics>,
    config: BridgeConfig,
    sink: SharedExceptionSink,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();
    match args.cmd {
        Command::Run(args) => run(args).await,
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    anyhow::ensure!(args.sessions > 0, "--sessions must be > 0");
    anyhow::ensure!(args.rows > 0, "--rows must be > 0");
    anyhow::ensure!(args.partitions > 0, "--partitions must be > 0");
    anyhow::ensure!(args.replicated_pct <= 100, "--replicated-pct must be <= 100");
    anyhow::ensure!(args.stale_pct <= 100, "--stale-pct must be <= 100");
    let nodes = parse_nodes(&args.nodes)?;
    anyhow::ensure!(!nodes.is_empty(), "--nodes must not be empty");

    let mut config = BridgeConfig::from_env().context("load bridge config")?;
    if let Some(bytes) = args.batch_flush_bytes {
        config.batch_flush_bytes = bytes.max(1);
    }
    let seed = if args.seed == 0 {
        rand::thread_rng().gen()
    } else {
        args.seed
    };

    let cluster = Arc::new(InMemoryCluster::new(InMemoryClusterConfig {
        data_nodes: nodes.clone(),
        max_transactions: args.sessions.saturating_mul(2).max(16),
        round_trip_delay: args.round_trip_delay.into(),
    }));
    cluster
        .create_table(items_table(args.partitions))
        .context("create benchmark table")?;
    let conn: Arc<dyn ClusterConnection> = cluster.clone();
    let registry = ShareRegistry::new();
    let metrics = Arc::new(BridgeMetrics::new());
    let sink = SharedExceptionSink::new();
    info!(
        sessions = args.sessions,
        rows = args.rows,
        partitions = args.partitions,
        seed,
        "holobridge workload starting"
    );

    let start = time::Instant::now();
    let mut tasks = Vec::with_capacity(args.sessions);
    for index in 0..args.sessions {
        let plan = SessionPlan {
            index,
            rows: args.rows,
            ops: args.ops,
            replicated_pct: args.replicated_pct,
            stale_pct: args.stale_pct,
            // Mix the base seed with the session index for per-session RNGs.
            seed: seed ^ (index as u64).wrapping_mul(0x9e3779b97f4a7c15),
            conn: Arc::clone(&conn),
            registry: Arc::clone(&registry),
            metrics: Arc::clone(&metrics),
            config: config.clone(),
            sink: sink.clone(),
        };
        tasks.push(tokio::spawn(run_session(plan)));
    }

    let mut sessions = Vec::with_capacity(tasks.len());
    for task in tasks {
        sessions.push(task.await.context("session task panicked")??);
    }
    let elapsed = start.elapsed();

    anyhow::ensure!(
        cluster.open_transactions() == 0,
        "{} transactions left open",
        cluster.open_transactions()
    );
    anyhow::ensure!(
        cluster.open_scan_count() == 0,
        "{} scans left open",
        cluster.open_scan_count()
    );
    anyhow::ensure!(registry.is_empty(), "table shares outlived their sessions");

    let report = Report {
        meta: RunMeta {
            sessions: args.sessions,
            rows: args.rows,
            ops: args.ops,
            partitions: args.partitions,
            nodes,
            replicated_pct: args.replicated_pct,
            stale_pct: args.stale_pct,
            seed,
            batch_flush_bytes: config.batch_flush_bytes,
            scan_batch_rows: config.scan_batch_rows,
        },
        elapsed: humantime::format_duration(truncate_to_millis(elapsed)).to_string(),
        sessions,
        escalations: sink.drain().len(),
        metrics: metrics.snapshot(),
    };
    info!(
        elapsed = %report.elapsed,
        round_trips = cluster.round_trips(),
        "holobridge workload finished"
    );
    write_report(args.out.as_ref(), &report)
}

/// Loads, mutates and re-reads one session's slice of the table.
async fn run_session(plan: SessionPlan) -> anyhow::Result<SessionReport> {
    let mut rng = SmallRng::seed_from_u64(plan.seed);
    let mut session = SessionContext::new(
        Arc::clone(&plan.conn),
        Arc::clone(&plan.registry),
        plan.config.clone(),
        Arc::clone(&plan.metrics),
    );
    let mut items = session.open_table(TABLE).await.context("open table")?;
    if items.share().conflict_resolver().is_none() {
        items.share().set_conflict_resolver(Some(Arc::new(ConflictResolver::new(
            Arc::new(MaxVersion {
                column: VERSION_COLUMN,
            }),
            ConflictAction::Reject,
        ))));
    }

    let owner = plan.index as u64;
    let first_id = owner * plan.rows + 1;
    let mut report = SessionReport {
        session: plan.index,
        ..SessionReport::default()
    };

    items.start_bulk_insert();
    for id in first_id..first_id + plan.rows {
        let outcome = items
            .write(&mut session, item(id, owner, rng.gen_range(1..1_000), 1))
            .await
            .with_context(|| format!("session {} load row {id}", plan.index))?;
        if outcome == WriteOutcome::Rejected {
            anyhow::bail!("session {} load rejected: table changed", plan.index);
        }
    }
    let bulk = items.end_bulk_insert(&mut session).await.context("end bulk insert")?;
    report.inserted = bulk.inserted;
    report.duplicates = bulk.duplicates;
    items.commit_statement(&mut session).await.context("commit load")?;
    debug!(session = plan.index, inserted = bulk.inserted, "holobridge workload loaded rows");

    let mut sink = plan.sink.clone();
    for _ in 0..plan.ops {
        let id = rng.gen_range(first_id..first_id + plan.rows);
        let Some(current) = read_row(&mut items, &mut session, id).await? else {
            warn!(session = plan.index, id, "holobridge workload row vanished");
            continue;
        };
        let version = column_u64(&current, VERSION_COLUMN)?;
        let amount = column_u64(&current, 2)?;

        if rng.gen_range(0..100u8) < plan.replicated_pct {
            let next_version = if rng.gen_range(0..100u8) < plan.stale_pct {
                version
            } else {
                version + 1
            };
            let write = ReplicatedWrite::update(
                current.columns.clone(),
                item(id, owner, amount + 1, next_version),
            );
            let record = items
                .apply_replicated(&mut session, write, &mut sink)
                .await
                .context("apply replicated write")?;
            match record.action {
                ConflictAction::Apply => report.replicated_applied += 1,
                ConflictAction::Reject => report.replicated_rejected += 1,
                ConflictAction::Escalate => report.replicated_escalated += 1,
            }
        } else {
            let outcome = items
                .update(&mut session, &current, item(id, owner, amount + 10, version + 1))
                .await
                .context("update row")?;
            match outcome {
                UpdateOutcome::Ok => report.updates += 1,
                UpdateOutcome::Conflict | UpdateOutcome::NotFound => report.update_conflicts += 1,
            }
        }
        items.commit_statement(&mut session).await.context("commit op")?;
    }

    let spec = ScanSpec::index_range(
        OWNER_INDEX,
        Bound::Included(KeyTuple::from_u64s(&[owner])),
        Bound::Included(KeyTuple::from_u64s(&[owner])),
    );
    items.scan_init(&mut session, spec).await.context("scan init")?;
    while items.scan_next(&mut session).await.context("scan next")?.is_some() {
        report.scanned += 1;
    }
    items.commit_statement(&mut session).await.context("commit scan")?;
    anyhow::ensure!(
        report.scanned == report.inserted as u64,
        "session {} scanned {} rows, loaded {}",
        plan.index,
        report.scanned,
        report.inserted
    );

    drop(items);
    session.end().await.context("end session")?;
    Ok(report)
}

/// Reads one row by primary key through a single-range multi-range read.
async fn read_row(
    items: &mut RowHandler,
    session: &mut SessionContext,
    id: u64,
) -> anyhow::Result<Option<Row>> {
    let ranges = vec![KeyRange::point(KeyTuple::from_u64s(&[id]))];
    let mut stream = items
        .lookup_multi(session, 0, ranges, false)
        .await
        .context("open point read")?;
    let row = stream.next(session).await.context("point read")?;
    Ok(row.map(|(_, row)| row))
}

fn column_u64(row: &Row, column: usize) -> anyhow::Result<u64> {
    row.columns
        .get(column)
        .and_then(ColumnValue::as_u64)
        .with_context(|| format!("column {column} is not a u64"))
}

/// `bench.items(id, owner, amount, version)` with an ordered index on owner.
fn items_table(partitions: u32) -> TableDef {
    TableDef {
        name: TABLE.to_string(),
        table_id: 1,
        schema_version: 1,
        columns: vec![
            ColumnDef::new("id", false),
            ColumnDef::new("owner", false),
            ColumnDef::new("amount", false),
            ColumnDef::new("version", false),
        ],
        primary_key: vec![0],
        primary_key_ordered: true,
        hidden_key: false,
        partitions,
        indexes: vec![IndexDef {
            id: IndexId(1),
            name: "items_owner".to_string(),
            unique: false,
            ordered: true,
            columns: vec![1],
        }],
    }
}

fn item(id: u64, owner: u64, amount: u64, version: u64) -> Vec<ColumnValue> {
    vec![
        ColumnValue::from_u64(id),
        ColumnValue::from_u64(owner),
        ColumnValue::from_u64(amount),
        ColumnValue::from_u64(version),
    ]
}

/// Parse a comma-separated list of data node ids.
fn parse_nodes(input: &str) -> anyhow::Result<Vec<NodeId>> {
    input
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<NodeId>()
                .with_context(|| format!("invalid node id {part:?}"))
        })
        .collect()
}

fn truncate_to_millis(elapsed: Duration) -> Duration {
    Duration::from_millis(elapsed.as_millis() as u64)
}

fn write_report(out: Option<&PathBuf>, report: &Report) -> anyhow::Result<()> {
    let data = serde_json::to_vec_pretty(report).context("serialize report")?;
    match out {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create dir {}", parent.display()))?;
            }
            std::fs::write(path, data).with_context(|| format!("write {}", path.display()))?;
            info!(path = %path.display(), "holobridge workload report written");
        }
        None => println!("{}", String::from_utf8_lossy(&data)),
    }
    Ok(())
}
