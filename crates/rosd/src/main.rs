//! `rosd`: the remote object store daemon.
//!
//! Runs a host agent and a set of clients in one process over the loopback
//! fabric and drives workloads through the full client stack: the
//! completion correlator, the four lock protocols, remote object handles
//! and the versioned B-tree.
//!
//! # Usage
//!
//! ```text
//! rosd demo                                   # every workload, defaults
//! rosd demo -c rosd.toml                      # with a config file
//! rosd locks --kind queue --clients 8 -n 200  # contention on one lock kind
//! rosd tree --degree 4 --count 30             # build and print a B-tree
//! ```

mod cluster;
mod config;
mod telemetry;
mod workload;

use std::path::PathBuf;

use anyhow::{Context, Result, ensure};
use clap::{Parser, Subcommand};
use ros_btree::Index;
use ros_client::LockKind;
use tracing::{info, warn};

use cluster::LocalCluster;
use config::CliConfig;

/// Host-local ids of the objects the workloads allocate. The root object
/// takes id 1.
const COUNTER_OBJECT: u32 = 0x100;
const TREE_OBJECT: u32 = 0x200;

/// Trees at most this large are printed in full by `rosd tree`.
const PRINT_LIMIT: u32 = 64;

// -----------------------------------------------------------------------
// CLI definition
// -----------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "rosd", version, about = "Remote object store daemon")]
struct Cli {
    /// Path to TOML config file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run lock contention with every configured lock kind, then store a
    /// versioned B-tree in a remote object and read it back.
    Demo {
        /// Override the number of clients.
        #[arg(long)]
        clients: Option<usize>,
    },

    /// Stress one lock protocol: every client increments a shared counter
    /// object under the lock.
    Locks {
        /// Lock protocol: poll, queue, atomic or accelerated.
        #[arg(short, long, default_value = "queue")]
        kind: LockKind,

        /// Concurrent clients, each with its own connection.
        #[arg(long, default_value = "4")]
        clients: usize,

        /// Critical sections per client.
        #[arg(short = 'n', long, default_value = "100")]
        iterations: usize,
    },

    /// Build base and versioned B-trees locally and report on them.
    Tree {
        /// Maximum children per node.
        #[arg(short, long, default_value = "4")]
        degree: usize,

        /// Number of keys to insert.
        #[arg(short = 'n', long, default_value = "30")]
        count: u32,
    },
}

// -----------------------------------------------------------------------
// Entrypoint
// -----------------------------------------------------------------------

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = CliConfig::load(cli.config.as_deref()).context("failed to load config")?;

    telemetry::init(&config.log.level);

    match cli.command {
        Commands::Demo { clients } => cmd_demo(&config, clients).await,
        Commands::Locks {
            kind,
            clients,
            iterations,
        } => cmd_locks(&config, kind, clients, iterations).await,
        Commands::Tree { degree, count } => cmd_tree(degree, count),
    }
}

// -----------------------------------------------------------------------
// Commands
// -----------------------------------------------------------------------

async fn cmd_demo(config: &CliConfig, clients: Option<usize>) -> Result<()> {
    let kinds = config.lock_kinds()?;
    let clients = clients.unwrap_or(config.demo.clients).max(1);
    let host = config.host_config();

    println!("rosd demo");
    println!("  host:        {} (cluster {})", host.host_id, host.cluster_id);
    println!("  objects:     {} x {} bytes", host.capacity, host.object_size);
    println!("  clients:     {clients}");
    println!("  iterations:  {}", config.demo.iterations);
    println!();

    let cluster = LocalCluster::start(host, config.client_config(), clients).await?;

    println!("Locks:");
    let mut failures = 0;
    for kind in kinds {
        let report =
            workload::contend(&cluster, kind, config.demo.iterations, COUNTER_OBJECT).await?;
        let verdict = if report.is_exclusive() { "ok" } else { "LOST UPDATES" };
        if !report.is_exclusive() {
            warn!(%kind, counter = report.counter, expected = report.expected(), "mutual exclusion violated");
            failures += 1;
        }
        println!(
            "  {:<12} {:>6}/{:<6} {:>8.2} ms  {verdict}",
            report.kind.as_str(),
            report.counter,
            report.expected(),
            report.elapsed.as_secs_f64() * 1000.0
        );
    }
    println!();

    let stored = workload::tree_roundtrip(
        &cluster,
        config.demo.tree_degree,
        config.demo.tree_count,
        TREE_OBJECT,
    )
    .await?;
    let report = &stored.report;
    println!("Versioned B-tree:");
    println!("  degree:      {}", report.degree);
    println!(
        "  keys:        {} inserted, {} erased, {} erases refused",
        report.inserted, report.erased, report.refused
    );
    println!("  versions:    {} (built at {})", report.version, report.built);
    println!("  height:      {}", report.height);
    println!(
        "  stored:      {} bytes after pruning {} nodes",
        stored.encoded_len, stored.pruned
    );
    println!(
        "  pool:        {} of {} objects in use",
        cluster.agent().pool().len(),
        host.capacity
    );

    cluster.shutdown().await;
    ensure!(failures == 0, "{failures} lock kinds lost updates");
    info!("demo finished");
    Ok(())
}

async fn cmd_locks(
    config: &CliConfig,
    kind: LockKind,
    clients: usize,
    iterations: usize,
) -> Result<()> {
    let cluster = LocalCluster::start(config.host_config(), config.client_config(), clients.max(1))
        .await?;
    let report = workload::contend(&cluster, kind, iterations, COUNTER_OBJECT).await?;
    cluster.shutdown().await;

    let secs = report.elapsed.as_secs_f64();
    println!("Lock contention ({kind})");
    println!("  clients:     {}", report.clients);
    println!("  iterations:  {iterations}");
    println!("  counter:     {} (expected {})", report.counter, report.expected());
    println!("  max inside:  {}", report.max_inside);
    println!(
        "  throughput:  {:.0} critical sections/s",
        report.expected() as f64 / secs.max(f64::EPSILON)
    );
    ensure!(report.is_exclusive(), "{kind} lock lost updates");
    Ok(())
}

fn cmd_tree(degree: usize, count: u32) -> Result<()> {
    let (base, base_report) = workload::build_base_tree(degree, count)?;
    let (versioned, report) = workload::build_tree(degree, count)?;

    println!("B-tree (degree {degree}, {count} keys, every third erased)");
    println!(
        "  base:        height {}, {} keys, {} erases refused",
        base_report.height, base_report.keys, base_report.refused
    );
    println!(
        "  versioned:   height {}, {} keys, {} erases refused",
        report.height, report.keys, report.refused
    );
    println!(
        "  history:     versions {}..={}, {} nodes",
        versioned.horizon(),
        versioned.version(),
        versioned.node_count()
    );
    for version in [report.built, report.version] {
        println!(
            "  @{version:<10} height {}, {} keys",
            versioned.height_at(version)?,
            versioned.keys_at(version)?.len()
        );
    }

    if count <= PRINT_LIMIT && !base.is_empty() {
        println!();
        print!("{base}");
    }
    Ok(())
}
