//! CLI binary that runs an HRM topology.
//!
//! Usage:
//!   hrm-node [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>      Path to topology/configuration TOML file
//!   -d, --duration-ms <MS>   How long to run (overrides config)
//!   -s, --seed <SEED>        Seed for tokens and link interleaving
//!       --realtime           Run on the tokio runtime instead of the simulation
//!   -v, --verbose            Increase logging verbosity

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use hrm_node::config::NodeConfig;
use hrm_node::runtime::NodeRuntime;
use hrm_node::simulation::Simulation;

/// HRM node - builds the routing hierarchy of a topology and reports it.
#[derive(Parser, Debug)]
#[command(name = "hrm-node")]
#[command(about = "Run a hierarchical routing topology and print the resulting hierarchy")]
#[command(version)]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Run time in milliseconds.
    #[arg(short, long, value_name = "MS")]
    duration_ms: Option<u64>,

    /// Seed for cluster tokens and link interleaving.
    #[arg(short, long, value_name = "SEED")]
    seed: Option<u64>,

    /// Use real tasks and timers instead of the deterministic simulation.
    #[arg(long)]
    realtime: bool,

    /// Increase logging verbosity (can be repeated: -v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = NodeConfig::load(cli.config.as_deref())?;
    if let Some(duration) = cli.duration_ms {
        config.simulation.duration_ms = duration;
    }
    if let Some(seed) = cli.seed {
        config.simulation.seed = seed;
    }

    let log_level = match cli.verbose {
        0 => config.logging.level.as_str(),
        1 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));
    if config.logging.json_format {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    }

    if config.nodes.is_empty() {
        tracing::warn!("Topology has no nodes, running a four node line");
        let demo = NodeConfig::line(4);
        config.nodes = demo.nodes;
        config.links = demo.links;
    }

    tracing::info!(
        nodes = config.nodes.len(),
        links = config.links.len(),
        duration_ms = config.simulation.duration_ms,
        seed = config.simulation.seed,
        realtime = cli.realtime,
        "Starting HRM topology"
    );

    let reports = if cli.realtime {
        run_realtime(&config).await?
    } else {
        run_simulation(&config)?
    };
    for report in reports {
        println!("{}", report);
    }
    Ok(())
}

fn run_simulation(config: &NodeConfig) -> anyhow::Result<Vec<String>> {
    let mut simulation = Simulation::from_config(config)?;
    simulation.start();
    simulation.run_for(config.simulation.duration_ms);

    let stats = simulation.link_stats();
    tracing::info!(
        delivered = stats.delivered,
        dropped = stats.dropped,
        now_ms = simulation.now_ms(),
        "Simulation finished"
    );
    Ok(simulation
        .controllers()
        .map(|controller| {
            let coordinators: Vec<String> = controller
                .cluster_keys()
                .into_iter()
                .map(|key| {
                    let coordinator = controller
                        .coordinator_of(&key)
                        .map(|name| name.to_string())
                        .unwrap_or_else(|| "-".to_string());
                    format!("{}={}", key, coordinator)
                })
                .collect();
            let hrmids: Vec<String> = controller
                .hrmids()
                .into_iter()
                .map(|(_, hrmid)| hrmid.to_string())
                .collect();
            let entries = controller.status()["routing_entries"].as_u64().unwrap_or(0);
            format_report(controller.name().as_str(), &coordinators, &hrmids, entries)
        })
        .collect())
}

async fn run_realtime(config: &NodeConfig) -> anyhow::Result<Vec<String>> {
    let runtime = NodeRuntime::spawn(config)?;
    runtime.start()?;
    tokio::time::sleep(Duration::from_millis(config.simulation.duration_ms)).await;

    let reports = runtime
        .snapshots()
        .await
        .into_iter()
        .map(|snapshot| {
            let coordinators: Vec<String> = snapshot
                .coordinators
                .iter()
                .map(|(key, name)| format!("{}={}", key, name))
                .collect();
            let hrmids: Vec<String> = snapshot.hrmids.iter().map(|(_, hrmid)| hrmid.to_string()).collect();
            format_report(
                snapshot.name.as_str(),
                &coordinators,
                &hrmids,
                snapshot.routing_entries as u64,
            )
        })
        .collect();
    runtime.shutdown().await;
    Ok(reports)
}

fn format_report(node: &str, coordinators: &[String], hrmids: &[String], entries: u64) -> String {
    format!(
        "{:<12} coordinators [{}]  hrmids [{}]  fib {}",
        node,
        coordinators.join(", "),
        hrmids.join(", "),
        entries
    )
}
