//! CLI command implementations

use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, bail};
use clap::Subcommand;
use futures::StreamExt;
use surge_core::{
    Graph, NodeModel, SessionManager, Simulator, SurgeConfig, SurgeError, TickResult,
    TopologyConfig,
};

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Check a topology file and print its processing order
    Validate {
        /// Path to a topology JSON file
        topology: PathBuf,
    },
    /// Run a simulation over a topology file
    Run {
        /// Path to a topology JSON file
        topology: PathBuf,
        /// Number of ticks to run
        #[arg(short, long, default_value = "10")]
        ticks: u64,
        /// Override the topology's aggregate traffic rate
        #[arg(long)]
        rps: Option<f64>,
        /// Double every injection
        #[arg(long)]
        spike: bool,
        /// Take a node down before a tick, as ID@TICK (repeatable)
        #[arg(long = "down", value_name = "ID@TICK")]
        downs: Vec<DownAt>,
        /// Print one JSON tick result per line
        #[arg(long)]
        json: bool,
        /// Step as fast as possible instead of waiting for the tick interval
        #[arg(long)]
        instant: bool,
    },
}

/// A node outage scheduled before a given tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownAt {
    pub node_id: String,
    pub tick: u64,
}

impl FromStr for DownAt {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (node_id, tick) = s
            .rsplit_once('@')
            .ok_or_else(|| format!("Expected ID@TICK, got: {s}"))?;
        if node_id.is_empty() {
            return Err(format!("Missing node id in: {s}"));
        }
        let tick = tick
            .parse()
            .map_err(|_| format!("Invalid tick number in: {s}"))?;
        Ok(Self {
            node_id: node_id.to_string(),
            tick,
        })
    }
}

/// Options for the run command
struct RunOptions {
    ticks: u64,
    rps: Option<f64>,
    spike: bool,
    downs: Vec<DownAt>,
    json: bool,
}

/// Handle the CLI command
///
/// # Errors
/// Returns the error of whichever command fails
pub async fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Validate { topology } => validate(&topology),
        Commands::Run {
            topology,
            ticks,
            rps,
            spike,
            downs,
            json,
            instant,
        } => {
            let options = RunOptions {
                ticks,
                rps,
                spike,
                downs,
                json,
            };
            if instant {
                run_instant(&topology, &options)
            } else {
                run_live(&topology, &options).await
            }
        }
    }
}

fn load(path: &Path) -> anyhow::Result<TopologyConfig> {
    TopologyConfig::from_path(path)
        .map_err(|e| explain(SurgeError::from(e)))
        .with_context(|| format!("Failed to load {}", path.display()))
}

fn explain(error: SurgeError) -> anyhow::Error {
    if error.is_user_error() {
        anyhow::anyhow!(error.user_message())
    } else {
        anyhow::Error::new(error)
    }
}

/// Validate a topology file
///
/// # Errors
/// - Topology file unreadable or invalid
fn validate(path: &Path) -> anyhow::Result<()> {
    let topology = load(path)?;
    let config = SurgeConfig::from_env();
    let graph = Graph::build(&topology, &config.defaults).map_err(|e| explain(e.into()))?;

    println!("Topology is valid: {} nodes", graph.len());
    println!("  Entry node: {}", graph.entry().id());
    println!("  Traffic: {:.1} rps", graph.traffic_rps());
    println!("  Processing order:");
    for id in graph.topological_order() {
        if let Some(node) = graph.node(id) {
            println!(
                "    {:<20} {:<13} max {:>8.1} rps",
                id,
                node.kind().to_string(),
                node.max_rps()
            );
        }
    }
    Ok(())
}

/// Step a simulator synchronously, without a background driver
///
/// # Errors
/// - Topology file unreadable or invalid
/// - A scheduled outage names an unknown node
fn run_instant(path: &Path, options: &RunOptions) -> anyhow::Result<()> {
    let topology = load(path)?;
    let config = SurgeConfig::from_env();
    let graph = Graph::build(&topology, &config.defaults).map_err(|e| explain(e.into()))?;
    let (simulator, _stream) = Simulator::new(graph, &config.engine);

    if let Some(rps) = options.rps {
        simulator.set_traffic_rate(rps);
    }
    simulator.set_spike(options.spike);

    for tick in 1..=options.ticks {
        for down in options.downs.iter().filter(|d| d.tick == tick) {
            simulator
                .set_node_down(&down.node_id, true)
                .map_err(|e| explain(e.into()))?;
        }
        let result = simulator.step().map_err(|e| explain(e.into()))?;
        print_tick(&result, options.json)?;
    }
    Ok(())
}

/// Run a live session and print results as they stream in
///
/// # Errors
/// - Topology file unreadable or invalid
/// - A scheduled outage names an unknown node
async fn run_live(path: &Path, options: &RunOptions) -> anyhow::Result<()> {
    if options.downs.iter().any(|d| d.tick <= 1) {
        bail!("Live runs can only schedule outages from tick 2; use --instant");
    }
    let topology = load(path)?;
    let manager = SessionManager::new(SurgeConfig::from_env());
    let (id, mut stream) = manager
        .create(&topology)
        .await
        .map_err(|e| explain(e.into()))?;
    manager
        .set_traffic(&id, options.rps, Some(options.spike))
        .await
        .map_err(|e| explain(e.into()))?;

    while let Some(result) = stream.next().await {
        print_tick(&result, options.json)?;
        if result.tick >= options.ticks {
            break;
        }
        // Applied between ticks; the next result is the first to see it.
        for down in options.downs.iter().filter(|d| d.tick == result.tick + 1) {
            manager
                .toggle_node(&id, &down.node_id, true)
                .await
                .map_err(|e| explain(e.into()))?;
        }
    }

    manager.stop(&id).await.map_err(|e| explain(e.into()))?;
    Ok(())
}

fn print_tick(result: &TickResult, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string(result)?);
        return Ok(());
    }

    let bottlenecks = if result.bottleneck_ids.is_empty() {
        "none".to_string()
    } else {
        result.bottleneck_ids.join(", ")
    };
    println!(
        "tick {:>4} | {:>8.1} rps | bottlenecks: {}",
        result.tick, result.total_rps, bottlenecks
    );
    for node in &result.nodes {
        println!(
            "  {:<20} {:<13} util {:>4.2}  queue {:>8.1}  tput {:>8.1}  drop {:>7.1}  lat {:>8.1}ms  {}",
            node.id,
            node.node_type.to_string(),
            node.utilization,
            node.queue_depth,
            node.throughput,
            node.drop_rate,
            node.latency,
            node.status
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_down_at() {
        assert_eq!(
            "db-replica@5".parse::<DownAt>(),
            Ok(DownAt {
                node_id: "db-replica".to_string(),
                tick: 5
            })
        );
        assert_eq!(
            "a@b@3".parse::<DownAt>().map(|d| d.node_id),
            Ok("a@b".to_string())
        );
        assert!("db".parse::<DownAt>().is_err());
        assert!("@4".parse::<DownAt>().is_err());
        assert!("db@soon".parse::<DownAt>().is_err());
    }
}
