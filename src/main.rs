use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{debug, error};

use constellation::config::Config;
use constellation::core::{GraphSnapshot, TaskGraph};
use constellation::orchestration::{DeadlineBackend, DeviceBackend, LocalBackend, Orchestrator};
use constellation::Result;

/// Constellation - task dependency graph validation and orchestration
#[derive(Parser, Debug)]
#[command(name = "constellation")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    CONSTELLATION_DEBUG=1   Enable debug logging (alternative to --debug)\n    CONSTELLATION_LOG       Log filter directive, e.g. constellation=trace")]
pub struct Cli {
    /// Enable debug logging (written to stderr)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Config file (defaults to ~/.constellation/constellation.toml)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Check a graph snapshot for structural errors
    Validate {
        /// Path to the graph JSON
        graph: PathBuf,
    },

    /// Print the topological order of a graph
    Order {
        /// Path to the graph JSON
        graph: PathBuf,
    },

    /// Print parallelism metrics as JSON
    Metrics {
        /// Path to the graph JSON
        graph: PathBuf,
    },

    /// Execute a graph against in-process devices and print the report
    Simulate {
        /// Path to the graph JSON
        graph: PathBuf,

        /// Number of simulated devices
        #[arg(long, default_value_t = 1)]
        devices: usize,

        /// Simulated per-task latency in milliseconds
        #[arg(long, default_value_t = 0)]
        latency_ms: u64,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    constellation::log::init_with_debug(cli.debug);

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "command failed");
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    debug!(?config, "effective config");

    match cli.command {
        Command::Validate { graph } => run_validate(&graph),
        Command::Order { graph } => {
            for id in load_graph(&graph)?.get_topological_order()? {
                println!("{}", id);
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Metrics { graph } => {
            let metrics = load_graph(&graph)?.get_parallelism_metrics()?;
            println!("{}", serde_json::to_string_pretty(&metrics)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Simulate {
            graph,
            devices,
            latency_ms,
        } => run_simulate(&graph, devices, latency_ms, &config),
    }
}

fn load_graph(path: &Path) -> Result<TaskGraph> {
    TaskGraph::from_snapshot(GraphSnapshot::load(path)?)
}

fn run_validate(path: &Path) -> Result<ExitCode> {
    let graph = match load_graph(path) {
        Ok(graph) => graph,
        Err(e) => {
            println!("invalid: {}", e);
            return Ok(ExitCode::FAILURE);
        }
    };
    let (valid, errors) = graph.validate_dag();
    if valid {
        println!(
            "valid: {} tasks, {} dependencies",
            graph.task_count(),
            graph.edge_count()
        );
        Ok(ExitCode::SUCCESS)
    } else {
        for e in errors {
            println!("invalid: {}", e);
        }
        Ok(ExitCode::FAILURE)
    }
}

fn run_simulate(path: &Path, devices: usize, latency_ms: u64, config: &Config) -> Result<ExitCode> {
    let graph = load_graph(path)?;
    let local = LocalBackend::new(devices).with_latency(std::time::Duration::from_millis(latency_ms));
    let backend: Arc<dyn DeviceBackend> = match config.dispatch_timeout() {
        Some(deadline) => Arc::new(DeadlineBackend::new(local, deadline)),
        None => Arc::new(local),
    };

    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(Orchestrator::new(graph, backend, config).run())?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
