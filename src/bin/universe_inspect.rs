//! universe-inspect
//!
//! Inspects a persistent universe data directory: the node map, runs, and the
//! recorded telemetry of a run. Opening a directory takes its lock and applies
//! the usual crash recovery; no other writes are made.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use universe_core::storage::persistent::{open_database, PersistentConfig};
use universe_core::{
    ForkService, NodeId, ProjectId, ReplayService, RequestContext, RunId, RunStore, ShowAllEdges,
    TickRange, UniverseConfig, UniverseError, UniverseResult,
};

#[derive(Debug, Parser)]
#[command(name = "universe-inspect", version, about = "Inspect a universe data directory")]
struct Cli {
    /// Data directory of a persistent store.
    #[arg(long, short = 'd', env = "UNIVERSE_DATA_DIR", default_value = "./universe.data")]
    data_dir: PathBuf,

    /// JSON core config; only retry limits are used here.
    #[arg(long, env = "UNIVERSE_CONFIG")]
    config: Option<PathBuf>,

    /// Project to scope every read to.
    #[arg(long, short = 'p', env = "UNIVERSE_PROJECT_ID")]
    project: ProjectId,

    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Nodes of the project and their parent edges.
    Map,
    /// Runs of the project.
    Runs,
    /// Telemetry totals of a run.
    Summary(RunArg),
    /// Keyframe and deltas covering a tick.
    Slice {
        #[command(flatten)]
        run: RunArg,
        #[arg(long)]
        tick: u64,
        /// Print the materialized state instead of the frames.
        #[arg(long)]
        state: bool,
    },
    /// Values of one metric over a tick range.
    Series {
        #[command(flatten)]
        run: RunArg,
        #[arg(long)]
        metric: String,
        #[command(flatten)]
        range: RangeArgs,
    },
    /// Event occurrences overlapping a tick range.
    Events {
        #[command(flatten)]
        run: RunArg,
        #[command(flatten)]
        range: RangeArgs,
    },
    /// Ancestry of a node up to its root.
    Ancestry {
        #[arg(long)]
        node: NodeId,
    },
}

#[derive(Debug, Args)]
struct RunArg {
    #[arg(long)]
    run: RunId,
}

#[derive(Debug, Args)]
struct RangeArgs {
    #[arg(long, default_value_t = 0)]
    from: u64,
    #[arg(long, default_value_t = u64::MAX)]
    to: u64,
}

impl RangeArgs {
    fn range(&self) -> UniverseResult<TickRange> {
        Ok(TickRange::new(self.from, self.to)?)
    }
}

fn emit<T: Serialize + std::fmt::Debug>(format: OutputFormat, value: &T) -> UniverseResult<()> {
    match format {
        OutputFormat::Json => {
            let text = serde_json::to_string_pretty(value)
                .map_err(|e| UniverseError::internal(format!("failed to render output: {e}")))?;
            println!("{text}");
        }
        OutputFormat::Text => println!("{value:#?}"),
    }
    Ok(())
}

fn run(cli: Cli) -> UniverseResult<()> {
    let config = match &cli.config {
        Some(path) => UniverseConfig::from_json_file(path)?,
        None => UniverseConfig::default(),
    };
    let (stores, report) = open_database(
        &cli.data_dir,
        Some(PersistentConfig {
            sync_on_write: true,
        }),
    )?;
    if !report.interrupted_runs.is_empty() {
        tracing::warn!(runs = ?report.interrupted_runs, "interrupted runs were marked failed");
    }

    let ctx = RequestContext::new(cli.project);
    let forks = ForkService::new(stores.nodes.clone(), config.fork_max_retries);
    let replay = ReplayService::new(stores.runs.clone(), stores.telemetry.clone());

    match cli.command {
        Command::Map => {
            let map = forks.get_universe_map(&ctx, &ShowAllEdges)?;
            match cli.format {
                OutputFormat::Json => emit(cli.format, &map)?,
                OutputFormat::Text => {
                    for node in &map.nodes {
                        println!(
                            "{} parent={} p={:.4} children={} run={} {}",
                            node.node_id,
                            node.parent_node_id
                                .map_or_else(|| "-".to_string(), |p| p.to_string()),
                            node.probability.value(),
                            node.child_count,
                            node.run_id,
                            node.label.as_deref().unwrap_or(""),
                        );
                    }
                    println!("{} nodes, {} edges", map.nodes.len(), map.visible_edges.len());
                }
            }
        }
        Command::Runs => {
            let runs = stores.runs.list_by_project(ctx.project_id)?;
            match cli.format {
                OutputFormat::Json => emit(cli.format, &runs)?,
                OutputFormat::Text => {
                    for r in &runs {
                        println!(
                            "{} node={} {} tick {}/{}",
                            r.run_id, r.node_id, r.status, r.current_tick, r.total_ticks
                        );
                    }
                }
            }
        }
        Command::Summary(arg) => emit(cli.format, &replay.get_summary(&ctx, arg.run)?)?,
        Command::Slice { run, tick, state } => {
            let slice = replay.get_slice(&ctx, run.run, tick)?;
            if state {
                emit(cli.format, &slice.materialize())?;
            } else {
                emit(cli.format, &slice)?;
            }
        }
        Command::Series { run, metric, range } => {
            let series = replay.get_metric_series(&ctx, run.run, &metric, range.range()?)?;
            match cli.format {
                OutputFormat::Json => emit(cli.format, &series)?,
                OutputFormat::Text => {
                    for (tick, value) in series {
                        println!("{tick}\t{value}");
                    }
                }
            }
        }
        Command::Events { run, range } => {
            emit(cli.format, &replay.get_events(&ctx, run.run, range.range()?)?)?;
        }
        Command::Ancestry { node } => emit(cli.format, &forks.ancestry(&ctx, node)?)?,
    }
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }
}
