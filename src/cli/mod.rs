//! CLI argument parsing and command handling

mod progress;
mod synthetic;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use racebench_core::transport::tcp;
use racebench_core::{
    Completion, CoordinatorBuilder, ErrorPolicy, Phase, RaceConfig, RaceReport, RampUp, Task,
    TaskGraph,
};
use tokio::net::TcpListener;

use progress::RaceProgress;
use synthetic::LatencyModel;

/// racebench - paced macrobenchmark races across local and remote workers
#[derive(Parser, Debug)]
#[command(name = "racebench")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a race with the synthetic operation
    Run(RunArgs),
    /// Serve a worker over TCP for remote coordinators
    Worker(WorkerArgs),
}

/// Synthetic operation behaviour, shared by both subcommands
#[derive(Args, Debug, Clone)]
pub struct SyntheticArgs {
    /// Request latency in ms: "D(5)" fixed, "N(5,1)" normal, "U(1,10)" uniform
    #[arg(long, default_value = "N(5,1)")]
    pub latency: String,

    /// Share of requests that fail (0.0-1.0)
    #[arg(long, default_value = "0.0")]
    pub error_rate: f64,

    /// Seed for the per-lane random generators
    #[arg(long, default_value = "42")]
    pub seed: u64,
}

impl SyntheticArgs {
    fn latency_model(&self) -> Result<LatencyModel> {
        if !(0.0..=1.0).contains(&self.error_rate) {
            anyhow::bail!("Error rate must be between 0.0 and 1.0, got: {}", self.error_rate);
        }
        self.latency
            .parse()
            .with_context(|| format!("Failed to parse latency: {}", self.latency))
    }
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Number of in-process workers
    #[arg(short, long, default_value = "1")]
    pub workers: usize,

    /// Address of a remote worker (repeatable)
    #[arg(long = "remote", value_name = "ADDR")]
    pub remotes: Vec<SocketAddr>,

    /// Task graph file (JSON); replaces the workload flags below
    #[arg(short, long)]
    pub graph: Option<PathBuf>,

    /// Race configuration file (JSON)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Race name
    #[arg(short, long)]
    pub name: Option<String>,

    /// Target throughput in requests per second (omit for unthrottled)
    #[arg(short, long)]
    pub rate: Option<f64>,

    /// Number of lanes
    #[arg(short, long, default_value = "4")]
    pub concurrency: usize,

    /// Measurement duration in seconds
    #[arg(short, long, default_value = "10", conflicts_with = "iterations")]
    pub duration: u64,

    /// Run a fixed number of measurement requests instead of a duration
    #[arg(short, long)]
    pub iterations: Option<u64>,

    /// Warmup duration in seconds (0 disables warmup)
    #[arg(long, default_value = "0")]
    pub warmup: u64,

    /// Ramp-up duration in seconds
    #[arg(long)]
    pub ramp_up: Option<u64>,

    /// Interrupt the race on the first failed request
    #[arg(long)]
    pub abort_on_error: bool,

    /// Interrupt the race after this many seconds
    #[arg(long)]
    pub time_limit: Option<u64>,

    #[command(flatten)]
    pub synthetic: SyntheticArgs,

    /// Write the JSON report to this file
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Print the JSON report instead of the summary
    #[arg(long)]
    pub json: bool,

    /// Disable the progress display
    #[arg(short, long)]
    pub quiet: bool,
}

#[derive(Args, Debug)]
pub struct WorkerArgs {
    /// Address to listen on
    #[arg(short, long, default_value = "0.0.0.0:7421")]
    pub listen: SocketAddr,

    /// Worker name announced to coordinators
    #[arg(short, long, default_value = "remote")]
    pub name: String,

    #[command(flatten)]
    pub synthetic: SyntheticArgs,
}

impl Cli {
    /// Dispatch the subcommand
    pub async fn run(self) -> Result<()> {
        match self.command {
            Commands::Run(args) => run_race(args).await,
            Commands::Worker(args) => serve_worker(args).await,
        }
    }
}

async fn run_race(args: RunArgs) -> Result<()> {
    let latency = args.synthetic.latency_model()?;
    let mut config = match &args.config {
        Some(path) => load_json::<RaceConfig>(path)?,
        None => RaceConfig::default(),
    };
    if let Some(name) = &args.name {
        config.name = name.clone();
    }
    if args.abort_on_error {
        config.error_policy = ErrorPolicy::Abort;
    }
    let graph = match &args.graph {
        Some(path) => load_json::<TaskGraph>(path)?,
        None => args.graph_from_flags(),
    };

    if args.workers == 0 && args.remotes.is_empty() {
        anyhow::bail!("At least one local or remote worker is required");
    }

    tracing::info!(
        race = %config.name,
        local_workers = args.workers,
        remote_workers = args.remotes.len(),
        tasks = graph.tasks().len(),
        latency = latency.name(),
        "Preparing race"
    );

    let mut builder = CoordinatorBuilder::new()
        .graph(graph)
        .config(config.clone());
    for i in 0..args.workers {
        let worker = synthetic::worker(
            format!("local-{i}"),
            latency,
            args.synthetic.error_rate,
            args.synthetic.seed.wrapping_add(i as u64),
            config.channels.clone(),
        )?;
        builder = builder.local_worker(worker);
    }
    for addr in &args.remotes {
        builder = builder.remote_worker(*addr);
    }

    let handle = builder.build().context("Invalid race definition")?.start();
    let time_limit = args.time_limit.map(Duration::from_secs);

    let report = if args.quiet {
        match time_limit {
            Some(limit) => handle.wait_with_timeout(limit).await?,
            None => handle.wait_with_signal_handling().await?,
        }
    } else {
        let progress = RaceProgress::new()?;
        progress.follow(&handle, time_limit).await;
        handle.wait().await?
    };

    if let Some(path) = &args.output {
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write report to: {}", path.display()))?;
        println!("✓ Report written to: {}", path.display());
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

impl RunArgs {
    /// Warmup and measurement tasks built from the workload flags
    fn graph_from_flags(&self) -> TaskGraph {
        let shape = |task: Task| {
            let task = task.with_concurrency(self.concurrency);
            let task = match self.rate {
                Some(rate) => task.with_rate(rate),
                None => task,
            };
            match self.ramp_up {
                Some(secs) => task.with_ramp_up(RampUp::new(Duration::from_secs(secs), 0.0)),
                None => task,
            }
        };

        let measurement = shape(Task::new("measurement", synthetic::OPERATION)).with_completion(
            match self.iterations {
                Some(n) => Completion::Iterations(n),
                None => Completion::Duration(Duration::from_secs(self.duration)),
            },
        );
        if self.warmup == 0 {
            return measurement.into();
        }

        let warmup = shape(Task::new("warmup", synthetic::OPERATION))
            .with_phase(Phase::Warmup)
            .with_completion(Completion::Duration(Duration::from_secs(self.warmup)));
        TaskGraph::sequential([warmup.into(), measurement.into()])
    }
}

async fn serve_worker(args: WorkerArgs) -> Result<()> {
    let latency = args.synthetic.latency_model()?;
    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("Failed to listen on: {}", args.listen))?;
    tracing::info!(addr = %args.listen, worker = %args.name, latency = latency.name(), "Worker listening");

    let name = args.name.clone();
    let error_rate = args.synthetic.error_rate;
    let seed = args.synthetic.seed;
    let serve = tcp::serve(listener, RaceConfig::default().channels.link_buffer, move || {
        synthetic::worker(name.clone(), latency, error_rate, seed, Default::default())
            .map_err(|e| racebench_core::BenchError::config(e.to_string()))
    });

    tokio::select! {
        result = serve => result.context("Worker server failed")?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl+C, shutting down worker");
        }
    }
    Ok(())
}

fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read: {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("Failed to parse: {}", path.display()))
}

/// Print race results in a readable format
fn print_report(report: &RaceReport) {
    println!();
    println!("{}", "=".repeat(70));
    println!("   Race Results: {}", report.race);
    println!("{}", "=".repeat(70));
    println!();

    for summary in &report.phases {
        println!("📊 {} ({} samples, {} errors, {:.2} ops/s):", summary.phase, summary.samples, summary.errors, summary.throughput);
        for stats in &summary.tasks {
            println!("  Task {}:", stats.task);
            println!("    Requests:           {} ({:.1}% failed)", stats.count, stats.error_rate * 100.0);
            println!("    Throughput:         {:.2} ops/s", stats.throughput);
            println!("    Latency P50/P90/P99: {:.2} / {:.2} / {:.2} ms", stats.latency.p50, stats.latency.p90, stats.latency.p99);
            println!("    Response P50/P99:   {:.2} / {:.2} ms", stats.response_time.p50, stats.response_time.p99);
            for (reason, count) in &stats.error_reasons {
                println!("    Error \"{}\": {}", reason, count);
            }
        }
        println!();
    }

    if report.cancelled {
        println!("⚠️  Race was interrupted");
    }
    for lost in &report.lost_workers {
        println!("⚠️  Lost worker {} ({}): {}", lost.worker, lost.name, lost.reason);
    }
    for incomplete in &report.incomplete {
        println!("⚠️  Incomplete {} task {}: {}", incomplete.phase, incomplete.task, incomplete.reason);
    }
    println!("{}", "=".repeat(70));
    println!();
}
