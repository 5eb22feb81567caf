//! NextStat systematics CLI

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ns_syst::{
    AnalysisConfig, FirstEventMetadata, HistogramRegistry, Recorded, RecordedEvent, RunOutput,
    SampleInfo, SystematicPlan, VariantLayout, finalize, run_sharded,
};
use serde_json::json;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "nextsyst")]
#[command(about = "NextStat - systematic-variation histogramming")]
#[command(version)]
struct Cli {
    /// Log verbosity level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: tracing::Level,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a config and print the accumulator keyspace
    Plan {
        /// Analysis config (YAML or JSON)
        #[arg(short, long)]
        config: PathBuf,

        /// Sample metadata (YAML or JSON): ensemble sizes, sources, bounds
        #[arg(long)]
        sample: Option<PathBuf>,

        /// Output file (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Fill every histogram from recorded events
    Run {
        /// Analysis config (YAML or JSON)
        #[arg(short, long)]
        config: PathBuf,

        /// Recorded events, one JSON object per line
        #[arg(short, long)]
        events: PathBuf,

        /// Sample metadata (YAML or JSON). Inferred from the first simulated event if omitted.
        #[arg(long)]
        sample: Option<PathBuf>,

        /// Output file (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Events per shard.
        #[arg(long, default_value = "10000")]
        shard_size: usize,

        /// Threads (0 = auto).
        #[arg(long, default_value = "0")]
        threads: usize,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Results go to stdout; keep logs out of them.
    tracing_subscriber::fmt()
        .with_max_level(cli.log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Plan { config, sample, output } => cmd_plan(&config, sample.as_ref(), output.as_ref()),
        Commands::Run { config, events, sample, output, shard_size, threads } => {
            cmd_run(&config, &events, sample.as_ref(), output.as_ref(), shard_size, threads)
        }
    }
}

fn load_config(path: &PathBuf) -> Result<(AnalysisConfig, SystematicPlan)> {
    tracing::info!(path = %path.display(), "loading config");
    let config = AnalysisConfig::from_path(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let plan = config.validate()?;
    tracing::info!(
        processes = config.processes.len(),
        variables = config.variables.len(),
        systematics = plan.systematics.len(),
        "config validated"
    );
    Ok((config, plan))
}

fn load_sample(path: &PathBuf) -> Result<SampleInfo> {
    SampleInfo::from_path(path).with_context(|| format!("failed to read sample metadata {}", path.display()))
}

fn cmd_plan(config: &PathBuf, sample: Option<&PathBuf>, output: Option<&PathBuf>) -> Result<()> {
    let (config, plan) = load_config(config)?;
    let sample = match sample {
        Some(path) => load_sample(path)?,
        None => SampleInfo::new(),
    };
    let registry = HistogramRegistry::initialize(&config.processes, &config.variables, &plan.systematics, &sample)?;

    let systematics: Vec<serde_json::Value> = registry
        .systematics()
        .iter()
        .map(|rs| {
            let derived = match &rs.layout {
                VariantLayout::Ensemble { envelope, rms, .. } => {
                    envelope.iter().chain(rms.iter()).flat_map(|(u, d)| [u.clone(), d.clone()]).collect()
                }
                VariantLayout::Pairs(_) => Vec::new(),
            };
            json!({
                "name": rs.systematic.name,
                "kind": rs.systematic.kind.to_string(),
                "filled": rs.layout.filled_variant_names(),
                "derived": derived,
            })
        })
        .collect();
    let keys: Vec<String> = registry.keys().iter().map(|k| k.to_string()).collect();

    write_json(
        output,
        json!({
            "systematics": systematics,
            "dropped": plan.dropped,
            "accumulators": keys,
        }),
    )
}

fn cmd_run(
    config: &PathBuf,
    events: &PathBuf,
    sample: Option<&PathBuf>,
    output: Option<&PathBuf>,
    shard_size: usize,
    threads: usize,
) -> Result<()> {
    if threads > 0 {
        // Best-effort; if a global pool already exists, keep going.
        let _ = rayon::ThreadPoolBuilder::new().num_threads(threads).build_global();
    }

    let (config, plan) = load_config(config)?;
    let events = RecordedEvent::read_jsonl(events)
        .with_context(|| format!("failed to read events {}", events.display()))?;
    tracing::info!(events = events.len(), "events loaded");

    let sample = match (sample, FirstEventMetadata::first_simulated(&events)) {
        (Some(path), _) => load_sample(path)?,
        (None, Some(meta)) => SampleInfo::discover(&meta, &plan.systematics),
        (None, None) => SampleInfo::new(),
    };

    let template = HistogramRegistry::initialize(&config.processes, &config.variables, &plan.systematics, &sample)?;
    let rec = Recorded;
    let (registry, mut summary) = run_sharded(
        &template,
        &config,
        &sample,
        (&rec, &rec, &rec),
        &events,
        |e| e.process.as_str(),
        shard_size,
    )?;
    let histograms = finalize(registry, &config, &mut summary)?;
    summary.log_report();
    tracing::info!(histograms = histograms.len(), recoveries = summary.recoveries(), "run complete");

    let out = RunOutput { summary, histograms };
    match output {
        Some(path) => out.write_json(path)?,
        None => println!("{}", serde_json::to_string_pretty(&out)?),
    }
    Ok(())
}

fn write_json(output: Option<&PathBuf>, value: serde_json::Value) -> Result<()> {
    if let Some(path) = output {
        std::fs::write(path, serde_json::to_string_pretty(&value)?)?;
    } else {
        println!("{}", serde_json::to_string_pretty(&value)?);
    }
    Ok(())
}
