//! Command-line replay tool: the thin driver around the library core.
//!
//! Argument parsing and exit-code mapping live here only because a process
//! needs *some* front door; none of the adaptation logic, replay sampling,
//! or snapshot format lives in this file.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use adhash::config::{Policy, ReplayLimits, StartBackend};
use adhash::dna::{DnaAnalyzer, DnaAnalyzerConfig};
use adhash::error::EngineError;
use adhash::replay::{parse_stream, ReplayEngineConfig, SamplingConfig};
use adhash::snapshot::{
    adaptive_map_from_payload, adaptive_map_to_payload, repair_payload, verify_payload, SnapshotCodec,
};
use adhash::ReplayEngine;

#[derive(Parser)]
#[command(name = "adhash")]
#[command(about = "Adaptive hash map engine: replay, snapshot, and DNA analysis tools", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Emit a structured JSON error envelope on stderr instead of plain text.
    #[arg(long, global = true)]
    structured_errors: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a op,key,value CSV stream against an AdaptiveMap and print a run summary.
    Replay {
        /// Path to the CSV operation stream (header: op,key,value).
        input: PathBuf,
        /// Starting backend.
        #[arg(long, value_enum, default_value = "chaining")]
        start: StartArg,
        /// Sample every Nth operation for latency reservoirs.
        #[arg(long, default_value_t = 128)]
        sample_stride: u64,
        /// Reservoir capacity.
        #[arg(long, default_value_t = 1000)]
        reservoir_k: usize,
        /// Fixed seed for deterministic reservoir sampling (unset = OS RNG).
        #[arg(long)]
        seed: Option<u64>,
        /// Write the final AdaptiveMap to this snapshot path when done.
        #[arg(long)]
        save_snapshot: Option<PathBuf>,
        /// Write newline-delimited tick records to this log file.
        #[arg(long)]
        tick_log: Option<PathBuf>,
        /// Keep only the last N ticks in `--tick-log`, rewriting it on each
        /// emission instead of appending forever.
        #[arg(long)]
        tick_log_retention: Option<usize>,
    },
    /// Inspect a workload stream's shape without running it against a map.
    Dna {
        /// Path to the CSV operation stream (header: op,key,value).
        input: PathBuf,
    },
    /// Validate and optionally repair a snapshot file in place.
    Snapshot {
        #[command(subcommand)]
        action: SnapshotAction,
    },
}

#[derive(Subcommand)]
enum SnapshotAction {
    /// Verify structural invariants of a saved snapshot.
    Verify { path: PathBuf },
    /// Verify, and if the backend is Robin Hood, compact and rewrite it.
    Repair { path: PathBuf },
}

#[derive(Clone, clap::ValueEnum)]
enum StartArg {
    Chaining,
    Robinhood,
}

impl From<StartArg> for StartBackend {
    fn from(value: StartArg) -> Self {
        match value {
            StartArg::Chaining => StartBackend::Chaining,
            StartArg::Robinhood => StartBackend::RobinHood,
        }
    }
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if cli.structured_errors {
                eprintln!("{}", e.to_envelope());
            } else {
                eprintln!("error: {e}");
            }
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

fn run(cli: &Cli) -> Result<(), EngineError> {
    match &cli.command {
        Commands::Replay {
            input,
            start,
            sample_stride,
            reservoir_k,
            seed,
            save_snapshot,
            tick_log,
            tick_log_retention,
        } => replay(
            input,
            start.clone().into(),
            *sample_stride,
            *reservoir_k,
            *seed,
            save_snapshot.as_deref(),
            tick_log.as_deref(),
            *tick_log_retention,
        ),
        Commands::Dna { input } => dna(input),
        Commands::Snapshot { action } => match action {
            SnapshotAction::Verify { path } => snapshot_verify(path, false),
            SnapshotAction::Repair { path } => snapshot_verify(path, true),
        },
    }
}

fn replay(
    input: &std::path::Path,
    start: StartBackend,
    stride: u64,
    k: usize,
    seed: Option<u64>,
    save_snapshot: Option<&std::path::Path>,
    tick_log: Option<&std::path::Path>,
    tick_log_retention: Option<usize>,
) -> Result<(), EngineError> {
    let raw = std::fs::read(input)?;
    let ops = parse_stream(&raw, &ReplayLimits::default())?;

    let cfg = ReplayEngineConfig {
        sampling: SamplingConfig { stride, k, seed },
        ..ReplayEngineConfig::default()
    };
    let mut engine = ReplayEngine::new(Policy::default(), start, cfg, 4096)?;

    // Ticks are streamed to the log file as they are emitted, not dumped
    // from the bus's bounded ring after the fact — a long run with more
    // ticks than the bus retains would otherwise lose the early ones.
    if let Some(path) = tick_log {
        let mut writer = adhash::telemetry::TickLogWriter::create(path, tick_log_retention)?;
        engine.set_tick_sink(Box::new(move |tick| {
            if let Err(e) = writer.write_tick(tick) {
                log::warn!("failed to write tick log entry: {e}");
            }
        }));
    }

    let summary = engine.run(&ops)?;

    if let Some(path) = save_snapshot {
        let payload = adaptive_map_to_payload(engine.map());
        SnapshotCodec::default().save(path, &payload, false)?;
    }

    println!(
        "{}",
        serde_json::to_string_pretty(&summary).map_err(|e| EngineError::IoError(e.to_string()))?
    );
    Ok(())
}

fn dna(input: &std::path::Path) -> Result<(), EngineError> {
    let raw = std::fs::read(input)?;
    let ops = parse_stream(&raw, &ReplayLimits::default())?;
    let mut analyzer = DnaAnalyzer::new(DnaAnalyzerConfig::default());
    for op in &ops {
        analyzer.observe(op);
    }
    let report = analyzer.finish();
    println!(
        "{}",
        serde_json::to_string_pretty(&report).map_err(|e| EngineError::IoError(e.to_string()))?
    );
    Ok(())
}

fn snapshot_verify(path: &std::path::Path, repair: bool) -> Result<(), EngineError> {
    let codec = SnapshotCodec::default();
    let mut payload = codec.load(path)?;
    let report = verify_payload(&payload);
    println!("{report:?}");
    if repair {
        if repair_payload(&mut payload) {
            codec.save(path, &payload, false)?;
            let reverified = verify_payload(&codec.load(path)?);
            println!("repaired, re-verify: {reverified:?}");
        } else {
            return Err(EngineError::PolicyViolation(
                "repair requested on a snapshot with no Robin Hood backend to compact".into(),
            ));
        }
    }
    // Loading the payload back into an AdaptiveMap and re-attaching hooks is
    // the caller's responsibility once past verification; doing it here too
    // catches a backend-label/table-variant mismatch the above structural
    // checks don't look for.
    adaptive_map_from_payload(payload)?;
    Ok(())
}
