//! # Hermes Orchestrator Binary
//!
//! Runs a simulation described by a run configuration, validates such a
//! configuration, or lists the signals of a live segment.
//!
//! # Usage
//!
//! ```bash
//! # Run until end_time (or Ctrl-C), writing a JSON report
//! hermes run sim/run.toml --report out/report.json
//!
//! # Check a configuration
//! hermes validate sim/run.toml
//!
//! # Inspect a running simulation, with units from its run configuration
//! hermes signals /hermes_4242 --config sim/run.toml
//! ```

use clap::{Parser, Subcommand};
use hermes::{Scheduler, Supervisor, SupervisorResult};
use hermes_common::config::{ConfigLoader, ExecutionMode, LogLevel, RunConfig};
use hermes_common::shm::Segment;
use std::io;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::Ordering;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Hermes - shared-memory simulation orchestrator
#[derive(Parser, Debug)]
#[command(name = "hermes")]
#[command(author = "RTS007")]
#[command(version)]
#[command(about = "Drives simulation modules through a lockstep frame barrier")]
struct Args {
    #[command(subcommand)]
    command: Cmd,

    /// Enable verbose logging (DEBUG level).
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output logs in JSON format.
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Run a simulation.
    Run {
        /// Run configuration (TOML).
        config: PathBuf,

        /// Write a JSON run report here when the run ends.
        #[arg(long, value_name = "FILE")]
        report: Option<PathBuf>,
    },
    /// Load and validate a run configuration.
    Validate {
        config: PathBuf,
    },
    /// List every registered signal of a live segment.
    Signals {
        /// Segment name, e.g. /hermes_4242.
        segment: String,

        /// Run configuration to take declared signal units from.
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn main() {
    let args = Args::parse();
    let log_level = match &args.command {
        Cmd::Run { config, .. } | Cmd::Validate { config } => RunConfig::load(config)
            .map(|c| c.shared.log_level)
            .unwrap_or_default(),
        Cmd::Signals { .. } => LogLevel::Warn,
    };
    setup_tracing(&args, log_level);

    let result = match &args.command {
        Cmd::Run { config, report } => run(config, report.as_deref()),
        Cmd::Validate { config } => validate(config),
        Cmd::Signals { segment, config } => list_signals(segment, config.as_deref()),
    };
    if let Err(e) = result {
        error!("FATAL: {e}");
        process::exit(1);
    }
}

fn run(config_path: &Path, report_path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    info!("Hermes v{} starting...", env!("CARGO_PKG_VERSION"));
    let config = RunConfig::from_file(config_path)?;
    info!(
        "Config OK: {} module(s), {} wire(s), mode={:?}, rate={} Hz",
        config.modules.len(),
        config.wiring.len(),
        config.execution.mode,
        config.execution.rate_hz
    );

    let scheduler = Scheduler::new(&config.execution);
    let mut supervisor = Supervisor::new(config)?;

    // Setup signal handler for graceful shutdown.
    let stop = scheduler.stop_flag();
    ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        stop.store(true, Ordering::SeqCst);
    })?;

    let outcome = drive(&mut supervisor, &scheduler);
    supervisor.terminate()?;

    let report = supervisor.report();
    for fault in &report.faults {
        warn!("{fault}");
    }
    if let Some(path) = report_path {
        report.write_json(path)?;
        info!("Report written to {}", path.display());
    }
    info!(
        "Run finished: {} frame(s), t={:.6}s, {} fault(s)",
        report.frames,
        report.time,
        report.faults.len()
    );
    outcome.map_err(Into::into)
}

fn drive(supervisor: &mut Supervisor, scheduler: &Scheduler) -> SupervisorResult<()> {
    supervisor.spawn_all()?;
    supervisor.await_attached()?;
    supervisor.stage()?;
    match scheduler.mode() {
        ExecutionMode::SingleFrame => scheduler.run_interactive(supervisor, io::stdin().lock()),
        ExecutionMode::Afap | ExecutionMode::Realtime => scheduler.run(supervisor).map(|_| ()),
    }
}

fn validate(config_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let config = RunConfig::from_file(config_path)?;
    let declared: usize = config.modules.iter().map(|m| m.signals.len()).sum();
    info!(
        "{} is valid: {} module(s), {declared} declared signal(s), {} wire(s), dt={}ns",
        config_path.display(),
        config.modules.len(),
        config.wiring.len(),
        config.execution.dt_ns()
    );
    for module in &config.modules {
        match &module.executable {
            Some(exe) if !exe.exists() => warn!("{}: executable {} not found", module.name, exe.display()),
            Some(_) => {}
            None => info!("{}: no executable, expected to attach externally", module.name),
        }
    }
    Ok(())
}

fn list_signals(name: &str, config: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let segment = Segment::attach(name)?;
    let mut signals = segment.all_signals();
    if let Some(path) = config {
        RunConfig::from_file(path)?.annotate_units(&mut signals);
    }
    let header = segment.header();
    println!(
        "{name}: frame {} time {:.6}s generation {}",
        header.frame(),
        header.time(),
        header.generation()
    );
    println!("{:<48} {:<5} {:<3} {:<8} VALUE", "SIGNAL", "TYPE", "RW", "UNIT");
    for signal in &signals {
        println!(
            "{:<48} {:<5} {:<3} {:<8} {}",
            signal.qualified_name(),
            signal.kind.to_string(),
            if signal.writable { "rw" } else { "ro" },
            signal.unit.as_deref().unwrap_or("-"),
            signal.value
        );
    }
    Ok(())
}

/// Setup tracing subscriber based on CLI arguments.
///
/// `RUST_LOG` wins over both `--verbose` and the configured level.
fn setup_tracing(args: &Args, log_level: LogLevel) {
    let level = if args.verbose { LogLevel::Debug } else { log_level };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_directive()));

    if args.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .compact()
            .init();
    }
}
