//! Replifactory: command-line entry point.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                      Adapters (outer ring)                     │
//! │                                                                │
//! │  SimulatedDevice   LogEventSink   File/Memory   SystemClock    │
//! │  (DevicePort)      (EventSink)    (Storage)     (ClockPort)    │
//! │                                                                │
//! │  ──────────────── Port Trait Boundary ───────────────────      │
//! │                                                                │
//! │  ┌────────────────────────────────────────────────────────┐    │
//! │  │            ExperimentManager (lifecycle)               │    │
//! │  │  Cultures · Policies · Resource locks                  │    │
//! │  └────────────────────────────────────────────────────────┘    │
//! │                                                                │
//! │  Scheduler (delegate-driven) · measurement / dilution workers  │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Usage: `replifactory --config experiment.json --simulate --duration-secs 600 --state-dir state/`

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::Parser;
use log::{info, warn};

use replifactory::adapters::file_store::FileStore;
use replifactory::adapters::log_sink::LogEventSink;
use replifactory::adapters::memory_store::MemoryStore;
use replifactory::adapters::sim_device::{SimParams, SimulatedDevice};
use replifactory::adapters::time::SystemClock;
use replifactory::app::ports::StoragePort;
use replifactory::app::service::ExperimentManager;
use replifactory::config::ExperimentConfig;
use replifactory::diagnostics;

/// How often the main loop checks engine health.
const HEALTH_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Parser)]
#[command(name = "replifactory", version, about = "Multi-vial culture control engine")]
struct Args {
    /// Experiment definition (JSON).
    #[arg(short, long)]
    config: PathBuf,

    /// Run against the built-in simulated bioreactor.
    #[arg(long)]
    simulate: bool,

    /// Stop after this many seconds; runs until an engine thread dies
    /// otherwise.
    #[arg(long)]
    duration_secs: Option<u64>,

    /// Print the final culture statuses as JSON on stdout.
    #[arg(long)]
    json: bool,

    /// Keep culture snapshots and the failure log in this directory, so a
    /// later run resumes where this one stopped.  Held in memory otherwise.
    #[arg(long)]
    state_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    diagnostics::install_panic_handler();
    let args = Args::parse();

    info!("╔══════════════════════════════════════╗");
    info!("║  Replifactory v{}                  ║", env!("CARGO_PKG_VERSION"));
    info!("╚══════════════════════════════════════╝");

    // ── 1. Load the experiment ────────────────────────────────
    let config = ExperimentConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    info!(
        "Experiment '{}': {} cultures",
        config.name,
        config.cultures.len()
    );

    // ── 2. Construct adapters ─────────────────────────────────
    if !args.simulate {
        bail!("no hardware driver is built into this binary; rerun with --simulate");
    }
    let clock = Arc::new(SystemClock::new());
    let stock = config
        .cultures
        .iter()
        .map(|c| c.medium2_stock_concentration)
        .fold(0.0, f64::max);
    let device = Arc::new(SimulatedDevice::new(
        clock.clone(),
        SimParams {
            medium2_stock_concentration: stock,
            ..SimParams::default()
        },
    ));

    // ── 3. Construct the manager ──────────────────────────────
    let storage: Arc<dyn StoragePort> = match &args.state_dir {
        Some(dir) => Arc::new(
            FileStore::open(dir)
                .with_context(|| format!("opening state directory {}", dir.display()))?,
        ),
        None => Arc::new(MemoryStore::new()),
    };
    let manager = ExperimentManager::new(clock.clone(), Arc::new(LogEventSink::new()))
        .with_storage(storage);
    manager.set_device(device).context("installing device")?;
    manager.connect_device().context("connecting device")?;
    manager
        .set_current_experiment(config)
        .context("selecting experiment")?;

    let report = manager.start_experiment().context("starting experiment")?;
    for (vial, reason) in &report.rejected {
        warn!("Vial {vial} not started: {reason}");
    }

    // ── 4. Supervise ──────────────────────────────────────────
    let started = Instant::now();
    let deadline = args.duration_secs.map(Duration::from_secs);
    let mut last_health = Instant::now();
    loop {
        std::thread::sleep(Duration::from_millis(250));
        if deadline.is_some_and(|d| started.elapsed() >= d) {
            info!("Run duration reached");
            break;
        }
        if last_health.elapsed() >= HEALTH_INTERVAL {
            last_health = Instant::now();
            if let Err(e) = manager.check_status() {
                log::error!("Engine unhealthy: {e}");
                break;
            }
            if let Some(m) = manager.metrics() {
                info!(
                    "Health: uptime={:.0}s ticks={} measure={}/{} dilute={}/{} failures={}",
                    m.uptime_secs,
                    m.scheduler_ticks,
                    m.measurement.completed,
                    m.measurement.failed,
                    m.dilution.completed,
                    m.dilution.failed,
                    m.failures_total
                );
            }
        }
    }

    // ── 5. Shut down ──────────────────────────────────────────
    let statuses = manager.statuses();
    manager.stop_experiment().context("stopping experiment")?;
    manager.disconnect_device().context("disconnecting device")?;

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&statuses).context("rendering statuses")?
        );
    }
    Ok(())
}
