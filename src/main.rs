//! SMU measurement shell - Main Entry Point
//!
//! Headless front end for the measurement engine. Builds session parameters
//! from the persisted configuration plus command-line overrides, runs one
//! session and reports its events through the log.

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use crossbeam_channel::{never, select, Receiver};
use smu_daq::config::{config_path, ConfigStore, JsonConfigStore};
use smu_daq::instrument::InstrumentFactory;
use smu_daq::types::{Progress, SessionRequest};
use smu_daq::{EndReason, InstrumentFamily, MeasurementConfig, MeasurementEngine, SessionEvent};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "smu-daq", version, about = "Voltage sweeps and current collection on an SMU")]
struct Cli {
    /// Config file to use instead of the one in the data directory
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Use the simulated instrument
    #[arg(long, global = true)]
    simulate: bool,

    /// Seed for the simulated instrument
    #[arg(long, global = true)]
    seed: Option<u64>,

    /// Instrument resource, e.g. ASRL3::INSTR or TCPIP0::192.168.0.7::5025::SOCKET
    #[arg(long, global = true)]
    resource: Option<String>,

    /// Instrument family (6517a, b2901a)
    #[arg(long, global = true)]
    family: Option<InstrumentFamily>,

    /// Directory for generated output file names
    #[arg(long, global = true)]
    output_dir: Option<PathBuf>,

    /// Also write a daily rolling log file to this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a triangular voltage sweep
    Sweep(SweepArgs),
    /// Collect current at a fixed bias until stopped
    Collect(CollectArgs),
    /// Print the instrument identification string
    Identify,
    /// Print the effective configuration
    Config,
}

#[derive(Args, Debug)]
struct SweepArgs {
    /// Start voltage (V)
    #[arg(long, allow_hyphen_values = true)]
    start: Option<f64>,
    /// End voltage (V)
    #[arg(long, allow_hyphen_values = true)]
    end: Option<f64>,
    /// Voltage step (V)
    #[arg(long)]
    step: Option<f64>,
    /// Dwell per point (s)
    #[arg(long)]
    dwell: Option<f64>,
    /// Output CSV path
    #[arg(long)]
    save: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct CollectArgs {
    /// Bias voltage (V)
    #[arg(long, allow_hyphen_values = true)]
    bias: Option<f64>,
    /// Aperture time (PLC)
    #[arg(long)]
    aperture: Option<f64>,
    /// Readings averaged per sample
    #[arg(long)]
    average: Option<u32>,
    /// Seconds between samples
    #[arg(long)]
    interval: Option<f64>,
    /// Forward every raw reading
    #[arg(long)]
    fast: bool,
    /// Stop after this many seconds; otherwise press Enter to stop
    #[arg(long)]
    duration: Option<f64>,
    /// Output CSV path
    #[arg(long)]
    save: Option<PathBuf>,
}

fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,smu_daq=debug"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "smu-daq.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            registry.init();
            None
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.log_dir.as_deref());

    let store = match &cli.config {
        Some(path) => Some(JsonConfigStore::new(path)),
        None => match JsonConfigStore::default_location() {
            Ok(store) => Some(store),
            Err(e) => {
                tracing::warn!("No config location available: {}", e);
                None
            }
        },
    };
    let mut config = match &store {
        Some(store) => store
            .load()
            .with_context(|| format!("Failed to load {}", store.path().display()))?,
        None => MeasurementConfig::default(),
    };
    apply_overrides(&mut config, &cli);

    match cli.command {
        Command::Config => {
            if let Some(path) = store.as_ref().map(|s| s.path().to_path_buf()).or_else(config_path) {
                println!("# {}", path.display());
            }
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Command::Identify => identify(&config),
        Command::Sweep(args) => {
            let mut params = config.sweep_parameters();
            if let Some(v) = args.start {
                params.start_voltage = v;
            }
            if let Some(v) = args.end {
                params.end_voltage = v;
            }
            if let Some(v) = args.step {
                params.voltage_step = v;
            }
            if let Some(v) = args.dwell {
                params.time_step = v;
            }
            let request = with_save_path(SessionRequest::new(params), args.save, &config);
            run_session(&config, store, request, None)
        }
        Command::Collect(args) => {
            let mut params = config.collection_parameters();
            if let Some(v) = args.bias {
                params.bias_voltage = v;
            }
            if let Some(v) = args.aperture {
                params.aperture_time = v;
            }
            if let Some(v) = args.average {
                params.noise_average = v;
            }
            if let Some(v) = args.interval {
                params.acquisition_interval = v;
            }
            if args.fast {
                params.fast_acquisition = true;
            }
            let stop_after = args.duration.map(collection_time).transpose()?;
            let request = with_save_path(SessionRequest::new(params), args.save, &config);
            run_session(&config, store, request, stop_after)
        }
    }
}

fn collection_time(secs: f64) -> anyhow::Result<Duration> {
    match Duration::try_from_secs_f64(secs) {
        Ok(duration) => Ok(duration),
        Err(e) => bail!("Invalid duration {}: {}", secs, e),
    }
}

fn apply_overrides(config: &mut MeasurementConfig, cli: &Cli) {
    if cli.simulate {
        config.simulation = true;
    }
    if cli.seed.is_some() {
        config.simulation_seed = cli.seed;
    }
    if let Some(family) = cli.family {
        config.instrument.family = family;
    }
    if let Some(resource) = &cli.resource {
        config.instrument.resource = Some(resource.clone());
    }
    if let Some(dir) = &cli.output_dir {
        config.output_dir = Some(dir.clone());
    }
}

fn with_save_path(
    request: SessionRequest,
    save: Option<PathBuf>,
    config: &MeasurementConfig,
) -> SessionRequest {
    match save.or_else(|| config.save_path()) {
        Some(path) => request.save_to(path),
        None => request,
    }
}

fn identify(config: &MeasurementConfig) -> anyhow::Result<()> {
    let connection = config.connection_factory().open();
    if let Some(reason) = &connection.fallback_reason {
        tracing::warn!("Instrument unavailable ({}), using simulated instrument", reason);
    }
    let mut instrument = connection.instrument;
    let identity = instrument.identify().context("Identification query failed")?;
    println!("{}", identity);
    instrument.close()?;
    Ok(())
}

/// Signals once for every line typed on stdin
fn watch_stdin() -> Receiver<()> {
    let (tx, rx) = crossbeam_channel::bounded(1);
    let spawned = std::thread::Builder::new()
        .name("stdin".to_string())
        .spawn(move || {
            let mut line = String::new();
            while matches!(std::io::stdin().read_line(&mut line), Ok(n) if n > 0) {
                if tx.send(()).is_err() {
                    break;
                }
                line.clear();
            }
        });
    if let Err(e) = spawned {
        tracing::warn!("Cannot watch stdin for a stop request: {}", e);
    }
    rx
}

fn run_session(
    config: &MeasurementConfig,
    store: Option<JsonConfigStore>,
    request: SessionRequest,
    stop_after: Option<Duration>,
) -> anyhow::Result<()> {
    let (engine, events) = MeasurementEngine::from_config(config);
    let engine = match store {
        Some(store) => engine.with_config_store(Arc::new(store)),
        None => engine,
    };

    engine.start(request)?;
    tracing::info!("Press Enter to stop");

    let stop_requests = watch_stdin();
    let mut stdin_open = true;
    let mut deadline = stop_after.map(|d| Instant::now() + d);

    let (reason, output_path) = loop {
        let stop_timer = match deadline {
            Some(at) => crossbeam_channel::at(at),
            None => never(),
        };
        let stop_source = if stdin_open {
            stop_requests.clone()
        } else {
            never()
        };
        select! {
            recv(events.receiver()) -> event => match event {
                Ok(SessionEvent::SessionEnded { reason, output_path }) => break (reason, output_path),
                Ok(event) => report(&event),
                Err(_) => bail!("Engine event channel closed"),
            },
            recv(stop_source) -> request => match request {
                Ok(()) => engine.stop(),
                Err(_) => stdin_open = false,
            },
            recv(stop_timer) -> _ => {
                tracing::info!("Collection time elapsed");
                engine.stop();
                deadline = None;
            }
        }
    };

    match &output_path {
        Some(path) => tracing::info!("Data saved to {}", path.display()),
        None if engine.has_unflushed_data() => match engine.retry_flush() {
            Ok(path) => tracing::info!("Data saved to {} on retry", path.display()),
            Err(e) => tracing::error!("Data could not be saved: {}", e),
        },
        None => {}
    }

    match reason {
        EndReason::Faulted { cause } => bail!("Session faulted: {}", cause),
        reason => {
            tracing::info!("Session ended: {}", reason);
            Ok(())
        }
    }
}

fn report(event: &SessionEvent) {
    match event {
        SessionEvent::Started { mode, instrument } => {
            tracing::info!("{} session started on {}", mode, instrument)
        }
        SessionEvent::Progress(Progress::Fraction(f)) => {
            tracing::debug!("Progress {:.0}%", f * 100.0)
        }
        SessionEvent::Progress(Progress::Elapsed(elapsed)) => {
            tracing::trace!("Elapsed {:.1}s", elapsed.as_secs_f64())
        }
        SessionEvent::Sample(sample) => match sample.applied_voltage {
            Some(voltage) => tracing::info!(
                "#{} t={:.3}s V={} I={:.4e}",
                sample.sequence_index,
                sample.timestamp.as_secs_f64(),
                voltage,
                sample.measured_current
            ),
            None => tracing::info!(
                "#{} t={:.3}s I={:.4e}",
                sample.sequence_index,
                sample.timestamp.as_secs_f64(),
                sample.measured_current
            ),
        },
        SessionEvent::RawReading {
            timestamp,
            measured_current,
        } => tracing::debug!(
            "raw t={:.3}s I={:.4e}",
            timestamp.as_secs_f64(),
            measured_current
        ),
        SessionEvent::Warning(warning) => {
            tracing::warn!("{:?}: {}", warning.kind, warning.message)
        }
        SessionEvent::SessionEnded { reason, .. } => tracing::info!("Session ended: {}", reason),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_time() {
        assert_eq!(collection_time(2.5).unwrap(), Duration::from_millis(2500));
        assert_eq!(collection_time(0.0).unwrap(), Duration::ZERO);
        assert!(collection_time(1e300).is_err());
        assert!(collection_time(-1.0).is_err());
        assert!(collection_time(f64::NAN).is_err());
    }
}
