//! Acquisition worker
//!
//! Runs one measurement session end-to-end against an [`Instrument`]:
//!
//! 1. Identify the instrument and announce the session
//! 2. Apply source range, compliance and integration time
//! 3. Run the [sweep](sweep) or [collection](collection) algorithm
//! 4. Bring the source back to 0 V and close the handle, on every exit path
//!
//! Events go to a [`SessionObserver`]. Cancellation is cooperative through a
//! [`CancellationToken`] checked between instrument exchanges, never in the
//! middle of one.
//!
//! # Failure policy
//!
//! | Error                  | Effect                                          |
//! |------------------------|-------------------------------------------------|
//! | `Timeout`              | Warning, point skipped; fatal at the threshold  |
//! | `Range`                | Warning, point skipped                          |
//! | anything else          | Session faulted                                 |
//!
//! A successful reading resets the consecutive-timeout count.

pub mod collection;
pub mod sweep;

pub use sweep::sweep_voltages;

use crate::error::EngineError;
use crate::instrument::{Instrument, SourceSetup};
use crate::types::{
    EndReason, MeasurementParameters, Progress, Sample, SessionEvent, Warning, WarningKind,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Granularity of cancellable waits
const WAIT_SLICE: Duration = Duration::from_millis(5);

/// Cooperative cancellation flag shared between the engine and a worker
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    /// Sleep until `deadline`, waking early on cancellation
    ///
    /// Returns `false` if cancelled.
    pub fn wait_until(&self, deadline: Instant) -> bool {
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep((deadline - now).min(WAIT_SLICE));
        }
    }
}

/// Receives everything a worker produces
pub trait SessionObserver: Send {
    fn on_event(&mut self, event: SessionEvent);

    /// Called once, as soon as the session becomes unrecoverable and before
    /// the source is brought back to 0 V
    fn on_fault(&mut self, _cause: &str) {}
}

impl SessionObserver for Vec<SessionEvent> {
    fn on_event(&mut self, event: SessionEvent) {
        self.push(event);
    }
}

/// Instrument-level settings for a session
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AcquisitionSettings {
    /// Consecutive timeouts that fault the session
    pub timeout_fault_threshold: u32,
    /// Source range in volts
    pub source_range: f64,
    /// Current compliance in amperes
    pub compliance: f64,
    /// Integration time used for sweeps, in power-line cycles
    pub sweep_nplc: f64,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            timeout_fault_threshold: 3,
            source_range: 210.0,
            compliance: 1e-3,
            sweep_nplc: 1.0,
        }
    }
}

/// How a session algorithm finished
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Outcome {
    Completed,
    Cancelled,
    Fatal(String),
}

/// State shared by the sweep and collection algorithms
pub(crate) struct SessionContext<'a> {
    pub instrument: &'a mut dyn Instrument,
    pub observer: &'a mut dyn SessionObserver,
    pub cancel: &'a CancellationToken,
    pub started: Instant,
    next_index: u64,
    consecutive_timeouts: u32,
    timeout_threshold: u32,
}

impl<'a> SessionContext<'a> {
    fn new(
        instrument: &'a mut dyn Instrument,
        observer: &'a mut dyn SessionObserver,
        cancel: &'a CancellationToken,
        timeout_threshold: u32,
    ) -> Self {
        Self {
            instrument,
            observer,
            cancel,
            started: Instant::now(),
            next_index: 0,
            consecutive_timeouts: 0,
            timeout_threshold: timeout_threshold.max(1),
        }
    }

    pub fn emit(&mut self, event: SessionEvent) {
        self.observer.on_event(event);
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn emit_sample(&mut self, timestamp: Duration, applied_voltage: Option<f64>, current: f64) {
        let sample = Sample {
            sequence_index: self.next_index,
            timestamp,
            applied_voltage,
            measured_current: current,
        };
        self.next_index += 1;
        self.emit(SessionEvent::Sample(sample));
    }

    pub fn emit_progress(&mut self, progress: Progress) {
        self.emit(SessionEvent::Progress(progress));
    }

    /// Record a good reading
    pub fn reading_succeeded(&mut self) {
        self.consecutive_timeouts = 0;
    }

    /// Classify a failed exchange
    ///
    /// Returns `Err(cause)` if the session cannot continue.
    pub fn point_failed(&mut self, err: EngineError) -> std::result::Result<(), String> {
        match err.root() {
            EngineError::Timeout(_) => {
                self.consecutive_timeouts += 1;
                let count = self.consecutive_timeouts;
                tracing::warn!(
                    "Instrument timeout ({} of {} consecutive): {}",
                    count,
                    self.timeout_threshold,
                    err
                );
                self.emit(SessionEvent::Warning(Warning::new(
                    WarningKind::Timeout,
                    format!("{} ({} of {} consecutive)", err, count, self.timeout_threshold),
                )));
                if count >= self.timeout_threshold {
                    Err(format!("{} consecutive instrument timeouts: {}", count, err))
                } else {
                    Ok(())
                }
            }
            EngineError::Range { .. } => {
                tracing::warn!("Skipping point: {}", err);
                self.emit(SessionEvent::Warning(Warning::new(
                    WarningKind::OutOfRange,
                    err.to_string(),
                )));
                Ok(())
            }
            _ => Err(err.to_string()),
        }
    }
}

/// Runs one session against an instrument it owns
pub struct AcquisitionWorker {
    instrument: Box<dyn Instrument>,
    parameters: MeasurementParameters,
    settings: AcquisitionSettings,
    cancel: CancellationToken,
    shut_down: bool,
}

impl AcquisitionWorker {
    pub fn new(
        instrument: Box<dyn Instrument>,
        parameters: MeasurementParameters,
        settings: AcquisitionSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            instrument,
            parameters,
            settings,
            cancel,
            shut_down: false,
        }
    }

    /// Run the session to completion, cancellation or fault
    ///
    /// The instrument is de-energized and closed before this returns, and is
    /// dropped with the worker. If the session unwinds instead, dropping the
    /// worker still brings the source back to 0 V.
    pub fn run(mut self, observer: &mut dyn SessionObserver) -> EndReason {
        let mode = self.parameters.mode();
        tracing::info!("{} session started on {}", mode, self.instrument.description());

        let outcome = {
            let mut ctx = SessionContext::new(
                self.instrument.as_mut(),
                observer,
                &self.cancel,
                self.settings.timeout_fault_threshold,
            );
            let outcome = match prepare(&mut ctx, &self.parameters, &self.settings) {
                Err(cause) => Outcome::Fatal(cause),
                Ok(()) => match &self.parameters {
                    MeasurementParameters::Sweep(p) => sweep::run(&mut ctx, p),
                    MeasurementParameters::Collection(p) => collection::run(&mut ctx, p),
                },
            };
            if let Outcome::Fatal(cause) = &outcome {
                tracing::error!("{} session faulted: {}", mode, cause);
                ctx.observer.on_fault(cause);
            }
            outcome
        };

        self.shut_down(observer);

        match outcome {
            Outcome::Completed => EndReason::Completed,
            Outcome::Cancelled => EndReason::StoppedByUser,
            Outcome::Fatal(cause) => EndReason::Faulted { cause },
        }
    }

    fn shut_down(&mut self, observer: &mut dyn SessionObserver) {
        self.shut_down = true;
        if let Err(e) = self.instrument.source_voltage(0.0) {
            tracing::error!("Failed to return source to 0 V: {}", e);
            observer.on_event(SessionEvent::Warning(Warning::new(
                WarningKind::Shutdown,
                format!("Failed to return source to 0 V: {}", e),
            )));
        }
        if let Err(e) = self.instrument.close() {
            tracing::warn!("Failed to close instrument: {}", e);
            observer.on_event(SessionEvent::Warning(Warning::new(
                WarningKind::Shutdown,
                format!("Failed to close instrument: {}", e),
            )));
        }
    }
}

impl Drop for AcquisitionWorker {
    fn drop(&mut self) {
        if self.shut_down {
            return;
        }
        tracing::warn!("Session ended without shutdown, returning source to 0 V");
        if let Err(e) = self.instrument.source_voltage(0.0) {
            tracing::error!("Failed to return source to 0 V: {}", e);
        }
        if let Err(e) = self.instrument.close() {
            tracing::warn!("Failed to close instrument: {}", e);
        }
    }
}

fn prepare(
    ctx: &mut SessionContext<'_>,
    parameters: &MeasurementParameters,
    settings: &AcquisitionSettings,
) -> std::result::Result<(), String> {
    let identity = ctx
        .instrument
        .identify()
        .map_err(|e| format!("Identification failed: {}", e))?;
    ctx.emit(SessionEvent::Started {
        mode: parameters.mode(),
        instrument: identity,
    });

    let integration_nplc = match parameters {
        MeasurementParameters::Sweep(_) => settings.sweep_nplc,
        MeasurementParameters::Collection(p) => p.aperture_time,
    };
    ctx.instrument
        .configure(&SourceSetup {
            source_range: settings.source_range,
            compliance: settings.compliance,
            integration_nplc,
        })
        .map_err(|e| format!("Configuration failed: {}", e))
}
