//! Measurement engine
//!
//! The engine owns the session lifecycle. It validates requests, spawns one
//! acquisition thread per session, forwards the worker's events to the shell
//! and to the [`DataSink`], and commits the data when the session ends.
//!
//! # State machine
//!
//! ```text
//!            start()                 stop()
//!   Idle ────────────▶ Running ─────────────▶ Stopping ──┐
//!    ▲                    │                      │       │
//!    │                    │ fatal error          │       │ finalized
//!    │                    ▼                      ▼       │
//!    │                 Faulted ◀─────────────────┘       │
//!    │                    │ finalized                    │
//!    └────────────────────┴──────────────────────────────┘
//! ```
//!
//! Finalization means: source at 0 V, instrument closed, samples committed.
//! The state returns to `Idle` and `SessionEnded` is sent while the state
//! lock is held, so the events of a session started in reaction to
//! `SessionEnded` always come after it.
//!
//! # Example
//!
//! ```ignore
//! use smu_daq::config::MeasurementConfig;
//! use smu_daq::engine::MeasurementEngine;
//! use smu_daq::types::SessionEvent;
//!
//! let config = MeasurementConfig::load_or_default();
//! let (engine, events) = MeasurementEngine::from_config(&config);
//! engine.start(config.sweep_parameters())?;
//!
//! for event in events.iter() {
//!     if let SessionEvent::SessionEnded { reason, output_path } = event {
//!         println!("{} -> {:?}", reason, output_path);
//!         break;
//!     }
//! }
//! ```

use crate::acquisition::{AcquisitionSettings, AcquisitionWorker, CancellationToken, SessionObserver};
use crate::config::{ConfigStore, MeasurementConfig};
use crate::error::{EngineError, Result};
use crate::instrument::InstrumentFactory;
use crate::session::{DataSink, OverwritePolicy};
use crate::types::{
    EndReason, MeasurementParameters, SessionEvent, SessionRequest, SessionState, Warning,
    WarningKind,
};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Engine-wide settings
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineSettings {
    pub acquisition: AcquisitionSettings,
    /// Directory for generated file names
    pub output_dir: Option<PathBuf>,
    pub overwrite: OverwritePolicy,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Receiving end of the engine's event channel
pub struct EngineEvents {
    receiver: Receiver<SessionEvent>,
}

impl EngineEvents {
    /// Try to receive an event without blocking
    pub fn try_recv(&self) -> Option<SessionEvent> {
        self.receiver.try_recv().ok()
    }

    /// Receive all pending events
    pub fn drain(&self) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.receiver.try_recv() {
            events.push(event);
        }
        events
    }

    /// Wait up to `timeout` for the next event
    pub fn recv_timeout(&self, timeout: Duration) -> Option<SessionEvent> {
        match self.receiver.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Blocking iterator over events, ends when the engine is dropped
    pub fn iter(&self) -> impl Iterator<Item = SessionEvent> + '_ {
        self.receiver.iter()
    }

    /// Underlying channel, for `select!`
    pub fn receiver(&self) -> &Receiver<SessionEvent> {
        &self.receiver
    }
}

/// State shared between the engine and its session thread
struct Shared {
    state: Mutex<SessionState>,
    events: Sender<SessionEvent>,
    unflushed: Mutex<Option<DataSink>>,
}

impl Shared {
    fn send(&self, event: SessionEvent) {
        // A shell that dropped its receiver no longer cares
        let _ = self.events.send(event);
    }

    fn fault(&self, cause: &str) {
        let mut state = lock(&self.state);
        if matches!(*state, SessionState::Running { .. } | SessionState::Stopping) {
            *state = SessionState::Faulted {
                cause: cause.to_string(),
            };
        }
    }

    /// Return to Idle and announce the end of the session
    fn finish(&self, reason: EndReason, output_path: Option<PathBuf>) {
        let mut state = lock(&self.state);
        *state = SessionState::Idle;
        self.send(SessionEvent::SessionEnded {
            reason,
            output_path,
        });
    }

    fn keep_unflushed(&self, sink: DataSink) {
        let mut pending = lock(&self.unflushed);
        if let Some(previous) = pending.as_ref() {
            tracing::warn!(
                "Discarding {} unsaved samples of an earlier session (intended for {})",
                previous.len(),
                previous.target_path().display()
            );
        }
        *pending = Some(sink);
    }
}

/// Forwards worker events to the shell and samples to the sink
struct EngineObserver {
    shared: Arc<Shared>,
    sink: DataSink,
}

impl SessionObserver for EngineObserver {
    fn on_event(&mut self, event: SessionEvent) {
        if let SessionEvent::Sample(sample) = &event {
            self.sink.push(*sample);
        }
        self.shared.send(event);
    }

    fn on_fault(&mut self, cause: &str) {
        self.shared.fault(cause);
    }
}

/// Everything one session thread needs
struct SessionRunner {
    shared: Arc<Shared>,
    factory: Arc<dyn InstrumentFactory>,
    request: SessionRequest,
    settings: EngineSettings,
    cancel: CancellationToken,
}

impl SessionRunner {
    fn run(self) {
        let mode = self.request.mode();
        let sink = DataSink::new(
            mode,
            chrono::Local::now(),
            self.request.save_path.clone(),
            self.settings.output_dir.clone(),
            self.settings.overwrite,
        );
        let mut observer = EngineObserver {
            shared: self.shared.clone(),
            sink,
        };

        let connection = self.factory.open();
        if let Some(reason) = &connection.fallback_reason {
            observer.on_event(SessionEvent::Warning(Warning::new(
                WarningKind::SimulationFallback,
                format!("Instrument unavailable ({}), using simulated instrument", reason),
            )));
        }

        let worker = AcquisitionWorker::new(
            connection.instrument,
            self.request.parameters,
            self.settings.acquisition,
            self.cancel.clone(),
        );
        let reason = worker.run(&mut observer);
        tracing::info!("{} session ended: {}", mode, reason);

        let mut sink = observer.sink;
        let output_path = if sink.is_empty() {
            tracing::info!("No samples recorded, nothing to save");
            None
        } else {
            match sink.flush() {
                Ok(path) => Some(path),
                Err(e) => {
                    tracing::error!("Failed to save session data: {}", e);
                    self.shared.send(SessionEvent::Warning(Warning::new(
                        WarningKind::SinkIo,
                        format!(
                            "Failed to save {} samples to {}: {}",
                            sink.len(),
                            sink.target_path().display(),
                            e
                        ),
                    )));
                    self.shared.keep_unflushed(sink);
                    None
                }
            }
        };

        self.shared.finish(reason, output_path);
    }
}

/// Owns the session lifecycle
pub struct MeasurementEngine {
    shared: Arc<Shared>,
    settings: EngineSettings,
    factory: Arc<dyn InstrumentFactory>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
    config_store: Option<Arc<dyn ConfigStore>>,
    recorded_config: Mutex<Option<MeasurementConfig>>,
}

impl MeasurementEngine {
    /// Create an engine and the receiver for its events
    pub fn new(
        settings: EngineSettings,
        factory: impl InstrumentFactory + 'static,
    ) -> (Self, EngineEvents) {
        let (tx, rx) = unbounded();
        let engine = Self {
            shared: Arc::new(Shared {
                state: Mutex::new(SessionState::Idle),
                events: tx,
                unflushed: Mutex::new(None),
            }),
            settings,
            factory: Arc::new(factory),
            cancel: CancellationToken::new(),
            worker: Mutex::new(None),
            config_store: None,
            recorded_config: Mutex::new(None),
        };
        (engine, EngineEvents { receiver: rx })
    }

    /// Create an engine from the persisted configuration
    pub fn from_config(config: &MeasurementConfig) -> (Self, EngineEvents) {
        Self::new(config.engine_settings(), config.connection_factory())
    }

    /// Record session parameters in a config store on every start and stop
    pub fn with_config_store(mut self, store: Arc<dyn ConfigStore>) -> Self {
        self.config_store = Some(store);
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Non-blocking snapshot of the session state
    pub fn current_state(&self) -> SessionState {
        lock(&self.shared.state).clone()
    }

    /// Start a session
    ///
    /// Fails with [`EngineError::AlreadyRunning`] unless the engine is idle,
    /// and with [`EngineError::Validation`] before any instrument I/O if the
    /// parameters are invalid.
    /// Reject a collection bias the configured source range cannot apply
    fn check_source_range(&self, parameters: &MeasurementParameters) -> Result<()> {
        let limit = self.settings.acquisition.source_range;
        match parameters {
            MeasurementParameters::Collection(p) if p.bias_voltage.abs() > limit => {
                Err(EngineError::Validation(format!(
                    "bias voltage {} V is outside the {} V source range",
                    p.bias_voltage, limit
                )))
            }
            _ => Ok(()),
        }
    }

    pub fn start(&self, request: impl Into<SessionRequest>) -> Result<()> {
        let request = request.into();
        let mut state = lock(&self.shared.state);
        if !state.is_idle() {
            return Err(EngineError::AlreadyRunning);
        }
        request.parameters.validate()?;
        self.check_source_range(&request.parameters)?;

        // The previous session thread is past its last state change
        if let Some(handle) = lock(&self.worker).take() {
            if handle.join().is_err() {
                tracing::error!("Previous acquisition thread panicked");
            }
        }

        let mode = request.mode();
        self.cancel.reset();
        *state = SessionState::Running {
            mode,
            started_at: Instant::now(),
        };

        let runner = SessionRunner {
            shared: self.shared.clone(),
            factory: self.factory.clone(),
            request: request.clone(),
            settings: self.settings.clone(),
            cancel: self.cancel.clone(),
        };
        let shared = self.shared.clone();
        let spawned = std::thread::Builder::new()
            .name("acquisition".to_string())
            .spawn(move || {
                if std::panic::catch_unwind(AssertUnwindSafe(|| runner.run())).is_err() {
                    tracing::error!("Acquisition thread panicked");
                    shared.finish(
                        EndReason::Faulted {
                            cause: "acquisition thread panicked".to_string(),
                        },
                        None,
                    );
                }
            });

        match spawned {
            Ok(handle) => *lock(&self.worker) = Some(handle),
            Err(e) => {
                *state = SessionState::Idle;
                return Err(EngineError::Io(e));
            }
        }
        drop(state);

        tracing::info!("Started {} session", mode);
        self.record_config(&request);
        Ok(())
    }

    /// Request cancellation of the running session
    ///
    /// Returns as soon as the request is registered; completion is signalled
    /// by `SessionEnded`. A no-op unless a session is running.
    pub fn stop(&self) {
        {
            let mut state = lock(&self.shared.state);
            if !state.is_running() {
                tracing::debug!("Stop ignored in state {}", state.display_name());
                return;
            }
            *state = SessionState::Stopping;
            self.cancel.cancel();
        }
        tracing::info!("Stop requested");
        self.save_recorded_config();
    }

    /// Wait for the session thread to exit
    ///
    /// Blocks until the current session ends; a collection only ends after
    /// [`stop`](Self::stop).
    pub fn join(&self) {
        let handle = lock(&self.worker).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("Acquisition thread panicked");
            }
        }
    }

    /// Whether a session's data failed to save and awaits a retry
    pub fn has_unflushed_data(&self) -> bool {
        lock(&self.shared.unflushed).is_some()
    }

    /// Retry saving data whose commit failed
    pub fn retry_flush(&self) -> Result<PathBuf> {
        let mut pending = lock(&self.shared.unflushed);
        let sink = pending.as_mut().ok_or(EngineError::NoPendingData)?;
        let path = sink.flush()?;
        *pending = None;
        Ok(path)
    }

    fn record_config(&self, request: &SessionRequest) {
        let Some(store) = &self.config_store else {
            return;
        };
        let mut config = store.load().unwrap_or_else(|e| {
            tracing::warn!("Failed to load config, starting from defaults: {}", e);
            MeasurementConfig::default()
        });
        config.record(request);
        if let Err(e) = store.save(&config) {
            tracing::warn!("Failed to save config: {}", e);
        }
        *lock(&self.recorded_config) = Some(config);
    }

    fn save_recorded_config(&self) {
        let Some(store) = &self.config_store else {
            return;
        };
        if let Some(config) = lock(&self.recorded_config).as_ref() {
            if let Err(e) = store.save(config) {
                tracing::warn!("Failed to save config: {}", e);
            }
        }
    }
}

impl Drop for MeasurementEngine {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfigStore;
    use crate::instrument::{Instrument, SimulatedInstrument};
    use crate::types::{CollectionParameters, SweepParameters};

    fn simulated() -> impl InstrumentFactory {
        || -> Box<dyn Instrument> { Box::new(SimulatedInstrument::new(21).with_realtime(false)) }
    }

    fn wait_for_end(events: &EngineEvents) -> Vec<SessionEvent> {
        let mut received = Vec::new();
        while let Some(event) = events.recv_timeout(Duration::from_secs(5)) {
            let done = event.is_session_end();
            received.push(event);
            if done {
                break;
            }
        }
        received
    }

    #[test]
    fn test_engine_starts_idle() {
        let (engine, events) = MeasurementEngine::new(EngineSettings::default(), simulated());
        assert_eq!(engine.current_state(), SessionState::Idle);
        assert!(events.try_recv().is_none());
        assert!(!engine.has_unflushed_data());
    }

    #[test]
    fn test_validation_leaves_engine_idle() {
        let (engine, events) = MeasurementEngine::new(EngineSettings::default(), simulated());
        let result = engine.start(SweepParameters::new(0.0, 1.0, 0.0, 0.1));
        assert!(matches!(result, Err(EngineError::Validation(_))));
        assert!(engine.current_state().is_idle());
        assert!(events.drain().is_empty());
    }

    #[test]
    fn test_bias_outside_source_range_rejected() {
        let (engine, events) = MeasurementEngine::new(EngineSettings::default(), simulated());
        let result = engine.start(CollectionParameters::new(500.0, 0.1, 1, 0.01));
        match result {
            Err(EngineError::Validation(message)) => assert!(message.contains("500")),
            other => panic!("expected validation error, got {:?}", other),
        }
        assert!(engine.current_state().is_idle());
        assert!(events.drain().is_empty());
    }

    #[test]
    fn test_huge_interval_rejected_before_io() {
        let log = crate::instrument::SourceLog::new();
        let factory_log = log.clone();
        let factory = move || -> Box<dyn Instrument> {
            Box::new(
                SimulatedInstrument::new(22)
                    .with_realtime(false)
                    .with_source_log(factory_log.clone()),
            )
        };
        let (engine, events) = MeasurementEngine::new(EngineSettings::default(), factory);
        let result = engine.start(CollectionParameters::new(5.0, 0.1, 1, 1e20));
        assert!(matches!(result, Err(EngineError::Validation(_))));
        assert!(engine.current_state().is_idle());
        assert!(events.drain().is_empty());
        assert!(log.snapshot().is_empty());
    }

    #[test]
    fn test_stop_while_idle_is_noop() {
        let (engine, events) = MeasurementEngine::new(EngineSettings::default(), simulated());
        engine.stop();
        engine.stop();
        assert!(engine.current_state().is_idle());
        assert!(events.drain().is_empty());
    }

    #[test]
    fn test_sweep_completes_and_saves() {
        let dir = tempfile::TempDir::new().unwrap();
        let settings = EngineSettings {
            output_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let (engine, events) = MeasurementEngine::new(settings, simulated());
        engine
            .start(SweepParameters::new(0.0, 1.0, 0.5, 0.001))
            .unwrap();

        let received = wait_for_end(&events);
        match received.last() {
            Some(SessionEvent::SessionEnded {
                reason: EndReason::Completed,
                output_path: Some(path),
            }) => {
                assert!(path.starts_with(dir.path()));
                assert!(path.exists());
            }
            other => panic!("unexpected last event: {:?}", other),
        }
        assert!(engine.current_state().is_idle());
    }

    #[test]
    fn test_start_while_running_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let settings = EngineSettings {
            output_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let (engine, events) = MeasurementEngine::new(settings, simulated());
        engine
            .start(CollectionParameters::new(1.0, 0.1, 1, 0.01))
            .unwrap();
        assert!(matches!(
            engine.start(SweepParameters::new(0.0, 1.0, 0.5, 0.01)),
            Err(EngineError::AlreadyRunning)
        ));
        assert!(matches!(
            engine.current_state(),
            SessionState::Running { .. }
        ));

        engine.stop();
        let received = wait_for_end(&events);
        assert!(matches!(
            received.last(),
            Some(SessionEvent::SessionEnded {
                reason: EndReason::StoppedByUser,
                ..
            })
        ));
    }

    #[test]
    fn test_retry_flush_without_pending_data() {
        let (engine, _events) = MeasurementEngine::new(EngineSettings::default(), simulated());
        assert!(matches!(
            engine.retry_flush(),
            Err(EngineError::NoPendingData)
        ));
    }

    #[test]
    fn test_config_recorded_on_start() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(MemoryConfigStore::default());
        let settings = EngineSettings {
            output_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let (engine, events) = MeasurementEngine::new(settings, simulated());
        let engine = engine.with_config_store(store.clone());

        engine
            .start(SweepParameters::new(-2.0, 2.0, 1.0, 0.001))
            .unwrap();
        wait_for_end(&events);

        let saved = store.load().unwrap();
        assert_eq!(saved.start_v, -2.0);
        assert_eq!(saved.delta_v, 1.0);
        assert_eq!(store.save_count(), 1);
    }
}
