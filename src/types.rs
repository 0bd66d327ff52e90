//! Core data types for the measurement engine
//!
//! This module contains the values that flow between the shell, the engine
//! and the acquisition worker.
//!
//! # Main Types
//!
//! - [`SweepParameters`] / [`CollectionParameters`] - What to measure
//! - [`SessionRequest`] - Parameters plus where to save the result
//! - [`Sample`] - A single timestamped reading produced by the worker
//! - [`SessionState`] - Lifecycle state of the engine
//! - [`SessionEvent`] - Everything the shell receives from the engine
//!
//! Parameters are validated with [`MeasurementParameters::validate`] before a
//! session touches the instrument.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Upper bound on the number of points a single sweep may contain
pub const MAX_SWEEP_POINTS: usize = 1_000_000;

/// Longest dwell or sample period accepted, in seconds (one day)
pub const MAX_PERIOD_SECS: f64 = 86_400.0;

/// Longest aperture accepted, in power-line cycles
pub const MAX_APERTURE_PLC: f64 = 100.0;

/// Convert a validated period to a [`Duration`], saturating instead of panicking
fn period(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs.clamp(0.0, MAX_PERIOD_SECS)).unwrap_or_default()
}

/// Measurement mode of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionMode {
    /// Triangular voltage sweep
    Sweep,
    /// Fixed bias, current recorded over time
    Collection,
}

impl SessionMode {
    /// Short lowercase name, used for generated file names
    pub fn file_stem(&self) -> &'static str {
        match self {
            SessionMode::Sweep => "sweep",
            SessionMode::Collection => "collection",
        }
    }
}

impl std::fmt::Display for SessionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionMode::Sweep => write!(f, "Sweep"),
            SessionMode::Collection => write!(f, "Collection"),
        }
    }
}

/// Parameters of a triangular voltage sweep
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SweepParameters {
    /// First (and last) voltage of the sweep in volts
    pub start_voltage: f64,
    /// Turning-point voltage in volts
    pub end_voltage: f64,
    /// Distance between consecutive points in volts (> 0)
    pub voltage_step: f64,
    /// Settling time between sourcing and measuring, in seconds (> 0)
    pub time_step: f64,
}

impl SweepParameters {
    /// Create sweep parameters
    pub fn new(start_voltage: f64, end_voltage: f64, voltage_step: f64, time_step: f64) -> Self {
        Self {
            start_voltage,
            end_voltage,
            voltage_step,
            time_step,
        }
    }

    /// Settling time as a [`Duration`]
    pub fn dwell(&self) -> Duration {
        period(self.time_step)
    }

    /// Number of points in one leg of the sweep (both ends included)
    pub fn points_per_leg(&self) -> usize {
        let span = (self.end_voltage - self.start_voltage).abs();
        if span == 0.0 {
            return 1;
        }
        let full_steps = (span / self.voltage_step + 1e-9).floor() as usize;
        let remainder = span - full_steps as f64 * self.voltage_step;
        if full_steps == 0 || remainder > self.voltage_step * 1e-9 {
            full_steps + 2
        } else {
            full_steps + 1
        }
    }

    /// Check the parameters without touching any instrument
    pub fn validate(&self) -> Result<()> {
        if !self.start_voltage.is_finite() || !self.end_voltage.is_finite() {
            return Err(EngineError::Validation(
                "start and end voltage must be finite numbers".to_string(),
            ));
        }
        if !self.voltage_step.is_finite() || self.voltage_step <= 0.0 {
            return Err(EngineError::Validation(format!(
                "voltage step must be > 0 (got {})",
                self.voltage_step
            )));
        }
        if !self.time_step.is_finite() || self.time_step <= 0.0 {
            return Err(EngineError::Validation(format!(
                "time step must be > 0 (got {})",
                self.time_step
            )));
        }
        if self.time_step > MAX_PERIOD_SECS {
            return Err(EngineError::Validation(format!(
                "time step must be at most {} s (got {})",
                MAX_PERIOD_SECS, self.time_step
            )));
        }
        let span = (self.end_voltage - self.start_voltage).abs();
        if span / self.voltage_step > (MAX_SWEEP_POINTS / 2) as f64 {
            return Err(EngineError::Validation(format!(
                "sweep would need more than {} points",
                MAX_SWEEP_POINTS
            )));
        }
        Ok(())
    }
}

/// Parameters of an open-ended current collection at fixed bias
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CollectionParameters {
    /// Bias voltage held for the whole session, in volts
    pub bias_voltage: f64,
    /// Integration time in power-line cycles (> 0)
    pub aperture_time: f64,
    /// Readings averaged into each reported sample (≥ 1)
    pub noise_average: u32,
    /// Period between reported samples, in seconds (> 0)
    pub acquisition_interval: f64,
    /// Forward every raw reading for display, not only the averages
    pub fast_acquisition: bool,
}

impl CollectionParameters {
    /// Create collection parameters with fast acquisition disabled
    pub fn new(
        bias_voltage: f64,
        aperture_time: f64,
        noise_average: u32,
        acquisition_interval: f64,
    ) -> Self {
        Self {
            bias_voltage,
            aperture_time,
            noise_average,
            acquisition_interval,
            fast_acquisition: false,
        }
    }

    /// Enable or disable forwarding of raw readings
    pub fn with_fast_acquisition(mut self, fast: bool) -> Self {
        self.fast_acquisition = fast;
        self
    }

    /// Sample period as a [`Duration`]
    pub fn interval(&self) -> Duration {
        period(self.acquisition_interval)
    }

    /// Check the parameters without touching any instrument
    pub fn validate(&self) -> Result<()> {
        if !self.bias_voltage.is_finite() {
            return Err(EngineError::Validation(
                "bias voltage must be a finite number".to_string(),
            ));
        }
        if !self.aperture_time.is_finite() || self.aperture_time <= 0.0 {
            return Err(EngineError::Validation(format!(
                "aperture time must be > 0 PLC (got {})",
                self.aperture_time
            )));
        }
        if self.aperture_time > MAX_APERTURE_PLC {
            return Err(EngineError::Validation(format!(
                "aperture time must be at most {} PLC (got {})",
                MAX_APERTURE_PLC, self.aperture_time
            )));
        }
        if self.noise_average == 0 {
            return Err(EngineError::Validation(
                "noise average must be at least 1 reading".to_string(),
            ));
        }
        if !self.acquisition_interval.is_finite() || self.acquisition_interval <= 0.0 {
            return Err(EngineError::Validation(format!(
                "acquisition interval must be > 0 (got {})",
                self.acquisition_interval
            )));
        }
        if self.acquisition_interval > MAX_PERIOD_SECS {
            return Err(EngineError::Validation(format!(
                "acquisition interval must be at most {} s (got {})",
                MAX_PERIOD_SECS, self.acquisition_interval
            )));
        }
        Ok(())
    }
}

/// Parameters for either measurement mode
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum MeasurementParameters {
    Sweep(SweepParameters),
    Collection(CollectionParameters),
}

impl MeasurementParameters {
    /// The session mode these parameters select
    pub fn mode(&self) -> SessionMode {
        match self {
            MeasurementParameters::Sweep(_) => SessionMode::Sweep,
            MeasurementParameters::Collection(_) => SessionMode::Collection,
        }
    }

    /// Validate the parameters of whichever mode is selected
    pub fn validate(&self) -> Result<()> {
        match self {
            MeasurementParameters::Sweep(p) => p.validate(),
            MeasurementParameters::Collection(p) => p.validate(),
        }
    }
}

impl From<SweepParameters> for MeasurementParameters {
    fn from(params: SweepParameters) -> Self {
        MeasurementParameters::Sweep(params)
    }
}

impl From<CollectionParameters> for MeasurementParameters {
    fn from(params: CollectionParameters) -> Self {
        MeasurementParameters::Collection(params)
    }
}

/// A request to run one session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRequest {
    /// What to measure
    pub parameters: MeasurementParameters,
    /// Where to save the result (generated from mode and start time if `None`)
    pub save_path: Option<PathBuf>,
}

impl SessionRequest {
    /// Create a request without an explicit save path
    pub fn new(parameters: impl Into<MeasurementParameters>) -> Self {
        Self {
            parameters: parameters.into(),
            save_path: None,
        }
    }

    /// Save the result to the given path
    pub fn save_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.save_path = Some(path.into());
        self
    }

    /// Mode of the requested session
    pub fn mode(&self) -> SessionMode {
        self.parameters.mode()
    }
}

impl From<MeasurementParameters> for SessionRequest {
    fn from(parameters: MeasurementParameters) -> Self {
        Self::new(parameters)
    }
}

impl From<SweepParameters> for SessionRequest {
    fn from(parameters: SweepParameters) -> Self {
        Self::new(parameters)
    }
}

impl From<CollectionParameters> for SessionRequest {
    fn from(parameters: CollectionParameters) -> Self {
        Self::new(parameters)
    }
}

/// One reported measurement
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Position in the session's sample stream, starting at 0
    pub sequence_index: u64,
    /// Time since session start (monotonic clock)
    pub timestamp: Duration,
    /// Source voltage at which the current was measured (sweep only)
    pub applied_voltage: Option<f64>,
    /// Measured current in amperes
    pub measured_current: f64,
}

/// Lifecycle state of the engine
#[derive(Debug, Clone, PartialEq, Default)]
pub enum SessionState {
    /// No session; a new one may start
    #[default]
    Idle,
    /// A session is acquiring data
    Running {
        mode: SessionMode,
        started_at: Instant,
    },
    /// Cancellation requested, worker is finalizing
    Stopping,
    /// Unrecoverable instrument error, worker is finalizing
    Faulted { cause: String },
}

impl SessionState {
    /// Check if a new session may start
    pub fn is_idle(&self) -> bool {
        matches!(self, SessionState::Idle)
    }

    /// Check if a session is acquiring data
    pub fn is_running(&self) -> bool {
        matches!(self, SessionState::Running { .. })
    }

    /// Display name for the state
    pub fn display_name(&self) -> &'static str {
        match self {
            SessionState::Idle => "Idle",
            SessionState::Running { .. } => "Running",
            SessionState::Stopping => "Stopping",
            SessionState::Faulted { .. } => "Faulted",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Running { mode, started_at } => {
                write!(f, "Running {} ({:.1} s)", mode, started_at.elapsed().as_secs_f64())
            }
            SessionState::Faulted { cause } => write!(f, "Faulted: {}", cause),
            other => write!(f, "{}", other.display_name()),
        }
    }
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq)]
pub enum EndReason {
    /// Every sweep point was measured
    Completed,
    /// `stop()` was called
    StoppedByUser,
    /// Unrecoverable instrument error
    Faulted { cause: String },
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndReason::Completed => write!(f, "Completed"),
            EndReason::StoppedByUser => write!(f, "Stopped by user"),
            EndReason::Faulted { cause } => write!(f, "Faulted: {}", cause),
        }
    }
}

/// Session progress
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Progress {
    /// Fraction of sweep points done, in `0.0..=1.0`
    Fraction(f64),
    /// Time since the start of an open-ended collection
    Elapsed(Duration),
}

/// Category of a non-fatal problem reported during a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningKind {
    /// Instrument did not answer; the point was skipped
    Timeout,
    /// Requested voltage outside the source range; the point was skipped
    OutOfRange,
    /// No hardware could be opened, the session runs on the simulator
    SimulationFallback,
    /// The source could not be brought back to 0 V or closed cleanly
    Shutdown,
    /// The output file could not be committed; data is kept for a retry
    SinkIo,
}

/// A non-fatal problem reported during a session
#[derive(Debug, Clone, PartialEq)]
pub struct Warning {
    pub kind: WarningKind,
    pub message: String,
}

impl Warning {
    pub fn new(kind: WarningKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Message sent from the engine to the shell
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A session began acquiring with the given instrument
    Started { mode: SessionMode, instrument: String },
    /// Progress update
    Progress(Progress),
    /// New sample (also recorded by the data sink)
    Sample(Sample),
    /// Individual reading, forwarded for display in fast acquisition only
    RawReading {
        timestamp: Duration,
        measured_current: f64,
    },
    /// Recoverable problem
    Warning(Warning),
    /// Last event of every session
    SessionEnded {
        reason: EndReason,
        output_path: Option<PathBuf>,
    },
}

impl SessionEvent {
    /// Check if this event closes a session
    pub fn is_session_end(&self) -> bool {
        matches!(self, SessionEvent::SessionEnded { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sweep_validation() {
        assert!(SweepParameters::new(-1.0, 1.0, 0.5, 0.01).validate().is_ok());
        assert!(SweepParameters::new(0.0, 0.0, 0.1, 0.1).validate().is_ok());
        assert!(SweepParameters::new(0.0, 1.0, 0.0, 0.1).validate().is_err());
        assert!(SweepParameters::new(0.0, 1.0, -0.1, 0.1).validate().is_err());
        assert!(SweepParameters::new(0.0, 1.0, 0.1, 0.0).validate().is_err());
        assert!(SweepParameters::new(f64::NAN, 1.0, 0.1, 0.1).validate().is_err());
        assert!(SweepParameters::new(-1000.0, 1000.0, 1e-9, 0.1)
            .validate()
            .is_err());
    }

    #[test]
    fn test_collection_validation() {
        assert!(CollectionParameters::new(1.0, 1.0, 1, 0.1).validate().is_ok());
        assert!(CollectionParameters::new(1.0, -1.0, 1, 0.1).validate().is_err());
        assert!(CollectionParameters::new(1.0, 1.0, 0, 0.1).validate().is_err());
        assert!(CollectionParameters::new(1.0, 1.0, 1, 0.0).validate().is_err());
    }

    #[test]
    fn test_huge_periods_rejected() {
        let err = CollectionParameters::new(5.0, 1.0, 1, 1e20)
            .validate()
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        let err = SweepParameters::new(0.0, 1.0, 0.5, 1e20)
            .validate()
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert!(CollectionParameters::new(5.0, 1.0, 1, MAX_PERIOD_SECS)
            .validate()
            .is_ok());
        assert!(CollectionParameters::new(5.0, 1e20, 1, 0.1).validate().is_err());

        // Accessors saturate rather than panic on unvalidated input
        assert_eq!(
            CollectionParameters::new(5.0, 1.0, 1, 1e20).interval(),
            Duration::from_secs_f64(MAX_PERIOD_SECS)
        );
        assert_eq!(SweepParameters::new(0.0, 1.0, 0.5, f64::NAN).dwell(), Duration::ZERO);
    }

    #[test]
    fn test_points_per_leg() {
        assert_eq!(SweepParameters::new(-1.0, 1.0, 0.5, 0.01).points_per_leg(), 5);
        assert_eq!(SweepParameters::new(0.0, 1.0, 0.3, 0.01).points_per_leg(), 5);
        assert_eq!(SweepParameters::new(0.0, 0.0, 0.1, 0.01).points_per_leg(), 1);
    }

    #[test]
    fn test_session_request_from_params() {
        let request: SessionRequest = SweepParameters::new(0.0, 1.0, 0.1, 0.1).into();
        assert_eq!(request.mode(), SessionMode::Sweep);
        assert!(request.save_path.is_none());

        let request = SessionRequest::new(CollectionParameters::new(1.0, 1.0, 1, 0.1))
            .save_to("/tmp/run.csv");
        assert_eq!(request.mode(), SessionMode::Collection);
        assert_eq!(request.save_path, Some(PathBuf::from("/tmp/run.csv")));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::Idle.to_string(), "Idle");
        let faulted = SessionState::Faulted {
            cause: "no reply".to_string(),
        };
        assert!(faulted.to_string().contains("no reply"));
        assert!(!faulted.is_idle());
    }
}
