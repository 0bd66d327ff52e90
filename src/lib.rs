//! # smu-daq: Measurement Engine for source-measure units
//!
//! Drives a Keithley 6517A electrometer or a Keysight B2901A SMU over SCPI,
//! running either a triangular voltage sweep or an open-ended current
//! collection at a fixed bias. Samples stream to the caller as events and
//! are committed to a CSV file when the session ends.
//!
//! ## Architecture
//!
//! - **Engine**: Session state machine, owns the acquisition thread
//! - **Acquisition**: Sweep and collection loops, fault accounting
//! - **Instrument**: SCPI drivers over serial or TCP, plus a seeded simulator
//! - **Session**: Buffers samples and writes them atomically
//! - **Communication**: Crossbeam channels between the acquisition thread and the shell
//!
//! ## Configuration
//!
//! Last-used parameters are stored in the platform-appropriate data
//! directory under `dev.smu-daq`:
//!
//! - **Linux**: `~/.local/share/dev.smu-daq/`
//! - **macOS**: `~/Library/Application Support/dev.smu-daq/`
//! - **Windows**: `%APPDATA%\dev.smu-daq\`
//!
//! ## Example
//!
//! ```ignore
//! use smu_daq::{MeasurementConfig, MeasurementEngine, SessionEvent};
//!
//! let config = MeasurementConfig::load_or_default();
//! let (engine, events) = MeasurementEngine::from_config(&config);
//! engine.start(config.sweep_parameters())?;
//!
//! for event in events.iter() {
//!     match event {
//!         SessionEvent::Sample(sample) => println!("{:?}", sample),
//!         SessionEvent::SessionEnded { .. } => break,
//!         _ => {}
//!     }
//! }
//! ```

pub mod acquisition;
pub mod config;
pub mod engine;
pub mod error;
pub mod instrument;
pub mod session;
pub mod types;

// Re-export commonly used types
pub use config::{InstrumentFamily, InstrumentSettings, MeasurementConfig};
pub use engine::{EngineEvents, EngineSettings, MeasurementEngine};
pub use error::{EngineError, Result};
pub use instrument::{Instrument, InstrumentFactory, SimulatedInstrument};
pub use types::{
    CollectionParameters, EndReason, MeasurementParameters, Sample, SessionEvent,
    SessionRequest, SessionState, SweepParameters,
};
