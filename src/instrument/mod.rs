//! Instrument abstraction
//!
//! This module provides the [`Instrument`] trait that the acquisition worker
//! talks to, with two implementations:
//!
//! - [`ScpiInstrument`] - a real instrument driven by SCPI text commands over
//!   a [`Transport`] (serial, LAN socket or VISA)
//! - [`SimulatedInstrument`] - a seeded software model used when no hardware
//!   is present, and in tests
//!
//! The engine never branches on the variant. It asks an [`InstrumentFactory`]
//! for a handle at session start; the default [`ConnectionFactory`] tries the
//! configured hardware first and falls back to the simulator.

pub mod scpi;
pub mod simulated;
pub mod transport;

pub use scpi::ScpiInstrument;
pub use simulated::{FaultPlan, SimulatedInstrument, SourceLog};
pub use transport::{ResourceAddress, SerialTransport, TcpTransport, Transport};

use crate::config::InstrumentSettings;
use crate::error::Result;

/// Source and measurement setup applied before a session starts acquiring
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceSetup {
    /// Source range in volts
    pub source_range: f64,
    /// Current compliance in amperes
    pub compliance: f64,
    /// Integration time in power-line cycles
    pub integration_nplc: f64,
}

/// Unified interface for source/measure instruments
///
/// Implementations must be `Send`: the handle is moved into the acquisition
/// thread for the duration of a session.
pub trait Instrument: Send {
    /// Query the identification string
    fn identify(&mut self) -> Result<String>;

    /// Select the voltage source range
    fn set_source_range(&mut self, volts: f64) -> Result<()>;

    /// Set the current compliance limit in amperes
    fn set_compliance(&mut self, limit: f64) -> Result<()>;

    /// Set the measurement integration time in power-line cycles
    fn set_integration_time(&mut self, nplc: f64) -> Result<()>;

    /// Switch the source output on
    fn enable_output(&mut self) -> Result<()> {
        Ok(())
    }

    /// Apply a complete setup and switch the output on
    fn configure(&mut self, setup: &SourceSetup) -> Result<()> {
        self.set_source_range(setup.source_range)?;
        self.set_compliance(setup.compliance)?;
        self.set_integration_time(setup.integration_nplc)?;
        self.enable_output()
    }

    /// Apply a voltage
    ///
    /// Fails with [`crate::error::EngineError::Range`] if `|volts|` exceeds
    /// the source range.
    fn source_voltage(&mut self, volts: f64) -> Result<()>;

    /// Take one current reading in amperes
    fn measure_current(&mut self) -> Result<f64>;

    /// Switch the output off and release the connection
    fn close(&mut self) -> Result<()>;

    /// Short description for logs and the `Started` event
    fn description(&self) -> String;
}

/// Instrument handle handed to a session
pub struct InstrumentConnection {
    pub instrument: Box<dyn Instrument>,
    /// Why the simulator is used instead of the requested hardware
    pub fallback_reason: Option<String>,
}

impl InstrumentConnection {
    /// A connection to the requested instrument
    pub fn direct(instrument: Box<dyn Instrument>) -> Self {
        Self {
            instrument,
            fallback_reason: None,
        }
    }

    /// A simulated stand-in for hardware that could not be opened
    pub fn fallback(instrument: Box<dyn Instrument>, reason: impl Into<String>) -> Self {
        Self {
            instrument,
            fallback_reason: Some(reason.into()),
        }
    }
}

impl std::fmt::Debug for InstrumentConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstrumentConnection")
            .field("instrument", &self.instrument.description())
            .field("fallback_reason", &self.fallback_reason)
            .finish()
    }
}

/// Opens one instrument handle per session
pub trait InstrumentFactory: Send + Sync {
    fn open(&self) -> InstrumentConnection;
}

impl<F> InstrumentFactory for F
where
    F: Fn() -> Box<dyn Instrument> + Send + Sync,
{
    fn open(&self) -> InstrumentConnection {
        InstrumentConnection::direct(self())
    }
}

/// Factory that connects to the configured hardware, or simulates it
#[derive(Debug, Clone)]
pub struct ConnectionFactory {
    settings: InstrumentSettings,
    simulate: bool,
    seed: Option<u64>,
}

impl ConnectionFactory {
    pub fn new(settings: InstrumentSettings) -> Self {
        Self {
            settings,
            simulate: false,
            seed: None,
        }
    }

    /// Always use the simulated instrument
    pub fn simulate(mut self, simulate: bool) -> Self {
        self.simulate = simulate;
        self
    }

    /// Seed for the simulated instrument (fresh random seed per session if `None`)
    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    pub fn settings(&self) -> &InstrumentSettings {
        &self.settings
    }

    /// Connect to the configured hardware without falling back
    pub fn connect_hardware(&self) -> Result<ScpiInstrument> {
        ScpiInstrument::connect(&self.settings)
    }

    fn simulated(&self) -> Box<dyn Instrument> {
        let seed = self.seed.unwrap_or_else(rand::random);
        tracing::debug!("Simulated instrument seed: {}", seed);
        Box::new(SimulatedInstrument::from_settings(&self.settings, seed))
    }
}

impl InstrumentFactory for ConnectionFactory {
    fn open(&self) -> InstrumentConnection {
        if self.simulate {
            tracing::info!("Simulation requested, using simulated instrument");
            return InstrumentConnection::direct(self.simulated());
        }

        if self.settings.resource.is_none() {
            tracing::warn!("No instrument resource configured, falling back to simulation");
            return InstrumentConnection::fallback(
                self.simulated(),
                "no instrument resource configured",
            );
        }

        match self.connect_hardware() {
            Ok(instrument) => {
                tracing::info!("Connected to {}", instrument.description());
                InstrumentConnection::direct(Box::new(instrument))
            }
            Err(e) => {
                tracing::warn!("Failed to connect to instrument, falling back to simulation: {}", e);
                InstrumentConnection::fallback(self.simulated(), e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulation_requested() {
        let factory = ConnectionFactory::new(InstrumentSettings::default())
            .simulate(true)
            .with_seed(Some(1));
        let connection = factory.open();
        assert!(connection.fallback_reason.is_none());
        assert!(connection.instrument.description().contains("Simulated"));
    }

    #[test]
    fn test_fallback_without_resource() {
        let factory = ConnectionFactory::new(InstrumentSettings::default());
        let connection = factory.open();
        assert!(connection.fallback_reason.is_some());
    }

    #[test]
    fn test_fallback_on_bad_resource() {
        let mut settings = InstrumentSettings::default();
        settings.resource = Some("GPIB0::24::INSTR".to_string());
        let connection = ConnectionFactory::new(settings).open();
        let reason = connection.fallback_reason.unwrap();
        assert!(reason.contains("GPIB"));
        #[cfg(not(feature = "instrument_visa"))]
        assert!(reason.contains("instrument_visa"), "{}", reason);
    }

    #[test]
    fn test_closure_factory() {
        let factory = || -> Box<dyn Instrument> { Box::new(SimulatedInstrument::new(7)) };
        let mut connection = factory.open();
        assert!(connection.fallback_reason.is_none());
        assert!(connection.instrument.identify().is_ok());
    }
}
