//! Simulated instrument
//!
//! Implements the [`Instrument`] contract without a bus. The measured current
//! is a diode-like function of the last applied voltage, limited by the
//! compliance, plus bounded noise from a seeded ChaCha generator. Each reading
//! takes as long as the configured integration time, so timing behaves like
//! the real hardware.
//!
//! # Example
//!
//! ```ignore
//! use smu_daq::instrument::{FaultPlan, SimulatedInstrument, SourceLog};
//!
//! let log = SourceLog::new();
//! let mut sim = SimulatedInstrument::new(42)
//!     .with_source_log(log.clone())
//!     .with_faults(FaultPlan::timeouts(5, 4));
//! ```

use super::Instrument;
use crate::config::InstrumentSettings;
use crate::error::{EngineError, Result};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Diode saturation current in amperes
const SATURATION_CURRENT: f64 = 1e-12;

/// Ideality factor times the thermal voltage at room temperature
const EMISSION_VOLTAGE: f64 = 1.5 * 0.025_85;

/// Parallel leakage resistance in ohms
const LEAKAGE_RESISTANCE: f64 = 1e12;

/// Peak noise at 1 PLC, in amperes
const NOISE_AMPLITUDE: f64 = 1e-12;

/// Shared record of every voltage applied to a simulated instrument
#[derive(Debug, Clone, Default)]
pub struct SourceLog {
    inner: Arc<Mutex<Vec<f64>>>,
}

impl SourceLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, volts: f64) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(volts);
    }

    /// All voltages applied so far, in order
    pub fn snapshot(&self) -> Vec<f64> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// The most recently applied voltage
    pub fn last(&self) -> Option<f64> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last()
            .copied()
    }
}

/// Scripted failures for a simulated instrument
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FaultPlan {
    /// Inject `count` consecutive timeouts after this many good readings
    timeouts: Option<(u64, u32)>,
    /// Reply with garbage after this many good readings
    protocol_error_after: Option<u64>,
}

impl FaultPlan {
    /// No injected failures
    pub fn none() -> Self {
        Self::default()
    }

    /// `count` consecutive timeouts once `after` readings have succeeded
    pub fn timeouts(after: u64, count: u32) -> Self {
        Self {
            timeouts: Some((after, count)),
            ..Self::default()
        }
    }

    /// A malformed reply once `after` readings have succeeded
    pub fn protocol_error(after: u64) -> Self {
        Self {
            protocol_error_after: Some(after),
            ..Self::default()
        }
    }
}

/// Software model of a source/measure unit
pub struct SimulatedInstrument {
    rng: ChaCha8Rng,
    seed: u64,
    source_range: f64,
    compliance: f64,
    nplc: f64,
    line_frequency: f64,
    realtime: bool,
    voltage: f64,
    output_on: bool,
    closed: bool,
    good_readings: u64,
    injected_timeouts: u32,
    faults: FaultPlan,
    source_log: Option<SourceLog>,
}

impl SimulatedInstrument {
    /// Create a simulator with family-independent defaults
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            seed,
            source_range: 210.0,
            compliance: 1e-3,
            nplc: 1.0,
            line_frequency: 50.0,
            realtime: true,
            voltage: 0.0,
            output_on: false,
            closed: false,
            good_readings: 0,
            injected_timeouts: 0,
            faults: FaultPlan::none(),
            source_log: None,
        }
    }

    /// Create a simulator matching the configured instrument
    pub fn from_settings(settings: &InstrumentSettings, seed: u64) -> Self {
        Self::new(seed)
            .with_source_range(settings.source_range())
            .with_compliance(settings.compliance_a)
            .with_line_frequency(settings.line_frequency_hz)
    }

    pub fn with_source_range(mut self, volts: f64) -> Self {
        self.source_range = volts.abs();
        self
    }

    pub fn with_compliance(mut self, amps: f64) -> Self {
        self.compliance = amps.abs();
        self
    }

    pub fn with_line_frequency(mut self, hz: f64) -> Self {
        if hz > 0.0 {
            self.line_frequency = hz;
        }
        self
    }

    /// Skip the integration-time delay (benchmarks)
    pub fn with_realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }

    pub fn with_source_log(mut self, log: SourceLog) -> Self {
        self.source_log = Some(log);
        self
    }

    pub fn with_faults(mut self, faults: FaultPlan) -> Self {
        self.faults = faults;
        self
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Last applied voltage
    pub fn voltage(&self) -> f64 {
        self.voltage
    }

    /// Noise-free current at a given voltage
    pub fn ideal_current(&self, volts: f64) -> f64 {
        let diode = SATURATION_CURRENT * ((volts / EMISSION_VOLTAGE).exp() - 1.0);
        let current = diode + volts / LEAKAGE_RESISTANCE;
        current.clamp(-self.compliance, self.compliance)
    }

    fn integration_time(&self) -> Duration {
        Duration::try_from_secs_f64(self.nplc / self.line_frequency).unwrap_or_default()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(EngineError::NotConnected)
        } else {
            Ok(())
        }
    }

    fn injected_fault(&mut self) -> Option<EngineError> {
        if let Some((after, count)) = self.faults.timeouts {
            if self.good_readings >= after && self.injected_timeouts < count {
                self.injected_timeouts += 1;
                return Some(EngineError::Timeout(format!(
                    "simulated timeout {} of {}",
                    self.injected_timeouts, count
                )));
            }
        }
        if let Some(after) = self.faults.protocol_error_after {
            if self.good_readings >= after {
                return Some(EngineError::Protocol(
                    "simulated malformed reply '#?!'".to_string(),
                ));
            }
        }
        None
    }
}

impl Instrument for SimulatedInstrument {
    fn identify(&mut self) -> Result<String> {
        self.ensure_open()?;
        Ok(format!("SIMULATED,SMU-SIM,{},1.0", self.seed))
    }

    fn set_source_range(&mut self, volts: f64) -> Result<()> {
        self.ensure_open()?;
        self.source_range = volts.abs();
        Ok(())
    }

    fn set_compliance(&mut self, limit: f64) -> Result<()> {
        self.ensure_open()?;
        self.compliance = limit.abs();
        Ok(())
    }

    fn set_integration_time(&mut self, nplc: f64) -> Result<()> {
        self.ensure_open()?;
        if !nplc.is_finite() || nplc <= 0.0 {
            return Err(EngineError::Protocol(format!(
                "integration time {} PLC rejected",
                nplc
            )));
        }
        self.nplc = nplc;
        Ok(())
    }

    fn enable_output(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.output_on = true;
        Ok(())
    }

    fn source_voltage(&mut self, volts: f64) -> Result<()> {
        self.ensure_open()?;
        if !volts.is_finite() || volts.abs() > self.source_range {
            return Err(EngineError::Range {
                voltage: volts,
                limit: self.source_range,
            });
        }
        self.voltage = volts;
        if let Some(log) = &self.source_log {
            log.push(volts);
        }
        Ok(())
    }

    fn measure_current(&mut self) -> Result<f64> {
        self.ensure_open()?;
        if self.realtime {
            std::thread::sleep(self.integration_time());
        }
        if let Some(fault) = self.injected_fault() {
            return Err(fault);
        }

        let amplitude = NOISE_AMPLITUDE / self.nplc.sqrt();
        let noise = self.rng.gen_range(-amplitude..=amplitude);
        let current = if self.output_on {
            self.ideal_current(self.voltage)
        } else {
            0.0
        };
        self.good_readings += 1;
        Ok(current + noise)
    }

    fn close(&mut self) -> Result<()> {
        self.output_on = false;
        self.closed = true;
        Ok(())
    }

    fn description(&self) -> String {
        format!("Simulated instrument (seed {})", self.seed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::SourceSetup;
    use proptest::prelude::*;

    fn setup() -> SourceSetup {
        SourceSetup {
            source_range: 20.0,
            compliance: 1e-3,
            integration_nplc: 1.0,
        }
    }

    fn fast(seed: u64) -> SimulatedInstrument {
        SimulatedInstrument::new(seed).with_realtime(false)
    }

    #[test]
    fn test_same_seed_same_readings() {
        let mut a = fast(42);
        let mut b = fast(42);
        a.configure(&setup()).unwrap();
        b.configure(&setup()).unwrap();
        for v in [-1.0, 0.0, 0.3, 0.6] {
            a.source_voltage(v).unwrap();
            b.source_voltage(v).unwrap();
            assert_eq!(a.measure_current().unwrap(), b.measure_current().unwrap());
        }
    }

    #[test]
    fn test_diode_response_shape() {
        let sim = fast(1);
        assert!(sim.ideal_current(0.6) > sim.ideal_current(0.3));
        assert!(sim.ideal_current(-1.0) < 0.0);
        assert_eq!(sim.ideal_current(50.0), 1e-3);
        assert_eq!(sim.ideal_current(0.0), 0.0);
    }

    #[test]
    fn test_source_log_and_range() {
        let log = SourceLog::new();
        let mut sim = fast(3).with_source_log(log.clone());
        sim.configure(&setup()).unwrap();
        sim.source_voltage(1.0).unwrap();
        assert!(matches!(
            sim.source_voltage(25.0),
            Err(EngineError::Range { .. })
        ));
        sim.source_voltage(0.0).unwrap();
        assert_eq!(log.snapshot(), vec![1.0, 0.0]);
        assert_eq!(log.last(), Some(0.0));
    }

    #[test]
    fn test_injected_timeouts() {
        let mut sim = fast(9).with_faults(FaultPlan::timeouts(2, 3));
        sim.configure(&setup()).unwrap();
        assert!(sim.measure_current().is_ok());
        assert!(sim.measure_current().is_ok());
        for _ in 0..3 {
            assert!(sim.measure_current().unwrap_err().is_timeout());
        }
        assert!(sim.measure_current().is_ok());
    }

    #[test]
    fn test_injected_protocol_error() {
        let mut sim = fast(9).with_faults(FaultPlan::protocol_error(1));
        sim.configure(&setup()).unwrap();
        assert!(sim.measure_current().is_ok());
        assert!(matches!(
            sim.measure_current(),
            Err(EngineError::Protocol(_))
        ));
    }

    #[test]
    fn test_closed_instrument_rejects_calls() {
        let mut sim = fast(5);
        sim.close().unwrap();
        assert!(matches!(
            sim.source_voltage(0.0),
            Err(EngineError::NotConnected)
        ));
        assert!(sim.close().is_ok());
    }

    #[test]
    fn test_reading_takes_integration_time() {
        let mut sim = SimulatedInstrument::new(1).with_line_frequency(100.0);
        sim.configure(&SourceSetup {
            integration_nplc: 2.0,
            ..setup()
        })
        .unwrap();
        let start = std::time::Instant::now();
        sim.measure_current().unwrap();
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    proptest! {
        #[test]
        fn prop_noise_is_bounded(seed in any::<u64>(), volts in -5.0f64..5.0) {
            let mut sim = fast(seed);
            sim.configure(&setup()).unwrap();
            sim.source_voltage(volts).unwrap();
            let reading = sim.measure_current().unwrap();
            let ideal = sim.ideal_current(volts);
            prop_assert!((reading - ideal).abs() <= NOISE_AMPLITUDE * 1.000_001);
        }
    }
}
