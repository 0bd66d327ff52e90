//! Test data builders for creating test objects

use smu_daq::instrument::{FaultPlan, Instrument, InstrumentFactory, SimulatedInstrument, SourceLog};
use smu_daq::types::{CollectionParameters, SweepParameters};

/// Builder for sweep parameters
pub struct SweepBuilder {
    params: SweepParameters,
}

impl SweepBuilder {
    pub fn new() -> Self {
        Self {
            params: SweepParameters::new(0.0, 1.0, 0.25, 0.001),
        }
    }

    pub fn range(mut self, start: f64, end: f64) -> Self {
        self.params.start_voltage = start;
        self.params.end_voltage = end;
        self
    }

    pub fn step(mut self, step: f64) -> Self {
        self.params.voltage_step = step;
        self
    }

    pub fn dwell(mut self, seconds: f64) -> Self {
        self.params.time_step = seconds;
        self
    }

    pub fn build(self) -> SweepParameters {
        self.params
    }
}

/// Builder for collection parameters
pub struct CollectionBuilder {
    params: CollectionParameters,
}

impl CollectionBuilder {
    pub fn new() -> Self {
        Self {
            params: CollectionParameters::new(1.0, 0.1, 1, 0.1),
        }
    }

    pub fn bias(mut self, volts: f64) -> Self {
        self.params.bias_voltage = volts;
        self
    }

    pub fn average(mut self, readings: u32) -> Self {
        self.params.noise_average = readings;
        self
    }

    pub fn interval(mut self, seconds: f64) -> Self {
        self.params.acquisition_interval = seconds;
        self
    }

    pub fn fast(mut self) -> Self {
        self.params.fast_acquisition = true;
        self
    }

    pub fn build(self) -> CollectionParameters {
        self.params
    }
}

/// Builder for a factory of seeded simulated instruments
#[derive(Clone)]
pub struct SimulatorBuilder {
    seed: u64,
    realtime: bool,
    faults: FaultPlan,
    log: SourceLog,
}

impl SimulatorBuilder {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            realtime: false,
            faults: FaultPlan::none(),
            log: SourceLog::new(),
        }
    }

    pub fn realtime(mut self) -> Self {
        self.realtime = true;
        self
    }

    pub fn faults(mut self, faults: FaultPlan) -> Self {
        self.faults = faults;
        self
    }

    /// Log of every voltage the built instruments apply
    pub fn source_log(&self) -> SourceLog {
        self.log.clone()
    }

    pub fn build(&self) -> SimulatedInstrument {
        SimulatedInstrument::new(self.seed)
            .with_realtime(self.realtime)
            .with_faults(self.faults.clone())
            .with_source_log(self.log.clone())
    }

    /// Factory handing out a fresh instrument per session
    pub fn factory(self) -> impl InstrumentFactory {
        move || -> Box<dyn Instrument> { Box::new(self.build()) }
    }
}
