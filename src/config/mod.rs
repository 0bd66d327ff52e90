//! Configuration module for smu-daq
//!
//! This module handles the persisted measurement configuration:
//! - Last-used sweep and collection parameters and the save path
//! - Instrument connection settings and command table selection
//! - Engine behaviour (simulation, output directory, fault threshold)
//!
//! # App Data Location
//!
//! The configuration is stored in the platform-appropriate location:
//! - **Linux**: `~/.local/share/dev.smu-daq/config.json`
//! - **macOS**: `~/Library/Application Support/dev.smu-daq/config.json`
//! - **Windows**: `%APPDATA%\dev.smu-daq\config.json`
//!
//! The record keeps the key names of the lab tool it replaces (`start_v`,
//! `delta_v`, `noise_avg`, ...), so an existing `config.json` loads unchanged.
//!
//! # Example
//!
//! ```ignore
//! use smu_daq::config::MeasurementConfig;
//!
//! let config = MeasurementConfig::load_or_default();
//! let params = config.sweep_parameters();
//! ```

pub mod instrument;

pub use instrument::*;

use crate::acquisition::AcquisitionSettings;
use crate::engine::EngineSettings;
use crate::error::{EngineError, Result};
use crate::instrument::ConnectionFactory;
use crate::session::OverwritePolicy;
use crate::types::{
    CollectionParameters, MeasurementParameters, SessionRequest, SweepParameters,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Application identifier for data directories
pub const APP_ID: &str = "dev.smu-daq";

/// Config filename
pub const CONFIG_FILE: &str = "config.json";

/// Consecutive timeouts after which a session is faulted
pub const DEFAULT_TIMEOUT_FAULT_THRESHOLD: u32 = 3;

// ==================== App Data Directory ====================

/// Get the application data directory path
pub fn app_data_dir() -> Option<PathBuf> {
    dirs_next::data_dir().map(|p| p.join(APP_ID))
}

/// Ensure the app data directory exists
pub fn ensure_app_data_dir() -> Result<PathBuf> {
    let dir = app_data_dir().ok_or_else(|| {
        EngineError::Config("Could not determine app data directory".to_string())
    })?;

    if !dir.exists() {
        std::fs::create_dir_all(&dir).map_err(|e| {
            EngineError::Config(format!("Failed to create app data directory: {}", e))
        })?;
    }

    Ok(dir)
}

/// Get the path to the default config file
pub fn config_path() -> Option<PathBuf> {
    app_data_dir().map(|p| p.join(CONFIG_FILE))
}

// ==================== Measurement Config ====================

/// Persisted measurement configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementConfig {
    /// Output file of the next session (empty: generated name)
    #[serde(default)]
    pub save_path: String,

    #[serde(default)]
    pub start_v: f64,

    #[serde(default)]
    pub end_v: f64,

    /// Sweep voltage step
    #[serde(default = "default_delta_v")]
    pub delta_v: f64,

    /// Sweep settling time in seconds
    #[serde(default = "default_delta_t")]
    pub delta_t: f64,

    #[serde(default)]
    pub bias_voltage: f64,

    /// Collection integration time in power-line cycles
    #[serde(default = "default_aperture_time")]
    pub aperture_time: f64,

    /// Readings averaged into each collection sample
    #[serde(default = "default_noise_avg")]
    pub noise_avg: u32,

    /// Collection sample period; `delta_t` is used when absent
    #[serde(default)]
    pub acquisition_interval: Option<f64>,

    #[serde(default)]
    pub fast_acquisition: bool,

    /// Skip the hardware and use the simulated instrument
    #[serde(default)]
    pub simulation: bool,

    /// Seed for the simulated instrument (random when absent)
    #[serde(default)]
    pub simulation_seed: Option<u64>,

    /// Directory for generated file names (working directory when absent)
    #[serde(default)]
    pub output_dir: Option<PathBuf>,

    /// Replace an existing save path instead of adding a version suffix
    #[serde(default)]
    pub overwrite_existing: bool,

    #[serde(default = "default_timeout_fault_threshold")]
    pub timeout_fault_threshold: u32,

    #[serde(default)]
    pub instrument: InstrumentSettings,
}

fn default_delta_v() -> f64 {
    0.1
}

fn default_delta_t() -> f64 {
    0.1
}

fn default_aperture_time() -> f64 {
    1.0
}

fn default_noise_avg() -> u32 {
    1
}

fn default_timeout_fault_threshold() -> u32 {
    DEFAULT_TIMEOUT_FAULT_THRESHOLD
}

impl Default for MeasurementConfig {
    fn default() -> Self {
        Self {
            save_path: String::new(),
            start_v: 0.0,
            end_v: 0.0,
            delta_v: default_delta_v(),
            delta_t: default_delta_t(),
            bias_voltage: 0.0,
            aperture_time: default_aperture_time(),
            noise_avg: default_noise_avg(),
            acquisition_interval: None,
            fast_acquisition: false,
            simulation: false,
            simulation_seed: None,
            output_dir: None,
            overwrite_existing: false,
            timeout_fault_threshold: DEFAULT_TIMEOUT_FAULT_THRESHOLD,
            instrument: InstrumentSettings::default(),
        }
    }
}

impl MeasurementConfig {
    /// Load the config from the default location
    pub fn load() -> Result<Self> {
        let path = config_path().ok_or_else(|| {
            EngineError::Config("Could not determine config path".to_string())
        })?;
        Self::load_from(path)
    }

    /// Load the config from a file, returning defaults if it does not exist
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("Failed to read config: {}", e)))?;

        serde_json::from_str(&content)
            .map_err(|e| EngineError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Load the config, returning defaults on any error
    pub fn load_or_default() -> Self {
        Self::load().unwrap_or_else(|e| {
            tracing::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Save the config to the default location
    pub fn save(&self) -> Result<()> {
        let dir = ensure_app_data_dir()?;
        self.save_to(dir.join(CONFIG_FILE))
    }

    /// Save the config to a file
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                EngineError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| EngineError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| EngineError::Config(format!("Failed to write config: {}", e)))
    }

    /// Configured save path, `None` when empty
    pub fn save_path(&self) -> Option<PathBuf> {
        let trimmed = self.save_path.trim();
        (!trimmed.is_empty()).then(|| PathBuf::from(trimmed))
    }

    /// Sweep parameters from the stored values
    pub fn sweep_parameters(&self) -> SweepParameters {
        SweepParameters::new(self.start_v, self.end_v, self.delta_v, self.delta_t)
    }

    /// Collection parameters from the stored values
    pub fn collection_parameters(&self) -> CollectionParameters {
        CollectionParameters::new(
            self.bias_voltage,
            self.aperture_time,
            self.noise_avg,
            self.acquisition_interval.unwrap_or(self.delta_t),
        )
        .with_fast_acquisition(self.fast_acquisition)
    }

    /// Remember the parameters and save path of a started session
    pub fn record(&mut self, request: &SessionRequest) {
        match request.parameters {
            MeasurementParameters::Sweep(p) => {
                self.start_v = p.start_voltage;
                self.end_v = p.end_voltage;
                self.delta_v = p.voltage_step;
                self.delta_t = p.time_step;
            }
            MeasurementParameters::Collection(p) => {
                self.bias_voltage = p.bias_voltage;
                self.aperture_time = p.aperture_time;
                self.noise_avg = p.noise_average;
                self.acquisition_interval = Some(p.acquisition_interval);
                self.fast_acquisition = p.fast_acquisition;
            }
        }
        self.save_path = request
            .save_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
    }

    /// Engine settings derived from this config
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            acquisition: AcquisitionSettings {
                timeout_fault_threshold: self.timeout_fault_threshold.max(1),
                sweep_nplc: self.instrument.sweep_nplc,
                source_range: self.instrument.source_range(),
                compliance: self.instrument.compliance_a,
            },
            output_dir: self.output_dir.clone(),
            overwrite: if self.overwrite_existing {
                OverwritePolicy::Overwrite
            } else {
                OverwritePolicy::VersionSuffix
            },
        }
    }

    /// Instrument factory honouring the simulation settings
    pub fn connection_factory(&self) -> ConnectionFactory {
        ConnectionFactory::new(self.instrument.clone())
            .simulate(self.simulation)
            .with_seed(self.simulation_seed)
    }
}

// ==================== Config Store ====================

/// Where the engine reads and records the configuration
pub trait ConfigStore: Send + Sync {
    fn load(&self) -> Result<MeasurementConfig>;
    fn save(&self, config: &MeasurementConfig) -> Result<()>;
}

/// Config store backed by a JSON file
#[derive(Debug, Clone)]
pub struct JsonConfigStore {
    path: PathBuf,
}

impl JsonConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at the platform default location
    pub fn default_location() -> Result<Self> {
        config_path()
            .map(Self::new)
            .ok_or_else(|| EngineError::Config("Could not determine config path".to_string()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigStore for JsonConfigStore {
    fn load(&self) -> Result<MeasurementConfig> {
        MeasurementConfig::load_from(&self.path)
    }

    fn save(&self, config: &MeasurementConfig) -> Result<()> {
        config.save_to(&self.path)
    }
}

/// Config store kept in memory, for embedding shells and tests
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    config: Mutex<MeasurementConfig>,
    saves: Mutex<usize>,
}

impl MemoryConfigStore {
    pub fn new(config: MeasurementConfig) -> Self {
        Self {
            config: Mutex::new(config),
            saves: Mutex::new(0),
        }
    }

    /// Number of successful saves so far
    pub fn save_count(&self) -> usize {
        *self.saves.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ConfigStore for MemoryConfigStore {
    fn load(&self) -> Result<MeasurementConfig> {
        Ok(self.config.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn save(&self, config: &MeasurementConfig) -> Result<()> {
        *self.config.lock().unwrap_or_else(|e| e.into_inner()) = config.clone();
        *self.saves.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        Ok(())
    }
}
