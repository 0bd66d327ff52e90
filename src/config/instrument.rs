//! Instrument settings and SCPI command tables
//!
//! Each supported family has a built-in [`CommandSet`]. A table can be
//! overridden by a TOML file, which lets a lab drive a compatible instrument
//! without recompiling.
//!
//! Templates use `{name}` placeholders rendered with `strfmt`:
//!
//! | Command                  | Placeholder |
//! |--------------------------|-------------|
//! | `set_source_range`       | `{range}`   |
//! | `set_compliance`         | `{limit}`   |
//! | `set_integration_time`   | `{nplc}`    |
//! | `source_voltage`         | `{voltage}` |

use crate::error::{EngineError, Result, ResultExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use strfmt::strfmt;

/// Default bounded wait for an instrument reply, in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Default serial baud rate
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Default current compliance in amperes
pub const DEFAULT_COMPLIANCE_A: f64 = 1e-3;

/// Supported instrument families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentFamily {
    /// Keithley 6517A electrometer
    Keithley6517A,
    /// Keysight B2901A precision source/measure unit
    #[default]
    KeysightB2901A,
}

impl InstrumentFamily {
    /// All supported families
    pub fn all() -> &'static [InstrumentFamily] {
        &[InstrumentFamily::Keithley6517A, InstrumentFamily::KeysightB2901A]
    }

    /// Display name
    pub fn display_name(&self) -> &'static str {
        match self {
            InstrumentFamily::Keithley6517A => "Keithley 6517A",
            InstrumentFamily::KeysightB2901A => "Keysight B2901A",
        }
    }

    /// Largest voltage the built-in source can apply
    pub fn default_source_range(&self) -> f64 {
        match self {
            InstrumentFamily::Keithley6517A => 1000.0,
            InstrumentFamily::KeysightB2901A => 210.0,
        }
    }

    /// Built-in command table for this family
    pub fn default_commands(&self) -> CommandSet {
        match self {
            InstrumentFamily::Keithley6517A => CommandSet {
                name: self.display_name().to_string(),
                terminator: "\n".to_string(),
                init: vec![
                    "*RST".to_string(),
                    ":SYST:ZCH OFF".to_string(),
                    ":SENS:FUNC 'CURR'".to_string(),
                    ":FORM:ELEM READ".to_string(),
                ],
                identify: "*IDN?".to_string(),
                set_source_range: Some(":SOUR:VOLT:RANG {range}".to_string()),
                set_compliance: ":SENS:CURR:PROT {limit}".to_string(),
                set_integration_time: ":SENS:CURR:NPLC {nplc}".to_string(),
                output_on: Some(":OUTP ON".to_string()),
                output_off: Some(":OUTP OFF".to_string()),
                source_voltage: ":SOUR:VOLT {voltage}".to_string(),
                trigger: Some(":INIT".to_string()),
                measure_current: ":MEAS:CURR?".to_string(),
            },
            InstrumentFamily::KeysightB2901A => CommandSet {
                name: self.display_name().to_string(),
                terminator: "\n".to_string(),
                init: vec![
                    "*RST".to_string(),
                    "SYST:REM".to_string(),
                    "OUTP OFF".to_string(),
                    "SOUR:FUNC VOLT".to_string(),
                    "SENS:FUNC \"CURR\"".to_string(),
                    "FORM:ELEM:SENS CURR".to_string(),
                ],
                identify: "*IDN?".to_string(),
                set_source_range: Some("SOUR:VOLT:RANG {range}".to_string()),
                set_compliance: "SENS:CURR:PROT {limit}".to_string(),
                set_integration_time: "SENS:CURR:NPLC {nplc}".to_string(),
                output_on: Some("OUTP ON".to_string()),
                output_off: Some("OUTP OFF".to_string()),
                source_voltage: "SOUR:VOLT {voltage}".to_string(),
                trigger: Some("INIT".to_string()),
                measure_current: "MEAS:CURR?".to_string(),
            },
        }
    }
}

impl std::fmt::Display for InstrumentFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

impl std::str::FromStr for InstrumentFamily {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "6517a" | "keithley6517a" | "keithley" => Ok(InstrumentFamily::Keithley6517A),
            "b2901a" | "keysightb2901a" | "keysight" => Ok(InstrumentFamily::KeysightB2901A),
            _ => Err(EngineError::Config(format!("Unknown instrument family: {}", s))),
        }
    }
}

/// Command table for one instrument family
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSet {
    /// Human-readable table name
    pub name: String,
    /// Line terminator appended to every command and expected after replies
    #[serde(default = "default_terminator")]
    pub terminator: String,
    /// Commands sent once after the connection opens
    #[serde(default)]
    pub init: Vec<String>,
    /// Identification query
    #[serde(default = "default_identify")]
    pub identify: String,
    #[serde(default)]
    pub set_source_range: Option<String>,
    pub set_compliance: String,
    pub set_integration_time: String,
    #[serde(default)]
    pub output_on: Option<String>,
    #[serde(default)]
    pub output_off: Option<String>,
    pub source_voltage: String,
    /// Sent before each measurement query, if present
    #[serde(default)]
    pub trigger: Option<String>,
    pub measure_current: String,
}

fn default_terminator() -> String {
    "\n".to_string()
}

fn default_identify() -> String {
    "*IDN?".to_string()
}

impl CommandSet {
    /// Parse a command table from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let table: CommandSet = toml::from_str(content)
            .map_err(|e| EngineError::Config(format!("Invalid command table: {}", e)))?;
        table.check_templates()?;
        Ok(table)
    }

    /// Load a command table from a TOML file
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(EngineError::from)
            .with_context(|| format!("Failed to read command table {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    /// Render a template, substituting a single named value
    pub fn render(template: &str, key: &str, value: f64) -> Result<String> {
        let mut ctx = HashMap::new();
        ctx.insert(key.to_string(), format_number(value));
        strfmt(template, &ctx).map_err(|e| {
            EngineError::Config(format!("Failed to format command '{}': {}", template, e))
        })
    }

    // Catch placeholder typos at load time instead of mid-session
    fn check_templates(&self) -> Result<()> {
        if self.terminator.is_empty() {
            return Err(EngineError::Config(format!(
                "Command table '{}' has an empty terminator",
                self.name
            )));
        }
        if let Some(range) = &self.set_source_range {
            Self::render(range, "range", 1.0)?;
        }
        Self::render(&self.set_compliance, "limit", 1.0)?;
        Self::render(&self.set_integration_time, "nplc", 1.0)?;
        Self::render(&self.source_voltage, "voltage", 1.0)?;
        Ok(())
    }
}

/// Format a value the way SCPI instruments accept it
///
/// Integers print without a fractional part, very small or large magnitudes
/// use exponent notation.
pub fn format_number(value: f64) -> String {
    if value == 0.0 {
        return "0".to_string();
    }
    let magnitude = value.abs();
    if !(1e-3..1e6).contains(&magnitude) {
        format!("{:E}", value)
    } else if value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        let text = format!("{:.6}", value);
        text.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}

/// Connection and source settings for the instrument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentSettings {
    /// Instrument family (selects the built-in command table)
    #[serde(default)]
    pub family: InstrumentFamily,

    /// Resource address, e.g. `ASRL/dev/ttyUSB0::INSTR`
    /// or `TCPIP0::192.168.1.20::5025::SOCKET`
    #[serde(default)]
    pub resource: Option<String>,

    /// TOML file overriding the built-in command table
    #[serde(default)]
    pub command_table: Option<PathBuf>,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Bounded wait for each reply, in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Source range in volts (family default when absent)
    #[serde(default)]
    pub source_range_v: Option<f64>,

    /// Current compliance in amperes
    #[serde(default = "default_compliance")]
    pub compliance_a: f64,

    /// Integration time used during sweeps, in power-line cycles
    #[serde(default = "default_nplc")]
    pub sweep_nplc: f64,

    /// Mains frequency, used to convert NPLC to seconds
    #[serde(default = "default_line_frequency")]
    pub line_frequency_hz: f64,
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_compliance() -> f64 {
    DEFAULT_COMPLIANCE_A
}

fn default_nplc() -> f64 {
    1.0
}

fn default_line_frequency() -> f64 {
    50.0
}

impl Default for InstrumentSettings {
    fn default() -> Self {
        Self {
            family: InstrumentFamily::default(),
            resource: None,
            command_table: None,
            baud_rate: DEFAULT_BAUD_RATE,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            source_range_v: None,
            compliance_a: DEFAULT_COMPLIANCE_A,
            sweep_nplc: default_nplc(),
            line_frequency_hz: default_line_frequency(),
        }
    }
}

impl InstrumentSettings {
    /// Settings for a family with everything else at defaults
    pub fn for_family(family: InstrumentFamily) -> Self {
        Self {
            family,
            ..Default::default()
        }
    }

    /// Effective source range in volts
    pub fn source_range(&self) -> f64 {
        self.source_range_v
            .unwrap_or_else(|| self.family.default_source_range())
    }

    /// Bounded reply wait as a [`std::time::Duration`]
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.timeout_ms)
    }

    /// Effective command table: the override file if configured, else the built-in one
    pub fn commands(&self) -> Result<CommandSet> {
        match &self.command_table {
            Some(path) => CommandSet::from_toml_file(path),
            None => Ok(self.family.default_commands()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_template() {
        let cmd = CommandSet::render("SOUR:VOLT {voltage}", "voltage", 1.5).unwrap();
        assert_eq!(cmd, "SOUR:VOLT 1.5");
        let cmd = CommandSet::render("SENS:CURR:PROT {limit}", "limit", 1e-3).unwrap();
        assert_eq!(cmd, "SENS:CURR:PROT 0.001");
        let cmd = CommandSet::render("SOUR:VOLT {voltage}", "voltage", -2.0).unwrap();
        assert_eq!(cmd, "SOUR:VOLT -2");
    }

    #[test]
    fn test_render_unknown_placeholder() {
        assert!(CommandSet::render("SOUR:VOLT {volts}", "voltage", 1.0).is_err());
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(0.0), "0");
        assert_eq!(format_number(10.0), "10");
        assert_eq!(format_number(0.25), "0.25");
        assert_eq!(format_number(1e-9), "1E-9");
        assert_eq!(format_number(-0.1), "-0.1");
    }

    #[test]
    fn test_builtin_tables_render() {
        for family in InstrumentFamily::all() {
            let table = family.default_commands();
            assert!(table.check_templates().is_ok(), "{}", family);
            assert!(table.init.contains(&"*RST".to_string()));
        }
    }

    #[test]
    fn test_command_table_from_toml() {
        let toml = r#"
            name = "Custom"
            init = ["*RST"]
            set_compliance = "CURR:LIM {limit}"
            set_integration_time = "NPLC {nplc}"
            source_voltage = "VOLT {voltage}"
            measure_current = "READ?"
        "#;
        let table = CommandSet::from_toml_str(toml).unwrap();
        assert_eq!(table.terminator, "\n");
        assert_eq!(table.identify, "*IDN?");
        assert!(table.trigger.is_none());
        assert_eq!(table.measure_current, "READ?");
    }

    #[test]
    fn test_command_table_bad_placeholder() {
        let toml = r#"
            name = "Broken"
            set_compliance = "CURR:LIM {lim}"
            set_integration_time = "NPLC {nplc}"
            source_voltage = "VOLT {voltage}"
            measure_current = "READ?"
        "#;
        assert!(matches!(
            CommandSet::from_toml_str(toml),
            Err(EngineError::Config(_))
        ));
    }

    #[test]
    fn test_command_table_empty_terminator() {
        let toml = r#"
            name = "Silent"
            terminator = ""
            set_compliance = "CURR:LIM {limit}"
            set_integration_time = "NPLC {nplc}"
            source_voltage = "VOLT {voltage}"
            measure_current = "READ?"
        "#;
        assert!(CommandSet::from_toml_str(toml).is_err());
    }

    #[test]
    fn test_family_parse() {
        assert_eq!(
            "6517A".parse::<InstrumentFamily>().unwrap(),
            InstrumentFamily::Keithley6517A
        );
        assert_eq!(
            "keysight-b2901a".parse::<InstrumentFamily>().unwrap(),
            InstrumentFamily::KeysightB2901A
        );
        assert!("hp4156".parse::<InstrumentFamily>().is_err());
    }

    #[test]
    fn test_settings_defaults() {
        let settings: InstrumentSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings.timeout_ms, 5000);
        assert_eq!(settings.compliance_a, 1e-3);
        assert_eq!(settings.source_range(), 210.0);
        let k = InstrumentSettings::for_family(InstrumentFamily::Keithley6517A);
        assert_eq!(k.source_range(), 1000.0);
    }
}
