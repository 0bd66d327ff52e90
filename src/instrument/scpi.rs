//! SCPI instrument driver
//!
//! Translates [`Instrument`] calls into the text commands of a [`CommandSet`]
//! and sends them over a [`Transport`]. The driver has no knowledge of sweeps
//! or collections.

use super::transport::{self, ResourceAddress, Transport};
use super::Instrument;
use crate::config::{CommandSet, InstrumentSettings};
use crate::error::{EngineError, Result, ResultExt};
use std::time::Duration;

/// A real instrument reached through a transport
pub struct ScpiInstrument {
    transport: Box<dyn Transport>,
    commands: CommandSet,
    source_range: f64,
    timeout: Duration,
    identity: Option<String>,
    closed: bool,
}

impl ScpiInstrument {
    /// Wrap an open transport without sending anything
    pub fn new(
        transport: Box<dyn Transport>,
        commands: CommandSet,
        source_range: f64,
        timeout: Duration,
    ) -> Self {
        Self {
            transport,
            commands,
            source_range,
            timeout,
            identity: None,
            closed: false,
        }
    }

    /// Open the configured resource, initialize the instrument and confirm
    /// communication with an identification query
    pub fn connect(settings: &InstrumentSettings) -> Result<Self> {
        let resource = settings.resource.as_deref().ok_or_else(|| {
            EngineError::Config("No instrument resource configured".to_string())
        })?;
        let address: ResourceAddress = resource.parse()?;
        let commands = settings.commands()?;

        let transport = transport::open(
            &address,
            settings.baud_rate,
            settings.timeout(),
            &commands.terminator,
        )
        .with_context(|| format!("Failed to open {}", address))?;

        let mut instrument = Self::new(
            transport,
            commands,
            settings.source_range(),
            settings.timeout(),
        );
        instrument
            .initialize()
            .with_context(|| format!("Failed to initialize instrument at {}", address))?;
        Ok(instrument)
    }

    /// Send the initialization sequence and query the identification
    pub fn initialize(&mut self) -> Result<()> {
        for command in self.commands.init.clone() {
            self.write(&command)?;
        }
        let identity = self.identify()?;
        tracing::info!("Instrument identified as {}", identity);
        Ok(())
    }

    pub fn commands(&self) -> &CommandSet {
        &self.commands
    }

    fn write(&mut self, command: &str) -> Result<()> {
        if self.closed {
            return Err(EngineError::NotConnected);
        }
        tracing::trace!("-> {}", command);
        self.transport.write_line(command)
    }

    /// Write a query and read its reply, retrying the read once on timeout
    ///
    /// Input left over from an earlier timed-out query is discarded first.
    fn query(&mut self, command: &str) -> Result<String> {
        if self.closed {
            return Err(EngineError::NotConnected);
        }
        self.transport
            .clear_input()
            .with_context(|| format!("Query '{}'", command))?;
        self.write(command)?;
        let reply = match self.transport.read_line(self.timeout) {
            Err(e) if e.is_timeout() => {
                tracing::debug!("No reply to '{}', waiting once more", command);
                self.transport.read_line(self.timeout)
            }
            other => other,
        }
        .with_context(|| format!("Query '{}'", command))?;
        tracing::trace!("<- {}", reply);
        Ok(reply)
    }

    fn send_rendered(&mut self, template: &str, key: &str, value: f64) -> Result<()> {
        let command = CommandSet::render(template, key, value)?;
        self.write(&command)
    }
}

/// Parse a numeric SCPI reply
///
/// Accepts an optional sign, exponent, trailing unit or status letters
/// (`+1.2345E-09NADC`) and extra comma-separated elements, of which the
/// first is the reading.
pub fn parse_reading(reply: &str) -> Result<f64> {
    let first = reply.split(',').next().unwrap_or("").trim();
    let numeric = first.trim_end_matches(|c: char| c.is_ascii_alphabetic());
    if numeric.is_empty() {
        return Err(EngineError::Protocol(format!("Empty reading: '{}'", reply)));
    }
    let value = numeric
        .parse::<f64>()
        .map_err(|_| EngineError::Protocol(format!("Unparseable reading: '{}'", reply)))?;
    if !value.is_finite() {
        return Err(EngineError::Protocol(format!("Non-finite reading: '{}'", reply)));
    }
    Ok(value)
}

impl Instrument for ScpiInstrument {
    fn identify(&mut self) -> Result<String> {
        let query = self.commands.identify.clone();
        let identity = self.query(&query)?.trim().to_string();
        if identity.is_empty() {
            return Err(EngineError::Protocol(
                "Empty identification reply".to_string(),
            ));
        }
        self.identity = Some(identity.clone());
        Ok(identity)
    }

    fn set_source_range(&mut self, volts: f64) -> Result<()> {
        self.source_range = volts.abs();
        if let Some(template) = self.commands.set_source_range.clone() {
            self.send_rendered(&template, "range", self.source_range)?;
        }
        Ok(())
    }

    fn set_compliance(&mut self, limit: f64) -> Result<()> {
        let template = self.commands.set_compliance.clone();
        self.send_rendered(&template, "limit", limit)
    }

    fn set_integration_time(&mut self, nplc: f64) -> Result<()> {
        let template = self.commands.set_integration_time.clone();
        self.send_rendered(&template, "nplc", nplc)
    }

    fn enable_output(&mut self) -> Result<()> {
        if let Some(command) = self.commands.output_on.clone() {
            self.write(&command)?;
        }
        Ok(())
    }

    fn source_voltage(&mut self, volts: f64) -> Result<()> {
        if !volts.is_finite() || volts.abs() > self.source_range {
            return Err(EngineError::Range {
                voltage: volts,
                limit: self.source_range,
            });
        }
        let template = self.commands.source_voltage.clone();
        self.send_rendered(&template, "voltage", volts)
    }

    fn measure_current(&mut self) -> Result<f64> {
        if let Some(trigger) = self.commands.trigger.clone() {
            self.write(&trigger)?;
        }
        let query = self.commands.measure_current.clone();
        let reply = self.query(&query)?;
        parse_reading(&reply)
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let result = match self.commands.output_off.clone() {
            Some(command) => self.write(&command),
            None => Ok(()),
        };
        self.closed = true;
        tracing::debug!("Closed {}", self.description());
        result
    }

    fn description(&self) -> String {
        match &self.identity {
            Some(identity) => format!("{} ({})", identity, self.transport.description()),
            None => format!("{} ({})", self.commands.name, self.transport.description()),
        }
    }
}
