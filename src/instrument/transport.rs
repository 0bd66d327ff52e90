//! Line-oriented transports to the instrument
//!
//! Supported resource addresses (VISA syntax):
//!
//! - `ASRL<port>::INSTR` - serial port, e.g. `ASRL/dev/ttyUSB0::INSTR`,
//!   `ASRLCOM3::INSTR` or `ASRL1::INSTR`
//! - `TCPIP<n>::<host>::<port>::SOCKET` - raw LAN socket, e.g.
//!   `TCPIP0::192.168.1.20::5025::SOCKET`
//!
//! - `GPIB<n>::<addr>::INSTR`, `USB<n>::...::INSTR`, `TCPIP<n>::<host>::INSTR`
//!   and other VISA-only resources - opened through the system VISA library
//!   when the crate is built with the `instrument_visa` feature

use crate::error::{EngineError, Result};
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::str::FromStr;
use std::time::{Duration, Instant};

/// Blocking read slice; the overall deadline is checked between slices
const READ_SLICE: Duration = Duration::from_millis(20);

/// A bidirectional text channel to one instrument
#[cfg_attr(test, mockall::automock)]
pub trait Transport: Send {
    /// Send one command, terminator appended
    fn write_line(&mut self, line: &str) -> Result<()>;

    /// Wait up to `timeout` for one terminated reply, terminator stripped
    fn read_line(&mut self, timeout: Duration) -> Result<String>;

    /// Discard anything received but not yet read, without blocking
    ///
    /// A reply that arrives after its query timed out must not be taken as
    /// the reply to the next query.
    fn clear_input(&mut self) -> Result<()>;

    fn description(&self) -> String;
}

/// Parsed instrument resource address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceAddress {
    Serial { port: String },
    Socket { host: String, port: u16 },
    Visa { resource: String },
}

impl FromStr for ResourceAddress {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let upper = trimmed.to_ascii_uppercase();
        let parts: Vec<&str> = trimmed.split("::").collect();

        if upper.starts_with("ASRL") {
            if parts.len() > 2 || (parts.len() == 2 && !parts[1].eq_ignore_ascii_case("INSTR")) {
                return Err(EngineError::Config(format!(
                    "Malformed serial resource: {}",
                    trimmed
                )));
            }
            let port = &parts[0][4..];
            if port.is_empty() {
                return Err(EngineError::Config(format!(
                    "Serial resource without a port: {}",
                    trimmed
                )));
            }
            return Ok(ResourceAddress::Serial {
                port: serial_port_name(port),
            });
        }

        if upper.starts_with("TCPIP") && upper.ends_with("::SOCKET") {
            if parts.len() != 4 {
                return Err(EngineError::Config(format!(
                    "Malformed socket resource (expected TCPIP0::host::port::SOCKET): {}",
                    trimmed
                )));
            }
            let port = parts[2].parse::<u16>().map_err(|_| {
                EngineError::Config(format!("Invalid socket port '{}' in {}", parts[2], trimmed))
            })?;
            return Ok(ResourceAddress::Socket {
                host: parts[1].to_string(),
                port,
            });
        }

        let visa_prefix = ["GPIB", "USB", "TCPIP", "VXI", "PXI"]
            .iter()
            .any(|prefix| upper.starts_with(prefix));
        if visa_prefix && parts.len() >= 2 && parts.iter().all(|p| !p.is_empty()) {
            return Ok(ResourceAddress::Visa {
                resource: trimmed.to_string(),
            });
        }

        Err(EngineError::Config(format!(
            "Unsupported resource '{}'",
            trimmed
        )))
    }
}

// VISA numbers serial ports from 1
fn serial_port_name(port: &str) -> String {
    match port.parse::<u32>() {
        Ok(n) if cfg!(windows) => format!("COM{}", n),
        Ok(n) => format!("/dev/ttyS{}", n.saturating_sub(1)),
        Err(_) => port.to_string(),
    }
}

impl std::fmt::Display for ResourceAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceAddress::Serial { port } => write!(f, "serial {}", port),
            ResourceAddress::Socket { host, port } => write!(f, "socket {}:{}", host, port),
            ResourceAddress::Visa { resource } => write!(f, "VISA {}", resource),
        }
    }
}

/// Open the transport for a resource
pub fn open(
    address: &ResourceAddress,
    baud_rate: u32,
    connect_timeout: Duration,
    terminator: &str,
) -> Result<Box<dyn Transport>> {
    match address {
        ResourceAddress::Serial { port } => Ok(Box::new(SerialTransport::open(
            port, baud_rate, terminator,
        )?)),
        ResourceAddress::Socket { host, port } => Ok(Box::new(TcpTransport::connect(
            host,
            *port,
            connect_timeout,
            terminator,
        )?)),
        #[cfg(feature = "instrument_visa")]
        ResourceAddress::Visa { resource } => {
            Ok(Box::new(visa::VisaTransport::open(resource, terminator)?))
        }
        #[cfg(not(feature = "instrument_visa"))]
        ResourceAddress::Visa { resource } => Err(EngineError::Config(format!(
            "{} needs VISA support (build with the instrument_visa feature)",
            resource
        ))),
    }
}

/// Bytes received but not yet returned as a line
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Drop buffered bytes, returning how many were dropped
    fn discard(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }

    fn take_line(&mut self, terminator: &[u8]) -> Option<String> {
        let end = self
            .pending
            .windows(terminator.len())
            .position(|w| w == terminator)?;
        let line: Vec<u8> = self.pending.drain(..end + terminator.len()).collect();
        let text = String::from_utf8_lossy(&line[..end]);
        Some(text.trim_end_matches('\r').to_string())
    }

    /// Read until a terminated line is available or the deadline passes
    fn read_line<R: Read + ?Sized>(
        &mut self,
        reader: &mut R,
        terminator: &[u8],
        timeout: Duration,
        eof_is_closed: bool,
    ) -> Result<String> {
        let deadline = Instant::now() + timeout;
        let mut chunk = [0u8; 256];
        loop {
            if let Some(line) = self.take_line(terminator) {
                return Ok(line);
            }
            if Instant::now() >= deadline {
                return Err(EngineError::Timeout(format!(
                    "no reply within {} ms",
                    timeout.as_millis()
                )));
            }
            match reader.read(&mut chunk) {
                Ok(0) if eof_is_closed => {
                    return Err(EngineError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "connection closed by instrument",
                    )));
                }
                Ok(0) => std::thread::sleep(Duration::from_millis(1)),
                Ok(n) => self.pending.extend_from_slice(&chunk[..n]),
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::TimedOut
                            | std::io::ErrorKind::WouldBlock
                            | std::io::ErrorKind::Interrupted
                    ) => {}
                Err(e) => return Err(EngineError::Io(e)),
            }
        }
    }
}

/// RS-232 / USB-serial transport
pub struct SerialTransport {
    port: Box<dyn serialport::SerialPort>,
    name: String,
    terminator: String,
    buffer: LineBuffer,
}

impl SerialTransport {
    pub fn open(port_name: &str, baud_rate: u32, terminator: &str) -> Result<Self> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(READ_SLICE)
            .open()?;
        tracing::debug!("Serial port '{}' opened at {} baud", port_name, baud_rate);
        Ok(Self {
            port,
            name: port_name.to_string(),
            terminator: terminator.to_string(),
            buffer: LineBuffer::default(),
        })
    }
}

impl Transport for SerialTransport {
    fn write_line(&mut self, line: &str) -> Result<()> {
        self.port.write_all(line.as_bytes())?;
        self.port.write_all(self.terminator.as_bytes())?;
        self.port.flush()?;
        Ok(())
    }

    fn read_line(&mut self, timeout: Duration) -> Result<String> {
        self.buffer
            .read_line(&mut *self.port, self.terminator.as_bytes(), timeout, false)
    }

    fn clear_input(&mut self) -> Result<()> {
        let dropped = self.buffer.discard();
        let waiting = self.port.bytes_to_read()?;
        self.port.clear(serialport::ClearBuffer::Input)?;
        if dropped > 0 || waiting > 0 {
            tracing::debug!(
                "Discarded {} stale bytes from {}",
                dropped + waiting as usize,
                self.name
            );
        }
        Ok(())
    }

    fn description(&self) -> String {
        format!("serial {}", self.name)
    }
}

/// Raw LAN socket transport (SCPI port, usually 5025)
pub struct TcpTransport {
    stream: TcpStream,
    peer: String,
    terminator: String,
    buffer: LineBuffer,
}

impl TcpTransport {
    pub fn connect(host: &str, port: u16, timeout: Duration, terminator: &str) -> Result<Self> {
        let addr = (host, port).to_socket_addrs()?.next().ok_or_else(|| {
            EngineError::Config(format!("Could not resolve instrument host {}", host))
        })?;
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        Self::from_stream(stream, terminator)
    }

    /// Wrap an already connected stream
    pub fn from_stream(stream: TcpStream, terminator: &str) -> Result<Self> {
        stream.set_read_timeout(Some(READ_SLICE))?;
        stream.set_nodelay(true)?;
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        tracing::debug!("Socket connection to {} opened", peer);
        Ok(Self {
            stream,
            peer,
            terminator: terminator.to_string(),
            buffer: LineBuffer::default(),
        })
    }
}

impl Transport for TcpTransport {
    fn write_line(&mut self, line: &str) -> Result<()> {
        let mut message = String::with_capacity(line.len() + self.terminator.len());
        message.push_str(line);
        message.push_str(&self.terminator);
        self.stream.write_all(message.as_bytes())?;
        self.stream.flush()?;
        Ok(())
    }

    fn read_line(&mut self, timeout: Duration) -> Result<String> {
        self.buffer
            .read_line(&mut self.stream, self.terminator.as_bytes(), timeout, true)
    }

    fn clear_input(&mut self) -> Result<()> {
        let mut dropped = self.buffer.discard();
        self.stream.set_nonblocking(true)?;
        let mut chunk = [0u8; 256];
        let drained = loop {
            match self.stream.read(&mut chunk) {
                // A closed peer is reported by the next read
                Ok(0) => break Ok(()),
                Ok(n) => dropped += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => break Err(e),
            }
        };
        self.stream.set_nonblocking(false)?;
        drained?;
        if dropped > 0 {
            tracing::debug!("Discarded {} stale bytes from {}", dropped, self.peer);
        }
        Ok(())
    }

    fn description(&self) -> String {
        format!("socket {}", self.peer)
    }
}

#[cfg(feature = "instrument_visa")]
mod visa {
    use super::{LineBuffer, Transport};
    use crate::error::{EngineError, Result};
    use std::ffi::CString;
    use std::io::{Read, Write};
    use std::time::Duration;
    use visa_rs::prelude::*;

    fn visa_error(e: visa_rs::Error) -> EngineError {
        EngineError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
    }

    /// Reader adapter that turns VISA timeouts into read slices
    struct Session<'a>(&'a mut visa_rs::Instrument);

    impl Read for Session<'_> {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.0.read(buf).map_err(|e| {
                if format!("{:?}", e).to_ascii_uppercase().contains("TMO") {
                    std::io::Error::new(std::io::ErrorKind::TimedOut, e)
                } else {
                    e
                }
            })
        }
    }

    /// GPIB, USBTMC and VXI-11 transport through the system VISA library
    pub struct VisaTransport {
        // Declared before the resource manager so it closes first
        session: visa_rs::Instrument,
        _rm: DefaultRM,
        resource: String,
        terminator: String,
        buffer: LineBuffer,
        stale: bool,
    }

    impl VisaTransport {
        pub fn open(resource: &str, terminator: &str) -> Result<Self> {
            let rm = DefaultRM::new().map_err(visa_error)?;
            let name = CString::new(resource).map_err(|_| {
                EngineError::Config(format!("Invalid VISA resource name: {}", resource))
            })?;
            let session = rm
                .open(&VisaString::from(name), AccessMode::NO_LOCK, TIMEOUT_IMMEDIATE)
                .map_err(visa_error)?;
            tracing::debug!("VISA session to {} opened", resource);
            Ok(Self {
                session,
                _rm: rm,
                resource: resource.to_string(),
                terminator: terminator.to_string(),
                buffer: LineBuffer::default(),
                stale: false,
            })
        }
    }

    impl Transport for VisaTransport {
        fn write_line(&mut self, line: &str) -> Result<()> {
            let mut message = String::with_capacity(line.len() + self.terminator.len());
            message.push_str(line);
            message.push_str(&self.terminator);
            self.session.write_all(message.as_bytes())?;
            self.session.flush()?;
            Ok(())
        }

        fn read_line(&mut self, timeout: Duration) -> Result<String> {
            let result = self.buffer.read_line(
                &mut Session(&mut self.session),
                self.terminator.as_bytes(),
                timeout,
                false,
            );
            if matches!(result, Err(EngineError::Timeout(_))) {
                self.stale = true;
            }
            result
        }

        fn clear_input(&mut self) -> Result<()> {
            self.buffer.discard();
            // Device clear also aborts the pending reply on the instrument
            if self.stale {
                self.session.clear().map_err(visa_error)?;
                self.stale = false;
            }
            Ok(())
        }

        fn description(&self) -> String {
            format!("VISA {}", self.resource)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Cursor};
    use std::net::TcpListener;

    #[test]
    fn test_parse_serial_resource() {
        let addr: ResourceAddress = "ASRL/dev/ttyUSB0::INSTR".parse().unwrap();
        assert_eq!(
            addr,
            ResourceAddress::Serial {
                port: "/dev/ttyUSB0".to_string()
            }
        );
        let addr: ResourceAddress = "asrlCOM3::instr".parse().unwrap();
        assert_eq!(
            addr,
            ResourceAddress::Serial {
                port: "COM3".to_string()
            }
        );
    }

    #[test]
    fn test_parse_socket_resource() {
        let addr: ResourceAddress = "TCPIP0::192.168.1.20::5025::SOCKET".parse().unwrap();
        assert_eq!(
            addr,
            ResourceAddress::Socket {
                host: "192.168.1.20".to_string(),
                port: 5025
            }
        );
    }

    #[test]
    fn test_parse_visa_resources() {
        for resource in [
            "GPIB0::26::INSTR",
            "USB0::0x0957::0x8B18::MY51141234::INSTR",
            "TCPIP0::10.0.0.1::inst0::INSTR",
        ] {
            let addr: ResourceAddress = resource.parse().unwrap();
            assert_eq!(
                addr,
                ResourceAddress::Visa {
                    resource: resource.to_string()
                }
            );
        }
    }

    #[test]
    fn test_parse_rejects_unsupported() {
        assert!("TCPIP0::10.0.0.1::notaport::SOCKET"
            .parse::<ResourceAddress>()
            .is_err());
        assert!("TCPIP0::10.0.0.1::SOCKET".parse::<ResourceAddress>().is_err());
        assert!("ASRL::INSTR".parse::<ResourceAddress>().is_err());
        assert!("GPIB0".parse::<ResourceAddress>().is_err());
        assert!("/dev/ttyUSB0".parse::<ResourceAddress>().is_err());
    }

    #[cfg(not(feature = "instrument_visa"))]
    #[test]
    fn test_visa_resource_needs_feature() {
        let addr: ResourceAddress = "GPIB0::26::INSTR".parse().unwrap();
        let err = match open(&addr, 9600, Duration::from_millis(100), "\n") {
            Err(e) => e,
            Ok(_) => panic!("VISA resource opened without VISA support"),
        };
        assert!(matches!(err, EngineError::Config(_)));
        assert!(err.to_string().contains("instrument_visa"));
    }

    #[test]
    fn test_line_buffer_splits_lines() {
        let mut reader = Cursor::new(b"+1.0E-9\r\n-2.5E-12\n".to_vec());
        let mut buffer = LineBuffer::default();
        let timeout = Duration::from_millis(100);
        assert_eq!(
            buffer.read_line(&mut reader, b"\n", timeout, false).unwrap(),
            "+1.0E-9"
        );
        assert_eq!(
            buffer.read_line(&mut reader, b"\n", timeout, false).unwrap(),
            "-2.5E-12"
        );
    }

    #[test]
    fn test_line_buffer_discard() {
        let mut reader = Cursor::new(b"stale\nfresh\n".to_vec());
        let mut buffer = LineBuffer::default();
        assert_eq!(
            buffer
                .read_line(&mut reader, b"\n", Duration::from_millis(100), false)
                .unwrap(),
            "stale"
        );
        assert_eq!(buffer.discard(), 6);
        assert!(matches!(
            buffer.read_line(&mut reader, b"\n", Duration::from_millis(30), false),
            Err(EngineError::Timeout(_))
        ));
    }

    #[test]
    fn test_line_buffer_times_out() {
        let mut reader = Cursor::new(b"partial".to_vec());
        let mut buffer = LineBuffer::default();
        let result = buffer.read_line(&mut reader, b"\n", Duration::from_millis(30), false);
        assert!(matches!(result, Err(EngineError::Timeout(_))));
    }

    #[test]
    fn test_tcp_transport_exchange() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut writer = stream;
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            assert_eq!(line, "*IDN?\n");
            writer.write_all(b"KEYSIGHT,B2901A,0,1.0\n").unwrap();
        });

        let mut transport =
            TcpTransport::connect("127.0.0.1", port, Duration::from_secs(1), "\n").unwrap();
        transport.write_line("*IDN?").unwrap();
        let reply = transport.read_line(Duration::from_secs(1)).unwrap();
        assert_eq!(reply, "KEYSIGHT,B2901A,0,1.0");
        server.join().unwrap();

        // Server side closed
        assert!(matches!(
            transport.read_line(Duration::from_millis(200)),
            Err(EngineError::Io(_))
        ));
    }

    #[test]
    fn test_tcp_clear_input_drops_late_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(b"late\npart").unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            assert_eq!(line, "*IDN?\n");
            stream.write_all(b"fresh\n").unwrap();
        });

        let mut transport =
            TcpTransport::connect("127.0.0.1", port, Duration::from_secs(1), "\n").unwrap();
        std::thread::sleep(Duration::from_millis(100));
        transport.clear_input().unwrap();
        transport.write_line("*IDN?").unwrap();
        assert_eq!(transport.read_line(Duration::from_secs(1)).unwrap(), "fresh");
        server.join().unwrap();
    }
}
