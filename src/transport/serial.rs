//! Serial Transportation.
use std::{
    fmt::Display,
    io::{self, Read, Write},
    time::Duration,
};

use clap::{ValueEnum, builder::PossibleValue};
use serialport::SerialPort;

use super::{Connector, Transport};
use crate::error::{Error, Result};

const SERIAL_TIMEOUT_MS: u64 = 1000;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Baudrate {
    #[default]
    Baud115200,
    Baud1m,
    Baud2m,
}

impl From<Baudrate> for u32 {
    fn from(value: Baudrate) -> Self {
        match value {
            Baudrate::Baud115200 => 115200,
            Baudrate::Baud1m => 1000000,
            Baudrate::Baud2m => 2000000,
        }
    }
}

impl Display for Baudrate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", u32::from(*self))
    }
}

impl ValueEnum for Baudrate {
    fn value_variants<'a>() -> &'a [Self] {
        &[Baudrate::Baud115200, Baudrate::Baud1m, Baudrate::Baud2m]
    }

    fn to_possible_value(&self) -> Option<PossibleValue> {
        match self {
            Baudrate::Baud115200 => Some(PossibleValue::new("115200").aliases(["Baud115200"])),
            Baudrate::Baud1m => {
                Some(PossibleValue::new("1m").aliases(["1000000", "1_000_000", "Baud1m"]))
            }
            Baudrate::Baud2m => {
                Some(PossibleValue::new("2m").aliases(["2000000", "2_000_000", "Baud2m"]))
            }
        }
    }
}

/// Opens serial ports with fixed line settings.
#[derive(Debug, Clone)]
pub struct SerialConnector {
    baudrate: Baudrate,
    timeout: Duration,
}

impl SerialConnector {
    pub fn new(baudrate: Baudrate) -> Self {
        SerialConnector {
            baudrate,
            timeout: Duration::from_millis(SERIAL_TIMEOUT_MS),
        }
    }

    pub fn scan_ports() -> Result<Vec<String>> {
        let ports = serialport::available_ports()?;
        Ok(ports.into_iter().map(|p| p.port_name).collect())
    }
}

impl Default for SerialConnector {
    fn default() -> Self {
        Self::new(Baudrate::default())
    }
}

impl Connector for SerialConnector {
    type Transport = SerialTransport;

    fn ports(&self) -> Result<Vec<String>> {
        Self::scan_ports()
    }

    fn open(&self, port: &str) -> Result<SerialTransport> {
        log::trace!("Opening serial port: \"{}\" @ {} baud", port, self.baudrate);
        let serial_port = serialport::new(port, self.baudrate.into())
            .timeout(self.timeout)
            .open()
            .map_err(map_serial_error)?;
        Ok(SerialTransport { serial_port })
    }
}

pub struct SerialTransport {
    serial_port: Box<dyn SerialPort>,
}

impl Transport for SerialTransport {
    fn write_all(&mut self, raw: &[u8]) -> Result<()> {
        self.serial_port.write_all(raw).map_err(map_io_error)?;
        self.serial_port.flush().map_err(map_io_error)?;
        Ok(())
    }

    fn read_available(&mut self) -> Result<Vec<u8>> {
        let pending = self.serial_port.bytes_to_read().map_err(map_poll_error)? as usize;
        if pending == 0 {
            return Ok(Vec::new());
        }
        let mut buf = vec![0u8; pending];
        let nread = self.serial_port.read(&mut buf).map_err(map_io_error)?;
        buf.truncate(nread);
        Ok(buf)
    }
}

fn is_disconnect(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}

/// EIO, what a hung-up tty returns once the USB device is gone.
const EIO: i32 = 5;

fn map_io_error(err: io::Error) -> Error {
    if is_disconnect(err.kind()) || err.raw_os_error() == Some(EIO) {
        Error::Disconnected
    } else {
        Error::Io(err)
    }
}

fn map_serial_error(err: serialport::Error) -> Error {
    match err.kind() {
        serialport::ErrorKind::NoDevice => Error::Disconnected,
        serialport::ErrorKind::Io(kind) if is_disconnect(kind) => Error::Disconnected,
        _ => Error::Serial(err),
    }
}

/// Polling a vanished port fails without a usable error kind.
fn map_poll_error(err: serialport::Error) -> Error {
    match err.kind() {
        serialport::ErrorKind::Unknown => Error::Disconnected,
        _ => map_serial_error(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_baudrate_values() {
        assert_eq!(u32::from(Baudrate::default()), 115200);
        assert_eq!(Baudrate::from_str("1000000", false).unwrap(), Baudrate::Baud1m);
        assert_eq!(Baudrate::from_str("2m", false).unwrap(), Baudrate::Baud2m);
        assert_eq!(Baudrate::Baud2m.to_string(), "2000000");
    }

    #[test]
    fn test_disconnect_mapping() {
        let err = map_io_error(io::Error::from(io::ErrorKind::BrokenPipe));
        assert!(matches!(err, Error::Disconnected));
        let err = map_io_error(io::Error::from(io::ErrorKind::TimedOut));
        assert!(matches!(err, Error::Io(_)));
        let err = map_serial_error(serialport::Error::new(
            serialport::ErrorKind::NoDevice,
            "gone",
        ));
        assert!(matches!(err, Error::Disconnected));
    }

    #[test]
    fn test_hung_up_tty_is_disconnect() {
        let err = map_io_error(io::Error::from_raw_os_error(EIO));
        assert!(matches!(err, Error::Disconnected));
        let err = map_io_error(io::Error::from_raw_os_error(2));
        assert!(matches!(err, Error::Io(_)));

        let unknown =
            || serialport::Error::new(serialport::ErrorKind::Unknown, "Input/output error");
        assert!(matches!(map_poll_error(unknown()), Error::Disconnected));
        // opening a port is not a disconnect
        assert!(matches!(map_serial_error(unknown()), Error::Serial(_)));
        let invalid = serialport::Error::new(serialport::ErrorKind::InvalidInput, "bad");
        assert!(matches!(map_poll_error(invalid), Error::Serial(_)));
    }
}
