//! Abstract byte transport to the bootloader.
use crate::error::Result;

pub use self::serial::{Baudrate, SerialConnector, SerialTransport};

mod serial;
#[cfg(test)]
pub(crate) mod sim;

/// An open connection. Dropping it closes the connection.
pub trait Transport {
    fn write_all(&mut self, raw: &[u8]) -> Result<()>;
    /// Drain whatever bytes have arrived so far, without blocking.
    fn read_available(&mut self) -> Result<Vec<u8>>;
}

/// Opens transports by port name.
///
/// Only one transport is open at a time; it lives for a single exchange.
pub trait Connector {
    type Transport: Transport;

    /// Candidate ports to probe when none is given.
    fn ports(&self) -> Result<Vec<String>>;
    fn open(&self, port: &str) -> Result<Self::Transport>;
}
