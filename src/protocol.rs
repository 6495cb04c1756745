//! The command/response protocol of the RP2040 serial bootloader

use std::fmt;
use std::thread::sleep;
use std::time::{Duration, Instant};

use crc::{CRC_32_ISO_HDLC, Crc};
use scroll::{LE, Pwrite};

use crate::config::SessionConfig;
use crate::constants::{
    CRC_RESPONSE_LEN, INFO_RESPONSE_LEN, OK_MARKER, SYNC_ACK, SYNC_PROBE, commands,
};
use crate::device::DeviceDescriptor;
use crate::error::{Error, Result};
use crate::transport::{Connector, Transport};

const CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// CRC32 as computed by the bootloader (zlib flavour).
pub fn checksum(data: &[u8]) -> u32 {
    CRC.checksum(data)
}

/// Bootloader command
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Command<'a> {
    /// Query the memory map. Returns 24 bytes.
    Info,
    /// Read `size` bytes of flash.
    Read { address: u32, size: u32 },
    /// CRC32 of a flash range.
    Crc { address: u32, size: u32 },
    /// Erase a sector-aligned range. Slow.
    Erase { address: u32, size: u32 },
    /// Program `data`. Returns the CRC32 of what was received.
    Write { address: u32, data: &'a [u8] },
    /// Mark `[address, address + length)` as a valid image with checksum `crc`.
    Seal { address: u32, length: u32, crc: u32 },
    /// Jump to `address`.
    ///
    /// The device resets its USB stack, the connection is lost.
    Go { address: u32 },
}

impl Command<'_> {
    pub fn code(&self) -> &'static [u8; 4] {
        match self {
            Command::Info => commands::INFO,
            Command::Read { .. } => commands::READ,
            Command::Crc { .. } => commands::CRC,
            Command::Erase { .. } => commands::ERASE,
            Command::Write { .. } => commands::WRITE,
            Command::Seal { .. } => commands::SEAL,
            Command::Go { .. } => commands::GO,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Info => "INFO",
            Command::Read { .. } => "READ",
            Command::Crc { .. } => "CRCC",
            Command::Erase { .. } => "ERAS",
            Command::Write { .. } => "WRIT",
            Command::Seal { .. } => "SEAL",
            Command::Go { .. } => "GOGO",
        }
    }

    /// Argument bytes following the command code.
    pub fn args(&self) -> Result<Vec<u8>> {
        match *self {
            Command::Info => Ok(vec![]),
            Command::Read { address, size }
            | Command::Crc { address, size }
            | Command::Erase { address, size } => {
                let mut buf = vec![0u8; 8];
                buf.pwrite_with(address, 0, LE)?;
                buf.pwrite_with(size, 4, LE)?;
                Ok(buf)
            }
            Command::Write { address, data } => {
                // ADDR, SIZE, DATA
                let mut buf = vec![0u8; 8 + data.len()];
                buf.pwrite_with(address, 0, LE)?;
                buf.pwrite_with(data.len() as u32, 4, LE)?;
                buf[8..].copy_from_slice(data);
                Ok(buf)
            }
            Command::Seal {
                address,
                length,
                crc,
            } => {
                let mut buf = vec![0u8; 12];
                buf.pwrite_with(address, 0, LE)?;
                buf.pwrite_with(length, 4, LE)?;
                buf.pwrite_with(crc, 8, LE)?;
                Ok(buf)
            }
            Command::Go { address } => Ok(address.to_le_bytes().to_vec()),
        }
    }

    /// Payload bytes expected after the marker.
    pub fn response_len(&self) -> usize {
        match *self {
            Command::Info => INFO_RESPONSE_LEN,
            Command::Read { size, .. } => size as usize,
            Command::Crc { .. } | Command::Write { .. } => CRC_RESPONSE_LEN,
            Command::Erase { .. } | Command::Seal { .. } | Command::Go { .. } => 0,
        }
    }

    pub fn timeout(&self, config: &SessionConfig) -> Duration {
        match self {
            Command::Erase { .. } => config.erase_timeout,
            Command::Write { .. } => config.write_timeout,
            _ => config.command_timeout,
        }
    }
}

impl fmt::Debug for Command<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Info => write!(f, "INFO"),
            Command::Read { address, size }
            | Command::Crc { address, size }
            | Command::Erase { address, size } => {
                write!(f, "{} {:#010x}+{:#x}", self.name(), address, size)
            }
            Command::Write { address, data } => {
                write!(f, "WRIT {:#010x}+{:#x}", address, data.len())
            }
            Command::Seal {
                address,
                length,
                crc,
            } => write!(f, "SEAL {:#010x}+{:#x} crc={:#010x}", address, length, crc),
            Command::Go { address } => write!(f, "GOGO {:#010x}", address),
        }
    }
}

/// Outcome of scanning the bytes received so far.
#[derive(Debug, PartialEq, Eq)]
pub enum Scan<'a> {
    /// Need more bytes
    Incomplete,
    /// The bytes following the marker
    Complete(&'a [u8]),
    /// Something other than the marker follows the echo
    Garbled(&'a [u8]),
}

/// Look for the marker right after the `echo_len` echoed request bytes.
///
/// Data inside the echo is never matched, even if it contains the marker.
pub fn scan_response(received: &[u8], echo_len: usize, response_len: usize) -> Scan<'_> {
    let payload_start = echo_len + OK_MARKER.len();
    if received.len() < payload_start {
        return Scan::Incomplete;
    }
    let marker = &received[echo_len..payload_start];
    if marker != OK_MARKER {
        return Scan::Garbled(marker);
    }
    if received.len() < payload_start + response_len {
        return Scan::Incomplete;
    }
    Scan::Complete(&received[payload_start..])
}

/// Protocol engine bound to one serial port.
///
/// Every exchange opens the port, runs one request/response and closes it again.
pub struct Protocol<C: Connector> {
    connector: C,
    port: String,
    config: SessionConfig,
}

impl<C: Connector> Protocol<C> {
    pub fn new(connector: C, port: impl Into<String>, config: SessionConfig) -> Self {
        Protocol {
            connector,
            port: port.into(),
            config,
        }
    }

    /// Probe `port`, or every enumerated port, until one answers the sync.
    pub fn discover(connector: C, port: Option<&str>, config: SessionConfig) -> Result<Self> {
        log::info!("Synchronizing with RP2040...");
        let candidates = match port {
            Some(port) => vec![port.to_string()],
            None => connector.ports()?,
        };
        for candidate in candidates {
            log::debug!("Trying to sync with port {}", candidate);
            for attempt in 1..=config.sync_attempts {
                match sync_port(&connector, &candidate, &config) {
                    Ok(()) => {
                        log::info!("Synchronized with port {}", candidate);
                        return Ok(Protocol::new(connector, candidate, config));
                    }
                    Err(e) => {
                        log::debug!("{}: attempt {} failed: {}", candidate, attempt, e);
                    }
                }
                sleep(config.sync_retry_delay);
            }
        }
        Err(Error::NoDeviceFound)
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Single sync attempt against the bound port.
    pub fn sync(&self) -> Result<()> {
        sync_port(&self.connector, &self.port, &self.config)
    }

    /// Run one framed exchange and return everything after the marker.
    pub fn send(&self, command: &Command) -> Result<Vec<u8>> {
        let code = command.code();
        let args = command.args()?;
        let response_len = command.response_len();
        let timeout = command.timeout(&self.config);

        let mut transport = self.connector.open(&self.port)?;
        log::trace!("=> {}{}", hex::encode(code), hex::encode(&args));
        transport.write_all(code)?;
        if !args.is_empty() {
            transport.write_all(&args)?;
        }

        let echo_len = code.len() + args.len();
        let deadline = Instant::now() + timeout;
        let mut received = Vec::with_capacity(echo_len + OK_MARKER.len() + response_len);
        loop {
            let incoming = transport.read_available()?;
            received.extend_from_slice(&incoming);
            match scan_response(&received, echo_len, response_len) {
                Scan::Complete(payload) => {
                    log::trace!("<= {}", hex::encode(&received));
                    return Ok(payload.to_vec());
                }
                Scan::Garbled(marker) => {
                    return Err(Error::MalformedResponse {
                        command: command.name(),
                        reason: format!("unexpected marker {}", hex::encode(marker)),
                    });
                }
                Scan::Incomplete => {}
            }
            if Instant::now() >= deadline {
                return Err(Error::ProtocolTimeout {
                    command: command.name(),
                    received,
                });
            }
            if incoming.is_empty() {
                sleep(self.config.poll_interval);
            }
        }
    }

    /// `send`, then require exactly `len` payload bytes.
    fn send_expect(&self, command: &Command, len: usize) -> Result<Vec<u8>> {
        let payload = self.send(command)?;
        if payload.len() != len {
            return Err(Error::MalformedResponse {
                command: command.name(),
                reason: format!("expected {} bytes, got {}", len, payload.len()),
            });
        }
        Ok(payload)
    }

    fn send_crc(&self, command: &Command) -> Result<u32> {
        let payload = self.send_expect(command, CRC_RESPONSE_LEN)?;
        Ok(u32::from_le_bytes([
            payload[0], payload[1], payload[2], payload[3],
        ]))
    }

    pub fn info(&self) -> Result<DeviceDescriptor> {
        let payload = self.send(&Command::Info)?;
        DeviceDescriptor::from_bytes(&payload)
    }

    pub fn read(&self, address: u32, size: u32) -> Result<Vec<u8>> {
        self.send_expect(&Command::Read { address, size }, size as usize)
    }

    /// CRC32 of flash contents as computed by the device.
    pub fn crc(&self, address: u32, size: u32) -> Result<u32> {
        self.send_crc(&Command::Crc { address, size })
    }

    pub fn erase(&self, address: u32, size: u32) -> Result<()> {
        self.send(&Command::Erase { address, size })?;
        Ok(())
    }

    /// Program `data`, returning the CRC32 the device computed over it.
    pub fn write(&self, address: u32, data: &[u8]) -> Result<u32> {
        self.send_crc(&Command::Write { address, data })
    }

    pub fn seal(&self, address: u32, length: u32, crc: u32) -> Result<()> {
        self.send(&Command::Seal {
            address,
            length,
            crc,
        })?;
        Ok(())
    }

    /// Jump to `address`. Losing the connection afterwards is expected.
    pub fn jump(&self, address: u32) -> Result<()> {
        match self.send(&Command::Go { address }) {
            Ok(_) => Ok(()),
            Err(Error::Disconnected) => {
                log::info!("RP2040 serial disconnected");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

fn sync_port<C: Connector>(connector: &C, port: &str, config: &SessionConfig) -> Result<()> {
    let mut transport = connector.open(port)?;
    transport.write_all(SYNC_PROBE)?;
    sleep(config.settle_delay);
    let resp = transport.read_available()?;
    log::trace!("{} <= {}", port, hex::encode(&resp));
    if resp != SYNC_ACK {
        return Err(Error::MalformedResponse {
            command: "SYNC",
            reason: format!("unexpected reply {}", hex::encode(&resp)),
        });
    }
    Ok(())
}
