//! Error types for bootloader sessions
use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// No port answered the sync probe
    #[error("could not find an RP2040 in bootloader mode")]
    NoDeviceFound,

    /// The response marker did not show up before the deadline
    #[error(
        "timed out waiting for {command} response, received {} bytes: {}",
        .received.len(),
        hex::encode(.received)
    )]
    ProtocolTimeout {
        command: &'static str,
        received: Vec<u8>,
    },

    /// Wrong response length or garbled marker
    #[error("malformed {command} response: {reason}")]
    MalformedResponse {
        command: &'static str,
        reason: String,
    },

    /// CRC32 reported by the device differs from the local one
    #[error("CRC mismatch at {addr:#010x}: expected {expected:#010x}, got {actual:#010x}")]
    IntegrityMismatch { addr: u32, expected: u32, actual: u32 },

    #[error("address {addr:#010x} and length {len:#x} must be aligned to {align:#x}")]
    AlignmentViolation { addr: u32, len: u32, align: u32 },

    #[error(
        "range {start:#010x}..{end:#010x} is outside {limit_start:#010x}..{limit_end:#010x}"
    )]
    RangeViolation {
        start: u64,
        end: u64,
        limit_start: u64,
        limit_end: u64,
    },

    #[error("unsupported image format: {0}")]
    UnsupportedImageFormat(String),

    #[error("image contains no loadable segments inside flash")]
    NoLoadableSegments,

    #[error("base address must be provided for a flat binary image")]
    MissingBaseAddress,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The serial connection went away
    #[error("serial connection closed")]
    Disconnected,

    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("ELF error: {0}")]
    Elf(#[from] object::read::Error),

    #[error("Intel HEX error: {0}")]
    IntelHex(#[from] ihex::ReaderError),

    #[error("decode error: {0}")]
    Decode(#[from] scroll::Error),
}

impl Error {
    /// Whether a chunk attempt that failed this way may be repeated.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ProtocolTimeout { .. }
                | Error::MalformedResponse { .. }
                | Error::IntegrityMismatch { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
