//! Memory map reported by the bootloader
use std::fmt;

use scroll::{LE, Pread};

use crate::constants::INFO_RESPONSE_LEN;
use crate::error::{Error, Result};

/// Flash geometry of the connected device, as returned by `INFO`.
///
/// Built once per session and never changed afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub flash_start: u32,
    pub flash_size: u32,
    pub erase_start: u32,
    /// Sector size, the erase granularity
    pub erase_size: u32,
    /// Write granularity
    pub write_size: u32,
    /// Largest payload of a single `READ` or `WRIT`
    pub max_data_len: u32,
}

impl DeviceDescriptor {
    /// Parse the fixed-size `INFO` response.
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        if raw.len() != INFO_RESPONSE_LEN {
            return Err(Error::MalformedResponse {
                command: "INFO",
                reason: format!(
                    "expected {} bytes, got {}: {}",
                    INFO_RESPONSE_LEN,
                    raw.len(),
                    hex::encode(raw)
                ),
            });
        }
        let offset = &mut 0;
        Ok(DeviceDescriptor {
            flash_start: raw.gread_with(offset, LE)?,
            flash_size: raw.gread_with(offset, LE)?,
            erase_start: raw.gread_with(offset, LE)?,
            erase_size: raw.gread_with(offset, LE)?,
            write_size: raw.gread_with(offset, LE)?,
            max_data_len: raw.gread_with(offset, LE)?,
        })
    }

    /// One past the last flash address.
    pub const fn flash_end(&self) -> u64 {
        self.flash_start as u64 + self.flash_size as u64
    }

    pub const fn sector_size(&self) -> u32 {
        self.erase_size
    }

    /// Whether `[addr, addr + len)` lies inside flash.
    pub fn contains(&self, addr: u64, len: u64) -> bool {
        addr >= self.flash_start as u64 && addr + len <= self.flash_end()
    }

    /// Fails with `RangeViolation` unless `[addr, addr + len)` lies inside flash.
    pub fn check_range(&self, addr: u32, len: u32) -> Result<()> {
        self.check_range_from(self.flash_start, addr, len)
    }

    /// Like [`check_range`](Self::check_range), for erases starting at `erase_start`.
    pub fn check_erase_range(&self, addr: u32, len: u32) -> Result<()> {
        self.check_range_from(self.erase_start, addr, len)
    }

    fn check_range_from(&self, limit_start: u32, addr: u32, len: u32) -> Result<()> {
        let start = addr as u64;
        let end = start + len as u64;
        if start < limit_start as u64 || end > self.flash_end() {
            return Err(Error::RangeViolation {
                start,
                end,
                limit_start: limit_start as u64,
                limit_end: self.flash_end(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Flash start:     {:#x}", self.flash_start)?;
        writeln!(f, "Flash size:      {:#x}", self.flash_size)?;
        writeln!(f, "Erase start:     {:#x}", self.erase_start)?;
        writeln!(f, "Erase size:      {:#x}", self.erase_size)?;
        writeln!(f, "Write size:      {:#x}", self.write_size)?;
        write!(f, "Max data length: {:#x}", self.max_data_len)
    }
}
