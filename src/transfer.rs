//! Chunked read/erase/write with per-chunk retries and CRC checks.

use std::io::Write;

use indicatif::{ProgressBar, ProgressStyle};

use crate::config::SessionConfig;
use crate::constants::MAX_ERASE_CHUNK;
use crate::device::DeviceDescriptor;
use crate::error::{Error, Result};
use crate::protocol::{Protocol, checksum};
use crate::transport::Connector;

const PROGRESS_TEMPLATE: &str =
    "{msg} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})";

/// Splits `[addr, addr + len)` into pieces of at most `cap` bytes.
#[derive(Debug, Clone)]
pub struct Chunks {
    addr: u32,
    remaining: u32,
    cap: u32,
}

impl Chunks {
    pub fn new(addr: u32, len: u32, cap: u32) -> Result<Self> {
        if cap == 0 {
            return Err(Error::InvalidArgument("chunk size must not be zero".into()));
        }
        Ok(Chunks {
            addr,
            remaining: len,
            cap,
        })
    }
}

impl Iterator for Chunks {
    /// `(address, size)`
    type Item = (u32, u32);

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let size = self.cap.min(self.remaining);
        let chunk = (self.addr, size);
        self.addr = self.addr.wrapping_add(size);
        self.remaining -= size;
        Some(chunk)
    }
}

/// Drives logical operations chunk by chunk through a [`Protocol`].
pub struct Transfer<'a, C: Connector> {
    protocol: &'a Protocol<C>,
    device: &'a DeviceDescriptor,
    config: &'a SessionConfig,
}

impl<'a, C: Connector> Transfer<'a, C> {
    pub fn new(protocol: &'a Protocol<C>, device: &'a DeviceDescriptor) -> Self {
        Transfer {
            protocol,
            device,
            config: protocol.config(),
        }
    }

    /// Payload cap for reads and writes.
    pub fn data_chunk_len(&self) -> u32 {
        match self.config.max_chunk_len {
            Some(cap) => cap.min(self.device.max_data_len),
            None => self.device.max_data_len,
        }
    }

    /// Erase request cap, kept a multiple of the sector size.
    pub fn erase_chunk_len(&self) -> u32 {
        let sector = self.device.erase_size;
        if sector == 0 {
            return MAX_ERASE_CHUNK;
        }
        MAX_ERASE_CHUNK - MAX_ERASE_CHUNK % sector
    }

    /// Run `attempt` until it succeeds, fails for good, or runs out of tries.
    fn retry<T>(
        &self,
        what: &str,
        addr: u32,
        mut attempt: impl FnMut() -> Result<T>,
    ) -> Result<T> {
        let attempts = self.config.chunk_attempts.max(1);
        let mut n = 1;
        loop {
            match attempt() {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && n < attempts => {
                    log::warn!(
                        "{} at {:#010x} failed (attempt {}/{}): {}",
                        what,
                        addr,
                        n,
                        attempts,
                        e
                    );
                    n += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn progress(&self, len: u32, msg: &'static str) -> Result<ProgressBar> {
        if !self.config.progress {
            return Ok(ProgressBar::hidden());
        }
        let pb = ProgressBar::new(len as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template(PROGRESS_TEMPLATE)
                .map_err(|e| Error::InvalidArgument(e.to_string()))?
                .progress_chars("#>-"),
        );
        pb.set_message(msg);
        Ok(pb)
    }

    fn read_chunk(&self, addr: u32, size: u32) -> Result<Vec<u8>> {
        let data = self.protocol.read(addr, size)?;
        let expected = checksum(&data);
        let actual = self.protocol.crc(addr, size)?;
        if expected != actual {
            return Err(Error::IntegrityMismatch {
                addr,
                expected,
                actual,
            });
        }
        Ok(data)
    }

    /// Read `len` bytes into `out`, chunk by chunk.
    ///
    /// Chunks read before a failure have already been written to `out`.
    pub fn read_into<W: Write>(&self, addr: u32, len: u32, out: &mut W) -> Result<()> {
        let pb = self.progress(len, "Reading")?;
        for (chunk_addr, size) in Chunks::new(addr, len, self.data_chunk_len())? {
            log::debug!("Reading {:#x} bytes from {:#010x}", size, chunk_addr);
            let data = self.retry("read", chunk_addr, || self.read_chunk(chunk_addr, size))?;
            out.write_all(&data)?;
            pb.inc(size as u64);
        }
        pb.finish_and_clear();
        Ok(())
    }

    pub fn read(&self, addr: u32, len: u32) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity(len as usize);
        self.read_into(addr, len, &mut data)?;
        Ok(data)
    }

    /// Erase whole sectors. `addr` and `len` must both be sector aligned.
    pub fn erase(&self, addr: u32, len: u32) -> Result<()> {
        let sector = self.device.sector_size();
        if sector == 0 {
            return Err(Error::InvalidArgument("device reports zero sector size".into()));
        }
        if addr % sector != 0 || len % sector != 0 {
            return Err(Error::AlignmentViolation {
                addr,
                len,
                align: sector,
            });
        }
        self.device.check_erase_range(addr, len)?;

        let pb = self.progress(len, "Erasing")?;
        for (chunk_addr, size) in Chunks::new(addr, len, self.erase_chunk_len())? {
            log::debug!("Erasing {:#x} bytes from {:#010x}", size, chunk_addr);
            self.retry("erase", chunk_addr, || self.protocol.erase(chunk_addr, size))?;
            pb.inc(size as u64);
        }
        pb.finish_and_clear();
        Ok(())
    }

    fn write_chunk(&self, addr: u32, data: &[u8]) -> Result<()> {
        let actual = self.protocol.write(addr, data)?;
        let expected = checksum(data);
        if expected != actual {
            return Err(Error::IntegrityMismatch {
                addr,
                expected,
                actual,
            });
        }
        Ok(())
    }

    /// Program `data` at `addr`, which must lie inside flash.
    pub fn write(&self, addr: u32, data: &[u8]) -> Result<()> {
        let len = u32::try_from(data.len())
            .map_err(|_| Error::InvalidArgument(format!("{} bytes is too large", data.len())))?;
        self.device.check_range(addr, len)?;

        let pb = self.progress(len, "Writing")?;
        let mut offset = 0usize;
        for (chunk_addr, size) in Chunks::new(addr, len, self.data_chunk_len())? {
            let chunk = &data[offset..offset + size as usize];
            log::debug!("Writing {:#x} bytes to {:#010x}", size, chunk_addr);
            self.retry("write", chunk_addr, || self.write_chunk(chunk_addr, chunk))?;
            offset += size as usize;
            pb.inc(size as u64);
        }
        pb.finish_and_clear();
        Ok(())
    }

    /// Compare device CRCs against `data`, chunk by chunk.
    pub fn verify(&self, addr: u32, data: &[u8]) -> Result<()> {
        let len = u32::try_from(data.len())
            .map_err(|_| Error::InvalidArgument(format!("{} bytes is too large", data.len())))?;
        self.device.check_range(addr, len)?;

        let pb = self.progress(len, "Verifying")?;
        let mut offset = 0usize;
        for (chunk_addr, size) in Chunks::new(addr, len, self.data_chunk_len())? {
            let expected = checksum(&data[offset..offset + size as usize]);
            self.retry("verify", chunk_addr, || {
                let actual = self.protocol.crc(chunk_addr, size)?;
                if actual != expected {
                    return Err(Error::IntegrityMismatch {
                        addr: chunk_addr,
                        expected,
                        actual,
                    });
                }
                Ok(())
            })?;
            offset += size as usize;
            pb.inc(size as u64);
        }
        pb.finish_and_clear();
        Ok(())
    }
}
