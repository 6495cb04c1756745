//! Session sequencing: discover, identify, erase, write, seal, boot.

use std::io::Write;

use crate::config::SessionConfig;
use crate::device::DeviceDescriptor;
use crate::error::{Error, Result};
use crate::format::{Image, pad_len};
use crate::protocol::Protocol;
use crate::transfer::Transfer;
use crate::transport::Connector;

/// An identified bootloader session.
pub struct Flashing<C: Connector> {
    protocol: Protocol<C>,
    device: DeviceDescriptor,
}

impl<C: Connector> Flashing<C> {
    /// Find the bootloader on `port` (or any port) and read its memory map.
    pub fn connect(connector: C, port: Option<&str>, config: SessionConfig) -> Result<Self> {
        let protocol = Protocol::discover(connector, port, config)?;
        log::info!("Getting device info from port {}", protocol.port());
        let device = protocol.info()?;
        log::debug!("device info:\n{}", device);
        Ok(Flashing { protocol, device })
    }

    pub fn port(&self) -> &str {
        self.protocol.port()
    }

    pub fn device(&self) -> &DeviceDescriptor {
        &self.device
    }

    fn transfer(&self) -> Transfer<'_, C> {
        Transfer::new(&self.protocol, &self.device)
    }

    pub fn dump_info(&self) {
        log::info!("Port: {}", self.port());
        for line in self.device.to_string().lines() {
            log::info!("{}", line);
        }
    }

    /// Read flash into `out`. Defaults to everything from `flash_start` to the end.
    pub fn read<W: Write>(&self, addr: Option<u32>, len: Option<u32>, out: &mut W) -> Result<()> {
        let addr = addr.unwrap_or(self.device.flash_start);
        let len = len.unwrap_or_else(|| self.remaining_from(addr));
        log_range("Reading", addr, len);
        self.transfer().read_into(addr, len, out)
    }

    /// Erase sectors. Defaults to everything from `erase_start` to the end.
    pub fn erase(&self, addr: Option<u32>, len: Option<u32>) -> Result<()> {
        let addr = addr.unwrap_or(self.device.erase_start);
        let len = len.unwrap_or_else(|| self.remaining_from(addr));
        log_range("Erasing", addr, len);
        self.transfer().erase(addr, len)
    }

    /// Program an image without erasing first.
    pub fn write(&self, image: &Image) -> Result<()> {
        log_range("Writing", image.address, image.size()?);
        self.transfer().write(image.address, &image.data)
    }

    pub fn verify(&self, image: &Image) -> Result<()> {
        log_range("Verifying", image.address, image.size()?);
        self.transfer().verify(image.address, &image.data)?;
        log::info!("Verified!");
        Ok(())
    }

    /// Erase, write and seal `image`, then optionally jump to it.
    pub fn flash(&self, image: &Image, boot: bool) -> Result<()> {
        let len = image.size()?;
        self.device.check_range(image.address, len)?;

        let erase_len = sector_padded(len, self.device.erase_size)?;
        log::debug!("Need to pad erase by {:#x}", erase_len - len);
        self.erase(Some(image.address), Some(erase_len))?;
        self.write(image)?;

        let crc = image.crc();
        log::info!("Sealing RP2040 with CRC {:#010x}", crc);
        self.protocol.seal(image.address, len, crc)?;

        if boot {
            self.boot(Some(image.address))?;
        }
        Ok(())
    }

    /// Jump to `addr`, `flash_start` by default.
    pub fn boot(&self, addr: Option<u32>) -> Result<()> {
        let addr = addr.unwrap_or(self.device.flash_start);
        log::info!("Jumping to {:#010x}", addr);
        self.protocol.jump(addr)
    }

    fn remaining_from(&self, addr: u32) -> u32 {
        self.device.flash_end().saturating_sub(addr as u64) as u32
    }
}

/// `len` rounded up to whole sectors.
fn sector_padded(len: u32, sector: u32) -> Result<u32> {
    let pad = pad_len(len as usize, sector as usize) as u32;
    len.checked_add(pad).ok_or_else(|| {
        Error::InvalidArgument(format!("{:#x} bytes cannot be padded to whole sectors", len))
    })
}

fn log_range(what: &str, addr: u32, len: u32) {
    log::info!(
        "{} {:#010x}..{:#010x} (length {:#x})",
        what,
        addr,
        addr as u64 + len as u64,
        len
    );
}
