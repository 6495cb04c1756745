//! Firmware file formats
use std::path::Path;
use std::str;

use object::{
    Endianness, Object, ObjectSection,
    elf::{FileHeader32, PT_LOAD},
    read::elf::{ElfFile32, FileHeader, ProgramHeader},
};

use crate::device::DeviceDescriptor;
use crate::error::{Error, Result};
use crate::protocol::checksum;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum ImageFormat {
    /// Raw bytes, needs an explicit load address
    Binary,
    /// ELF32 executable, loaded by physical address
    Elf,
    IntelHex,
}

impl ImageFormat {
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .map(|s| s.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        match &*ext {
            "bin" => Ok(ImageFormat::Binary),
            "elf" => Ok(ImageFormat::Elf),
            "hex" | "ihex" => Ok(ImageFormat::IntelHex),
            _ => Err(Error::UnsupportedImageFormat(format!(
                "unsupported file type {:?}",
                path.display().to_string()
            ))),
        }
    }
}

/// A contiguous, padded payload and where it goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub address: u32,
    pub data: Vec<u8>,
}

impl Image {
    /// Length as sent on the wire. Fails for payloads beyond 4 GiB.
    pub fn size(&self) -> Result<u32> {
        u32::try_from(self.data.len()).map_err(|_| {
            Error::InvalidArgument(format!("{} bytes is too large", self.data.len()))
        })
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// One past the last byte.
    pub fn end(&self) -> u64 {
        self.address as u64 + self.data.len() as u64
    }

    pub fn crc(&self) -> u32 {
        checksum(&self.data)
    }
}

/// Bytes destined for one physical address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub paddr: u32,
    pub data: Vec<u8>,
}

/// Zero bytes needed to bring `length` up to a multiple of `align`.
pub fn pad_len(length: usize, align: usize) -> usize {
    if align == 0 {
        return 0;
    }
    (align - length % align) % align
}

/// Load an image file and pad it to the device's write granularity.
///
/// `address` is required for flat binaries and ignored otherwise.
pub fn read_image_from_file<P: AsRef<Path>>(
    path: P,
    format: Option<ImageFormat>,
    device: &DeviceDescriptor,
    address: Option<u32>,
) -> Result<Image> {
    let p = path.as_ref();
    let format = match format {
        Some(format) => format,
        None => ImageFormat::from_path(p)?,
    };
    // reject before touching the file
    if format == ImageFormat::Binary && address.is_none() {
        return Err(Error::MissingBaseAddress);
    }
    let raw = std::fs::read(p)?;
    log::info!("Read {} as {:?} format", p.display(), format);
    load_image(&raw, format, device, address)
}

/// Like [`read_image_from_file`], for bytes already in memory.
pub fn load_image(
    raw: &[u8],
    format: ImageFormat,
    device: &DeviceDescriptor,
    address: Option<u32>,
) -> Result<Image> {
    let (address, mut data) = match format {
        ImageFormat::Binary => (address.ok_or(Error::MissingBaseAddress)?, raw.to_vec()),
        ImageFormat::Elf => {
            warn_ignored_address(address);
            load_elf(raw, device)?
        }
        ImageFormat::IntelHex => {
            warn_ignored_address(address);
            read_ihex(str::from_utf8(raw).map_err(|e| {
                Error::UnsupportedImageFormat(format!("Intel HEX is not text: {}", e))
            })?)?
        }
    };
    let padding = pad_len(data.len(), device.write_size as usize);
    if padding > 0 {
        log::info!("Need to pad image by {:#x}", padding);
        data.resize(data.len() + padding, 0);
    }
    Ok(Image { address, data })
}

fn warn_ignored_address(address: Option<u32>) {
    if let Some(address) = address {
        log::warn!("Ignoring address {:#010x}, the image carries its own", address);
    }
}

/// Flatten the flash-resident parts of an ELF32 file, like `objcopy -O binary`.
///
/// Sections are placed at their load (physical) address, so initialised data
/// living in RAM at run time lands in flash where the startup code copies it from.
pub fn load_elf(elf_data: &[u8], device: &DeviceDescriptor) -> Result<(u32, Vec<u8>)> {
    match object::FileKind::parse(elf_data)? {
        object::FileKind::Elf32 => (),
        _ => {
            return Err(Error::UnsupportedImageFormat(
                "cannot read file as ELF32 format".into(),
            ));
        }
    }
    let elf_header = FileHeader32::<Endianness>::parse(elf_data)?;
    let binary = ElfFile32::<Endianness>::parse(elf_data)?;
    let endian = elf_header.endian()?;

    let mut chunks = vec![];
    for (index, segment) in elf_header
        .program_headers(endian, elf_data)?
        .iter()
        .enumerate()
    {
        if segment.p_type(endian) != PT_LOAD {
            continue;
        }
        let p_paddr: u64 = segment.p_paddr(endian).into();
        let p_vaddr: u64 = segment.p_vaddr(endian).into();
        let p_memsz: u64 = segment.p_memsz(endian).into();
        if !device.contains(p_paddr, p_memsz) {
            log::warn!(
                "Skipping program header {}: {:#010x}..{:#010x} is outside flash",
                index,
                p_paddr,
                p_paddr + p_memsz
            );
            continue;
        }
        log::debug!(
            "Loadable segment: physical {:#010x}, virtual {:#010x}, size {:#x}",
            p_paddr,
            p_vaddr,
            p_memsz
        );

        for section in binary.sections() {
            let data = section.data()?;
            if data.is_empty() {
                continue;
            }
            let address = section.address();
            // contains range
            if address < p_vaddr || address + data.len() as u64 > p_vaddr + p_memsz {
                continue;
            }
            let paddr = p_paddr + (address - p_vaddr);
            log::debug!(
                "Matching section: {:?} at {:#010x} size: {:#x}",
                section.name()?,
                paddr,
                data.len()
            );
            chunks.push(Chunk {
                paddr: paddr as u32,
                data: data.to_vec(),
            });
        }
    }

    log::debug!("found {} chunks", chunks.len());
    merge_chunks(chunks)
}

pub fn read_ihex(data: &str) -> Result<(u32, Vec<u8>)> {
    use ihex::Record;

    let mut base_address = 0;

    let mut chunks = vec![];
    for record in ihex::Reader::new(data) {
        let record = record?;
        use Record::*;
        match record {
            Data { offset, value } => {
                let paddr = base_address + offset as u32;

                chunks.push(Chunk { paddr, data: value });
            }
            EndOfFile => (),
            ExtendedSegmentAddress(address) => {
                base_address = (address as u32) * 16;
            }
            StartSegmentAddress { .. } => (),
            ExtendedLinearAddress(address) => {
                base_address = (address as u32) << 16;
            }
            StartLinearAddress(_) => (),
        };
    }
    merge_chunks(chunks)
}

/// Sort chunks by address and copy them into one zero-filled buffer.
///
/// Returns the lowest address and the buffer spanning up to the end of the last chunk.
pub fn merge_chunks(mut chunks: Vec<Chunk>) -> Result<(u32, Vec<u8>)> {
    chunks.sort_by_key(|c| c.paddr);

    let Some(first) = chunks.first() else {
        return Err(Error::NoLoadableSegments);
    };
    let start_address = first.paddr;
    let end_address = chunks
        .iter()
        .map(|c| c.paddr as u64 + c.data.len() as u64)
        .max()
        .unwrap_or(start_address as u64);

    let mut binary = vec![0u8; (end_address - start_address as u64) as usize];
    for chunk in chunks {
        let start = (chunk.paddr - start_address) as usize;
        binary[start..start + chunk.data.len()].copy_from_slice(&chunk.data);
    }
    Ok((start_address, binary))
}
