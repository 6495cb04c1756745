
/// Probe written to a port to find the bootloader.
pub const SYNC_PROBE: &[u8; 4] = b"SYNC";
/// Reply to [`SYNC_PROBE`].
pub const SYNC_ACK: &[u8; 8] = b"SYNCPICO";

/// Marker between the echoed request and the response payload.
pub const OK_MARKER: &[u8; 4] = b"OKOK";

/// Size of the `INFO` response, six little-endian u32 fields.
pub const INFO_RESPONSE_LEN: usize = 24;

/// Size of a CRC32 response.
pub const CRC_RESPONSE_LEN: usize = 4;

/// Largest erase request issued in one command.
pub const MAX_ERASE_CHUNK: u32 = 0xffff_f000;

pub mod commands {
    pub const INFO: &[u8; 4] = b"INFO";
    pub const READ: &[u8; 4] = b"READ";
    pub const CRC: &[u8; 4] = b"CRCC";
    pub const ERASE: &[u8; 4] = b"ERAS";
    pub const WRITE: &[u8; 4] = b"WRIT";
    pub const SEAL: &[u8; 4] = b"SEAL";
    pub const GO: &[u8; 4] = b"GOGO";
}
