//! Session-wide timing and retry settings.
use std::time::Duration;

/// Immutable settings shared by the protocol engine and the transfer controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Wait between writing the sync probe and reading the reply
    pub settle_delay: Duration,
    /// Sync attempts per candidate port
    pub sync_attempts: u32,
    pub sync_retry_delay: Duration,
    /// Deadline of a regular command exchange
    pub command_timeout: Duration,
    pub write_timeout: Duration,
    pub erase_timeout: Duration,
    /// Sleep between polls of an idle transport
    pub poll_interval: Duration,
    /// Attempts per read/write/erase chunk
    pub chunk_attempts: u32,
    /// Optional cap below the device's `max_data_len`
    pub max_chunk_len: Option<u32>,
    /// Draw progress bars for chunked transfers
    pub progress: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(100),
            sync_attempts: 5,
            sync_retry_delay: Duration::from_millis(100),
            command_timeout: Duration::from_secs(1),
            write_timeout: Duration::from_secs(10),
            erase_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(1),
            chunk_attempts: 3,
            max_chunk_len: None,
            progress: true,
        }
    }
}
