//! RP2040 serial bootloader protocol implementation.

pub mod config;
pub mod constants;
pub mod device;
pub mod error;
pub mod flashing;
pub mod format;
pub mod protocol;
pub mod transfer;
pub mod transport;

pub use self::config::SessionConfig;
pub use self::device::DeviceDescriptor;
pub use self::error::{Error, Result};
pub use self::flashing::Flashing;
pub use self::format::{Image, ImageFormat};
pub use self::protocol::{Command, Protocol};
pub use self::transport::{Connector, SerialConnector, Transport};
