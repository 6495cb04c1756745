//! In-memory bootloader used by the tests.
use std::{cell::RefCell, rc::Rc, time::Duration};

use scroll::{LE, Pread};

use super::{Connector, Transport};
use crate::config::SessionConfig;
use crate::constants::{OK_MARKER, SYNC_ACK, SYNC_PROBE, commands};
use crate::device::DeviceDescriptor;
use crate::error::{Error, Result};
use crate::protocol::checksum;

/// 64 KiB of flash at `0x1000_0000`, 4 KiB sectors, 1 KiB payloads.
pub fn test_device() -> DeviceDescriptor {
    DeviceDescriptor {
        flash_start: 0x1000_0000,
        flash_size: 0x1_0000,
        erase_start: 0x1000_0000,
        erase_size: 0x1000,
        write_size: 0x100,
        max_data_len: 0x400,
    }
}

/// Short deadlines, no settle delays, no progress bars.
pub fn test_config() -> SessionConfig {
    SessionConfig {
        settle_delay: Duration::ZERO,
        sync_retry_delay: Duration::ZERO,
        command_timeout: Duration::from_millis(50),
        write_timeout: Duration::from_millis(50),
        erase_timeout: Duration::from_millis(50),
        poll_interval: Duration::ZERO,
        progress: false,
        ..SessionConfig::default()
    }
}

/// Misbehaviour to inject.
#[derive(Debug, Default, Clone)]
pub struct Faults {
    /// Corrupt this many CRC responses (`READ`'s `CRCC` and `WRIT`)
    pub corrupt_crcs: u32,
    /// Swallow this many requests without answering
    pub silent: u32,
    /// Reply with a broken marker this many times
    pub garble_marker: u32,
    /// Append an extra byte to this many `READ` payloads
    pub long_reads: u32,
    /// Close the connection after `GOGO` instead of answering
    pub disconnect_on_go: bool,
}

#[derive(Debug)]
pub struct State {
    pub info: DeviceDescriptor,
    pub flash: Vec<u8>,
    pub faults: Faults,
    /// Every command executed, with its arguments (`WRIT` data excluded)
    pub log: Vec<(String, Vec<u8>)>,
    pub opens: usize,
    pub open_handles: usize,
    pub sealed: Option<(u32, u32, u32)>,
    pub jumped: Option<u32>,
    input: Vec<u8>,
    output: Vec<u8>,
    disconnected: bool,
}

impl State {
    pub fn commands(&self) -> Vec<&str> {
        self.log.iter().map(|(c, _)| c.as_str()).collect()
    }

    pub fn count(&self, cmd: &str) -> usize {
        self.log.iter().filter(|(c, _)| c == cmd).count()
    }

    fn offset(&self, addr: u32, size: u32) -> Option<usize> {
        let start = addr.checked_sub(self.info.flash_start)? as usize;
        if start + size as usize <= self.flash.len() {
            Some(start)
        } else {
            None
        }
    }

    fn process(&mut self) {
        loop {
            if self.input.starts_with(SYNC_PROBE) {
                self.input.drain(..4);
                self.log.push(("SYNC".into(), vec![]));
                self.output.extend_from_slice(SYNC_ACK);
                continue;
            }
            if self.input.len() < 4 {
                return;
            }
            let code: [u8; 4] = [self.input[0], self.input[1], self.input[2], self.input[3]];
            let args_len = match &code {
                commands::INFO => 0,
                commands::READ | commands::CRC | commands::ERASE => 8,
                commands::SEAL => 12,
                commands::GO => 4,
                commands::WRITE => {
                    if self.input.len() < 12 {
                        return;
                    }
                    8 + self.input.pread_with::<u32>(8, LE).unwrap() as usize
                }
                _ => {
                    self.input.clear();
                    return;
                }
            };
            if self.input.len() < 4 + args_len {
                return;
            }
            let frame: Vec<u8> = self.input.drain(..4 + args_len).collect();
            self.execute(&code, &frame);
        }
    }

    fn execute(&mut self, code: &[u8; 4], frame: &[u8]) {
        let args = &frame[4..];
        let name = String::from_utf8_lossy(code).into_owned();
        let logged = if code == commands::WRITE { &args[..8] } else { args };
        self.log.push((name, logged.to_vec()));

        if self.faults.silent > 0 {
            self.faults.silent -= 1;
            return;
        }
        let word = |i: usize| args.pread_with::<u32>(i * 4, LE).unwrap();
        let payload: Vec<u8> = match code {
            commands::INFO => [
                self.info.flash_start,
                self.info.flash_size,
                self.info.erase_start,
                self.info.erase_size,
                self.info.write_size,
                self.info.max_data_len,
            ]
            .iter()
            .flat_map(|f| f.to_le_bytes())
            .collect(),
            commands::READ => {
                let Some(start) = self.offset(word(0), word(1)) else {
                    return;
                };
                let mut data = self.flash[start..start + word(1) as usize].to_vec();
                if self.faults.long_reads > 0 {
                    self.faults.long_reads -= 1;
                    data.push(0);
                }
                data
            }
            commands::CRC => {
                let Some(start) = self.offset(word(0), word(1)) else {
                    return;
                };
                let crc = checksum(&self.flash[start..start + word(1) as usize]);
                self.crc_reply(crc)
            }
            commands::ERASE => {
                let Some(start) = self.offset(word(0), word(1)) else {
                    return;
                };
                self.flash[start..start + word(1) as usize].fill(0xff);
                vec![]
            }
            commands::WRITE => {
                let data = &args[8..];
                let Some(start) = self.offset(word(0), word(1)) else {
                    return;
                };
                self.flash[start..start + data.len()].copy_from_slice(data);
                self.crc_reply(checksum(data))
            }
            commands::SEAL => {
                self.sealed = Some((word(0), word(1), word(2)));
                vec![]
            }
            commands::GO => {
                self.jumped = Some(word(0));
                if self.faults.disconnect_on_go {
                    self.disconnected = true;
                    return;
                }
                vec![]
            }
            _ => unreachable!(),
        };

        self.output.extend_from_slice(frame);
        if self.faults.garble_marker > 0 {
            self.faults.garble_marker -= 1;
            self.output.extend_from_slice(b"NOPE");
        } else {
            self.output.extend_from_slice(OK_MARKER);
        }
        self.output.extend_from_slice(&payload);
    }

    fn crc_reply(&mut self, crc: u32) -> Vec<u8> {
        if self.faults.corrupt_crcs > 0 {
            self.faults.corrupt_crcs -= 1;
            return (crc ^ 0xdead_beef).to_le_bytes().to_vec();
        }
        crc.to_le_bytes().to_vec()
    }
}

/// A bootloader reachable on `port`, with other dead ports around it.
#[derive(Clone)]
pub struct SimDevice {
    state: Rc<RefCell<State>>,
    port: String,
    ports: Vec<String>,
}

impl SimDevice {
    pub fn new(info: DeviceDescriptor) -> Self {
        SimDevice {
            state: Rc::new(RefCell::new(State {
                info,
                flash: vec![0xff; info.flash_size as usize],
                faults: Faults::default(),
                log: vec![],
                opens: 0,
                open_handles: 0,
                sealed: None,
                jumped: None,
                input: vec![],
                output: vec![],
                disconnected: false,
            })),
            port: "sim0".into(),
            ports: vec!["sim0".into()],
        }
    }

    /// Device at `port`, listed after `others` during enumeration.
    pub fn with_ports(mut self, others: &[&str], port: &str) -> Self {
        self.port = port.into();
        self.ports = others.iter().map(|p| p.to_string()).collect();
        self.ports.push(port.into());
        self
    }

    pub fn with_faults(self, faults: Faults) -> Self {
        self.state.borrow_mut().faults = faults;
        self
    }

    pub fn state(&self) -> std::cell::RefMut<'_, State> {
        self.state.borrow_mut()
    }
}

pub struct SimTransport {
    state: Option<Rc<RefCell<State>>>,
}

impl Drop for SimTransport {
    fn drop(&mut self) {
        if let Some(state) = &self.state {
            state.borrow_mut().open_handles -= 1;
        }
    }
}

impl Connector for SimDevice {
    type Transport = SimTransport;

    fn ports(&self) -> Result<Vec<String>> {
        Ok(self.ports.clone())
    }

    fn open(&self, port: &str) -> Result<SimTransport> {
        if port != self.port {
            // nothing on the other end ever answers
            return Ok(SimTransport { state: None });
        }
        let mut state = self.state.borrow_mut();
        assert_eq!(state.open_handles, 0, "more than one open transport");
        state.opens += 1;
        state.open_handles += 1;
        // a fresh open never sees bytes from the previous exchange
        state.input.clear();
        state.output.clear();
        Ok(SimTransport {
            state: Some(self.state.clone()),
        })
    }
}

impl Transport for SimTransport {
    fn write_all(&mut self, raw: &[u8]) -> Result<()> {
        let Some(state) = &self.state else {
            return Ok(());
        };
        let mut state = state.borrow_mut();
        if state.disconnected {
            return Err(Error::Disconnected);
        }
        state.input.extend_from_slice(raw);
        state.process();
        Ok(())
    }

    fn read_available(&mut self) -> Result<Vec<u8>> {
        let Some(state) = &self.state else {
            return Ok(Vec::new());
        };
        let mut state = state.borrow_mut();
        if state.disconnected {
            return Err(Error::Disconnected);
        }
        // the sync ack arrives in one piece, framed replies trickle out
        let n = if state.output.starts_with(SYNC_ACK) {
            SYNC_ACK.len()
        } else {
            state.output.len().min(7)
        };
        Ok(state.output.drain(..n).collect())
    }
}
