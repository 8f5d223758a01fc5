//! In-memory Trek stick.
//!
//! [`SimulatedStick`] implements [`UsbTransport`] the way the real firmware
//! behaves: an init request answers with the 31-byte geometry response, and
//! every bulk transfer must be preceded by exactly one command frame whose
//! sector count matches the transfer length. Framing mistakes by the driver
//! are collected in [`StickStats::violations`] instead of panicking, so a
//! harness can report them with its seed.

use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use trekbd::TransportError;
use trekbd::device::trek::{
    ENDPOINT_BULK_IN, ENDPOINT_BULK_OUT, INFO_RESPONSE_LEN, MAX_SECTORS_PER_TRANSFER,
    PRODUCT_ID, REQUEST_INIT, REQUEST_IO, REQUEST_TYPE_INFO, REQUEST_TYPE_READ,
    REQUEST_TYPE_WRITE, SectorCommand, UsbTransport, VENDOR_ID,
};
use trekbd::types::SECTOR_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    In,
    Out,
}

/// Transfer counters and framing violations seen by the stick.
#[derive(Debug, Default, Clone)]
pub struct StickStats {
    pub commands: u64,
    pub bulk_reads: u64,
    pub bulk_writes: u64,
    /// Writes acknowledged with fewer bytes than were delivered.
    pub short_writes: u64,
    pub max_chunk_sectors: u32,
    pub violations: Vec<String>,
}

struct StickState {
    sectors: Vec<u8>,
    info: [u8; INFO_RESPONSE_LEN],
    pending: Option<(Direction, SectorCommand)>,
    rng: SmallRng,
    short_write_rate: f64,
    closed: bool,
    stats: StickStats,
}

impl StickState {
    fn violation(&mut self, message: String) -> TransportError {
        self.stats.violations.push(message.clone());
        TransportError::Transfer { message }
    }

    fn total_sectors(&self) -> u64 {
        (self.sectors.len() / SECTOR_SIZE) as u64
    }

    /// Consume the pending command, checking it matches the transfer.
    fn take_pending(
        &mut self,
        direction: Direction,
        length: usize,
    ) -> Result<SectorCommand, TransportError> {
        let Some((pending_dir, cmd)) = self.pending.take() else {
            return Err(self.violation(format!("{direction:?} transfer without a command")));
        };
        if pending_dir != direction {
            return Err(self.violation(format!(
                "{direction:?} transfer after a {pending_dir:?} command"
            )));
        }
        if cmd.count as usize * SECTOR_SIZE != length {
            return Err(self.violation(format!(
                "transfer of {length} bytes for a {}-sector command",
                cmd.count
            )));
        }
        Ok(cmd)
    }
}

/// A Trek stick living in memory. Clones share the same medium.
#[derive(Clone)]
pub struct SimulatedStick {
    state: Arc<Mutex<StickState>>,
}

impl SimulatedStick {
    /// A zero-filled stick of `size_param1 * size_param2` sectors.
    pub fn new(seed: u64, size_param1: u32, size_param2: u32) -> Self {
        let mut info = [0u8; INFO_RESPONSE_LEN];
        info[2..4].copy_from_slice(&VENDOR_ID.to_be_bytes());
        info[4..6].copy_from_slice(&PRODUCT_ID.to_be_bytes());
        info[0x0B..0x0F].copy_from_slice(&size_param1.to_le_bytes());
        info[0x0F..0x13].copy_from_slice(&size_param2.to_le_bytes());

        let sectors = size_param1 as usize * size_param2 as usize;
        Self {
            state: Arc::new(Mutex::new(StickState {
                sectors: vec![0u8; sectors * SECTOR_SIZE],
                info,
                pending: None,
                rng: SmallRng::seed_from_u64(seed),
                short_write_rate: 0.0,
                closed: false,
                stats: StickStats::default(),
            })),
        }
    }

    /// Acknowledge this fraction of bulk writes as short. The data still
    /// lands in full, so a driver that only warns stays consistent.
    pub fn with_short_writes(self, rate: f64) -> Self {
        self.state.lock().short_write_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn stats(&self) -> StickStats {
        self.state.lock().stats.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn contents(&self) -> Vec<u8> {
        self.state.lock().sectors.clone()
    }
}

impl UsbTransport for SimulatedStick {
    fn control_in(
        &mut self,
        request_type: u8,
        request: u8,
        _value: u16,
        _index: u16,
        length: usize,
    ) -> Result<Vec<u8>, TransportError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(TransportError::transfer("device released"));
        }
        if request_type != REQUEST_TYPE_INFO || request != REQUEST_INIT {
            return Err(state.violation(format!(
                "unexpected control-in {request_type:#04x}/{request}"
            )));
        }
        Ok(state.info[..length.min(INFO_RESPONSE_LEN)].to_vec())
    }

    fn control_out(
        &mut self,
        request_type: u8,
        request: u8,
        _value: u16,
        _index: u16,
        data: &[u8],
    ) -> Result<usize, TransportError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(TransportError::transfer("device released"));
        }

        let direction = match (request_type, request) {
            (REQUEST_TYPE_READ, REQUEST_IO) => Direction::In,
            (REQUEST_TYPE_WRITE, REQUEST_IO) => Direction::Out,
            _ => {
                return Err(state.violation(format!(
                    "unexpected control-out {request_type:#04x}/{request}"
                )));
            }
        };
        let Some(cmd) = SectorCommand::from_bytes(data) else {
            return Err(state.violation(format!("{}-byte command frame", data.len())));
        };
        if let Some((_, stale)) = state.pending {
            state
                .stats
                .violations
                .push(format!("command {stale:?} was never followed by a transfer"));
        }
        if cmd.count == 0 || cmd.count > MAX_SECTORS_PER_TRANSFER {
            return Err(state.violation(format!("chunk of {} sectors", cmd.count)));
        }
        if cmd.lba as u64 + cmd.count as u64 > state.total_sectors() {
            return Err(state.violation(format!("command {cmd:?} past the end of the medium")));
        }

        state.stats.commands += 1;
        state.stats.max_chunk_sectors = state.stats.max_chunk_sectors.max(cmd.count);
        state.pending = Some((direction, cmd));
        Ok(data.len())
    }

    fn bulk_read(&mut self, endpoint: u8, length: usize) -> Result<Vec<u8>, TransportError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(TransportError::transfer("device released"));
        }
        if endpoint != ENDPOINT_BULK_IN {
            return Err(state.violation(format!("bulk read from endpoint {endpoint:#04x}")));
        }

        let cmd = state.take_pending(Direction::In, length)?;
        state.stats.bulk_reads += 1;
        let start = cmd.lba as usize * SECTOR_SIZE;
        Ok(state.sectors[start..start + length].to_vec())
    }

    fn bulk_write(&mut self, endpoint: u8, data: &[u8]) -> Result<usize, TransportError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(TransportError::transfer("device released"));
        }
        if endpoint != ENDPOINT_BULK_OUT {
            return Err(state.violation(format!("bulk write to endpoint {endpoint:#04x}")));
        }

        let cmd = state.take_pending(Direction::Out, data.len())?;
        state.stats.bulk_writes += 1;
        let start = cmd.lba as usize * SECTOR_SIZE;
        state.sectors[start..start + data.len()].copy_from_slice(data);

        let rate = state.short_write_rate;
        if rate > 0.0 && state.rng.random_bool(rate) {
            state.stats.short_writes += 1;
            return Ok(data.len() - 1);
        }
        Ok(data.len())
    }

    fn close(&mut self) {
        self.state.lock().closed = true;
    }
}
