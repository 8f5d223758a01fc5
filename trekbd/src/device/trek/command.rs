//! Per-transaction command frame and chunk planning.

use crate::error::DeviceError;
use crate::types::SectorRange;

/// Largest sector count the stick accepts in one command/transfer pair.
pub const MAX_SECTORS_PER_TRANSFER: u32 = 64;

/// The 8-byte frame sent over the control pipe before every bulk transfer:
/// `[lba: u32 LE][count: u32 LE]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorCommand {
    pub lba: u32,
    pub count: u32,
}

impl SectorCommand {
    pub const SIZE_BYTES: usize = 8;

    pub fn to_bytes(self) -> [u8; Self::SIZE_BYTES] {
        let mut buf = [0u8; Self::SIZE_BYTES];
        buf[0..4].copy_from_slice(&self.lba.to_le_bytes());
        buf[4..8].copy_from_slice(&self.count.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE_BYTES {
            return None;
        }
        Some(Self {
            lba: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            count: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
        })
    }
}

/// Split `range` into ascending, non-overlapping commands of at most
/// `limit` sectors each.
///
/// Fails if any sector address does not fit the frame's 32-bit lba field.
pub fn plan_chunks(range: SectorRange, limit: u32) -> Result<Vec<SectorCommand>, DeviceError> {
    debug_assert!(limit > 0);
    let out_of_range = || DeviceError::OutOfRange {
        lba: range.lba,
        count: range.count,
        total_sectors: u32::MAX as u64 + 1,
    };

    let end = range.end().ok_or_else(out_of_range)?;
    if end > u32::MAX as u64 + 1 {
        return Err(out_of_range());
    }

    let mut chunks = Vec::with_capacity(range.count.div_ceil(limit as u64) as usize);
    let mut lba = range.lba;
    while lba < end {
        let count = (end - lba).min(limit as u64);
        chunks.push(SectorCommand {
            lba: lba as u32,
            count: count as u32,
        });
        lba += count;
    }
    Ok(chunks)
}
