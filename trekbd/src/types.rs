//! Core types for trekbd.

use crate::error::DeviceError;

/// Sector size in bytes. Both the Trek stick and file images use 512.
pub const SECTOR_SIZE: usize = 512;

const _: () = {
    assert!(SECTOR_SIZE.is_power_of_two());
};

/// A run of consecutive sectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorRange {
    pub lba: u64,
    pub count: u64,
}

impl SectorRange {
    #[inline]
    pub fn new(lba: u64, count: u64) -> Self {
        Self { lba, count }
    }

    /// Minimal sector range covering `length` bytes at byte `offset`.
    ///
    /// `length` must be non-zero.
    pub fn covering(offset: u64, length: u64, sector_size: usize) -> Self {
        debug_assert!(length > 0);
        let ss = sector_size as u64;
        let first = offset / ss;
        let last = (offset + length - 1) / ss;
        Self {
            lba: first,
            count: last - first + 1,
        }
    }

    /// One past the last sector, or `None` on overflow.
    #[inline]
    pub fn end(self) -> Option<u64> {
        self.lba.checked_add(self.count)
    }

    /// Byte offset of the first sector.
    #[inline]
    pub fn byte_offset(self, sector_size: usize) -> u64 {
        self.lba * sector_size as u64
    }

    /// Number of bytes the range spans.
    #[inline]
    pub fn byte_len(self, sector_size: usize) -> usize {
        self.count as usize * sector_size
    }

    /// Reject ranges that reach past `total_sectors`.
    pub fn check(self, total_sectors: u64) -> Result<(), DeviceError> {
        match self.end() {
            Some(end) if end <= total_sectors => Ok(()),
            _ => Err(DeviceError::OutOfRange {
                lba: self.lba,
                count: self.count,
                total_sectors,
            }),
        }
    }
}

impl std::fmt::Display for SectorRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "lba={} count={}", self.lba, self.count)
    }
}

/// Whether a byte span starts and ends on sector boundaries.
#[inline]
pub fn is_sector_aligned(offset: u64, length: u64, sector_size: usize) -> bool {
    let ss = sector_size as u64;
    offset % ss == 0 && length % ss == 0
}
