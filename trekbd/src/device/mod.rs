//! Sector-addressed block devices.
//!
//! [`BlockDevice`] is the seam between the NBD server and storage. Two
//! backends implement it:
//!
//! - [`FileBlockDevice`] - a raw disk image on the local filesystem
//! - [`TrekDevice`] - a Trek ThumbDrive spoken to over a [`UsbTransport`]
//!
//! Byte-addressed access with read-modify-write for partial sectors is
//! provided on top of the sector operations for every backend.

mod file;
pub mod trek;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};

pub use file::FileBlockDevice;
pub use trek::{DeviceInfo, TrekDevice, UsbTransport};

use crate::error::DeviceError;
use crate::types::{SectorRange, is_sector_aligned};

/// Result of a block device operation.
pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// Uniform sector interface over a storage medium.
///
/// Methods take `&mut self`: a device has exactly one user at a time, so no
/// internal locking is needed.
#[async_trait]
pub trait BlockDevice: Send {
    /// Size of one sector in bytes.
    fn sector_size(&self) -> usize;

    /// Number of addressable sectors.
    fn total_sectors(&self) -> u64;

    /// Device size in bytes, always derived from the sector count.
    fn capacity(&self) -> u64 {
        self.total_sectors() * self.sector_size() as u64
    }

    /// Read `count` sectors starting at `lba`.
    ///
    /// Returns exactly `count * sector_size` bytes.
    async fn read_blocks(&mut self, lba: u64, count: u64) -> DeviceResult<Bytes>;

    /// Write `count` sectors starting at `lba`.
    ///
    /// `data` must be exactly `count * sector_size` bytes long.
    async fn write_blocks(&mut self, lba: u64, count: u64, data: &[u8]) -> DeviceResult<()>;

    /// Push buffered writes to stable storage.
    async fn flush(&mut self) -> DeviceResult<()>;

    /// Release the underlying handle. Calling it again is a no-op.
    async fn close(&mut self) -> DeviceResult<()>;

    /// Read `length` bytes starting at byte `offset`.
    async fn read(&mut self, offset: u64, length: usize) -> DeviceResult<Bytes> {
        self.check_bytes(offset, length as u64)?;
        if length == 0 {
            return Ok(Bytes::new());
        }

        let ss = self.sector_size();
        let range = SectorRange::covering(offset, length as u64, ss);
        let raw = self.read_blocks(range.lba, range.count).await?;

        let start = (offset - range.byte_offset(ss)) as usize;
        Ok(raw.slice(start..start + length))
    }

    /// Write `data` at byte `offset`.
    ///
    /// Sector-aligned spans go straight to [`write_blocks`](Self::write_blocks);
    /// anything else reads the covering sectors, patches them in memory and
    /// writes them back.
    async fn write(&mut self, offset: u64, data: &[u8]) -> DeviceResult<()> {
        let length = data.len();
        self.check_bytes(offset, length as u64)?;
        if length == 0 {
            return Ok(());
        }

        let ss = self.sector_size();
        let range = SectorRange::covering(offset, length as u64, ss);

        if is_sector_aligned(offset, length as u64, ss) {
            return self.write_blocks(range.lba, range.count, data).await;
        }

        let start = (offset - range.byte_offset(ss)) as usize;
        let mut buf = BytesMut::from(&self.read_blocks(range.lba, range.count).await?[..]);
        buf[start..start + length].copy_from_slice(data);
        self.write_blocks(range.lba, range.count, &buf).await
    }

    /// Reject byte spans that reach past the end of the device.
    fn check_bytes(&self, offset: u64, length: u64) -> DeviceResult<()> {
        let capacity = self.capacity();
        match offset.checked_add(length) {
            Some(end) if end <= capacity => Ok(()),
            _ => Err(DeviceError::ByteRangeOutOfBounds {
                offset,
                length,
                capacity,
            }),
        }
    }
}

/// Validate a sector write before any I/O: bounds first, then payload size.
pub(crate) fn check_write(
    range: SectorRange,
    total_sectors: u64,
    sector_size: usize,
    data: &[u8],
) -> DeviceResult<()> {
    range.check(total_sectors)?;
    let expected_bytes = range.byte_len(sector_size);
    if data.len() != expected_bytes {
        return Err(DeviceError::LengthMismatch {
            expected_bytes,
            actual_bytes: data.len(),
        });
    }
    Ok(())
}
