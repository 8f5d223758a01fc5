//! Block device backed by a raw disk image.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info};

use super::{BlockDevice, DeviceResult, check_write};
use crate::error::DeviceError;
use crate::types::{SECTOR_SIZE, SectorRange};

/// A disk image file exported sector by sector.
///
/// The image length is truncated down to whole sectors; a trailing partial
/// sector is never exported. Every write is synced before it is acknowledged.
pub struct FileBlockDevice {
    file: Option<File>,
    path: PathBuf,
    total_sectors: u64,
}

impl FileBlockDevice {
    /// Open an existing image for reading and writing.
    pub async fn open(path: impl AsRef<Path>) -> DeviceResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path).await?;
        let len = file.metadata().await?.len();
        let total_sectors = len / SECTOR_SIZE as u64;

        info!(
            path = %path.display(),
            size_bytes = len,
            sectors = total_sectors,
            "opened file image"
        );

        Ok(Self {
            file: Some(file),
            path,
            total_sectors,
        })
    }

    /// Create a zero-filled image of `size_bytes` and open it.
    ///
    /// Fails if the file already exists.
    pub async fn create(path: impl AsRef<Path>, size_bytes: u64) -> DeviceResult<Self> {
        if size_bytes == 0 {
            return Err(DeviceError::InvalidDeviceSize {
                reason: "size must be > 0",
            });
        }
        if !size_bytes.is_multiple_of(SECTOR_SIZE as u64) {
            return Err(DeviceError::InvalidDeviceSize {
                reason: "size must be sector-aligned",
            });
        }

        let path = path.as_ref();
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await?;
        file.set_len(size_bytes).await?;
        file.sync_all().await?;
        drop(file);

        info!(path = %path.display(), size_bytes, "created file image");
        Self::open(path).await
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file(&mut self) -> DeviceResult<&mut File> {
        self.file.as_mut().ok_or(DeviceError::Closed)
    }
}

#[async_trait]
impl BlockDevice for FileBlockDevice {
    fn sector_size(&self) -> usize {
        SECTOR_SIZE
    }

    fn total_sectors(&self) -> u64 {
        self.total_sectors
    }

    async fn read_blocks(&mut self, lba: u64, count: u64) -> DeviceResult<Bytes> {
        let range = SectorRange::new(lba, count);
        range.check(self.total_sectors)?;

        let file = self.file()?;
        let mut buf = BytesMut::zeroed(range.byte_len(SECTOR_SIZE));
        file.seek(SeekFrom::Start(range.byte_offset(SECTOR_SIZE)))
            .await?;
        file.read_exact(&mut buf).await?;
        Ok(buf.freeze())
    }

    async fn write_blocks(&mut self, lba: u64, count: u64, data: &[u8]) -> DeviceResult<()> {
        let range = SectorRange::new(lba, count);
        check_write(range, self.total_sectors, SECTOR_SIZE, data)?;

        let file = self.file()?;
        file.seek(SeekFrom::Start(range.byte_offset(SECTOR_SIZE)))
            .await?;
        file.write_all(data).await?;
        file.flush().await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn flush(&mut self) -> DeviceResult<()> {
        let file = self.file()?;
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }

    async fn close(&mut self) -> DeviceResult<()> {
        let Some(mut file) = self.file.take() else {
            return Ok(());
        };
        file.flush().await?;
        file.sync_all().await?;
        debug!(path = %self.path.display(), "file image closed");
        Ok(())
    }
}
