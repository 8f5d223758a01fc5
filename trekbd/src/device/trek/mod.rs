//! Userspace driver for the Trek ThumbDrive (VID 0x0a16, PID 0x1111).
//!
//! The stick predates the USB mass-storage class and speaks a vendor
//! protocol instead:
//!
//! - init: control-in, request type 0xC2, request 16, 31-byte [`DeviceInfo`]
//! - read: request type 0x42, request 17 carrying a [`SectorCommand`], then
//!   bulk-in on endpoint 0x82
//! - write: request type 0xC2, request 17 carrying a [`SectorCommand`], then
//!   bulk-out on endpoint 0x02
//!
//! Requests larger than [`MAX_SECTORS_PER_TRANSFER`] are issued as several
//! command/transfer pairs in ascending lba order.

mod command;
mod info;
mod transport;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tracing::{debug, info, warn};

pub use command::{MAX_SECTORS_PER_TRANSFER, SectorCommand, plan_chunks};
pub use info::{DeviceInfo, INFO_RESPONSE_LEN};
#[cfg(feature = "usb")]
pub use transport::RusbTransport;
pub use transport::{DEFAULT_TIMEOUT_MS, UsbTransport};

use super::{BlockDevice, DeviceResult, check_write};
use crate::error::DeviceError;
use crate::types::{SECTOR_SIZE, SectorRange};

pub const VENDOR_ID: u16 = 0x0a16;
pub const PRODUCT_ID: u16 = 0x1111;

pub const REQUEST_INIT: u8 = 0x10;
pub const REQUEST_IO: u8 = 0x11;

pub const REQUEST_TYPE_INFO: u8 = 0xC2;
pub const REQUEST_TYPE_READ: u8 = 0x42;
pub const REQUEST_TYPE_WRITE: u8 = 0xC2;

pub const ENDPOINT_BULK_OUT: u8 = 0x02;
pub const ENDPOINT_BULK_IN: u8 = 0x82;

/// A Trek stick opened through some [`UsbTransport`].
pub struct TrekDevice {
    transport: Option<Box<dyn UsbTransport>>,
    info: DeviceInfo,
}

impl TrekDevice {
    /// Query the stick's geometry and take ownership of the transport.
    ///
    /// On any failure the transport is closed before the error is returned.
    pub fn open(mut transport: Box<dyn UsbTransport>) -> DeviceResult<Self> {
        let info = match query_device_info(transport.as_mut()) {
            Ok(info) => info,
            Err(e) => {
                transport.close();
                return Err(e);
            }
        };

        info!(%info, "trek device initialised");
        Ok(Self {
            transport: Some(transport),
            info,
        })
    }

    /// Open the first stick found on the bus.
    #[cfg(feature = "usb")]
    pub fn open_usb(
        vendor_id: u16,
        product_id: u16,
        timeout: std::time::Duration,
    ) -> DeviceResult<Self> {
        let transport = RusbTransport::open(vendor_id, product_id, timeout)?;
        Self::open(Box::new(transport))
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn transport(&mut self) -> DeviceResult<&mut dyn UsbTransport> {
        match self.transport.as_mut() {
            Some(t) => Ok(t.as_mut()),
            None => Err(DeviceError::Closed),
        }
    }
}

fn query_device_info(transport: &mut dyn UsbTransport) -> DeviceResult<DeviceInfo> {
    let raw = transport.control_in(REQUEST_TYPE_INFO, REQUEST_INIT, 0, 0, INFO_RESPONSE_LEN)?;
    DeviceInfo::decode(&raw)
}

#[async_trait]
impl BlockDevice for TrekDevice {
    fn sector_size(&self) -> usize {
        SECTOR_SIZE
    }

    fn total_sectors(&self) -> u64 {
        self.info.total_sectors()
    }

    async fn read_blocks(&mut self, lba: u64, count: u64) -> DeviceResult<Bytes> {
        let range = SectorRange::new(lba, count);
        range.check(self.total_sectors())?;
        let chunks = plan_chunks(range, MAX_SECTORS_PER_TRANSFER)?;

        let transport = self.transport()?;
        let mut out = BytesMut::with_capacity(range.byte_len(SECTOR_SIZE));
        for cmd in chunks {
            let expected = cmd.count as usize * SECTOR_SIZE;
            transport.control_out(REQUEST_TYPE_READ, REQUEST_IO, 0, 0, &cmd.to_bytes())?;
            let mut data = transport.bulk_read(ENDPOINT_BULK_IN, expected)?;

            if data.len() != expected {
                warn!(
                    lba = cmd.lba,
                    count = cmd.count,
                    expected,
                    actual = data.len(),
                    "short read from device"
                );
                // Keep later chunks at their offsets.
                data.resize(expected, 0);
            }
            out.extend_from_slice(&data);
        }

        debug!(%range, "read blocks");
        Ok(out.freeze())
    }

    async fn write_blocks(&mut self, lba: u64, count: u64, data: &[u8]) -> DeviceResult<()> {
        let range = SectorRange::new(lba, count);
        check_write(range, self.total_sectors(), SECTOR_SIZE, data)?;
        let chunks = plan_chunks(range, MAX_SECTORS_PER_TRANSFER)?;

        let transport = self.transport()?;
        let mut remaining = data;
        for cmd in chunks {
            let (chunk, rest) = remaining.split_at(cmd.count as usize * SECTOR_SIZE);
            transport.control_out(REQUEST_TYPE_WRITE, REQUEST_IO, 0, 0, &cmd.to_bytes())?;
            let written = transport.bulk_write(ENDPOINT_BULK_OUT, chunk)?;

            if written != chunk.len() {
                warn!(
                    lba = cmd.lba,
                    count = cmd.count,
                    expected = chunk.len(),
                    actual = written,
                    "short write to device"
                );
            }
            remaining = rest;
        }

        debug!(%range, "wrote blocks");
        Ok(())
    }

    async fn flush(&mut self) -> DeviceResult<()> {
        // Writes are acknowledged by the stick itself; nothing is buffered here.
        self.transport()?;
        Ok(())
    }

    async fn close(&mut self) -> DeviceResult<()> {
        if let Some(mut transport) = self.transport.take() {
            transport.close();
            info!("trek device closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::error::TransportError;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Transfer {
        Control { request_type: u8, request: u8, frame: Vec<u8> },
        BulkIn { endpoint: u8, length: usize },
        BulkOut { endpoint: u8, length: usize },
    }

    #[derive(Default)]
    struct StickState {
        sectors: Vec<u8>,
        info: Vec<u8>,
        pending: Option<SectorCommand>,
        log: Vec<Transfer>,
        closed: usize,
        short_reads: bool,
        fail_init: bool,
        fail_bulk: bool,
    }

    /// In-memory stick that records every transfer it sees.
    #[derive(Clone)]
    struct FakeStick(Arc<Mutex<StickState>>);

    impl FakeStick {
        fn new(size_param1: u32, size_param2: u32) -> Self {
            let mut info = vec![0u8; INFO_RESPONSE_LEN];
            info[2..4].copy_from_slice(&VENDOR_ID.to_be_bytes());
            info[4..6].copy_from_slice(&PRODUCT_ID.to_be_bytes());
            info[0x0B..0x0F].copy_from_slice(&size_param1.to_le_bytes());
            info[0x0F..0x13].copy_from_slice(&size_param2.to_le_bytes());
            let sectors = size_param1 as usize * size_param2 as usize;
            let data = (0..sectors * SECTOR_SIZE).map(|i| (i / SECTOR_SIZE) as u8).collect();
            Self(Arc::new(Mutex::new(StickState {
                sectors: data,
                info,
                ..Default::default()
            })))
        }

        fn open(&self) -> TrekDevice {
            TrekDevice::open(Box::new(self.clone())).unwrap()
        }

        fn take_log(&self) -> Vec<Transfer> {
            std::mem::take(&mut self.0.lock().log)
        }

        fn commands(log: &[Transfer]) -> Vec<SectorCommand> {
            log.iter()
                .filter_map(|t| match t {
                    Transfer::Control { frame, .. } => SectorCommand::from_bytes(frame),
                    _ => None,
                })
                .collect()
        }
    }

    impl UsbTransport for FakeStick {
        fn control_in(
            &mut self,
            _request_type: u8,
            _request: u8,
            _value: u16,
            _index: u16,
            length: usize,
        ) -> Result<Vec<u8>, TransportError> {
            let state = self.0.lock();
            if state.fail_init {
                return Err(TransportError::transfer("pipe stalled"));
            }
            Ok(state.info[..length.min(state.info.len())].to_vec())
        }

        fn control_out(
            &mut self,
            request_type: u8,
            request: u8,
            _value: u16,
            _index: u16,
            data: &[u8],
        ) -> Result<usize, TransportError> {
            let mut state = self.0.lock();
            state.pending = SectorCommand::from_bytes(data);
            state.log.push(Transfer::Control {
                request_type,
                request,
                frame: data.to_vec(),
            });
            Ok(data.len())
        }

        fn bulk_read(&mut self, endpoint: u8, length: usize) -> Result<Vec<u8>, TransportError> {
            let mut state = self.0.lock();
            if state.fail_bulk {
                return Err(TransportError::Timeout);
            }
            state.log.push(Transfer::BulkIn { endpoint, length });
            let cmd = state.pending.take().expect("bulk read without command");
            let start = cmd.lba as usize * SECTOR_SIZE;
            let mut data = state.sectors[start..start + length].to_vec();
            if state.short_reads {
                data.truncate(length - 100);
            }
            Ok(data)
        }

        fn bulk_write(&mut self, endpoint: u8, data: &[u8]) -> Result<usize, TransportError> {
            let mut state = self.0.lock();
            state.log.push(Transfer::BulkOut {
                endpoint,
                length: data.len(),
            });
            let cmd = state.pending.take().expect("bulk write without command");
            let start = cmd.lba as usize * SECTOR_SIZE;
            state.sectors[start..start + data.len()].copy_from_slice(data);
            Ok(data.len())
        }

        fn close(&mut self) {
            self.0.lock().closed += 1;
        }
    }

    #[test]
    fn open_decodes_geometry() {
        let stick = FakeStick::new(16, 8);
        let dev = stick.open();
        assert_eq!(dev.total_sectors(), 128);
        assert_eq!(dev.capacity(), 128 * 512);
        assert_eq!(dev.info().vendor_id, VENDOR_ID);
        assert_eq!(stick.0.lock().closed, 0);
    }

    #[test]
    fn short_geometry_response_releases_transport() {
        let stick = FakeStick::new(16, 8);
        stick.0.lock().info.truncate(20);

        let result = TrekDevice::open(Box::new(stick.clone()));
        assert!(matches!(result, Err(DeviceError::Protocol { .. })));
        assert_eq!(stick.0.lock().closed, 1);
    }

    #[test]
    fn geometry_transport_fault_releases_transport() {
        let stick = FakeStick::new(16, 8);
        stick.0.lock().fail_init = true;

        let result = TrekDevice::open(Box::new(stick.clone()));
        assert!(matches!(
            result,
            Err(DeviceError::Transport(TransportError::Transfer { .. }))
        ));
        assert_eq!(stick.0.lock().closed, 1);
        assert!(stick.take_log().is_empty());
    }

    #[tokio::test]
    async fn single_chunk_read_framing() {
        let stick = FakeStick::new(16, 8);
        let mut dev = stick.open();

        let data = dev.read_blocks(3, 2).await.unwrap();
        assert_eq!(data.len(), 1024);
        assert!(data[..512].iter().all(|&b| b == 3));
        assert!(data[512..].iter().all(|&b| b == 4));

        assert_eq!(
            stick.take_log(),
            vec![
                Transfer::Control {
                    request_type: REQUEST_TYPE_READ,
                    request: REQUEST_IO,
                    frame: vec![3, 0, 0, 0, 2, 0, 0, 0],
                },
                Transfer::BulkIn {
                    endpoint: ENDPOINT_BULK_IN,
                    length: 1024,
                },
            ]
        );
    }

    #[tokio::test]
    async fn large_read_is_chunked_in_ascending_order() {
        let stick = FakeStick::new(64, 4);
        let mut dev = stick.open();

        let data = dev.read_blocks(10, 150).await.unwrap();
        assert_eq!(data.len(), 150 * 512);
        for (i, sector) in data.chunks(512).enumerate() {
            assert!(sector.iter().all(|&b| b == (10 + i) as u8));
        }

        let log = stick.take_log();
        let commands = FakeStick::commands(&log);
        assert_eq!(
            commands,
            vec![
                SectorCommand { lba: 10, count: 64 },
                SectorCommand { lba: 74, count: 64 },
                SectorCommand { lba: 138, count: 22 },
            ]
        );
        // Every command is immediately followed by its bulk transfer.
        for pair in log.chunks(2) {
            assert!(matches!(pair[0], Transfer::Control { .. }));
            assert!(matches!(pair[1], Transfer::BulkIn { .. }));
        }
    }

    #[tokio::test]
    async fn large_write_roundtrip() {
        let stick = FakeStick::new(64, 4);
        let mut dev = stick.open();

        let payload: Vec<u8> = (0..100 * 512).map(|i| (i % 253) as u8).collect();
        dev.write_blocks(20, 100, &payload).await.unwrap();

        let log = stick.take_log();
        assert_eq!(
            FakeStick::commands(&log),
            vec![
                SectorCommand { lba: 20, count: 64 },
                SectorCommand { lba: 84, count: 36 },
            ]
        );
        assert!(log.iter().any(|t| matches!(
            t,
            Transfer::Control {
                request_type: REQUEST_TYPE_WRITE,
                ..
            }
        )));
        assert!(log.iter().any(|t| matches!(
            t,
            Transfer::BulkOut {
                endpoint: ENDPOINT_BULK_OUT,
                length: 32768
            }
        )));

        assert_eq!(&dev.read_blocks(20, 100).await.unwrap()[..], &payload[..]);
    }

    #[tokio::test]
    async fn out_of_range_issues_no_transfers() {
        let stick = FakeStick::new(16, 8);
        let mut dev = stick.open();

        assert!(matches!(
            dev.read_blocks(127, 2).await,
            Err(DeviceError::OutOfRange { .. })
        ));
        assert!(matches!(
            dev.write_blocks(128, 1, &[0; 512]).await,
            Err(DeviceError::OutOfRange { .. })
        ));
        assert!(matches!(
            dev.write_blocks(0, 1, &[0; 100]).await,
            Err(DeviceError::LengthMismatch { .. })
        ));
        assert!(matches!(
            dev.write(128 * 512 - 10, &[0; 11]).await,
            Err(DeviceError::ByteRangeOutOfBounds { .. })
        ));
        assert!(stick.take_log().is_empty());
    }

    #[tokio::test]
    async fn short_transfer_is_soft_failure() {
        let stick = FakeStick::new(64, 4);
        let mut dev = stick.open();
        stick.0.lock().short_reads = true;

        let data = dev.read_blocks(0, 70).await.unwrap();
        assert_eq!(data.len(), 70 * 512);
        // Both chunks were issued despite the first coming back short.
        assert_eq!(FakeStick::commands(&stick.take_log()).len(), 2);
        // The second chunk still lands at its own offset.
        assert!(data[64 * 512..64 * 512 + 100].iter().all(|&b| b == 64));
        assert!(data[64 * 512 - 100..64 * 512].iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn transport_fault_propagates() {
        let stick = FakeStick::new(16, 8);
        let mut dev = stick.open();
        stick.0.lock().fail_bulk = true;

        assert!(matches!(
            dev.read_blocks(0, 1).await,
            Err(DeviceError::Transport(TransportError::Timeout))
        ));
    }

    #[tokio::test]
    async fn unaligned_write_is_read_modify_write() {
        let stick = FakeStick::new(16, 8);
        let mut dev = stick.open();

        dev.write(1020, &[0xEE; 10]).await.unwrap();

        let log = stick.take_log();
        assert_eq!(
            FakeStick::commands(&log),
            vec![
                SectorCommand { lba: 1, count: 2 },
                SectorCommand { lba: 1, count: 2 },
            ]
        );
        let data = dev.read(512, 1024).await.unwrap();
        assert!(data[..508].iter().all(|&b| b == 1));
        assert!(data[508..518].iter().all(|&b| b == 0xEE));
        assert!(data[518..].iter().all(|&b| b == 2));
    }

    #[tokio::test]
    async fn close_releases_transport_once() {
        let stick = FakeStick::new(16, 8);
        let mut dev = stick.open();

        dev.close().await.unwrap();
        dev.close().await.unwrap();
        assert_eq!(stick.0.lock().closed, 1);
        assert!(matches!(
            dev.read_blocks(0, 1).await,
            Err(DeviceError::Closed)
        ));
    }
}
