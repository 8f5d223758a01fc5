//! Geometry descriptor returned by the stick's init request.

use std::fmt;

use bytes::Bytes;

use crate::error::DeviceError;
use crate::types::SECTOR_SIZE;

/// Length of the init (request 16) response.
pub const INFO_RESPONSE_LEN: usize = 31;

// Field offsets within the init response.
const VENDOR_ID_OFFSET: usize = 2;
const PRODUCT_ID_OFFSET: usize = 4;
const SIZE_PARAM1_OFFSET: usize = 0x0B;
const SIZE_PARAM2_OFFSET: usize = 0x0F;

/// Parsed init response.
///
/// Layout of the 31-byte response:
///
/// | offset | size | field                     | encoding      |
/// |--------|------|---------------------------|---------------|
/// | 0x02   | 2    | vendor id                 | big-endian    |
/// | 0x04   | 2    | product id                | big-endian    |
/// | 0x0B   | 4    | size parameter 1          | little-endian |
/// | 0x0F   | 4    | size parameter 2          | little-endian |
///
/// The product of the two size parameters is the number of 512-byte sectors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    raw: Bytes,
    pub vendor_id: u16,
    pub product_id: u16,
    pub size_param1: u32,
    pub size_param2: u32,
}

impl DeviceInfo {
    /// Decode an init response. Bytes past the fixed length are ignored.
    pub fn decode(data: &[u8]) -> Result<Self, DeviceError> {
        if data.len() < INFO_RESPONSE_LEN {
            return Err(DeviceError::Protocol {
                reason: format!(
                    "info response too short: {} bytes (expected {})",
                    data.len(),
                    INFO_RESPONSE_LEN
                ),
            });
        }

        let be_u16 = |at: usize| u16::from_be_bytes([data[at], data[at + 1]]);
        let le_u32 =
            |at: usize| u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);

        Ok(Self {
            raw: Bytes::copy_from_slice(&data[..INFO_RESPONSE_LEN]),
            vendor_id: be_u16(VENDOR_ID_OFFSET),
            product_id: be_u16(PRODUCT_ID_OFFSET),
            size_param1: le_u32(SIZE_PARAM1_OFFSET),
            size_param2: le_u32(SIZE_PARAM2_OFFSET),
        })
    }

    /// The response exactly as the device sent it.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn total_sectors(&self) -> u64 {
        self.size_param1 as u64 * self.size_param2 as u64
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_sectors() * SECTOR_SIZE as u64
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "VID={:#06x} PID={:#06x} capacity={} bytes ({} MiB, {} sectors)",
            self.vendor_id,
            self.product_id,
            self.total_bytes(),
            self.total_bytes() / (1024 * 1024),
            self.total_sectors()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Response captured from a 32 MiB stick.
    fn captured_response() -> [u8; INFO_RESPONSE_LEN] {
        let mut raw = [0u8; INFO_RESPONSE_LEN];
        raw[2..4].copy_from_slice(&0x0a16u16.to_be_bytes());
        raw[4..6].copy_from_slice(&0x1111u16.to_be_bytes());
        raw[0x0B..0x0F].copy_from_slice(&0x0800u32.to_le_bytes());
        raw[0x0F..0x13].copy_from_slice(&0x20u32.to_le_bytes());
        raw
    }

    #[test]
    fn decodes_fixed_offsets() {
        let info = DeviceInfo::decode(&captured_response()).unwrap();
        assert_eq!(info.vendor_id, 0x0a16);
        assert_eq!(info.product_id, 0x1111);
        assert_eq!(info.size_param1, 2048);
        assert_eq!(info.size_param2, 32);
        assert_eq!(info.total_sectors(), 65536);
        assert_eq!(info.total_bytes(), 32 * 1024 * 1024);
        assert_eq!(info.raw(), &captured_response()[..]);
    }

    #[test]
    fn size_parameters_are_little_endian() {
        let mut raw = captured_response();
        raw[0x0B..0x0F].copy_from_slice(&[0x01, 0x02, 0x00, 0x00]);
        raw[0x0F..0x13].copy_from_slice(&[0x03, 0x00, 0x00, 0x00]);
        let info = DeviceInfo::decode(&raw).unwrap();
        assert_eq!(info.size_param1, 0x0201);
        assert_eq!(info.total_sectors(), 0x0201 * 3);
    }

    #[test]
    fn sector_count_does_not_overflow() {
        let mut raw = captured_response();
        raw[0x0B..0x0F].copy_from_slice(&u32::MAX.to_le_bytes());
        raw[0x0F..0x13].copy_from_slice(&u32::MAX.to_le_bytes());
        let info = DeviceInfo::decode(&raw).unwrap();
        assert_eq!(info.total_sectors(), u32::MAX as u64 * u32::MAX as u64);
    }

    #[test]
    fn short_response_is_a_protocol_error() {
        let raw = captured_response();
        let result = DeviceInfo::decode(&raw[..30]);
        assert!(matches!(result, Err(DeviceError::Protocol { .. })));
    }

    #[test]
    fn display_reports_capacity() {
        let info = DeviceInfo::decode(&captured_response()).unwrap();
        let text = info.to_string();
        assert!(text.contains("VID=0x0a16"));
        assert!(text.contains("32 MiB"));
    }
}
