//! Raw USB transfer capability.
//!
//! [`UsbTransport`] knows nothing about the stick's command format; it only
//! moves bytes over the control pipe and the two bulk endpoints. The
//! libusb-backed implementation lives behind the `usb` feature.

use crate::error::TransportError;

/// Default timeout for a single transfer.
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Control and bulk transfers against one opened USB device.
pub trait UsbTransport: Send {
    /// Device-to-host control transfer of up to `length` bytes.
    fn control_in(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        length: usize,
    ) -> Result<Vec<u8>, TransportError>;

    /// Control transfer carrying `data`. Returns the bytes transferred.
    fn control_out(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
    ) -> Result<usize, TransportError>;

    /// Bulk IN transfer of up to `length` bytes from `endpoint`.
    fn bulk_read(&mut self, endpoint: u8, length: usize) -> Result<Vec<u8>, TransportError>;

    /// Bulk OUT transfer of `data` to `endpoint`. Returns the bytes written.
    fn bulk_write(&mut self, endpoint: u8, data: &[u8]) -> Result<usize, TransportError>;

    /// Release the device. Safe to call more than once.
    fn close(&mut self);
}

#[cfg(feature = "usb")]
pub use self::libusb::RusbTransport;

#[cfg(feature = "usb")]
mod libusb {
    use std::time::Duration;

    use rusb::{DeviceHandle, GlobalContext};
    use tracing::{debug, info, warn};

    use super::UsbTransport;
    use crate::error::TransportError;

    const INTERFACE: u8 = 0;
    const DIRECTION_IN: u8 = 0x80;

    impl From<rusb::Error> for TransportError {
        fn from(err: rusb::Error) -> Self {
            match err {
                rusb::Error::Timeout => TransportError::Timeout,
                other => TransportError::transfer(other),
            }
        }
    }

    /// [`UsbTransport`] over libusb.
    pub struct RusbTransport {
        handle: Option<DeviceHandle<GlobalContext>>,
        timeout: Duration,
    }

    impl RusbTransport {
        /// Find the device by VID/PID, activate its first configuration and
        /// claim interface 0.
        pub fn open(
            vendor_id: u16,
            product_id: u16,
            timeout: Duration,
        ) -> Result<Self, TransportError> {
            let mut handle = rusb::open_device_with_vid_pid(vendor_id, product_id).ok_or(
                TransportError::NotFound {
                    vendor_id,
                    product_id,
                },
            )?;

            let config = handle.device().config_descriptor(0)?;
            if let Err(e) = handle.set_auto_detach_kernel_driver(true) {
                debug!(error = %e, "kernel driver auto-detach unavailable");
            }
            handle.set_active_configuration(config.number())?;
            handle.claim_interface(INTERFACE)?;

            info!(
                vendor_id = format_args!("{vendor_id:#06x}"),
                product_id = format_args!("{product_id:#06x}"),
                configuration = config.number(),
                "usb device configured"
            );

            Ok(Self {
                handle: Some(handle),
                timeout,
            })
        }

        fn handle(&self) -> Result<&DeviceHandle<GlobalContext>, TransportError> {
            self.handle.as_ref().ok_or(TransportError::Transfer {
                message: "transport closed".to_string(),
            })
        }
    }

    impl UsbTransport for RusbTransport {
        fn control_in(
            &mut self,
            request_type: u8,
            request: u8,
            value: u16,
            index: u16,
            length: usize,
        ) -> Result<Vec<u8>, TransportError> {
            let mut buf = vec![0u8; length];
            let n = self.handle()?.read_control(
                request_type,
                request,
                value,
                index,
                &mut buf,
                self.timeout,
            )?;
            buf.truncate(n);
            Ok(buf)
        }

        fn control_out(
            &mut self,
            request_type: u8,
            request: u8,
            value: u16,
            index: u16,
            data: &[u8],
        ) -> Result<usize, TransportError> {
            let handle = self.handle()?;
            if request_type & DIRECTION_IN != 0 {
                // The stick's write command uses an IN request type; libusb
                // issues it as a device-to-host transfer of the frame length.
                let mut buf = data.to_vec();
                let n =
                    handle.read_control(request_type, request, value, index, &mut buf, self.timeout)?;
                return Ok(n);
            }
            Ok(handle.write_control(request_type, request, value, index, data, self.timeout)?)
        }

        fn bulk_read(&mut self, endpoint: u8, length: usize) -> Result<Vec<u8>, TransportError> {
            let mut buf = vec![0u8; length];
            let n = self.handle()?.read_bulk(endpoint, &mut buf, self.timeout)?;
            buf.truncate(n);
            Ok(buf)
        }

        fn bulk_write(&mut self, endpoint: u8, data: &[u8]) -> Result<usize, TransportError> {
            Ok(self.handle()?.write_bulk(endpoint, data, self.timeout)?)
        }

        fn close(&mut self) {
            let Some(mut handle) = self.handle.take() else {
                return;
            };
            if let Err(e) = handle.release_interface(INTERFACE) {
                warn!(error = %e, "failed to release usb interface");
            }
            info!("usb transport closed");
        }
    }

    impl Drop for RusbTransport {
        fn drop(&mut self) {
            self.close();
        }
    }
}
