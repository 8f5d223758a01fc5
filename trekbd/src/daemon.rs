//! Daemon API for running trekbd.
//!
//! Opens the configured block device once and serves it to one client at a
//! time until shut down.
//!
//! # Example
//!
//! ```ignore
//! use trekbd::daemon::Daemon;
//! use tokio::net::TcpListener;
//!
//! let mut daemon = Daemon::from_config(config).await?;
//! let listener = TcpListener::bind(daemon.nbd_address()).await?;
//! daemon.listen(listener).await?;
//! daemon.shutdown().await?;
//! ```

use std::io;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::config::{Backend, Config, DeviceConfig};
use crate::device::{BlockDevice, FileBlockDevice};
use crate::error::{ConfigError, Error, NbdError};
use crate::nbd::{Listener, NbdServer};

/// A trekbd instance: one device, one export.
pub struct Daemon {
    server: NbdServer,
    config: Config,
}

impl Daemon {
    /// Validate `config` and open the device it names.
    ///
    /// Fails before anything is bound if the device cannot be opened.
    pub async fn from_config(config: Config) -> Result<Self, Error> {
        config.validate()?;
        let device = open_device(&config.device).await?;
        Ok(Self::new(device, config))
    }

    /// Wrap an already opened device.
    pub fn new(device: Box<dyn BlockDevice>, config: Config) -> Self {
        let server = NbdServer::new(device, config.nbd.read_only);
        Self { server, config }
    }

    /// Get the daemon configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get the NBD address from config.
    pub fn nbd_address(&self) -> &str {
        &self.config.nbd.address
    }

    /// Get the exported size in bytes.
    pub fn size_bytes(&self) -> u64 {
        self.server.export().size_bytes
    }

    pub fn device(&self) -> &dyn BlockDevice {
        self.server.device()
    }

    /// Accept NBD connections from any listener until it closes.
    ///
    /// Sessions run one after another: the next connection is not accepted
    /// until the current client has gone. A failed session is logged and the
    /// loop moves on.
    pub async fn listen<L>(&mut self, mut listener: L) -> Result<(), NbdError>
    where
        L: Listener,
    {
        let export = self.server.export();
        info!(
            size_bytes = export.size_bytes,
            read_only = export.read_only,
            "NBD server accepting connections"
        );

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                    // Channel closed (StreamListener exhausted) - normal exit
                    return Ok(());
                }
                Err(e) => match accept_backoff(&e) {
                    Some(delay) => {
                        warn!(error = %e, "accept failed, retrying");
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                        continue;
                    }
                    None => return Err(e.into()),
                },
            };

            info!(%peer, "client connected");
            match self.server.serve(stream).await {
                Ok(()) => info!(%peer, "client disconnected"),
                Err(NbdError::Io(e)) => warn!(%peer, error = %e, "client connection lost"),
                Err(e) => error!(%peer, error = %e, "NBD session failed"),
            }
        }
    }

    /// Close the device.
    pub async fn shutdown(mut self) -> Result<(), Error> {
        self.server.close().await?;
        info!("device closed");
        Ok(())
    }
}

// errno values shared by Linux and the BSDs.
const ENFILE: i32 = 23;
const EMFILE: i32 = 24;

/// Pause before the next `accept` after a transient failure, or `None` if
/// the listener itself is broken.
fn accept_backoff(err: &io::Error) -> Option<Duration> {
    match err.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::TimedOut => Some(Duration::ZERO),
        _ => match err.raw_os_error() {
            Some(ENFILE | EMFILE) => Some(Duration::from_millis(100)),
            _ => None,
        },
    }
}

async fn open_device(config: &DeviceConfig) -> Result<Box<dyn BlockDevice>, Error> {
    match config.backend {
        Backend::File => {
            let path = config.path.as_ref().ok_or(ConfigError::InvalidValue {
                field: "device.path",
                reason: "required for the file backend",
            })?;
            let device = match config.create_size_bytes {
                Some(size) if !path.exists() => FileBlockDevice::create(path, size).await?,
                _ => FileBlockDevice::open(path).await?,
            };
            Ok(Box::new(device))
        }
        Backend::Trek => open_trek(config),
    }
}

#[cfg(feature = "usb")]
fn open_trek(config: &DeviceConfig) -> Result<Box<dyn BlockDevice>, Error> {
    use crate::device::TrekDevice;

    let device = TrekDevice::open_usb(config.vendor_id, config.product_id, config.timeout())?;
    Ok(Box::new(device))
}

#[cfg(not(feature = "usb"))]
fn open_trek(_config: &DeviceConfig) -> Result<Box<dyn BlockDevice>, Error> {
    Err(ConfigError::InvalidValue {
        field: "device.backend",
        reason: "the trek backend needs trekbd built with the `usb` feature",
    }
    .into())
}
