//! trekbd: NBD export server for the Trek ThumbDrive and raw disk images.
//!
//! The Trek ThumbDrive predates the USB mass-storage class and needs a
//! userspace driver. trekbd wraps that driver (or a plain image file) in a
//! sector-addressed [`BlockDevice`] and exports it over NBD, so that any
//! standard client can attach it.
//!
//! # Library Usage
//!
//! The primary API for running trekbd is the [`Daemon`] struct:
//!
//! ```ignore
//! use trekbd::{Config, Daemon};
//!
//! let mut daemon = Daemon::from_config(config).await?;
//! let listener = tokio::net::TcpListener::bind(daemon.nbd_address()).await?;
//! daemon.listen(listener).await?;
//! ```

pub mod config;
pub mod daemon;
pub mod device;
pub mod error;
pub mod nbd;
pub mod types;

pub use crate::nbd::{Listener, NbdExport, NbdServer, StreamListener};
pub use config::{Backend, Config, DeviceConfig, NbdConfig};
pub use daemon::Daemon;
pub use device::{BlockDevice, DeviceInfo, FileBlockDevice, TrekDevice, UsbTransport};
pub use error::{ConfigError, DeviceError, Error, NbdError, Result, TransportError};
pub use types::{SECTOR_SIZE, SectorRange};
