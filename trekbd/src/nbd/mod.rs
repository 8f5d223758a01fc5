//! NBD (Network Block Device) export server.
//!
//! This module wraps the `nbd` crate's protocol types with a server that
//! exports a single [`BlockDevice`](crate::device::BlockDevice).
//!
//! # Architecture
//!
//! - [`NbdServer`] owns the device and handles one connection at a time
//!   (handshake, negotiation, I/O)
//! - [`Listener`] trait abstracts over connection sources (TCP, channels)
//! - [`StreamListener`] accepts streams from a channel (for tests/simulation)
//!
//! For serving connections in a loop, use `Daemon::listen()` which accepts
//! any `Listener` implementation.

mod listener;
mod server;

pub use listener::{Listener, StreamListener};
// Re-export protocol types from the nbd crate
pub use nbd::{NbdCommand, NbdReply, NbdRequest};
pub use server::{NbdExport, NbdServer};
