//! NBD (Network Block Device) protocol implementation.
//!
//! This crate provides a pure Rust implementation of the NBD protocol wire
//! types, plus a small client used to exercise NBD servers.
//!
//! Based on https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md

mod client;
mod protocol;

pub use client::NbdClient;
pub use protocol::*;
