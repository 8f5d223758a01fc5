//! Deterministic Simulation Testing (DST) for trekbd.
//!
//! This crate provides testing utilities that are intentionally separate from
//! the main trekbd crate to ensure simulated devices are never compiled into
//! production binaries.
//!
//! ## Crate Structure
//!
//! - `harness` - Simulation harnesses, oracles and the simulated Trek stick
//! - `simulation` - Runtime and simulation runners
//!
//! ## Running DST Tests
//!
//! ```bash
//! # PR-level quick tests
//! cargo test -p trekbd-dst simulation
//!
//! # Nightly long-running tests
//! cargo test -p trekbd-dst simulation -- --ignored
//!
//! # Reproduce a failure
//! DST_SEED=1234 cargo test -p trekbd-dst simulation
//! ```

pub mod harness;
pub mod simulation;

// Re-export NBD client from nbd crate
pub use nbd::{NbdClient, NbdError};

pub use harness::{
    NbdAction, NbdHarness, NbdOracle, NbdStats, SimBackend, SimulatedStick, SimulationError,
    StickStats,
};
pub use simulation::{build_runtime, get_seed, run_nbd_simulation};
