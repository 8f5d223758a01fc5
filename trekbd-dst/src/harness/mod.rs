//! Simulation harnesses for trekbd.
//!
//! Harnesses provide the infrastructure for running deterministic simulations:
//! - Oracle implementations for correctness verification
//! - Action generators for random operation sequences
//! - A simulated Trek stick standing in for the USB transport
//! - Statistics tracking

pub mod nbd;
pub mod stick;

pub use self::nbd::{NbdAction, NbdHarness, NbdOracle, NbdStats, SimBackend};
pub use stick::{SimulatedStick, StickStats};

/// Error type for simulation failures.
#[derive(Debug)]
pub enum SimulationError {
    Mismatch { context: String },
    Unexpected(String),
}

impl std::fmt::Display for SimulationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mismatch { context } => write!(f, "oracle mismatch: {}", context),
            Self::Unexpected(msg) => write!(f, "unexpected error: {}", msg),
        }
    }
}

impl std::error::Error for SimulationError {}
