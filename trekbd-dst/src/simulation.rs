//! Simulation runners and utilities.
//!
//! Every random choice flows from one seed, printed at the start of each run.
//! Set `DST_SEED` to replay a failing run.

use crate::harness::{NbdHarness, SimBackend, SimulationError};

/// Build a single-threaded tokio runtime for simulation.
///
/// Matches the daemon's own runtime: one thread, so the listen task and the
/// client interleave only at await points.
pub fn build_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build runtime")
}

/// Run an NBD simulation with the given seed, backend and number of
/// operations.
pub async fn run_nbd_simulation(
    seed: u64,
    size_bytes: u64,
    backend: SimBackend,
    operations: u64,
) -> Result<(), SimulationError> {
    eprintln!(
        "NBD simulation: seed={}, size={}, backend={:?}, ops={}",
        seed, size_bytes, backend, operations
    );

    let mut harness = NbdHarness::new(seed, size_bytes, backend);
    harness
        .init()
        .await
        .map_err(|e| SimulationError::Unexpected(e.to_string()))?;
    harness.run(operations).await?;
    harness.finish().await?;

    let stats = harness.stats();
    eprintln!("NBD simulation complete: {:?}", stats);
    Ok(())
}

/// Get the seed from environment or generate a random one.
pub fn get_seed() -> u64 {
    std::env::var("DST_SEED")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(rand::random)
}
