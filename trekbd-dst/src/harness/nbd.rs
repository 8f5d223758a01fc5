//! NBD protocol-level simulation harness.
//!
//! Drives a daemon through `NbdClient` with random unaligned reads and
//! writes and checks every byte against an oracle. The daemon exports
//! either a file image or a [`SimulatedStick`] behind the real Trek driver.

use std::collections::HashMap;
use std::io;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;
use tokio::io::{DuplexStream, duplex};
use tokio::task::JoinHandle;

use nbd::{NBD_EINVAL, NbdClient, NbdError};
use trekbd::config::{Config, DeviceConfig};
use trekbd::daemon::Daemon;
use trekbd::nbd::StreamListener;
use trekbd::{SECTOR_SIZE, TrekDevice};

use super::SimulationError;
use super::stick::SimulatedStick;

/// Largest single read or write issued. Spans several Trek chunks.
const MAX_IO_BYTES: u64 = 96 * 1024;

/// What the daemon exports during a simulation.
#[derive(Debug, Clone, Copy)]
pub enum SimBackend {
    File,
    Trek {
        /// Fraction of bulk writes the stick acknowledges as short.
        short_write_rate: f64,
    },
}

/// Actions that can be performed in NBD simulation.
#[derive(Debug, Clone)]
pub enum NbdAction {
    Read { offset: u64, length: u32 },
    Write { offset: u64, data: Vec<u8> },
    /// Unsupported by the server; must be refused without side effects.
    Trim { offset: u64, length: u32 },
    Flush,
}

/// Byte-level oracle for NBD verification.
pub struct NbdOracle {
    data: HashMap<u64, u8>,
}

impl NbdOracle {
    pub fn new() -> Self {
        Self {
            data: HashMap::new(),
        }
    }

    pub fn read(&self, offset: u64, length: u32) -> Vec<u8> {
        let mut result = vec![0u8; length as usize];
        for (i, byte) in result.iter_mut().enumerate() {
            if let Some(&b) = self.data.get(&(offset + i as u64)) {
                *byte = b;
            }
        }
        result
    }

    pub fn write(&mut self, offset: u64, data: &[u8]) {
        for (i, &byte) in data.iter().enumerate() {
            let pos = offset + i as u64;
            if byte == 0 {
                self.data.remove(&pos);
            } else {
                self.data.insert(pos, byte);
            }
        }
    }
}

impl Default for NbdOracle {
    fn default() -> Self {
        Self::new()
    }
}

/// Simulation statistics.
#[derive(Debug, Default, Clone)]
pub struct NbdStats {
    pub operations: u64,
    pub reads: u64,
    pub writes: u64,
    pub unaligned: u64,
    pub refused_trims: u64,
    pub flushes: u64,
}

/// NBD protocol-level simulation harness.
pub struct NbdHarness {
    rng: SmallRng,
    seed: u64,
    backend: SimBackend,
    client: Option<NbdClient<DuplexStream>>,
    oracle: NbdOracle,
    size_bytes: u64,
    stats: NbdStats,
    stick: Option<SimulatedStick>,
    dir: Option<TempDir>,
    listen_handle: Option<JoinHandle<Daemon>>,
}

impl NbdHarness {
    /// `size_bytes` is rounded down to whole sectors.
    pub fn new(seed: u64, size_bytes: u64, backend: SimBackend) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed),
            seed,
            backend,
            client: None,
            oracle: NbdOracle::new(),
            size_bytes: size_bytes - size_bytes % SECTOR_SIZE as u64,
            stats: NbdStats::default(),
            stick: None,
            dir: None,
            listen_handle: None,
        }
    }

    pub async fn init(&mut self) -> Result<(), trekbd::Error> {
        let daemon = match self.backend {
            SimBackend::File => {
                let dir = tempfile::tempdir()?;
                let config = Config {
                    device: DeviceConfig {
                        path: Some(dir.path().join("disk.img")),
                        create_size_bytes: Some(self.size_bytes),
                        ..Default::default()
                    },
                    ..Default::default()
                };
                self.dir = Some(dir);
                Daemon::from_config(config).await?
            }
            SimBackend::Trek { short_write_rate } => {
                let sectors = (self.size_bytes / SECTOR_SIZE as u64) as u32;
                let stick =
                    SimulatedStick::new(self.seed, sectors, 1).with_short_writes(short_write_rate);
                let device = TrekDevice::open(Box::new(stick.clone()))?;
                self.stick = Some(stick);
                Daemon::new(Box::new(device), Config::default())
            }
        };

        // Create StreamListener for in-memory connection
        let (stream_tx, listener) = StreamListener::new(1);

        // The listen task hands the daemon back once the listener closes.
        let handle = tokio::spawn(async move {
            let mut daemon = daemon;
            if let Err(e) = daemon.listen(listener).await {
                eprintln!("listen failed: {e}");
            }
            daemon
        });
        self.listen_handle = Some(handle);

        // Create in-memory duplex channel
        let (client_stream, server_stream) = duplex(1024 * 1024);

        // Send server stream to listener
        stream_tx
            .send(server_stream)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "listener closed"))?;
        drop(stream_tx);

        // Connect client
        let client = NbdClient::connect(client_stream, "sim").await?;
        self.client = Some(client);
        Ok(())
    }

    fn client(&mut self) -> &mut NbdClient<DuplexStream> {
        self.client.as_mut().expect("not initialized")
    }

    /// Run the simulation for a given number of operations.
    pub async fn run(&mut self, operations: u64) -> Result<(), SimulationError> {
        for _ in 0..operations {
            let action = self.sample_action();
            self.execute(action).await?;
            self.stats.operations += 1;
        }
        Ok(())
    }

    /// Pick an in-bounds span, sector-aligned about a third of the time.
    fn sample_span(&mut self) -> (u64, u32) {
        let max_len = MAX_IO_BYTES.min(self.size_bytes);
        if self.rng.random_ratio(1, 3) {
            let ss = SECTOR_SIZE as u64;
            let sectors = self.rng.random_range(1..=max_len / ss);
            let lba = self.rng.random_range(0..=self.size_bytes / ss - sectors);
            return (lba * ss, (sectors * ss) as u32);
        }
        let length = self.rng.random_range(1..=max_len);
        let offset = self.rng.random_range(0..=self.size_bytes - length);
        (offset, length as u32)
    }

    fn sample_action(&mut self) -> NbdAction {
        let choice = self.rng.random_range(0..100);
        match choice {
            0..45 => {
                let (offset, length) = self.sample_span();
                NbdAction::Read { offset, length }
            }
            45..90 => {
                let (offset, length) = self.sample_span();
                let data: Vec<u8> = (0..length).map(|_| self.rng.random()).collect();
                NbdAction::Write { offset, data }
            }
            90..95 => {
                let (offset, length) = self.sample_span();
                NbdAction::Trim { offset, length }
            }
            _ => NbdAction::Flush,
        }
    }

    /// Execute a single action.
    pub async fn execute(&mut self, action: NbdAction) -> Result<(), SimulationError> {
        match action {
            NbdAction::Read { offset, length } => {
                self.stats.reads += 1;
                self.count_alignment(offset, length as u64);
                let expected = self.oracle.read(offset, length);
                let actual = self
                    .client()
                    .read(offset, length)
                    .await
                    .map_err(|e| SimulationError::Unexpected(e.to_string()))?;

                if actual.as_ref() != expected.as_slice() {
                    return Err(SimulationError::Mismatch {
                        context: format!(
                            "read(offset={}, len={}): first diff at byte {}",
                            offset,
                            length,
                            find_diff(&expected, &actual)
                        ),
                    });
                }
            }
            NbdAction::Write { offset, data } => {
                self.stats.writes += 1;
                self.count_alignment(offset, data.len() as u64);
                self.oracle.write(offset, &data);
                self.client()
                    .write(offset, &data)
                    .await
                    .map_err(|e| SimulationError::Unexpected(e.to_string()))?;
            }
            NbdAction::Trim { offset, length } => {
                self.stats.refused_trims += 1;
                match self.client().trim(offset, length).await {
                    Err(NbdError::ServerError { code: NBD_EINVAL }) => {}
                    other => {
                        return Err(SimulationError::Mismatch {
                            context: format!(
                                "trim(offset={offset}, len={length}) expected EINVAL, got {other:?}"
                            ),
                        });
                    }
                }
            }
            NbdAction::Flush => {
                self.stats.flushes += 1;
                self.client()
                    .flush()
                    .await
                    .map_err(|e| SimulationError::Unexpected(e.to_string()))?;
            }
        }
        Ok(())
    }

    fn count_alignment(&mut self, offset: u64, length: u64) {
        let ss = SECTOR_SIZE as u64;
        if offset % ss != 0 || length % ss != 0 {
            self.stats.unaligned += 1;
        }
    }

    /// Disconnect, shut the daemon down, and compare the whole medium with
    /// the oracle.
    pub async fn finish(&mut self) -> Result<(), SimulationError> {
        if let Some(client) = self.client.take() {
            client
                .disconnect()
                .await
                .map_err(|e| SimulationError::Unexpected(e.to_string()))?;
        }
        let Some(handle) = self.listen_handle.take() else {
            return Ok(());
        };
        let daemon = handle
            .await
            .map_err(|e| SimulationError::Unexpected(e.to_string()))?;
        daemon
            .shutdown()
            .await
            .map_err(|e| SimulationError::Unexpected(e.to_string()))?;

        let medium = match (&self.stick, &self.dir) {
            (Some(stick), _) => {
                let stats = stick.stats();
                if !stats.violations.is_empty() {
                    return Err(SimulationError::Mismatch {
                        context: format!("stick framing violations: {:?}", stats.violations),
                    });
                }
                if !stick.is_closed() {
                    return Err(SimulationError::Mismatch {
                        context: "stick not released at shutdown".to_string(),
                    });
                }
                eprintln!("stick: {stats:?}");
                stick.contents()
            }
            (None, Some(dir)) => std::fs::read(dir.path().join("disk.img"))
                .map_err(|e| SimulationError::Unexpected(e.to_string()))?,
            (None, None) => return Ok(()),
        };

        let expected = self.oracle.read(0, self.size_bytes as u32);
        if medium != expected {
            return Err(SimulationError::Mismatch {
                context: format!(
                    "final medium differs from oracle at byte {}",
                    find_diff(&expected, &medium)
                ),
            });
        }
        Ok(())
    }

    pub fn stats(&self) -> &NbdStats {
        &self.stats
    }
}

fn find_diff(expected: &[u8], actual: &[u8]) -> usize {
    for (i, (e, a)) in expected.iter().zip(actual.iter()).enumerate() {
        if e != a {
            return i;
        }
    }
    expected.len().min(actual.len())
}
