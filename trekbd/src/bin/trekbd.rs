//! trekbd daemon - export a Trek ThumbDrive or a disk image over NBD.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{Level, error, info};
use tracing_subscriber::FmtSubscriber;

use trekbd::{Backend, Config, Daemon};

#[derive(Parser)]
#[command(
    name = "trekbd",
    about = "NBD server for the Trek ThumbDrive and raw disk images"
)]
struct Cli {
    /// Path to config file. Flags below override its values.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Export the Trek ThumbDrive attached over USB.
    #[arg(long, conflicts_with = "file")]
    trek: bool,

    /// Export a raw disk image.
    #[arg(long, value_name = "PATH")]
    file: Option<PathBuf>,

    /// Create the image with this many bytes if it does not exist.
    #[arg(long, value_name = "BYTES", requires = "file")]
    create_size: Option<u64>,

    /// TCP port to listen on [default: 10809].
    #[arg(long)]
    port: Option<u16>,

    /// Address to bind [default: 0.0.0.0].
    #[arg(long)]
    bind: Option<String>,

    /// Refuse writes from clients.
    #[arg(long)]
    ro: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: Level,
}

impl Cli {
    fn into_config(self) -> Result<Config> {
        if self.config.is_none() && !self.trek && self.file.is_none() {
            anyhow::bail!("one of --trek, --file or --config is required");
        }

        let mut config = match self.config {
            Some(ref path) => Config::load(path)
                .with_context(|| format!("Failed to load config: {}", path.display()))?,
            None => Config::default(),
        };

        // CLI overrides
        if self.trek {
            config.device.backend = Backend::Trek;
        }
        if let Some(path) = self.file {
            config.device.backend = Backend::File;
            config.device.path = Some(path);
        }
        if self.create_size.is_some() {
            config.device.create_size_bytes = self.create_size;
        }
        if self.ro {
            config.nbd.read_only = true;
        }
        if self.bind.is_some() || self.port.is_some() {
            let (host, port) = split_address(&config.nbd.address);
            let host = self.bind.unwrap_or(host);
            let port = self.port.unwrap_or(port);
            config.nbd.address = format!("{host}:{port}");
        }

        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

/// Split `host:port`, falling back to the defaults for anything unparsable.
fn split_address(address: &str) -> (String, u16) {
    address
        .rsplit_once(':')
        .and_then(|(host, port)| Some((host.to_string(), port.parse().ok()?)))
        .unwrap_or_else(|| ("0.0.0.0".to_string(), 10809))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(cli.log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = cli.into_config()?;

    // One thread: sessions and device I/O never overlap.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start runtime")?;
    runtime.block_on(run(config))
}

async fn run(config: Config) -> Result<()> {
    let mut daemon = Daemon::from_config(config)
        .await
        .context("Failed to open device")?;

    let nbd_addr = daemon.nbd_address().to_string();
    let listener = TcpListener::bind(&nbd_addr)
        .await
        .with_context(|| format!("Failed to bind: {nbd_addr}"))?;

    info!(
        nbd = %nbd_addr,
        backend = ?daemon.config().device.backend,
        size_bytes = daemon.size_bytes(),
        read_only = daemon.config().nbd.read_only,
        "trekbd started"
    );

    tokio::select! {
        result = daemon.listen(listener) => {
            if let Err(e) = result {
                error!(error = %e, "NBD server error");
            }
        }
        result = shutdown_signal() => {
            if let Err(e) = result {
                error!(error = %e, "signal handling failed");
            }
        }
    }

    daemon.shutdown().await.context("Failed to close device")?;
    info!("trekbd stopped");
    Ok(())
}

async fn shutdown_signal() -> Result<()> {
    let ctrl_c = signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("Failed to register SIGTERM handler")?;
        tokio::select! {
            result = ctrl_c => {
                result.context("Failed to wait for Ctrl+C")?;
                info!("Received SIGINT");
            }
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.context("Failed to wait for Ctrl+C")?;
        info!("Received SIGINT");
    }
    Ok(())
}
