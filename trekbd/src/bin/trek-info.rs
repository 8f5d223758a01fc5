//! trek-info - print what a Trek ThumbDrive reports about itself.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use trekbd::device::trek::{DEFAULT_TIMEOUT_MS, PRODUCT_ID, VENDOR_ID};
use trekbd::{BlockDevice, TrekDevice};

#[derive(Parser)]
#[command(name = "trek-info", about = "Query a Trek ThumbDrive and dump its first sectors")]
struct Cli {
    /// USB vendor id.
    #[arg(long, default_value_t = VENDOR_ID, value_parser = parse_u16)]
    vendor_id: u16,

    /// USB product id.
    #[arg(long, default_value_t = PRODUCT_ID, value_parser = parse_u16)]
    product_id: u16,

    /// Number of sectors to dump from lba 0.
    #[arg(long, default_value_t = 4)]
    sectors: u64,

    /// Per-transfer timeout in milliseconds.
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_MS)]
    timeout_ms: u64,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "warn")]
    log_level: Level,
}

/// Accept `0x0a16` as well as `2582`.
fn parse_u16(s: &str) -> Result<u16, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| e.to_string())
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(cli.log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start runtime")?;
    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    let mut dev = TrekDevice::open_usb(
        cli.vendor_id,
        cli.product_id,
        Duration::from_millis(cli.timeout_ms),
    )
    .with_context(|| {
        format!(
            "Failed to open {:04x}:{:04x}",
            cli.vendor_id, cli.product_id
        )
    })?;

    let info = dev.info().clone();
    println!("=== Device info ===");
    println!("{info}");
    println!();
    println!("=== Raw response ({} bytes) ===", info.raw().len());
    println!("{}", hex(info.raw()));
    println!();
    println!("Capacity : {} bytes", dev.capacity());
    println!("Sectors  : {}", dev.total_sectors());
    println!("Sector sz: {}", dev.sector_size());

    let count = cli.sectors.min(dev.total_sectors());
    if count > 0 {
        println!();
        println!("=== Sectors 0-{} ===", count - 1);
        let data = dev
            .read_blocks(0, count)
            .await
            .context("Failed to read sectors")?;
        for (i, sector) in data.chunks(dev.sector_size()).enumerate() {
            println!("  sector {i}: {} ... ({} bytes)", hex(&sector[..32]), sector.len());
        }
    }

    dev.close().await?;
    Ok(())
}
