//! Argus multi-camera frame ingestion front-end

use std::path::PathBuf;
use std::sync::Arc;

use argus::{Config, ConfigOverrides, FrameChannel, FrameRecord, ImageDecoder, IngestManager};
use clap::Parser;
use color_eyre::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "argus", about = "Receive camera frames over TCP and decode them")]
struct Args {
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// First camera port; camera N listens on base_port + N
    #[arg(long)]
    base_port: Option<u16>,

    /// Number of camera connections
    #[arg(long)]
    connections: Option<u16>,

    /// Frame queue capacity, 0 for unbounded
    #[arg(long)]
    queue_capacity: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("argus=info")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("Argus Launching...");

    // Load configuration, command line wins over file and environment
    let args = Args::parse();
    let overrides = ConfigOverrides {
        base_port: args.base_port,
        connection_count: args.connections,
        queue_capacity: args.queue_capacity,
    };
    let config = Config::load(args.config.as_deref(), &overrides)?;

    info!(
        "Receiving {} cameras on {}:{}.. (queue capacity {})",
        config.ingest.connection_count,
        config.ingest.host,
        config.ingest.base_port,
        config.channel.capacity
    );

    let channel = FrameChannel::<FrameRecord>::from_config(&config.channel);
    let decoder = Arc::new(ImageDecoder::new(config.decode.format));
    let mut manager = IngestManager::new(config.ingest.clone(), channel.clone(), decoder)?;
    manager.start_workers();

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Interrupt received");
                break;
            }
            frame = channel.get() => {
                // Reconstruction consumes from here; log until it is wired in
                if let Some(frame) = frame {
                    info!(
                        camera = frame.camera_device_id,
                        timestamp = format_args!("{:.3}", frame.timestamp),
                        width = frame.width(),
                        height = frame.height(),
                        latency_us = frame.latency().as_micros() as u64,
                        "Frame received"
                    );
                }
            }
        }
    }

    manager.stop_workers().await;

    let stats = channel.stats();
    info!(
        "Argus shutting down: {} frames queued, {} consumed, {} dropped",
        stats.written, stats.read, stats.dropped
    );
    Ok(())
}
