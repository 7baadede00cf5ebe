//! Simulated camera: streams one encoded image as frames to an argus port

use std::io::Cursor;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use argus::ingest::protocol::write_frame;
use clap::Parser;
use color_eyre::{eyre::WrapErr, Result};
use image::{ImageFormat, RgbImage};
use tokio::net::TcpStream;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "camera-sim", about = "Send frames to an argus ingestion port")]
struct Args {
    /// Address of the argus worker
    #[arg(long, default_value = "127.0.0.1:5000")]
    addr: SocketAddr,

    /// Camera device id written into every header
    #[arg(long, default_value_t = 0)]
    device_id: u32,

    /// Encoded image to send; a generated JPEG test pattern when omitted
    #[arg(long)]
    image: Option<PathBuf>,

    #[arg(long, default_value_t = 10)]
    fps: u32,

    /// Frames to send, 0 for unlimited
    #[arg(long, default_value_t = 0)]
    count: u64,

    #[arg(long, default_value_t = 640)]
    width: u32,

    #[arg(long, default_value_t = 480)]
    height: u32,
}

fn test_pattern(width: u32, height: u32) -> Result<Vec<u8>> {
    let image = RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([
            (x * 255 / width.max(1)) as u8,
            (y * 255 / height.max(1)) as u8,
            128,
        ])
    });
    let mut out = Cursor::new(Vec::new());
    image.write_to(&mut out, ImageFormat::Jpeg)?;
    Ok(out.into_inner())
}

/// Retry until the worker's listener is up
async fn connect(addr: SocketAddr) -> TcpStream {
    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => return stream,
            Err(e) => {
                warn!("Connect to {} failed: {}, retrying", addr, e);
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("camera_sim=info")),
        )
        .init();

    let args = Args::parse();

    let payload = match &args.image {
        Some(path) => std::fs::read(path).wrap_err_with(|| format!("reading {}", path.display()))?,
        None => test_pattern(args.width, args.height)?,
    };
    info!("Sending {} byte frames to {} as device {}", payload.len(), args.addr, args.device_id);

    let mut stream = connect(args.addr).await;
    stream.set_nodelay(true)?;

    let start = Instant::now();
    let mut ticker = tokio::time::interval(Duration::from_secs(1) / args.fps.max(1));
    let mut sent = 0u64;

    while args.count == 0 || sent < args.count {
        ticker.tick().await;
        let timestamp = start.elapsed().as_secs_f64();
        write_frame(&mut stream, timestamp, args.device_id, &payload).await?;
        sent += 1;
        if sent % 100 == 0 {
            info!("Sent {} frames", sent);
        }
    }

    info!("Done after {} frames", sent);
    Ok(())
}
