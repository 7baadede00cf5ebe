use std::io::Cursor;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener as StdListener};
use std::sync::Arc;
use std::time::{Duration, Instant};

use argus::ingest::protocol::{write_frame, FrameHeader};
use argus::ingest::{IngestWorker, StopSignal, WorkerSettings};
use argus::{
    ChannelConfig, DecodeError, FrameChannel, FrameDecoder, FrameRecord, ImageDecoder,
    IngestConfig, IngestManager,
};
use image::{DynamicImage, GrayImage, ImageFormat, RgbImage};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

fn settings() -> WorkerSettings {
    WorkerSettings {
        accept_timeout: Duration::from_millis(300),
        read_timeout: Duration::from_millis(300),
        max_payload_bytes: 1 << 20,
    }
}

fn channel() -> FrameChannel<FrameRecord> {
    FrameChannel::from_config(&ChannelConfig {
        capacity: 16,
        op_timeout_ms: 100,
        settle_delay_ms: 20,
    })
}

/// Find `count` consecutive free ports on loopback.
fn free_ports(count: u16) -> u16 {
    for _ in 0..50 {
        let base = StdListener::bind((LOCALHOST, 0))
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        if base.checked_add(count).is_none() {
            continue;
        }
        let all_free = (0..count).all(|i| StdListener::bind((LOCALHOST, base + i)).is_ok());
        if all_free {
            return base;
        }
    }
    panic!("no block of {} free ports", count);
}

async fn connect(port: u16) -> TcpStream {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match TcpStream::connect((LOCALHOST, port)).await {
            Ok(stream) => return stream,
            Err(e) if Instant::now() > deadline => panic!("connect to {} failed: {}", port, e),
            Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    }
}

async fn next_record(channel: &FrameChannel<FrameRecord>) -> FrameRecord {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if let Some(record) = channel.get().await {
            return record;
        }
    }
    panic!("no frame arrived");
}

fn png(width: u32, height: u32) -> Vec<u8> {
    let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, image::Rgb([1, 2, 3])));
    let mut out = Cursor::new(Vec::new());
    image.write_to(&mut out, ImageFormat::Png).unwrap();
    out.into_inner()
}

/// Accepts any payload as a one-row grayscale image
fn raw_row_decoder() -> Arc<dyn FrameDecoder> {
    Arc::new(|payload: &[u8]| -> Result<DynamicImage, DecodeError> {
        GrayImage::from_raw(payload.len() as u32, 1, payload.to_vec())
            .map(DynamicImage::ImageLuma8)
            .ok_or(DecodeError::BufferMismatch {
                width: payload.len() as u32,
                height: 1,
            })
    })
}

fn spawn_worker(
    port: u16,
    channel: &FrameChannel<FrameRecord>,
    decoder: Arc<dyn FrameDecoder>,
) -> (StopSignal, JoinHandle<()>) {
    spawn_worker_with(port, channel, decoder, settings())
}

fn spawn_worker_with(
    port: u16,
    channel: &FrameChannel<FrameRecord>,
    decoder: Arc<dyn FrameDecoder>,
    settings: WorkerSettings,
) -> (StopSignal, JoinHandle<()>) {
    let stop = StopSignal::new();
    let worker = IngestWorker::new(
        SocketAddr::new(LOCALHOST, port),
        settings,
        stop.clone(),
        channel.clone(),
        decoder,
    );
    (stop, tokio::spawn(worker.run()))
}

async fn shutdown(stop: StopSignal, task: JoinHandle<()>) {
    stop.request();
    tokio::time::timeout(Duration::from_secs(3), task)
        .await
        .expect("worker did not stop")
        .unwrap();
}

#[tokio::test]
async fn test_happy_path_decodes_image() {
    let port = free_ports(1);
    let channel = channel();
    let (stop, task) = spawn_worker(port, &channel, Arc::new(ImageDecoder::default()));

    let payload = png(32, 24);
    let mut client = connect(port).await;
    write_frame(&mut client, 1.5, 3, &payload).await.unwrap();

    let record = next_record(&channel).await;
    assert_eq!(record.timestamp, 1.5);
    assert_eq!(record.camera_device_id, 3);
    assert_eq!(record.payload_length as usize, payload.len());
    assert_eq!((record.width(), record.height()), (32, 24));

    shutdown(stop, task).await;
}

#[tokio::test]
async fn test_large_payload_in_small_chunks() {
    let port = free_ports(1);
    let channel = channel();
    let (stop, task) = spawn_worker(port, &channel, raw_row_decoder());

    let payload: Vec<u8> = (0..12345u32).map(|i| (i % 256) as u8).collect();
    let header = FrameHeader {
        timestamp: 1.5,
        camera_device_id: 3,
        payload_length: 12345,
    };
    let mut wire = header.encode().to_vec();
    wire.extend_from_slice(&payload);

    let mut client = connect(port).await;
    client.set_nodelay(true).unwrap();
    for chunk in wire.chunks(997) {
        client.write_all(chunk).await.unwrap();
        client.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let record = next_record(&channel).await;
    assert_eq!(record.timestamp, 1.5);
    assert_eq!(record.camera_device_id, 3);
    assert_eq!(record.payload_length, 12345);
    assert_eq!(record.width(), 12345);
    assert_eq!(record.image.to_luma8().into_raw(), payload);

    shutdown(stop, task).await;
}

#[tokio::test]
async fn test_decode_failure_drops_frame_and_keeps_connection() {
    let port = free_ports(1);
    let channel = channel();
    let (stop, task) = spawn_worker(port, &channel, Arc::new(ImageDecoder::default()));

    let mut client = connect(port).await;
    write_frame(&mut client, 1.0, 0, b"definitely not an image").await.unwrap();
    write_frame(&mut client, 2.0, 0, &png(4, 4)).await.unwrap();

    let record = next_record(&channel).await;
    assert_eq!(record.timestamp, 2.0);
    assert_eq!(channel.stats().written, 1);

    shutdown(stop, task).await;
}

#[tokio::test]
async fn test_frames_keep_order_within_a_camera() {
    let port = free_ports(1);
    let channel = channel();
    let (stop, task) = spawn_worker(port, &channel, raw_row_decoder());

    let mut client = connect(port).await;
    for i in 0..10u32 {
        write_frame(&mut client, f64::from(i), 7, &[i as u8; 8]).await.unwrap();
    }

    for i in 0..10u32 {
        let record = next_record(&channel).await;
        assert_eq!(record.timestamp, f64::from(i));
    }

    shutdown(stop, task).await;
}

#[tokio::test]
async fn test_idle_peer_survives_read_timeouts() {
    let port = free_ports(1);
    let channel = channel();
    let settings = WorkerSettings {
        read_timeout: Duration::from_millis(150),
        ..settings()
    };
    let (stop, task) = spawn_worker_with(port, &channel, raw_row_decoder(), settings);

    let mut client = connect(port).await;
    // Several read timeouts pass with the peer connected but silent
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert!(!task.is_finished());
    assert!(channel.is_empty());

    write_frame(&mut client, 4.0, 2, b"late").await.unwrap();
    let record = next_record(&channel).await;
    assert_eq!(record.timestamp, 4.0);
    assert_eq!(record.camera_device_id, 2);
    assert!(!task.is_finished());

    shutdown(stop, task).await;
}

#[tokio::test]
async fn test_worker_accepts_new_peer_after_disconnect() {
    let port = free_ports(1);
    let channel = channel();
    let (stop, task) = spawn_worker(port, &channel, raw_row_decoder());

    let mut first = connect(port).await;
    write_frame(&mut first, 1.0, 0, b"one").await.unwrap();
    assert_eq!(next_record(&channel).await.timestamp, 1.0);
    drop(first);

    let mut second = connect(port).await;
    write_frame(&mut second, 2.0, 0, b"two").await.unwrap();
    assert_eq!(next_record(&channel).await.timestamp, 2.0);

    shutdown(stop, task).await;
}

#[tokio::test]
async fn test_oversized_header_closes_connection_only() {
    let port = free_ports(1);
    let channel = channel();
    let (stop, task) = spawn_worker(port, &channel, raw_row_decoder());

    let mut bad = connect(port).await;
    let header = FrameHeader {
        timestamp: 0.0,
        camera_device_id: 0,
        payload_length: u32::MAX,
    };
    bad.write_all(&header.encode()).await.unwrap();

    let mut good = connect(port).await;
    write_frame(&mut good, 5.0, 1, b"ok").await.unwrap();
    assert_eq!(next_record(&channel).await.timestamp, 5.0);
    assert!(!task.is_finished());

    shutdown(stop, task).await;
}

#[tokio::test]
async fn test_worker_exits_on_stop_without_peer() {
    let port = free_ports(1);
    let channel = channel();
    let (stop, task) = spawn_worker(port, &channel, raw_row_decoder());

    tokio::time::sleep(Duration::from_millis(50)).await;
    let started = Instant::now();
    shutdown(stop, task).await;

    // One accept timeout plus flush and drain
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_bind_failure_ends_worker_cleanly() {
    let taken = StdListener::bind((LOCALHOST, 0)).unwrap();
    let port = taken.local_addr().unwrap().port();

    let channel = channel();
    let (_stop, task) = spawn_worker(port, &channel, raw_row_decoder());

    tokio::time::timeout(Duration::from_secs(3), task)
        .await
        .expect("worker should give up on a bound port")
        .unwrap();
    drop(taken);
}

#[tokio::test]
async fn test_manager_runs_one_worker_per_port() {
    let base_port = free_ports(2);
    let config = IngestConfig {
        host: LOCALHOST,
        base_port,
        connection_count: 2,
        accept_timeout_ms: 300,
        read_timeout_ms: 300,
        join_timeout_ms: 3_000,
        ..IngestConfig::default()
    };
    let channel = channel();
    let mut manager = IngestManager::new(config, channel.clone(), raw_row_decoder()).unwrap();
    manager.start_workers();
    assert_eq!(manager.worker_count(), 2);

    let mut cam0 = connect(base_port).await;
    let mut cam1 = connect(base_port + 1).await;
    write_frame(&mut cam0, 10.0, 0, b"zero").await.unwrap();
    write_frame(&mut cam1, 20.0, 1, b"one").await.unwrap();

    let mut seen = vec![
        next_record(&channel).await.camera_device_id,
        next_record(&channel).await.camera_device_id,
    ];
    seen.sort_unstable();
    assert_eq!(seen, vec![0, 1]);

    let started = Instant::now();
    manager.stop_workers().await;
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(manager.worker_count(), 0);

    // Second stop is a no-op
    manager.stop_workers().await;
}

#[tokio::test]
async fn test_manager_stop_after_workers_failed() {
    // Hold both ports so every worker fails to bind and exits on its own
    let first = StdListener::bind((LOCALHOST, 0)).unwrap();
    let base_port = first.local_addr().unwrap().port();
    let Ok(second) = StdListener::bind((LOCALHOST, base_port + 1)) else {
        return;
    };

    let config = IngestConfig {
        host: LOCALHOST,
        base_port,
        connection_count: 2,
        join_timeout_ms: 2_000,
        ..IngestConfig::default()
    };
    let mut manager = IngestManager::new(config, channel(), raw_row_decoder()).unwrap();
    manager.start_workers();
    tokio::time::sleep(Duration::from_millis(500)).await;

    let started = Instant::now();
    manager.stop_workers().await;
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(manager.worker_count(), 0);

    drop((first, second));
}

#[tokio::test]
async fn test_trickling_peer_is_aborted_at_join_deadline() {
    let base_port = free_ports(1);
    let config = IngestConfig {
        host: LOCALHOST,
        base_port,
        connection_count: 1,
        accept_timeout_ms: 300,
        read_timeout_ms: 200,
        join_timeout_ms: 300,
        ..IngestConfig::default()
    };
    let channel = channel();
    let mut manager = IngestManager::new(config, channel.clone(), raw_row_decoder()).unwrap();
    manager.start_workers();

    let mut client = connect(base_port).await;
    let header = FrameHeader {
        timestamp: 9.0,
        camera_device_id: 0,
        payload_length: 10_000,
    };
    client.write_all(&header.encode()).await.unwrap();

    // One byte well inside every read timeout, so the frame never completes
    let trickle = tokio::spawn(async move {
        loop {
            if client.write_all(&[0]).await.is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    });
    tokio::time::sleep(Duration::from_millis(200)).await;

    let started = Instant::now();
    manager.stop_workers().await;
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_millis(300));
    assert!(elapsed < Duration::from_millis(1_500));
    assert_eq!(manager.worker_count(), 0);
    assert!(channel.is_empty());

    trickle.abort();
}
