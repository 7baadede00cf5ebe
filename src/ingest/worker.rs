use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::protocol::{FrameReader, RawFrame};
use crate::capture::{FrameDecoder, FrameRecord};
use crate::error::{DecodeError, IngestError};
use crate::pipeline::FrameChannel;
use crate::IngestConfig;

/// Stop flag shared by the manager (single writer) and its workers.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` only for the call that actually raised the flag.
    pub fn request(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Per-worker socket timing and limits
#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    pub accept_timeout: Duration,
    pub read_timeout: Duration,
    pub max_payload_bytes: u32,
}

impl From<&IngestConfig> for WorkerSettings {
    fn from(config: &IngestConfig) -> Self {
        Self {
            accept_timeout: config.accept_timeout(),
            read_timeout: config.read_timeout(),
            max_payload_bytes: config.max_payload_bytes,
        }
    }
}

/// Receives frames from one camera on one TCP port.
///
/// Lifecycle: bind and listen, accept a single peer, then decode frames
/// from it until the stop signal is raised. Accept timeouts and peer
/// disconnects send the worker back to listening on a fresh socket.
pub struct IngestWorker {
    addr: SocketAddr,
    settings: WorkerSettings,
    stop: StopSignal,
    channel: FrameChannel<FrameRecord>,
    decoder: Arc<dyn FrameDecoder>,
}

impl IngestWorker {
    pub fn new(
        addr: SocketAddr,
        settings: WorkerSettings,
        stop: StopSignal,
        channel: FrameChannel<FrameRecord>,
        decoder: Arc<dyn FrameDecoder>,
    ) -> Self {
        Self {
            addr,
            settings,
            stop,
            channel,
            decoder,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Worker body. Never panics on socket failure; the channel is
    /// flushed and drained on every exit path short of an abort.
    ///
    /// The stop signal is checked between accepts and between frames, not
    /// while a frame is being reassembled. A peer that keeps trickling bytes
    /// inside `read_timeout` holds the worker in one frame, so a cooperative
    /// stop only lands once that frame completes. Otherwise the manager's
    /// abort pass ends the task.
    pub async fn run(self) {
        match self.serve().await {
            Ok(()) => info!("Stop requested, worker exiting"),
            Err(e) => error!("Worker terminated: {}", e),
        }

        self.channel.flush_and_drain().await;
    }

    async fn serve(&self) -> Result<(), IngestError> {
        while !self.stop.is_requested() {
            let (stream, peer) = match self.accept().await {
                Ok(connection) => connection,
                Err(IngestError::AcceptTimeout(waited)) => {
                    warn!("No connection within {:?}, retrying", waited);
                    continue;
                }
                Err(e) => return Err(e),
            };

            info!("Connected by address {}", peer);

            match self.receive(stream).await {
                Ok(()) => {}
                Err(e) if e.is_connection_local() => {
                    warn!("Dropping connection from {}: {}", peer, e);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    /// Bind a fresh listener and wait for one peer. The listener is closed
    /// on return whether or not a peer arrived.
    async fn accept(&self) -> Result<(TcpStream, SocketAddr), IngestError> {
        let listener = TcpListener::bind(self.addr)
            .await
            .map_err(|source| IngestError::Bind {
                addr: self.addr,
                source,
            })?;
        info!("Listening on {}", self.addr);

        match timeout(self.settings.accept_timeout, listener.accept()).await {
            Ok(accepted) => Ok(accepted?),
            Err(_) => Err(IngestError::AcceptTimeout(self.settings.accept_timeout)),
        }
    }

    /// Receive loop for one connection. Returns `Ok` when stop is requested.
    async fn receive(&self, stream: TcpStream) -> Result<(), IngestError> {
        stream.set_nodelay(true)?;
        let mut reader = FrameReader::new(stream, self.settings.max_payload_bytes);

        while !self.stop.is_requested() {
            let raw = match reader.next_frame(self.settings.read_timeout).await {
                Ok(raw) => raw,
                Err(IngestError::ReadTimeout(waited)) => {
                    warn!(
                        buffered = reader.buffered(),
                        "No data within {:?}, retrying", waited
                    );
                    continue;
                }
                Err(e) => return Err(e),
            };

            let camera_device_id = raw.header.camera_device_id;
            match self.decode(raw).await {
                Ok(record) => {
                    metrics::counter!("frames_received").increment(1);
                    self.channel.put(record).await;
                }
                Err(e) => {
                    metrics::counter!("frames_decode_failed").increment(1);
                    warn!(camera_device_id, "Dropping frame: {}", e);
                }
            }
        }

        Ok(())
    }

    async fn decode(&self, raw: RawFrame) -> Result<FrameRecord, IngestError> {
        let received_at = Instant::now();
        let RawFrame { header, payload } = raw;
        debug_assert_eq!(payload.len(), header.payload_length as usize);

        let decoder = Arc::clone(&self.decoder);
        let image = tokio::task::spawn_blocking(move || decoder.decode(&payload))
            .await
            .map_err(|e| DecodeError::Task(e.to_string()))??;

        let decode_time = received_at.elapsed();
        metrics::histogram!("frame_decode_time_us").record(decode_time.as_micros() as f64);
        debug!(
            camera_device_id = header.camera_device_id,
            width = image.width(),
            height = image.height(),
            "Decoded frame in {:?}",
            decode_time
        );

        Ok(FrameRecord::new(header, image, received_at))
    }
}
