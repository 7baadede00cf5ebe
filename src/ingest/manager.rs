use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{info, info_span, warn, Instrument};

use super::worker::{IngestWorker, StopSignal, WorkerSettings};
use crate::capture::{FrameDecoder, FrameRecord};
use crate::pipeline::FrameChannel;
use crate::error::ConfigError;
use crate::IngestConfig;

/// Upper bound on waiting for an aborted task to unwind
const ABORT_WAIT: Duration = Duration::from_secs(1);

struct WorkerHandle {
    name: String,
    port: u16,
    task: JoinHandle<()>,
}

/// Supervises one ingestion worker per camera port.
pub struct IngestManager {
    config: IngestConfig,
    channel: FrameChannel<FrameRecord>,
    decoder: Arc<dyn FrameDecoder>,
    stop: StopSignal,
    workers: VecDeque<WorkerHandle>,
}

impl IngestManager {
    pub fn new(
        config: IngestConfig,
        channel: FrameChannel<FrameRecord>,
        decoder: Arc<dyn FrameDecoder>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            channel,
            decoder,
            stop: StopSignal::new(),
            workers: VecDeque::new(),
        })
    }

    /// Spawn a worker task for each port in `base_port..base_port + connection_count`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_workers(&mut self) {
        let settings = WorkerSettings::from(&self.config);
        let ports: Vec<u16> = self.config.ports().collect();

        for (index, port) in ports.into_iter().enumerate() {
            let name = format!("Worker-{}", index);
            info!("Spawning worker for network port {}", port);

            let worker = IngestWorker::new(
                SocketAddr::new(self.config.host, port),
                settings,
                self.stop.clone(),
                self.channel.clone(),
                Arc::clone(&self.decoder),
            );

            let span = info_span!("worker", name = %name, port);
            let task = tokio::spawn(worker.run().instrument(span));
            info!("{} spawned listening at port {}", name, port);

            self.track(name, port, task);
        }
    }

    /// Raise the stop signal, join every worker against one shared deadline,
    /// then abort whatever is still running. Safe to call more than once.
    pub async fn stop_workers(&mut self) {
        if self.stop.request() {
            info!("Stop requested for {} workers", self.workers.len());
        }

        let deadline = Instant::now() + self.config.join_timeout();
        let mut overdue = Vec::new();

        while let Some(mut worker) = self.workers.pop_front() {
            info!("Joining {} (port {})", worker.name, worker.port);
            match timeout_at(deadline, &mut worker.task).await {
                Ok(Ok(())) => info!("{} joined", worker.name),
                Ok(Err(e)) => warn!("{} ended abnormally: {}", worker.name, e),
                Err(_) => overdue.push(worker),
            }
        }

        for worker in overdue {
            warn!("Terminating {} (port {})", worker.name, worker.port);
            worker.task.abort();
            match timeout(ABORT_WAIT, worker.task).await {
                Ok(_) => info!("{} terminated", worker.name),
                Err(_) => warn!("{} did not unwind after abort", worker.name),
            }
        }
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Workers started and not yet stopped
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn channel(&self) -> &FrameChannel<FrameRecord> {
        &self.channel
    }

    fn track(&mut self, name: String, port: u16, task: JoinHandle<()>) {
        self.workers.push_back(WorkerHandle { name, port, task });
    }
}
