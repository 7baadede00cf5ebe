//! Bounded MPMC frame channel with drop-on-full semantics

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::utils::CachePadded;
use flume::{Receiver, Sender};
use tokio::time::timeout;
use tracing::debug;

use crate::ChannelConfig;

/// Channel between ingestion workers and the consumer.
///
/// Every operation is bounded by `op_timeout`, so no caller ever parks
/// indefinitely. Items travel as `Option<T>`; `None` is the shutdown
/// sentinel and is never surfaced as a record.
pub struct FrameChannel<T> {
    tx: Sender<Option<T>>,
    rx: Receiver<Option<T>>,
    maxsize: usize,
    op_timeout: Duration,
    settle_delay: Duration,
    stats: Arc<CachePadded<Stats>>,
}

#[derive(Default)]
struct Stats {
    written: AtomicU64,
    read: AtomicU64,
    dropped: AtomicU64,
}

/// Snapshot of channel counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub written: u64,
    pub read: u64,
    pub dropped: u64,
}

impl<T> Clone for FrameChannel<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            maxsize: self.maxsize,
            op_timeout: self.op_timeout,
            settle_delay: self.settle_delay,
            stats: Arc::clone(&self.stats),
        }
    }
}

impl<T> FrameChannel<T> {
    /// `maxsize` of 0 means unbounded.
    pub fn new(maxsize: usize, op_timeout: Duration, settle_delay: Duration) -> Self {
        let (tx, rx) = if maxsize == 0 {
            flume::unbounded()
        } else {
            flume::bounded(maxsize)
        };

        Self {
            tx,
            rx,
            maxsize,
            op_timeout,
            settle_delay,
            stats: Arc::new(CachePadded::new(Stats::default())),
        }
    }

    pub fn from_config(config: &ChannelConfig) -> Self {
        Self::new(config.capacity, config.op_timeout(), config.settle_delay())
    }

    /// Enqueue a record, discarding it if there is no room within the timeout.
    pub async fn put(&self, item: T) {
        match timeout(self.op_timeout, self.tx.send_async(Some(item))).await {
            Ok(Ok(())) => {
                self.stats.written.fetch_add(1, Ordering::Relaxed);
            }
            // Full past the timeout, or every receiver gone: freshness wins
            Ok(Err(_)) | Err(_) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("frames_dropped").increment(1);
            }
        }
    }

    /// Dequeue a record. `None` on timeout or when a sentinel is received.
    pub async fn get(&self) -> Option<T> {
        match timeout(self.op_timeout, self.rx.recv_async()).await {
            Ok(Ok(Some(item))) => {
                self.stats.read.fetch_add(1, Ordering::Relaxed);
                Some(item)
            }
            _ => None,
        }
    }

    /// Push up to `maxsize` sentinels, stopping at the first full timeout.
    pub async fn flush_queue(&self) {
        let mut pushed = 0;
        for _ in 0..self.maxsize {
            match timeout(self.op_timeout, self.tx.send_async(None)).await {
                Ok(Ok(())) => pushed += 1,
                _ => break,
            }
        }
        debug!(pushed, "Flushed channel with sentinels");
    }

    /// Discard up to `maxsize` pending items, stopping once the channel is empty.
    pub async fn drain_queue(&self) {
        let mut drained = 0;
        for _ in 0..self.maxsize {
            match timeout(self.op_timeout, self.rx.recv_async()).await {
                Ok(Ok(_)) => drained += 1,
                _ => break,
            }
        }
        debug!(drained, "Drained channel");
    }

    /// Flush, give parked consumers time to wake on a sentinel, then drain.
    pub async fn flush_and_drain(&self) {
        self.flush_queue().await;
        tokio::time::sleep(self.settle_delay).await;
        self.drain_queue().await;
    }

    /// Items currently queued, sentinels included
    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    /// `None` when unbounded
    pub fn capacity(&self) -> Option<usize> {
        self.tx.capacity()
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            written: self.stats.written.load(Ordering::Relaxed),
            read: self.stats.read.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
        }
    }
}
