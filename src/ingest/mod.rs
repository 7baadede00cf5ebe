//! TCP frame ingestion: wire protocol, per-camera workers and their manager

pub mod manager;
pub mod protocol;
pub mod worker;

pub use manager::IngestManager;
pub use protocol::{FrameHeader, FrameReader, RawFrame};
pub use worker::{IngestWorker, StopSignal, WorkerSettings};
