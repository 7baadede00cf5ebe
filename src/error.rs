use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

/// Failures on the ingestion path, from bind to decoded record.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("no peer connected within {0:?}")]
    AcceptTimeout(Duration),

    #[error("no data received within {0:?}")]
    ReadTimeout(Duration),

    /// Zero-length read. `buffered` bytes of an incomplete frame were discarded.
    #[error("peer closed the connection ({buffered} bytes of a partial frame discarded)")]
    ConnectionClosed { buffered: usize },

    #[error("declared payload length {declared} exceeds the {limit} byte limit")]
    PayloadTooLarge { declared: u32, limit: u32 },

    #[error("frame decode failed: {0}")]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl IngestError {
    /// Errors that end the current connection but leave the worker able to
    /// accept a new peer.
    pub fn is_connection_local(&self) -> bool {
        matches!(
            self,
            IngestError::ConnectionClosed { .. } | IngestError::PayloadTooLarge { .. }
        )
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Jpeg(#[from] jpeg_decoder::Error),

    #[error("unsupported JPEG pixel format {0:?}")]
    UnsupportedPixelFormat(jpeg_decoder::PixelFormat),

    #[error("decoded pixel buffer does not fit {width}x{height}")]
    BufferMismatch { width: u32, height: u32 },

    #[error("decode task failed: {0}")]
    Task(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
