use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::ingest::protocol::FrameHeader;

/// Decoded frame as handed to the downstream consumer
pub struct FrameRecord {
    /// Sender-assigned capture time in seconds. Monotonic per camera only.
    pub timestamp: f64,

    pub camera_device_id: u32,

    /// Encoded size declared in the header; always the number of bytes decoded
    pub payload_length: u32,

    /// Decoded pixels, owned exclusively by this record
    pub image: DynamicImage,

    /// Arrival time for latency tracking
    pub received_at: Instant,
}

impl FrameRecord {
    pub(crate) fn new(header: FrameHeader, image: DynamicImage, received_at: Instant) -> Self {
        Self {
            timestamp: header.timestamp,
            camera_device_id: header.camera_device_id,
            payload_length: header.payload_length,
            image,
            received_at,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Time elapsed since the last payload byte arrived
    pub fn latency(&self) -> Duration {
        self.received_at.elapsed()
    }
}

impl std::fmt::Debug for FrameRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameRecord")
            .field("timestamp", &self.timestamp)
            .field("camera_device_id", &self.camera_device_id)
            .field("payload_length", &self.payload_length)
            .field("width", &self.width())
            .field("height", &self.height())
            .finish()
    }
}

/// Payload encodings we can decode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadFormat {
    /// Sniff the container from the payload's magic bytes
    #[default]
    Auto,
    Jpeg,
    Png,
}
