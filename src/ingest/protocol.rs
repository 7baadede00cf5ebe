//! Camera frame wire format.
//!
//! Every frame is a fixed 16-byte big-endian header followed by the encoded
//! image payload:
//!
//! ```text
//! offset 0   timestamp         f64
//! offset 8   camera_device_id  u32
//! offset 12  payload_length    u32
//! offset 16  payload           payload_length bytes
//! ```

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::IngestError;

pub const HEADER_LEN: usize = 16;

/// Upper bound on a declared payload unless configured otherwise
pub const DEFAULT_MAX_PAYLOAD_BYTES: u32 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameHeader {
    pub timestamp: f64,
    pub camera_device_id: u32,
    pub payload_length: u32,
}

impl FrameHeader {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        let mut dst = &mut out[..];
        dst.put_f64(self.timestamp);
        dst.put_u32(self.camera_device_id);
        dst.put_u32(self.payload_length);
        out
    }

    pub fn decode(raw: &[u8; HEADER_LEN]) -> Self {
        let mut src = &raw[..];
        Self {
            timestamp: src.get_f64(),
            camera_device_id: src.get_u32(),
            payload_length: src.get_u32(),
        }
    }
}

/// A complete frame before decoding
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

/// Reassembles frames from a byte stream delivered in arbitrary chunks.
///
/// Bytes already received stay buffered across read timeouts, so a slow
/// sender never desynchronises the stream.
pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
    max_payload_bytes: u32,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, max_payload_bytes: u32) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(64 * 1024),
            max_payload_bytes,
        }
    }

    /// Bytes of an incomplete frame currently held
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Read until one whole frame is available.
    ///
    /// Each individual read waits at most `read_timeout`.
    pub async fn next_frame(&mut self, read_timeout: Duration) -> Result<RawFrame, IngestError> {
        loop {
            if let Some(frame) = self.parse_frame()? {
                return Ok(frame);
            }

            let read = tokio::time::timeout(read_timeout, self.inner.read_buf(&mut self.buf))
                .await
                .map_err(|_| IngestError::ReadTimeout(read_timeout))??;

            if read == 0 {
                return Err(IngestError::ConnectionClosed {
                    buffered: self.buf.len(),
                });
            }
        }
    }

    fn parse_frame(&mut self) -> Result<Option<RawFrame>, IngestError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut raw = [0u8; HEADER_LEN];
        raw.copy_from_slice(&self.buf[..HEADER_LEN]);
        let header = FrameHeader::decode(&raw);

        if header.payload_length > self.max_payload_bytes {
            return Err(IngestError::PayloadTooLarge {
                declared: header.payload_length,
                limit: self.max_payload_bytes,
            });
        }

        let frame_len = HEADER_LEN + header.payload_length as usize;
        if self.buf.len() < frame_len {
            self.buf.reserve(frame_len - self.buf.len());
            return Ok(None);
        }

        self.buf.advance(HEADER_LEN);
        let payload = self.buf.split_to(header.payload_length as usize).freeze();

        Ok(Some(RawFrame { header, payload }))
    }
}

/// Send one frame. The declared length is taken from `payload`.
pub async fn write_frame<W>(
    writer: &mut W,
    timestamp: f64,
    camera_device_id: u32,
    payload: &[u8],
) -> Result<(), IngestError>
where
    W: AsyncWrite + Unpin,
{
    let payload_length = u32::try_from(payload.len()).map_err(|_| IngestError::PayloadTooLarge {
        declared: u32::MAX,
        limit: u32::MAX,
    })?;

    let header = FrameHeader {
        timestamp,
        camera_device_id,
        payload_length,
    };

    writer.write_all(&header.encode()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}
