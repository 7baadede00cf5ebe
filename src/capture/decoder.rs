use image::{DynamicImage, GrayImage, ImageFormat, RgbImage};
use jpeg_decoder::{Decoder, PixelFormat};

use super::frame::PayloadFormat;
use crate::error::DecodeError;

/// Turns an encoded payload into pixels.
///
/// Implemented for plain closures so tests and embedders can swap the codec.
pub trait FrameDecoder: Send + Sync {
    fn decode(&self, payload: &[u8]) -> Result<DynamicImage, DecodeError>;
}

impl<F> FrameDecoder for F
where
    F: Fn(&[u8]) -> Result<DynamicImage, DecodeError> + Send + Sync,
{
    fn decode(&self, payload: &[u8]) -> Result<DynamicImage, DecodeError> {
        self(payload)
    }
}

/// Default decoder backed by the `image` and `jpeg-decoder` crates
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageDecoder {
    format: PayloadFormat,
}

impl ImageDecoder {
    pub fn new(format: PayloadFormat) -> Self {
        Self { format }
    }

    pub fn format(&self) -> PayloadFormat {
        self.format
    }
}

impl FrameDecoder for ImageDecoder {
    fn decode(&self, payload: &[u8]) -> Result<DynamicImage, DecodeError> {
        match self.format {
            PayloadFormat::Auto => Ok(image::load_from_memory(payload)?),
            PayloadFormat::Jpeg => decode_jpeg(payload),
            PayloadFormat::Png => Ok(image::load_from_memory_with_format(
                payload,
                ImageFormat::Png,
            )?),
        }
    }
}

fn decode_jpeg(data: &[u8]) -> Result<DynamicImage, DecodeError> {
    let mut decoder = Decoder::new(data);
    let pixels = decoder.decode()?;
    let info = decoder
        .info()
        .ok_or(DecodeError::BufferMismatch { width: 0, height: 0 })?;

    let width = u32::from(info.width);
    let height = u32::from(info.height);

    let image = match info.pixel_format {
        PixelFormat::RGB24 => RgbImage::from_raw(width, height, pixels).map(DynamicImage::ImageRgb8),
        PixelFormat::L8 => GrayImage::from_raw(width, height, pixels).map(DynamicImage::ImageLuma8),
        other => return Err(DecodeError::UnsupportedPixelFormat(other)),
    };

    image.ok_or(DecodeError::BufferMismatch { width, height })
}
