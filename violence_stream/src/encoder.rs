use crate::frame::{EncodedFrame, VideoFrame};
use image::{codecs::jpeg::JpegEncoder, ExtendedColorType, ImageError};
use thiserror::Error;
use tracing::instrument;

pub const DEFAULT_JPEG_QUALITY: u8 = 80;

#[derive(Error, Debug)]
pub enum EncodingError {
    #[error("Frame has no pixels ({width}x{height})")]
    EmptyFrame { width: u32, height: u32 },
    #[error("Frame buffer holds {actual} bytes, expected {expected}")]
    InvalidBuffer { expected: usize, actual: usize },
    #[error("Failed to encode frame: {0}")]
    Codec(#[from] ImageError),
    #[error("Encoder produced no data")]
    NoData,
    #[error("Encoding task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Compresses captured frames to JPEG.
#[derive(Debug, Clone, Copy)]
pub struct FrameEncoder {
    quality: u8,
}

impl Default for FrameEncoder {
    fn default() -> Self {
        Self::new(DEFAULT_JPEG_QUALITY)
    }
}

impl FrameEncoder {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    /// Encodes on the blocking pool so the capture timeline keeps ticking
    /// while the codec runs.
    #[instrument(skip(self, frame), fields(width = frame.width, height = frame.height))]
    pub async fn encode(&self, frame: VideoFrame) -> Result<EncodedFrame, EncodingError> {
        validate(&frame)?;
        let quality = self.quality;
        tokio::task::spawn_blocking(move || encode_jpeg(&frame, quality)).await?
    }
}

fn validate(frame: &VideoFrame) -> Result<(), EncodingError> {
    if frame.is_empty() {
        return Err(EncodingError::EmptyFrame {
            width: frame.width,
            height: frame.height,
        });
    }
    if frame.data.len() != frame.expected_len() {
        return Err(EncodingError::InvalidBuffer {
            expected: frame.expected_len(),
            actual: frame.data.len(),
        });
    }
    Ok(())
}

fn encode_jpeg(frame: &VideoFrame, quality: u8) -> Result<EncodedFrame, EncodingError> {
    let mut buf = Vec::with_capacity(frame.data.len() / 8);
    JpegEncoder::new_with_quality(&mut buf, quality).encode(
        &frame.data,
        frame.width,
        frame.height,
        ExtendedColorType::Rgb8,
    )?;

    if buf.is_empty() {
        return Err(EncodingError::NoData);
    }
    Ok(EncodedFrame::new(buf))
}
