use crate::config::{CameraConfig, SourceKind};
use crate::frame::{VideoFrame, RGB_CHANNELS};
use async_trait::async_trait;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use thiserror::Error;

type BackendError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("Camera {0} is unavailable or access was denied")]
    DeviceUnavailable(i32),
    #[error("Camera capture is not compiled in; enable the `opencv` feature")]
    Unsupported,
    #[error("Failed to open camera: {0}")]
    OpenCameraFailed(BackendError),
    #[error("Failed to read frame: {0}")]
    ReadFrameFailed(BackendError),
}

/// A live video source. Every call reads whatever the source is showing now.
#[async_trait]
pub trait FrameSource: Send + Sync + 'static {
    async fn capture_frame(&self) -> Result<VideoFrame, CameraError>;
}

/// Opens the source named in the configuration. Failing here is fatal to the
/// session: nothing is connected or scheduled.
pub fn acquire_source(config: &CameraConfig) -> Result<Arc<dyn FrameSource>, CameraError> {
    match config.source {
        SourceKind::TestPattern => {
            tracing::info!(
                "Using {}x{} test pattern as capture source",
                config.width,
                config.height
            );
            Ok(Arc::new(TestPattern::new(config.width, config.height)))
        }
        SourceKind::Device => open_device(config.device_index),
    }
}

#[cfg(feature = "opencv")]
fn open_device(index: i32) -> Result<Arc<dyn FrameSource>, CameraError> {
    let camera = Camera::new(index)?;
    tracing::info!("Opened camera {}", index);
    Ok(Arc::new(camera))
}

#[cfg(not(feature = "opencv"))]
fn open_device(_index: i32) -> Result<Arc<dyn FrameSource>, CameraError> {
    Err(CameraError::Unsupported)
}

#[cfg(feature = "opencv")]
pub use device::Camera;

#[cfg(feature = "opencv")]
mod device {
    use super::{CameraError, FrameSource};
    use crate::frame::VideoFrame;
    use async_trait::async_trait;
    use opencv::{core::Mat, imgproc, prelude::*, videoio};
    use tokio::sync::Mutex;

    #[derive(Debug)]
    pub struct Camera {
        capture: Mutex<videoio::VideoCapture>,
    }

    impl Camera {
        pub fn new(index: i32) -> Result<Self, CameraError> {
            let capture = videoio::VideoCapture::new(index, videoio::CAP_ANY)
                .map_err(|e| CameraError::OpenCameraFailed(e.into()))?;
            let opened = capture
                .is_opened()
                .map_err(|e| CameraError::OpenCameraFailed(e.into()))?;
            if !opened {
                return Err(CameraError::DeviceUnavailable(index));
            }
            Ok(Self {
                capture: Mutex::new(capture),
            })
        }
    }

    #[async_trait]
    impl FrameSource for Camera {
        async fn capture_frame(&self) -> Result<VideoFrame, CameraError> {
            let mut cam = self.capture.lock().await;
            let mut frame = Mat::default();
            let grabbed = cam.read(&mut frame).map_err(read_failed)?;
            drop(cam);

            // A device that has not started streaming yields an empty frame,
            // which the encoder rejects.
            if !grabbed || frame.empty() {
                return Ok(VideoFrame::new(0, 0, Vec::new()));
            }

            let mut rgb = Mat::default();
            imgproc::cvt_color_def(&frame, &mut rgb, imgproc::COLOR_BGR2RGB)
                .map_err(read_failed)?;
            Ok(VideoFrame::new(
                rgb.cols() as u32,
                rgb.rows() as u32,
                rgb.data_bytes().map_err(read_failed)?.to_vec(),
            ))
        }
    }

    fn read_failed(e: opencv::Error) -> CameraError {
        CameraError::ReadFrameFailed(e.into())
    }
}

/// Synthetic source drawing a diagonal gradient that shifts on every capture,
/// so consecutive frames always differ.
#[derive(Debug)]
pub struct TestPattern {
    width: u32,
    height: u32,
    captured: AtomicU64,
}

impl TestPattern {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            captured: AtomicU64::new(0),
        }
    }

    pub fn render(&self, offset: u64) -> VideoFrame {
        let (width, height) = (self.width as usize, self.height as usize);
        let mut data = Vec::with_capacity(width * height * RGB_CHANNELS);
        let shift = (offset.wrapping_mul(37) % 256) as usize;
        for y in 0..height {
            for x in 0..width {
                data.push(((x + shift) % 256) as u8);
                data.push(((y + shift) % 256) as u8);
                data.push(((x + y + 2 * shift) % 256) as u8);
            }
        }
        VideoFrame::new(self.width, self.height, data)
    }
}

#[async_trait]
impl FrameSource for TestPattern {
    async fn capture_frame(&self) -> Result<VideoFrame, CameraError> {
        let offset = self.captured.fetch_add(1, Ordering::Relaxed);
        Ok(self.render(offset))
    }
}
