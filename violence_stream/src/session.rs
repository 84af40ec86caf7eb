use crate::camera::{CameraError, FrameSource};
use crate::channel::{ChannelError, PredictionChannel};
use crate::config::Config;
use crate::encoder::{FrameEncoder, DEFAULT_JPEG_QUALITY};
use crate::scheduler::{CaptureScheduler, IntervalTicker, SchedulerError, DEFAULT_CAPTURE_PERIOD};
use crate::sink::PredictionSink;
use crate::telemetry::Metrics;
use crate::transport::ConnectionState;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::sync::watch;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Capture source unavailable: {0}")]
    Acquisition(#[from] CameraError),
    #[error("Prediction service unreachable: {0}")]
    Channel(#[from] ChannelError),
    #[error("Failed to start capturing: {0}")]
    Scheduler(#[from] SchedulerError),
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub url: String,
    pub capture_period: Duration,
    pub jpeg_quality: u8,
}

impl SessionSettings {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            capture_period: DEFAULT_CAPTURE_PERIOD,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }

    pub fn with_capture_period(mut self, period: Duration) -> Self {
        self.capture_period = period;
        self
    }
}

impl From<&Config> for SessionSettings {
    fn from(config: &Config) -> Self {
        Self {
            url: config.prediction_service.url.clone(),
            capture_period: config.camera.get_capture_period(),
            jpeg_quality: config.camera.jpeg_quality,
        }
    }
}

/// One streaming session: a single connection and a single scheduler,
/// from acquisition to teardown.
pub struct Session {
    channel: PredictionChannel,
    scheduler: CaptureScheduler,
    sink: PredictionSink,
}

impl Session {
    /// Acquires the capture source, connects, and starts capturing once the
    /// connection is open. Nothing is connected if acquisition fails.
    pub async fn start<A>(
        acquire: A,
        settings: &SessionSettings,
        sink: PredictionSink,
        metrics: Arc<Metrics>,
    ) -> Result<Self, SessionError>
    where
        A: FnOnce() -> Result<Arc<dyn FrameSource>, CameraError>,
    {
        let source = acquire()?;

        let channel = PredictionChannel::connect(&settings.url, sink.clone(), metrics.clone());
        if let Err(e) = channel.opened().await {
            channel.shutdown().await;
            return Err(e.into());
        }

        let mut scheduler = CaptureScheduler::new(
            source,
            FrameEncoder::new(settings.jpeg_quality),
            metrics,
        );
        if let Err(e) = scheduler.start(
            channel.sender(),
            IntervalTicker::new(settings.capture_period),
        ) {
            channel.shutdown().await;
            return Err(e.into());
        }
        tracing::info!(
            "Streaming frames every {} ms to {}",
            settings.capture_period.as_millis(),
            settings.url
        );

        Ok(Self {
            channel,
            scheduler,
            sink,
        })
    }

    pub fn sink(&self) -> &PredictionSink {
        &self.sink
    }

    pub fn state(&self) -> ConnectionState {
        self.channel.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.channel.subscribe()
    }

    pub fn is_capturing(&self) -> bool {
        self.scheduler.is_running()
    }

    pub fn ticks(&self) -> u64 {
        self.scheduler.ticks()
    }

    /// Resolves when the peer or the transport ends the connection.
    pub async fn closed(&self) {
        self.channel.closed().await;
    }

    /// Stops the ticker, then closes the connection. The last prediction stays
    /// in the sink.
    pub async fn teardown(self) {
        let Session {
            mut scheduler,
            channel,
            ..
        } = self;
        scheduler.stop();
        channel.shutdown().await;
        tracing::info!("Session ended after {} ticks", scheduler.ticks());
    }
}
