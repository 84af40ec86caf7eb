use crate::camera::FrameSource;
use crate::encoder::FrameEncoder;
use crate::telemetry::Metrics;
use crate::transport::{ConnectionState, FrameTransport};
use async_trait::async_trait;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use thiserror::Error;
use tokio::{
    task::JoinHandle,
    time::{interval_at, Duration, Instant, Interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

pub const DEFAULT_CAPTURE_PERIOD: Duration = Duration::from_millis(200);
pub const MIN_CAPTURE_PERIOD: Duration = Duration::from_millis(1);

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("Capture scheduler is already running")]
    AlreadyStarted,
    #[error("Capture scheduler was stopped and cannot be restarted")]
    Stopped,
    #[error("Cannot start capturing while the connection is {0}")]
    ChannelNotOpen(ConnectionState),
}

/// Source of capture ticks.
#[async_trait]
pub trait Ticker: Send + 'static {
    /// Resolves at the next tick, or `None` once no more ticks will come.
    async fn tick(&mut self) -> Option<Instant>;
}

/// Wall-clock ticker. The first tick fires one period after creation and
/// missed ticks are skipped rather than replayed in a burst. Periods shorter
/// than [`MIN_CAPTURE_PERIOD`] are raised to it.
#[derive(Debug)]
pub struct IntervalTicker {
    interval: Interval,
}

impl IntervalTicker {
    pub fn new(period: Duration) -> Self {
        let period = period.max(MIN_CAPTURE_PERIOD);
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self { interval }
    }

    pub fn period(&self) -> Duration {
        self.interval.period()
    }
}

#[async_trait]
impl Ticker for IntervalTicker {
    async fn tick(&mut self) -> Option<Instant> {
        Some(self.interval.tick().await)
    }
}

enum SchedulerState {
    Idle,
    Running {
        cancel: CancellationToken,
        handle: JoinHandle<()>,
    },
    Stopped,
}

/// Fires one capture, encode and send cycle per tick.
///
/// Ticks never wait for each other: each cycle runs as its own task, so a slow
/// encode can let a later frame reach the peer first.
pub struct CaptureScheduler {
    source: Arc<dyn FrameSource>,
    encoder: FrameEncoder,
    metrics: Arc<Metrics>,
    ticks: Arc<AtomicU64>,
    state: SchedulerState,
}

impl CaptureScheduler {
    pub fn new(source: Arc<dyn FrameSource>, encoder: FrameEncoder, metrics: Arc<Metrics>) -> Self {
        Self {
            source,
            encoder,
            metrics,
            ticks: Arc::new(AtomicU64::new(0)),
            state: SchedulerState::Idle,
        }
    }

    /// Starts ticking. Only valid once, and only while `transport` is open.
    pub fn start<T, K>(&mut self, transport: T, ticker: K) -> Result<(), SchedulerError>
    where
        T: FrameTransport,
        K: Ticker,
    {
        match self.state {
            SchedulerState::Running { .. } => return Err(SchedulerError::AlreadyStarted),
            SchedulerState::Stopped => return Err(SchedulerError::Stopped),
            SchedulerState::Idle => {}
        }
        let connection = transport.state();
        if connection != ConnectionState::Open {
            return Err(SchedulerError::ChannelNotOpen(connection));
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(
            ticker,
            transport,
            self.source.clone(),
            self.encoder,
            self.metrics.clone(),
            self.ticks.clone(),
            cancel.clone(),
        ));
        self.state = SchedulerState::Running { cancel, handle };
        Ok(())
    }

    /// Cancels the ticker. Cycles already in flight run to completion.
    pub fn stop(&mut self) {
        if let SchedulerState::Running { cancel, .. } = &self.state {
            cancel.cancel();
        }
        self.state = SchedulerState::Stopped;
    }

    pub fn is_running(&self) -> bool {
        match &self.state {
            SchedulerState::Running { handle, .. } => !handle.is_finished(),
            _ => false,
        }
    }

    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }
}

impl Drop for CaptureScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run<T, K>(
    mut ticker: K,
    transport: T,
    source: Arc<dyn FrameSource>,
    encoder: FrameEncoder,
    metrics: Arc<Metrics>,
    ticks: Arc<AtomicU64>,
    cancel: CancellationToken,
) where
    T: FrameTransport,
    K: Ticker,
{
    tracing::info!("Capture scheduler started");
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!("Capture scheduler received stop signal");
                break;
            }
            _ = transport.closed() => {
                tracing::info!("Connection closed, stopping capture");
                break;
            }
            tick = ticker.tick() => {
                if tick.is_none() {
                    break;
                }
                let tick = ticks.fetch_add(1, Ordering::Relaxed) + 1;
                let span = tracing::debug_span!("capture.tick", tick);
                tokio::spawn(
                    capture_and_send(
                        source.clone(),
                        encoder,
                        transport.clone(),
                        metrics.clone(),
                    )
                    .instrument(span),
                );
            }
        }
    }
    tracing::info!("Capture scheduler stopped");
}

async fn capture_and_send<T: FrameTransport>(
    source: Arc<dyn FrameSource>,
    encoder: FrameEncoder,
    transport: T,
    metrics: Arc<Metrics>,
) {
    let frame = match source.capture_frame().await {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!("Capture failed, skipping frame: {}", e);
            metrics.record_capture_failure();
            return;
        }
    };
    metrics.record_frame_captured();

    let started = std::time::Instant::now();
    match encoder.encode(frame).await {
        Ok(encoded) => {
            metrics.record_encode_duration(started.elapsed().as_secs_f64() * 1000.0);
            transport.send(encoded);
        }
        Err(e) => {
            tracing::warn!("Encoding failed, skipping frame: {}", e);
            metrics.record_encode_failure();
        }
    }
}
