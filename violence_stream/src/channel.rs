use crate::frame::EncodedFrame;
use crate::prediction::{decode_message, MessageError, PeerMessage};
use crate::sink::PredictionSink;
use crate::telemetry::Metrics;
use crate::transport::{ConnectionState, FrameTransport};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use thiserror::Error;
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError},
        watch,
    },
    task::JoinHandle,
    time::{timeout, Duration},
};
use tokio_websockets::{ClientBuilder, Message};
use tokio_util::sync::CancellationToken;

const LOGGED_PAYLOAD_CHARS: usize = 128;

/// Frames waiting for the socket. Anything beyond this is dropped rather
/// than queued behind a slow peer.
pub const OUTBOUND_CAPACITY: usize = 1;

/// Upper bound on the close handshake once the connection is going away.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Connection closed before it was established")]
    ClosedBeforeOpen,
}

/// Moves the state machine forward. `Closed` is terminal and `Open` can only
/// be reached from `Connecting`. Returns whether the state changed.
fn transition(state: &watch::Sender<ConnectionState>, next: ConnectionState) -> bool {
    state.send_if_modified(|current| {
        let allowed = match (*current, next) {
            (ConnectionState::Closed, _) => false,
            (ConnectionState::Connecting, ConnectionState::Open) => true,
            (_, ConnectionState::Closed) => true,
            _ => false,
        };
        if allowed {
            tracing::debug!("Connection state {} -> {}", current, next);
            *current = next;
        }
        allowed
    })
}

/// One WebSocket connection to the inference peer.
///
/// Owned by the session; only the owner can close it. Frames are written
/// through [`FrameSender`] handles obtained from [`PredictionChannel::sender`].
pub struct PredictionChannel {
    url: String,
    state: Arc<watch::Sender<ConnectionState>>,
    outbound: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
    metrics: Arc<Metrics>,
    driver: Option<JoinHandle<()>>,
}

impl PredictionChannel {
    /// Starts connecting in the background and returns in `Connecting`.
    pub fn connect(url: &str, sink: PredictionSink, metrics: Arc<Metrics>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        let state = Arc::new(state_tx);
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let cancel = CancellationToken::new();

        tracing::info!("Connecting to prediction service at {}", url);
        let driver = tokio::spawn(drive(
            url.to_string(),
            state.clone(),
            outbound_rx,
            cancel.clone(),
            sink,
            metrics.clone(),
        ));

        Self {
            url: url.to_string(),
            state,
            outbound,
            cancel,
            metrics,
            driver: Some(driver),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn sender(&self) -> FrameSender {
        FrameSender {
            state: self.state.subscribe(),
            outbound: self.outbound.clone(),
            metrics: self.metrics.clone(),
        }
    }

    /// Waits for the handshake to finish.
    pub async fn opened(&self) -> Result<(), ChannelError> {
        let mut rx = self.state.subscribe();
        let reached = rx
            .wait_for(|state| *state != ConnectionState::Connecting)
            .await
            .map(|state| *state)
            .unwrap_or(ConnectionState::Closed);
        match reached {
            ConnectionState::Open => Ok(()),
            _ => Err(ChannelError::ClosedBeforeOpen),
        }
    }

    pub async fn closed(&self) {
        wait_closed(self.state.subscribe()).await;
    }

    /// Idempotent. Pending and future sends become no-ops immediately.
    pub fn close(&self) {
        if transition(&self.state, ConnectionState::Closed) {
            tracing::info!("Closing connection to {}", self.url);
        }
        self.cancel.cancel();
    }

    /// Closes and waits for the close handshake to be written.
    pub async fn shutdown(mut self) {
        self.close();
        if let Some(driver) = self.driver.take() {
            if let Err(e) = driver.await {
                tracing::error!("Connection task failed: {:?}", e);
            }
        }
    }
}

impl Drop for PredictionChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn wait_closed(mut rx: watch::Receiver<ConnectionState>) {
    // A dropped sender means the channel is gone, which counts as closed.
    let _ = rx.wait_for(|state| *state == ConnectionState::Closed).await;
}

async fn drive(
    url: String,
    state: Arc<watch::Sender<ConnectionState>>,
    mut outbound: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
    sink: PredictionSink,
    metrics: Arc<Metrics>,
) {
    let builder = match ClientBuilder::new().uri(&url) {
        Ok(builder) => builder,
        Err(e) => {
            tracing::error!("WS error: invalid URI {}: {}", url, e);
            transition(&state, ConnectionState::Closed);
            return;
        }
    };

    let connected = tokio::select! {
        _ = cancel.cancelled() => {
            transition(&state, ConnectionState::Closed);
            return;
        }
        result = builder.connect() => result,
    };

    let mut ws = match connected {
        Ok((ws, _response)) => ws,
        Err(e) => {
            tracing::error!("WS error: failed to connect to {}: {}", url, e);
            transition(&state, ConnectionState::Closed);
            return;
        }
    };

    if !transition(&state, ConnectionState::Open) {
        let _ = ws.close().await;
        return;
    }
    tracing::info!("WS connected to {}", url);

    let (mut write, mut read) = ws.split();
    let mut closed_locally = false;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                closed_locally = true;
                break;
            }
            message = read.next() => match message {
                Some(Ok(msg)) if msg.is_text() => {
                    if let Some(text) = msg.as_text() {
                        on_message(text, &sink, &metrics);
                    }
                }
                Some(Ok(msg)) if msg.is_binary() => {
                    let len = msg.as_payload().len();
                    tracing::error!("{}", MessageError::UnexpectedBinary(len));
                    metrics.record_malformed_message();
                }
                Some(Ok(msg)) if msg.is_close() => {
                    tracing::info!("WS disconnected by peer: {:?}", msg.as_close());
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::error!("WS error: {}", e);
                    break;
                }
                None => {
                    tracing::info!("WS disconnected");
                    break;
                }
            },
            Some(payload) = outbound.recv() => {
                let len = payload.len();
                // A peer that stops reading must not block teardown.
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        tracing::warn!("Abandoning frame of {} bytes, connection is closing", len);
                        metrics.record_frame_dropped();
                        closed_locally = true;
                        break;
                    }
                    result = write.send(Message::binary(payload)) => {
                        if let Err(e) = result {
                            tracing::error!("WS error: failed to send frame: {}", e);
                            break;
                        }
                    }
                }
                metrics.record_frame_sent();
                tracing::debug!("Sent frame of {} bytes", len);
            }
        }
    }

    transition(&state, ConnectionState::Closed);
    let goodbye = async {
        if closed_locally {
            write.send(Message::close(None, "")).await?;
        }
        write.close().await
    };
    match timeout(CLOSE_TIMEOUT, goodbye).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::debug!("Failed to close connection cleanly: {}", e),
        Err(_) => tracing::warn!(
            "Peer did not take the close frame within {} ms",
            CLOSE_TIMEOUT.as_millis()
        ),
    }
    tracing::info!("Connection to {} closed", url);
}

/// Parses one inbound text message and publishes it. Malformed messages are
/// logged and dropped; they never affect the connection.
pub fn on_message(raw: &str, sink: &PredictionSink, metrics: &Metrics) {
    match decode_message(raw) {
        Ok(PeerMessage::Prediction(prediction)) => {
            if !prediction.confidence_in_range() {
                tracing::warn!("Confidence {} is outside [0, 1]", prediction.confidence);
            }
            tracing::debug!(
                "Prediction: is_violent={}, confidence={:.3}",
                prediction.is_violent,
                prediction.confidence
            );
            metrics.record_prediction(&prediction);
            sink.update(prediction);
        }
        Ok(PeerMessage::Buffering { frames_buffered }) => {
            tracing::debug!("Peer buffering frames: {}", frames_buffered);
        }
        Err(e) => {
            let excerpt: String = raw.chars().take(LOGGED_PAYLOAD_CHARS).collect();
            tracing::error!("{}: {:?}", e, excerpt);
            metrics.record_malformed_message();
        }
    }
}

/// Clonable write-only handle to a [`PredictionChannel`].
#[derive(Debug, Clone)]
pub struct FrameSender {
    state: watch::Receiver<ConnectionState>,
    outbound: mpsc::Sender<Bytes>,
    metrics: Arc<Metrics>,
}

#[async_trait]
impl FrameTransport for FrameSender {
    fn send(&self, frame: EncodedFrame) {
        let state = *self.state.borrow();
        if state != ConnectionState::Open {
            tracing::debug!(
                "Dropping frame of {} bytes, connection is {}",
                frame.len(),
                state
            );
            self.metrics.record_frame_dropped();
            return;
        }
        match self.outbound.try_send(frame.into_bytes()) {
            Ok(()) => {}
            Err(TrySendError::Full(payload)) => {
                tracing::debug!("Dropping frame of {} bytes, peer is behind", payload.len());
                self.metrics.record_frame_dropped();
            }
            Err(TrySendError::Closed(_)) => self.metrics.record_frame_dropped(),
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    async fn closed(&self) {
        wait_closed(self.state.clone()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prediction::Prediction;

    fn sender_in(
        state: ConnectionState,
    ) -> (
        watch::Sender<ConnectionState>,
        FrameSender,
        mpsc::Receiver<Bytes>,
        Arc<Metrics>,
    ) {
        let (state_tx, state_rx) = watch::channel(state);
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let metrics = Arc::new(Metrics::new().unwrap());
        let sender = FrameSender {
            state: state_rx,
            outbound,
            metrics: metrics.clone(),
        };
        (state_tx, sender, outbound_rx, metrics)
    }

    #[test]
    fn test_transition_rules() {
        let (state, _) = watch::channel(ConnectionState::Connecting);

        assert!(!transition(&state, ConnectionState::Connecting));
        assert!(transition(&state, ConnectionState::Open));
        assert!(!transition(&state, ConnectionState::Open));
        assert!(transition(&state, ConnectionState::Closed));
        assert!(!transition(&state, ConnectionState::Open));
        assert!(!transition(&state, ConnectionState::Connecting));
        assert!(!transition(&state, ConnectionState::Closed));
        assert_eq!(*state.borrow(), ConnectionState::Closed);
    }

    #[test]
    fn test_connecting_can_close_without_opening() {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        assert!(transition(&state, ConnectionState::Closed));
        assert!(!transition(&state, ConnectionState::Open));
    }

    #[test]
    fn test_send_while_connecting_is_noop() {
        let (_state, sender, mut outbound, metrics) = sender_in(ConnectionState::Connecting);
        sender.send(EncodedFrame::new(vec![1, 2, 3]));

        assert!(outbound.try_recv().is_err());
        assert_eq!(metrics.frames_dropped(), 1);
    }

    #[test]
    fn test_send_while_closed_is_noop() {
        let (_state, sender, mut outbound, metrics) = sender_in(ConnectionState::Closed);
        sender.send(EncodedFrame::new(vec![1, 2, 3]));

        assert!(outbound.try_recv().is_err());
        assert_eq!(metrics.frames_dropped(), 1);
    }

    #[test]
    fn test_send_while_open_queues_payload() {
        let (_state, sender, mut outbound, metrics) = sender_in(ConnectionState::Open);
        sender.send(EncodedFrame::new(vec![0xFF, 0xD8, 0xFF]));

        assert_eq!(outbound.try_recv().unwrap(), Bytes::from_static(&[0xFF, 0xD8, 0xFF]));
        assert_eq!(metrics.frames_dropped(), 0);
    }

    #[test]
    fn test_send_drops_frames_while_peer_is_behind() {
        let (_state, sender, mut outbound, metrics) = sender_in(ConnectionState::Open);
        for byte in 0..3u8 {
            sender.send(EncodedFrame::new(vec![byte]));
        }

        assert_eq!(outbound.try_recv().unwrap(), Bytes::from_static(&[0]));
        assert!(outbound.try_recv().is_err());
        assert_eq!(metrics.frames_dropped(), 2);
    }

    #[test]
    fn test_send_follows_state_changes() {
        let (state, sender, mut outbound, _metrics) = sender_in(ConnectionState::Open);
        sender.send(EncodedFrame::new(vec![1]));
        state.send_replace(ConnectionState::Closed);
        sender.send(EncodedFrame::new(vec![2]));

        assert_eq!(outbound.try_recv().unwrap(), Bytes::from_static(&[1]));
        assert!(outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closed_resolves_on_close() {
        let (state, sender, _outbound, _metrics) = sender_in(ConnectionState::Open);
        let waiter = tokio::spawn(async move { sender.closed().await });
        state.send_replace(ConnectionState::Closed);
        waiter.await.unwrap();
    }

    #[test]
    fn test_on_message_updates_sink() {
        let sink = PredictionSink::new();
        let metrics = Metrics::new().unwrap();

        on_message(r#"{"isViolent":true,"confidence":0.92}"#, &sink, &metrics);

        assert_eq!(sink.current(), Prediction::new(true, 0.92));
        assert_eq!(metrics.predictions_received(), 1);
    }

    #[test]
    fn test_on_message_discards_malformed() {
        let sink = PredictionSink::new();
        let metrics = Metrics::new().unwrap();
        sink.update(Prediction::new(true, 0.6));

        for raw in ["not json", "{}", r#"{"isViolent":1,"confidence":0.5}"#] {
            on_message(raw, &sink, &metrics);
        }

        assert_eq!(sink.current(), Prediction::new(true, 0.6));
        assert_eq!(metrics.malformed_messages(), 3);
    }

    #[test]
    fn test_on_message_ignores_buffering_progress() {
        let sink = PredictionSink::new();
        let metrics = Metrics::new().unwrap();

        on_message(r#"{"framesBuffered":3}"#, &sink, &metrics);

        assert_eq!(sink.current(), Prediction::default());
        assert_eq!(metrics.malformed_messages(), 0);
        assert_eq!(metrics.predictions_received(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_peer_closes_before_open() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let channel =
            PredictionChannel::connect("ws://127.0.0.1:1/ws", PredictionSink::new(), metrics);

        assert_eq!(channel.opened().await, Err(ChannelError::ClosedBeforeOpen));
        assert_eq!(channel.state(), ConnectionState::Closed);

        channel.sender().send(EncodedFrame::new(vec![1]));
        channel.close();
        channel.close();
        channel.shutdown().await;
    }
}
