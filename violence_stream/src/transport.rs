use crate::frame::EncodedFrame;
use async_trait::async_trait;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outbound half of a connection to the inference peer, as seen by the
/// capture scheduler.
#[async_trait]
pub trait FrameTransport: Send + Sync + Clone + 'static {
    /// Fire-and-forget. Does nothing unless the connection is open.
    fn send(&self, frame: EncodedFrame);

    fn state(&self) -> ConnectionState;

    /// Resolves once the connection has reached `Closed`.
    async fn closed(&self);
}
