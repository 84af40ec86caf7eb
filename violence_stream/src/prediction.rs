use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification emitted by the inference peer.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prediction {
    pub is_violent: bool,
    pub confidence: f64,
}

impl Prediction {
    pub fn new(is_violent: bool, confidence: f64) -> Self {
        Self {
            is_violent,
            confidence,
        }
    }

    pub fn label(&self) -> &'static str {
        if self.is_violent {
            "Violent"
        } else {
            "Safe"
        }
    }

    pub fn confidence_in_range(&self) -> bool {
        (0.0..=1.0).contains(&self.confidence)
    }
}

/// Text messages the peer may send.
///
/// The peer reports `framesBuffered` until its sequence window is full and
/// only then starts sending classifications.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum PeerMessage {
    Prediction(Prediction),
    #[serde(rename_all = "camelCase")]
    Buffering { frames_buffered: u32 },
}

#[derive(Error, Debug)]
pub enum MessageError {
    #[error("Invalid JSON message: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("Unexpected binary message of {0} bytes")]
    UnexpectedBinary(usize),
}

pub fn decode_message(raw: &str) -> Result<PeerMessage, MessageError> {
    Ok(serde_json::from_str(raw)?)
}
