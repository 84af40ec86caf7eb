use crate::prediction::Prediction;
use std::sync::Arc;
use tokio::sync::watch;

/// Latest classification received from the peer.
///
/// Every update replaces the held value and wakes all subscribers, even when
/// the new value equals the old one.
#[derive(Debug, Clone)]
pub struct PredictionSink {
    tx: Arc<watch::Sender<Prediction>>,
}

impl Default for PredictionSink {
    fn default() -> Self {
        Self::new()
    }
}

impl PredictionSink {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Prediction::default());
        Self { tx: Arc::new(tx) }
    }

    pub fn update(&self, prediction: Prediction) {
        self.tx.send_replace(prediction);
    }

    pub fn current(&self) -> Prediction {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Prediction> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_value() {
        let sink = PredictionSink::new();
        assert_eq!(sink.current(), Prediction::new(false, 0.0));
    }

    #[test]
    fn test_update_overwrites() {
        let sink = PredictionSink::new();
        sink.update(Prediction::new(true, 0.92));
        sink.update(Prediction::new(false, 0.4));
        assert_eq!(sink.current(), Prediction::new(false, 0.4));
    }

    #[tokio::test]
    async fn test_identical_update_notifies_subscribers() {
        let sink = PredictionSink::new();
        let mut rx = sink.subscribe();

        sink.update(Prediction::default());
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), Prediction::default());

        sink.update(Prediction::new(true, 0.7));
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), Prediction::new(true, 0.7));
    }

    #[test]
    fn test_clones_share_the_slot() {
        let sink = PredictionSink::new();
        let other = sink.clone();
        other.update(Prediction::new(true, 1.0));
        assert_eq!(sink.current(), Prediction::new(true, 1.0));
    }
}
