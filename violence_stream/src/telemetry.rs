use crate::prediction::Prediction;
use prometheus::{Gauge, Histogram, HistogramOpts, IntCounter, Registry};
use std::collections::HashSet;

/// Pipeline counters exported on `/metrics`.
pub struct Metrics {
    frames_captured: IntCounter,
    frames_sent: IntCounter,
    frames_dropped: IntCounter,
    capture_failures: IntCounter,
    encode_failures: IntCounter,
    encode_duration: Histogram,
    predictions_received: IntCounter,
    malformed_messages: IntCounter,
    prediction_confidence: Gauge,
    prediction_violent: Gauge,
    pub registry: Registry,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("frames_sent", &self.frames_sent.get())
            .field("predictions_received", &self.predictions_received.get())
            .finish_non_exhaustive()
    }
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("violence_stream".into()), None)?;

        let frames_captured =
            IntCounter::new("frames_captured_total", "Frames read from the source")?;
        let frames_sent = IntCounter::new("frames_sent_total", "Frames written to the peer")?;
        let frames_dropped = IntCounter::new(
            "frames_dropped_total",
            "Encoded frames discarded because the channel was not open",
        )?;
        let capture_failures =
            IntCounter::new("capture_failures_total", "Ticks abandoned on a capture error")?;
        let encode_failures =
            IntCounter::new("encode_failures_total", "Ticks abandoned on an encoding error")?;

        let boundaries = generate_boundaries((1, 11, 21, 101, 501));
        let encode_duration = Histogram::with_opts(
            HistogramOpts::new("encode_duration_ms", "Duration of JPEG encoding in milliseconds")
                .buckets(boundaries),
        )?;

        let predictions_received = IntCounter::new(
            "predictions_received_total",
            "Classifications received from the peer",
        )?;
        let malformed_messages = IntCounter::new(
            "malformed_messages_total",
            "Inbound messages discarded as malformed",
        )?;
        let prediction_confidence =
            Gauge::new("prediction_confidence", "Confidence of the latest classification")?;
        let prediction_violent = Gauge::new(
            "prediction_violent",
            "1 when the latest classification is violent, 0 otherwise",
        )?;

        registry.register(Box::new(frames_captured.clone()))?;
        registry.register(Box::new(frames_sent.clone()))?;
        registry.register(Box::new(frames_dropped.clone()))?;
        registry.register(Box::new(capture_failures.clone()))?;
        registry.register(Box::new(encode_failures.clone()))?;
        registry.register(Box::new(encode_duration.clone()))?;
        registry.register(Box::new(predictions_received.clone()))?;
        registry.register(Box::new(malformed_messages.clone()))?;
        registry.register(Box::new(prediction_confidence.clone()))?;
        registry.register(Box::new(prediction_violent.clone()))?;

        Ok(Metrics {
            frames_captured,
            frames_sent,
            frames_dropped,
            capture_failures,
            encode_failures,
            encode_duration,
            predictions_received,
            malformed_messages,
            prediction_confidence,
            prediction_violent,
            registry,
        })
    }

    pub fn record_frame_captured(&self) {
        self.frames_captured.inc();
    }

    pub fn record_frame_sent(&self) {
        self.frames_sent.inc();
    }

    pub fn record_frame_dropped(&self) {
        self.frames_dropped.inc();
    }

    pub fn record_capture_failure(&self) {
        self.capture_failures.inc();
    }

    pub fn record_encode_failure(&self) {
        self.encode_failures.inc();
    }

    pub fn record_encode_duration(&self, duration_ms: f64) {
        self.encode_duration.observe(duration_ms);
    }

    pub fn record_prediction(&self, prediction: &Prediction) {
        self.predictions_received.inc();
        self.prediction_confidence.set(prediction.confidence);
        self.prediction_violent
            .set(if prediction.is_violent { 1.0 } else { 0.0 });
    }

    pub fn record_malformed_message(&self) {
        self.malformed_messages.inc();
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.get()
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.get()
    }

    pub fn encode_failures(&self) -> u64 {
        self.encode_failures.get()
    }

    pub fn malformed_messages(&self) -> u64 {
        self.malformed_messages.get()
    }

    pub fn predictions_received(&self) -> u64 {
        self.predictions_received.get()
    }
}

fn generate_boundaries(parts: (i32, i32, i32, i32, i32)) -> Vec<f64> {
    let first_step: usize = 2;
    let middle_step: usize = 5;
    let end_step: usize = 20;
    let tail_step: usize = 100;
    let first_part = (parts.0..=parts.1).step_by(first_step);
    let middle_part = (parts.1..=parts.2).step_by(middle_step);
    let end_part = (parts.2..=parts.3).step_by(end_step);
    let tail_part = (parts.3..=parts.4).step_by(tail_step);

    let mut seen = HashSet::new();
    first_part
        .chain(middle_part)
        .chain(end_part)
        .chain(tail_part)
        .filter(|&x| seen.insert(x))
        .map(|x| x as f64)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_boundaries() {
        let parts = (1, 5, 15, 55, 255);
        let get = generate_boundaries(parts);
        let expected = vec![1.0, 3.0, 5.0, 10.0, 15.0, 35.0, 55.0, 155.0, 255.0];

        assert_eq!(get, expected);
    }

    #[test]
    fn test_record_prediction_updates_gauges() {
        let metrics = Metrics::new().unwrap();
        metrics.record_prediction(&Prediction::new(true, 0.92));

        assert_eq!(metrics.predictions_received(), 1);
        assert_eq!(metrics.prediction_confidence.get(), 0.92);
        assert_eq!(metrics.prediction_violent.get(), 1.0);
    }

    #[test]
    fn test_registry_exports_counters() {
        let metrics = Metrics::new().unwrap();
        metrics.record_frame_sent();
        metrics.record_frame_sent();

        let families = metrics.registry.gather();
        let sent = families
            .iter()
            .find(|family| family.get_name() == "violence_stream_frames_sent_total")
            .unwrap();
        assert_eq!(sent.get_metric()[0].get_counter().get_value(), 2.0);
    }
}
