use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One timestamped position observation for an entity.
///
/// Immutable once created. The sampler owns a sample until it is enqueued;
/// after that the queue owns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    pub entity_id: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Reported accuracy radius in metres.
    pub accuracy_m: f64,
    /// Wall-clock capture time.
    pub captured_at: DateTime<Utc>,
    /// Monotonic elapsed-realtime at capture, in milliseconds. Survives
    /// wall-clock adjustments on the device.
    pub captured_elapsed_ms: i64,
    /// Strictly increasing per entity as produced locally.
    pub sequence_no: i64,
}

impl LocationSample {
    pub fn new(
        entity_id: impl Into<String>,
        latitude: f64,
        longitude: f64,
        accuracy_m: f64,
        sequence_no: i64,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            latitude,
            longitude,
            accuracy_m,
            captured_at: Utc::now(),
            captured_elapsed_ms: 0,
            sequence_no,
        }
    }

    pub fn with_captured_at(mut self, captured_at: DateTime<Utc>) -> Self {
        self.captured_at = captured_at;
        self
    }

    pub fn with_elapsed_ms(mut self, elapsed_ms: i64) -> Self {
        self.captured_elapsed_ms = elapsed_ms;
        self
    }
}

impl fmt::Display for LocationSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{} ({:.6}, {:.6}) ±{:.0}m @ {}",
            self.entity_id,
            self.sequence_no,
            self.latitude,
            self.longitude,
            self.accuracy_m,
            self.captured_at.to_rfc3339()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let sample = LocationSample::new("van-1", 52.52, 13.405, 12.0, 1);
        assert_eq!(sample.entity_id, "van-1");
        assert_eq!(sample.sequence_no, 1);
        assert_eq!(sample.captured_elapsed_ms, 0);
    }

    #[test]
    fn test_serde_roundtrip() {
        let sample = LocationSample::new("van-1", 52.52, 13.405, 12.0, 7).with_elapsed_ms(88_000);
        let json = serde_json::to_string(&sample).unwrap();
        let back: LocationSample = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sample);
    }
}
