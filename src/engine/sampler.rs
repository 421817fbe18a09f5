//! Position sampler: turns raw provider fixes into queued samples.
//!
//! Pure in-memory state machine, driven by the engine's sampler task. It
//! never touches storage or the network, so nothing here can stall the
//! provider's callback path.

use std::time::Duration;

use crate::config::SamplerConfig;
use crate::geo::haversine_m;
use crate::models::LocationSample;
use crate::provider::RawFix;

struct AcceptedFix {
    latitude: f64,
    longitude: f64,
    elapsed_ms: i64,
}

/// Adaptive-cadence sampler for one local entity.
///
/// Fixes with an accuracy radius above the configured threshold are
/// discarded as noise. Between accepted fixes the sampler enforces an
/// interval: dense while the estimated speed is above the movement
/// threshold, sparse otherwise, to conserve battery when stationary.
pub struct PositionSampler {
    entity_id: String,
    config: SamplerConfig,
    next_sequence: i64,
    last_accepted: Option<AcceptedFix>,
    active_interval: Duration,
}

impl PositionSampler {
    /// `last_sequence` is the highest sequence number already produced for
    /// this entity (0 if none); sequences continue from there so they keep
    /// increasing across restarts.
    pub fn new(entity_id: impl Into<String>, config: SamplerConfig, last_sequence: i64) -> Self {
        // Start dense so a freshly started tracker reports promptly; the
        // cadence adapts once a speed estimate exists.
        let active_interval = Duration::from_secs(config.dense_interval_secs);
        Self {
            entity_id: entity_id.into(),
            config,
            next_sequence: last_sequence + 1,
            last_accepted: None,
            active_interval,
        }
    }

    /// Processes one raw fix. Returns the sample to enqueue, or `None` when
    /// the fix is filtered out (noise or inside the cadence interval) —
    /// a discard, not an error.
    pub fn sample(&mut self, fix: RawFix) -> Option<LocationSample> {
        if fix.accuracy_m > self.config.accuracy_threshold_m {
            tracing::debug!(
                entity_id = %self.entity_id,
                accuracy_m = fix.accuracy_m,
                "discarding low-accuracy fix"
            );
            return None;
        }

        if let Some(last) = &self.last_accepted {
            let dt_ms = fix.elapsed_ms - last.elapsed_ms;
            if dt_ms < self.active_interval.as_millis() as i64 {
                return None;
            }

            // Estimate speed since the last accepted fix and adapt the
            // interval for the next one.
            let distance_m =
                haversine_m(last.latitude, last.longitude, fix.latitude, fix.longitude);
            let speed_mps = distance_m / (dt_ms as f64 / 1000.0);
            self.active_interval = if speed_mps >= self.config.speed_threshold_mps {
                Duration::from_secs(self.config.dense_interval_secs)
            } else {
                Duration::from_secs(self.config.sparse_interval_secs)
            };
        }

        self.last_accepted = Some(AcceptedFix {
            latitude: fix.latitude,
            longitude: fix.longitude,
            elapsed_ms: fix.elapsed_ms,
        });

        let sequence_no = self.next_sequence;
        self.next_sequence += 1;

        Some(
            LocationSample::new(
                self.entity_id.clone(),
                fix.latitude,
                fix.longitude,
                fix.accuracy_m,
                sequence_no,
            )
            .with_captured_at(fix.captured_at)
            .with_elapsed_ms(fix.elapsed_ms),
        )
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }
}
