//! Device location provider boundary.
//!
//! The real provider is a platform service that pushes raw fixes into the
//! engine through [`FixSender`]; the engine never calls out to it. A
//! [`SimulatedProvider`] is included for the CLI demo mode and tests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

/// A raw position fix as delivered by the device's location service,
/// before filtering or sequence assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawFix {
    pub latitude: f64,
    pub longitude: f64,
    /// Reported accuracy radius in metres.
    pub accuracy_m: f64,
    pub captured_at: DateTime<Utc>,
    /// Monotonic elapsed-realtime at capture, milliseconds.
    pub elapsed_ms: i64,
}

impl RawFix {
    pub fn new(latitude: f64, longitude: f64, accuracy_m: f64, elapsed_ms: i64) -> Self {
        Self {
            latitude,
            longitude,
            accuracy_m,
            captured_at: Utc::now(),
            elapsed_ms,
        }
    }
}

/// Handle given to a location provider for pushing fixes into the engine.
///
/// `push` never blocks: if the engine is backed up the fix is dropped and
/// logged, matching the rule that nothing may stall the provider's
/// callback path.
#[derive(Clone)]
pub struct FixSender {
    tx: mpsc::Sender<RawFix>,
}

impl FixSender {
    pub fn push(&self, fix: RawFix) {
        if let Err(e) = self.tx.try_send(fix) {
            tracing::debug!("fix dropped, engine busy: {}", e);
        }
    }
}

/// Creates the channel between a provider and the engine's sampler task.
pub fn fix_channel(buffer: usize) -> (FixSender, mpsc::Receiver<RawFix>) {
    let (tx, rx) = mpsc::channel(buffer);
    (FixSender { tx }, rx)
}

/// Generates fixes along a straight track at a fixed speed, for demos and
/// tests where no device location service exists.
pub struct SimulatedProvider {
    pub start_lat: f64,
    pub start_lon: f64,
    /// Degrees of latitude advanced per fix.
    pub step_deg: f64,
    pub accuracy_m: f64,
    pub interval: Duration,
    pub count: usize,
}

impl Default for SimulatedProvider {
    fn default() -> Self {
        Self {
            start_lat: 52.5200,
            start_lon: 13.4050,
            step_deg: 0.0005,
            accuracy_m: 10.0,
            interval: Duration::from_secs(1),
            count: 60,
        }
    }
}

impl SimulatedProvider {
    /// Pushes `count` fixes into the sender, then returns.
    pub async fn run(self, sender: FixSender) {
        let mut elapsed_ms = 0i64;
        for i in 0..self.count {
            let fix = RawFix::new(
                self.start_lat + self.step_deg * i as f64,
                self.start_lon,
                self.accuracy_m,
                elapsed_ms,
            );
            sender.push(fix);
            elapsed_ms += self.interval.as_millis() as i64;
            tokio::time::sleep(self.interval).await;
        }
    }
}
