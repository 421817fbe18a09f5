use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::sample::LocationSample;

/// Delivery state of a queued sample.
///
/// Legal transitions: `Pending -> InFlight -> Acknowledged`, with
/// `InFlight -> Pending` on a failed attempt and `-> Parked` once the
/// attempt ceiling is reached. `Acknowledged` and `Parked` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckState {
    Pending,
    InFlight,
    Acknowledged,
    Parked,
}

impl AckState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckState::Pending => "pending",
            AckState::InFlight => "in_flight",
            AckState::Acknowledged => "acknowledged",
            AckState::Parked => "parked",
        }
    }

    /// Parse from the string form stored in sqlite.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(AckState::Pending),
            "in_flight" => Some(AckState::InFlight),
            "acknowledged" => Some(AckState::Acknowledged),
            "parked" => Some(AckState::Parked),
            _ => None,
        }
    }
}

/// A sample sitting in the local durable queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueRecord {
    pub id: i64,
    pub sample: LocationSample,
    pub enqueued_at: DateTime<Utc>,
    pub attempt_count: i64,
    pub ack_state: AckState,
    /// Set when the record was last marked in-flight; drives the
    /// resumption timeout after an unclean shutdown.
    pub dispatched_at: Option<DateTime<Utc>>,
}
