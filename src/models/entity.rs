use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::sample::LocationSample;

/// Resolved state for one tracked entity (device, person, vehicle).
///
/// Mutated only by the conflict resolver; `version` is a per-entity logical
/// clock and never decreases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedEntity {
    pub entity_id: String,
    pub last_sample: LocationSample,
    pub version: i64,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl TrackedEntity {
    /// State for an entity seen for the first time.
    pub fn first(sample: LocationSample) -> Self {
        Self {
            entity_id: sample.entity_id.clone(),
            last_sample: sample,
            version: 1,
            last_synced_at: None,
        }
    }
}

impl fmt::Display for TrackedEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} v{} {}", self.entity_id, self.version, self.last_sample)
    }
}
