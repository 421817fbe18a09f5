//! Subscription fan-out: delivers committed entity state to local observers.
//!
//! Observers register a callback per entity id. Delivery for one entity
//! follows commit order; no ordering holds across entities. A panicking
//! observer is isolated (logged and dropped) and never prevents delivery to
//! the rest.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::models::TrackedEntity;

/// Opaque handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(Uuid);

type Callback = Arc<dyn Fn(&TrackedEntity) + Send + Sync>;

#[derive(Default)]
pub struct SubscriptionFanout {
    subscribers: Mutex<HashMap<String, Vec<(SubscriptionToken, Callback)>>>,
}

impl SubscriptionFanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        &self,
        entity_id: impl Into<String>,
        callback: impl Fn(&TrackedEntity) + Send + Sync + 'static,
    ) -> SubscriptionToken {
        let token = SubscriptionToken(Uuid::new_v4());
        let mut subscribers = self.subscribers.lock().expect("subscriber table poisoned");
        subscribers
            .entry(entity_id.into())
            .or_default()
            .push((token, Arc::new(callback)));
        token
    }

    pub fn unsubscribe(&self, token: &SubscriptionToken) {
        let mut subscribers = self.subscribers.lock().expect("subscriber table poisoned");
        for list in subscribers.values_mut() {
            list.retain(|(t, _)| t != token);
        }
        subscribers.retain(|_, list| !list.is_empty());
    }

    /// Delivers a committed entity to every subscriber for its id.
    pub fn publish(&self, entity: &TrackedEntity) {
        // Snapshot outside the lock so a callback may subscribe/unsubscribe
        // without deadlocking.
        let targets: Vec<(SubscriptionToken, Callback)> = {
            let subscribers = self.subscribers.lock().expect("subscriber table poisoned");
            match subscribers.get(&entity.entity_id) {
                Some(list) => list.clone(),
                None => return,
            }
        };

        let mut failed = Vec::new();
        for (token, callback) in &targets {
            if catch_unwind(AssertUnwindSafe(|| callback(entity))).is_err() {
                tracing::warn!(
                    entity_id = %entity.entity_id,
                    "subscriber panicked during delivery, dropping it"
                );
                failed.push(*token);
            }
        }

        for token in failed {
            self.unsubscribe(&token);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        let subscribers = self.subscribers.lock().expect("subscriber table poisoned");
        subscribers.values().map(Vec::len).sum()
    }
}
