//! Conflict resolution for tracked entities.
//!
//! Policy: last-writer-wins by the entity's own monotonic sequence number.
//! Wall-clock arrival order is never consulted, so network delay cannot
//! reorder one entity's stream. Updates to different entities are
//! independent.

use chrono::Utc;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::db::EntityRepository;
use crate::models::{LocationSample, TrackedEntity};

/// Result of merging a remote sample into local entity state.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    /// The remote sample superseded local state; version was bumped.
    Applied(TrackedEntity),
    /// The remote sample is not newer than what we hold. Explicit no-op,
    /// not an error.
    Stale,
}

/// Pure, deterministic merge. Re-applying the same sample to its own
/// result yields `Stale`, which makes duplicate delivery harmless.
///
/// The version increments exactly when the remote sequence number is
/// strictly newer; an equal sequence number can only be a duplicate of a
/// sample we already hold (sequences are strictly increasing per entity).
pub fn merge(local: Option<&TrackedEntity>, remote: &LocationSample) -> MergeOutcome {
    match local {
        None => MergeOutcome::Applied(TrackedEntity::first(remote.clone())),
        Some(local) => {
            if remote.sequence_no > local.last_sample.sequence_no {
                MergeOutcome::Applied(TrackedEntity {
                    entity_id: local.entity_id.clone(),
                    last_sample: remote.clone(),
                    version: local.version + 1,
                    last_synced_at: local.last_synced_at,
                })
            } else {
                MergeOutcome::Stale
            }
        }
    }
}

/// Entity cache with serialized access per entity id.
///
/// A given entity's state has a single writer at a time; distinct entities
/// resolve concurrently. Commits go through the persisted repository so the
/// cache survives restarts.
pub struct EntityStore {
    repo: EntityRepository,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl EntityStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            repo: EntityRepository::new(pool),
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, entity_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().expect("entity lock map poisoned");
        locks
            .entry(entity_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Merges a remote sample and commits the result if it was newer.
    /// Returns the committed entity, or `None` for a stale update.
    pub async fn apply_remote(
        &self,
        sample: &LocationSample,
    ) -> Result<Option<TrackedEntity>, sqlx::Error> {
        let lock = self.lock_for(&sample.entity_id);
        let _guard = lock.lock().await;

        let local = self.repo.get(&sample.entity_id).await?;
        match merge(local.as_ref(), sample) {
            MergeOutcome::Applied(mut entity) => {
                entity.last_synced_at = Some(Utc::now());
                self.repo.upsert(&entity).await?;
                Ok(Some(entity))
            }
            MergeOutcome::Stale => {
                tracing::debug!(
                    entity_id = %sample.entity_id,
                    sequence_no = sample.sequence_no,
                    "stale remote update discarded"
                );
                Ok(None)
            }
        }
    }

    pub async fn get(&self, entity_id: &str) -> Result<Option<TrackedEntity>, sqlx::Error> {
        self.repo.get(entity_id).await
    }

    pub async fn list(&self) -> Result<Vec<TrackedEntity>, sqlx::Error> {
        self.repo.list().await
    }

    pub async fn max_sequence_for(&self, entity_id: &str) -> Result<Option<i64>, sqlx::Error> {
        self.repo.max_sequence_for(entity_id).await
    }
}
