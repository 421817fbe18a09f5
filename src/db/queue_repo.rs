//! Local durable queue for location samples.
//!
//! Samples are buffered here until the sync coordinator acknowledges them
//! against the backend, so nothing is lost across network outages or process
//! restarts. The queue is capacity-bounded: on overflow the oldest
//! `acknowledged` records are evicted first, then the oldest `pending` ones,
//! and the caller is told how many of each so the loss is never silent.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::SqlitePool;
use std::time::Duration;

use crate::models::{AckState, LocationSample, QueueRecord};

pub struct QueueRepository {
    pool: SqlitePool,
    capacity: i64,
}

// Row type for database queries
#[derive(sqlx::FromRow)]
struct QueueRow {
    id: i64,
    entity_id: String,
    latitude: f64,
    longitude: f64,
    accuracy_m: f64,
    captured_at: String,
    captured_elapsed_ms: i64,
    sequence_no: i64,
    enqueued_at: String,
    attempt_count: i64,
    ack_state: String,
    dispatched_at: Option<String>,
}

impl QueueRow {
    /// Decode into a `QueueRecord`. Returns `None` for a corrupt row
    /// (unparseable timestamp or state), which the caller isolates.
    fn decode(self) -> Option<QueueRecord> {
        let captured_at = parse_ts(&self.captured_at)?;
        let enqueued_at = parse_ts(&self.enqueued_at)?;
        let dispatched_at = match &self.dispatched_at {
            Some(s) => Some(parse_ts(s)?),
            None => None,
        };
        let ack_state = AckState::parse(&self.ack_state)?;

        Some(QueueRecord {
            id: self.id,
            sample: LocationSample {
                entity_id: self.entity_id,
                latitude: self.latitude,
                longitude: self.longitude,
                accuracy_m: self.accuracy_m,
                captured_at,
                captured_elapsed_ms: self.captured_elapsed_ms,
                sequence_no: self.sequence_no,
            },
            enqueued_at,
            attempt_count: self.attempt_count,
            ack_state,
            dispatched_at,
        })
    }
}

fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// How many records the capacity bound pushed out, by prior state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Eviction {
    pub acknowledged: u64,
    pub pending: u64,
}

impl Eviction {
    pub fn total(&self) -> u64 {
        self.acknowledged + self.pending
    }
}

/// Result of an enqueue, including any eviction it forced.
#[derive(Debug)]
pub struct EnqueueOutcome {
    pub record: QueueRecord,
    pub eviction: Option<Eviction>,
}

/// Per-state record counts, for status reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub pending: i64,
    pub in_flight: i64,
    pub acknowledged: i64,
    pub parked: i64,
}

impl QueueRepository {
    pub fn new(pool: SqlitePool, capacity: i64) -> Self {
        Self { pool, capacity }
    }

    /// Inserts a sample as `pending`, then enforces the capacity bound.
    pub async fn enqueue(&self, sample: &LocationSample) -> Result<EnqueueOutcome, sqlx::Error> {
        let enqueued_at = Utc::now();

        let result = sqlx::query(
            r#"
            INSERT INTO queue_records
                (entity_id, latitude, longitude, accuracy_m, captured_at,
                 captured_elapsed_ms, sequence_no, enqueued_at, attempt_count, ack_state)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, 'pending')
            "#,
        )
        .bind(&sample.entity_id)
        .bind(sample.latitude)
        .bind(sample.longitude)
        .bind(sample.accuracy_m)
        .bind(sample.captured_at.to_rfc3339())
        .bind(sample.captured_elapsed_ms)
        .bind(sample.sequence_no)
        .bind(enqueued_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        let eviction = self.enforce_capacity().await?;

        Ok(EnqueueOutcome {
            record: QueueRecord {
                id,
                sample: sample.clone(),
                enqueued_at,
                attempt_count: 0,
                ack_state: AckState::Pending,
                dispatched_at: None,
            },
            eviction,
        })
    }

    /// Evicts oldest `acknowledged` records first, then oldest `pending`,
    /// until the queue fits its capacity again. `in_flight` and `parked`
    /// records are never evicted.
    async fn enforce_capacity(&self) -> Result<Option<Eviction>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM queue_records")
            .fetch_one(&mut *tx)
            .await?;

        if count <= self.capacity {
            tx.commit().await?;
            return Ok(None);
        }

        let mut overflow = count - self.capacity;

        let acked = sqlx::query(
            r#"
            DELETE FROM queue_records WHERE id IN (
                SELECT id FROM queue_records
                WHERE ack_state = 'acknowledged'
                ORDER BY id LIMIT ?
            )
            "#,
        )
        .bind(overflow)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        overflow -= acked as i64;

        let pending = if overflow > 0 {
            sqlx::query(
                r#"
                DELETE FROM queue_records WHERE id IN (
                    SELECT id FROM queue_records
                    WHERE ack_state = 'pending'
                    ORDER BY id LIMIT ?
                )
                "#,
            )
            .bind(overflow)
            .execute(&mut *tx)
            .await?
            .rows_affected()
        } else {
            0
        };

        tx.commit().await?;

        Ok(Some(Eviction {
            acknowledged: acked,
            pending,
        }))
    }

    /// Returns up to `max` pending records in enqueue order. Since each
    /// entity produces strictly increasing sequence numbers, enqueue order
    /// preserves per-entity sequence order.
    ///
    /// Rows that fail to decode are deleted and logged so one corrupt record
    /// cannot block the rest of the queue.
    pub async fn peek_batch(&self, max: i64) -> Result<Vec<QueueRecord>, sqlx::Error> {
        let rows: Vec<QueueRow> = sqlx::query_as(
            "SELECT * FROM queue_records WHERE ack_state = 'pending' ORDER BY id LIMIT ?",
        )
        .bind(max)
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row.id;
            match row.decode() {
                Some(record) => records.push(record),
                None => {
                    tracing::warn!(record_id = id, "dropping corrupt queue record");
                    sqlx::query("DELETE FROM queue_records WHERE id = ?")
                        .bind(id)
                        .execute(&self.pool)
                        .await?;
                }
            }
        }
        Ok(records)
    }

    /// `pending -> in_flight`, stamping `dispatched_at`.
    pub async fn mark_in_flight(&self, ids: &[i64]) -> Result<(), sqlx::Error> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;
        for id in ids {
            sqlx::query(
                "UPDATE queue_records SET ack_state = 'in_flight', dispatched_at = ? \
                 WHERE id = ? AND ack_state = 'pending'",
            )
            .bind(&now)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// `in_flight -> acknowledged`. Idempotent: ids already acknowledged
    /// (or unknown) are no-ops.
    pub async fn ack(&self, ids: &[i64]) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        for id in ids {
            sqlx::query(
                "UPDATE queue_records SET ack_state = 'acknowledged' \
                 WHERE id = ? AND ack_state = 'in_flight'",
            )
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// `in_flight -> pending` with `attempt_count` incremented.
    pub async fn requeue(&self, ids: &[i64]) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        for id in ids {
            sqlx::query(
                "UPDATE queue_records SET ack_state = 'pending', \
                 attempt_count = attempt_count + 1, dispatched_at = NULL \
                 WHERE id = ? AND ack_state = 'in_flight'",
            )
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Parks records that exhausted their retry budget. Terminal; parked
    /// records await manual inspection and are never evicted or retried.
    pub async fn park(&self, ids: &[i64]) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        for id in ids {
            sqlx::query(
                "UPDATE queue_records SET ack_state = 'parked' \
                 WHERE id = ? AND ack_state IN ('in_flight', 'pending')",
            )
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Startup pass: in-flight records whose dispatch predates the
    /// resumption timeout were abandoned by an unclean shutdown and revert
    /// to pending. Returns how many were recovered.
    pub async fn recover(&self, resumption_timeout: Duration) -> Result<u64, sqlx::Error> {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(resumption_timeout)
                .unwrap_or_else(|_| ChronoDuration::seconds(120));

        let recovered = sqlx::query(
            "UPDATE queue_records SET ack_state = 'pending', dispatched_at = NULL \
             WHERE ack_state = 'in_flight' AND (dispatched_at IS NULL OR dispatched_at < ?)",
        )
        .bind(cutoff.to_rfc3339())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if recovered > 0 {
            tracing::info!(recovered, "reverted abandoned in-flight records to pending");
        }
        Ok(recovered)
    }

    pub async fn get(&self, id: i64) -> Result<Option<QueueRecord>, sqlx::Error> {
        let row: Option<QueueRow> = sqlx::query_as("SELECT * FROM queue_records WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.and_then(QueueRow::decode))
    }

    pub async fn counts(&self) -> Result<QueueCounts, sqlx::Error> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT ack_state, COUNT(*) FROM queue_records GROUP BY ack_state")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = QueueCounts::default();
        for (state, n) in rows {
            match AckState::parse(&state) {
                Some(AckState::Pending) => counts.pending = n,
                Some(AckState::InFlight) => counts.in_flight = n,
                Some(AckState::Acknowledged) => counts.acknowledged = n,
                Some(AckState::Parked) => counts.parked = n,
                None => {}
            }
        }
        Ok(counts)
    }

    /// Highest sequence number queued for an entity, used to seed the
    /// sampler's counter across restarts.
    pub async fn max_sequence_for(&self, entity_id: &str) -> Result<Option<i64>, sqlx::Error> {
        let row: (Option<i64>,) =
            sqlx::query_as("SELECT MAX(sequence_no) FROM queue_records WHERE entity_id = ?")
                .bind(entity_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(row.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;
    use tempfile::TempDir;

    struct TestContext {
        repo: QueueRepository,
        pool: SqlitePool,
        _temp_dir: TempDir, // Keep alive for duration of test
    }

    async fn setup(capacity: i64) -> TestContext {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let pool = init_db(db_path).await.unwrap();
        TestContext {
            repo: QueueRepository::new(pool.clone(), capacity),
            pool,
            _temp_dir: temp_dir,
        }
    }

    fn sample(entity: &str, seq: i64) -> LocationSample {
        LocationSample::new(entity, 52.52, 13.405, 10.0, seq)
    }

    #[tokio::test]
    async fn test_enqueue_and_peek() {
        let ctx = setup(100).await;

        for seq in 1..=3 {
            ctx.repo.enqueue(&sample("e1", seq)).await.unwrap();
        }

        let batch = ctx.repo.peek_batch(10).await.unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0].sample.sequence_no, 1);
        assert_eq!(batch[2].sample.sequence_no, 3);
        assert!(batch.iter().all(|r| r.ack_state == AckState::Pending));
    }

    #[tokio::test]
    async fn test_peek_preserves_per_entity_sequence_order() {
        let ctx = setup(100).await;

        ctx.repo.enqueue(&sample("a", 1)).await.unwrap();
        ctx.repo.enqueue(&sample("b", 1)).await.unwrap();
        ctx.repo.enqueue(&sample("a", 2)).await.unwrap();
        ctx.repo.enqueue(&sample("b", 2)).await.unwrap();

        let batch = ctx.repo.peek_batch(10).await.unwrap();
        let a_seqs: Vec<i64> = batch
            .iter()
            .filter(|r| r.sample.entity_id == "a")
            .map(|r| r.sample.sequence_no)
            .collect();
        assert_eq!(a_seqs, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_ack_requires_in_flight() {
        let ctx = setup(100).await;

        let outcome = ctx.repo.enqueue(&sample("e1", 1)).await.unwrap();
        let id = outcome.record.id;

        // Ack on a pending record is a no-op
        ctx.repo.ack(&[id]).await.unwrap();
        assert_eq!(
            ctx.repo.get(id).await.unwrap().unwrap().ack_state,
            AckState::Pending
        );

        ctx.repo.mark_in_flight(&[id]).await.unwrap();
        ctx.repo.ack(&[id]).await.unwrap();
        assert_eq!(
            ctx.repo.get(id).await.unwrap().unwrap().ack_state,
            AckState::Acknowledged
        );

        // Idempotent: acking again changes nothing
        ctx.repo.ack(&[id]).await.unwrap();
        assert_eq!(
            ctx.repo.get(id).await.unwrap().unwrap().ack_state,
            AckState::Acknowledged
        );
    }

    #[tokio::test]
    async fn test_requeue_increments_attempts() {
        let ctx = setup(100).await;

        let id = ctx.repo.enqueue(&sample("e1", 1)).await.unwrap().record.id;
        ctx.repo.mark_in_flight(&[id]).await.unwrap();
        ctx.repo.requeue(&[id]).await.unwrap();

        let record = ctx.repo.get(id).await.unwrap().unwrap();
        assert_eq!(record.ack_state, AckState::Pending);
        assert_eq!(record.attempt_count, 1);
        assert!(record.dispatched_at.is_none());

        ctx.repo.mark_in_flight(&[id]).await.unwrap();
        ctx.repo.requeue(&[id]).await.unwrap();
        assert_eq!(ctx.repo.get(id).await.unwrap().unwrap().attempt_count, 2);
    }

    #[tokio::test]
    async fn test_park_is_terminal() {
        let ctx = setup(100).await;

        let id = ctx.repo.enqueue(&sample("e1", 1)).await.unwrap().record.id;
        ctx.repo.mark_in_flight(&[id]).await.unwrap();
        ctx.repo.park(&[id]).await.unwrap();

        let record = ctx.repo.get(id).await.unwrap().unwrap();
        assert_eq!(record.ack_state, AckState::Parked);

        // Parked records are not requeued, acked, or peeked
        ctx.repo.requeue(&[id]).await.unwrap();
        ctx.repo.ack(&[id]).await.unwrap();
        assert_eq!(
            ctx.repo.get(id).await.unwrap().unwrap().ack_state,
            AckState::Parked
        );
        assert!(ctx.repo.peek_batch(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_eviction_oldest_acknowledged_first() {
        let ctx = setup(5).await;

        // Two acknowledged, three pending, queue exactly full
        for seq in 1..=5 {
            ctx.repo.enqueue(&sample("e1", seq)).await.unwrap();
        }
        let batch = ctx.repo.peek_batch(2).await.unwrap();
        let acked: Vec<i64> = batch.iter().map(|r| r.id).collect();
        ctx.repo.mark_in_flight(&acked).await.unwrap();
        ctx.repo.ack(&acked).await.unwrap();

        // One over capacity: the oldest acknowledged record goes
        let outcome = ctx.repo.enqueue(&sample("e1", 6)).await.unwrap();
        let eviction = outcome.eviction.unwrap();
        assert_eq!(eviction.acknowledged, 1);
        assert_eq!(eviction.pending, 0);
        assert!(ctx.repo.get(acked[0]).await.unwrap().is_none());
        assert!(ctx.repo.get(acked[1]).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_eviction_spills_to_pending_never_in_flight() {
        let ctx = setup(3).await;

        let first = ctx.repo.enqueue(&sample("e1", 1)).await.unwrap().record.id;
        ctx.repo.mark_in_flight(&[first]).await.unwrap();
        ctx.repo.enqueue(&sample("e1", 2)).await.unwrap();
        ctx.repo.enqueue(&sample("e1", 3)).await.unwrap();

        // No acknowledged records exist, so the oldest pending goes; the
        // in-flight record must survive even though it is older.
        let outcome = ctx.repo.enqueue(&sample("e1", 4)).await.unwrap();
        let eviction = outcome.eviction.unwrap();
        assert_eq!(eviction.acknowledged, 0);
        assert_eq!(eviction.pending, 1);
        assert!(ctx.repo.get(first).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_overflow_by_fifty_evicts_exactly_fifty() {
        let ctx = setup(100).await;

        let mut evicted = 0u64;
        let mut eviction_events = 0u32;
        for seq in 1..=150 {
            let outcome = ctx.repo.enqueue(&sample("e1", seq)).await.unwrap();
            if let Some(e) = outcome.eviction {
                evicted += e.total();
                eviction_events += 1;
            }
        }

        assert_eq!(evicted, 50);
        // One signal per overflowing enqueue
        assert_eq!(eviction_events, 50);

        // The 50 oldest are gone, the newest 100 remain in order
        let remaining = ctx.repo.peek_batch(200).await.unwrap();
        assert_eq!(remaining.len(), 100);
        assert_eq!(remaining[0].sample.sequence_no, 51);
        assert_eq!(remaining[99].sample.sequence_no, 150);
    }

    #[tokio::test]
    async fn test_recover_reverts_stale_in_flight() {
        let ctx = setup(100).await;

        let id = ctx.repo.enqueue(&sample("e1", 1)).await.unwrap().record.id;
        ctx.repo.mark_in_flight(&[id]).await.unwrap();

        // Fresh dispatch: not recovered
        let recovered = ctx.repo.recover(Duration::from_secs(3600)).await.unwrap();
        assert_eq!(recovered, 0);

        // Zero timeout treats any in-flight record as abandoned
        let recovered = ctx.repo.recover(Duration::from_secs(0)).await.unwrap();
        assert_eq!(recovered, 1);
        let record = ctx.repo.get(id).await.unwrap().unwrap();
        assert_eq!(record.ack_state, AckState::Pending);
    }

    #[tokio::test]
    async fn test_crash_roundtrip_preserves_sample() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("crash.db");

        let original = sample("e1", 42)
            .with_elapsed_ms(123_456)
            .with_captured_at("2026-03-01T10:30:00Z".parse().unwrap());

        {
            let pool = init_db(db_path.clone()).await.unwrap();
            let repo = QueueRepository::new(pool.clone(), 100);
            repo.enqueue(&original).await.unwrap();
            pool.close().await;
        }

        // Reopen as a fresh process would
        let pool = init_db(db_path).await.unwrap();
        let repo = QueueRepository::new(pool, 100);
        let batch = repo.peek_batch(10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].sample, original);
    }

    #[tokio::test]
    async fn test_corrupt_record_is_dropped_not_fatal() {
        let ctx = setup(100).await;

        ctx.repo.enqueue(&sample("e1", 1)).await.unwrap();
        let bad = ctx.repo.enqueue(&sample("e1", 2)).await.unwrap().record.id;
        ctx.repo.enqueue(&sample("e1", 3)).await.unwrap();

        sqlx::query("UPDATE queue_records SET captured_at = 'garbage' WHERE id = ?")
            .bind(bad)
            .execute(&ctx.pool)
            .await
            .unwrap();

        let batch = ctx.repo.peek_batch(10).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert!(ctx.repo.get(bad).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_max_sequence_for() {
        let ctx = setup(100).await;
        assert_eq!(ctx.repo.max_sequence_for("e1").await.unwrap(), None);

        ctx.repo.enqueue(&sample("e1", 4)).await.unwrap();
        ctx.repo.enqueue(&sample("e1", 9)).await.unwrap();
        ctx.repo.enqueue(&sample("e2", 30)).await.unwrap();

        assert_eq!(ctx.repo.max_sequence_for("e1").await.unwrap(), Some(9));
    }

    #[tokio::test]
    async fn test_counts() {
        let ctx = setup(100).await;

        let a = ctx.repo.enqueue(&sample("e1", 1)).await.unwrap().record.id;
        let b = ctx.repo.enqueue(&sample("e1", 2)).await.unwrap().record.id;
        ctx.repo.enqueue(&sample("e1", 3)).await.unwrap();

        ctx.repo.mark_in_flight(&[a, b]).await.unwrap();
        ctx.repo.ack(&[a]).await.unwrap();

        let counts = ctx.repo.counts().await.unwrap();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.in_flight, 1);
        assert_eq!(counts.acknowledged, 1);
        assert_eq!(counts.parked, 0);
    }
}
