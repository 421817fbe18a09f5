//! Persistence for resolved entity state, so the cache survives restarts.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::models::{LocationSample, TrackedEntity};

pub struct EntityRepository {
    pool: SqlitePool,
}

// Row type for database queries
#[derive(sqlx::FromRow)]
struct EntityRow {
    entity_id: String,
    latitude: f64,
    longitude: f64,
    accuracy_m: f64,
    captured_at: String,
    captured_elapsed_ms: i64,
    sequence_no: i64,
    version: i64,
    last_synced_at: Option<String>,
}

impl EntityRow {
    fn decode(self) -> Option<TrackedEntity> {
        let captured_at = parse_ts(&self.captured_at)?;
        let last_synced_at = match &self.last_synced_at {
            Some(s) => Some(parse_ts(s)?),
            None => None,
        };
        Some(TrackedEntity {
            entity_id: self.entity_id.clone(),
            last_sample: LocationSample {
                entity_id: self.entity_id,
                latitude: self.latitude,
                longitude: self.longitude,
                accuracy_m: self.accuracy_m,
                captured_at,
                captured_elapsed_ms: self.captured_elapsed_ms,
                sequence_no: self.sequence_no,
            },
            version: self.version,
            last_synced_at,
        })
    }
}

fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

impl EntityRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, entity_id: &str) -> Result<Option<TrackedEntity>, sqlx::Error> {
        let row: Option<EntityRow> =
            sqlx::query_as("SELECT * FROM tracked_entities WHERE entity_id = ?")
                .bind(entity_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.and_then(EntityRow::decode))
    }

    pub async fn list(&self) -> Result<Vec<TrackedEntity>, sqlx::Error> {
        let rows: Vec<EntityRow> =
            sqlx::query_as("SELECT * FROM tracked_entities ORDER BY entity_id")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().filter_map(EntityRow::decode).collect())
    }

    pub async fn upsert(&self, entity: &TrackedEntity) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO tracked_entities
                (entity_id, latitude, longitude, accuracy_m, captured_at,
                 captured_elapsed_ms, sequence_no, version, last_synced_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(entity_id) DO UPDATE SET
                latitude = excluded.latitude,
                longitude = excluded.longitude,
                accuracy_m = excluded.accuracy_m,
                captured_at = excluded.captured_at,
                captured_elapsed_ms = excluded.captured_elapsed_ms,
                sequence_no = excluded.sequence_no,
                version = excluded.version,
                last_synced_at = excluded.last_synced_at
            "#,
        )
        .bind(&entity.entity_id)
        .bind(entity.last_sample.latitude)
        .bind(entity.last_sample.longitude)
        .bind(entity.last_sample.accuracy_m)
        .bind(entity.last_sample.captured_at.to_rfc3339())
        .bind(entity.last_sample.captured_elapsed_ms)
        .bind(entity.last_sample.sequence_no)
        .bind(entity.version)
        .bind(entity.last_synced_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Highest sequence number cached for an entity, used together with the
    /// queue's maximum to seed the sampler across restarts.
    pub async fn max_sequence_for(&self, entity_id: &str) -> Result<Option<i64>, sqlx::Error> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT sequence_no FROM tracked_entities WHERE entity_id = ?")
                .bind(entity_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|r| r.0))
    }
}
