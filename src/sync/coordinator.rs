//! Background sync between the local queue and the backend store.
//!
//! Two independent tasks share the queue and the entity store: the push
//! loop drains queued samples to the backend, the pull loop fetches remote
//! updates for watched entities and feeds them through the resolver. Both
//! suspend while offline and resume on the connectivity signal.
//!
//! The queue's critical section is never held across a network call: a
//! batch is snapshotted (marked in-flight) before the push and acked or
//! requeued after it returns.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};

use super::backoff::Backoff;
use super::error::SyncError;
use super::remote::RemoteStore;
use super::token::TokenProvider;
use crate::config::SyncConfig;
use crate::db::QueueRepository;
use crate::engine::{EngineEvent, EntityStore, SubscriptionFanout};
use crate::models::{LocationSample, QueueRecord};

pub struct SyncCoordinator<R, T> {
    queue: Arc<QueueRepository>,
    store: Arc<EntityStore>,
    fanout: Arc<SubscriptionFanout>,
    remote: Arc<R>,
    tokens: Arc<T>,
    config: SyncConfig,
    backoff: Backoff,
    connectivity: watch::Receiver<bool>,
    shutdown: watch::Receiver<bool>,
    events: broadcast::Sender<EngineEvent>,
}

impl<R, T> Clone for SyncCoordinator<R, T> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            store: self.store.clone(),
            fanout: self.fanout.clone(),
            remote: self.remote.clone(),
            tokens: self.tokens.clone(),
            config: self.config.clone(),
            backoff: self.backoff.clone(),
            connectivity: self.connectivity.clone(),
            shutdown: self.shutdown.clone(),
            events: self.events.clone(),
        }
    }
}

/// Outcome of one push cycle.
enum PushCycle {
    /// Queue had nothing pending.
    Idle,
    /// This many records were pushed and acknowledged.
    Delivered(usize),
}

impl<R, T> SyncCoordinator<R, T>
where
    R: RemoteStore + 'static,
    T: TokenProvider + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<QueueRepository>,
        store: Arc<EntityStore>,
        fanout: Arc<SubscriptionFanout>,
        remote: Arc<R>,
        tokens: Arc<T>,
        config: SyncConfig,
        connectivity: watch::Receiver<bool>,
        shutdown: watch::Receiver<bool>,
        events: broadcast::Sender<EngineEvent>,
    ) -> Self {
        let backoff = Backoff::from_secs(config.backoff_base_secs, config.backoff_cap_secs);
        Self {
            queue,
            store,
            fanout,
            remote,
            tokens,
            config,
            backoff,
            connectivity,
            shutdown,
            events,
        }
    }

    /// Drains the queue to the backend until shutdown.
    pub async fn run_push_loop(mut self) {
        let mut failures: u32 = 0;
        loop {
            if !self.wait_online().await {
                return;
            }

            match self.push_cycle().await {
                Ok(PushCycle::Idle) => {
                    failures = 0;
                    if !self.idle(Duration::from_secs(self.config.push_interval_secs)).await {
                        return;
                    }
                }
                Ok(PushCycle::Delivered(count)) => {
                    failures = 0;
                    tracing::debug!(count, "pushed batch");
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!(failures, "push cycle failed: {}", e);
                    if !self.idle(self.backoff.delay_for(failures)).await {
                        return;
                    }
                }
            }
        }
    }

    async fn push_cycle(&self) -> Result<PushCycle, SyncError> {
        let batch = self.queue.peek_batch(self.config.batch_size).await?;
        if batch.is_empty() {
            return Ok(PushCycle::Idle);
        }

        let ids: Vec<i64> = batch.iter().map(|r| r.id).collect();
        self.queue.mark_in_flight(&ids).await?;

        // Snapshot taken; the network call runs with the queue unlocked.
        let samples: Vec<LocationSample> = batch.iter().map(|r| r.sample.clone()).collect();

        match self.push_with_auth(&samples).await {
            Ok(()) => {
                self.queue.ack(&ids).await?;
                Ok(PushCycle::Delivered(ids.len()))
            }
            Err(e) => {
                self.fail_batch(&batch).await?;
                Err(e)
            }
        }
    }

    /// Pushes with one in-cycle token refresh on auth rejection.
    async fn push_with_auth(&self, samples: &[LocationSample]) -> Result<(), SyncError> {
        let token = self.tokens.token().await?;
        match self.remote.push(&token, samples).await {
            Err(SyncError::AuthExpired) => {
                self.tokens.invalidate();
                let token = self.tokens.token().await?;
                self.remote.push(&token, samples).await
            }
            other => other,
        }
    }

    /// Requeues a failed batch, parking records that exhausted their budget.
    async fn fail_batch(&self, batch: &[QueueRecord]) -> Result<(), SyncError> {
        let mut retry_ids = Vec::new();
        let mut park_ids = Vec::new();
        for record in batch {
            if record.attempt_count + 1 >= self.config.max_attempts {
                park_ids.push(record.id);
            } else {
                retry_ids.push(record.id);
            }
        }

        if !retry_ids.is_empty() {
            self.queue.requeue(&retry_ids).await?;
        }
        if !park_ids.is_empty() {
            self.queue.park(&park_ids).await?;
            tracing::error!(
                count = park_ids.len(),
                max_attempts = self.config.max_attempts,
                "batch exhausted retry budget, parked for inspection"
            );
            let _ = self.events.send(EngineEvent::BatchParked {
                record_ids: park_ids,
                max_attempts: self.config.max_attempts,
            });
        }
        Ok(())
    }

    /// Pulls remote updates for watched entities until shutdown.
    pub async fn run_pull_loop(mut self) {
        let watched = self.config.watched_entities.clone();
        if watched.is_empty() {
            tracing::info!("no watched entities, pull loop not started");
            return;
        }

        let mut failures: u32 = 0;
        let mut cursor = 0i64;
        loop {
            if !self.wait_online().await {
                return;
            }

            match self.pull_cycle(cursor, &watched).await {
                Ok(next_cursor) => {
                    failures = 0;
                    cursor = next_cursor;
                }
                Err(e) => {
                    if matches!(e, SyncError::AuthExpired) {
                        self.tokens.invalidate();
                    }
                    failures += 1;
                    tracing::warn!(failures, "pull cycle failed: {}", e);
                    if !self.idle(self.backoff.delay_for(failures)).await {
                        return;
                    }
                }
            }
        }
    }

    async fn pull_cycle(&self, cursor: i64, watched: &[String]) -> Result<i64, SyncError> {
        let token = self.tokens.token().await?;
        let wait = Duration::from_secs(self.config.pull_wait_secs);
        let response = self.remote.pull(&token, cursor, watched, wait).await?;

        for sample in &response.updates {
            if let Some(entity) = self.store.apply_remote(sample).await? {
                self.fanout.publish(&entity);
            }
        }
        Ok(response.cursor)
    }

    /// Waits until connected. Returns false on shutdown.
    async fn wait_online(&mut self) -> bool {
        loop {
            if *self.shutdown.borrow() {
                return false;
            }
            if *self.connectivity.borrow() {
                return true;
            }
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
                changed = self.connectivity.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    /// Sleeps unless shutdown arrives first. Returns false on shutdown.
    async fn idle(&mut self, delay: Duration) -> bool {
        if delay.is_zero() {
            return !*self.shutdown.borrow();
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = self.shutdown.changed() => !*self.shutdown.borrow(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;
    use crate::models::AckState;
    use crate::sync::remote::PullResponse;
    use crate::sync::token::StaticTokenProvider;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// In-memory backend: fails the first `fail_first` pushes, then accepts
    /// everything, upserting by (entity_id, sequence_no).
    #[derive(Default)]
    struct FakeRemote {
        fail_first: AtomicU32,
        push_attempts: AtomicU32,
        applied: Mutex<Vec<LocationSample>>,
        updates: Mutex<Vec<LocationSample>>,
        reject_token: Option<String>,
    }

    impl RemoteStore for FakeRemote {
        async fn push(&self, token: &str, batch: &[LocationSample]) -> Result<(), SyncError> {
            self.push_attempts.fetch_add(1, Ordering::SeqCst);
            if let Some(bad) = &self.reject_token {
                if token == bad {
                    return Err(SyncError::AuthExpired);
                }
            }
            let remaining = self.fail_first.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_first.store(remaining - 1, Ordering::SeqCst);
                return Err(SyncError::Transient("connection reset".into()));
            }
            let mut applied = self.applied.lock().unwrap();
            for sample in batch {
                let duplicate = applied.iter().any(|s| {
                    s.entity_id == sample.entity_id && s.sequence_no == sample.sequence_no
                });
                if !duplicate {
                    applied.push(sample.clone());
                }
            }
            Ok(())
        }

        async fn pull(
            &self,
            _token: &str,
            cursor: i64,
            watched: &[String],
            _wait: Duration,
        ) -> Result<PullResponse, SyncError> {
            let (pending, next) = {
                let updates = self.updates.lock().unwrap();
                let pending: Vec<LocationSample> = updates
                    .iter()
                    .skip(cursor as usize)
                    .filter(|s| watched.contains(&s.entity_id))
                    .cloned()
                    .collect();
                let next = updates.len() as i64;
                (pending, next)
            };
            if pending.is_empty() {
                // Stand in for the server-side long-poll wait
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            Ok(PullResponse {
                updates: pending,
                cursor: next,
            })
        }
    }

    struct TestContext {
        pool: sqlx::SqlitePool,
        queue: Arc<QueueRepository>,
        store: Arc<EntityStore>,
        fanout: Arc<SubscriptionFanout>,
        remote: Arc<FakeRemote>,
        connectivity_tx: watch::Sender<bool>,
        shutdown_tx: watch::Sender<bool>,
        events: broadcast::Sender<EngineEvent>,
        config: SyncConfig,
        _temp_dir: TempDir,
    }

    async fn setup(remote: FakeRemote, config: SyncConfig) -> TestContext {
        let temp_dir = TempDir::new().unwrap();
        let pool = init_db(temp_dir.path().join("test.db")).await.unwrap();
        let (connectivity_tx, _) = watch::channel(true);
        let (shutdown_tx, _) = watch::channel(false);
        let (events, _) = broadcast::channel(16);
        TestContext {
            pool: pool.clone(),
            queue: Arc::new(QueueRepository::new(pool.clone(), 1000)),
            store: Arc::new(EntityStore::new(pool)),
            fanout: Arc::new(SubscriptionFanout::new()),
            remote: Arc::new(remote),
            connectivity_tx,
            shutdown_tx,
            events,
            config,
            _temp_dir: temp_dir,
        }
    }

    fn test_config() -> SyncConfig {
        SyncConfig {
            backoff_base_secs: 0,
            push_interval_secs: 0,
            pull_wait_secs: 0,
            max_attempts: 8,
            ..Default::default()
        }
    }

    fn coordinator(ctx: &TestContext) -> SyncCoordinator<FakeRemote, StaticTokenProvider> {
        SyncCoordinator::new(
            ctx.queue.clone(),
            ctx.store.clone(),
            ctx.fanout.clone(),
            ctx.remote.clone(),
            Arc::new(StaticTokenProvider::new("test-key")),
            ctx.config.clone(),
            ctx.connectivity_tx.subscribe(),
            ctx.shutdown_tx.subscribe(),
            ctx.events.clone(),
        )
    }

    fn sample(entity: &str, seq: i64) -> LocationSample {
        LocationSample::new(entity, 52.52, 13.405, 10.0, seq)
    }

    #[tokio::test]
    async fn test_push_cycle_acks_batch() {
        let ctx = setup(FakeRemote::default(), test_config()).await;
        for seq in 1..=3 {
            ctx.queue.enqueue(&sample("e1", seq)).await.unwrap();
        }

        let coord = coordinator(&ctx);
        match coord.push_cycle().await.unwrap() {
            PushCycle::Delivered(n) => assert_eq!(n, 3),
            PushCycle::Idle => panic!("expected delivery"),
        }

        assert_eq!(ctx.remote.applied.lock().unwrap().len(), 3);
        let counts = ctx.queue.counts().await.unwrap();
        assert_eq!(counts.acknowledged, 3);
        assert_eq!(counts.pending, 0);
    }

    #[tokio::test]
    async fn test_failures_then_success_reaches_backend() {
        // Scenario: push fails three times, then succeeds. The batch must
        // arrive intact and attempt_count must record exactly the failures.
        let remote = FakeRemote {
            fail_first: AtomicU32::new(3),
            ..Default::default()
        };
        let ctx = setup(remote, test_config()).await;
        let mut ids = Vec::new();
        for seq in 1..=5 {
            ids.push(ctx.queue.enqueue(&sample("e1", seq)).await.unwrap().record.id);
        }

        let coord = coordinator(&ctx);
        for _ in 0..3 {
            assert!(coord.push_cycle().await.is_err());
        }
        match coord.push_cycle().await.unwrap() {
            PushCycle::Delivered(n) => assert_eq!(n, 5),
            PushCycle::Idle => panic!("expected delivery"),
        }

        let applied = ctx.remote.applied.lock().unwrap();
        assert_eq!(applied.len(), 5);
        assert_eq!(applied.iter().map(|s| s.sequence_no).max(), Some(5));
        drop(applied);

        for id in ids {
            let record = ctx.queue.get(id).await.unwrap().unwrap();
            assert_eq!(record.ack_state, AckState::Acknowledged);
            assert_eq!(record.attempt_count, 3);
        }
    }

    #[tokio::test]
    async fn test_batch_parks_after_max_attempts() {
        let remote = FakeRemote {
            fail_first: AtomicU32::new(u32::MAX),
            ..Default::default()
        };
        let mut config = test_config();
        config.max_attempts = 3;
        let ctx = setup(remote, config).await;
        let id = ctx.queue.enqueue(&sample("e1", 1)).await.unwrap().record.id;

        let mut events = ctx.events.subscribe();
        let coord = coordinator(&ctx);
        for _ in 0..3 {
            assert!(coord.push_cycle().await.is_err());
        }

        let record = ctx.queue.get(id).await.unwrap().unwrap();
        assert_eq!(record.ack_state, AckState::Parked);

        match events.try_recv().unwrap() {
            EngineEvent::BatchParked { record_ids, max_attempts } => {
                assert_eq!(record_ids, vec![id]);
                assert_eq!(max_attempts, 3);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        // Parked records never re-enter a batch
        assert!(matches!(
            coord.push_cycle().await.unwrap(),
            PushCycle::Idle
        ));
    }

    #[tokio::test]
    async fn test_duplicate_push_is_upsert_noop() {
        // At-least-once delivery: mark a batch in-flight, push it, then
        // requeue and push again. The backend holds one copy.
        let ctx = setup(FakeRemote::default(), test_config()).await;
        let id = ctx.queue.enqueue(&sample("e1", 1)).await.unwrap().record.id;

        let coord = coordinator(&ctx);
        match coord.push_cycle().await.unwrap() {
            PushCycle::Delivered(1) => {}
            _ => panic!("expected delivery"),
        }

        // Simulate a lost ack: force the record pending again and repush
        sqlx::query("UPDATE queue_records SET ack_state = 'pending' WHERE id = ?")
            .bind(id)
            .execute(&ctx.pool)
            .await
            .unwrap();
        match coord.push_cycle().await.unwrap() {
            PushCycle::Delivered(1) => {}
            _ => panic!("expected redelivery"),
        }

        assert_eq!(ctx.remote.applied.lock().unwrap().len(), 1);
    }

    /// Hands out a stale token until invalidated, then a fresh one.
    struct RefreshingProvider {
        invalidated: std::sync::atomic::AtomicBool,
    }

    impl TokenProvider for RefreshingProvider {
        async fn token(&self) -> Result<String, SyncError> {
            if self.invalidated.load(Ordering::SeqCst) {
                Ok("fresh-key".to_string())
            } else {
                Ok("stale-key".to_string())
            }
        }

        fn invalidate(&self) {
            self.invalidated.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_auth_rejection_refreshes_and_retries_once() {
        let remote = FakeRemote {
            reject_token: Some("stale-key".to_string()),
            ..Default::default()
        };
        let ctx = setup(remote, test_config()).await;
        ctx.queue.enqueue(&sample("e1", 1)).await.unwrap();

        let coord = SyncCoordinator::new(
            ctx.queue.clone(),
            ctx.store.clone(),
            ctx.fanout.clone(),
            ctx.remote.clone(),
            Arc::new(RefreshingProvider {
                invalidated: std::sync::atomic::AtomicBool::new(false),
            }),
            ctx.config.clone(),
            ctx.connectivity_tx.subscribe(),
            ctx.shutdown_tx.subscribe(),
            ctx.events.clone(),
        );

        // First push is rejected, the refreshed token succeeds in-cycle
        match coord.push_cycle().await.unwrap() {
            PushCycle::Delivered(1) => {}
            _ => panic!("expected delivery after token refresh"),
        }
        assert_eq!(ctx.remote.push_attempts.load(Ordering::SeqCst), 2);
        assert_eq!(ctx.queue.counts().await.unwrap().acknowledged, 1);
    }

    #[tokio::test]
    async fn test_pull_applies_and_fans_out() {
        let remote = FakeRemote::default();
        remote
            .updates
            .lock()
            .unwrap()
            .extend([sample("van-2", 7), sample("van-2", 5)]);
        let mut config = test_config();
        config.watched_entities = vec!["van-2".to_string()];
        let ctx = setup(remote, config).await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        ctx.fanout.subscribe("van-2", move |e| {
            seen_clone.lock().unwrap().push(e.last_sample.sequence_no);
        });

        let coord = coordinator(&ctx);
        let cursor = coord.pull_cycle(0, &["van-2".to_string()]).await.unwrap();
        assert_eq!(cursor, 2);

        // Out-of-order arrival: 7 applies, 5 is a stale no-op
        assert_eq!(*seen.lock().unwrap(), vec![7]);
        let entity = ctx.store.get("van-2").await.unwrap().unwrap();
        assert_eq!(entity.last_sample.sequence_no, 7);
        assert_eq!(entity.version, 1);
    }

    #[tokio::test]
    async fn test_offline_suspends_push_until_signal() {
        let ctx = setup(FakeRemote::default(), test_config()).await;
        ctx.queue.enqueue(&sample("e1", 1)).await.unwrap();
        ctx.connectivity_tx.send_replace(false);

        let coord = coordinator(&ctx);
        let handle = tokio::spawn(coord.run_push_loop());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ctx.remote.push_attempts.load(Ordering::SeqCst), 0);

        // Connectivity restored: pushing resumes without polling
        ctx.connectivity_tx.send_replace(true);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(ctx.remote.push_attempts.load(Ordering::SeqCst) >= 1);
        assert_eq!(ctx.queue.counts().await.unwrap().acknowledged, 1);

        ctx.shutdown_tx.send_replace(true);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_stops_loops() {
        let mut config = test_config();
        config.watched_entities = vec!["e1".to_string()];
        let ctx = setup(FakeRemote::default(), config).await;

        let push = tokio::spawn(coordinator(&ctx).run_push_loop());
        let pull = tokio::spawn(coordinator(&ctx).run_pull_loop());

        tokio::time::sleep(Duration::from_millis(20)).await;
        ctx.shutdown_tx.send_replace(true);

        tokio::time::timeout(Duration::from_secs(2), async {
            push.await.unwrap();
            pull.await.unwrap();
        })
        .await
        .expect("loops must stop on shutdown");
    }
}
