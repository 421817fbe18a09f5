//! The tracking engine: owns the background tasks and the channels that
//! connect provider, sampler, queue, and sync.
//!
//! Task layout after `start`:
//!   - sampler task: drains the fix channel, filters through the
//!     [`PositionSampler`], enqueues accepted samples
//!   - push task: [`SyncCoordinator::run_push_loop`]
//!   - pull task: [`SyncCoordinator::run_pull_loop`]
//!
//! All tasks watch the same shutdown signal; `stop` flips it and joins.

pub mod fanout;
pub mod resolver;
pub mod sampler;

pub use fanout::{SubscriptionFanout, SubscriptionToken};
pub use resolver::{merge, EntityStore, MergeOutcome};
pub use sampler::PositionSampler;

use std::sync::Arc;

use sqlx::SqlitePool;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::db::QueueRepository;
use crate::models::TrackedEntity;
use crate::provider::RawFix;
use crate::sync::{RemoteStore, SyncCoordinator, TokenProvider};

/// Out-of-band notifications surfaced to the embedding application.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// The queue hit capacity and evicted records to admit a new sample.
    QueueEvicted { acknowledged: u64, pending: u64 },
    /// A batch exhausted its retry budget and was parked.
    BatchParked {
        record_ids: Vec<i64>,
        max_attempts: i64,
    },
}

pub struct TrackerEngine<R, T> {
    config: Config,
    queue: Arc<QueueRepository>,
    store: Arc<EntityStore>,
    fanout: Arc<SubscriptionFanout>,
    remote: Arc<R>,
    tokens: Arc<T>,
    events: broadcast::Sender<EngineEvent>,
    connectivity: watch::Sender<bool>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl<R, T> TrackerEngine<R, T>
where
    R: RemoteStore + 'static,
    T: TokenProvider + 'static,
{
    pub fn new(config: Config, pool: SqlitePool, remote: Arc<R>, tokens: Arc<T>) -> Self {
        let queue = Arc::new(QueueRepository::new(pool.clone(), config.queue.capacity));
        let store = Arc::new(EntityStore::new(pool));
        let (events, _) = broadcast::channel(64);
        let (connectivity, _) = watch::channel(true);
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            queue,
            store,
            fanout: Arc::new(SubscriptionFanout::new()),
            remote,
            tokens,
            events,
            connectivity,
            shutdown,
            tasks: Vec::new(),
        }
    }

    /// Recovers queue state from the previous run and spawns the background
    /// tasks. `fix_rx` is the receiving end of [`crate::provider::fix_channel`].
    pub async fn start(&mut self, mut fix_rx: mpsc::Receiver<RawFix>) -> Result<(), sqlx::Error> {
        self.queue
            .recover(self.config.sync.resumption_timeout())
            .await?;

        // Sequences continue from the highest this device has produced,
        // whether still queued or already committed to the entity cache.
        let device_id = self.config.device_id.clone();
        let queued = self.queue.max_sequence_for(&device_id).await?.unwrap_or(0);
        let committed = self.store.max_sequence_for(&device_id).await?.unwrap_or(0);
        let mut sampler = PositionSampler::new(
            device_id,
            self.config.sampler.clone(),
            queued.max(committed),
        );

        let queue = self.queue.clone();
        let events = self.events.clone();
        let mut shutdown_rx = self.shutdown.subscribe();
        self.tasks.push(tokio::spawn(async move {
            loop {
                let fix = tokio::select! {
                    fix = fix_rx.recv() => match fix {
                        Some(fix) => fix,
                        None => break,
                    },
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                        continue;
                    }
                };

                let Some(sample) = sampler.sample(fix) else {
                    continue;
                };
                match queue.enqueue(&sample).await {
                    Ok(outcome) => {
                        if let Some(eviction) = outcome.eviction {
                            tracing::warn!(
                                acknowledged = eviction.acknowledged,
                                pending = eviction.pending,
                                "queue at capacity, evicted oldest records"
                            );
                            let _ = events.send(EngineEvent::QueueEvicted {
                                acknowledged: eviction.acknowledged,
                                pending: eviction.pending,
                            });
                        }
                    }
                    Err(e) => {
                        tracing::error!("failed to enqueue sample: {}", e);
                    }
                }
            }
        }));

        let coordinator = SyncCoordinator::new(
            self.queue.clone(),
            self.store.clone(),
            self.fanout.clone(),
            self.remote.clone(),
            self.tokens.clone(),
            self.config.sync.clone(),
            self.connectivity.subscribe(),
            self.shutdown.subscribe(),
            self.events.clone(),
        );
        self.tasks.push(tokio::spawn(coordinator.clone().run_push_loop()));
        self.tasks.push(tokio::spawn(coordinator.run_pull_loop()));

        Ok(())
    }

    /// Signals shutdown and waits for all tasks to finish.
    pub async fn stop(&mut self) {
        self.shutdown.send_replace(true);
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                tracing::warn!("engine task ended abnormally: {}", e);
            }
        }
    }

    /// Feeds the platform's connectivity signal to the sync loops. Offline
    /// suspends network activity; sampling and queueing continue.
    pub fn set_connectivity(&self, online: bool) {
        // send_replace so the value sticks even before any loop subscribes
        self.connectivity.send_replace(online);
    }

    pub fn subscribe(
        &self,
        entity_id: impl Into<String>,
        callback: impl Fn(&TrackedEntity) + Send + Sync + 'static,
    ) -> SubscriptionToken {
        self.fanout.subscribe(entity_id, callback)
    }

    pub fn unsubscribe(&self, token: &SubscriptionToken) {
        self.fanout.unsubscribe(token)
    }

    pub fn events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn queue(&self) -> &QueueRepository {
        &self.queue
    }

    pub fn store(&self) -> &EntityStore {
        &self.store
    }
}
