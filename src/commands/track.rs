//! The `track` command: runs the engine in the foreground.

use clap::Args;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::engine::{EngineEvent, TrackerEngine};
use crate::provider::{fix_channel, SimulatedProvider};
use crate::sync::{HttpRemoteStore, StaticTokenProvider, SyncError};

/// Track this device's position and sync it with the server
#[derive(Args)]
pub struct TrackCommand {
    /// Drive the engine from a simulated provider instead of a device feed
    #[arg(long)]
    simulate: bool,

    /// Number of simulated fixes to emit before exiting
    #[arg(long, default_value_t = 60)]
    fixes: usize,

    /// Seconds between simulated fixes
    #[arg(long, default_value_t = 1)]
    fix_interval_secs: u64,
}

impl TrackCommand {
    pub async fn run(
        &self,
        pool: SqlitePool,
        config: &Config,
    ) -> Result<(), Box<dyn std::error::Error>> {
        if !config.sync.is_configured() {
            return Err(SyncError::NotConfigured.into());
        }
        let server_url = config.sync.server_url.clone().unwrap_or_default();
        let api_key = config.sync.api_key.clone().unwrap_or_default();

        let mut engine = TrackerEngine::new(
            config.clone(),
            pool,
            Arc::new(HttpRemoteStore::new(server_url)),
            Arc::new(StaticTokenProvider::new(api_key)),
        );

        for entity_id in &config.sync.watched_entities {
            engine.subscribe(entity_id, |entity| {
                println!("  update: {}", entity.last_sample);
            });
        }

        let mut events = engine.events();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                match event {
                    EngineEvent::QueueEvicted {
                        acknowledged,
                        pending,
                    } => {
                        println!(
                            "  queue full: evicted {} acknowledged, {} pending",
                            acknowledged, pending
                        );
                    }
                    EngineEvent::BatchParked {
                        record_ids,
                        max_attempts,
                    } => {
                        println!(
                            "  parked {} record(s) after {} failed attempts",
                            record_ids.len(),
                            max_attempts
                        );
                    }
                }
            }
        });

        let (sender, fix_rx) = fix_channel(64);
        engine.start(fix_rx).await?;

        println!("Tracking as '{}'", config.device_id);
        if self.simulate {
            println!(
                "Simulating {} fixes at {}s intervals (Ctrl-C to stop early)",
                self.fixes, self.fix_interval_secs
            );
            let provider = SimulatedProvider {
                interval: Duration::from_secs(self.fix_interval_secs),
                count: self.fixes,
                ..Default::default()
            };
            tokio::select! {
                _ = provider.run(sender) => {
                    // Let the last samples drain before stopping
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                _ = tokio::signal::ctrl_c() => {
                    println!("\nStopping...");
                }
            }
        } else {
            println!("Waiting for device fixes (Ctrl-C to stop)");
            tokio::signal::ctrl_c().await?;
            println!("\nStopping...");
            drop(sender);
        }

        engine.stop().await;

        let counts = engine.queue().counts().await?;
        println!(
            "Queue at exit: {} pending, {} acknowledged, {} parked",
            counts.pending, counts.acknowledged, counts.parked
        );
        Ok(())
    }
}
