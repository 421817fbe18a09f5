//! The `status` command: queue, entity cache, and sync configuration.

use clap::Args;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db::QueueRepository;
use crate::engine::EntityStore;
use crate::sync::{HttpRemoteStore, SyncError};

/// Show queue state, cached entities, and sync status
#[derive(Args)]
pub struct StatusCommand {}

impl StatusCommand {
    pub async fn run(
        &self,
        pool: SqlitePool,
        config: &Config,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let queue = QueueRepository::new(pool.clone(), config.queue.capacity);
        let store = EntityStore::new(pool);

        println!("Queue");
        println!("=====");
        println!();
        let counts = queue.counts().await?;
        println!("  pending:      {}", counts.pending);
        println!("  in flight:    {}", counts.in_flight);
        println!("  acknowledged: {}", counts.acknowledged);
        println!("  parked:       {}", counts.parked);
        println!("  capacity:     {}", config.queue.capacity);
        println!();

        println!("Entities");
        println!("========");
        println!();
        let entities = store.list().await?;
        if entities.is_empty() {
            println!("  (none cached)");
        }
        for entity in entities {
            let synced = match entity.last_synced_at {
                Some(at) => at.to_rfc3339(),
                None => "never".to_string(),
            };
            println!("  {}  v{}  synced {}", entity.last_sample, entity.version, synced);
        }
        println!();

        println!("Sync Configuration");
        println!("==================");
        println!();

        if !config.sync.is_configured() {
            println!("Status: Not configured");
            println!();
            println!("To enable sync, add to your config file:");
            println!();
            println!("  sync:");
            println!("    server_url: \"http://localhost:8080\"");
            println!("    api_key: \"your-api-key\"");
            println!();
            println!("Or set environment variables:");
            println!("  FLEETTRACK_SERVER_URL");
            println!("  FLEETTRACK_API_KEY");
            return Ok(());
        }

        let server_url = config.sync.server_url.as_ref().unwrap();
        let api_key = config.sync.api_key.as_ref().unwrap();

        println!("Server:  {}", server_url);
        println!("API Key: {}...", &api_key[..api_key.len().min(8)]);
        if !config.sync.watched_entities.is_empty() {
            println!("Watched: {}", config.sync.watched_entities.join(", "));
        }
        println!();

        print!("Server status: ");
        let remote = HttpRemoteStore::new(server_url.clone());
        match remote.health().await {
            Ok(()) => println!("✓ reachable"),
            Err(SyncError::Transient(_)) => println!("✗ unreachable"),
            Err(e) => println!("✗ error: {}", e),
        }

        Ok(())
    }
}
