//! FleetTrack Sync Server
//!
//! Reference backend for fleettrack devices: accepts pushed sample batches
//! and serves long-polled updates for watched entities.
//!
//! # Configuration
//!
//! Environment variables:
//! - `FLEETTRACK_PORT`: Port to listen on (default: 8080)
//! - `FLEETTRACK_DATA_DIR`: Directory for the server database (default: ~/.local/share/fleettrack-server)
//! - `FLEETTRACK_CONFIG`: Path to config file (default: ~/.config/fleettrack-server/config.yaml)
//!
//! # Config File Format
//!
//! ```yaml
//! api_keys:
//!   - key: "your-secret-key-here"
//!     device_id: "van-1"
//! ```
//!
//! # Endpoints
//!
//! - `GET /health`: Health check endpoint (no auth required)
//! - `GET /me`: Returns the authenticated device (auth required)
//! - `POST /v1/samples`: Push a batch of samples (auth required)
//! - `GET /v1/updates`: Long-poll updates after a cursor (auth required)

use axum::{
    extract::{Query, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};
use std::collections::HashMap;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// ============================================================================
// Configuration
// ============================================================================

/// API key entry in config
#[derive(Debug, Clone, Deserialize)]
struct ApiKeyEntry {
    key: String,
    device_id: String,
}

/// Config file structure
#[derive(Debug, Clone, Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    api_keys: Vec<ApiKeyEntry>,
}

/// Server configuration
#[derive(Debug, Clone)]
struct Config {
    /// Port to listen on
    port: u16,
    /// Directory holding the server database
    data_dir: PathBuf,
    /// Path to config file
    config_path: PathBuf,
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Self {
        let port = std::env::var("FLEETTRACK_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8080);

        let data_dir = std::env::var("FLEETTRACK_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::data_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("fleettrack-server")
            });

        let config_path = std::env::var("FLEETTRACK_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::config_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("fleettrack-server")
                    .join("config.yaml")
            });

        Self {
            port,
            data_dir,
            config_path,
        }
    }
}

// ============================================================================
// Authentication
// ============================================================================

/// Authenticated device info, added to request extensions after auth
#[derive(Debug, Clone)]
pub struct AuthDevice {
    pub device_id: String,
}

/// API key store - maps key -> AuthDevice
#[derive(Debug, Clone)]
struct ApiKeyStore {
    keys: HashMap<String, AuthDevice>,
}

impl ApiKeyStore {
    /// Load API keys from config file
    fn load(config_path: &PathBuf) -> Self {
        let keys = match std::fs::read_to_string(config_path) {
            Ok(contents) => match serde_yaml::from_str::<ConfigFile>(&contents) {
                Ok(config) => {
                    let mut map = HashMap::new();
                    for entry in config.api_keys {
                        map.insert(
                            entry.key,
                            AuthDevice {
                                device_id: entry.device_id,
                            },
                        );
                    }
                    tracing::info!("Loaded {} API key(s)", map.len());
                    map
                }
                Err(e) => {
                    tracing::warn!("Failed to parse config file: {}", e);
                    HashMap::new()
                }
            },
            Err(e) => {
                tracing::warn!(
                    "Failed to read config file {}: {}",
                    config_path.display(),
                    e
                );
                tracing::warn!("No API keys loaded - all authenticated requests will fail");
                HashMap::new()
            }
        };

        Self { keys }
    }

    /// Validate an API key and return the associated device
    fn validate(&self, key: &str) -> Option<AuthDevice> {
        self.keys.get(key).cloned()
    }
}

/// Application state shared across handlers
#[derive(Clone)]
struct AppState {
    api_keys: Arc<ApiKeyStore>,
    pool: SqlitePool,
    /// Woken whenever new samples land, releasing long-poll waiters
    new_samples: Arc<Notify>,
}

/// Auth error response
#[derive(Serialize)]
struct AuthError {
    error: &'static str,
    message: &'static str,
}

/// Authentication middleware
async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    // Extract Authorization header
    let auth_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    let api_key = match auth_header {
        Some(h) if h.starts_with("Bearer ") => &h[7..],
        Some(_) => {
            return (
                StatusCode::UNAUTHORIZED,
                Json(AuthError {
                    error: "invalid_auth",
                    message: "Authorization header must use Bearer scheme",
                }),
            )
                .into_response();
        }
        None => {
            return (
                StatusCode::UNAUTHORIZED,
                Json(AuthError {
                    error: "missing_auth",
                    message: "Authorization header required",
                }),
            )
                .into_response();
        }
    };

    // Validate API key
    match state.api_keys.validate(api_key) {
        Some(device) => {
            // Add device info to request extensions
            request.extensions_mut().insert(device);
            next.run(request).await
        }
        None => (
            StatusCode::UNAUTHORIZED,
            Json(AuthError {
                error: "invalid_key",
                message: "Invalid API key",
            }),
        )
            .into_response(),
    }
}

// ============================================================================
// Storage
// ============================================================================

/// One sample on the wire, matching the device's serialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Sample {
    entity_id: String,
    latitude: f64,
    longitude: f64,
    accuracy_m: f64,
    captured_at: DateTime<Utc>,
    captured_elapsed_ms: i64,
    sequence_no: i64,
}

#[derive(Debug, FromRow)]
struct SampleRow {
    update_seq: i64,
    entity_id: String,
    latitude: f64,
    longitude: f64,
    accuracy_m: f64,
    captured_at: String,
    captured_elapsed_ms: i64,
    sequence_no: i64,
}

impl SampleRow {
    fn into_sample(self) -> Option<Sample> {
        let captured_at = DateTime::parse_from_rfc3339(&self.captured_at)
            .ok()?
            .with_timezone(&Utc);
        Some(Sample {
            entity_id: self.entity_id,
            latitude: self.latitude,
            longitude: self.longitude,
            accuracy_m: self.accuracy_m,
            captured_at,
            captured_elapsed_ms: self.captured_elapsed_ms,
            sequence_no: self.sequence_no,
        })
    }
}

async fn init_db(data_dir: &PathBuf) -> Result<SqlitePool, sqlx::Error> {
    let db_path = data_dir.join("fleettrack-server.db");
    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    // update_seq doubles as the global pull cursor. The uniqueness
    // constraint makes re-delivered samples a no-op, which is what gives
    // devices at-least-once push semantics.
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS samples (
            update_seq INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_id TEXT NOT NULL,
            latitude REAL NOT NULL,
            longitude REAL NOT NULL,
            accuracy_m REAL NOT NULL,
            captured_at TEXT NOT NULL,
            captured_elapsed_ms INTEGER NOT NULL,
            sequence_no INTEGER NOT NULL,
            UNIQUE(entity_id, sequence_no)
        )",
    )
    .execute(&pool)
    .await?;

    Ok(pool)
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check response
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Health check endpoint (no auth required)
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Current device response
#[derive(Serialize)]
struct MeResponse {
    device_id: String,
}

/// Get the authenticated device (auth required)
async fn me(Extension(device): Extension<AuthDevice>) -> Json<MeResponse> {
    Json(MeResponse {
        device_id: device.device_id,
    })
}

#[derive(Serialize)]
struct PushResponse {
    accepted: u64,
}

fn internal_error(e: sqlx::Error) -> (StatusCode, String) {
    tracing::error!("database error: {}", e);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "internal error".to_string(),
    )
}

/// Accept a batch of samples from a device
async fn push_samples(
    State(state): State<AppState>,
    Extension(device): Extension<AuthDevice>,
    Json(batch): Json<Vec<Sample>>,
) -> Result<Json<PushResponse>, (StatusCode, String)> {
    let mut accepted = 0u64;
    for sample in &batch {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO samples \
                (entity_id, latitude, longitude, accuracy_m, captured_at, \
                 captured_elapsed_ms, sequence_no) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&sample.entity_id)
        .bind(sample.latitude)
        .bind(sample.longitude)
        .bind(sample.accuracy_m)
        .bind(sample.captured_at.to_rfc3339())
        .bind(sample.captured_elapsed_ms)
        .bind(sample.sequence_no)
        .execute(&state.pool)
        .await
        .map_err(internal_error)?;
        accepted += result.rows_affected();
    }

    tracing::debug!(
        device_id = %device.device_id,
        batch = batch.len(),
        accepted,
        "samples pushed"
    );
    if accepted > 0 {
        state.new_samples.notify_waiters();
    }
    Ok(Json(PushResponse { accepted }))
}

#[derive(Deserialize)]
struct UpdatesParams {
    #[serde(default)]
    cursor: i64,
    #[serde(default)]
    wait_secs: u64,
    /// Comma-separated entity ids
    #[serde(default)]
    entities: String,
}

#[derive(Serialize)]
struct UpdatesResponse {
    updates: Vec<Sample>,
    cursor: i64,
}

/// Long-poll updates after a cursor, filtered to the given entities.
///
/// Returns as soon as matching samples exist past the cursor, or when the
/// cursor can be advanced past non-matching ones, or after `wait_secs`.
async fn get_updates(
    State(state): State<AppState>,
    Query(params): Query<UpdatesParams>,
) -> Result<Json<UpdatesResponse>, (StatusCode, String)> {
    let watched: HashSet<&str> = params
        .entities
        .split(',')
        .filter(|s| !s.is_empty())
        .collect();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(params.wait_secs.min(60));

    loop {
        // Register interest before querying so a push between the query and
        // the wait still wakes us.
        let notified = state.new_samples.notified();

        let rows: Vec<SampleRow> = sqlx::query_as(
            "SELECT update_seq, entity_id, latitude, longitude, accuracy_m, \
                    captured_at, captured_elapsed_ms, sequence_no \
             FROM samples WHERE update_seq > ? ORDER BY update_seq LIMIT 500",
        )
        .bind(params.cursor)
        .fetch_all(&state.pool)
        .await
        .map_err(internal_error)?;

        if !rows.is_empty() {
            let cursor = rows.last().map(|r| r.update_seq).unwrap_or(params.cursor);
            let updates: Vec<Sample> = rows
                .into_iter()
                .filter(|r| watched.contains(r.entity_id.as_str()))
                .filter_map(SampleRow::into_sample)
                .collect();
            // Even an all-filtered page advances the cursor, so the caller
            // never re-reads the same rows
            return Ok(Json(UpdatesResponse { updates, cursor }));
        }

        let now = tokio::time::Instant::now();
        if now >= deadline {
            return Ok(Json(UpdatesResponse {
                updates: Vec::new(),
                cursor: params.cursor,
            }));
        }
        let _ = tokio::time::timeout_at(deadline, notified).await;
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fleettrack_server=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env();

    // Ensure data directory exists
    if let Err(e) = std::fs::create_dir_all(&config.data_dir) {
        tracing::error!("Failed to create data directory: {}", e);
        std::process::exit(1);
    }

    tracing::info!("Data directory: {}", config.data_dir.display());
    tracing::info!("Config file: {}", config.config_path.display());

    let pool = match init_db(&config.data_dir).await {
        Ok(pool) => pool,
        Err(e) => {
            tracing::error!("Failed to open server database: {}", e);
            std::process::exit(1);
        }
    };

    // Load API keys
    let api_keys = Arc::new(ApiKeyStore::load(&config.config_path));

    // Build app state
    let state = AppState {
        api_keys,
        pool,
        new_samples: Arc::new(Notify::new()),
    };

    // Build router
    // Public routes (no auth)
    let public_routes = Router::new().route("/health", get(health));

    // Protected routes (auth required)
    let protected_routes = Router::new()
        .route("/me", get(me))
        .route("/v1/samples", post(push_samples))
        .route("/v1/updates", get(get_updates))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    let app = Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}
