//! # Craftbook Sync
//!
//! Data synchronization and caching engine for the Craftbook recipe browser.
//! Reconciles an on-device cache with the public catalog store and the
//! per-user private store, and tracks user-submitted reports.

pub mod cache;
pub mod config;
pub mod db;
pub mod models;
pub mod network;
pub mod remote;
pub mod sync;

pub use config::{ConfigError, EngineConfig};
pub use db::{CacheError, LocalCacheStore};
pub use models::{CatalogSnapshot, Command, CraftingOption, NewReport, Recipe, Report, ReportKind, ReportStatus};
pub use network::{ConnectivityMonitor, NetworkStatus};
pub use remote::{KeyValueStore, NotificationCenter, RemoteError, RemoteStore};
pub use sync::{
    BackgroundScheduler, ClearAllSummary, EngineError, LoadOutcome, NotificationState, SyncEngine,
    SyncResult, SyncState,
};

// ============================================================================
// Logging
// ============================================================================

/// Install the process logger.
///
/// Loads `.env` first so `RUST_LOG` can come from it; defaults to `info`.
/// Safe to call more than once.
pub fn init_logging() {
    dotenvy::dotenv().ok();

    if env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init()
        .is_err()
    {
        log::debug!("Logger already initialized");
    }
}

/// Build an engine from the environment and start it
pub async fn start_from_env(
    notifications: std::sync::Arc<dyn NotificationCenter>,
    connectivity: ConnectivityMonitor,
) -> Result<SyncEngine, StartupError> {
    init_logging();

    let config = EngineConfig::from_env()?;
    log::info!(
        "Starting Craftbook sync (cache: {:?}, remote: {})",
        config.cache_path,
        config.remote_base_url
    );

    let engine = SyncEngine::from_config(config, notifications, connectivity)?;
    engine.start().await;
    Ok(engine)
}

/// Startup errors
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
}
