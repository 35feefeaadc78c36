//! Background Refresh Scheduler
//!
//! Runs automatic catalog refreshes and report status polls at a
//! configurable interval. Uses Tokio tasks for non-blocking background
//! execution.

use super::engine::SyncEngine;
use crate::db::LocalCacheStore;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

const SCHEDULER_SETTING: &str = "scheduler_config";
const MIN_INTERVAL_MINUTES: u64 = 1;
const MAX_INTERVAL_MINUTES: u64 = 1440;

/// Scheduler configuration stored in the cache settings table
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub interval_minutes: u64,
    pub last_run: Option<DateTime<Utc>>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_minutes: 30,
            last_run: None,
        }
    }
}

/// Scheduler errors
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Scheduler is already running")]
    AlreadyRunning,

    #[error("Scheduler is not running")]
    NotRunning,

    #[error("Invalid interval: {0}")]
    InvalidInterval(String),
}

fn validate_interval(interval_minutes: u64) -> Result<(), SchedulerError> {
    if !(MIN_INTERVAL_MINUTES..=MAX_INTERVAL_MINUTES).contains(&interval_minutes) {
        return Err(SchedulerError::InvalidInterval(format!(
            "Interval must be {}-{} minutes, got {}",
            MIN_INTERVAL_MINUTES, MAX_INTERVAL_MINUTES, interval_minutes
        )));
    }
    Ok(())
}

/// Background scheduler for automatic refreshes
#[derive(Clone)]
pub struct BackgroundScheduler {
    engine: SyncEngine,
    cache: LocalCacheStore,
    config: Arc<RwLock<SchedulerConfig>>,
    running: Arc<AtomicBool>,
    task_handle: Arc<StdMutex<Option<JoinHandle<()>>>>,
}

impl BackgroundScheduler {
    pub fn new(engine: SyncEngine) -> Self {
        let cache = engine.cache().clone();
        Self {
            engine,
            cache,
            config: Arc::new(RwLock::new(SchedulerConfig::default())),
            running: Arc::new(AtomicBool::new(false)),
            task_handle: Arc::new(StdMutex::new(None)),
        }
    }

    /// Load configuration from the settings table
    pub async fn load_config(&self) -> Result<(), SchedulerError> {
        let config: SchedulerConfig = self
            .cache
            .blocking(|cache| cache.get_setting::<SchedulerConfig>(SCHEDULER_SETTING))
            .await
            .map_err(|e| SchedulerError::Cache(e.to_string()))?
            .unwrap_or_default();

        *self.config.write().await = config;
        Ok(())
    }

    /// Save configuration to the settings table
    pub async fn save_config(&self) -> Result<(), SchedulerError> {
        let config = self.config.read().await.clone();
        self.cache
            .blocking(move |cache| cache.set_setting(SCHEDULER_SETTING, &config))
            .await
            .map_err(|e| SchedulerError::Cache(e.to_string()))
    }

    /// Start the background task
    pub async fn start(&self) -> Result<(), SchedulerError> {
        let interval_minutes = self.config.read().await.interval_minutes;
        validate_interval(interval_minutes)?;

        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyRunning);
        }

        let handle = tokio::spawn(Self::scheduler_loop(
            self.running.clone(),
            self.engine.clone(),
            self.cache.clone(),
            self.config.clone(),
            Duration::from_secs(60 * interval_minutes),
        ));

        *self.task_handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        log::info!("Background scheduler started (interval: {} minutes)", interval_minutes);
        Ok(())
    }

    /// Stop the background task
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(SchedulerError::NotRunning);
        }

        if let Some(handle) = self
            .task_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }

        log::info!("Background scheduler stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn get_config(&self) -> SchedulerConfig {
        self.config.read().await.clone()
    }

    /// Update configuration and restart the task if needed
    pub async fn update_config(&self, enabled: bool, interval_minutes: u64) -> Result<(), SchedulerError> {
        validate_interval(interval_minutes)?;

        {
            let mut config = self.config.write().await;
            config.enabled = enabled;
            config.interval_minutes = interval_minutes;
        }
        self.save_config().await?;

        if self.is_running() {
            // Ignore error if it stopped in between
            let _ = self.stop().await;
        }
        if enabled {
            self.start().await?;
        }

        log::info!(
            "Scheduler config updated: enabled={}, interval={} minutes",
            enabled,
            interval_minutes
        );
        Ok(())
    }

    /// Start from the persisted configuration when it is enabled
    pub async fn resume(&self) -> Result<bool, SchedulerError> {
        self.load_config().await?;
        if !self.config.read().await.enabled {
            return Ok(false);
        }
        self.start().await?;
        Ok(true)
    }

    /// One automatic refresh pass
    pub async fn run_once(engine: &SyncEngine) {
        log::info!("Background refresh triggered by scheduler");

        match engine.load_catalog(false).await {
            Ok(outcome) => log::info!("Scheduled catalog refresh: {:?}", outcome),
            Err(e) => log::warn!("Scheduled catalog refresh failed: {}", e),
        }

        match engine.refresh_report_statuses(false).await {
            Ok(0) => {}
            Ok(changed) => log::info!("{} report statuses changed", changed),
            Err(e) => log::warn!("Scheduled report status refresh failed: {}", e),
        }
    }

    async fn scheduler_loop(
        running: Arc<AtomicBool>,
        engine: SyncEngine,
        cache: LocalCacheStore,
        config: Arc<RwLock<SchedulerConfig>>,
        period: Duration,
    ) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; startup already refreshed
        interval.tick().await;

        loop {
            interval.tick().await;

            if !running.load(Ordering::SeqCst) {
                log::info!("Scheduler loop: stopping (running flag is false)");
                break;
            }

            Self::run_once(&engine).await;

            let snapshot = {
                let mut cfg = config.write().await;
                cfg.last_run = Some(Utc::now());
                cfg.clone()
            };
            if let Err(e) = cache
                .blocking(move |cache| cache.set_setting(SCHEDULER_SETTING, &snapshot))
                .await
            {
                log::error!("Failed to save last_run timestamp: {}", e);
            }
        }

        log::info!("Scheduler loop exited");
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::network::{ConnectivityMonitor, NetworkStatus};
    use crate::remote::{MemoryKeyValueStore, MemoryRemoteStore, StaticNotificationCenter};

    fn scheduler() -> BackgroundScheduler {
        let engine = SyncEngine::new(
            EngineConfig::default(),
            LocalCacheStore::in_memory().unwrap(),
            Arc::new(MemoryRemoteStore::new("user-1")),
            Arc::new(MemoryKeyValueStore::new()),
            Arc::new(StaticNotificationCenter::new(true)),
            ConnectivityMonitor::with_status(NetworkStatus::Online),
        );
        BackgroundScheduler::new(engine)
    }

    #[tokio::test]
    async fn test_scheduler_new() {
        let scheduler = scheduler();
        assert!(!scheduler.is_running());

        let config = scheduler.get_config().await;
        assert!(!config.enabled);
        assert_eq!(config.interval_minutes, 30);
        assert!(config.last_run.is_none());
    }

    #[tokio::test]
    async fn test_save_load_config() {
        let scheduler = scheduler();
        let last_run = Utc::now();
        {
            let mut config = scheduler.config.write().await;
            config.enabled = true;
            config.interval_minutes = 60;
            config.last_run = Some(last_run);
        }
        scheduler.save_config().await.unwrap();

        *scheduler.config.write().await = SchedulerConfig::default();
        scheduler.load_config().await.unwrap();

        let loaded = scheduler.get_config().await;
        assert!(loaded.enabled);
        assert_eq!(loaded.interval_minutes, 60);
        assert_eq!(loaded.last_run, Some(last_run));
    }

    #[tokio::test]
    async fn test_invalid_interval() {
        let scheduler = scheduler();

        let result = scheduler.update_config(true, 0).await;
        assert!(matches!(result, Err(SchedulerError::InvalidInterval(_))));

        let result = scheduler.update_config(true, 2000).await;
        assert!(matches!(result, Err(SchedulerError::InvalidInterval(_))));
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn test_start_stop() {
        let scheduler = scheduler();

        scheduler.update_config(true, 15).await.unwrap();
        assert!(scheduler.is_running());
        assert!(matches!(scheduler.start().await, Err(SchedulerError::AlreadyRunning)));

        scheduler.stop().await.unwrap();
        assert!(!scheduler.is_running());
        assert!(matches!(scheduler.stop().await, Err(SchedulerError::NotRunning)));
    }

    #[tokio::test]
    async fn test_resume_from_persisted_config() {
        let scheduler = scheduler();
        assert!(!scheduler.resume().await.unwrap());

        scheduler.update_config(true, 5).await.unwrap();
        scheduler.stop().await.unwrap();

        assert!(scheduler.resume().await.unwrap());
        assert!(scheduler.is_running());
        scheduler.stop().await.unwrap();
    }
}
