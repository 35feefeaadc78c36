//! Report status cache - TTL cache for polled report statuses
//!
//! Holds the last status fetched for each report so repeated polls inside
//! the TTL window never reach the network:
//! - TTL expiration (entries age out after the poll interval)
//! - Bounded capacity
//! - Thread-safe async operations

use crate::models::ReportStatus;
use moka::future::Cache;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Status cache configuration
pub struct StatusCacheConfig {
    /// Maximum number of reports tracked
    pub max_capacity: u64,

    /// Time-to-live for a fetched status (in seconds)
    pub ttl_secs: u64,
}

impl Default for StatusCacheConfig {
    fn default() -> Self {
        Self {
            max_capacity: 1000,
            ttl_secs: 60,
        }
    }
}

/// Cache of the most recently fetched status per report id
#[derive(Clone)]
pub struct ReportStatusCache {
    cache: Arc<Cache<String, ReportStatus>>,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
}

impl ReportStatusCache {
    /// Create a new status cache with default configuration
    pub fn new() -> Self {
        Self::with_config(StatusCacheConfig::default())
    }

    /// Create a new status cache with custom configuration
    pub fn with_config(config: StatusCacheConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.max_capacity)
            .time_to_live(Duration::from_secs(config.ttl_secs))
            .build();

        Self {
            cache: Arc::new(cache),
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Get a cached status
    pub async fn get(&self, report_id: &str) -> Option<ReportStatus> {
        match self.cache.get(report_id).await {
            Some(status) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(status)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Record a freshly fetched status
    pub async fn insert(&self, report_id: String, status: ReportStatus) {
        self.cache.insert(report_id, status).await;
    }

    /// Forget one report
    pub async fn remove(&self, report_id: &str) {
        self.cache.invalidate(report_id).await;
    }

    /// Forget everything
    pub async fn clear(&self) {
        self.cache.invalidate_all();
        // Wait for invalidation to complete
        self.cache.run_pending_tasks().await;
    }

    /// Get cache statistics
    pub fn stats(&self) -> StatusCacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);

        StatusCacheStats {
            hits,
            misses,
            entry_count: self.cache.entry_count(),
        }
    }
}

impl Default for ReportStatusCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Cache statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StatusCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entry_count: u64,
}
