//! Sync Engine - the facade the presentation layer depends on
//!
//! Coordinates the local cache, the catalog client, the user-state client,
//! the report client and the subscription manager, and publishes one
//! [`SyncState`] through a watch channel.
//!
//! Every published transition is a single `send_modify`, so a reader never
//! sees `is_loading == false` next to a half-applied catalog. Bookkeeping
//! (generations, in-flight counts, pending user edits, cooldown) sits behind a std
//! mutex that is never held across an await; when both are needed the
//! bookkeeping lock is taken first.

use super::catalog::CatalogClient;
use super::reports::{ReportClient, SubmissionLimiter};
use super::subscription::{NotificationState, SubscriptionError, SubscriptionManager};
use super::user_state::{
    FavoriteChange, PendingChanges, RecentSearches, SearchChange, UserChange, UserStateClient,
};
use crate::cache::{ReportStatusCache, StatusCacheConfig};
use crate::config::EngineConfig;
use crate::db::{CacheError, LocalCacheStore};
use crate::models::{CatalogSnapshot, Command, NewReport, Recipe, Report, ReportKind};
use crate::network::ConnectivityMonitor;
use crate::remote::{
    HttpKeyValueStore, HttpRemoteStore, KeyValueStore, NotificationCenter, RemoteError,
    RemoteStore,
};
use chrono::{DateTime, Utc};
use futures::{stream, StreamExt};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio_util::task::TaskTracker;

const NOTIFICATIONS_SETTING: &str = "notifications";
const DELETE_CONCURRENCY: usize = 4;

// ============================================================================
// Published state
// ============================================================================

/// Read-only view of everything the UI renders
#[derive(Debug, Clone, Default)]
pub struct SyncState {
    pub recipes: Arc<Vec<Recipe>>,
    pub commands: Arc<Vec<Command>>,
    pub favorites: BTreeSet<i64>,
    /// Most recent first
    pub recent_searches: Vec<String>,
    /// Newest first
    pub reports: Vec<Report>,

    pub is_loading: bool,
    pub is_manual_syncing: bool,
    pub is_connected: bool,
    /// When the displayed catalog was fetched
    pub last_updated: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub last_report_status_fetch: Option<DateTime<Utc>>,
    pub notifications: NotificationState,
}

/// Outcome of [`SyncEngine::load_catalog`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// A fresh catalog was applied
    Refreshed { recipes: usize, commands: usize },
    /// The cached snapshot stays visible (offline or absorbed failure)
    Cached,
    /// The fetch succeeded but a newer result had already been applied
    Superseded,
}

/// Result of a manual sync batch
#[derive(Debug, Clone, Default)]
pub struct SyncResult {
    pub catalog_synced: bool,
    pub favorites_synced: bool,
    pub searches_synced: bool,
    pub reports_synced: bool,
    pub errors: Vec<String>,
}

impl SyncResult {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn has_any_success(&self) -> bool {
        self.catalog_synced || self.favorites_synced || self.searches_synced || self.reports_synced
    }
}

/// Per-step outcome of [`SyncEngine::clear_all_data`]
#[derive(Debug)]
pub struct ClearAllSummary {
    /// Catalog cache rows removed
    pub catalog_cache: Result<usize, EngineError>,
    /// Mirrored reports removed
    pub report_mirror: Result<usize, EngineError>,
    pub favorites: Result<(), EngineError>,
    pub recent_searches: Result<(), EngineError>,
    /// Remote reports deleted
    pub reports: Result<usize, EngineError>,
}

impl ClearAllSummary {
    pub fn is_complete(&self) -> bool {
        self.catalog_cache.is_ok()
            && self.report_mirror.is_ok()
            && self.favorites.is_ok()
            && self.recent_searches.is_ok()
            && self.reports.is_ok()
    }

    pub fn errors(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if let Err(e) = &self.catalog_cache {
            errors.push(format!("Catalog cache: {}", e));
        }
        if let Err(e) = &self.report_mirror {
            errors.push(format!("Report mirror: {}", e));
        }
        if let Err(e) = &self.favorites {
            errors.push(format!("Favorites: {}", e));
        }
        if let Err(e) = &self.recent_searches {
            errors.push(format!("Recent searches: {}", e));
        }
        if let Err(e) = &self.reports {
            errors.push(format!("Reports: {}", e));
        }
        errors
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("No network connection")]
    Offline,

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Please wait {remaining_secs} seconds before submitting another report")]
    RateLimited { remaining_secs: u64 },

    #[error("Local cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("{0}")]
    Validation(String),

    #[error("Notification error: {0}")]
    Subscription(#[from] SubscriptionError),
}

// ============================================================================
// Shared internals
// ============================================================================

#[derive(Debug)]
struct Bookkeeping {
    next_generation: u64,
    applied_generation: u64,
    in_flight: usize,
    manual_in_flight: usize,
    limiter: SubmissionLimiter,
    /// Local edits not yet confirmed by the private store
    favorite_changes: PendingChanges<FavoriteChange>,
    search_changes: PendingChanges<SearchChange>,
}

fn lock(books: &StdMutex<Bookkeeping>) -> MutexGuard<'_, Bookkeeping> {
    books.lock().unwrap_or_else(PoisonError::into_inner)
}

fn apply_snapshot(state: &mut SyncState, snapshot: &CatalogSnapshot) {
    state.recipes = Arc::new(snapshot.recipes.clone());
    state.commands = Arc::new(snapshot.commands.clone());
    state.last_updated = Some(snapshot.fetched_at);
}

/// The pieces user-state pushes need; cloned into background tasks
#[derive(Clone)]
struct UserStateSync {
    client: UserStateClient,
    state: Arc<watch::Sender<SyncState>>,
    books: Arc<StdMutex<Bookkeeping>>,
    /// Serializes every read-modify-write against the private store
    push_lock: Arc<Mutex<()>>,
}

impl UserStateSync {
    fn report_failure(&self, what: &str, error: &RemoteError) {
        log::warn!("Failed to sync {}: {}", what, error);
        let message = format!("Failed to sync {}: {}", what, error);
        self.state.send_modify(|s| s.error_message = Some(message));
    }

    /// Pull favorites and replay queued changes on top of them.
    ///
    /// With `pull_when_idle` false an empty queue skips the round trip.
    /// Failed changes stay queued for the next attempt.
    async fn replay_favorites(&self, pull_when_idle: bool) -> Result<(), RemoteError> {
        let _guard = self.push_lock.lock().await;

        let (changes, through) = lock(&self.books).favorite_changes.snapshot();
        if changes.is_empty() && !pull_when_idle {
            return Ok(());
        }

        let mut favorites = self.client.apply_favorite_changes(&changes).await?;

        let mut books = lock(&self.books);
        books.favorite_changes.settle(through);
        books.favorite_changes.apply_to(&mut favorites);
        self.state.send_modify(|s| s.favorites = favorites);
        Ok(())
    }

    async fn replay_searches(&self, pull_when_idle: bool) -> Result<(), RemoteError> {
        let _guard = self.push_lock.lock().await;

        let (changes, through) = lock(&self.books).search_changes.snapshot();
        if changes.is_empty() && !pull_when_idle {
            return Ok(());
        }

        let mut searches = self.client.apply_search_changes(&changes).await?;

        let mut books = lock(&self.books);
        books.search_changes.settle(through);
        books.search_changes.apply_to(&mut searches);
        self.state
            .send_modify(|s| s.recent_searches = searches.into_entries());
        Ok(())
    }

    async fn push_favorites(&self) {
        if let Err(e) = self.replay_favorites(false).await {
            self.report_failure("favorites", &e);
        }
    }

    async fn push_searches(&self) {
        if let Err(e) = self.replay_searches(false).await {
            self.report_failure("recent searches", &e);
        }
    }

    /// Pull both collections, uploading anything queued while offline
    async fn sync_all(&self) {
        let pending = {
            let books = lock(&self.books);
            books.favorite_changes.len() + books.search_changes.len()
        };

        let favorites = self.replay_favorites(true).await;
        if let Err(e) = &favorites {
            self.report_failure("favorites", e);
        }
        let searches = self.replay_searches(true).await;
        if let Err(e) = &searches {
            self.report_failure("recent searches", e);
        }

        if pending > 0 && favorites.is_ok() && searches.is_ok() {
            log::info!("{} pending user-state changes uploaded", pending);
        }
    }

    /// Start a catalog fetch; it stays counted as in flight until the guard
    /// is finished or dropped
    fn begin_fetch(&self, manual: bool) -> FetchGuard<'_> {
        let mut books = lock(&self.books);
        books.next_generation += 1;
        books.in_flight += 1;
        if manual {
            books.manual_in_flight += 1;
        }
        let generation = books.next_generation;

        self.state.send_modify(|s| {
            s.is_loading = true;
            s.is_manual_syncing |= manual;
        });

        FetchGuard {
            user: self,
            generation,
            manual,
            settled: false,
        }
    }

    /// Count one fetch as done and republish the loading flags.
    /// Returns true when `result` carried a snapshot that was applied.
    fn settle_fetch(
        &self,
        generation: u64,
        manual: bool,
        result: Option<Result<&CatalogSnapshot, String>>,
    ) -> bool {
        let mut books = lock(&self.books);
        books.in_flight = books.in_flight.saturating_sub(1);
        if manual {
            books.manual_in_flight = books.manual_in_flight.saturating_sub(1);
        }

        let fresh = generation > books.applied_generation;
        let applied = fresh && matches!(result, Some(Ok(_)));
        if applied {
            books.applied_generation = generation;
        }

        let loading = books.in_flight > 0;
        let manual_syncing = books.manual_in_flight > 0;
        self.state.send_modify(|s| {
            s.is_loading = loading;
            s.is_manual_syncing = manual_syncing;
            match result {
                Some(Ok(snapshot)) if fresh => {
                    apply_snapshot(s, snapshot);
                    s.error_message = None;
                }
                Some(Err(message)) if fresh => s.error_message = Some(message),
                _ => {}
            }
        });

        applied
    }

    /// Mark a manual sync batch as running until the guard drops
    fn begin_manual_sync(&self) -> ManualSyncGuard<'_> {
        let mut books = lock(&self.books);
        books.manual_in_flight += 1;
        self.state.send_modify(|s| s.is_manual_syncing = true);
        ManualSyncGuard { user: self }
    }
}

/// One in-flight catalog fetch. Dropping it unfinished (the future was
/// cancelled or aborted) still releases the loading flags.
struct FetchGuard<'a> {
    user: &'a UserStateSync,
    generation: u64,
    manual: bool,
    settled: bool,
}

impl FetchGuard<'_> {
    fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns true when `result` carried a snapshot that was applied
    fn finish(mut self, result: Result<&CatalogSnapshot, String>) -> bool {
        self.settled = true;
        self.user
            .settle_fetch(self.generation, self.manual, Some(result))
    }
}

impl Drop for FetchGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            log::debug!("Catalog fetch {} dropped before completion", self.generation);
            self.user.settle_fetch(self.generation, self.manual, None);
        }
    }
}

struct ManualSyncGuard<'a> {
    user: &'a UserStateSync,
}

impl Drop for ManualSyncGuard<'_> {
    fn drop(&mut self) {
        let mut books = lock(&self.user.books);
        books.manual_in_flight = books.manual_in_flight.saturating_sub(1);
        let manual_syncing = books.manual_in_flight > 0;
        self.user
            .state
            .send_modify(|s| s.is_manual_syncing = manual_syncing);
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Sync engine facade. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct SyncEngine {
    config: Arc<EngineConfig>,
    cache: LocalCacheStore,
    connectivity: ConnectivityMonitor,
    catalog: CatalogClient,
    reports: ReportClient,
    subscriptions: Arc<SubscriptionManager>,
    user: UserStateSync,
    pending: TaskTracker,
    /// Held while persisting a catalog so an older snapshot never lands last
    persist_lock: Arc<Mutex<()>>,
    started: Arc<AtomicBool>,
}

impl SyncEngine {
    /// Build an engine over explicit collaborators
    pub fn new(
        config: EngineConfig,
        cache: LocalCacheStore,
        remote: Arc<dyn RemoteStore>,
        private: Arc<dyn KeyValueStore>,
        notifications: Arc<dyn NotificationCenter>,
        connectivity: ConnectivityMonitor,
    ) -> Self {
        let notification_state = match cache.get_setting::<NotificationState>(NOTIFICATIONS_SETTING) {
            Ok(state) => state.unwrap_or_default(),
            Err(e) => {
                log::warn!("Failed to read notification setting: {}", e);
                NotificationState::default()
            }
        };

        let status_cache = ReportStatusCache::with_config(StatusCacheConfig {
            ttl_secs: config.report_status_ttl().as_secs(),
            ..StatusCacheConfig::default()
        });

        let initial = SyncState {
            is_connected: connectivity.is_connected(),
            notifications: notification_state,
            ..SyncState::default()
        };

        let books = Bookkeeping {
            next_generation: 0,
            applied_generation: 0,
            in_flight: 0,
            manual_in_flight: 0,
            limiter: SubmissionLimiter::new(Duration::from_secs(config.submission_cooldown_secs)),
            favorite_changes: PendingChanges::new(),
            search_changes: PendingChanges::new(),
        };

        let (state, _rx) = watch::channel(initial);

        Self {
            catalog: CatalogClient::new(remote.clone(), config.page_size),
            reports: ReportClient::new(remote.clone(), status_cache),
            subscriptions: Arc::new(SubscriptionManager::with_state(
                remote,
                notifications,
                notification_state,
            )),
            user: UserStateSync {
                client: UserStateClient::new(private, config.recent_search_limit),
                state: Arc::new(state),
                books: Arc::new(StdMutex::new(books)),
                push_lock: Arc::new(Mutex::new(())),
            },
            config: Arc::new(config),
            cache,
            connectivity,
            pending: TaskTracker::new(),
            persist_lock: Arc::new(Mutex::new(())),
            started: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Build an engine talking to the hosted stores
    pub fn from_config(
        config: EngineConfig,
        notifications: Arc<dyn NotificationCenter>,
        connectivity: ConnectivityMonitor,
    ) -> Result<Self, EngineError> {
        let timeout = Duration::from_secs(config.request_timeout_secs);
        let remote = HttpRemoteStore::new(&config.remote_base_url, timeout, config.api_token.clone())?;
        let private =
            HttpKeyValueStore::new(&config.private_base_url, timeout, config.api_token.clone())?;
        let cache = LocalCacheStore::new(config.cache_path.clone())?;

        Ok(Self::new(
            config,
            cache,
            Arc::new(remote),
            Arc::new(private),
            notifications,
            connectivity,
        ))
    }

    /// Cold start: show cached data, then refresh in the background.
    ///
    /// Calling it again is a no-op.
    pub async fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        self.spawn_connectivity_listener();

        if self.restore_cached_catalog().await {
            log::info!("Showing cached catalog while refreshing");
        }
        self.restore_report_mirror().await;

        let engine = self.clone();
        self.pending.spawn(async move {
            // automatic: failures are absorbed into error_message
            let _ = engine.load_catalog(false).await;
        });

        if self.connectivity.is_connected() {
            let user = self.user.clone();
            self.pending.spawn(async move { user.sync_all().await });
        }
    }

    fn spawn_connectivity_listener(&self) {
        let mut rx = self.connectivity.subscribe();
        let user = self.user.clone();

        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let connected = rx.borrow_and_update().is_connected();
                user.state.send_modify(|s| s.is_connected = connected);

                if connected {
                    user.sync_all().await;
                }
            }
            log::debug!("Connectivity listener stopped");
        });
    }

    // ========================================================================
    // State access
    // ========================================================================

    /// Snapshot of the published state
    pub fn state(&self) -> SyncState {
        let mut state = self.user.state.borrow().clone();
        state.is_connected = self.connectivity.is_connected();
        state
    }

    /// Change notifications for the published state
    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.user.state.subscribe()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cache(&self) -> &LocalCacheStore {
        &self.cache
    }

    pub fn is_connected(&self) -> bool {
        self.connectivity.is_connected()
    }

    /// Wait for every fire-and-forget task spawned so far
    pub async fn flush_pending(&self) {
        self.pending.close();
        self.pending.wait().await;
        self.pending.reopen();
    }

    pub fn is_favorite(&self, id: i64) -> bool {
        self.user.state.borrow().favorites.contains(&id)
    }

    /// Favorites in catalog order. Ids missing from the catalog are skipped.
    pub fn favorite_recipes(&self) -> Vec<Recipe> {
        let state = self.user.state.borrow();
        state
            .recipes
            .iter()
            .filter(|r| state.favorites.contains(&r.id))
            .cloned()
            .collect()
    }

    pub fn recipe(&self, id: i64) -> Option<Recipe> {
        self.user
            .state
            .borrow()
            .recipes
            .iter()
            .find(|r| r.id == id)
            .cloned()
    }

    /// Case-insensitive name search in catalog order
    pub fn search(&self, query: &str) -> Vec<Recipe> {
        self.user
            .state
            .borrow()
            .recipes
            .iter()
            .filter(|r| r.matches_name(query))
            .cloned()
            .collect()
    }

    pub fn recent_searches(&self) -> Vec<String> {
        self.user.state.borrow().recent_searches.clone()
    }

    /// Seconds until another report may be submitted
    pub fn submission_cooldown_remaining(&self) -> Option<u64> {
        lock(&self.user.books)
            .limiter
            .remaining(Instant::now())
            .map(|d| d.as_secs() + u64::from(d.subsec_nanos() > 0))
    }

    // ========================================================================
    // Catalog
    // ========================================================================

    /// Fetch the catalog.
    ///
    /// Automatic loads never fail: offline or on error the cached snapshot
    /// stays visible and only `error_message` is set. Manual loads always hit
    /// the network and report failures.
    pub async fn load_catalog(&self, manual: bool) -> Result<LoadOutcome, EngineError> {
        if !manual {
            let empty = self.user.state.borrow().recipes.is_empty();
            if empty {
                self.restore_cached_catalog().await;
            }
        }

        if !self.connectivity.is_connected() {
            if manual {
                return Err(EngineError::Offline);
            }
            log::info!("Offline, keeping cached catalog");
            return Ok(LoadOutcome::Cached);
        }

        let fetch = self.user.begin_fetch(manual);
        let generation = fetch.generation();
        let result = self.catalog.fetch_all(manual).await;

        match result {
            Ok(snapshot) => {
                let outcome = LoadOutcome::Refreshed {
                    recipes: snapshot.recipes.len(),
                    commands: snapshot.commands.len(),
                };
                if !fetch.finish(Ok(&snapshot)) {
                    log::debug!("Catalog generation {} superseded", generation);
                    return Ok(LoadOutcome::Superseded);
                }

                if let Err(e) = self.persist_catalog(generation, snapshot).await {
                    log::error!("Failed to cache catalog: {}", e);
                    let message = format!("Failed to cache catalog: {}", e);
                    self.user
                        .state
                        .send_modify(|s| s.error_message = Some(message));
                    if manual {
                        return Err(EngineError::Cache(e));
                    }
                }
                Ok(outcome)
            }
            Err(e) => {
                log::warn!("Catalog fetch failed: {}", e);
                fetch.finish(Err(format!("Failed to load recipes: {}", e)));
                if manual {
                    Err(EngineError::Remote(e))
                } else {
                    Ok(LoadOutcome::Cached)
                }
            }
        }
    }

    async fn persist_catalog(&self, generation: u64, snapshot: CatalogSnapshot) -> Result<(), CacheError> {
        let _guard = self.persist_lock.lock().await;
        let current = lock(&self.user.books).applied_generation;
        if current != generation {
            return Ok(());
        }
        self.cache.blocking(move |cache| cache.save(&snapshot)).await
    }

    /// Show the cached catalog if nothing fresher has been applied
    async fn restore_cached_catalog(&self) -> bool {
        let snapshot = match self.cache.blocking(|cache| cache.load()).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return false,
            Err(e) => {
                log::warn!("Failed to read catalog cache: {}", e);
                return false;
            }
        };

        let books = lock(&self.user.books);
        let showing = !self.user.state.borrow().recipes.is_empty();
        if books.applied_generation > 0 || showing {
            return false;
        }

        log::info!(
            "Restored {} cached recipes from {}",
            snapshot.recipes.len(),
            snapshot.fetched_at
        );
        self.user.state.send_modify(|s| apply_snapshot(s, &snapshot));
        true
    }

    async fn restore_report_mirror(&self) {
        match self.cache.blocking(|cache| cache.load_reports()).await {
            Ok(reports) if !reports.is_empty() => {
                self.user.state.send_modify(|s| {
                    if s.reports.is_empty() {
                        s.reports = reports;
                    }
                });
            }
            Ok(_) => {}
            Err(e) => log::warn!("Failed to read report mirror: {}", e),
        }
    }

    /// Full refresh of catalog, favorites, recent searches and reports as one batch
    pub async fn manual_sync(&self) -> Result<SyncResult, EngineError> {
        if !self.connectivity.is_connected() {
            return Err(EngineError::Offline);
        }

        let batch = self.user.begin_manual_sync();
        let (catalog, favorites, searches, reports) = tokio::join!(
            self.load_catalog(true),
            self.user.replay_favorites(true),
            self.user.replay_searches(true),
            self.list_my_reports(),
        );
        drop(batch);

        let mut result = SyncResult::default();
        match catalog {
            Ok(_) => result.catalog_synced = true,
            Err(e) => result.errors.push(format!("Catalog: {}", e)),
        }
        match favorites {
            Ok(()) => result.favorites_synced = true,
            Err(e) => result.errors.push(format!("Favorites: {}", e)),
        }
        match searches {
            Ok(()) => result.searches_synced = true,
            Err(e) => result.errors.push(format!("Recent searches: {}", e)),
        }
        match reports {
            Ok(_) => result.reports_synced = true,
            Err(e) => result.errors.push(format!("Reports: {}", e)),
        }

        if result.is_success() {
            log::info!("Manual sync completed");
        } else {
            log::warn!("Manual sync finished with {} errors: {:?}", result.errors.len(), result.errors);
        }
        Ok(result)
    }

    // ========================================================================
    // Favorites & recent searches
    // ========================================================================

    /// Flip membership in memory and push in the background.
    ///
    /// Returns the new membership. The change is queued and replayed on top
    /// of the stored set, so edits from other devices survive. A failed push
    /// is not rolled back; it sets `error_message` and stays queued for the
    /// next sync or reconnect. Must be called inside a Tokio runtime.
    pub fn toggle_favorite(&self, id: i64) -> bool {
        let mut added = false;
        {
            let mut books = lock(&self.user.books);
            self.user.state.send_modify(|s| {
                added = s.favorites.insert(id);
                if !added {
                    s.favorites.remove(&id);
                }
            });
            books
                .favorite_changes
                .push(FavoriteChange::Set { id, favorite: added });
        }

        if self.connectivity.is_connected() {
            let user = self.user.clone();
            self.pending.spawn(async move { user.push_favorites().await });
        } else {
            log::debug!("Offline, favorite {} queued", id);
        }

        added
    }

    /// Record a search in memory and push in the background.
    /// Returns false for a blank name. Must be called inside a Tokio runtime.
    pub fn save_recent_search(&self, name: &str) -> bool {
        let name = name.trim();
        if name.is_empty() {
            return false;
        }

        let change = SearchChange::Record(name.to_string());
        let limit = self.config.recent_search_limit;
        {
            let mut books = lock(&self.user.books);
            self.user.state.send_modify(|s| {
                let mut searches =
                    RecentSearches::from_entries(std::mem::take(&mut s.recent_searches), limit);
                change.apply(&mut searches);
                s.recent_searches = searches.into_entries();
            });
            books.search_changes.push(change);
        }

        if self.connectivity.is_connected() {
            let user = self.user.clone();
            self.pending.spawn(async move { user.push_searches().await });
        }
        true
    }

    /// Empty the history locally; the remote copy follows now or on reconnect
    pub async fn clear_recent_searches(&self) -> Result<(), EngineError> {
        {
            let mut books = lock(&self.user.books);
            books.search_changes.push(SearchChange::Clear);
            self.user.state.send_modify(|s| s.recent_searches.clear());
        }

        if !self.connectivity.is_connected() {
            return Ok(());
        }

        self.user.replay_searches(false).await?;
        Ok(())
    }

    // ========================================================================
    // Reports
    // ========================================================================

    /// Validate, rate-limit and submit a report
    pub async fn submit_report(
        &self,
        kind: ReportKind,
        name: &str,
        category: &str,
        description: &str,
    ) -> Result<Report, EngineError> {
        self.submit_report_at(kind, name, category, description, Instant::now())
            .await
    }

    pub(crate) async fn submit_report_at(
        &self,
        kind: ReportKind,
        name: &str,
        category: &str,
        description: &str,
        now: Instant,
    ) -> Result<Report, EngineError> {
        let report =
            NewReport::validate(kind, name, category, description).map_err(EngineError::Validation)?;

        if !self.connectivity.is_connected() {
            return Err(EngineError::Offline);
        }

        let previous = lock(&self.user.books)
            .limiter
            .try_acquire(now)
            .map_err(|remaining_secs| {
                log::info!("Report submission rate limited ({}s left)", remaining_secs);
                EngineError::RateLimited { remaining_secs }
            })?;

        let created = match self.reports.submit(&report).await {
            Ok(created) => created,
            Err(e) => {
                lock(&self.user.books).limiter.restore(previous);
                log::warn!("Report submission failed: {}", e);
                return Err(EngineError::Remote(e));
            }
        };

        let mirrored = created.clone();
        if let Err(e) = self.cache.blocking(move |cache| cache.upsert_report(&mirrored)).await {
            log::warn!("Failed to mirror report {}: {}", created.id, e);
        }

        let inserted = created.clone();
        self.user.state.send_modify(|s| {
            s.reports.retain(|r| r.id != inserted.id);
            s.reports.insert(0, inserted);
        });

        Ok(created)
    }

    /// The user's reports. Offline, the last known list is returned instead.
    pub async fn list_my_reports(&self) -> Result<Vec<Report>, EngineError> {
        if !self.connectivity.is_connected() {
            return Ok(self.user.state.borrow().reports.clone());
        }

        let reports = self.reports.list_mine().await?;

        let mirrored = reports.clone();
        if let Err(e) = self.cache.blocking(move |cache| cache.save_reports(&mirrored)).await {
            log::warn!("Failed to mirror reports: {}", e);
        }

        let published = reports.clone();
        self.user.state.send_modify(|s| {
            s.reports = published;
            s.last_report_status_fetch = Some(Utc::now());
        });
        Ok(reports)
    }

    /// Delete a report remotely and locally. Already-deleted counts as success.
    pub async fn delete_report(&self, report: &Report) -> Result<(), EngineError> {
        if !self.connectivity.is_connected() {
            return Err(EngineError::Offline);
        }

        self.reports.delete_mine(report).await?;

        let id = report.id.clone();
        self.user
            .state
            .send_modify(|s| s.reports.retain(|r| r.id != id));

        let id = report.id.clone();
        self.cache.blocking(move |cache| cache.remove_report(&id)).await?;
        Ok(())
    }

    /// Re-fetch pending report statuses, at most once per TTL unless forced.
    /// Returns how many reports changed status.
    pub async fn refresh_report_statuses(&self, force: bool) -> Result<usize, EngineError> {
        if !self.connectivity.is_connected() {
            return Ok(0);
        }

        let (reports, last_fetch) = {
            let state = self.user.state.borrow();
            (state.reports.clone(), state.last_report_status_fetch)
        };
        if reports.is_empty() {
            return Ok(0);
        }

        let ttl = chrono::Duration::seconds(self.config.report_status_ttl().as_secs() as i64);
        if !force {
            if let Some(last) = last_fetch {
                if Utc::now() - last < ttl {
                    log::debug!("Report statuses fetched at {}, skipping", last);
                    return Ok(0);
                }
            }
        }

        let poll = self.reports.poll_statuses(&reports, force).await?;

        let changed: Vec<Report> = reports
            .iter()
            .filter_map(|report| {
                let status = *poll.statuses.get(&report.id)?;
                (status != report.status).then(|| Report {
                    status,
                    ..report.clone()
                })
            })
            .collect();

        let updates = changed.clone();
        let fetched_remote = poll.fetched_remote;
        self.user.state.send_modify(|s| {
            for update in &updates {
                if let Some(report) = s.reports.iter_mut().find(|r| r.id == update.id) {
                    report.status = update.status;
                }
            }
            if fetched_remote {
                s.last_report_status_fetch = Some(Utc::now());
            }
        });

        for report in &changed {
            log::info!("Report {} is now {}", report.id, report.status.as_str());
            let mirrored = report.clone();
            if let Err(e) = self.cache.blocking(move |cache| cache.upsert_report(&mirrored)).await {
                log::warn!("Failed to mirror report {}: {}", report.id, e);
            }
        }

        Ok(changed.len())
    }

    // ========================================================================
    // Clearing
    // ========================================================================

    /// Drop the cached catalog on disk and in memory.
    /// Favorites and recent searches are untouched. On failure nothing changes.
    pub async fn clear_cache(&self) -> Result<(), EngineError> {
        let removed = self.cache.blocking(|cache| cache.clear_catalog_cache()).await?;

        self.user.state.send_modify(|s| {
            s.recipes = Arc::new(Vec::new());
            s.commands = Arc::new(Vec::new());
            s.last_updated = None;
        });
        log::debug!("In-memory catalog dropped after removing {} cache entries", removed);
        Ok(())
    }

    /// Best-effort wipe of all user data, local and remote.
    ///
    /// Every step runs regardless of the others and reports on its own.
    /// In-memory state is cleared whatever the remote outcome.
    pub async fn clear_all_data(&self) -> ClearAllSummary {
        let connected = self.connectivity.is_connected();

        let (catalog_cache, report_mirror) =
            match self.cache.blocking(|cache| Ok(cache.clear_all())).await {
                Ok(summary) => (
                    summary.catalog.map_err(EngineError::Cache),
                    summary.report_mirror.map_err(EngineError::Cache),
                ),
                Err(e) => {
                    let message = e.to_string();
                    (
                        Err(EngineError::Cache(e)),
                        Err(EngineError::Cache(CacheError::Task(message))),
                    )
                }
            };

        let reports_to_delete = {
            let mut books = lock(&self.user.books);
            books.favorite_changes.push(FavoriteChange::Clear);
            books.search_changes.push(SearchChange::Clear);

            let mut known = Vec::new();
            self.user.state.send_modify(|s| {
                known = std::mem::take(&mut s.reports);
                s.recipes = Arc::new(Vec::new());
                s.commands = Arc::new(Vec::new());
                s.last_updated = None;
                s.favorites.clear();
                s.recent_searches.clear();
                s.last_report_status_fetch = None;
            });
            known
        };
        self.reports.clear_status_cache().await;

        let (favorites, recent_searches, reports) = if connected {
            let favorites = self.user.replay_favorites(false).await.map_err(EngineError::from);
            let recent_searches = self.user.replay_searches(false).await.map_err(EngineError::from);
            let reports = self.delete_all_reports(reports_to_delete).await;
            (favorites, recent_searches, reports)
        } else {
            (
                Err(EngineError::Offline),
                Err(EngineError::Offline),
                Err(EngineError::Offline),
            )
        };

        let summary = ClearAllSummary {
            catalog_cache,
            report_mirror,
            favorites,
            recent_searches,
            reports,
        };

        if summary.is_complete() {
            log::info!("All data cleared");
        } else {
            log::warn!("Clear all data incomplete: {:?}", summary.errors());
        }
        summary
    }

    /// Delete every report the user owns remotely, including ones not listed locally
    async fn delete_all_reports(&self, known: Vec<Report>) -> Result<usize, EngineError> {
        let reports = match self.reports.list_mine().await {
            Ok(remote) => remote,
            Err(e) => {
                log::warn!("Failed to list reports for deletion, using local list: {}", e);
                known
            }
        };

        let results: Vec<(&str, Result<(), RemoteError>)> = stream::iter(reports.iter())
            .map(|report| async move { (report.id.as_str(), self.reports.delete_mine(report).await) })
            .buffer_unordered(DELETE_CONCURRENCY)
            .collect()
            .await;

        let mut deleted = 0;
        let mut first_error = None;
        for (id, result) in results {
            match result {
                Ok(()) => deleted += 1,
                Err(e) => {
                    log::error!("Failed to delete report {}: {}", id, e);
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(EngineError::Remote(e)),
            None => Ok(deleted),
        }
    }

    // ========================================================================
    // Notifications
    // ========================================================================

    /// Enable or disable report status notifications.
    ///
    /// On failure the published toggle keeps its previous value.
    pub async fn set_notifications_enabled(&self, enabled: bool) -> Result<NotificationState, EngineError> {
        if !self.connectivity.is_connected() {
            return Err(EngineError::Offline);
        }

        let result = self.subscriptions.set_enabled(enabled).await;
        let state = self.subscriptions.state().await;
        self.user.state.send_modify(|s| s.notifications = state);

        let state = result?;
        self.persist_notification_state(state).await;
        Ok(state)
    }

    /// The platform withdrew notification permission
    pub async fn notification_permission_revoked(&self) -> Result<NotificationState, EngineError> {
        let result = self.subscriptions.permission_revoked().await;
        let state = self.subscriptions.state().await;
        self.user.state.send_modify(|s| s.notifications = state);

        let state = result?;
        self.persist_notification_state(state).await;
        Ok(state)
    }

    async fn persist_notification_state(&self, state: NotificationState) {
        if let Err(e) = self
            .cache
            .blocking(move |cache| cache.set_setting(NOTIFICATIONS_SETTING, &state))
            .await
        {
            log::warn!("Failed to save notification setting: {}", e);
        }
    }
}
