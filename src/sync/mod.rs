//! Sync Module - catalog, user-state and report synchronization
//!
//! Reconciles the local cache against two remote stores:
//! - Catalog (recipes, reference commands) from the public shared store
//! - Favorites and recent searches in the per-user private store
//! - User-submitted reports and their push subscription in the shared store
//!
//! Architecture:
//! - One client per dataset, each owning its wire format
//! - `SyncEngine` orchestrates them and publishes a single state snapshot
//! - Conflict Resolution: last writer wins per key for user state

pub mod catalog;
pub mod engine;
pub mod reports;
pub mod scheduler;
pub mod subscription;
pub mod user_state;


// Re-export commonly used types
pub use catalog::{CatalogClient, CommandRecord, RecipeRecord};
pub use engine::{ClearAllSummary, EngineError, LoadOutcome, SyncEngine, SyncResult, SyncState};
pub use reports::{ReportClient, StatusPoll, SubmissionLimiter};
pub use scheduler::{BackgroundScheduler, SchedulerConfig, SchedulerError};
pub use subscription::{subscription_id, NotificationState, SubscriptionError, SubscriptionManager};
pub use user_state::{
    FavoriteChange, PendingChanges, RecentSearches, SearchChange, UserChange, UserStateClient,
    FAVORITES_KEY, RECENT_SEARCHES_KEY,
};
