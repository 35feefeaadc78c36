//! Remote collaborators
//!
//! The engine talks to three external services through the traits below:
//! - [`RemoteStore`]: shared record store (catalog, reports, push subscriptions)
//! - [`KeyValueStore`]: per-user private store (favorites, recent searches)
//! - [`NotificationCenter`]: local notification permission and push registration
//!
//! `http` implements the stores over HTTPS, `memory` keeps everything in
//! process for tests and offline demos.

pub mod http;
pub mod memory;

pub use http::{HttpKeyValueStore, HttpRemoteStore};
pub use memory::{MemoryKeyValueStore, MemoryRemoteStore, StaticNotificationCenter};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Record type names in the shared store
pub const RECIPE_RECORD: &str = "Recipe";
pub const COMMAND_RECORD: &str = "Command";
pub const REPORT_RECORD: &str = "Report";

// ============================================================================
// Records & Queries
// ============================================================================

/// A record in the shared store. `created_by` and `created_at` are assigned by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub record_type: String,
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,

    pub fields: serde_json::Value,
}

impl Record {
    /// Build a record from typed fields
    pub fn new<T: Serialize>(
        record_type: &str,
        id: impl Into<String>,
        fields: &T,
    ) -> Result<Self, RemoteError> {
        let fields = serde_json::to_value(fields)
            .map_err(|e| RemoteError::InvalidResponse(format!("encode fields: {}", e)))?;

        Ok(Self {
            record_type: record_type.to_string(),
            id: id.into(),
            created_by: None,
            created_at: None,
            fields,
        })
    }

    /// Decode the fields into a typed value
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, RemoteError> {
        serde_json::from_value(self.fields.clone()).map_err(|e| {
            RemoteError::InvalidResponse(format!(
                "{} record {}: {}",
                self.record_type, self.id, e
            ))
        })
    }
}

/// Query filter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Predicate {
    /// Every record of the type
    All,
    /// Records created by one user
    CreatedBy { user_id: String },
    /// Records with one of the given ids
    IdIn { ids: Vec<String> },
}

impl Predicate {
    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Predicate::All => true,
            Predicate::CreatedBy { user_id } => record.created_by.as_deref() == Some(user_id),
            Predicate::IdIn { ids } => ids.iter().any(|id| *id == record.id),
        }
    }
}

/// Paginated query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub record_type: String,
    pub predicate: Predicate,

    /// Field to sort by; store order when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_by: Option<String>,

    #[serde(default = "default_ascending")]
    pub ascending: bool,

    pub page_size: u32,
}

fn default_ascending() -> bool {
    true
}

impl Query {
    pub fn new(record_type: &str, predicate: Predicate, page_size: u32) -> Self {
        Self {
            record_type: record_type.to_string(),
            predicate,
            sort_by: None,
            ascending: true,
            page_size,
        }
    }

    pub fn sorted_by(mut self, field: &str, ascending: bool) -> Self {
        self.sort_by = Some(field.to_string());
        self.ascending = ascending;
        self
    }
}

/// Opaque continuation token
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(pub String);

/// One page of query results; `cursor` is `None` on the last page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryPage {
    pub records: Vec<Record>,
    #[serde(default)]
    pub cursor: Option<Cursor>,
}

// ============================================================================
// Push subscriptions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionEvent {
    RecordCreated,
    RecordUpdated,
    RecordDeleted,
}

/// Query-based push subscription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub record_type: String,
    pub predicate: Predicate,
    pub fires_on: Vec<SubscriptionEvent>,
    pub alert_body: String,
}

// ============================================================================
// Collaborator traits
// ============================================================================

/// Shared record store
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Identity of the signed-in user
    async fn current_user_id(&self) -> Result<String, RemoteError>;

    /// Fetch one page
    async fn query(&self, query: &Query, cursor: Option<&Cursor>) -> Result<QueryPage, RemoteError>;

    /// Create or update a record, returning it with server metadata
    async fn save_record(&self, record: &Record) -> Result<Record, RemoteError>;

    /// Delete a record. A missing record yields [`RemoteError::NotFound`].
    async fn delete_record(&self, record_type: &str, id: &str) -> Result<(), RemoteError>;

    /// Create or replace a subscription with the same id
    async fn save_subscription(&self, subscription: &Subscription) -> Result<(), RemoteError>;

    /// Delete a subscription. A missing subscription yields [`RemoteError::NotFound`].
    async fn delete_subscription(&self, id: &str) -> Result<(), RemoteError>;
}

/// Per-user key-value store with cross-device propagation
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, RemoteError>;

    async fn set(&self, key: &str, value: &serde_json::Value) -> Result<(), RemoteError>;
}

/// Local notification permission and remote push registration
#[async_trait]
pub trait NotificationCenter: Send + Sync {
    /// Ask the user for permission; true when granted
    async fn request_permission(&self) -> bool;

    /// Register the device for remote pushes
    async fn register_for_push(&self);
}

// ============================================================================
// Pagination
// ============================================================================

/// Follow cursors until the query is exhausted.
///
/// Any page error aborts the whole fetch; a partial result is never returned.
pub async fn fetch_all_pages(
    remote: &dyn RemoteStore,
    query: &Query,
) -> Result<Vec<Record>, RemoteError> {
    let mut records = Vec::new();
    let mut cursor: Option<Cursor> = None;
    let mut seen: HashSet<Cursor> = HashSet::new();
    let mut pages = 0usize;

    loop {
        let page = remote.query(query, cursor.as_ref()).await?;
        pages += 1;
        records.extend(page.records);

        match page.cursor {
            Some(next) => {
                if !seen.insert(next.clone()) {
                    return Err(RemoteError::InvalidResponse(format!(
                        "cursor {} repeated while paging {}",
                        next.0, query.record_type
                    )));
                }
                cursor = Some(next);
            }
            None => break,
        }
    }

    log::debug!(
        "Fetched {} {} records in {} pages",
        records.len(),
        query.record_type,
        pages
    );
    Ok(records)
}

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Request timed out")]
    Timeout,

    #[error("Unauthorized - sign in required")]
    Unauthorized,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid response from server: {0}")]
    InvalidResponse(String),
}

impl RemoteError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RemoteError::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str, created_by: Option<&str>) -> Record {
        Record {
            record_type: REPORT_RECORD.to_string(),
            id: id.to_string(),
            created_by: created_by.map(str::to_string),
            created_at: None,
            fields: json!({}),
        }
    }

    #[test]
    fn test_predicate_matches() {
        let mine = record("a", Some("user-1"));
        let theirs = record("b", Some("user-2"));

        let created_by = Predicate::CreatedBy {
            user_id: "user-1".to_string(),
        };
        assert!(created_by.matches(&mine));
        assert!(!created_by.matches(&theirs));

        let id_in = Predicate::IdIn {
            ids: vec!["b".to_string()],
        };
        assert!(id_in.matches(&theirs));
        assert!(!id_in.matches(&mine));
        assert!(Predicate::All.matches(&mine));
    }

    #[test]
    fn test_record_typed_fields() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Fields {
            name: String,
        }

        let record = Record::new(
            RECIPE_RECORD,
            "1",
            &Fields {
                name: "Torch".to_string(),
            },
        )
        .unwrap();
        assert_eq!(record.fields, json!({"name": "Torch"}));

        let decoded: Fields = record.decode().unwrap();
        assert_eq!(decoded.name, "Torch");

        let bad = Record {
            fields: json!({"name": 5}),
            ..record
        };
        assert!(matches!(
            bad.decode::<Fields>(),
            Err(RemoteError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_predicate_wire_format() {
        let value = serde_json::to_value(Predicate::CreatedBy {
            user_id: "u".to_string(),
        })
        .unwrap();
        assert_eq!(value, json!({"kind": "created_by", "user_id": "u"}));
    }

    #[tokio::test]
    async fn test_fetch_all_pages_follows_cursors() {
        let store = MemoryRemoteStore::new("user-1");
        for i in 0..7 {
            store.insert_record(Record::new(RECIPE_RECORD, i.to_string(), &json!({"id": i})).unwrap());
        }

        let query = Query::new(RECIPE_RECORD, Predicate::All, 3);
        let records = fetch_all_pages(&store, &query).await.unwrap();
        assert_eq!(records.len(), 7);
        assert_eq!(store.request_count(), 3);
    }

    #[tokio::test]
    async fn test_fetch_all_pages_aborts_on_page_error() {
        let store = MemoryRemoteStore::new("user-1");
        for i in 0..7 {
            store.insert_record(Record::new(RECIPE_RECORD, i.to_string(), &json!({"id": i})).unwrap());
        }
        store.fail_queries_after(Some(1));

        let query = Query::new(RECIPE_RECORD, Predicate::All, 3);
        let result = fetch_all_pages(&store, &query).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_not_found_detection() {
        assert!(RemoteError::NotFound("x".to_string()).is_not_found());
        assert!(!RemoteError::Timeout.is_not_found());
    }
}
