//! In-process collaborators
//!
//! Behave like the hosted stores (server-assigned metadata, cursor paging,
//! `NotFound` on missing deletes) and count every request so callers can
//! verify when the network was touched.

use super::{
    Cursor, KeyValueStore, NotificationCenter, Query, QueryPage, Record, RemoteError,
    RemoteStore, Subscription,
};
use async_trait::async_trait;
use chrono::Utc;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

const DEFAULT_PAGE_SIZE: usize = 100;

#[derive(Default)]
struct RemoteInner {
    records: BTreeMap<(String, String), Record>,
    subscriptions: HashMap<String, Subscription>,
    queries_served: usize,
    fail_queries_after: Option<usize>,
}

/// Shared record store held in memory
pub struct MemoryRemoteStore {
    user_id: String,
    inner: Mutex<RemoteInner>,
    requests: AtomicU64,
    failing: AtomicBool,
    fail_subscriptions: AtomicBool,
}

impl MemoryRemoteStore {
    pub fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            inner: Mutex::new(RemoteInner::default()),
            requests: AtomicU64::new(0),
            failing: AtomicBool::new(false),
            fail_subscriptions: AtomicBool::new(false),
        }
    }

    fn inner(&self) -> MutexGuard<'_, RemoteInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Count a request and fail it if the store is set to fail
    fn begin_request(&self) -> Result<(), RemoteError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(RemoteError::NetworkError("memory store unavailable".to_string()));
        }
        Ok(())
    }

    /// Seed a record without counting a request
    pub fn insert_record(&self, mut record: Record) {
        if record.created_by.is_none() {
            record.created_by = Some(self.user_id.clone());
        }
        if record.created_at.is_none() {
            record.created_at = Some(Utc::now());
        }
        let key = (record.record_type.clone(), record.id.clone());
        self.inner().records.insert(key, record);
    }

    /// Back-office edit of one field
    pub fn set_field(&self, record_type: &str, id: &str, field: &str, value: serde_json::Value) -> bool {
        let mut inner = self.inner();
        match inner.records.get_mut(&(record_type.to_string(), id.to_string())) {
            Some(record) => {
                if let Some(fields) = record.fields.as_object_mut() {
                    fields.insert(field.to_string(), value);
                }
                true
            }
            None => false,
        }
    }

    pub fn records_of(&self, record_type: &str) -> Vec<Record> {
        self.inner()
            .records
            .values()
            .filter(|r| r.record_type == record_type)
            .cloned()
            .collect()
    }

    pub fn subscription(&self, id: &str) -> Option<Subscription> {
        self.inner().subscriptions.get(id).cloned()
    }

    /// Total requests served or refused so far
    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::SeqCst)
    }

    /// Make every request fail with a network error
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Let `n` queries succeed, then fail the rest (`None` disables)
    pub fn fail_queries_after(&self, n: Option<usize>) {
        let mut inner = self.inner();
        inner.queries_served = 0;
        inner.fail_queries_after = n;
    }

    /// Make subscription saves and deletes fail
    pub fn set_fail_subscriptions(&self, failing: bool) {
        self.fail_subscriptions.store(failing, Ordering::SeqCst);
    }

    fn check_subscriptions(&self) -> Result<(), RemoteError> {
        if self.fail_subscriptions.load(Ordering::SeqCst) {
            return Err(RemoteError::ServerError("subscription service unavailable".to_string()));
        }
        Ok(())
    }
}

/// Order two field values: numbers numerically, everything else as JSON text
fn compare_values(a: Option<&serde_json::Value>, b: Option<&serde_json::Value>) -> CmpOrdering {
    match (a, b) {
        (Some(a), Some(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(CmpOrdering::Equal),
            _ => match (a.as_str(), b.as_str()) {
                (Some(x), Some(y)) => x.cmp(y),
                _ => a.to_string().cmp(&b.to_string()),
            },
        },
        (Some(_), None) => CmpOrdering::Greater,
        (None, Some(_)) => CmpOrdering::Less,
        (None, None) => CmpOrdering::Equal,
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn current_user_id(&self) -> Result<String, RemoteError> {
        self.begin_request()?;
        Ok(self.user_id.clone())
    }

    async fn query(&self, query: &Query, cursor: Option<&Cursor>) -> Result<QueryPage, RemoteError> {
        self.begin_request()?;

        let mut inner = self.inner();
        if let Some(limit) = inner.fail_queries_after {
            if inner.queries_served >= limit {
                return Err(RemoteError::ServerError("injected query failure".to_string()));
            }
        }
        inner.queries_served += 1;

        let mut matching: Vec<Record> = inner
            .records
            .values()
            .filter(|r| r.record_type == query.record_type && query.predicate.matches(r))
            .cloned()
            .collect();
        drop(inner);

        if let Some(field) = &query.sort_by {
            matching.sort_by(|a, b| {
                let ordering = compare_values(a.fields.get(field), b.fields.get(field));
                if query.ascending {
                    ordering
                } else {
                    ordering.reverse()
                }
            });
        }

        let offset = match cursor {
            Some(Cursor(token)) => token
                .parse::<usize>()
                .map_err(|_| RemoteError::InvalidResponse(format!("bad cursor {}", token)))?,
            None => 0,
        };
        let page_size = match query.page_size {
            0 => DEFAULT_PAGE_SIZE,
            n => n as usize,
        };

        let end = (offset + page_size).min(matching.len());
        let records = matching.get(offset..end).map(<[Record]>::to_vec).unwrap_or_default();
        let cursor = (end < matching.len()).then(|| Cursor(end.to_string()));

        Ok(QueryPage { records, cursor })
    }

    async fn save_record(&self, record: &Record) -> Result<Record, RemoteError> {
        self.begin_request()?;

        let key = (record.record_type.clone(), record.id.clone());
        let mut inner = self.inner();
        let mut saved = record.clone();
        match inner.records.get(&key) {
            Some(existing) => {
                saved.created_by = existing.created_by.clone();
                saved.created_at = existing.created_at;
            }
            None => {
                saved.created_by = Some(self.user_id.clone());
                saved.created_at = Some(Utc::now());
            }
        }
        inner.records.insert(key, saved.clone());
        Ok(saved)
    }

    async fn delete_record(&self, record_type: &str, id: &str) -> Result<(), RemoteError> {
        self.begin_request()?;

        match self.inner().records.remove(&(record_type.to_string(), id.to_string())) {
            Some(_) => Ok(()),
            None => Err(RemoteError::NotFound(format!("{}/{}", record_type, id))),
        }
    }

    async fn save_subscription(&self, subscription: &Subscription) -> Result<(), RemoteError> {
        self.begin_request()?;
        self.check_subscriptions()?;

        self.inner()
            .subscriptions
            .insert(subscription.id.clone(), subscription.clone());
        Ok(())
    }

    async fn delete_subscription(&self, id: &str) -> Result<(), RemoteError> {
        self.begin_request()?;
        self.check_subscriptions()?;

        match self.inner().subscriptions.remove(id) {
            Some(_) => Ok(()),
            None => Err(RemoteError::NotFound(format!("subscription {}", id))),
        }
    }
}

/// Private key-value store held in memory
#[derive(Default)]
pub struct MemoryKeyValueStore {
    values: Mutex<HashMap<String, serde_json::Value>>,
    requests: AtomicU64,
    failing: AtomicBool,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn values(&self) -> MutexGuard<'_, HashMap<String, serde_json::Value>> {
        self.values.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin_request(&self) -> Result<(), RemoteError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(RemoteError::NetworkError("private store unavailable".to_string()));
        }
        Ok(())
    }

    /// Read a value without counting a request
    pub fn peek(&self, key: &str) -> Option<serde_json::Value> {
        self.values().get(key).cloned()
    }

    /// Write a value without counting a request (simulates another device)
    pub fn seed(&self, key: &str, value: serde_json::Value) {
        self.values().insert(key.to_string(), value);
    }

    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, RemoteError> {
        self.begin_request()?;
        Ok(self.values().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &serde_json::Value) -> Result<(), RemoteError> {
        self.begin_request()?;
        self.values().insert(key.to_string(), value.clone());
        Ok(())
    }
}

/// Notification center with a fixed permission answer
pub struct StaticNotificationCenter {
    granted: AtomicBool,
    registrations: AtomicU64,
}

impl StaticNotificationCenter {
    pub fn new(granted: bool) -> Self {
        Self {
            granted: AtomicBool::new(granted),
            registrations: AtomicU64::new(0),
        }
    }

    pub fn set_granted(&self, granted: bool) {
        self.granted.store(granted, Ordering::SeqCst);
    }

    pub fn registrations(&self) -> u64 {
        self.registrations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NotificationCenter for StaticNotificationCenter {
    async fn request_permission(&self) -> bool {
        self.granted.load(Ordering::SeqCst)
    }

    async fn register_for_push(&self) {
        self.registrations.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{Predicate, REPORT_RECORD};
    use serde_json::json;

    #[tokio::test]
    async fn test_save_assigns_server_metadata() {
        let store = MemoryRemoteStore::new("user-1");
        let record = Record::new(REPORT_RECORD, "r-1", &json!({"name": "Stairs"})).unwrap();

        let saved = store.save_record(&record).await.unwrap();
        assert_eq!(saved.created_by.as_deref(), Some("user-1"));
        assert!(saved.created_at.is_some());
        assert_eq!(store.records_of(REPORT_RECORD).len(), 1);
    }

    #[tokio::test]
    async fn test_query_sorts_numerically() {
        let store = MemoryRemoteStore::new("user-1");
        for id in [10, 2, 33] {
            store.insert_record(Record::new("Recipe", id.to_string(), &json!({"id": id})).unwrap());
        }

        let query = Query::new("Recipe", Predicate::All, 10).sorted_by("id", true);
        let page = store.query(&query, None).await.unwrap();
        let ids: Vec<&str> = page.records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["2", "10", "33"]);
        assert!(page.cursor.is_none());
    }

    #[tokio::test]
    async fn test_query_filters_by_creator() {
        let store = MemoryRemoteStore::new("user-1");
        store.insert_record(Record::new(REPORT_RECORD, "mine", &json!({})).unwrap());
        let mut other = Record::new(REPORT_RECORD, "theirs", &json!({})).unwrap();
        other.created_by = Some("user-2".to_string());
        store.insert_record(other);

        let query = Query::new(
            REPORT_RECORD,
            Predicate::CreatedBy {
                user_id: "user-1".to_string(),
            },
            10,
        );
        let page = store.query(&query, None).await.unwrap();
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.records[0].id, "mine");
    }

    #[tokio::test]
    async fn test_missing_deletes_are_not_found() {
        let store = MemoryRemoteStore::new("user-1");
        let err = store.delete_record(REPORT_RECORD, "nope").await.unwrap_err();
        assert!(err.is_not_found());

        let err = store.delete_subscription("nope").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_failing_store_counts_requests() {
        let store = MemoryRemoteStore::new("user-1");
        store.set_failing(true);

        assert!(store.current_user_id().await.is_err());
        assert_eq!(store.request_count(), 1);
    }

    #[tokio::test]
    async fn test_key_value_store() {
        let store = MemoryKeyValueStore::new();
        assert!(store.get("favorites").await.unwrap().is_none());

        store.set("favorites", &json!([1, 2])).await.unwrap();
        assert_eq!(store.get("favorites").await.unwrap(), Some(json!([1, 2])));
        assert_eq!(store.request_count(), 3);

        store.set_failing(true);
        assert!(store.set("favorites", &json!([])).await.is_err());
        assert_eq!(store.peek("favorites"), Some(json!([1, 2])));
    }
}
