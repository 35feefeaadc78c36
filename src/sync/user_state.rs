//! User-State Sync Client
//!
//! Favorites and recent searches live in the per-user private store, one key
//! each. Local edits are queued as per-item changes and replayed on top of a
//! fresh read of the key, so an upload never drops entries written by another
//! device. Concurrent writes to the same key resolve last-writer-wins.

use crate::remote::{KeyValueStore, RemoteError};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;

pub const FAVORITES_KEY: &str = "favorites";
pub const RECENT_SEARCHES_KEY: &str = "recent_searches";

/// Most-recent-first list of distinct names, capped at `limit`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecentSearches {
    entries: Vec<String>,
    limit: usize,
}

impl RecentSearches {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: Vec::new(),
            limit: limit.max(1),
        }
    }

    /// Rebuild from stored entries, dropping blanks and duplicates
    pub fn from_entries(entries: Vec<String>, limit: usize) -> Self {
        let mut searches = Self::new(limit);
        for entry in entries {
            let name = entry.trim();
            if name.is_empty() || searches.entries.iter().any(|e| e == name) {
                continue;
            }
            searches.entries.push(name.to_string());
        }
        searches.entries.truncate(searches.limit);
        searches
    }

    /// Insert at the front, moving an existing entry instead of duplicating it.
    /// Returns false for a blank name.
    pub fn record(&mut self, name: &str) -> bool {
        let name = name.trim();
        if name.is_empty() {
            return false;
        }

        self.entries.retain(|e| e != name);
        self.entries.insert(0, name.to_string());
        self.entries.truncate(self.limit);
        true
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<String> {
        self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

// ============================================================================
// Pending changes
// ============================================================================

/// A local edit that can be replayed on top of whatever the store holds
pub trait UserChange: Clone {
    type Target;

    fn apply(&self, target: &mut Self::Target);

    /// True when applying `self` makes `earlier` irrelevant
    fn supersedes(&self, earlier: &Self) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FavoriteChange {
    Set { id: i64, favorite: bool },
    Clear,
}

impl UserChange for FavoriteChange {
    type Target = BTreeSet<i64>;

    fn apply(&self, favorites: &mut BTreeSet<i64>) {
        match self {
            FavoriteChange::Set { id, favorite: true } => {
                favorites.insert(*id);
            }
            FavoriteChange::Set { id, favorite: false } => {
                favorites.remove(id);
            }
            FavoriteChange::Clear => favorites.clear(),
        }
    }

    fn supersedes(&self, earlier: &Self) -> bool {
        match (self, earlier) {
            (FavoriteChange::Clear, _) => true,
            (FavoriteChange::Set { id, .. }, FavoriteChange::Set { id: other, .. }) => id == other,
            (FavoriteChange::Set { .. }, FavoriteChange::Clear) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchChange {
    Record(String),
    Clear,
}

impl UserChange for SearchChange {
    type Target = RecentSearches;

    fn apply(&self, searches: &mut RecentSearches) {
        match self {
            SearchChange::Record(name) => {
                searches.record(name);
            }
            SearchChange::Clear => searches.clear(),
        }
    }

    fn supersedes(&self, earlier: &Self) -> bool {
        match (self, earlier) {
            (SearchChange::Clear, _) => true,
            (SearchChange::Record(name), SearchChange::Record(other)) => name == other,
            (SearchChange::Record(_), SearchChange::Clear) => false,
        }
    }
}

/// Edits not yet confirmed by the private store, oldest first.
///
/// Each entry carries a sequence number so a replay can settle exactly the
/// entries it uploaded even if newer edits were queued meanwhile.
#[derive(Debug, Clone)]
pub struct PendingChanges<C> {
    next_seq: u64,
    entries: Vec<(u64, C)>,
}

impl<C> Default for PendingChanges<C> {
    fn default() -> Self {
        Self {
            next_seq: 0,
            entries: Vec::new(),
        }
    }
}

impl<C: UserChange> PendingChanges<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an edit, dropping earlier ones it makes irrelevant
    pub fn push(&mut self, change: C) {
        self.entries.retain(|(_, earlier)| !change.supersedes(earlier));
        self.next_seq += 1;
        self.entries.push((self.next_seq, change));
    }

    /// Everything queued so far, with the sequence number to settle through
    pub fn snapshot(&self) -> (Vec<C>, u64) {
        let changes = self.entries.iter().map(|(_, c)| c.clone()).collect();
        let through = self.entries.last().map_or(0, |(seq, _)| *seq);
        (changes, through)
    }

    /// Forget entries up to and including `through`
    pub fn settle(&mut self, through: u64) {
        self.entries.retain(|(seq, _)| *seq > through);
    }

    /// Replay what is still queued on top of `target`
    pub fn apply_to(&self, target: &mut C::Target) {
        for (_, change) in &self.entries {
            change.apply(target);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Client for the two private keys
#[derive(Clone)]
pub struct UserStateClient {
    store: Arc<dyn KeyValueStore>,
    recent_search_limit: usize,
}

impl UserStateClient {
    pub fn new(store: Arc<dyn KeyValueStore>, recent_search_limit: usize) -> Self {
        Self {
            store,
            recent_search_limit,
        }
    }

    // ========================================================================
    // Favorites
    // ========================================================================

    pub async fn pull_favorites(&self) -> Result<BTreeSet<i64>, RemoteError> {
        let ids: Vec<i64> = self.read_list(FAVORITES_KEY).await?;
        Ok(ids.into_iter().collect())
    }

    /// Apply one membership change on top of the latest stored set
    pub async fn push_favorite(&self, id: i64, added: bool) -> Result<BTreeSet<i64>, RemoteError> {
        self.apply_favorite_changes(&[FavoriteChange::Set { id, favorite: added }])
            .await
    }

    /// Pull the stored set and replay `changes` on top of it.
    /// Writes back only when there is something to replay.
    pub async fn apply_favorite_changes(
        &self,
        changes: &[FavoriteChange],
    ) -> Result<BTreeSet<i64>, RemoteError> {
        let mut favorites = self.pull_favorites().await?;
        if changes.is_empty() {
            return Ok(favorites);
        }

        for change in changes {
            change.apply(&mut favorites);
        }
        self.replace_favorites(&favorites).await?;
        Ok(favorites)
    }

    /// Overwrite the stored set
    pub async fn replace_favorites(&self, favorites: &BTreeSet<i64>) -> Result<(), RemoteError> {
        let ids: Vec<i64> = favorites.iter().copied().collect();
        self.store.set(FAVORITES_KEY, &Value::from(ids)).await
    }

    // ========================================================================
    // Recent searches
    // ========================================================================

    pub async fn pull_recent_searches(&self) -> Result<RecentSearches, RemoteError> {
        let entries: Vec<String> = self.read_list(RECENT_SEARCHES_KEY).await?;
        Ok(RecentSearches::from_entries(entries, self.recent_search_limit))
    }

    /// Insert-or-move-to-front on top of the latest stored list
    pub async fn push_recent_search(&self, name: &str) -> Result<RecentSearches, RemoteError> {
        let mut searches = self.pull_recent_searches().await?;
        if searches.record(name) {
            self.replace_recent_searches(searches.entries()).await?;
        }
        Ok(searches)
    }

    /// Pull the stored list and replay `changes` on top of it
    pub async fn apply_search_changes(
        &self,
        changes: &[SearchChange],
    ) -> Result<RecentSearches, RemoteError> {
        let mut searches = self.pull_recent_searches().await?;
        if changes.is_empty() {
            return Ok(searches);
        }

        for change in changes {
            change.apply(&mut searches);
        }
        self.replace_recent_searches(searches.entries()).await?;
        Ok(searches)
    }

    pub async fn replace_recent_searches(&self, entries: &[String]) -> Result<(), RemoteError> {
        self.store
            .set(RECENT_SEARCHES_KEY, &Value::from(entries.to_vec()))
            .await
    }

    pub async fn clear_recent_searches(&self) -> Result<(), RemoteError> {
        self.replace_recent_searches(&[]).await
    }

    /// Read a JSON array key; unset means empty
    async fn read_list<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Vec<T>, RemoteError> {
        match self.store.get(key).await? {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(value) => serde_json::from_value(value)
                .map_err(|e| RemoteError::InvalidResponse(format!("{}: {}", key, e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryKeyValueStore;
    use serde_json::json;

    fn client() -> (Arc<MemoryKeyValueStore>, UserStateClient) {
        let store = Arc::new(MemoryKeyValueStore::new());
        (store.clone(), UserStateClient::new(store, 10))
    }

    #[test]
    fn test_recent_searches_cap() {
        let mut searches = RecentSearches::new(10);
        for i in 0..15 {
            searches.record(&format!("Item{}", i));
        }

        assert_eq!(searches.len(), 10);
        let expected: Vec<String> = (5..15).rev().map(|i| format!("Item{}", i)).collect();
        assert_eq!(searches.entries(), expected.as_slice());
    }

    #[test]
    fn test_recent_searches_move_to_front() {
        let mut searches = RecentSearches::new(10);
        for name in ["A", "B", "C", "D"] {
            searches.record(name);
        }
        assert_eq!(searches.entries(), ["D", "C", "B", "A"]);

        searches.record("B");
        assert_eq!(searches.entries(), ["B", "D", "C", "A"]);
        assert_eq!(searches.len(), 4);
    }

    #[test]
    fn test_recent_searches_ignore_blank() {
        let mut searches = RecentSearches::new(10);
        assert!(!searches.record("   "));
        assert!(searches.is_empty());
    }

    #[test]
    fn test_from_entries_dedupes() {
        let searches = RecentSearches::from_entries(
            vec!["Torch".into(), "".into(), "Torch".into(), "Planks".into()],
            10,
        );
        assert_eq!(searches.entries(), ["Torch", "Planks"]);
    }

    #[tokio::test]
    async fn test_push_favorite_read_modify_write() {
        let (store, client) = client();
        store.seed(FAVORITES_KEY, json!([3]));

        let favorites = client.push_favorite(1, true).await.unwrap();
        assert_eq!(favorites, BTreeSet::from([1, 3]));
        assert_eq!(store.peek(FAVORITES_KEY), Some(json!([1, 3])));

        let favorites = client.push_favorite(3, false).await.unwrap();
        assert_eq!(favorites, BTreeSet::from([1]));
    }

    #[tokio::test]
    async fn test_pull_unset_keys_are_empty() {
        let (_store, client) = client();
        assert!(client.pull_favorites().await.unwrap().is_empty());
        assert!(client.pull_recent_searches().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_push_recent_search_and_clear() {
        let (store, client) = client();

        client.push_recent_search("Torch").await.unwrap();
        client.push_recent_search("Planks").await.unwrap();
        client.push_recent_search("Torch").await.unwrap();
        assert_eq!(store.peek(RECENT_SEARCHES_KEY), Some(json!(["Torch", "Planks"])));

        client.clear_recent_searches().await.unwrap();
        assert_eq!(store.peek(RECENT_SEARCHES_KEY), Some(json!([])));
    }

    #[tokio::test]
    async fn test_malformed_value_is_invalid_response() {
        let (store, client) = client();
        store.seed(FAVORITES_KEY, json!("not a list"));

        assert!(matches!(
            client.pull_favorites().await,
            Err(RemoteError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_pending_changes_supersede_and_settle() {
        let mut pending = PendingChanges::new();
        pending.push(FavoriteChange::Set { id: 1, favorite: true });
        pending.push(FavoriteChange::Set { id: 2, favorite: true });
        pending.push(FavoriteChange::Set { id: 1, favorite: false });
        assert_eq!(pending.len(), 2);

        let (changes, through) = pending.snapshot();
        assert_eq!(
            changes,
            vec![
                FavoriteChange::Set { id: 2, favorite: true },
                FavoriteChange::Set { id: 1, favorite: false },
            ]
        );

        // queued while the snapshot was being uploaded
        pending.push(FavoriteChange::Set { id: 7, favorite: true });
        pending.settle(through);
        assert_eq!(pending.snapshot().0, vec![FavoriteChange::Set { id: 7, favorite: true }]);

        pending.push(FavoriteChange::Clear);
        assert_eq!(pending.snapshot().0, vec![FavoriteChange::Clear]);
    }

    #[test]
    fn test_pending_searches_replay_in_order() {
        let mut pending = PendingChanges::new();
        pending.push(SearchChange::Record("Torch".to_string()));
        pending.push(SearchChange::Record("Planks".to_string()));
        pending.push(SearchChange::Record("Torch".to_string()));

        let mut searches = RecentSearches::from_entries(vec!["Bed".to_string()], 10);
        pending.apply_to(&mut searches);
        assert_eq!(searches.entries(), ["Torch", "Planks", "Bed"]);
    }

    #[tokio::test]
    async fn test_apply_changes_merge_with_stored_value() {
        let (store, client) = client();
        store.seed(FAVORITES_KEY, json!([2, 3]));
        store.seed(RECENT_SEARCHES_KEY, json!(["A", "B"]));

        let favorites = client
            .apply_favorite_changes(&[
                FavoriteChange::Set { id: 5, favorite: true },
                FavoriteChange::Set { id: 2, favorite: false },
            ])
            .await
            .unwrap();
        assert_eq!(favorites, BTreeSet::from([3, 5]));
        assert_eq!(store.peek(FAVORITES_KEY), Some(json!([3, 5])));

        let searches = client
            .apply_search_changes(&[SearchChange::Record("Torch".to_string())])
            .await
            .unwrap();
        assert_eq!(searches.entries(), ["Torch", "A", "B"]);
        assert_eq!(store.peek(RECENT_SEARCHES_KEY), Some(json!(["Torch", "A", "B"])));
    }

    #[tokio::test]
    async fn test_apply_without_changes_only_reads() {
        let (store, client) = client();
        store.seed(FAVORITES_KEY, json!([4]));

        let favorites = client.apply_favorite_changes(&[]).await.unwrap();
        assert_eq!(favorites, BTreeSet::from([4]));
        assert_eq!(store.request_count(), 1);
    }

    #[tokio::test]
    async fn test_store_failure_propagates() {
        let (store, client) = client();
        store.set_failing(true);
        assert!(client.push_favorite(1, true).await.is_err());
    }
}
