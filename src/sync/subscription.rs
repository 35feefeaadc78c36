//! Subscription Manager
//!
//! Owns the push subscription that notifies the user when one of their
//! reports changes status. The subscription id is derived from the user id,
//! so create and delete are idempotent.
//!
//! State machine:
//! - Disabled -> Enabled: permission granted, device registered, subscription saved
//! - Enabled -> Disabled: user disables or permission revoked
//!
//! A failed transition leaves the previous state in place.

use crate::remote::{
    NotificationCenter, Predicate, RemoteError, RemoteStore, Subscription, SubscriptionEvent,
    REPORT_RECORD,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::Mutex;

const SUBSCRIPTION_PREFIX: &str = "report-status-";
const ALERT_BODY: &str = "The status of one of your reports has changed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationState {
    #[default]
    Disabled,
    Enabled,
}

impl NotificationState {
    pub fn is_enabled(&self) -> bool {
        matches!(self, NotificationState::Enabled)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SubscriptionError {
    #[error("Notification permission denied")]
    PermissionDenied,

    #[error("Subscription request failed: {0}")]
    Remote(#[from] RemoteError),
}

/// Deterministic subscription id for a user
pub fn subscription_id(user_id: &str) -> String {
    let digest = Sha256::digest(user_id.as_bytes());
    let hex = hex::encode(digest);
    format!("{}{}", SUBSCRIPTION_PREFIX, &hex[..16])
}

pub struct SubscriptionManager {
    remote: Arc<dyn RemoteStore>,
    notifications: Arc<dyn NotificationCenter>,
    state: Mutex<NotificationState>,
}

impl SubscriptionManager {
    pub fn new(remote: Arc<dyn RemoteStore>, notifications: Arc<dyn NotificationCenter>) -> Self {
        Self::with_state(remote, notifications, NotificationState::Disabled)
    }

    /// Restore a previously persisted state
    pub fn with_state(
        remote: Arc<dyn RemoteStore>,
        notifications: Arc<dyn NotificationCenter>,
        state: NotificationState,
    ) -> Self {
        Self {
            remote,
            notifications,
            state: Mutex::new(state),
        }
    }

    pub async fn state(&self) -> NotificationState {
        *self.state.lock().await
    }

    pub async fn request_permission(&self) -> bool {
        self.notifications.request_permission().await
    }

    pub async fn register_for_push(&self) {
        self.notifications.register_for_push().await
    }

    /// Save the user's report-status subscription, replacing any existing one
    pub async fn create_subscription(&self, user_id: &str) -> Result<(), RemoteError> {
        let subscription = Subscription {
            id: subscription_id(user_id),
            record_type: REPORT_RECORD.to_string(),
            predicate: Predicate::CreatedBy {
                user_id: user_id.to_string(),
            },
            fires_on: vec![SubscriptionEvent::RecordUpdated],
            alert_body: ALERT_BODY.to_string(),
        };

        self.remote.save_subscription(&subscription).await?;
        log::info!("Push subscription {} saved", subscription.id);
        Ok(())
    }

    /// Delete the user's subscription; a missing one counts as deleted
    pub async fn delete_subscription(&self, user_id: &str) -> Result<(), RemoteError> {
        let id = subscription_id(user_id);
        match self.remote.delete_subscription(&id).await {
            Ok(()) => {
                log::info!("Push subscription {} deleted", id);
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                log::debug!("Push subscription {} already absent", id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Drive the toggle. Returns the state now in effect.
    pub async fn set_enabled(&self, enabled: bool) -> Result<NotificationState, SubscriptionError> {
        // Held for the whole transition so two toggles never interleave
        let mut state = self.state.lock().await;

        if enabled {
            if !self.request_permission().await {
                log::warn!("Notification permission denied, keeping {:?}", *state);
                return Err(SubscriptionError::PermissionDenied);
            }
            self.register_for_push().await;

            let user_id = self.remote.current_user_id().await?;
            self.create_subscription(&user_id).await?;
            *state = NotificationState::Enabled;
        } else {
            let user_id = self.remote.current_user_id().await?;
            self.delete_subscription(&user_id).await?;
            *state = NotificationState::Disabled;
        }

        Ok(*state)
    }

    /// The platform reported the permission was withdrawn
    pub async fn permission_revoked(&self) -> Result<NotificationState, SubscriptionError> {
        let mut state = self.state.lock().await;
        if !state.is_enabled() {
            return Ok(*state);
        }

        let user_id = self.remote.current_user_id().await?;
        self.delete_subscription(&user_id).await?;
        *state = NotificationState::Disabled;
        Ok(*state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{MemoryRemoteStore, StaticNotificationCenter};

    fn manager(granted: bool) -> (Arc<MemoryRemoteStore>, Arc<StaticNotificationCenter>, SubscriptionManager) {
        let store = Arc::new(MemoryRemoteStore::new("user-1"));
        let center = Arc::new(StaticNotificationCenter::new(granted));
        let manager = SubscriptionManager::new(store.clone(), center.clone());
        (store, center, manager)
    }

    #[test]
    fn test_subscription_id_deterministic() {
        let id = subscription_id("user-1");
        assert_eq!(id, subscription_id("user-1"));
        assert_ne!(id, subscription_id("user-2"));
        assert!(id.starts_with(SUBSCRIPTION_PREFIX));
        assert_eq!(id.len(), SUBSCRIPTION_PREFIX.len() + 16);
    }

    #[tokio::test]
    async fn test_enable_creates_scoped_subscription() {
        let (store, center, manager) = manager(true);

        let state = manager.set_enabled(true).await.unwrap();
        assert_eq!(state, NotificationState::Enabled);
        assert_eq!(center.registrations(), 1);

        let subscription = store.subscription(&subscription_id("user-1")).unwrap();
        assert_eq!(
            subscription.predicate,
            Predicate::CreatedBy {
                user_id: "user-1".to_string()
            }
        );
        assert_eq!(subscription.record_type, REPORT_RECORD);
    }

    #[tokio::test]
    async fn test_permission_denied_stays_disabled() {
        let (store, center, manager) = manager(false);

        assert!(matches!(
            manager.set_enabled(true).await,
            Err(SubscriptionError::PermissionDenied)
        ));
        assert_eq!(manager.state().await, NotificationState::Disabled);
        assert_eq!(center.registrations(), 0);
        assert_eq!(store.request_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_create_reverts() {
        let (store, _center, manager) = manager(true);
        store.set_fail_subscriptions(true);

        assert!(manager.set_enabled(true).await.is_err());
        assert_eq!(manager.state().await, NotificationState::Disabled);
    }

    #[tokio::test]
    async fn test_failed_delete_keeps_enabled() {
        let (store, _center, manager) = manager(true);
        manager.set_enabled(true).await.unwrap();

        store.set_fail_subscriptions(true);
        assert!(manager.set_enabled(false).await.is_err());
        assert_eq!(manager.state().await, NotificationState::Enabled);
    }

    #[tokio::test]
    async fn test_disable_twice_is_success() {
        let (store, _center, manager) = manager(true);
        manager.set_enabled(true).await.unwrap();

        assert_eq!(manager.set_enabled(false).await.unwrap(), NotificationState::Disabled);
        assert!(store.subscription(&subscription_id("user-1")).is_none());
        assert_eq!(manager.set_enabled(false).await.unwrap(), NotificationState::Disabled);
    }

    #[tokio::test]
    async fn test_permission_revoked() {
        let (store, _center, manager) = manager(true);
        manager.set_enabled(true).await.unwrap();

        assert_eq!(manager.permission_revoked().await.unwrap(), NotificationState::Disabled);
        assert!(store.subscription(&subscription_id("user-1")).is_none());
    }
}
