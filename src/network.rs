//! Connectivity monitor
//!
//! Tracks reachability transitions reported by the platform and exposes a
//! boolean signal every remote operation checks before touching the network.

use std::sync::Arc;
use tokio::sync::watch;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetworkStatus {
    Online,
    Offline,
    Unknown,
}

impl NetworkStatus {
    /// Unknown counts as connected until the platform reports otherwise
    pub fn is_connected(&self) -> bool {
        !matches!(self, NetworkStatus::Offline)
    }
}

/// Shared reachability signal
#[derive(Clone)]
pub struct ConnectivityMonitor {
    status: Arc<watch::Sender<NetworkStatus>>,
}

impl ConnectivityMonitor {
    pub fn new() -> Self {
        Self::with_status(NetworkStatus::Unknown)
    }

    pub fn with_status(status: NetworkStatus) -> Self {
        let (tx, _rx) = watch::channel(status);
        Self {
            status: Arc::new(tx),
        }
    }

    /// Feed a reachability callback from the platform.
    /// Returns true when the status actually changed.
    pub fn update(&self, reachable: bool) -> bool {
        let next = if reachable {
            NetworkStatus::Online
        } else {
            NetworkStatus::Offline
        };

        let changed = self.status.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });

        if changed {
            match next {
                NetworkStatus::Online => log::info!("Network: ONLINE"),
                _ => log::warn!("Network: OFFLINE"),
            }
        }

        changed
    }

    /// Current status
    pub fn current_status(&self) -> NetworkStatus {
        *self.status.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.current_status().is_connected()
    }

    /// Receiver notified on every transition
    pub fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
        self.status.subscribe()
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_counts_as_connected() {
        let monitor = ConnectivityMonitor::new();
        assert_eq!(monitor.current_status(), NetworkStatus::Unknown);
        assert!(monitor.is_connected());
    }

    #[test]
    fn test_update_reports_transitions_only() {
        let monitor = ConnectivityMonitor::new();

        assert!(monitor.update(false));
        assert!(!monitor.is_connected());
        assert!(!monitor.update(false));

        assert!(monitor.update(true));
        assert_eq!(monitor.current_status(), NetworkStatus::Online);
    }

    #[tokio::test]
    async fn test_subscribers_see_changes() {
        let monitor = ConnectivityMonitor::with_status(NetworkStatus::Online);
        let mut rx = monitor.subscribe();

        let clone = monitor.clone();
        tokio::spawn(async move {
            clone.update(false);
        });

        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), NetworkStatus::Offline);
    }
}
