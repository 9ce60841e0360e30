use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use tailcast_tail::SubscriberId;
use tailcast_types::{ConnectionId, StreamSelector};

/// A live subscriber connection
#[derive(Debug)]
pub(crate) struct Subscription {
    pub selector: StreamSelector,
    pub path: PathBuf,
    pub subscriber: SubscriberId,
    pub connected_at: DateTime<Utc>,
    /// Cancelling forces the connection task to close the socket
    pub cancel: CancellationToken,
}

/// Snapshot of a subscription for inspection
#[derive(Clone, Debug)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub selector: StreamSelector,
    pub path: PathBuf,
    pub connected_at: DateTime<Utc>,
}

/// Connection id to subscription map.
///
/// Whoever removes an entry owns its cleanup, which keeps teardown to a
/// single run per connection.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    subscriptions: Mutex<HashMap<ConnectionId, Subscription>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, id: ConnectionId, subscription: Subscription) {
        self.subscriptions.lock().insert(id, subscription);
    }

    pub(crate) fn remove(&self, id: &ConnectionId) -> Option<Subscription> {
        self.subscriptions.lock().remove(id)
    }

    pub(crate) fn drain(&self) -> Vec<(ConnectionId, Subscription)> {
        self.subscriptions.lock().drain().collect()
    }

    pub fn len(&self) -> usize {
        self.subscriptions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<ConnectionInfo> {
        self.subscriptions
            .lock()
            .iter()
            .map(|(id, sub)| ConnectionInfo {
                id: id.clone(),
                selector: sub.selector.clone(),
                path: sub.path.clone(),
                connected_at: sub.connected_at,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tailcast_types::StreamKind;

    fn subscription() -> Subscription {
        Subscription {
            selector: StreamSelector::new("web", StreamKind::Stdout),
            path: PathBuf::from("/var/log/web.out"),
            subscriber: 7,
            connected_at: Utc::now(),
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn test_remove_is_single_shot() {
        let registry = ConnectionRegistry::new();
        let id = ConnectionId::generate(&StreamSelector::new("web", StreamKind::Stdout));
        registry.insert(id.clone(), subscription());
        assert_eq!(registry.len(), 1);

        assert!(registry.remove(&id).is_some());
        assert!(registry.remove(&id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_snapshot_and_drain() {
        let registry = ConnectionRegistry::new();
        let selector = StreamSelector::new("web", StreamKind::Stdout);
        registry.insert(ConnectionId::generate(&selector), subscription());
        registry.insert(ConnectionId::generate(&selector), subscription());

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.iter().all(|c| c.selector.process == "web"));

        assert_eq!(registry.drain().len(), 2);
        assert!(registry.is_empty());
    }
}
