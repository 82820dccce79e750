use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{CrawlError, Result};
use crate::events::{CrawlEvent, EventKind};

pub const DEFAULT_CAPACITY: usize = 10;

/// Fan-out of crawl progress to connected observers.
///
/// Delivery is best-effort: a subscriber whose channel is full or closed at
/// send time is dropped from the registry. The hub never closes a channel;
/// the owner of the receiving half decides when the connection ends.
#[derive(Debug)]
pub struct BroadcastHub {
    clients: RwLock<HashMap<String, mpsc::Sender<CrawlEvent>>>,
    capacity: usize,
}

impl Default for BroadcastHub {
    fn default() -> Self {
        BroadcastHub::new(DEFAULT_CAPACITY)
    }
}

impl BroadcastHub {
    pub fn new(capacity: usize) -> Self {
        BroadcastHub {
            clients: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// A channel sized for this hub.
    pub fn channel(&self) -> (mpsc::Sender<CrawlEvent>, mpsc::Receiver<CrawlEvent>) {
        mpsc::channel(self.capacity)
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, mpsc::Sender<CrawlEvent>>> {
        self.clients.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, mpsc::Sender<CrawlEvent>>> {
        self.clients.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `tx` under `client_id`, replacing any previous channel, and
    /// try to hand it a welcome event.
    pub fn subscribe(&self, client_id: &str, tx: mpsc::Sender<CrawlEvent>) {
        let total = {
            let mut clients = self.write();
            if clients.insert(client_id.to_string(), tx.clone()).is_some() {
                warn!(client_id, "Client already subscribed, replacing connection");
            }
            clients.len()
        };
        info!(client_id, total_clients = total, "Client subscribed");

        let mut welcome = CrawlEvent::new(EventKind::Connection)
            .with("status", "connected")
            .with("message", "Successfully connected to event stream")
            .with("client_id", client_id);
        welcome.stamp();
        if tx.try_send(welcome).is_err() {
            warn!(client_id, "Failed to send welcome event, channel might be full");
        }
    }

    pub fn unsubscribe(&self, client_id: &str) {
        let mut clients = self.write();
        if clients.remove(client_id).is_some() {
            info!(client_id, total_clients = clients.len(), "Client unsubscribed");
        } else {
            warn!(client_id, "Attempted to unsubscribe unknown client");
        }
    }

    /// Unsubscribe `client_id` only while it is still registered with the
    /// channel behind `tx`. A newer subscription under the same id is kept.
    pub fn unsubscribe_channel(&self, client_id: &str, tx: &mpsc::Sender<CrawlEvent>) -> bool {
        let mut clients = self.write();
        let removed = evict(&mut clients, client_id, tx);
        if removed {
            info!(client_id, total_clients = clients.len(), "Client unsubscribed");
        } else {
            debug!(client_id, "Connection already replaced or removed");
        }
        removed
    }

    /// Send `event` to every subscriber without waiting. Subscribers that
    /// cannot take it are removed once the pass is over.
    pub fn broadcast(&self, mut event: CrawlEvent) {
        event.stamp();

        // Senders are cloned out so no lock is held while sending.
        let targets: Vec<(String, mpsc::Sender<CrawlEvent>)> = self
            .read()
            .iter()
            .map(|(id, tx)| (id.clone(), tx.clone()))
            .collect();

        if targets.is_empty() {
            debug!(event = event.kind.as_str(), "No clients connected, skipping broadcast");
            return;
        }
        info!(event = event.kind.as_str(), clients = targets.len(), "Broadcasting event");

        let mut failed = Vec::new();
        for (client_id, tx) in targets {
            if let Err(e) = tx.try_send(event.clone()) {
                warn!(client_id, reason = %e, "Failed to send event, marking client for removal");
                failed.push((client_id, tx));
            }
        }

        if !failed.is_empty() {
            let mut clients = self.write();
            for (client_id, tx) in &failed {
                if evict(&mut clients, client_id, tx) {
                    info!(client_id, "Removed failed client");
                }
            }
        }
    }

    /// Targeted send. The subscriber is removed when delivery fails.
    pub fn broadcast_to_client(&self, client_id: &str, mut event: CrawlEvent) -> Result<()> {
        event.stamp();

        let tx = self
            .read()
            .get(client_id)
            .cloned()
            .ok_or_else(|| CrawlError::SubscriberDelivery(client_id.to_string()))?;

        info!(client_id, event = event.kind.as_str(), "Sending event to client");
        if let Err(e) = tx.try_send(event) {
            evict(&mut self.write(), client_id, &tx);
            warn!(client_id, reason = %e, "Failed to send event, client removed");
            return Err(CrawlError::SubscriberDelivery(client_id.to_string()));
        }
        Ok(())
    }

    pub fn connected_count(&self) -> usize {
        self.read().len()
    }

    pub fn is_subscribed(&self, client_id: &str) -> bool {
        self.read().contains_key(client_id)
    }
}

/// Remove `client_id` only if it still maps to the channel that failed.
fn evict(
    clients: &mut HashMap<String, mpsc::Sender<CrawlEvent>>,
    client_id: &str,
    failed: &mpsc::Sender<CrawlEvent>,
) -> bool {
    let same = clients
        .get(client_id)
        .is_some_and(|current| current.same_channel(failed));
    if same {
        clients.remove(client_id);
    }
    same
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    fn drain(rx: &mut mpsc::Receiver<CrawlEvent>) -> Vec<CrawlEvent> {
        let mut out = Vec::new();
        while let Ok(e) = rx.try_recv() {
            out.push(e);
        }
        out
    }

    #[test]
    fn subscribe_sends_welcome() {
        let hub = BroadcastHub::new(4);
        let (tx, mut rx) = hub.channel();
        hub.subscribe("a", tx);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Connection);
        assert!(events[0].id.starts_with("welcome-"));
        assert_eq!(events[0].get("client_id").and_then(|v| v.as_str()), Some("a"));
        assert_eq!(hub.connected_count(), 1);
    }

    #[test]
    fn full_channel_skips_welcome_but_stays_registered() {
        let hub = BroadcastHub::new(1);
        let (tx, mut rx) = mpsc::channel(1);
        tx.try_send(CrawlEvent::new(EventKind::Heartbeat)).unwrap();

        hub.subscribe("a", tx);
        assert!(hub.is_subscribed("a"));
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Heartbeat);
    }

    #[test]
    fn broadcast_evicts_only_the_full_subscriber() {
        let hub = BroadcastHub::new(10);
        let mut receivers = Vec::new();
        for id in ["a", "b", "c"] {
            let (tx, rx) = mpsc::channel(10);
            hub.subscribe(id, tx);
            receivers.push(rx);
        }
        // Capacity 1 is used up by the welcome.
        let (tx, mut full_rx) = mpsc::channel(1);
        hub.subscribe("full", tx);
        assert_eq!(hub.connected_count(), 4);

        hub.broadcast(CrawlEvent::new(EventKind::CrawlStarted).with("domain_url", "https://s.test"));

        assert_eq!(hub.connected_count(), 3);
        assert!(!hub.is_subscribed("full"));
        for rx in &mut receivers {
            let events = drain(rx);
            assert_eq!(events.len(), 2);
            assert_eq!(events[1].kind, EventKind::CrawlStarted);
            assert!(events[1].get("timestamp").is_some());
        }
        assert_eq!(drain(&mut full_rx).len(), 1);
    }

    #[test]
    fn closed_receiver_is_removed_on_broadcast() {
        let hub = BroadcastHub::new(4);
        let (tx, rx) = hub.channel();
        hub.subscribe("gone", tx);
        drop(rx);

        hub.broadcast(CrawlEvent::new(EventKind::Heartbeat));
        assert_eq!(hub.connected_count(), 0);
    }

    #[test]
    fn eviction_spares_a_resubscribed_client() {
        let hub = BroadcastHub::new(4);
        let (old_tx, _old_rx) = hub.channel();
        hub.subscribe("a", old_tx.clone());
        let (new_tx, _new_rx) = hub.channel();
        hub.subscribe("a", new_tx);

        let removed = evict(&mut hub.write(), "a", &old_tx);
        assert!(!removed);
        assert!(hub.is_subscribed("a"));
    }

    #[test]
    fn stale_connection_leaves_the_newer_one() {
        let hub = BroadcastHub::new(4);
        let (old_tx, _old_rx) = hub.channel();
        hub.subscribe("a", old_tx.clone());
        let (new_tx, _new_rx) = hub.channel();
        hub.subscribe("a", new_tx.clone());

        assert!(!hub.unsubscribe_channel("a", &old_tx));
        assert!(hub.is_subscribed("a"));
        assert!(hub.unsubscribe_channel("a", &new_tx));
        assert!(!hub.is_subscribed("a"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_subscribe_unsubscribe_and_broadcast() {
        let hub = Arc::new(BroadcastHub::new(256));

        let run = async {
            let broadcaster = {
                let hub = Arc::clone(&hub);
                tokio::spawn(async move {
                    for _ in 0..50 {
                        hub.broadcast(CrawlEvent::new(EventKind::Heartbeat));
                        tokio::task::yield_now().await;
                    }
                })
            };

            let mut joins = Vec::new();
            for i in 0..32 {
                let hub = Arc::clone(&hub);
                joins.push(tokio::spawn(async move {
                    let id = format!("client-{}", i);
                    let (tx, rx) = hub.channel();
                    hub.subscribe(&id, tx);
                    tokio::task::yield_now().await;
                    if i % 2 == 0 {
                        hub.unsubscribe(&id);
                        None
                    } else {
                        Some(rx)
                    }
                }));
            }

            let mut kept = Vec::new();
            for join in joins {
                if let Some(rx) = join.await.unwrap() {
                    kept.push(rx);
                }
            }
            broadcaster.await.unwrap();
            kept
        };

        let mut kept = tokio::time::timeout(Duration::from_secs(10), run)
            .await
            .expect("hub operations did not finish");

        assert_eq!(hub.connected_count(), 16);
        for i in (1..32).step_by(2) {
            assert!(hub.is_subscribed(&format!("client-{}", i)));
        }
        for rx in &mut kept {
            let events = drain(rx);
            assert!(events.iter().any(|e| e.kind == EventKind::Connection));
        }
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let hub = BroadcastHub::new(4);
        let (tx, _rx) = hub.channel();
        hub.subscribe("a", tx);
        hub.unsubscribe("a");
        hub.unsubscribe("a");
        hub.unsubscribe("never");
        assert_eq!(hub.connected_count(), 0);
    }

    #[test]
    fn targeted_send_reports_failure_and_evicts() {
        let hub = BroadcastHub::new(4);
        let err = hub
            .broadcast_to_client("missing", CrawlEvent::new(EventKind::Heartbeat))
            .unwrap_err();
        assert!(matches!(err, CrawlError::SubscriberDelivery(id) if id == "missing"));

        let (tx, mut rx) = mpsc::channel(2);
        hub.subscribe("a", tx);
        hub.broadcast_to_client("a", CrawlEvent::new(EventKind::Heartbeat))
            .unwrap();
        assert_eq!(drain(&mut rx).len(), 2);

        let (tx, _rx) = mpsc::channel(1);
        hub.subscribe("b", tx);
        let err = hub
            .broadcast_to_client("b", CrawlEvent::new(EventKind::Heartbeat))
            .unwrap_err();
        assert!(matches!(err, CrawlError::SubscriberDelivery(_)));
        assert!(!hub.is_subscribed("b"));
    }
}
