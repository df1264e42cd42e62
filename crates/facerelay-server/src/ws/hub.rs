use facerelay_protocol::RelayEvent;
use std::collections::{HashMap, HashSet};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// Where a device-scoped event goes when nobody subscribed to that device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingPolicy {
    /// Drop it
    DeviceOnly,
    /// Hand it to observers that registered without a device
    FallbackToAnonymous,
}

struct ObserverEntry {
    sender: mpsc::UnboundedSender<String>,
    device_id: Option<String>,
}

#[derive(Default)]
struct Indexes {
    /// Every registered observer
    observers: HashMap<Uuid, ObserverEntry>,
    /// Device ID -> observers scoped to that device
    by_device: HashMap<String, HashSet<Uuid>>,
}

impl Indexes {
    fn remove(&mut self, observer_id: Uuid) -> Option<ObserverEntry> {
        let entry = self.observers.remove(&observer_id)?;

        if let Some(device_id) = &entry.device_id {
            if let Some(subs) = self.by_device.get_mut(device_id) {
                subs.remove(&observer_id);
                if subs.is_empty() {
                    self.by_device.remove(device_id);
                }
            }
        }

        Some(entry)
    }
}

/// Fan-out of relay events to observers, globally and per device
pub struct BroadcastHub {
    indexes: RwLock<Indexes>,
    policy: RoutingPolicy,
}

impl BroadcastHub {
    pub fn new(policy: RoutingPolicy) -> Self {
        Self {
            indexes: RwLock::new(Indexes::default()),
            policy,
        }
    }

    pub async fn subscribe(
        &self,
        sender: mpsc::UnboundedSender<String>,
        device_id: Option<String>,
    ) -> Uuid {
        let observer_id = Uuid::new_v4();
        let mut indexes = self.indexes.write().await;

        if let Some(device_id) = &device_id {
            indexes
                .by_device
                .entry(device_id.clone())
                .or_default()
                .insert(observer_id);
        }

        indexes.observers.insert(
            observer_id,
            ObserverEntry {
                sender,
                device_id: device_id.clone(),
            },
        );

        tracing::debug!(
            "Observer {} subscribed (device: {})",
            observer_id,
            device_id.as_deref().unwrap_or("<all>")
        );

        observer_id
    }

    pub async fn unsubscribe(&self, observer_id: Uuid) {
        if self.indexes.write().await.remove(observer_id).is_some() {
            tracing::debug!("Observer {} unsubscribed", observer_id);
        }
    }

    /// Deliver an event and return how many observers received it.
    /// Observers whose channel is gone are purged from both indexes.
    pub async fn publish(&self, event: &RelayEvent, device_id: Option<&str>) -> usize {
        let json = match serde_json::to_string(event) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!("Failed to serialize event: {}", e);
                return 0;
            }
        };

        let mut delivered = 0;
        let mut dead = Vec::new();

        {
            let indexes = self.indexes.read().await;
            for observer_id in self.targets(&indexes, device_id) {
                if let Some(entry) = indexes.observers.get(&observer_id) {
                    if entry.sender.send(json.clone()).is_ok() {
                        delivered += 1;
                    } else {
                        dead.push(observer_id);
                    }
                }
            }
        }

        if !dead.is_empty() {
            let mut indexes = self.indexes.write().await;
            for observer_id in dead {
                indexes.remove(observer_id);
                tracing::debug!("Dropped unreachable observer {}", observer_id);
            }
        }

        delivered
    }

    /// Send an event to one observer
    pub async fn send_to(&self, observer_id: Uuid, event: &RelayEvent) -> bool {
        let json = match serde_json::to_string(event) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!("Failed to serialize event: {}", e);
                return false;
            }
        };

        let sent = match self.indexes.read().await.observers.get(&observer_id) {
            Some(entry) => entry.sender.send(json).is_ok(),
            None => return false,
        };

        if !sent {
            self.indexes.write().await.remove(observer_id);
        }
        sent
    }

    pub async fn observer_count(&self) -> usize {
        self.indexes.read().await.observers.len()
    }

    pub async fn device_observer_count(&self, device_id: &str) -> usize {
        self.indexes
            .read()
            .await
            .by_device
            .get(device_id)
            .map(HashSet::len)
            .unwrap_or(0)
    }

    /// The one place that decides who receives an event
    fn targets(&self, indexes: &Indexes, device_id: Option<&str>) -> Vec<Uuid> {
        let Some(device_id) = device_id else {
            return indexes.observers.keys().copied().collect();
        };

        if let Some(subs) = indexes.by_device.get(device_id) {
            return subs.iter().copied().collect();
        }

        match self.policy {
            RoutingPolicy::DeviceOnly => Vec::new(),
            RoutingPolicy::FallbackToAnonymous => indexes
                .observers
                .iter()
                .filter(|(_, entry)| entry.device_id.is_none())
                .map(|(id, _)| *id)
                .collect(),
        }
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new(RoutingPolicy::FallbackToAnonymous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn observer(
        hub: &BroadcastHub,
        device_id: Option<&str>,
    ) -> (Uuid, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = hub.subscribe(tx, device_id.map(String::from)).await;
        (id, rx)
    }

    #[tokio::test]
    async fn device_events_reach_only_that_device() {
        let hub = BroadcastHub::default();
        let (_, mut a) = observer(&hub, Some("kiosk-a")).await;
        let (_, mut b) = observer(&hub, Some("kiosk-b")).await;
        let (_, mut anon) = observer(&hub, None).await;

        let delivered = hub.publish(&RelayEvent::Pong, Some("kiosk-a")).await;

        assert_eq!(delivered, 1);
        assert!(a.try_recv().is_ok());
        assert!(b.try_recv().is_err());
        assert!(anon.try_recv().is_err());
    }

    #[tokio::test]
    async fn unscoped_events_reach_everyone() {
        let hub = BroadcastHub::default();
        let (_, mut a) = observer(&hub, Some("kiosk-a")).await;
        let (_, mut anon) = observer(&hub, None).await;

        assert_eq!(hub.publish(&RelayEvent::Connected, None).await, 2);
        assert!(a.try_recv().is_ok());
        assert!(anon.try_recv().is_ok());
    }

    #[tokio::test]
    async fn fallback_goes_to_anonymous_observers_only() {
        let hub = BroadcastHub::new(RoutingPolicy::FallbackToAnonymous);
        let (_, mut other) = observer(&hub, Some("kiosk-b")).await;
        let (_, mut anon) = observer(&hub, None).await;

        assert_eq!(hub.publish(&RelayEvent::Pong, Some("kiosk-a")).await, 1);
        assert!(anon.try_recv().is_ok());
        assert!(other.try_recv().is_err());
    }

    #[tokio::test]
    async fn fallback_can_be_disabled() {
        let hub = BroadcastHub::new(RoutingPolicy::DeviceOnly);
        let (_, mut anon) = observer(&hub, None).await;

        assert_eq!(hub.publish(&RelayEvent::Pong, Some("kiosk-a")).await, 0);
        assert!(anon.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_observer_is_purged_from_both_indexes() {
        let hub = BroadcastHub::default();
        let (_, rx) = observer(&hub, Some("kiosk-a")).await;
        let (_, mut alive) = observer(&hub, Some("kiosk-a")).await;
        drop(rx);

        assert_eq!(hub.observer_count().await, 2);
        let delivered = hub.publish(&RelayEvent::Pong, Some("kiosk-a")).await;

        assert_eq!(delivered, 1);
        assert!(alive.try_recv().is_ok());
        assert_eq!(hub.observer_count().await, 1);
        assert_eq!(hub.device_observer_count("kiosk-a").await, 1);
    }

    #[tokio::test]
    async fn unsubscribe_clears_device_index() {
        let hub = BroadcastHub::default();
        let (id, _rx) = observer(&hub, Some("kiosk-a")).await;

        hub.unsubscribe(id).await;

        assert_eq!(hub.observer_count().await, 0);
        assert_eq!(hub.device_observer_count("kiosk-a").await, 0);
        assert!(!hub.send_to(id, &RelayEvent::Pong).await);
    }
}
