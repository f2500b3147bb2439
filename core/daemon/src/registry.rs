//! Live production-update subscribers.
//!
//! Connections that issue `subscribe` register a channel here and stream
//! whatever the ticker and event handlers publish. The registry is injected
//! rather than global so tests can observe publications directly.

use shift_core::ProductionUpdate;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Mutex, MutexGuard, PoisonError};

pub type SubscriberId = u64;

pub trait ProductionPublisher: Send + Sync {
    fn publish(&self, update: &ProductionUpdate);
}

#[derive(Default)]
pub struct SubscriberRegistry {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<SubscriberId, Sender<ProductionUpdate>>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self) -> (SubscriberId, Receiver<ProductionUpdate>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (sender, receiver) = mpsc::channel();
        self.lock_subscribers().insert(id, sender);
        tracing::debug!(subscriber_id = id, "Subscriber registered");
        (id, receiver)
    }

    pub fn unregister(&self, id: SubscriberId) {
        if self.lock_subscribers().remove(&id).is_some() {
            tracing::debug!(subscriber_id = id, "Subscriber unregistered");
        }
    }

    pub fn len(&self) -> usize {
        self.lock_subscribers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // A panicked holder leaves the map intact; keep serving it.
    fn lock_subscribers(&self) -> MutexGuard<'_, HashMap<SubscriberId, Sender<ProductionUpdate>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Sends to every subscriber, dropping those whose receiver is gone.
    /// Returns the number of subscribers reached.
    pub fn broadcast(&self, update: &ProductionUpdate) -> usize {
        let mut subscribers = self.lock_subscribers();
        subscribers.retain(|_, sender| sender.send(update.clone()).is_ok());
        subscribers.len()
    }
}

impl ProductionPublisher for SubscriberRegistry {
    fn publish(&self, update: &ProductionUpdate) {
        self.broadcast(update);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use shift_core::ShiftType;

    fn update(total: i64) -> ProductionUpdate {
        let at = Utc.with_ymd_and_hms(2026, 3, 2, 7, 5, 0).single().unwrap();
        ProductionUpdate {
            record_id: 1,
            machine_id: "m-1".to_string(),
            operator_id: "op-1".to_string(),
            shift_date: at.date_naive(),
            shift_type: ShiftType::Day,
            delta: total,
            total_production: total,
            efficiency: 0.0,
            at,
        }
    }

    #[test]
    fn broadcast_reaches_all_subscribers() {
        let registry = SubscriberRegistry::new();
        let (_a, rx_a) = registry.register();
        let (_b, rx_b) = registry.register();

        assert_eq!(registry.broadcast(&update(10)), 2);
        assert_eq!(rx_a.recv().unwrap().total_production, 10);
        assert_eq!(rx_b.recv().unwrap().total_production, 10);
    }

    #[test]
    fn dropped_receivers_are_pruned() {
        let registry = SubscriberRegistry::new();
        let (_a, rx_a) = registry.register();
        let (_b, rx_b) = registry.register();
        drop(rx_b);

        assert_eq!(registry.broadcast(&update(1)), 1);
        assert_eq!(registry.len(), 1);
        assert!(rx_a.try_recv().is_ok());
    }

    #[test]
    fn registration_survives_a_poisoned_lock() {
        let registry = std::sync::Arc::new(SubscriberRegistry::new());
        let poisoner = registry.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.subscribers.lock().unwrap();
            panic!("holder panicked");
        })
        .join();
        assert!(registry.subscribers.is_poisoned());

        let (_id, rx) = registry.register();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.broadcast(&update(3)), 1);
        assert_eq!(rx.recv().unwrap().total_production, 3);
    }

    #[test]
    fn unregister_stops_delivery() {
        let registry = SubscriberRegistry::new();
        let (id, rx) = registry.register();
        registry.unregister(id);
        assert!(registry.is_empty());
        registry.publish(&update(5));
        assert!(rx.try_recv().is_err());
    }
}
