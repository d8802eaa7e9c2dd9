//! Change subscriptions for live collections.

use crate::engine::types::{FastMap, RillValue, RowKey};
use rill_protocol::ChangeOp;
use smol_str::SmolStr;
use std::rc::Rc;

pub type SubscriptionId = u64;

/// One materialized change delivered to subscribers.
#[derive(Clone, Debug)]
pub struct Change {
    pub op: ChangeOp,
    pub key: RowKey,
    pub value: RillValue,
    /// Fractional index for ordered queries.
    pub index: Option<SmolStr>,
    /// Replaced value on updates.
    pub previous: Option<RillValue>,
}

/// The atomically-applied changes of one graph run.
#[derive(Clone, Debug, Default)]
pub struct ChangeSet {
    pub changes: Vec<Change>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Change> {
        self.changes.iter()
    }
}

pub type ChangeCallback = Rc<dyn Fn(&ChangeSet)>;

/// Tracks the active subscriptions of one live collection. The number of
/// subscriptions doubles as the collection's reference count.
#[derive(Default)]
pub struct SubscriptionManager {
    subscribers: FastMap<SubscriptionId, ChangeCallback>,
    next_id: SubscriptionId,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, callback: ChangeCallback) -> SubscriptionId {
        self.next_id += 1;
        let id = self.next_id;
        self.subscribers.insert(id, callback);
        id
    }

    /// Returns true if the subscription existed.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.subscribers.remove(&id).is_some()
    }

    /// Callbacks snapshot, so notification can run without holding any
    /// borrow of the collection.
    pub fn callbacks(&self) -> Vec<ChangeCallback> {
        self.subscribers.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}

#[cfg(test)]
mod subscription_tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn test_subscribe_unsubscribe_refcount() {
        let mut manager = SubscriptionManager::new();
        let a = manager.subscribe(Rc::new(|_| {}));
        let b = manager.subscribe(Rc::new(|_| {}));
        assert_ne!(a, b);
        assert_eq!(manager.len(), 2);
        assert!(manager.unsubscribe(a));
        assert!(!manager.unsubscribe(a));
        assert_eq!(manager.len(), 1);
        assert!(manager.unsubscribe(b));
        assert!(manager.is_empty());
    }

    #[test]
    fn test_callbacks_snapshot_delivery() {
        let mut manager = SubscriptionManager::new();
        let hits: Rc<RefCell<usize>> = Rc::default();
        for _ in 0..3 {
            let hits = hits.clone();
            manager.subscribe(Rc::new(move |_| *hits.borrow_mut() += 1));
        }
        let set = ChangeSet::default();
        for cb in manager.callbacks() {
            cb(&set);
        }
        assert_eq!(*hits.borrow(), 3);
    }
}
