use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};

use super::datastore::Item;

/// Guard that removes an item from the in-flight set when dropped.
/// Cleanup happens whether the item succeeded, failed, panicked or was never
/// handed to a worker because the job was stopped.
#[derive(Debug)]
pub struct InFlightGuard {
    item_id: i64,
    in_flight: Arc<Mutex<HashSet<i64>>>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Ok(mut set) = self.in_flight.lock() {
            set.remove(&self.item_id);
        }
    }
}

/// An item claimed by the producer, on its way to (or held by) a worker.
#[derive(Debug)]
pub struct WorkUnit {
    pub item: Item,
    _guard: InFlightGuard,
}

/// Ids dispatched to some worker and not yet finished. Keeps the producer from
/// fetching an item a second time while its first fetch is still unpersisted.
#[derive(Debug, Clone, Default)]
pub struct InFlightSet {
    ids: Arc<Mutex<HashSet<i64>>>,
}

impl InFlightSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops items already in flight and claims the rest, all under one lock.
    pub fn claim(&self, items: Vec<Item>) -> Vec<WorkUnit> {
        let mut claimed = Vec::with_capacity(items.len());
        let mut ids = self.ids.lock().unwrap();
        for item in items {
            if ids.insert(item.id) {
                claimed.push(WorkUnit {
                    _guard: InFlightGuard {
                        item_id: item.id,
                        in_flight: self.ids.clone(),
                    },
                    item,
                });
            }
        }
        claimed
    }

    pub fn contains(&self, item_id: i64) -> bool {
        self.ids.lock().unwrap().contains(&item_id)
    }

    pub fn len(&self) -> usize {
        self.ids.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
