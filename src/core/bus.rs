use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

type Listener = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: usize,
    by_id: BTreeMap<usize, Listener>,
}

fn lock(listeners: &Mutex<Listeners>) -> MutexGuard<'_, Listeners> {
    listeners.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Payload-free "cached data changed" notifications.
///
/// Subscribers re-read the cache when called. A listener that panics is
/// logged and skipped; the rest still run.
#[derive(Clone, Default)]
pub struct EventBus {
    listeners: Arc<Mutex<Listeners>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener`. It stays registered until the returned
    /// subscription is unsubscribed or dropped.
    pub fn subscribe(&self, listener: impl Fn() + Send + Sync + 'static) -> Subscription {
        let mut listeners = lock(&self.listeners);
        let id = listeners.next_id;
        listeners.next_id += 1;
        listeners.by_id.insert(id, Arc::new(listener));
        Subscription {
            id,
            bus: Arc::downgrade(&self.listeners),
        }
    }

    /// Notify every subscriber, in subscription order. Called with no lock
    /// held, so listeners may subscribe, unsubscribe or read the cache.
    pub fn emit(&self) {
        let snapshot: Vec<(usize, Listener)> = lock(&self.listeners)
            .by_id
            .iter()
            .map(|(id, l)| (*id, Arc::clone(l)))
            .collect();
        for (id, listener) in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener())).is_err() {
                log::error!("Change listener #{} panicked; continuing", id);
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.listeners).by_id.len()
    }
}

/// Handle for one listener registration.
pub struct Subscription {
    id: usize,
    bus: Weak<Mutex<Listeners>>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        // Drop does the work.
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.bus.upgrade() {
            lock(&listeners).by_id.remove(&self.id);
        }
    }
}
