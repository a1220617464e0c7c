use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::task::JoinHandle;

use crate::core::models::{IntentId, OpKind, OwnerId, Scope};

/// Work to run when an undo window closes without being cancelled.
pub type ExpireFuture = BoxFuture<'static, ()>;

/// The UI surface an undo affordance lives on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UndoSlot {
    pub owner: OwnerId,
    pub scope: Scope,
    pub kind: OpKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    Armed,
    Cancelled,
    Fired,
}

struct ArmedTimer {
    slot: UndoSlot,
    state: TimerState,
    generation: u64,
    sleeper: Option<JoinHandle<()>>,
    on_expire: Option<ExpireFuture>,
}

impl ArmedTimer {
    fn stop(&mut self) {
        if let Some(sleeper) = self.sleeper.take() {
            sleeper.abort();
        }
    }
}

#[derive(Default)]
struct TimerTable {
    armed: HashMap<IntentId, ArmedTimer>,
    /// Slots that allow a single live window.
    exclusive: HashMap<UndoSlot, IntentId>,
    generation: u64,
}

impl TimerTable {
    /// Move an armed timer to a final state and take it out of the table.
    fn settle(&mut self, id: IntentId, to: TimerState) -> Option<ArmedTimer> {
        let mut timer = self.armed.remove(&id)?;
        if self.exclusive.get(&timer.slot) == Some(&id) {
            self.exclusive.remove(&timer.slot);
        }
        log::debug!("Undo timer {}: {:?} -> {:?}", id, timer.state, to);
        timer.state = to;
        Some(timer)
    }
}

fn lock(table: &Mutex<TimerTable>) -> MutexGuard<'_, TimerTable> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Single-shot undo windows keyed by intent id.
///
/// Each timer is `Armed` until it is either `Cancelled` (the callback is
/// dropped unrun) or `Fired` (the callback runs exactly once). Both moves
/// happen under one lock, so a cancel racing an expiry has one winner.
/// Timers run on tokio time; tests pause the clock to drive them.
#[derive(Clone, Default)]
pub struct UndoTimers {
    table: Arc<Mutex<TimerTable>>,
}

impl UndoTimers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a window for `id`. With `exclusive`, a timer already holding
    /// `slot` is fired early: it is removed here and its callback handed
    /// back for the caller to run, never run by the manager itself.
    pub fn arm<F>(
        &self,
        id: IntentId,
        duration: Duration,
        slot: UndoSlot,
        exclusive: bool,
        on_expire: F,
    ) -> Option<ExpireFuture>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut table = lock(&self.table);

        let displaced = if exclusive {
            let prev = table.exclusive.get(&slot).copied();
            prev.and_then(|prev| table.settle(prev, TimerState::Fired))
                .and_then(|mut timer| {
                    timer.stop();
                    log::debug!("Undo slot taken over; committing {} early", prev.unwrap_or(id));
                    timer.on_expire.take()
                })
        } else {
            None
        };

        if let Some(mut stale) = table.settle(id, TimerState::Cancelled) {
            stale.stop();
        }

        table.generation += 1;
        let generation = table.generation;
        let shared = Arc::clone(&self.table);
        let sleeper = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let fired = {
                let mut table = lock(&shared);
                let current = table.armed.get(&id).is_some_and(|t| t.generation == generation);
                if current {
                    table.settle(id, TimerState::Fired).and_then(|mut t| t.on_expire.take())
                } else {
                    None
                }
            };
            if let Some(on_expire) = fired {
                on_expire.await;
            }
        });

        table.armed.insert(
            id,
            ArmedTimer {
                slot: slot.clone(),
                state: TimerState::Armed,
                generation,
                sleeper: Some(sleeper),
                on_expire: Some(Box::pin(on_expire)),
            },
        );
        if exclusive {
            table.exclusive.insert(slot, id);
        }
        displaced
    }

    /// Cancel `id`'s window. Returns false if it already fired (or never
    /// existed); the callback is then not affected.
    pub fn cancel(&self, id: IntentId) -> bool {
        let cancelled = lock(&self.table).settle(id, TimerState::Cancelled);
        match cancelled {
            Some(mut timer) => {
                timer.stop();
                true
            }
            None => false,
        }
    }

    /// Close `id`'s window now and hand back its callback.
    pub fn flush(&self, id: IntentId) -> Option<ExpireFuture> {
        let mut timer = lock(&self.table).settle(id, TimerState::Fired)?;
        timer.stop();
        timer.on_expire.take()
    }

    /// Close every window of `owner`, oldest first.
    pub fn flush_owner(&self, owner: &OwnerId) -> Vec<ExpireFuture> {
        self.flush_where(|slot| &slot.owner == owner)
    }

    /// Close every window, oldest first.
    pub fn flush_all(&self) -> Vec<ExpireFuture> {
        self.flush_where(|_| true)
    }

    fn flush_where(&self, pick: impl Fn(&UndoSlot) -> bool) -> Vec<ExpireFuture> {
        let mut table = lock(&self.table);
        let mut ids: Vec<(u64, IntentId)> = table
            .armed
            .iter()
            .filter(|(_, t)| pick(&t.slot))
            .map(|(id, t)| (t.generation, *id))
            .collect();
        ids.sort();

        ids.into_iter()
            .filter_map(|(_, id)| table.settle(id, TimerState::Fired))
            .filter_map(|mut timer| {
                timer.stop();
                timer.on_expire.take()
            })
            .collect()
    }

    pub fn is_armed(&self, id: IntentId) -> bool {
        lock(&self.table).armed.contains_key(&id)
    }

    pub fn armed_count(&self) -> usize {
        lock(&self.table).armed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn slot() -> UndoSlot {
        UndoSlot {
            owner: OwnerId::from("u1"),
            scope: Scope::active(),
            kind: OpKind::Delete,
        }
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> ExpireFuture) {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let make = move || -> ExpireFuture {
            let h = Arc::clone(&h);
            Box::pin(async move {
                h.fetch_add(1, Ordering::SeqCst);
            })
        };
        (hits, make)
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_duration() {
        let timers = UndoTimers::new();
        let (hits, make) = counter();
        let id = IntentId::new();
        timers.arm(id, Duration::from_secs(5), slot(), false, make());

        tokio::time::sleep(Duration::from_millis(4900)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(timers.is_armed(id));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!timers.is_armed(id));
        assert!(!timers.cancel(id), "cancel after fire reports already fired");
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_preempts_expiry() {
        let timers = UndoTimers::new();
        let (hits, make) = counter();
        let id = IntentId::new();
        timers.arm(id, Duration::from_secs(5), slot(), false, make());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(timers.cancel(id));
        assert!(!timers.cancel(id));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exclusive_slot_hands_back_previous_callback() {
        let timers = UndoTimers::new();
        let (hits, make) = counter();
        let first = IntentId::new();
        let second = IntentId::new();

        assert!(timers
            .arm(first, Duration::from_secs(5), slot(), true, make())
            .is_none());
        let displaced = timers
            .arm(second, Duration::from_secs(5), slot(), true, make())
            .expect("first window displaced");
        assert!(!timers.is_armed(first));
        assert_eq!(hits.load(Ordering::SeqCst), 0, "manager never runs it itself");

        displaced.await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn independent_windows_coexist() {
        let timers = UndoTimers::new();
        let (hits, make) = counter();
        timers.arm(IntentId::new(), Duration::from_secs(5), slot(), false, make());
        timers.arm(IntentId::new(), Duration::from_secs(5), slot(), false, make());
        assert_eq!(timers.armed_count(), 2);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(timers.armed_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_owner_returns_oldest_first() {
        let timers = UndoTimers::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let a = IntentId::new();
        let b = IntentId::new();
        for id in [a, b] {
            let order = Arc::clone(&order);
            timers.arm(id, Duration::from_secs(5), slot(), false, async move {
                order.lock().unwrap().push(id);
            });
        }
        let mut other = slot();
        other.owner = OwnerId::from("u2");
        timers.arm(IntentId::new(), Duration::from_secs(5), other, false, async {});

        for f in timers.flush_owner(&OwnerId::from("u1")) {
            f.await;
        }
        assert_eq!(*order.lock().unwrap(), vec![a, b]);
        assert_eq!(timers.armed_count(), 1);
        assert!(timers.flush(a).is_none());
    }
}
