use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::core::bus::EventBus;
use crate::core::cache::SharedCache;
use crate::core::error::{RemoteError, SyncError};
use crate::core::models::{
    EntityKey, ErrorClass, IntentId, IntentOp, Item, MutationIntent, OpKind, OwnerId, Scope,
    SyncState,
};
use crate::core::outbox::Outbox;
use crate::core::reconcile;
use crate::core::remote::{DeleteOutcome, Remote};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Online,
    Offline,
}

/// A terminal outbox failure, published so the UI can offer a retry.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncFailure {
    pub owner: OwnerId,
    pub intent_id: IntentId,
    pub op_kind: OpKind,
    pub key: EntityKey,
    pub class: ErrorClass,
    pub reason: String,
    /// The same failure in the caller taxonomy, e.g. `Conflict` when the
    /// partition changed on the server and was re-fetched.
    pub error: SyncError,
}

/// Exponential backoff for transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    /// Delay before attempt `attempts + 1`: `base * 2^(attempts - 1)`, capped.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exp)
            .map_or(self.max, |d| d.min(self.max))
    }
}

/// What the remote answered for one intent.
enum Answer {
    Created(Item),
    Updated(Item),
    Deleted,
}

enum Step {
    Applied,
    Parked,
    Backoff,
    Halted,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Drains the outbox against the remote.
///
/// Each owner's lane is sent strictly in order, one intent in flight at a
/// time; different owners drain concurrently. A drain requested while one
/// is already running for that owner is folded into the running one.
pub struct Dispatcher {
    outbox: Arc<Outbox>,
    cache: Arc<SharedCache>,
    remote: Arc<dyn Remote>,
    bus: EventBus,
    policy: RetryPolicy,
    connectivity: watch::Sender<Connectivity>,
    failures: mpsc::UnboundedSender<SyncFailure>,
    /// Owners being drained, and whether another pass was requested
    /// (`Some(force)`).
    draining: Mutex<HashMap<OwnerId, Option<bool>>>,
}

impl Dispatcher {
    pub fn new(
        outbox: Arc<Outbox>,
        cache: Arc<SharedCache>,
        remote: Arc<dyn Remote>,
        bus: EventBus,
        policy: RetryPolicy,
        initial: Connectivity,
    ) -> (Self, mpsc::UnboundedReceiver<SyncFailure>) {
        let (failures, failures_rx) = mpsc::unbounded_channel();
        let (connectivity, _) = watch::channel(initial);
        let dispatcher = Dispatcher {
            outbox,
            cache,
            remote,
            bus,
            policy,
            connectivity,
            failures,
            draining: Mutex::new(HashMap::new()),
        };
        (dispatcher, failures_rx)
    }

    pub fn connectivity(&self) -> Connectivity {
        *self.connectivity.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.connectivity() == Connectivity::Online
    }

    /// Report connectivity from the platform. Coming back online drains
    /// every owner immediately, ignoring backoff; returns how many intents
    /// were applied by that drain.
    pub async fn set_online(&self, online: bool) -> usize {
        let next = if online {
            Connectivity::Online
        } else {
            Connectivity::Offline
        };
        let prev = self.connectivity.send_replace(next);
        if prev == next {
            return 0;
        }
        log::info!("Connectivity {:?} -> {:?}", prev, next);
        if next == Connectivity::Online {
            self.drain_all(true).await
        } else {
            0
        }
    }

    /// Drain every owner with pending work, concurrently.
    pub async fn drain_all(&self, force: bool) -> usize {
        let owners = self.outbox.owners_with_pending();
        join_all(owners.iter().map(|owner| self.drain_owner(owner, force)))
            .await
            .into_iter()
            .sum()
    }

    /// Send `owner`'s queued intents in order until the lane is empty, a
    /// transient failure backs it off, or connectivity drops.
    pub async fn drain_owner(&self, owner: &OwnerId, mut force: bool) -> usize {
        {
            let mut draining = lock(&self.draining);
            if let Some(again) = draining.get_mut(owner) {
                *again = Some(again.unwrap_or(false) || force);
                return 0;
            }
            draining.insert(owner.clone(), None);
        }

        let mut applied = 0;
        loop {
            while self.is_online() {
                let Some(intent) = self.outbox.peek_next(owner, force) else {
                    break;
                };
                match self.dispatch_one(intent).await {
                    Step::Applied => applied += 1,
                    Step::Parked => {}
                    Step::Backoff | Step::Halted => break,
                }
            }

            let mut draining = lock(&self.draining);
            match draining.get(owner).copied().flatten() {
                Some(forced) if self.is_online() => {
                    draining.insert(owner.clone(), None);
                    force = forced;
                    continue;
                }
                _ => {
                    draining.remove(owner);
                    break;
                }
            }
        }

        if applied > 0 {
            log::debug!("Drained {} intents for {}", applied, owner);
        }
        applied
    }

    async fn dispatch_one(&self, intent: MutationIntent) -> Step {
        if let Err(e) = self.outbox.mark_dispatching(intent.id).await {
            log::error!("Cannot dispatch intent {}: {}", intent.id, e);
            return Step::Halted;
        }
        let attempts = intent.attempts + 1;

        match self.send(&intent).await {
            Ok(answer) => {
                if let Err(e) = self.outbox.mark_applied(intent.id).await {
                    log::error!("Intent {} applied but not cleared: {}", intent.id, e);
                }
                self.reconcile(&intent, answer).await;
                self.bus.emit();
                Step::Applied
            }
            Err(err) if err.class() == ErrorClass::Transient => {
                let backoff = self.policy.backoff(attempts);
                log::warn!(
                    "{} intent {} for {} failed ({}); retry #{} in {:?}",
                    intent.op.kind(),
                    intent.id,
                    intent.owner,
                    err,
                    attempts,
                    backoff
                );
                if let Err(e) = self
                    .outbox
                    .mark_failed(intent.id, ErrorClass::Transient, err.to_string(), backoff)
                    .await
                {
                    log::error!("Failed to record retry for {}: {}", intent.id, e);
                    return Step::Halted;
                }
                Step::Backoff
            }
            Err(err) => {
                self.park(&intent, err).await;
                Step::Parked
            }
        }
    }

    async fn send(&self, intent: &MutationIntent) -> Result<Answer, RemoteError> {
        let owner = &intent.owner;
        match &intent.op {
            IntentOp::Create { draft, .. } => {
                self.remote.create_entity(owner, draft).await.map(Answer::Created)
            }
            IntentOp::Update { key, patch } => {
                let Some(server_key) = key.as_server() else {
                    return Err(RemoteError::Validation {
                        reason: format!("{key} was never created"),
                    });
                };
                self.remote
                    .update_entity(owner, server_key, patch)
                    .await
                    .map(Answer::Updated)
            }
            IntentOp::Delete { key } => {
                let Some(server_key) = key.as_server() else {
                    log::debug!("Delete of never-created {}; nothing to send", key);
                    return Ok(Answer::Deleted);
                };
                match self.remote.delete_entity(owner, server_key).await {
                    Ok(DeleteOutcome::Deleted) => Ok(Answer::Deleted),
                    Ok(DeleteOutcome::NotFound) | Err(RemoteError::NotFound) => {
                        log::debug!("{} already gone on the server", key);
                        Ok(Answer::Deleted)
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    async fn reconcile(&self, intent: &MutationIntent, answer: Answer) {
        let owner = &intent.owner;
        let scope = &intent.scope;
        let target = intent.op.target();
        let more_pending = self.outbox.has_pending_for(owner, &target);

        match (answer, &intent.op) {
            (Answer::Created(item), IntentOp::Create { placeholder, .. }) => {
                let placeholder = *placeholder;
                let server_key = self.cache.write(owner, scope, |cache| {
                    reconcile::reconcile_create(
                        cache,
                        owner,
                        scope,
                        placeholder,
                        item,
                        intent.issued_at,
                        more_pending,
                    )
                });
                if let Some(server_key) = server_key {
                    if let Err(e) = self.outbox.rekey(owner, placeholder, &server_key).await {
                        log::error!("Failed to re-key follow-ups of {}: {}", target, e);
                    }
                }
            }
            (Answer::Updated(item), IntentOp::Update { key, .. }) => {
                self.cache.write(owner, scope, |cache| {
                    reconcile::reconcile_update(
                        cache,
                        owner,
                        scope,
                        key,
                        item,
                        intent.issued_at,
                        more_pending,
                    )
                });
            }
            (Answer::Deleted, IntentOp::Delete { key }) => {
                self.cache.write(owner, scope, |cache| {
                    reconcile::reconcile_delete(cache, owner, scope, key)
                });
            }
            _ => log::error!("Answer does not match {} intent {}", intent.op.kind(), intent.id),
        }
    }

    /// Park a terminally failed intent, flag its item and tell the UI.
    async fn park(&self, intent: &MutationIntent, err: RemoteError) {
        let target = intent.op.target();
        log::error!(
            "{} intent {} for {} on {} rejected: {}",
            intent.op.kind(),
            intent.id,
            intent.owner,
            target,
            err
        );
        if let Err(e) = self
            .outbox
            .mark_failed(intent.id, ErrorClass::Terminal, err.to_string(), Duration::ZERO)
            .await
        {
            log::error!("Failed to park intent {}: {}", intent.id, e);
        }

        self.cache.write(&intent.owner, &intent.scope, |cache| {
            cache.patch(&intent.owner, &intent.scope, &target, |item| {
                item.sync = SyncState::Failed;
            })
        });

        let failure = SyncFailure {
            owner: intent.owner.clone(),
            intent_id: intent.id,
            op_kind: intent.op.kind(),
            error: SyncError::from_remote(&target, err.clone()),
            key: target,
            class: ErrorClass::Terminal,
            reason: err.to_string(),
        };
        if self.failures.send(failure).is_err() {
            log::debug!("No listener for sync failures");
        }

        if matches!(err, RemoteError::Conflict { .. }) {
            if let Err(e) = self.refresh(&intent.owner, &intent.scope).await {
                log::warn!("Refresh after conflict failed for {}/{}: {}", intent.owner, intent.scope, e);
            }
        }
        self.bus.emit();
    }

    /// Re-fetch a partition and merge it into the cache.
    pub async fn refresh(&self, owner: &OwnerId, scope: &Scope) -> Result<(), RemoteError> {
        let fetched = self.remote.fetch_by_scope(owner, scope).await?;
        let dropped = self.cache.write(owner, scope, |cache| {
            reconcile::merge_fetched(cache, owner, scope, fetched)
        });
        if dropped > 0 {
            log::warn!("Refresh of {}/{} dropped {} stale placeholders", owner, scope, dropped);
        }
        self.bus.emit();
        Ok(())
    }

    /// Drain (without forcing) every `every` while online. While offline
    /// the task sleeps on the connectivity channel instead. It ends once
    /// the dispatcher is dropped.
    pub fn spawn_ticker(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let mut connectivity = self.connectivity.subscribe();
        tokio::spawn(async move {
            loop {
                loop {
                    let offline = *connectivity.borrow_and_update() == Connectivity::Offline;
                    if !offline {
                        break;
                    }
                    if connectivity.changed().await.is_err() {
                        return;
                    }
                }
                tokio::time::sleep(every).await;
                let Some(dispatcher) = weak.upgrade() else {
                    break;
                };
                if dispatcher.is_online() {
                    dispatcher.drain_all(false).await;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cache::LocalCache;
    use crate::core::models::{ItemDraft, ItemPatch, ItemStatus, TempKey};
    use crate::testing::{Call, FakeRemote, Op};

    struct Rig {
        remote: Arc<FakeRemote>,
        outbox: Arc<Outbox>,
        cache: Arc<SharedCache>,
        dispatcher: Dispatcher,
        failures: mpsc::UnboundedReceiver<SyncFailure>,
    }

    fn rig(initial: Connectivity) -> Rig {
        let remote = Arc::new(FakeRemote::new());
        let outbox = Arc::new(Outbox::new(None));
        let cache = Arc::new(SharedCache::new(LocalCache::new(), None));
        let policy = RetryPolicy {
            base: Duration::from_secs(1),
            max: Duration::from_secs(8),
        };
        let (dispatcher, failures) = Dispatcher::new(
            Arc::clone(&outbox),
            Arc::clone(&cache),
            remote.clone(),
            EventBus::new(),
            policy,
            initial,
        );
        Rig {
            remote,
            outbox,
            cache,
            dispatcher,
            failures,
        }
    }

    fn owner() -> OwnerId {
        OwnerId::from("u1")
    }

    fn intent(op: IntentOp) -> MutationIntent {
        MutationIntent::new(owner(), Scope::active(), 0, op, 1)
    }

    /// Cache the server's copy of `key` the way a refresh would.
    async fn prime(rig: &Rig) {
        rig.dispatcher.refresh(&owner(), &Scope::active()).await.unwrap();
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            base: Duration::from_millis(500),
            max: Duration::from_secs(3),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_secs(1));
        assert_eq!(policy.backoff(3), Duration::from_secs(2));
        assert_eq!(policy.backoff(4), Duration::from_secs(3));
        assert_eq!(policy.backoff(60), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn delete_drains_and_reconciles() {
        let rig = rig(Connectivity::Online);
        let key = rig.remote.seed("u1", &Scope::active(), "Milk");
        prime(&rig).await;

        rig.outbox.enqueue(intent(IntentOp::Delete { key: key.clone() })).await.unwrap();
        assert_eq!(rig.dispatcher.drain_owner(&owner(), false).await, 1);

        assert_eq!(rig.outbox.pending_count(), 0);
        assert!(rig.remote.server_items("u1", &Scope::active()).is_empty());
        assert!(rig.cache.read(|c| c.read_all(&owner(), &Scope::active())).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn lane_is_sent_in_order() {
        let rig = rig(Connectivity::Online);
        let a = rig.remote.seed("u1", &Scope::active(), "A");
        let b = rig.remote.seed("u1", &Scope::active(), "B");
        prime(&rig).await;

        let patch = ItemPatch {
            quantity: Some(2),
            ..Default::default()
        };
        rig.outbox
            .enqueue(intent(IntentOp::Update { key: b.clone(), patch }))
            .await
            .unwrap();
        rig.outbox.enqueue(intent(IntentOp::Delete { key: a.clone() })).await.unwrap();
        rig.dispatcher.drain_all(false).await;

        let sent: Vec<Call> = rig
            .remote
            .calls()
            .into_iter()
            .filter(|c| !matches!(c, Call::Fetch { .. }))
            .collect();
        assert_eq!(
            sent,
            vec![
                Call::Update {
                    owner: owner(),
                    key: b.as_server().unwrap().clone()
                },
                Call::Delete {
                    owner: owner(),
                    key: a.as_server().unwrap().clone()
                },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn offline_holds_the_queue_until_reconnect() {
        let rig = rig(Connectivity::Offline);
        let key = rig.remote.seed("u1", &Scope::active(), "Eggs");
        rig.outbox.enqueue(intent(IntentOp::Delete { key })).await.unwrap();

        assert_eq!(rig.dispatcher.drain_all(false).await, 0);
        assert_eq!(rig.remote.count(Op::Delete), 0);

        assert_eq!(rig.dispatcher.set_online(true).await, 1);
        assert_eq!(rig.remote.count(Op::Delete), 1);
        assert_eq!(rig.dispatcher.set_online(true).await, 0, "no transition, no drain");
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_backs_off_then_retries() {
        let rig = rig(Connectivity::Online);
        let key = rig.remote.seed("u1", &Scope::active(), "Bread");
        let id = rig.outbox.enqueue(intent(IntentOp::Delete { key })).await.unwrap();
        rig.remote.fail_next(Op::Delete, RemoteError::Server { status: 503 });

        assert_eq!(rig.dispatcher.drain_owner(&owner(), false).await, 0);
        let queued = rig.outbox.get(id).unwrap();
        assert_eq!(queued.attempts, 1);
        assert_eq!(
            queued.state,
            crate::core::models::IntentState::Failed(ErrorClass::Transient)
        );

        // Still backing off.
        assert_eq!(rig.dispatcher.drain_owner(&owner(), false).await, 0);
        tokio::time::advance(Duration::from_millis(1100)).await;
        assert_eq!(rig.dispatcher.drain_owner(&owner(), false).await, 1);
        assert_eq!(rig.remote.count(Op::Delete), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_failure_is_published_and_lane_continues() {
        let mut rig = rig(Connectivity::Online);
        let a = rig.remote.seed("u1", &Scope::active(), "A");
        let b = rig.remote.seed("u1", &Scope::active(), "B");
        prime(&rig).await;

        let bad = rig
            .outbox
            .enqueue(intent(IntentOp::Update {
                key: a.clone(),
                patch: ItemPatch::default(),
            }))
            .await
            .unwrap();
        rig.outbox.enqueue(intent(IntentOp::Delete { key: b })).await.unwrap();
        rig.remote.fail_next(
            Op::Update,
            RemoteError::Validation {
                reason: "bad date".into(),
            },
        );

        assert_eq!(rig.dispatcher.drain_owner(&owner(), false).await, 1);
        let failure = rig.failures.try_recv().unwrap();
        assert_eq!(failure.intent_id, bad);
        assert_eq!(failure.op_kind, OpKind::Update);
        assert_eq!(failure.key, a);
        assert_eq!(failure.class, ErrorClass::Terminal);
        assert_eq!(failure.error, SyncError::Validation("bad date".into()));

        let flagged = rig
            .cache
            .read(|c| c.get(&owner(), &Scope::active(), &a).cloned())
            .unwrap();
        assert_eq!(flagged.sync, SyncState::Failed);
        assert_eq!(rig.outbox.list_failed(&owner()).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn conflict_refetches_the_partition() {
        let mut rig = rig(Connectivity::Online);
        let a = rig.remote.seed("u1", &Scope::active(), "A");
        prime(&rig).await;
        rig.outbox
            .enqueue(intent(IntentOp::Update {
                key: a,
                patch: ItemPatch::default(),
            }))
            .await
            .unwrap();
        rig.remote.fail_next(
            Op::Update,
            RemoteError::Conflict {
                reason: "stale".into(),
            },
        );

        rig.dispatcher.drain_owner(&owner(), false).await;
        let failure = rig.failures.try_recv().unwrap();
        assert!(matches!(failure.error, SyncError::Conflict { .. }));
        assert_eq!(rig.remote.count(Op::Fetch), 2);
        let items = rig.cache.read(|c| c.read_all(&owner(), &Scope::active()));
        assert_eq!(items[0].sync, SyncState::Synced);
    }

    #[tokio::test(start_paused = true)]
    async fn delete_not_found_counts_as_success() {
        let rig = rig(Connectivity::Online);
        rig.outbox
            .enqueue(intent(IntentOp::Delete {
                key: EntityKey::server("long-gone"),
            }))
            .await
            .unwrap();
        assert_eq!(rig.dispatcher.drain_owner(&owner(), false).await, 1);
        assert!(rig.outbox.list_failed(&owner()).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn create_rekeys_followups_before_they_are_sent() {
        let rig = rig(Connectivity::Online);
        let seq = rig.outbox.reserve_seq();
        let temp = TempKey(seq);
        let draft = ItemDraft::named("Cheese");
        rig.cache.write(&owner(), &Scope::active(), |c| {
            c.append(
                &owner(),
                &Scope::active(),
                Item::from_draft(EntityKey::Optimistic(temp), &draft, 1),
            )
        });
        let mut create = intent(IntentOp::Create {
            placeholder: temp,
            draft,
        });
        create.seq = seq;
        rig.outbox.enqueue(create).await.unwrap();
        let mut followup = intent(IntentOp::Update {
            key: EntityKey::Optimistic(temp),
            patch: ItemPatch {
                quantity: Some(4),
                ..Default::default()
            },
        });
        followup.issued_at = 2;
        rig.outbox.enqueue(followup).await.unwrap();

        assert_eq!(rig.dispatcher.drain_owner(&owner(), false).await, 2);
        let items = rig.cache.read(|c| c.read_all(&owner(), &Scope::active()));
        assert_eq!(items.len(), 1);
        assert!(!items[0].key.is_optimistic());
        assert_eq!(items[0].name, "Cheese");
        assert_eq!(items[0].quantity, Some(4));
        assert_eq!(items[0].status, ItemStatus::Active);
        assert_eq!(items[0].sync, SyncState::Synced);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_during_a_drain_forces_the_rerun() {
        let rig = rig(Connectivity::Online);
        let a = rig.remote.seed("u1", &Scope::active(), "A");
        let b = rig.remote.seed("u1", &Scope::active(), "B");
        rig.outbox.enqueue(intent(IntentOp::Delete { key: a })).await.unwrap();
        rig.outbox.enqueue(intent(IntentOp::Delete { key: b })).await.unwrap();
        rig.remote.set_latency(Duration::from_millis(100));
        rig.remote.fail_next(Op::Delete, RemoteError::ConnectionReset);

        // The link drops and comes back while the first delete is in flight;
        // that delete then fails and backs the lane off.
        let reconnect = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            rig.dispatcher.set_online(false).await;
            rig.dispatcher.set_online(true).await
        };
        let o = owner();
        let (applied, folded) =
            tokio::join!(rig.dispatcher.drain_owner(&o, false), reconnect);

        assert_eq!(folded, 0);
        assert_eq!(applied, 2);
        assert_eq!(rig.remote.count(Op::Delete), 3);
        assert_eq!(rig.outbox.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_drains_only_while_online() {
        let rig = rig(Connectivity::Offline);
        let key = rig.remote.seed("u1", &Scope::active(), "Milk");
        rig.outbox.enqueue(intent(IntentOp::Delete { key })).await.unwrap();
        let dispatcher = Arc::new(rig.dispatcher);
        let ticker = dispatcher.spawn_ticker(Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(rig.remote.count(Op::Delete), 0);

        // Flip the state without the reconnect drain; only the ticker sends.
        dispatcher.connectivity.send_replace(Connectivity::Online);
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(rig.remote.count(Op::Delete), 1);

        drop(dispatcher);
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(ticker.is_finished());
    }
}
