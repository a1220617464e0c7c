use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::core::bus::{EventBus, Subscription};
use crate::core::cache::{LocalCache, SharedCache};
use crate::core::dispatch::{Connectivity, Dispatcher, SyncFailure};
use crate::core::error::{SyncError, SyncResult};
use crate::core::models::{
    EntityKey, IntentId, Item, ItemPatch, ItemStatus, MutationIntent, OpKind, OwnerId, Scope,
    StampClock, SyncState,
};
use crate::core::outbox::Outbox;
use crate::core::remote::Remote;
use crate::core::store::StoreHandle;
use crate::core::undo::UndoTimers;

mod flows;
mod writes;

pub use flows::{DeleteFlow, UpdateFlow};
pub use writes::{PendingMutation, UndoOutcome};

/// Snapshot of sync health for status surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncStatus {
    pub connectivity: Connectivity,
    /// Queued or in-flight intents.
    pub pending: usize,
    /// Intents parked by a terminal failure.
    pub failed: usize,
    /// Undo windows still open.
    pub undo_windows: usize,
}

enum UndoAction {
    Delete,
    Update(ItemPatch),
}

impl UndoAction {
    fn kind(&self) -> OpKind {
        match self {
            UndoAction::Delete => OpKind::Delete,
            UndoAction::Update(_) => OpKind::Update,
        }
    }

    fn touched(&self) -> ItemPatch {
        match self {
            UndoAction::Delete => ItemPatch::with_status(ItemStatus::PendingDeletion),
            UndoAction::Update(patch) => patch.clone(),
        }
    }
}

/// What an open undo window needs to either commit or roll back.
struct UndoToken {
    owner: OwnerId,
    scope: Scope,
    key: EntityKey,
    /// The item as it was before the optimistic change.
    snapshot: Item,
    action: UndoAction,
    /// `mutated_at` written by the optimistic change.
    stamp: i64,
}

struct Inner {
    config: Config,
    cache: Arc<SharedCache>,
    outbox: Arc<Outbox>,
    timers: UndoTimers,
    bus: EventBus,
    dispatcher: Arc<Dispatcher>,
    clock: StampClock,
    tokens: Mutex<HashMap<IntentId, UndoToken>>,
    failures: Mutex<Option<mpsc::UnboundedReceiver<SyncFailure>>>,
    ticker: Option<JoinHandle<()>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(ticker) = &self.ticker {
            ticker.abort();
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
    /// The key a caller's (possibly stale) placeholder key now lives under.
    fn canonical(&self, owner: &OwnerId, scope: &Scope, key: &EntityKey) -> EntityKey {
        match key {
            EntityKey::Optimistic(temp) => self.cache.read(|c| {
                c.alias_of(owner, scope, *temp)
                    .map(|s| EntityKey::Authoritative(s.clone()))
                    .unwrap_or_else(|| key.clone())
            }),
            EntityKey::Authoritative(_) => key.clone(),
        }
    }

    /// Start draining `owner` in the background if allowed.
    fn kick(&self, owner: &OwnerId) {
        if !self.config.auto_dispatch || !self.dispatcher.is_online() {
            return;
        }
        let dispatcher = Arc::clone(&self.dispatcher);
        let owner = owner.clone();
        tokio::spawn(async move {
            dispatcher.drain_owner(&owner, false).await;
        });
    }
}

/// The offline-first write path: optimistic cache, undo windows, outbox
/// and dispatcher wired together.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<Inner>,
}

impl SyncEngine {
    /// Open with the durable store under `config.data_dir`.
    pub async fn open(config: Config, remote: Arc<dyn Remote>) -> SyncResult<Self> {
        let store = StoreHandle::open_at(&config.data_dir).map_err(SyncError::Store)?;
        Self::with_store(config, remote, Some(store)).await
    }

    /// Open over `store`, restoring cached partitions and the outbox from
    /// it. Without a store nothing survives the process.
    pub async fn with_store(
        config: Config,
        remote: Arc<dyn Remote>,
        store: Option<StoreHandle>,
    ) -> SyncResult<Self> {
        let mut cache = LocalCache::new();
        let outbox = match &store {
            Some(store) => {
                cache.restore(store.load_partitions().await.map_err(SyncError::Store)?);
                Outbox::restore(store.clone()).await.map_err(SyncError::Store)?
            }
            None => Outbox::new(None),
        };

        let cache = Arc::new(SharedCache::new(cache, store));
        let outbox = Arc::new(outbox);
        let bus = EventBus::new();
        let (dispatcher, failures) = Dispatcher::new(
            Arc::clone(&outbox),
            Arc::clone(&cache),
            remote,
            bus.clone(),
            config.retry_policy(),
            Connectivity::Online,
        );
        let dispatcher = Arc::new(dispatcher);
        let ticker = config.tick_interval().map(|every| dispatcher.spawn_ticker(every));

        let engine = SyncEngine {
            inner: Arc::new(Inner {
                config,
                cache,
                outbox,
                timers: UndoTimers::new(),
                bus,
                dispatcher,
                clock: StampClock::new(),
                tokens: Mutex::new(HashMap::new()),
                failures: Mutex::new(Some(failures)),
                ticker,
            }),
        };
        engine.recover_interrupted();

        let inner = &engine.inner;
        if inner.config.auto_dispatch && inner.outbox.pending_count() > 0 {
            for owner in inner.outbox.owners_with_pending() {
                inner.kick(&owner);
            }
        }
        Ok(engine)
    }

    /// Undo windows do not survive a restart. Items left mid-window are
    /// shown again and flagged `Failed`, so the next refresh replaces them
    /// with the server's copy.
    fn recover_interrupted(&self) {
        let inner = &self.inner;
        let mut latest = 0;
        let mut candidates: Vec<(OwnerId, Scope, EntityKey)> = Vec::new();
        inner.cache.read(|c| {
            for owner in c.owners() {
                for scope in c.scopes_of(&owner) {
                    for item in c.read_all(&owner, &scope) {
                        latest = latest.max(item.mutated_at);
                        let mid_window = matches!(
                            item.status,
                            ItemStatus::PendingDeletion | ItemStatus::PendingResolution
                        ) || item.sync == SyncState::Pending;
                        if mid_window {
                            candidates.push((owner.clone(), scope.clone(), item.key));
                        }
                    }
                }
            }
        });
        for owner in inner.outbox.owners() {
            for intent in inner.outbox.list_pending(&owner) {
                latest = latest.max(intent.issued_at);
            }
        }
        inner.clock.observe(latest);

        for (owner, scope, key) in candidates {
            if inner.outbox.has_pending_for(&owner, &key) {
                continue;
            }
            log::warn!("{} in {}/{} was mid-undo at shutdown; reverting", key, owner, scope);
            inner.cache.write(&owner, &scope, |c| {
                c.patch(&owner, &scope, &key, |item| {
                    if item.status == ItemStatus::PendingResolution {
                        item.resolution = None;
                    }
                    if item.status != ItemStatus::Resolved {
                        item.status = ItemStatus::Active;
                    }
                    item.sync = SyncState::Failed;
                })
            });
        }
    }

    // -- reads ---------------------------------------------------------------

    pub fn read(&self, owner: &OwnerId, scope: &Scope) -> Vec<Item> {
        self.inner.cache.read(|c| c.read(owner, scope))
    }

    pub fn read_all(&self, owner: &OwnerId, scope: &Scope) -> Vec<Item> {
        self.inner.cache.read(|c| c.read_all(owner, scope))
    }

    pub fn get(&self, owner: &OwnerId, scope: &Scope, key: &EntityKey) -> Option<Item> {
        let key = self.inner.canonical(owner, scope, key);
        self.inner.cache.read(|c| c.get(owner, scope, &key).cloned())
    }

    pub fn subscribe(&self, listener: impl Fn() + Send + Sync + 'static) -> Subscription {
        self.inner.bus.subscribe(listener)
    }

    pub fn events(&self) -> EventBus {
        self.inner.bus.clone()
    }

    /// The terminal failure channel. Handed out once.
    pub fn failures(&self) -> Option<mpsc::UnboundedReceiver<SyncFailure>> {
        lock(&self.inner.failures).take()
    }

    pub fn status(&self) -> SyncStatus {
        SyncStatus {
            connectivity: self.inner.dispatcher.connectivity(),
            pending: self.inner.outbox.pending_count(),
            failed: self.inner.outbox.failed_count(),
            undo_windows: self.inner.timers.armed_count(),
        }
    }

    pub fn pending(&self, owner: &OwnerId) -> Vec<MutationIntent> {
        self.inner.outbox.list_pending(owner)
    }

    pub fn failed(&self, owner: &OwnerId) -> Vec<MutationIntent> {
        self.inner.outbox.list_failed(owner)
    }

    // -- sync ----------------------------------------------------------------

    /// Report connectivity from the platform observer.
    pub async fn set_online(&self, online: bool) -> usize {
        self.inner.dispatcher.set_online(online).await
    }

    /// Drain every owner now, ignoring backoff.
    pub async fn sync_now(&self) -> usize {
        self.inner.dispatcher.drain_all(true).await
    }

    /// Fetch `scope` from the remote and merge it into the cache.
    pub async fn refresh(&self, owner: &OwnerId, scope: &Scope) -> SyncResult<()> {
        self.inner
            .dispatcher
            .refresh(owner, scope)
            .await
            .map_err(SyncError::from_fetch)
    }

    /// Re-queue a terminally failed intent at the tail of its lane.
    pub async fn retry_failed(&self, id: IntentId) -> SyncResult<bool> {
        let inner = &self.inner;
        let Some(intent) = inner.outbox.get(id) else {
            return Ok(false);
        };
        if !inner.outbox.retry_failed(id).await.map_err(SyncError::Store)? {
            return Ok(false);
        }
        let key = inner.canonical(&intent.owner, &intent.scope, &intent.op.target());
        inner.cache.write(&intent.owner, &intent.scope, |c| {
            c.patch(&intent.owner, &intent.scope, &key, |item| {
                if item.sync == SyncState::Failed {
                    item.sync = SyncState::Pending;
                }
            })
        });
        inner.bus.emit();
        inner.kick(&intent.owner);
        Ok(true)
    }

    /// Drop a terminally failed intent. Its item keeps the `Failed` flag
    /// until the next refresh.
    pub async fn dismiss(&self, id: IntentId) -> SyncResult<bool> {
        self.inner.outbox.dismiss(id).await.map_err(SyncError::Store)
    }

    /// Account switch: commit the owner's open undo windows, then forget
    /// its cache. The owner's lane is left alone; queued intents keep
    /// draining and later work queues behind them.
    pub async fn teardown_owner(&self, owner: &OwnerId) {
        let inner = &self.inner;
        for commit in inner.timers.flush_owner(owner) {
            commit.await;
        }
        let partitions = inner.cache.teardown_owner(owner);
        log::info!(
            "Tore down {}: {} partitions dropped, {} intents still queued",
            owner,
            partitions,
            inner.outbox.list_pending(owner).len()
        );
        inner.bus.emit();
    }

    /// Wait until every cache write so far is on disk.
    pub async fn flush(&self) -> SyncResult<()> {
        self.inner.cache.flush().await.map_err(SyncError::Store)
    }

    /// Commit every open undo window, stop the periodic drain and flush.
    pub async fn shutdown(&self) -> SyncResult<()> {
        let inner = &self.inner;
        if let Some(ticker) = &inner.ticker {
            ticker.abort();
        }
        for commit in inner.timers.flush_all() {
            commit.await;
        }
        self.flush().await
    }

    pub fn delete_flow(&self, owner: &OwnerId, scope: &Scope) -> DeleteFlow {
        DeleteFlow::new(self.clone(), owner.clone(), scope.clone())
    }

    pub fn update_flow(&self, owner: &OwnerId, scope: &Scope) -> UpdateFlow {
        UpdateFlow::new(self.clone(), owner.clone(), scope.clone())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::UndoSlotPolicy;
    use crate::core::models::ItemDraft;
    use crate::testing::{Call, FakeRemote, Op};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    pub(crate) fn test_config() -> Config {
        Config {
            data_dir: std::env::temp_dir(),
            undo_window_ms: 5_000,
            undo_slot: UndoSlotPolicy::Independent,
            retry_base_ms: 1_000,
            retry_max_ms: 8_000,
            tick_interval_ms: 0,
            auto_dispatch: true,
        }
    }

    pub(crate) fn owner() -> OwnerId {
        OwnerId::from("u1")
    }

    /// An engine over a fake remote holding `names` in the active scope,
    /// already refreshed into the cache.
    pub(crate) async fn engine_with(config: Config, names: &[&str]) -> (SyncEngine, Arc<FakeRemote>) {
        let remote = Arc::new(FakeRemote::new());
        for name in names {
            remote.seed("u1", &Scope::active(), name);
        }
        let engine = SyncEngine::with_store(config, remote.clone(), None).await.unwrap();
        engine.refresh(&owner(), &Scope::active()).await.unwrap();
        (engine, remote)
    }

    pub(crate) fn names(items: &[Item]) -> Vec<String> {
        items.iter().map(|i| i.name.clone()).collect()
    }

    /// Visible cache content equals a fresh server listing.
    pub(crate) fn assert_converged(engine: &SyncEngine, remote: &FakeRemote) {
        let mut local: Vec<(String, String)> = engine
            .read(&owner(), &Scope::active())
            .into_iter()
            .map(|i| (i.key.to_string(), i.name))
            .collect();
        let mut server: Vec<(String, String)> = remote
            .server_items("u1", &Scope::active())
            .into_iter()
            .filter(|i| i.status == ItemStatus::Active)
            .map(|i| (i.key.to_string(), i.name))
            .collect();
        local.sort();
        server.sort();
        assert_eq!(local, server);
    }

    #[tokio::test(start_paused = true)]
    async fn offline_create_gets_server_key_once_online() {
        let (engine, remote) = engine_with(test_config(), &[]).await;
        engine.set_online(false).await;

        let key = engine
            .create_item(&owner(), &Scope::active(), ItemDraft::named("Yoghurt"))
            .await
            .unwrap();
        assert!(key.is_optimistic());
        let shown = engine.read(&owner(), &Scope::active());
        assert_eq!(names(&shown), ["Yoghurt"]);
        assert_eq!(shown[0].sync, SyncState::Pending);
        assert_eq!(remote.count(Op::Create), 0);

        assert_eq!(engine.set_online(true).await, 1);
        let shown = engine.read(&owner(), &Scope::active());
        assert_eq!(shown.len(), 1);
        assert!(!shown[0].key.is_optimistic());
        assert_eq!(shown[0].name, "Yoghurt");
        assert_eq!(shown[0].sync, SyncState::Synced);
        assert_eq!(engine.get(&owner(), &Scope::active(), &key).unwrap().key, shown[0].key);
        assert_converged(&engine, &remote);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_after_drain_converges_without_duplicates() {
        let (engine, remote) = engine_with(test_config(), &["Milk", "Eggs"]).await;
        engine.set_online(false).await;
        engine
            .create_item(&owner(), &Scope::active(), ItemDraft::named("Bread"))
            .await
            .unwrap();
        let eggs = engine.read(&owner(), &Scope::active())[1].key.clone();
        engine.delete_item(&owner(), &Scope::active(), &eggs).await.unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;

        engine.set_online(true).await;
        engine.refresh(&owner(), &Scope::active()).await.unwrap();
        engine.refresh(&owner(), &Scope::active()).await.unwrap();

        let all = engine.read_all(&owner(), &Scope::active());
        let mut keys: Vec<_> = all.iter().map(|i| i.key.clone()).collect();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), all.len());
        assert_eq!(names(&engine.read(&owner(), &Scope::active())), ["Milk", "Bread"]);
        assert_converged(&engine, &remote);
        assert_eq!(engine.status().pending, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_failure_reaches_the_failure_channel() {
        let (engine, remote) = engine_with(test_config(), &["Milk"]).await;
        let mut failures = engine.failures().unwrap();
        assert!(engine.failures().is_none());

        let key = engine.read(&owner(), &Scope::active())[0].key.clone();
        remote.fail_next(
            Op::Delete,
            crate::core::error::RemoteError::Validation {
                reason: "locked".into(),
            },
        );
        engine.delete_item(&owner(), &Scope::active(), &key).await.unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;

        let failure = failures.recv().await.unwrap();
        assert_eq!(failure.key, key);
        assert_eq!(failure.op_kind, OpKind::Delete);
        assert_eq!(failure.error, SyncError::Validation("locked".into()));
        assert_eq!(engine.status().failed, 1);

        assert!(engine.retry_failed(failure.intent_id).await.unwrap());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(engine.status().failed, 0);
        assert!(remote.server_items("u1", &Scope::active()).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn flapping_connectivity_still_converges() {
        let (engine, remote) = engine_with(test_config(), &["Milk", "Eggs", "Bread"]).await;
        let shown = engine.read(&owner(), &Scope::active());
        remote.set_down(true);

        engine
            .create_item(&owner(), &Scope::active(), ItemDraft::named("Butter"))
            .await
            .unwrap();
        engine.delete_item(&owner(), &Scope::active(), &shown[0].key).await.unwrap();
        let rename = ItemPatch {
            name: Some("Free-range eggs".into()),
            ..Default::default()
        };
        engine
            .update_item(&owner(), &Scope::active(), &shown[1].key, rename)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;

        for _ in 0..3 {
            engine.set_online(false).await;
            engine.set_online(true).await;
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        assert!(remote.count(Op::Create) >= 4);
        assert_eq!(engine.status().pending, 3);
        assert_eq!(engine.status().failed, 0);

        remote.set_down(false);
        engine.set_online(false).await;
        assert_eq!(engine.set_online(true).await, 3);
        assert_eq!(engine.status().pending, 0);

        engine.refresh(&owner(), &Scope::active()).await.unwrap();
        assert_eq!(
            names(&engine.read(&owner(), &Scope::active())),
            ["Free-range eggs", "Bread", "Butter"]
        );
        assert_converged(&engine, &remote);
    }

    #[tokio::test(start_paused = true)]
    async fn subscribers_hear_optimistic_and_reconciled_changes() {
        let (engine, _remote) = engine_with(test_config(), &["Milk"]).await;
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let sub = engine.subscribe(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });

        let key = engine.read(&owner(), &Scope::active())[0].key.clone();
        engine.delete_item(&owner(), &Scope::active(), &key).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(hits.load(Ordering::SeqCst) >= 2);

        sub.unsubscribe();
        assert_eq!(engine.events().subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_commits_open_windows_and_forgets_the_cache() {
        let mut config = test_config();
        config.auto_dispatch = false;
        let (engine, _remote) = engine_with(config, &["Milk"]).await;
        let key = engine.read(&owner(), &Scope::active())[0].key.clone();
        engine.delete_item(&owner(), &Scope::active(), &key).await.unwrap();

        engine.teardown_owner(&owner()).await;
        assert_eq!(engine.status().undo_windows, 0);
        assert!(engine.read_all(&owner(), &Scope::active()).is_empty());
        let pending = engine.pending(&owner());
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].op.target(), key);
    }

    #[tokio::test(start_paused = true)]
    async fn work_after_reactivation_queues_behind_the_old_lane() {
        let (engine, remote) = engine_with(test_config(), &["Milk"]).await;
        engine.set_online(false).await;
        let milk = engine.read(&owner(), &Scope::active())[0].key.clone();
        let rename = ItemPatch {
            name: Some("Whole milk".into()),
            ..Default::default()
        };
        engine
            .update_item(&owner(), &Scope::active(), &milk, rename)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(engine.pending(&owner()).len(), 1);

        // Switch away and back while the rename is still queued.
        engine.teardown_owner(&owner()).await;
        engine.refresh(&owner(), &Scope::active()).await.unwrap();
        engine.delete_item(&owner(), &Scope::active(), &milk).await.unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;

        let pending = engine.pending(&owner());
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].op.kind(), OpKind::Update);
        assert_eq!(pending[1].op.kind(), OpKind::Delete);

        assert_eq!(engine.set_online(true).await, 2);
        let writes: Vec<Call> = remote
            .calls()
            .into_iter()
            .filter(|c| !matches!(c, Call::Fetch { .. }))
            .collect();
        let server = milk.as_server().unwrap().clone();
        assert_eq!(
            writes,
            [
                Call::Update { owner: owner(), key: server.clone() },
                Call::Delete { owner: owner(), key: server },
            ]
        );
        assert!(engine.pending(&owner()).is_empty());
        assert_converged(&engine, &remote);
    }

    // Real time: the store thread does I/O, which a paused clock would
    // skip past.
    #[tokio::test]
    async fn restart_restores_queue_and_reverts_open_windows() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config();
        config.data_dir = dir.path().to_path_buf();
        config.auto_dispatch = false;
        config.undo_window_ms = 60_000;
        config.undo_slot = UndoSlotPolicy::SingleSlot;

        let remote = Arc::new(FakeRemote::new());
        remote.seed("u1", &Scope::active(), "Milk");
        remote.seed("u1", &Scope::active(), "Eggs");
        let (milk, eggs) = {
            let engine = SyncEngine::open(config.clone(), remote.clone()).await.unwrap();
            engine.refresh(&owner(), &Scope::active()).await.unwrap();
            let shown = engine.read(&owner(), &Scope::active());
            let (milk, eggs) = (shown[0].key.clone(), shown[1].key.clone());

            engine.delete_item(&owner(), &Scope::active(), &milk).await.unwrap();
            // Takes the slot, committing the milk delete; its own window is
            // still open when the process goes away.
            engine.delete_item(&owner(), &Scope::active(), &eggs).await.unwrap();
            assert_eq!(engine.pending(&owner()).len(), 1);
            engine.flush().await.unwrap();
            (milk, eggs)
        };

        let engine = SyncEngine::open(config, remote.clone()).await.unwrap();
        let pending = engine.pending(&owner());
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].op.target(), milk);

        let shown = engine.read(&owner(), &Scope::active());
        assert_eq!(shown.len(), 1);
        assert_eq!(shown[0].key, eggs);
        assert_eq!(shown[0].sync, SyncState::Failed);

        assert_eq!(engine.sync_now().await, 1);
        assert_converged(&engine, &remote);
    }
}
