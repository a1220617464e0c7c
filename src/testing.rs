//! In-memory remote used by the unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;

use crate::core::error::RemoteError;
use crate::core::models::{
    now_millis, EntityKey, Item, ItemDraft, ItemPatch, ItemStatus, OwnerId, Scope, ServerKey,
    SyncState,
};
use crate::core::remote::{DeleteOutcome, Remote};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Fetch,
    Create,
    Update,
    Delete,
}

/// One call the fake received, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Fetch { owner: OwnerId, scope: Scope },
    Create { owner: OwnerId, name: String },
    Update { owner: OwnerId, key: ServerKey },
    Delete { owner: OwnerId, key: ServerKey },
}

#[derive(Default)]
struct FakeState {
    items: HashMap<OwnerId, IndexMap<ServerKey, Item>>,
    next_id: u64,
    calls: Vec<Call>,
    failures: VecDeque<(Op, RemoteError)>,
    down: bool,
    latency: Duration,
}

/// A remote that keeps its data in memory, records every call and can be
/// told to fail.
#[derive(Default)]
pub struct FakeRemote {
    state: Mutex<FakeState>,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put `name` on the server and return its key.
    pub fn seed(&self, owner: &str, scope: &Scope, name: &str) -> EntityKey {
        let mut state = self.state.lock().unwrap();
        let mut draft = ItemDraft::named(name);
        draft.scope = scope.clone();
        let item = state.mint(&draft);
        let key = item.key.clone();
        state.insert(&OwnerId::from(owner), item);
        key
    }

    /// Fail the next call of kind `op` with `err`.
    pub fn fail_next(&self, op: Op, err: RemoteError) {
        self.state.lock().unwrap().failures.push_back((op, err));
    }

    /// While down, every call times out.
    pub fn set_down(&self, down: bool) {
        self.state.lock().unwrap().down = down;
    }

    /// Every call first waits `latency` (tokio time).
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().unwrap().latency = latency;
    }

    async fn lag(&self) {
        let latency = self.state.lock().unwrap().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count(&self, op: Op) -> usize {
        self.calls()
            .iter()
            .filter(|c| {
                matches!(
                    (c, op),
                    (Call::Fetch { .. }, Op::Fetch)
                        | (Call::Create { .. }, Op::Create)
                        | (Call::Update { .. }, Op::Update)
                        | (Call::Delete { .. }, Op::Delete)
                )
            })
            .count()
    }

    pub fn server_items(&self, owner: &str, scope: &Scope) -> Vec<Item> {
        let state = self.state.lock().unwrap();
        state
            .items
            .get(&OwnerId::from(owner))
            .map(|m| m.values().filter(|i| &i.scope == scope).cloned().collect())
            .unwrap_or_default()
    }

    fn begin(&self, call: Call, op: Op) -> Result<std::sync::MutexGuard<'_, FakeState>, RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call);
        if state.down {
            return Err(RemoteError::Timeout);
        }
        if let Some(pos) = state.failures.iter().position(|(o, _)| *o == op) {
            if let Some((_, err)) = state.failures.remove(pos) {
                return Err(err);
            }
        }
        Ok(state)
    }
}

impl FakeState {
    fn mint(&mut self, draft: &ItemDraft) -> Item {
        self.next_id += 1;
        let key = EntityKey::Authoritative(ServerKey(format!("srv-{}", self.next_id)));
        let mut item = Item::from_draft(key, draft, now_millis());
        item.sync = SyncState::Synced;
        item
    }

    fn insert(&mut self, owner: &OwnerId, item: Item) {
        if let EntityKey::Authoritative(key) = &item.key {
            self.items.entry(owner.clone()).or_default().insert(key.clone(), item);
        }
    }
}

#[async_trait]
impl Remote for FakeRemote {
    async fn fetch_by_scope(&self, owner: &OwnerId, scope: &Scope) -> Result<Vec<Item>, RemoteError> {
        self.lag().await;
        let state = self.begin(
            Call::Fetch {
                owner: owner.clone(),
                scope: scope.clone(),
            },
            Op::Fetch,
        )?;
        Ok(state
            .items
            .get(owner)
            .map(|m| {
                m.values()
                    .filter(|i| &i.scope == scope && i.status == ItemStatus::Active)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn create_entity(&self, owner: &OwnerId, draft: &ItemDraft) -> Result<Item, RemoteError> {
        self.lag().await;
        let mut state = self.begin(
            Call::Create {
                owner: owner.clone(),
                name: draft.name.clone(),
            },
            Op::Create,
        )?;
        if draft.name.trim().is_empty() {
            return Err(RemoteError::Validation {
                reason: "name is required".into(),
            });
        }
        let item = state.mint(draft);
        state.insert(owner, item.clone());
        Ok(item)
    }

    async fn update_entity(
        &self,
        owner: &OwnerId,
        key: &ServerKey,
        patch: &ItemPatch,
    ) -> Result<Item, RemoteError> {
        self.lag().await;
        let mut state = self.begin(
            Call::Update {
                owner: owner.clone(),
                key: key.clone(),
            },
            Op::Update,
        )?;
        let item = state
            .items
            .get_mut(owner)
            .and_then(|m| m.get_mut(key))
            .ok_or(RemoteError::NotFound)?;
        patch.apply(item);
        item.mutated_at = now_millis();
        Ok(item.clone())
    }

    async fn delete_entity(&self, owner: &OwnerId, key: &ServerKey) -> Result<DeleteOutcome, RemoteError> {
        self.lag().await;
        let mut state = self.begin(
            Call::Delete {
                owner: owner.clone(),
                key: key.clone(),
            },
            Op::Delete,
        )?;
        let removed = state.items.get_mut(owner).and_then(|m| m.shift_remove(key));
        Ok(match removed {
            Some(_) => DeleteOutcome::Deleted,
            None => DeleteOutcome::NotFound,
        })
    }
}
