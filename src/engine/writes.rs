use std::sync::{Arc, Weak};

use crate::config::UndoSlotPolicy;
use crate::core::error::{SyncError, SyncResult};
use crate::core::models::{
    EntityKey, IntentId, IntentOp, Item, ItemDraft, ItemPatch, ItemStatus, MutationIntent,
    OwnerId, Scope, SyncState, TempKey,
};
use crate::core::undo::UndoSlot;

use super::{lock, Inner, SyncEngine, UndoAction, UndoToken};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndoOutcome {
    /// The optimistic change was rolled back; nothing reaches the remote.
    Undone,
    /// The window had already closed and the intent is queued.
    AlreadyCommitted,
}

/// Handle to a delete or update whose undo window may still be open.
#[derive(Clone)]
pub struct PendingMutation {
    intent_id: IntentId,
    engine: Weak<Inner>,
}

impl PendingMutation {
    /// Id the intent carries in the outbox once committed.
    pub fn intent_id(&self) -> IntentId {
        self.intent_id
    }

    pub fn can_undo(&self) -> bool {
        self.engine
            .upgrade()
            .is_some_and(|inner| inner.timers.is_armed(self.intent_id))
    }

    pub fn undo(&self) -> UndoOutcome {
        match self.engine.upgrade() {
            Some(inner) => inner.undo(self.intent_id),
            None => UndoOutcome::AlreadyCommitted,
        }
    }
}

impl SyncEngine {
    /// Add an item. Creates have no undo window: the placeholder is shown
    /// and the intent queued right away.
    pub async fn create_item(
        &self,
        owner: &OwnerId,
        scope: &Scope,
        mut draft: ItemDraft,
    ) -> SyncResult<EntityKey> {
        if draft.name.trim().is_empty() {
            return Err(SyncError::Validation("item name is required".into()));
        }
        draft.scope = scope.clone();
        let inner = &self.inner;

        let seq = inner.outbox.reserve_seq();
        let placeholder = TempKey(seq);
        let key = EntityKey::Optimistic(placeholder);
        let item = Item::from_draft(key.clone(), &draft, inner.clock.next());
        inner.cache.write(owner, scope, |c| c.append(owner, scope, item));
        inner.bus.emit();

        let intent = MutationIntent::new(
            owner.clone(),
            scope.clone(),
            seq,
            IntentOp::Create { placeholder, draft },
            inner.clock.next(),
        );
        inner.outbox.enqueue(intent).await.map_err(SyncError::Store)?;
        log::info!("Queued create of {} for {}", key, owner);
        inner.kick(owner);
        Ok(key)
    }

    /// Hide an item now and delete it remotely once the undo window lapses.
    pub async fn delete_item(
        &self,
        owner: &OwnerId,
        scope: &Scope,
        key: &EntityKey,
    ) -> SyncResult<PendingMutation> {
        let inner = &self.inner;
        let key = inner.canonical(owner, scope, key);
        let stamp = inner.clock.next();

        let snapshot = inner
            .cache
            .write(owner, scope, |c| {
                let before = c.get(owner, scope, &key).filter(|i| i.is_visible())?.clone();
                c.patch(owner, scope, &key, |item| {
                    item.status = ItemStatus::PendingDeletion;
                    item.mutated_at = stamp;
                    item.sync = SyncState::Pending;
                });
                Some(before)
            })
            .ok_or_else(|| SyncError::NotFound { key: key.clone() })?;
        inner.bus.emit();

        self.open_window(owner, scope, key, snapshot, UndoAction::Delete, stamp)
            .await
    }

    /// Apply `patch` now and send it once the undo window lapses. A resolve
    /// shows as pending until then.
    pub async fn update_item(
        &self,
        owner: &OwnerId,
        scope: &Scope,
        key: &EntityKey,
        patch: ItemPatch,
    ) -> SyncResult<PendingMutation> {
        if patch.is_empty() {
            return Err(SyncError::Validation("update changes nothing".into()));
        }
        if patch.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
            return Err(SyncError::Validation("item name is required".into()));
        }
        let inner = &self.inner;
        let key = inner.canonical(owner, scope, key);
        let stamp = inner.clock.next();
        let shown = patch.optimistic();

        let snapshot = inner
            .cache
            .write(owner, scope, |c| {
                let before = c.get(owner, scope, &key).filter(|i| i.is_visible())?.clone();
                c.patch(owner, scope, &key, |item| {
                    shown.apply(item);
                    item.mutated_at = stamp;
                    item.sync = SyncState::Pending;
                });
                Some(before)
            })
            .ok_or_else(|| SyncError::NotFound { key: key.clone() })?;
        inner.bus.emit();

        self.open_window(owner, scope, key, snapshot, UndoAction::Update(patch), stamp)
            .await
    }

    async fn open_window(
        &self,
        owner: &OwnerId,
        scope: &Scope,
        key: EntityKey,
        snapshot: Item,
        action: UndoAction,
        stamp: i64,
    ) -> SyncResult<PendingMutation> {
        let inner = &self.inner;
        let id = IntentId::new();
        let slot = UndoSlot {
            owner: owner.clone(),
            scope: scope.clone(),
            kind: action.kind(),
        };
        log::debug!("Opened {} window {} on {} for {}", slot.kind, id, key, owner);
        lock(&inner.tokens).insert(
            id,
            UndoToken {
                owner: owner.clone(),
                scope: scope.clone(),
                key,
                snapshot,
                action,
                stamp,
            },
        );
        let pending = PendingMutation {
            intent_id: id,
            engine: Arc::downgrade(inner),
        };

        let window = inner.config.undo_window();
        if window.is_zero() {
            inner.commit(id).await;
            return Ok(pending);
        }

        let weak = Arc::downgrade(inner);
        let exclusive = inner.config.undo_slot == UndoSlotPolicy::SingleSlot;
        let displaced = inner.timers.arm(id, window, slot, exclusive, async move {
            if let Some(inner) = weak.upgrade() {
                inner.commit(id).await;
            }
        });
        if let Some(commit) = displaced {
            commit.await;
        }
        Ok(pending)
    }
}

impl Inner {
    /// Close an undo window: queue its intent. A resolve stops showing as
    /// pending here.
    async fn commit(&self, id: IntentId) {
        let Some(token) = lock(&self.tokens).remove(&id) else {
            return;
        };
        let UndoToken {
            owner,
            scope,
            key,
            action,
            stamp,
            ..
        } = token;
        let key = self.canonical(&owner, &scope, &key);

        let op = match action {
            UndoAction::Delete => IntentOp::Delete { key: key.clone() },
            UndoAction::Update(patch) => {
                if patch.status == Some(ItemStatus::Resolved) {
                    self.cache.write(&owner, &scope, |c| {
                        c.patch(&owner, &scope, &key, |item| {
                            if item.status == ItemStatus::PendingResolution {
                                item.status = ItemStatus::Resolved;
                            }
                        })
                    });
                    self.bus.emit();
                }
                IntentOp::Update {
                    key: key.clone(),
                    patch,
                }
            }
        };
        let kind = op.kind();

        // Issued at the optimistic stamp, so a later local change makes the
        // server's answer moot.
        let mut intent = MutationIntent::new(owner.clone(), scope, 0, op, stamp);
        intent.id = id;
        match self.outbox.enqueue(intent).await {
            Ok(_) => log::info!("Committed {} of {} for {}", kind, key, owner),
            Err(e) => log::error!("Failed to persist {} of {} for {}: {}", kind, key, owner, e),
        }
        self.kick(&owner);
    }

    /// Roll back an open window. Synchronous: either the timer is cancelled
    /// here or it already fired.
    ///
    /// Newer changes to the same item, open or queued, keep the fields they
    /// wrote. Only the rest go back to the snapshot, and the snapshots of
    /// newer open windows are rebased so their own undo does not bring
    /// this change back.
    fn undo(&self, id: IntentId) -> UndoOutcome {
        if !self.timers.cancel(id) {
            return UndoOutcome::AlreadyCommitted;
        }
        let mut tokens = lock(&self.tokens);
        let Some(token) = tokens.remove(&id) else {
            return UndoOutcome::AlreadyCommitted;
        };
        let UndoToken {
            owner,
            scope,
            key,
            snapshot,
            action,
            stamp,
        } = token;
        let key = self.canonical(&owner, &scope, &key);
        let touched = action.touched();
        let queued = self.outbox.has_pending_for(&owner, &key);

        let mut newer: Vec<(i64, Option<IntentId>, ItemPatch)> = self
            .outbox
            .list_pending(&owner)
            .into_iter()
            .filter(|i| i.issued_at > stamp)
            .filter(|i| self.canonical(&owner, &i.scope, &i.op.target()) == key)
            .filter_map(|i| i.op.touched().map(|t| (i.issued_at, None, t)))
            .collect();
        let mut window_open = false;
        for (other, t) in tokens.iter() {
            if t.owner != owner || self.canonical(&t.owner, &t.scope, &t.key) != key {
                continue;
            }
            window_open = true;
            if t.stamp > stamp {
                newer.push((t.stamp, Some(*other), t.action.touched()));
            }
        }
        newer.sort_by_key(|(at, ..)| *at);

        let mut covered = ItemPatch::default();
        for (_, other, theirs) in &newer {
            if let Some(t) = other.and_then(|o| tokens.get_mut(&o)) {
                touched.without(&covered).revert(&mut t.snapshot, &snapshot);
            }
            covered.cover(theirs);
        }
        let rebased = touched.without(&covered);

        let restored = self.cache.write(&owner, &scope, |c| {
            let current = c.get(&owner, &scope, &key)?;
            let whole = newer.is_empty() && current.mutated_at == stamp;
            c.patch(&owner, &scope, &key, |item| {
                if whole {
                    *item = snapshot.clone();
                } else {
                    rebased.revert(item, &snapshot);
                }
                item.sync = match item.sync {
                    _ if queued || window_open => SyncState::Pending,
                    SyncState::Failed => SyncState::Failed,
                    SyncState::Pending | SyncState::Synced => SyncState::Synced,
                };
            })
        });
        drop(tokens);

        match restored {
            Some(_) if newer.is_empty() => log::info!("Undid change {} to {} for {}", id, key, owner),
            Some(_) => log::info!(
                "Undid change {} to {} for {}; {} newer changes kept",
                id,
                key,
                owner,
                newer.len()
            ),
            None => log::debug!("Undo {}: {} no longer cached", id, key),
        }
        self.bus.emit();
        UndoOutcome::Undone
    }
}
