//! Per-screen write hooks. A flow is bound to one owner and scope and
//! remembers the latest mutation it issued, which is what an undo snackbar
//! acts on.

use std::sync::Mutex;

use crate::core::error::SyncResult;
use crate::core::models::{EntityKey, ItemPatch, ItemStatus, OwnerId, Resolution, Scope};

use super::{lock, PendingMutation, SyncEngine, UndoOutcome};

pub struct DeleteFlow {
    engine: SyncEngine,
    owner: OwnerId,
    scope: Scope,
    last: Mutex<Option<PendingMutation>>,
}

impl DeleteFlow {
    pub(super) fn new(engine: SyncEngine, owner: OwnerId, scope: Scope) -> Self {
        DeleteFlow {
            engine,
            owner,
            scope,
            last: Mutex::new(None),
        }
    }

    pub async fn delete_item(&self, key: &EntityKey) -> SyncResult<PendingMutation> {
        let pending = self.engine.delete_item(&self.owner, &self.scope, key).await?;
        *lock(&self.last) = Some(pending.clone());
        Ok(pending)
    }

    /// Undo the most recent delete issued through this flow.
    pub fn undo_delete(&self) -> UndoOutcome {
        match lock(&self.last).take() {
            Some(pending) => pending.undo(),
            None => UndoOutcome::AlreadyCommitted,
        }
    }

    pub fn can_undo(&self) -> bool {
        lock(&self.last).as_ref().is_some_and(PendingMutation::can_undo)
    }
}

pub struct UpdateFlow {
    engine: SyncEngine,
    owner: OwnerId,
    scope: Scope,
    last_resolve: Mutex<Option<PendingMutation>>,
}

impl UpdateFlow {
    pub(super) fn new(engine: SyncEngine, owner: OwnerId, scope: Scope) -> Self {
        UpdateFlow {
            engine,
            owner,
            scope,
            last_resolve: Mutex::new(None),
        }
    }

    /// Apply `patch`. Only resolves are tracked for `undo_resolve`; plain
    /// edits can still be undone through the returned handle.
    pub async fn update_item(
        &self,
        key: &EntityKey,
        patch: ItemPatch,
    ) -> SyncResult<PendingMutation> {
        let resolves = patch.status == Some(ItemStatus::Resolved);
        let pending = self
            .engine
            .update_item(&self.owner, &self.scope, key, patch)
            .await?;
        if resolves {
            *lock(&self.last_resolve) = Some(pending.clone());
        }
        Ok(pending)
    }

    pub async fn resolve_item(
        &self,
        key: &EntityKey,
        reason: Resolution,
    ) -> SyncResult<PendingMutation> {
        self.update_item(key, ItemPatch::resolve(reason)).await
    }

    pub fn undo_resolve(&self) -> UndoOutcome {
        match lock(&self.last_resolve).take() {
            Some(pending) => pending.undo(),
            None => UndoOutcome::AlreadyCommitted,
        }
    }

    pub fn can_undo_resolve(&self) -> bool {
        lock(&self.last_resolve)
            .as_ref()
            .is_some_and(PendingMutation::can_undo)
    }
}
