use indexmap::IndexMap;

use crate::core::cache::LocalCache;
use crate::core::models::{EntityKey, Item, OwnerId, Scope, ServerKey, SyncState, TempKey};

fn settle(item: &mut Item, more_pending: bool) {
    item.sync = if more_pending {
        SyncState::Pending
    } else {
        SyncState::Synced
    };
}

/// Fold the server's answer to a create into the cache.
///
/// The placeholder is swapped in place for the authoritative entity. If the
/// placeholder was touched after the create was issued, its local state is
/// kept under the new key; the follow-up intents carry those edits. Returns
/// the server key, or `None` if the server answered without one.
pub fn reconcile_create(
    cache: &mut LocalCache,
    owner: &OwnerId,
    scope: &Scope,
    placeholder: TempKey,
    server: Item,
    issued_at: i64,
    more_pending: bool,
) -> Option<ServerKey> {
    let Some(server_key) = server.key.as_server().cloned() else {
        log::error!(
            "Create of {} for {} answered without a server key",
            EntityKey::Optimistic(placeholder),
            owner
        );
        return None;
    };
    let temp = EntityKey::Optimistic(placeholder);

    match cache.get(owner, scope, &temp).cloned() {
        Some(local) => {
            let mut merged = if local.mutated_at > issued_at {
                let mut kept = local.clone();
                kept.key = server.key.clone();
                kept
            } else {
                Item::merged_over(&server, &local)
            };
            settle(&mut merged, more_pending || local.mutated_at > issued_at);
            cache.replace_key(owner, scope, &temp, merged);
        }
        None if cache.contains(owner, scope, &server.key) => {
            log::debug!("Placeholder {} already superseded by {}", temp, server.key);
        }
        None => {
            log::debug!("Placeholder {} not cached; adding {}", temp, server.key);
            let mut item = server;
            settle(&mut item, more_pending);
            cache.append(owner, scope, item);
        }
    }

    cache.alias(owner, scope, placeholder, server_key.clone());
    cache.dedupe(owner, scope);
    Some(server_key)
}

/// Apply the server's copy after an update. Moot (returns false) when the
/// item is gone or was mutated again after the intent was issued. An item
/// the server now files under another scope moves to that partition.
pub fn reconcile_update(
    cache: &mut LocalCache,
    owner: &OwnerId,
    scope: &Scope,
    key: &EntityKey,
    server: Item,
    issued_at: i64,
    more_pending: bool,
) -> bool {
    let Some(local) = cache.get(owner, scope, key) else {
        log::debug!("Update of {} is moot: no longer cached", key);
        return false;
    };
    if local.mutated_at > issued_at {
        log::debug!("Update of {} is moot: touched locally since", key);
        return false;
    }

    if server.scope != *scope {
        let Some(local) = cache.remove(owner, scope, key) else {
            return false;
        };
        let mut moved = Item::merged_over(&server, &local);
        moved.key = key.clone();
        settle(&mut moved, more_pending);
        log::debug!("{} moved from {} to {} for {}", key, scope, server.scope, owner);
        cache.append(owner, &server.scope, moved);
        cache.dedupe(owner, scope);
        cache.dedupe(owner, &server.scope);
        return true;
    }

    cache.patch(owner, scope, key, |item| {
        *item = Item::merged_over(&server, item);
        settle(item, more_pending);
    });
    cache.dedupe(owner, scope);
    true
}

/// Remove a deleted entity. Idempotent.
pub fn reconcile_delete(cache: &mut LocalCache, owner: &OwnerId, scope: &Scope, key: &EntityKey) {
    if cache.remove(owner, scope, key).is_none() {
        log::debug!("Delete of {} already reconciled", key);
    }
    cache.dedupe(owner, scope);
}

/// Merge a fresh server listing into a partition.
///
/// Server order wins. Entries still waiting on an intent or an open undo
/// window (`Pending`) keep their local version; everything else, including
/// `Failed` entries, takes the server's. Pending entries the server does
/// not list yet (placeholders) go at the end. Returns the number of
/// superseded placeholders dropped.
pub fn merge_fetched(cache: &mut LocalCache, owner: &OwnerId, scope: &Scope, fetched: Vec<Item>) -> usize {
    let mut pending: IndexMap<EntityKey, Item> = cache
        .read_all(owner, scope)
        .into_iter()
        .filter(|i| i.sync == SyncState::Pending)
        .map(|i| (i.key.clone(), i))
        .collect();

    let mut next = Vec::with_capacity(fetched.len() + pending.len());
    for mut item in fetched {
        if item.key.is_optimistic() {
            log::warn!("Server listed optimistic key {} for {}; skipped", item.key, owner);
            continue;
        }
        match pending.shift_remove(&item.key) {
            Some(local) => next.push(local),
            None => {
                item.scope = scope.clone();
                item.sync = SyncState::Synced;
                next.push(item);
            }
        }
    }
    next.extend(pending.into_values());

    cache.replace_all(owner, scope, next);
    cache.dedupe(owner, scope)
}
