use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use indexmap::IndexMap;

use crate::core::models::{EntityKey, Item, OwnerId, Scope, ServerKey, TempKey};
use crate::core::store::StoreHandle;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PartitionKey {
    owner: OwnerId,
    scope: Scope,
}

impl PartitionKey {
    fn new(owner: &OwnerId, scope: &Scope) -> Self {
        PartitionKey {
            owner: owner.clone(),
            scope: scope.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct Partition {
    entries: IndexMap<EntityKey, Item>,
    revision: u64,
    /// Placeholders whose create has been reconciled, and what replaced them.
    aliases: HashMap<TempKey, ServerKey>,
}

impl Partition {
    fn bump(&mut self) {
        self.revision += 1;
    }
}

/// In-memory item snapshots, partitioned by owner and scope.
///
/// Every operation is synchronous. Mutations are idempotent: repeating a
/// call with the same arguments leaves the partition as the first call did,
/// and the revision only moves when the content actually changes.
#[derive(Debug, Default)]
pub struct LocalCache {
    partitions: HashMap<PartitionKey, Partition>,
}

impl LocalCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn partition(&self, owner: &OwnerId, scope: &Scope) -> Option<&Partition> {
        self.partitions.get(&PartitionKey::new(owner, scope))
    }

    fn partition_mut(&mut self, owner: &OwnerId, scope: &Scope) -> &mut Partition {
        self.partitions
            .entry(PartitionKey::new(owner, scope))
            .or_default()
    }

    /// Items a screen may render; hidden statuses are filtered out.
    pub fn read(&self, owner: &OwnerId, scope: &Scope) -> Vec<Item> {
        self.partition(owner, scope)
            .map(|p| p.entries.values().filter(|i| i.is_visible()).cloned().collect())
            .unwrap_or_default()
    }

    /// Every entry, hidden ones included.
    pub fn read_all(&self, owner: &OwnerId, scope: &Scope) -> Vec<Item> {
        self.partition(owner, scope)
            .map(|p| p.entries.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Entries in display order, as written to the durable store.
    pub fn snapshot(&self, owner: &OwnerId, scope: &Scope) -> Vec<Item> {
        self.read_all(owner, scope)
    }

    /// Load persisted partitions, replacing whatever is cached for them.
    pub fn restore(&mut self, partitions: Vec<(OwnerId, Scope, Vec<Item>)>) {
        for (owner, scope, items) in partitions {
            self.replace_all(&owner, &scope, items);
        }
    }

    pub fn get(&self, owner: &OwnerId, scope: &Scope, key: &EntityKey) -> Option<&Item> {
        self.partition(owner, scope).and_then(|p| p.entries.get(key))
    }

    pub fn contains(&self, owner: &OwnerId, scope: &Scope, key: &EntityKey) -> bool {
        self.get(owner, scope, key).is_some()
    }

    pub fn revision(&self, owner: &OwnerId, scope: &Scope) -> u64 {
        self.partition(owner, scope).map(|p| p.revision).unwrap_or(0)
    }

    pub fn len(&self, owner: &OwnerId, scope: &Scope) -> usize {
        self.partition(owner, scope).map(|p| p.entries.len()).unwrap_or(0)
    }

    pub fn scopes_of(&self, owner: &OwnerId) -> Vec<Scope> {
        let mut scopes: Vec<Scope> = self
            .partitions
            .keys()
            .filter(|k| &k.owner == owner)
            .map(|k| k.scope.clone())
            .collect();
        scopes.sort();
        scopes
    }

    pub fn owners(&self) -> Vec<OwnerId> {
        let mut owners: Vec<OwnerId> = self.partitions.keys().map(|k| k.owner.clone()).collect();
        owners.sort();
        owners.dedup();
        owners
    }

    /// Replace a partition wholesale. Entries sharing a key are collapsed to
    /// the most recently touched one.
    pub fn replace_all(&mut self, owner: &OwnerId, scope: &Scope, items: Vec<Item>) {
        let mut entries: IndexMap<EntityKey, Item> = IndexMap::with_capacity(items.len());
        for item in items {
            match entries.get_mut(&item.key) {
                Some(existing) => {
                    log::warn!(
                        "Duplicate key {} in {}/{}; keeping most recent",
                        item.key,
                        owner,
                        scope
                    );
                    if item.mutated_at > existing.mutated_at {
                        *existing = item;
                    }
                }
                None => {
                    entries.insert(item.key.clone(), item);
                }
            }
        }

        let part = self.partition_mut(owner, scope);
        if !part.entries.iter().eq(entries.iter()) {
            part.entries = entries;
            part.bump();
        }
    }

    /// Apply `mutator` to one entry. Returns the updated item, or `None` if
    /// the key is not cached.
    pub fn patch(
        &mut self,
        owner: &OwnerId,
        scope: &Scope,
        key: &EntityKey,
        mutator: impl FnOnce(&mut Item),
    ) -> Option<Item> {
        let part = self.partitions.get_mut(&PartitionKey::new(owner, scope))?;
        let current = part.entries.get_mut(key)?;
        let mut next = current.clone();
        mutator(&mut next);
        // The key is the map index; a mutator may not move the item.
        next.key = key.clone();
        if *current != next {
            *current = next.clone();
            part.bump();
        }
        Some(next)
    }

    /// Insert `item`, overwriting any entry with the same key in place.
    pub fn append(&mut self, owner: &OwnerId, scope: &Scope, item: Item) {
        let part = self.partition_mut(owner, scope);
        if part.entries.get(&item.key) == Some(&item) {
            return;
        }
        part.entries.insert(item.key.clone(), item);
        part.bump();
    }

    pub fn remove(&mut self, owner: &OwnerId, scope: &Scope, key: &EntityKey) -> Option<Item> {
        let part = self.partitions.get_mut(&PartitionKey::new(owner, scope))?;
        let removed = part.entries.shift_remove(key)?;
        part.bump();
        Some(removed)
    }

    /// Swap the entry at `old` for `item`, keeping its position. If `item`'s
    /// key is already present elsewhere that entry is overwritten instead and
    /// `old` is dropped. Returns false when `old` is not cached.
    pub fn replace_key(
        &mut self,
        owner: &OwnerId,
        scope: &Scope,
        old: &EntityKey,
        item: Item,
    ) -> bool {
        let Some(part) = self.partitions.get_mut(&PartitionKey::new(owner, scope)) else {
            return false;
        };
        let Some(index) = part.entries.get_index_of(old) else {
            return false;
        };
        part.entries.shift_remove_index(index);
        if let Some(existing) = part.entries.get_mut(&item.key) {
            *existing = item;
        } else {
            let index = index.min(part.entries.len());
            let _ = part.entries.shift_insert(index, item.key.clone(), item);
        }
        part.bump();
        true
    }

    /// Record that placeholder `temp` became `server`.
    pub fn alias(&mut self, owner: &OwnerId, scope: &Scope, temp: TempKey, server: ServerKey) {
        self.partition_mut(owner, scope).aliases.insert(temp, server);
    }

    pub fn alias_of(&self, owner: &OwnerId, scope: &Scope, temp: TempKey) -> Option<&ServerKey> {
        self.partition(owner, scope).and_then(|p| p.aliases.get(&temp))
    }

    /// Drop placeholders that coexist with the authoritative entry they were
    /// replaced by. Returns the number of entries removed.
    pub fn dedupe(&mut self, owner: &OwnerId, scope: &Scope) -> usize {
        let Some(part) = self.partitions.get_mut(&PartitionKey::new(owner, scope)) else {
            return 0;
        };

        let stale: Vec<EntityKey> = part
            .entries
            .keys()
            .filter_map(|key| {
                let temp = key.as_temp()?;
                let server = part.aliases.get(&temp)?;
                let authoritative = EntityKey::Authoritative(server.clone());
                part.entries
                    .contains_key(&authoritative)
                    .then(|| key.clone())
            })
            .collect();

        for key in &stale {
            log::warn!("Dropping superseded placeholder {} in {}/{}", key, owner, scope);
            part.entries.shift_remove(key);
        }
        if !stale.is_empty() {
            part.bump();
        }
        stale.len()
    }

    /// Forget every partition of `owner` (account switch).
    pub fn teardown_owner(&mut self, owner: &OwnerId) -> usize {
        let before = self.partitions.len();
        self.partitions.retain(|k, _| &k.owner != owner);
        before - self.partitions.len()
    }

    /// Look an item up across all scopes of an owner.
    pub fn find(&self, owner: &OwnerId, key: &EntityKey) -> Option<(Scope, &Item)> {
        self.partitions
            .iter()
            .filter(|(k, _)| &k.owner == owner)
            .find_map(|(k, p)| p.entries.get(key).map(|item| (k.scope.clone(), item)))
    }
}

/// The cache shared between the write path and the dispatcher, with
/// write-through to the durable store.
///
/// Partition writes are queued to the store while the lock is held, so the
/// database sees them in the same order as memory does. Nobody waits on
/// them; failures are logged by the store thread.
pub struct SharedCache {
    cache: Mutex<LocalCache>,
    store: Option<StoreHandle>,
}

impl SharedCache {
    pub fn new(cache: LocalCache, store: Option<StoreHandle>) -> Self {
        SharedCache {
            cache: Mutex::new(cache),
            store,
        }
    }

    fn lock(&self) -> MutexGuard<'_, LocalCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn read<R>(&self, f: impl FnOnce(&LocalCache) -> R) -> R {
        f(&self.lock())
    }

    /// Run `f` against the cache and persist every partition of `owner`
    /// whose revision moved. `scope` is the partition `f` works on; an item
    /// it moves elsewhere takes its new partition along.
    pub fn write<R>(&self, owner: &OwnerId, scope: &Scope, f: impl FnOnce(&mut LocalCache) -> R) -> R {
        let mut cache = self.lock();
        let before: HashMap<Scope, u64> = cache
            .scopes_of(owner)
            .into_iter()
            .chain(std::iter::once(scope.clone()))
            .map(|s| {
                let rev = cache.revision(owner, &s);
                (s, rev)
            })
            .collect();
        let out = f(&mut cache);
        if let Some(store) = &self.store {
            for moved in cache.scopes_of(owner) {
                if before.get(&moved).copied().unwrap_or(0) != cache.revision(owner, &moved) {
                    let _ = store.submit_partition(owner.clone(), moved.clone(), cache.snapshot(owner, &moved));
                }
            }
        }
        out
    }

    /// Wait until every queued partition write has reached the store.
    pub async fn flush(&self) -> Result<(), String> {
        match &self.store {
            Some(store) => store.flush().await,
            None => Ok(()),
        }
    }

    /// Forget `owner` in memory and on disk.
    pub fn teardown_owner(&self, owner: &OwnerId) -> usize {
        let mut cache = self.lock();
        let dropped = cache.teardown_owner(owner);
        if let Some(store) = &self.store {
            let _ = store.submit_drop_owner(owner.clone());
        }
        dropped
    }
}
