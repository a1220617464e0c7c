use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use crate::core::models::{
    EntityKey, ErrorClass, IntentId, IntentOp, IntentState, MutationIntent, OwnerId, ServerKey,
    TempKey,
};
use crate::core::store::{StoreHandle, StoreTicket};

#[derive(Debug, Default)]
struct Lane {
    /// Intents by creation order.
    intents: BTreeMap<u64, MutationIntent>,
    /// Earliest instant the head may be retried after a transient failure.
    retry_after: Option<Instant>,
}

#[derive(Debug, Default)]
struct OutboxState {
    lanes: HashMap<OwnerId, Lane>,
    index: HashMap<IntentId, (OwnerId, u64)>,
    next_seq: u64,
}

impl OutboxState {
    fn get_mut(&mut self, id: IntentId) -> Option<&mut MutationIntent> {
        let (owner, seq) = self.index.get(&id)?;
        self.lanes.get_mut(owner)?.intents.get_mut(seq)
    }

    fn take(&mut self, id: IntentId) -> Option<MutationIntent> {
        let (owner, seq) = self.index.remove(&id)?;
        let lane = self.lanes.get_mut(&owner)?;
        let intent = lane.intents.remove(&seq);
        if lane.intents.is_empty() {
            self.lanes.remove(&owner);
        }
        intent
    }

    fn insert(&mut self, intent: MutationIntent) {
        self.next_seq = self.next_seq.max(intent.seq + 1);
        self.index.insert(intent.id, (intent.owner.clone(), intent.seq));
        self.lanes
            .entry(intent.owner.clone())
            .or_default()
            .intents
            .insert(intent.seq, intent);
    }
}

/// Durable, per-owner FIFO of mutation intents.
///
/// Every change is queued to the store while the in-memory lock is held, so
/// the database sees writes in the same order as memory does. Applied intents
/// are deleted; terminally failed ones stay until retried or dismissed.
pub struct Outbox {
    state: Mutex<OutboxState>,
    store: Option<StoreHandle>,
}

fn lock(state: &Mutex<OutboxState>) -> MutexGuard<'_, OutboxState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn settle(ticket: Option<StoreTicket>) -> Result<(), String> {
    match ticket {
        Some(ticket) => ticket.wait().await,
        None => Ok(()),
    }
}

impl Outbox {
    pub fn new(store: Option<StoreHandle>) -> Self {
        Outbox {
            state: Mutex::new(OutboxState {
                next_seq: 1,
                ..Default::default()
            }),
            store,
        }
    }

    /// Rebuild from the store. Intents caught mid-dispatch by a crash go back
    /// to `Queued`; the remote may have seen them, which the dispatcher
    /// tolerates (not-found deletes are successes).
    pub async fn restore(store: StoreHandle) -> Result<Self, String> {
        let intents = store.load_intents().await?;
        let outbox = Outbox::new(Some(store));
        let mut recovered = Vec::new();
        {
            let mut state = lock(&outbox.state);
            for mut intent in intents {
                if intent.state == IntentState::Dispatching {
                    intent.state = IntentState::Queued;
                    recovered.push(intent.clone());
                }
                state.insert(intent);
            }
            log::info!(
                "Outbox restored: {} intents across {} owners",
                state.index.len(),
                state.lanes.len()
            );
        }
        for intent in recovered {
            log::warn!("Intent {} was mid-dispatch at shutdown; re-queued", intent.id);
            outbox.write(&intent).wait().await?;
        }
        Ok(outbox)
    }

    fn write(&self, intent: &MutationIntent) -> StoreTicket {
        match &self.store {
            Some(store) => store.submit_intent(intent.clone()),
            None => StoreTicket::done(),
        }
    }

    /// Reserve the next creation order number. Used by creates, whose
    /// placeholder key must be known before the intent exists.
    pub fn reserve_seq(&self) -> u64 {
        let mut state = lock(&self.state);
        let seq = state.next_seq;
        state.next_seq += 1;
        seq
    }

    /// Append `intent` to its owner's lane. A zero or already taken `seq` is
    /// replaced with the next free one.
    pub async fn enqueue(&self, mut intent: MutationIntent) -> Result<IntentId, String> {
        let ticket = {
            let mut state = lock(&self.state);
            let taken = state
                .lanes
                .get(&intent.owner)
                .is_some_and(|l| l.intents.contains_key(&intent.seq));
            if intent.seq == 0 || taken {
                intent.seq = state.next_seq;
            }
            intent.state = IntentState::Queued;
            let ticket = self.write(&intent);
            log::debug!(
                "Enqueued {} intent {} for {} (seq {})",
                intent.op.kind(),
                intent.id,
                intent.owner,
                intent.seq
            );
            state.insert(intent.clone());
            ticket
        };
        ticket.wait().await?;
        Ok(intent.id)
    }

    /// Head of the owner's lane if it may be dispatched now. Nothing is
    /// returned while an earlier intent is still in flight, or while the
    /// lane is backing off (unless `force`).
    pub fn peek_next(&self, owner: &OwnerId, force: bool) -> Option<MutationIntent> {
        let state = lock(&self.state);
        let lane = state.lanes.get(owner)?;
        if !force {
            if let Some(at) = lane.retry_after {
                if Instant::now() < at {
                    return None;
                }
            }
        }
        for intent in lane.intents.values() {
            match intent.state {
                IntentState::Queued => return Some(intent.clone()),
                IntentState::Dispatching => return None,
                // Terminal failures never block the lane.
                IntentState::Failed(ErrorClass::Terminal) | IntentState::Applied => continue,
                IntentState::Failed(ErrorClass::Transient) => return Some(intent.clone()),
            }
        }
        None
    }

    pub async fn mark_dispatching(&self, id: IntentId) -> Result<(), String> {
        self.transition(id, |intent| {
            intent.state = IntentState::Dispatching;
            intent.attempts += 1;
        })
        .await
    }

    /// Remove an applied intent.
    pub async fn mark_applied(&self, id: IntentId) -> Result<(), String> {
        let ticket = {
            let mut state = lock(&self.state);
            let Some(intent) = state.take(id) else {
                return Ok(());
            };
            if let Some(lane) = state.lanes.get_mut(&intent.owner) {
                lane.retry_after = None;
            }
            log::debug!("Intent {} applied", id);
            self.store.as_ref().map(|s| s.submit_intent_delete(id))
        };
        settle(ticket).await
    }

    /// Record a failure. A transient failure leaves the intent retryable at
    /// the head of its lane, held for `backoff`; a terminal one parks it.
    pub async fn mark_failed(
        &self,
        id: IntentId,
        class: ErrorClass,
        reason: String,
        backoff: Duration,
    ) -> Result<(), String> {
        let ticket = {
            let mut state = lock(&self.state);
            let Some(intent) = state.get_mut(id) else {
                return Ok(());
            };
            intent.last_error = Some(reason);
            intent.state = IntentState::Failed(class);
            let snapshot = intent.clone();
            if class == ErrorClass::Transient {
                if let Some(lane) = state.lanes.get_mut(&snapshot.owner) {
                    lane.retry_after = Some(Instant::now() + backoff);
                }
            }
            self.write(&snapshot)
        };
        ticket.wait().await
    }

    async fn transition(
        &self,
        id: IntentId,
        apply: impl FnOnce(&mut MutationIntent),
    ) -> Result<(), String> {
        let ticket = {
            let mut state = lock(&self.state);
            let Some(intent) = state.get_mut(id) else {
                return Err(format!("Unknown intent {id}"));
            };
            apply(intent);
            let snapshot = intent.clone();
            self.write(&snapshot)
        };
        ticket.wait().await
    }

    /// Queued and in-flight intents of `owner`, in creation order.
    pub fn list_pending(&self, owner: &OwnerId) -> Vec<MutationIntent> {
        self.list_where(owner, |s| !s.is_terminal())
    }

    pub fn list_failed(&self, owner: &OwnerId) -> Vec<MutationIntent> {
        self.list_where(owner, |s| s == IntentState::Failed(ErrorClass::Terminal))
    }

    fn list_where(
        &self,
        owner: &OwnerId,
        keep: impl Fn(IntentState) -> bool,
    ) -> Vec<MutationIntent> {
        let state = lock(&self.state);
        state
            .lanes
            .get(owner)
            .map(|lane| {
                lane.intents
                    .values()
                    .filter(|i| keep(i.state))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn get(&self, id: IntentId) -> Option<MutationIntent> {
        lock(&self.state).get_mut(id).cloned()
    }

    pub fn owners_with_pending(&self) -> Vec<OwnerId> {
        let state = lock(&self.state);
        let mut owners: Vec<OwnerId> = state
            .lanes
            .iter()
            .filter(|(_, lane)| lane.intents.values().any(|i| !i.state.is_terminal()))
            .map(|(owner, _)| owner.clone())
            .collect();
        owners.sort();
        owners
    }

    /// Every owner with a lane, failed-only lanes included.
    pub fn owners(&self) -> Vec<OwnerId> {
        let mut owners: Vec<OwnerId> = lock(&self.state).lanes.keys().cloned().collect();
        owners.sort();
        owners
    }

    pub fn pending_count(&self) -> usize {
        let state = lock(&self.state);
        state
            .lanes
            .values()
            .flat_map(|lane| lane.intents.values())
            .filter(|i| !i.state.is_terminal())
            .count()
    }

    pub fn failed_count(&self) -> usize {
        let state = lock(&self.state);
        state
            .lanes
            .values()
            .flat_map(|lane| lane.intents.values())
            .filter(|i| i.state == IntentState::Failed(ErrorClass::Terminal))
            .count()
    }

    /// Whether an unapplied intent still targets `key`.
    pub fn has_pending_for(&self, owner: &OwnerId, key: &EntityKey) -> bool {
        let state = lock(&self.state);
        state.lanes.get(owner).is_some_and(|lane| {
            lane.intents
                .values()
                .any(|i| !i.state.is_terminal() && &i.op.target() == key)
        })
    }

    /// Point queued intents that target placeholder `temp` at the key the
    /// server issued for it. Returns how many were rewritten.
    pub async fn rekey(
        &self,
        owner: &OwnerId,
        temp: TempKey,
        server: &ServerKey,
    ) -> Result<usize, String> {
        let from = EntityKey::Optimistic(temp);
        let to = EntityKey::Authoritative(server.clone());
        let tickets: Vec<StoreTicket> = {
            let mut state = lock(&self.state);
            let Some(lane) = state.lanes.get_mut(owner) else {
                return Ok(0);
            };
            let mut rewritten = Vec::new();
            for intent in lane.intents.values_mut() {
                if intent.state.is_terminal() {
                    continue;
                }
                let targets_placeholder = matches!(
                    &intent.op,
                    IntentOp::Update { key, .. } | IntentOp::Delete { key } if *key == from
                );
                if !targets_placeholder {
                    continue;
                }
                match &mut intent.op {
                    IntentOp::Update { key, .. } | IntentOp::Delete { key } => *key = to.clone(),
                    IntentOp::Create { .. } => {}
                }
                rewritten.push(intent.clone());
            }
            rewritten.iter().map(|i| self.write(i)).collect()
        };
        let count = tickets.len();
        for ticket in tickets {
            ticket.wait().await?;
        }
        if count > 0 {
            log::debug!("Re-keyed {} intents of {} from {} to {}", count, owner, from, to);
        }
        Ok(count)
    }

    /// Put a terminally failed intent back at the tail of its lane.
    pub async fn retry_failed(&self, id: IntentId) -> Result<bool, String> {
        let ticket = {
            let mut state = lock(&self.state);
            let parked = state
                .get_mut(id)
                .is_some_and(|i| i.state == IntentState::Failed(ErrorClass::Terminal));
            if !parked {
                return Ok(false);
            }
            let Some(mut intent) = state.take(id) else {
                return Ok(false);
            };
            intent.seq = state.next_seq;
            intent.state = IntentState::Queued;
            intent.attempts = 0;
            intent.last_error = None;
            let ticket = self.write(&intent);
            log::info!("Retrying intent {} for {} as seq {}", id, intent.owner, intent.seq);
            state.insert(intent);
            ticket
        };
        ticket.wait().await?;
        Ok(true)
    }

    /// Drop a terminally failed intent for good.
    pub async fn dismiss(&self, id: IntentId) -> Result<bool, String> {
        let ticket = {
            let mut state = lock(&self.state);
            let parked = state
                .get_mut(id)
                .is_some_and(|i| i.state == IntentState::Failed(ErrorClass::Terminal));
            if !parked {
                return Ok(false);
            }
            state.take(id);
            self.store.as_ref().map(|s| s.submit_intent_delete(id))
        };
        settle(ticket).await?;
        Ok(true)
    }
}
