use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Account whose data a cache partition or outbox lane belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OwnerId(pub String);

impl From<&str> for OwnerId {
    fn from(s: &str) -> Self {
        OwnerId(s.to_string())
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Named logical list within one owner's data ("active", "expired", ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Scope(pub String);

impl Scope {
    pub fn active() -> Self {
        Scope("active".into())
    }

    pub fn expired() -> Self {
        Scope("expired".into())
    }
}

impl From<&str> for Scope {
    fn from(s: &str) -> Self {
        Scope(s.to_string())
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Local stand-in key for an item whose create has not been applied yet.
/// Wraps the creation order of the create intent that will replace it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TempKey(pub u64);

/// Server-issued identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerKey(pub String);

impl From<&str> for ServerKey {
    fn from(s: &str) -> Self {
        ServerKey(s.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityKey {
    Optimistic(TempKey),
    Authoritative(ServerKey),
}

impl EntityKey {
    pub fn server(id: &str) -> Self {
        EntityKey::Authoritative(ServerKey(id.to_string()))
    }

    pub fn is_optimistic(&self) -> bool {
        matches!(self, EntityKey::Optimistic(_))
    }

    pub fn as_temp(&self) -> Option<TempKey> {
        match self {
            EntityKey::Optimistic(t) => Some(*t),
            EntityKey::Authoritative(_) => None,
        }
    }

    pub fn as_server(&self) -> Option<&ServerKey> {
        match self {
            EntityKey::Optimistic(_) => None,
            EntityKey::Authoritative(s) => Some(s),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKey::Optimistic(TempKey(seq)) => write!(f, "temp#{seq}"),
            EntityKey::Authoritative(ServerKey(id)) => f.write_str(id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemStatus {
    Active,
    PendingDeletion,
    PendingResolution,
    Resolved,
}

/// Why an item left the active list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resolution {
    Consumed,
    Discarded,
    Donated,
    Other(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncState {
    Pending,
    Synced,
    Failed,
}

/// A tracked inventory item, as held in the local cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub key: EntityKey,
    pub scope: Scope,
    pub name: String,
    /// Days since the unix epoch.
    pub expires_on: Option<i32>,
    pub quantity: Option<u32>,
    pub location: Option<String>,
    pub notes: Option<String>,
    pub status: ItemStatus,
    pub resolution: Option<Resolution>,
    pub mutated_at: i64,
    pub sync: SyncState,
}

impl Item {
    pub fn from_draft(key: EntityKey, draft: &ItemDraft, stamp: i64) -> Self {
        Item {
            key,
            scope: draft.scope.clone(),
            name: draft.name.clone(),
            expires_on: draft.expires_on,
            quantity: draft.quantity,
            location: draft.location.clone(),
            notes: draft.notes.clone(),
            status: ItemStatus::Active,
            resolution: None,
            mutated_at: stamp,
            sync: SyncState::Pending,
        }
    }

    /// Whether standard reads may return this item.
    pub fn is_visible(&self) -> bool {
        matches!(self.status, ItemStatus::Active | ItemStatus::PendingResolution)
    }

    /// Authoritative copy of `server` that keeps local display fields the
    /// server has not echoed back yet.
    pub fn merged_over(server: &Item, local: &Item) -> Item {
        let mut merged = server.clone();
        if merged.name.trim().is_empty() && !local.name.is_empty() {
            merged.name = local.name.clone();
        }
        if merged.expires_on.is_none() {
            merged.expires_on = local.expires_on;
        }
        if merged.quantity.is_none() {
            merged.quantity = local.quantity;
        }
        if merged.location.is_none() {
            merged.location = local.location.clone();
        }
        if merged.notes.is_none() {
            merged.notes = local.notes.clone();
        }
        // Local stamps order local races; the server's clock is not comparable.
        merged.mutated_at = local.mutated_at;
        merged.sync = SyncState::Synced;
        merged
    }
}

/// Payload of a create.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemDraft {
    pub scope: Scope,
    pub name: String,
    pub expires_on: Option<i32>,
    pub quantity: Option<u32>,
    pub location: Option<String>,
    pub notes: Option<String>,
}

impl Default for Scope {
    fn default() -> Self {
        Scope::active()
    }
}

impl ItemDraft {
    pub fn named(name: &str) -> Self {
        ItemDraft {
            name: name.to_string(),
            ..Default::default()
        }
    }
}

/// Field changes for an update. Only present fields are written, so applying
/// the same patch twice yields the same item as applying it once.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemPatch {
    pub name: Option<String>,
    pub expires_on: Option<i32>,
    pub quantity: Option<u32>,
    pub location: Option<String>,
    pub notes: Option<String>,
    pub status: Option<ItemStatus>,
    pub resolution: Option<Resolution>,
}

impl ItemPatch {
    pub fn resolve(reason: Resolution) -> Self {
        ItemPatch {
            status: Some(ItemStatus::Resolved),
            resolution: Some(reason),
            ..Default::default()
        }
    }

    pub fn with_status(status: ItemStatus) -> Self {
        ItemPatch {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == ItemPatch::default()
    }

    /// `self` without the fields `other` writes.
    pub fn without(&self, other: &ItemPatch) -> ItemPatch {
        fn keep<T: Clone>(mine: &Option<T>, theirs: &Option<T>) -> Option<T> {
            if theirs.is_some() {
                None
            } else {
                mine.clone()
            }
        }
        ItemPatch {
            name: keep(&self.name, &other.name),
            expires_on: keep(&self.expires_on, &other.expires_on),
            quantity: keep(&self.quantity, &other.quantity),
            location: keep(&self.location, &other.location),
            notes: keep(&self.notes, &other.notes),
            status: keep(&self.status, &other.status),
            resolution: keep(&self.resolution, &other.resolution),
        }
    }

    /// Extend the fields this patch writes by those `other` writes.
    pub fn cover(&mut self, other: &ItemPatch) {
        fn fill<T: Clone>(mine: &mut Option<T>, theirs: &Option<T>) {
            if mine.is_none() {
                mine.clone_from(theirs);
            }
        }
        fill(&mut self.name, &other.name);
        fill(&mut self.expires_on, &other.expires_on);
        fill(&mut self.quantity, &other.quantity);
        fill(&mut self.location, &other.location);
        fill(&mut self.notes, &other.notes);
        fill(&mut self.status, &other.status);
        fill(&mut self.resolution, &other.resolution);
    }

    /// Copy `base`'s value back into every field this patch writes,
    /// including values `base` leaves unset.
    pub fn revert(&self, item: &mut Item, base: &Item) {
        if self.name.is_some() {
            item.name = base.name.clone();
        }
        if self.expires_on.is_some() {
            item.expires_on = base.expires_on;
        }
        if self.quantity.is_some() {
            item.quantity = base.quantity;
        }
        if self.location.is_some() {
            item.location = base.location.clone();
        }
        if self.notes.is_some() {
            item.notes = base.notes.clone();
        }
        if self.status.is_some() {
            item.status = base.status;
        }
        if self.resolution.is_some() {
            item.resolution = base.resolution.clone();
        }
    }

    pub fn apply(&self, item: &mut Item) {
        if let Some(name) = &self.name {
            item.name = name.clone();
        }
        if let Some(expires_on) = self.expires_on {
            item.expires_on = Some(expires_on);
        }
        if let Some(quantity) = self.quantity {
            item.quantity = Some(quantity);
        }
        if let Some(location) = &self.location {
            item.location = Some(location.clone());
        }
        if let Some(notes) = &self.notes {
            item.notes = Some(notes.clone());
        }
        if let Some(status) = self.status {
            item.status = status;
        }
        if let Some(resolution) = &self.resolution {
            item.resolution = Some(resolution.clone());
        }
    }

    /// The patch as shown during the undo window: a resolve is displayed as
    /// pending until it commits.
    pub fn optimistic(&self) -> ItemPatch {
        let mut shown = self.clone();
        if shown.status == Some(ItemStatus::Resolved) {
            shown.status = Some(ItemStatus::PendingResolution);
        }
        shown
    }
}

// ---------------------------------------------------------------------------
// Outbox intents
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IntentId(pub Uuid);

impl IntentId {
    pub fn new() -> Self {
        IntentId(Uuid::new_v4())
    }
}

impl Default for IntentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for IntentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::str::FromStr for IntentId {
    type Err = uuid::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(IntentId)
    }
}

/// Whether a failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorClass {
    Transient,
    Terminal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IntentOp {
    Create { placeholder: TempKey, draft: ItemDraft },
    Update { key: EntityKey, patch: ItemPatch },
    Delete { key: EntityKey },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpKind {
    Create,
    Update,
    Delete,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OpKind::Create => "create",
            OpKind::Update => "update",
            OpKind::Delete => "delete",
        })
    }
}

impl IntentOp {
    pub fn kind(&self) -> OpKind {
        match self {
            IntentOp::Create { .. } => OpKind::Create,
            IntentOp::Update { .. } => OpKind::Update,
            IntentOp::Delete { .. } => OpKind::Delete,
        }
    }

    /// Fields of the target this intent writes. A create writes a whole new
    /// item and has none.
    pub fn touched(&self) -> Option<ItemPatch> {
        match self {
            IntentOp::Create { .. } => None,
            IntentOp::Update { patch, .. } => Some(patch.clone()),
            IntentOp::Delete { .. } => Some(ItemPatch::with_status(ItemStatus::PendingDeletion)),
        }
    }

    /// Key of the item this intent acts on; creates act on their placeholder.
    pub fn target(&self) -> EntityKey {
        match self {
            IntentOp::Create { placeholder, .. } => EntityKey::Optimistic(*placeholder),
            IntentOp::Update { key, .. } | IntentOp::Delete { key } => key.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntentState {
    Queued,
    Dispatching,
    Applied,
    Failed(ErrorClass),
}

impl IntentState {
    pub fn label(&self) -> &'static str {
        match self {
            IntentState::Queued => "queued",
            IntentState::Dispatching => "dispatching",
            IntentState::Applied => "applied",
            IntentState::Failed(ErrorClass::Transient) => "failed-retryable",
            IntentState::Failed(ErrorClass::Terminal) => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IntentState::Applied | IntentState::Failed(ErrorClass::Terminal)
        )
    }
}

/// One outbox entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationIntent {
    pub id: IntentId,
    pub owner: OwnerId,
    pub scope: Scope,
    pub seq: u64,
    pub op: IntentOp,
    pub state: IntentState,
    pub attempts: u32,
    pub issued_at: i64,
    pub last_error: Option<String>,
}

impl MutationIntent {
    pub fn new(owner: OwnerId, scope: Scope, seq: u64, op: IntentOp, issued_at: i64) -> Self {
        MutationIntent {
            id: IntentId::new(),
            owner,
            scope,
            seq,
            op,
            state: IntentState::Queued,
            attempts: 0,
            issued_at,
            last_error: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Wall-clock milliseconds that never repeat or run backwards within a
/// process, so `mutated_at` can order whole-entity races.
#[derive(Debug, Default)]
pub struct StampClock {
    last: AtomicI64,
}

impl StampClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> i64 {
        let now = now_millis();
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(prev + 1);
            match self
                .last
                .compare_exchange(prev, candidate, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return candidate,
                Err(actual) => prev = actual,
            }
        }
    }

    /// Never hand out a stamp at or below `floor` (restored data).
    pub fn observe(&self, floor: i64) {
        self.last.fetch_max(floor, Ordering::AcqRel);
    }
}
