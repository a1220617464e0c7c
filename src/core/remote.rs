use async_trait::async_trait;

use crate::core::error::RemoteError;
use crate::core::models::{Item, ItemDraft, ItemPatch, OwnerId, Scope, ServerKey};

/// What a delete found on the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// Already gone; callers treat this as success.
    NotFound,
}

/// The remote system of record.
///
/// Returned items always carry an authoritative key. Implementations should
/// not retry internally; the dispatcher owns retry and backoff.
#[async_trait]
pub trait Remote: Send + Sync {
    async fn fetch_by_scope(&self, owner: &OwnerId, scope: &Scope) -> Result<Vec<Item>, RemoteError>;

    async fn create_entity(&self, owner: &OwnerId, draft: &ItemDraft) -> Result<Item, RemoteError>;

    async fn update_entity(
        &self,
        owner: &OwnerId,
        key: &ServerKey,
        patch: &ItemPatch,
    ) -> Result<Item, RemoteError>;

    async fn delete_entity(&self, owner: &OwnerId, key: &ServerKey) -> Result<DeleteOutcome, RemoteError>;
}
