pub mod config;
pub mod core;
pub mod engine;

#[cfg(test)]
mod testing;

pub use engine::{DeleteFlow, PendingMutation, SyncEngine, SyncStatus, UndoOutcome, UpdateFlow};
