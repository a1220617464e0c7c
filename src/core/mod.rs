pub mod bus;
pub mod cache;
pub mod dispatch;
pub mod error;
pub mod models;
pub mod outbox;
pub mod reconcile;
pub mod remote;
pub mod store;
pub mod undo;
