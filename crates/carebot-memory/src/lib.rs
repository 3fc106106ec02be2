//! # Carebot Memory
//!
//! Durable state on a single SQLite file: a bounded connection pool whose
//! handles return themselves on drop, and the persisted chat histories.
//! The vector index lives in `carebot-knowledge` and shares this pool.

pub mod chat;
pub mod storage;

pub use chat::{Chat, ChatStore};
pub use storage::{Storage, StorageHandle, is_constraint_violation, sqlite_error};
