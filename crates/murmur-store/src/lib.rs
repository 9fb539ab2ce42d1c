//! # murmur-store
//!
//! Durable local storage for identities, channels, messages, ratchet state
//! and sync cursors, backed by SQLite.
//!
//! [`Database`] is the synchronous `rusqlite` handle with typed CRUD helpers.
//! [`MessageStore`] wraps it for async callers and adds the write-ahead
//! buffer that batches message inserts.
//!
//! Only ciphertext is persisted. Identity keys and ratchet snapshots arrive
//! already sealed and are stored as opaque blobs.

pub mod channels;
pub mod database;
pub mod identities;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod ratchet_states;
pub mod sync_cursors;
pub mod wal;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
pub use wal::{MessageStore, WalConfig};
