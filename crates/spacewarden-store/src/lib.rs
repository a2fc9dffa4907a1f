//! # spacewarden-store
//!
//! SQLite persistence for the Spacewarden bot: autoinvite rules, the user
//! blocklist, the durable invite queue, processed-event dedup, and a small
//! key/value table for runtime state such as the sync token.
//!
//! The crate exposes a synchronous [`Database`] handle wrapping a
//! `rusqlite::Connection` with typed CRUD helpers per table.  Uniqueness is
//! enforced by SQL constraints, so concurrent writers racing on the same
//! natural key always resolve to one durable row.

pub mod blocks;
pub mod database;
pub mod events;
pub mod migrations;
pub mod models;
pub mod queue;
pub mod rules;
pub mod state;

mod error;

use std::sync::Arc;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;

/// A database handle shared between async tasks.
///
/// All writes funnel through this single mutex, which gives the
/// single-writer-per-key discipline the engine and the command gateway
/// rely on.
pub type SharedDatabase = Arc<tokio::sync::Mutex<Database>>;

impl Database {
    /// Wrap the database for sharing between tasks.
    pub fn into_shared(self) -> SharedDatabase {
        Arc::new(tokio::sync::Mutex::new(self))
    }
}
