//! Local store: voters, metadata and the outbox, persisted in SQLite.
//!
//! This module is split into two submodules:
//! - `model`: row structs decoded by sqlx and their conversion into domain types.
//! - `repo`: SQL-only functions over a pool or transaction.
//!
//! Callers import from `roster_sync::db`; the repository API is re-exported here.

pub mod model;
pub mod repo;

pub use repo::*;
