//! Local persistence for the sync engine.
//!
//! This module provides trait-based abstractions for data access so the
//! queue and session history can be backed by SQLite in production and an
//! in-memory database in tests.
//!
//! # Architecture
//!
//! - `error`: Storage-agnostic error types
//! - `models`: Persisted records (PendingChange, SyncSession)
//! - `repository`: Trait definitions for data access
//! - `sqlite`: SQLite implementation

mod error;
mod models;
mod repository;
pub mod sqlite;
pub mod utils;


pub use error::{DbError, DbResult};
pub use models::*;
pub use repository::*;
pub use sqlite::SqliteDatabase;
