//! SQLite implementation of the database traits.
//!
//! This module provides a SQLite-backed implementation of the repository
//! traits defined in the parent module.

mod change;
mod connection;
mod session;


pub use change::SqliteChangeRepository;
pub use connection::SqliteDatabase;
pub use session::SqliteSessionRepository;
