//! Client side of the maintenance server API.
//!
//! - `client`: thin reqwest wrapper with base URL and bounded timeouts
//! - `server`: the [`SyncServer`] trait and its HTTP implementation
//! - `error`: transport-level errors

mod client;
mod error;
mod server;


pub use client::ApiClient;
pub use error::{ApiError, ApiResult};
pub use server::{
    ConnectionStatus, HttpSyncServer, PendingSync, RemoteSyncStatus, SyncServer, TriggerResponse,
};
