//! Ask the server to run its own reconciliation.

use crate::api::SyncServer;
use crate::cli::error::CliResult;

pub async fn trigger<S: SyncServer>(server: &S) -> CliResult<String> {
    let response = server.trigger_sync().await?;
    let icon = if response.success { "✓" } else { "✗" };
    let message = if response.message.is_empty() {
        "Server sync triggered".to_string()
    } else {
        response.message
    };
    Ok(format!("{} {}", icon, message))
}
