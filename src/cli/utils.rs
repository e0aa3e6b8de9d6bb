//! Shared utilities for CLI commands

use chrono::{DateTime, Utc};
use serde_json::Value;
use tabled::{Table, settings::Style};

use crate::cli::error::{CliError, CliResult};

/// Truncate a string with ellipsis if it exceeds max length
pub fn truncate_with_ellipsis(s: &str, max: usize) -> String {
    let char_count = s.chars().count();
    if char_count <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", truncated)
    }
}

/// Format an optional timestamp for display
pub fn format_time(ts: Option<DateTime<Utc>>) -> String {
    match ts {
        Some(ts) => ts.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => "-".to_string(),
    }
}

/// Parse a JSON payload argument; absent means `null`.
pub fn parse_payload(payload: Option<&str>) -> CliResult<Value> {
    match payload {
        None => Ok(Value::Null),
        Some(raw) => serde_json::from_str(raw).map_err(|e| CliError::invalid("payload", e.to_string())),
    }
}

/// Apply consistent table styling
pub fn apply_table_style(table: &mut Table) {
    table.with(Style::rounded());
}
