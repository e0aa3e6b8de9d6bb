//! Database utility functions.

use std::str::FromStr;

use crate::db::{DbError, DbResult};

/// Parse a TEXT column holding an enum's `Display` form.
pub fn parse_column<T>(column: &str, value: &str) -> DbResult<T>
where
    T: FromStr<Err = String>,
{
    T::from_str(value).map_err(|e| DbError::InvalidData {
        message: format!("column '{}': {}", column, e),
    })
}

/// Parse a JSON TEXT column.
pub fn parse_json_column(column: &str, value: &str) -> DbResult<serde_json::Value> {
    serde_json::from_str(value).map_err(|e| DbError::InvalidData {
        message: format!("column '{}' holds invalid JSON: {}", column, e),
    })
}
