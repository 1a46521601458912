//! Datastore models

use serde::{Deserialize, Serialize};

/// Parameter value bound to a query
pub use rusqlite::types::Value as SqlValue;

/// One result row keyed by column name
pub type Record = serde_json::Map<String, serde_json::Value>;

/// Result of [`crate::Database::execute`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    /// Column names in statement order
    pub columns: Vec<String>,
    /// Rows returned by the statement
    pub rows: Vec<Record>,
    /// Rows changed by a statement that returns no columns
    pub rows_affected: usize,
}

impl QueryResult {
    /// Whether the statement returned no rows
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
