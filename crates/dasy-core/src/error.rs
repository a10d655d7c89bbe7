//! Error type shared by every pipeline stage.

use thiserror::Error;

/// Failures that abort a redistribution run.
///
/// Every variant carries enough context (stage or table, plus the offending
/// key) to locate the bad input without re-running. Degenerate source units
/// (no populated area, no population) are not errors; they take the
/// area-weighted fallback in `redistribute`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DasyError {
    #[error("invalid config: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("schema mismatch: table `{table}` has no column `{column}`")]
    SchemaMismatch { table: String, column: String },

    #[error("orphan target unit {target_id}: source unit {source_id} not in source table")]
    OrphanTargetUnit { target_id: i64, source_id: i64 },

    #[error("duplicate key {key} in table `{table}`")]
    DuplicateKey { table: String, key: i64 },

    #[error("invalid value in table `{table}`, {}, column `{column}`: {reason}", locate(.row, .key))]
    InvalidValue {
        table: String,
        row: usize,
        /// `Value` id of the row, when it could be read.
        key: Option<i64>,
        column: String,
        reason: String,
    },

    #[error("estimates for source unit {source_id} overflow; population cannot be redistributed")]
    NonFiniteEstimate { source_id: i64 },
}

fn locate(row: &usize, key: &Option<i64>) -> String {
    match key {
        Some(key) => format!("key {key} (row {row})"),
        None => format!("row {row}"),
    }
}

impl DasyError {
    pub(crate) fn config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig { field: field.into(), reason: reason.into() }
    }

    pub(crate) fn value(
        table: &str,
        row: usize,
        column: &str,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidValue {
            table: table.to_owned(),
            row,
            key: None,
            column: column.to_owned(),
            reason: reason.into(),
        }
    }

    /// Attach the row's id to an `InvalidValue`; other variants pass through.
    pub(crate) fn with_key(mut self, id: i64) -> Self {
        if let Self::InvalidValue { key, .. } = &mut self {
            *key = Some(id);
        }
        self
    }
}

pub type Result<T> = std::result::Result<T, DasyError>;
