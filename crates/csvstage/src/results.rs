//! Per-row outcome and aggregate status tracking

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::row::Row;

/// Outcome of the validation/staging pass for one row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowStatus {
    /// Validated, preprocessed to a non-empty row, staged
    Success,
    /// Validation rejected the row; not staged
    Failure,
    /// Validated, but preprocessing produced nothing to stage
    NoAction,
}

impl RowStatus {
    pub fn as_str(&self) -> &str {
        match self {
            RowStatus::Success => "Success",
            RowStatus::Failure => "Failure",
            RowStatus::NoAction => "No Action",
        }
    }
}

/// Result of processing one input row.
///
/// Retains the original fields so an error report can be exported next to
/// the input data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowResult {
    pub fields: Row,
    pub status: RowStatus,
    #[serde(default)]
    pub error: String,
}

impl RowResult {
    pub fn success(fields: Row) -> Self {
        Self {
            fields,
            status: RowStatus::Success,
            error: String::new(),
        }
    }

    pub fn failure(fields: Row, error: impl Into<String>) -> Self {
        Self {
            fields,
            status: RowStatus::Failure,
            error: error.into(),
        }
    }

    pub fn no_action(fields: Row) -> Self {
        Self {
            fields,
            status: RowStatus::NoAction,
            error: String::new(),
        }
    }
}

/// Error messages collected during one processing pass.
///
/// Maps each distinct message to the row numbers that produced it, in
/// first-seen order. Row 0 marks file-level errors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorLog {
    entries: Vec<ErrorEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ErrorEntry {
    message: String,
    rows: Vec<u64>,
}

impl ErrorLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error message against a row number. Identical messages
    /// share one entry.
    pub fn add(&mut self, message: impl Into<String>, row: u64) {
        let message = message.into();
        match self.entries.iter_mut().find(|e| e.message == message) {
            Some(entry) => entry.rows.push(row),
            None => self.entries.push(ErrorEntry {
                message,
                rows: vec![row],
            }),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Distinct messages in first-seen order.
    pub fn messages(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.message.clone()).collect()
    }

    /// Row numbers recorded for a message, if any.
    pub fn rows_for(&self, message: &str) -> Option<&[u64]> {
        self.entries
            .iter()
            .find(|e| e.message == message)
            .map(|e| e.rows.as_slice())
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Aggregate status of a processing pass.
///
/// The deferred fields (`result_id`, `saved_error_id`, `waiting`) stay at
/// their defaults unless a deferred processor produced the status.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessStatus {
    pub total: u64,
    pub processed: u64,
    pub saved: u64,
    pub error_rows: Vec<RowResult>,
    pub error_messages: Vec<String>,
    pub percentage: String,
    pub can_commit: bool,
    #[serde(default)]
    pub result_id: Option<String>,
    #[serde(default)]
    pub saved_error_id: Option<Uuid>,
    #[serde(default)]
    pub waiting: bool,
}

/// Render `saved / total` as a percentage, treating total as at least 1 so
/// a zero-row file reports 0.0%.
pub fn percentage(saved: u64, total: u64) -> String {
    format!("{:.1}%", (saved as f64 / total.max(1) as f64) * 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_log_dedupes_messages() {
        let mut log = ErrorLog::new();
        log.add("bad value", 1);
        log.add("bad value", 3);
        log.add("missing field", 2);
        assert_eq!(log.messages(), vec!["bad value", "missing field"]);
        assert_eq!(log.rows_for("bad value"), Some(&[1, 3][..]));
    }

    #[test]
    fn test_error_log_empty() {
        let log = ErrorLog::new();
        assert!(log.is_empty());
        assert!(log.messages().is_empty());
        assert_eq!(log.rows_for("anything"), None);
    }

    #[test]
    fn test_percentage() {
        assert_eq!(percentage(2, 2), "100.0%");
        assert_eq!(percentage(1, 2), "50.0%");
        assert_eq!(percentage(0, 0), "0.0%");
        assert_eq!(percentage(1, 3), "33.3%");
    }

    #[test]
    fn test_row_status_strings() {
        assert_eq!(RowStatus::Success.as_str(), "Success");
        assert_eq!(RowStatus::Failure.as_str(), "Failure");
        assert_eq!(RowStatus::NoAction.as_str(), "No Action");
    }
}
