//! Row model
//!
//! A row is an ordered mapping from column name to a scalar JSON value.
//! Decoding always produces string values; consumers may replace them with
//! numbers or nulls during preprocessing, so the canonical string form below
//! is what the codec and the checksum agree on.

use serde_json::Value;
use std::borrow::Cow;

/// One logical record of tabular data.
pub type Row = serde_json::Map<String, Value>;

/// Canonical text form of a scalar field value.
///
/// Null renders as the empty string, strings render verbatim, numbers and
/// bools via their display form. An integer `0` and the string `"0"` are
/// therefore indistinguishable here, which keeps checksums stable across an
/// export/import round trip.
pub fn canonical_str(value: &Value) -> Cow<'_, str> {
    match value {
        Value::Null => Cow::Borrowed(""),
        Value::String(s) => Cow::Borrowed(s.as_str()),
        Value::Number(n) => Cow::Owned(n.to_string()),
        Value::Bool(b) => Cow::Owned(b.to_string()),
        // Nested values are not expected in tabular data; fall back to JSON.
        other => Cow::Owned(other.to_string()),
    }
}

/// Canonical text form of an optional field lookup.
pub fn canonical_field<'a>(row: &'a Row, column: &str) -> Cow<'a, str> {
    row.get(column).map(canonical_str).unwrap_or(Cow::Borrowed(""))
}
