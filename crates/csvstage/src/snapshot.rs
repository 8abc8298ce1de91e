//! Durable processor state snapshot
//!
//! An explicit, versioned schema covering everything a processor needs to
//! resume: counters, the stage and rollback queues, the result snapshot,
//! and the error log. The `class_name` field carries the originating type
//! identity so a reload can detect mismatched processor types.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::results::{ErrorLog, RowResult};
use crate::row::Row;

/// Current snapshot schema version
pub const SNAPSHOT_VERSION: u32 = 1;

/// Serialized processor state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorSnapshot {
    pub version: u32,
    /// Type identity of the processor that produced this snapshot
    pub class_name: String,
    pub filename: String,
    /// Header column order of the original input
    #[serde(default)]
    pub input_columns: Vec<String>,
    pub total_rows: u64,
    pub processed_rows: u64,
    pub saved_rows: u64,
    pub stage: VecDeque<(u64, Row)>,
    pub rollback_rows: VecDeque<(u64, Row)>,
    pub result_data: Vec<RowResult>,
    pub error_messages: ErrorLog,
    /// Consumer-defined fields (collections already serialize in a stable
    /// order, so no extra normalization happens here)
    #[serde(default)]
    pub extra: Map<String, Value>,
}

impl ProcessorSnapshot {
    /// Serialize to the opaque payload stored in an operation record.
    pub fn to_payload(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Deserialize from an operation record payload.
    pub fn from_payload(payload: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(payload)
    }
}
