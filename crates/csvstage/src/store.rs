//! Durable operation record store
//!
//! Append-only history of processor operations, keyed by processor type
//! identity plus a caller-defined partition key. The payload is an opaque
//! blob to the store. A database- or object-store-backed implementation
//! plugs in behind [`OperationStore`]; [`MemoryOperationStore`] ships for
//! tests and in-process use.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, StageError};

/// Kind of recorded operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Rows staged, commit still pending
    Stage,
    /// Commit finished
    Commit,
    /// Validation recorded errors; no commit will follow
    Error,
}

impl OperationKind {
    pub fn as_str(&self) -> &str {
        match self {
            OperationKind::Stage => "stage",
            OperationKind::Commit => "commit",
            OperationKind::Error => "error",
        }
    }
}

/// One durable, never-mutated history entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRecord {
    pub id: Uuid,
    /// Type identity of the processor that wrote this record
    pub class_name: String,
    /// Caller-defined partition key scoping history to one dataset
    pub unique_id: String,
    pub operation: OperationKind,
    pub original_filename: String,
    pub user: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Opaque serialized processor state or status JSON
    pub payload: Vec<u8>,
}

/// Append-only record store, safe for concurrent writers.
#[async_trait]
pub trait OperationStore: Send + Sync {
    async fn create(&self, record: OperationRecord) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<OperationRecord>>;

    /// All records for one processor type and partition key, oldest first.
    async fn history(&self, class_name: &str, unique_id: &str) -> Result<Vec<OperationRecord>>;

    /// Most recently created record for the key, if any.
    async fn latest(&self, class_name: &str, unique_id: &str) -> Result<Option<OperationRecord>>;

    /// Purge records (payload and metadata) created before the cutoff.
    /// Returns how many were deleted.
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

/// In-memory store backed by a mutex-guarded vec.
#[derive(Default)]
pub struct MemoryOperationStore {
    records: Mutex<Vec<OperationRecord>>,
}

impl MemoryOperationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total record count, for assertions in tests.
    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lock_err() -> StageError {
    StageError::store("operation store mutex poisoned")
}

#[async_trait]
impl OperationStore for MemoryOperationStore {
    async fn create(&self, record: OperationRecord) -> Result<()> {
        self.records.lock().map_err(|_| lock_err())?.push(record);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<OperationRecord>> {
        let records = self.records.lock().map_err(|_| lock_err())?;
        Ok(records.iter().find(|r| r.id == id).cloned())
    }

    async fn history(&self, class_name: &str, unique_id: &str) -> Result<Vec<OperationRecord>> {
        let records = self.records.lock().map_err(|_| lock_err())?;
        let mut matched: Vec<OperationRecord> = records
            .iter()
            .filter(|r| r.class_name == class_name && r.unique_id == unique_id)
            .cloned()
            .collect();
        matched.sort_by_key(|r| r.created_at);
        Ok(matched)
    }

    async fn latest(&self, class_name: &str, unique_id: &str) -> Result<Option<OperationRecord>> {
        Ok(self.history(class_name, unique_id).await?.pop())
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut records = self.records.lock().map_err(|_| lock_err())?;
        let before = records.len();
        records.retain(|r| r.created_at >= cutoff);
        let deleted = before - records.len();
        if deleted > 0 {
            tracing::info!(deleted, "Expired operation records");
        }
        Ok(deleted)
    }
}
