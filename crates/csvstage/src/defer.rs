//! Deferred execution and durable snapshots
//!
//! [`DeferredProcessor`] wraps a [`CsvProcessor`] and decides whether a
//! commit runs inline or on an asynchronous worker. Either way the full
//! processor state is persisted as an [`OperationRecord`] first, so a
//! commit is resumable and auditable across process boundaries. Workers
//! never share the in-memory instance; they rebuild one from the snapshot
//! through a [`ProcessorRegistry`].
//!
//! The ordering invariant is strict: the operation record must be durable
//! before work is enqueued, because the worker looks the record up by id
//! from outside the submitting context.

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::{Result, StageError};
use crate::processor::{CsvProcessor, CsvSource, RowHandler};
use crate::results::ProcessStatus;
use crate::snapshot::ProcessorSnapshot;
use crate::store::{OperationKind, OperationRecord, OperationStore};

/// Resolves the acting user when one is not supplied explicitly.
pub trait IdentityContext: Send + Sync {
    fn current_user(&self) -> Option<String>;
}

/// Identity context that never resolves a user.
pub struct NoIdentity;

impl IdentityContext for NoIdentity {
    fn current_user(&self) -> Option<String> {
        None
    }
}

/// Identity context with a fixed user, for request-scoped wiring and tests.
pub struct StaticIdentity(pub String);

impl IdentityContext for StaticIdentity {
    fn current_user(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

/// Work descriptor handed to the task queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitTask {
    pub operation_id: Uuid,
}

#[derive(Debug)]
enum HandleState {
    Ready(ProcessStatus),
    Pending(oneshot::Receiver<ProcessStatus>),
    Taken,
}

/// Handle to a submitted commit. Owned by the caller; the work itself is
/// owned by the queue once submitted.
#[derive(Debug)]
pub struct TaskHandle {
    pub id: String,
    state: HandleState,
}

impl TaskHandle {
    /// Handle for work that completed eagerly.
    pub fn ready(id: impl Into<String>, status: ProcessStatus) -> Self {
        Self {
            id: id.into(),
            state: HandleState::Ready(status),
        }
    }

    /// Handle for work still running on a worker.
    pub fn pending(id: impl Into<String>, rx: oneshot::Receiver<ProcessStatus>) -> Self {
        Self {
            id: id.into(),
            state: HandleState::Pending(rx),
        }
    }

    /// Poll for completion without blocking.
    pub fn is_ready(&mut self) -> bool {
        if let HandleState::Pending(rx) = &mut self.state {
            match rx.try_recv() {
                Ok(status) => self.state = HandleState::Ready(status),
                // Empty: still running. Closed: the worker died without a
                // result; wait() reports that as an error.
                Err(_) => return false,
            }
        }
        matches!(self.state, HandleState::Ready(_) | HandleState::Taken)
    }

    /// Take the result if the work already finished.
    pub fn try_result(&mut self) -> Option<ProcessStatus> {
        if self.is_ready() {
            if let HandleState::Ready(status) = std::mem::replace(&mut self.state, HandleState::Taken)
            {
                return Some(status);
            }
        }
        None
    }

    /// Block until the work finishes.
    pub async fn wait(self) -> Result<ProcessStatus> {
        match self.state {
            HandleState::Ready(status) => Ok(status),
            HandleState::Pending(rx) => rx
                .await
                .map_err(|_| StageError::queue("deferred commit worker dropped its result")),
            HandleState::Taken => Err(StageError::queue("task result already taken")),
        }
    }
}

/// Asynchronous execution facility: submit work, get a handle.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn submit(&self, task: CommitTask) -> Result<TaskHandle>;
}

/// A processor rebuilt from a snapshot that can finish its commit.
#[async_trait]
pub trait ResumableCommit: Send {
    /// Run the commit to completion, persist a final snapshot, and return
    /// the resulting status.
    async fn run(&mut self) -> Result<ProcessStatus>;
}

impl std::fmt::Debug for dyn ResumableCommit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn ResumableCommit")
    }
}

type Factory = Box<
    dyn Fn(ProcessorSnapshot, Arc<dyn OperationStore>) -> Result<Box<dyn ResumableCommit>>
        + Send
        + Sync,
>;

/// Maps processor type identities to factories that rebuild a processor
/// from a snapshot. Only registered identities can be resumed; an unknown
/// identity on reload is a fatal error.
#[derive(Default)]
pub struct ProcessorRegistry {
    factories: HashMap<String, Factory>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, class_name: impl Into<String>, factory: F)
    where
        F: Fn(ProcessorSnapshot, Arc<dyn OperationStore>) -> Result<Box<dyn ResumableCommit>>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(class_name.into(), Box::new(factory));
    }

    fn resolve(&self, class_name: &str) -> Result<&Factory> {
        self.factories
            .get(class_name)
            .ok_or_else(|| StageError::UnknownType(class_name.to_string()))
    }
}

/// Load a processor from its saved operation record.
///
/// With `expected_class` set, a different recorded identity is a fatal
/// [`StageError::TypeMismatch`] (it can indicate tampering when several
/// processor types share one store). Passing `None` allows any registered
/// identity, which is how workers resolve subtypes.
pub async fn load_processor(
    store: &Arc<dyn OperationStore>,
    registry: &ProcessorRegistry,
    operation_id: Uuid,
    expected_class: Option<&str>,
) -> Result<Box<dyn ResumableCommit>> {
    let record = store
        .get(operation_id)
        .await?
        .ok_or(StageError::OperationNotFound(operation_id))?;
    tracing::info!(operation_id = %operation_id, class_name = %record.class_name, "Loading processor state");
    let snapshot = ProcessorSnapshot::from_payload(&record.payload)?;
    if let Some(expected) = expected_class {
        if snapshot.class_name != expected {
            return Err(StageError::TypeMismatch {
                expected: expected.to_string(),
                found: snapshot.class_name,
            });
        }
    }
    let factory = registry.resolve(&snapshot.class_name)?;
    factory(snapshot, Arc::clone(store))
}

/// Worker entry point: load the processor by operation id, finish its
/// commit, and return the status payload for the queue's result store.
pub async fn run_deferred_commit(
    store: Arc<dyn OperationStore>,
    registry: &ProcessorRegistry,
    operation_id: Uuid,
) -> Result<ProcessStatus> {
    let mut instance = load_processor(&store, registry, operation_id, None).await?;
    let status = instance.run().await?;
    tracing::info!(operation_id = %operation_id, saved = status.saved, "Deferred commit finished");
    Ok(status)
}

/// Eager queue: runs the commit before `submit` returns and hands back a
/// ready handle. Deterministic, for tests and single-process deployments.
pub struct InlineTaskQueue {
    store: Arc<dyn OperationStore>,
    registry: Arc<ProcessorRegistry>,
}

impl InlineTaskQueue {
    pub fn new(store: Arc<dyn OperationStore>, registry: Arc<ProcessorRegistry>) -> Self {
        Self { store, registry }
    }
}

#[async_trait]
impl TaskQueue for InlineTaskQueue {
    async fn submit(&self, task: CommitTask) -> Result<TaskHandle> {
        let status =
            run_deferred_commit(Arc::clone(&self.store), &self.registry, task.operation_id).await?;
        Ok(TaskHandle::ready(task.operation_id.to_string(), status))
    }
}

/// Queue that runs each commit on a spawned tokio task and returns a
/// pending handle.
pub struct SpawnedTaskQueue {
    store: Arc<dyn OperationStore>,
    registry: Arc<ProcessorRegistry>,
}

impl SpawnedTaskQueue {
    pub fn new(store: Arc<dyn OperationStore>, registry: Arc<ProcessorRegistry>) -> Self {
        Self { store, registry }
    }
}

#[async_trait]
impl TaskQueue for SpawnedTaskQueue {
    async fn submit(&self, task: CommitTask) -> Result<TaskHandle> {
        let (tx, rx) = oneshot::channel();
        let store = Arc::clone(&self.store);
        let registry = Arc::clone(&self.registry);
        let task_id = Uuid::new_v4().to_string();
        tokio::spawn(async move {
            match run_deferred_commit(store, &registry, task.operation_id).await {
                Ok(status) => {
                    let _ = tx.send(status);
                }
                Err(e) => {
                    tracing::error!(operation_id = %task.operation_id, error = %e, "Deferred commit failed");
                }
            }
        });
        Ok(TaskHandle::pending(task_id, rx))
    }
}

/// Queue used inside workers, which must never re-defer: submission fails.
pub struct NullTaskQueue;

#[async_trait]
impl TaskQueue for NullTaskQueue {
    async fn submit(&self, _task: CommitTask) -> Result<TaskHandle> {
        Err(StageError::queue(
            "task queue is not available inside a deferred worker",
        ))
    }
}

/// Deferral policy and identity for one processor type.
#[derive(Debug, Clone)]
pub struct DeferredOptions {
    /// Type identity recorded in snapshots; registry key
    pub class_name: String,
    /// Partition key scoping operation history to one dataset
    pub unique_id: String,
    /// Staged batches up to this many rows commit synchronously;
    /// 0 means every commit is deferred
    pub size_to_defer: usize,
    /// Purge operation records older than this many days, opportunistically
    pub retention_days: Option<i64>,
}

impl DeferredOptions {
    pub fn new(class_name: impl Into<String>, unique_id: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            unique_id: unique_id.into(),
            size_to_defer: 0,
            retention_days: None,
        }
    }

    pub fn size_to_defer(mut self, rows: usize) -> Self {
        self.size_to_defer = rows;
        self
    }

    pub fn retention_days(mut self, days: i64) -> Self {
        self.retention_days = Some(days);
        self
    }
}

/// Processor wrapper that snapshots state around every commit and defers
/// large commits to the task queue.
pub struct DeferredProcessor<H> {
    inner: CsvProcessor<H>,
    options: DeferredOptions,
    store: Arc<dyn OperationStore>,
    queue: Arc<dyn TaskQueue>,
    identity: Arc<dyn IdentityContext>,
    result_id: Option<String>,
    saved_error_id: Option<Uuid>,
    inline_status: Option<ProcessStatus>,
    handle: Option<TaskHandle>,
    save_count: u64,
}

impl<H: RowHandler> DeferredProcessor<H> {
    /// Wrap a processor. An empty `unique_id` or `class_name` is a fatal
    /// configuration error: without them operation history cannot be keyed.
    pub fn new(
        inner: CsvProcessor<H>,
        options: DeferredOptions,
        store: Arc<dyn OperationStore>,
        queue: Arc<dyn TaskQueue>,
        identity: Arc<dyn IdentityContext>,
    ) -> Result<Self> {
        if options.class_name.is_empty() {
            return Err(StageError::config("class_name must not be empty"));
        }
        if options.unique_id.is_empty() {
            return Err(StageError::config(
                "unique_id must not be empty; supply a partition key for operation history",
            ));
        }
        Ok(Self {
            inner,
            options,
            store,
            queue,
            identity,
            result_id: None,
            saved_error_id: None,
            inline_status: None,
            handle: None,
            save_count: 0,
        })
    }

    pub fn processor(&self) -> &CsvProcessor<H> {
        &self.inner
    }

    pub fn processor_mut(&mut self) -> &mut CsvProcessor<H> {
        &mut self.inner
    }

    pub fn options(&self) -> &DeferredOptions {
        &self.options
    }

    /// Persist the current state as an operation record.
    ///
    /// Without an explicit kind the record is tagged `stage` while
    /// committable work is pending and `commit` once the stage has drained.
    /// The acting user is the explicit argument or whatever the identity
    /// context resolves; neither is required.
    pub async fn save(
        &mut self,
        kind: Option<OperationKind>,
        user: Option<String>,
    ) -> Result<OperationRecord> {
        let kind = kind.unwrap_or_else(|| {
            if self.inner.can_commit() {
                OperationKind::Stage
            } else {
                OperationKind::Commit
            }
        });
        let snapshot = self.inner.to_snapshot(self.options.class_name.clone());
        let record = OperationRecord {
            id: Uuid::new_v4(),
            class_name: self.options.class_name.clone(),
            unique_id: self.options.unique_id.clone(),
            operation: kind,
            original_filename: self.inner.filename().to_string(),
            user: user.or_else(|| self.identity.current_user()),
            created_at: Utc::now(),
            payload: snapshot.to_payload()?,
        };
        self.store.create(record.clone()).await?;
        self.save_count += 1;
        // Spread the retention cost: check expiry on every third save only.
        if let Some(days) = self.options.retention_days {
            if self.save_count % 3 == 0 {
                let cutoff = Utc::now() - Duration::days(days);
                self.store.delete_older_than(cutoff).await?;
            }
        }
        Ok(record)
    }

    /// Commit the staged rows, inline or deferred.
    ///
    /// Runs synchronously when already inside a worker (`running_task`) or
    /// when the staged count is within `size_to_defer`. Otherwise the state
    /// is saved durably first and a [`CommitTask`] is enqueued; an eagerly
    /// completed submission is captured as the inline status, anything else
    /// leaves the processor waiting on its handle.
    pub async fn commit(&mut self, running_task: bool) -> Result<()> {
        if running_task || self.inner.staged_len() <= self.options.size_to_defer {
            self.save(None, None).await?;
            self.inner.commit();
        } else {
            let record = self.save(None, None).await?;
            let mut handle = self
                .queue
                .submit(CommitTask {
                    operation_id: record.id,
                })
                .await?;
            if let Some(status) = handle.try_result() {
                self.inline_status = Some(status);
            } else {
                tracing::info!(operation_id = %record.id, task_id = %handle.id, "Queued deferred commit");
                self.result_id = Some(handle.id.clone());
                self.handle = Some(handle);
            }
        }
        Ok(())
    }

    /// Run the base validation/staging pass; validation failures are
    /// persisted immediately as an `error` operation so they are on record
    /// even if no commit ever happens. Autocommit goes through the
    /// deferring [`commit`](Self::commit).
    pub async fn process_file<R: Read>(
        &mut self,
        source: CsvSource<R>,
        autocommit: bool,
    ) -> Result<()> {
        self.inner.process_file(source, false)?;
        if !self.inner.error_log().is_empty() {
            let record = self.save(Some(OperationKind::Error), None).await?;
            self.saved_error_id = Some(record.id);
        }
        if autocommit && self.inner.can_commit() {
            self.commit(false).await?;
        }
        Ok(())
    }

    /// Base status augmented with the deferred-handle fields. When an eager
    /// submission already returned a final status, that status wins.
    pub fn status(&self) -> ProcessStatus {
        let mut status = self
            .inline_status
            .clone()
            .unwrap_or_else(|| self.inner.status());
        status.result_id = self.result_id.clone();
        status.saved_error_id = self.saved_error_id;
        status.waiting = self.result_id.is_some();
        status
    }

    /// Block until an in-flight deferred commit finishes and adopt its
    /// status. A no-op when nothing is in flight.
    pub async fn wait(&mut self) -> Result<ProcessStatus> {
        if let Some(handle) = self.handle.take() {
            let status = handle.wait().await?;
            self.result_id = None;
            self.inline_status = Some(status);
        }
        Ok(self.status())
    }

    /// Committed operations for this processor's partition key, newest
    /// first, each with a payload summary.
    pub async fn committed_history(&self) -> Result<Vec<OperationSummary>> {
        let mut records = self
            .store
            .history(&self.options.class_name, &self.options.unique_id)
            .await?;
        records.retain(|r| r.operation == OperationKind::Commit);
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records.into_iter().map(OperationSummary::from_record).collect())
    }
}

#[async_trait]
impl<H: RowHandler> ResumableCommit for DeferredProcessor<H> {
    async fn run(&mut self) -> Result<ProcessStatus> {
        self.commit(true).await?;
        let status = self.status();
        let record = self.save(None, None).await?;
        tracing::info!(operation_id = %record.id, "Saved final processor state");
        Ok(status)
    }
}

/// History entry with the counters parsed out of the record payload.
#[derive(Debug, Clone, Serialize)]
pub struct OperationSummary {
    pub id: Uuid,
    pub operation: OperationKind,
    pub original_filename: String,
    pub user: Option<String>,
    pub created_at: chrono::DateTime<Utc>,
    pub total_rows: u64,
    pub processed_rows: u64,
    pub saved_rows: u64,
    /// Set when the payload could not be read back
    pub error_message: Option<String>,
}

impl OperationSummary {
    fn from_record(record: OperationRecord) -> Self {
        let mut summary = Self {
            id: record.id,
            operation: record.operation,
            original_filename: record.original_filename.clone(),
            user: record.user.clone(),
            created_at: record.created_at,
            total_rows: 0,
            processed_rows: 0,
            saved_rows: 0,
            error_message: None,
        };
        match ProcessorSnapshot::from_payload(&record.payload) {
            Ok(snapshot) => {
                summary.total_rows = snapshot.total_rows;
                summary.processed_rows = snapshot.processed_rows;
                summary.saved_rows = snapshot.saved_rows;
            }
            Err(e) => {
                tracing::error!(operation_id = %record.id, error = %e, "Failed to read operation payload");
                summary.error_message = Some("Failed to retrieve data.".to_string());
            }
        }
        summary
    }
}
