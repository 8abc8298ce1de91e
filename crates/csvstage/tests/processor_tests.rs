//! End-to-end pipeline tests: export, import, checksums, rollback, and
//! deferred commits against the in-memory operation store.

use std::sync::Arc;

use serde_json::json;

use csvstage::{
    load_processor, ChecksumConfig, ChecksumValidator, CommitOutcome, CsvProcessor, CsvSource,
    DeferredOptions, DeferredProcessor, InlineTaskQueue, MemoryOperationStore, NullTaskQueue,
    OperationKind, OperationRecord, OperationStore, ProcessorConfig, ProcessorRegistry,
    ResumableCommit, Row, RowHandler, RowStatus, SpawnedTaskQueue, StageError, StaticIdentity,
    ValidationError,
};

const CLASS_NAME: &str = "tests.Dummy";
const UNIQUE_ID: &str = "dummy-batch";

/// Handler with one poison value per phase: "3" fails validation, "4" fails
/// the commit. Every saved row yields an undo row, and committing a "2"
/// produces an undo that will itself fail, to exercise rollback errors.
struct DummyHandler;

impl RowHandler for DummyHandler {
    fn validate_row(&self, row: &Row) -> Result<(), ValidationError> {
        if row.get("foo") == Some(&json!("3")) {
            return Err(ValidationError::new("3 not allowed"));
        }
        Ok(())
    }

    fn process_row(&mut self, row: &Row) -> anyhow::Result<CommitOutcome> {
        if row.get("foo") == Some(&json!("4")) {
            anyhow::bail!("4 is not allowed");
        }
        let mut undo = row.clone();
        undo.insert("undo".into(), json!(true));
        if row.get("foo") == Some(&json!("2")) {
            undo.insert("foo".into(), json!("4"));
        }
        Ok(CommitOutcome::Saved { undo: Some(undo) })
    }

    fn rows_to_export(&self) -> Vec<Row> {
        (1..=2)
            .map(|n| {
                let mut row = Row::new();
                row.insert("foo".into(), json!(n));
                row.insert("bar".into(), json!(n));
                row
            })
            .collect()
    }
}

fn dummy_config() -> ProcessorConfig {
    ProcessorConfig {
        columns: vec!["foo".into(), "bar".into()],
        required_columns: vec!["foo".into(), "bar".into()],
        ..ProcessorConfig::default()
    }
}

fn dummy_processor() -> CsvProcessor<DummyHandler> {
    CsvProcessor::new(dummy_config(), DummyHandler)
}

fn source(data: &[u8]) -> CsvSource<std::io::Cursor<Vec<u8>>> {
    CsvSource::from_bytes(data.to_vec(), "test.csv")
}

#[test]
fn test_write_export() {
    let p = dummy_processor();
    let mut out = Vec::new();
    p.write_file(&mut out, None, None).unwrap();
    assert_eq!(out, b"foo,bar\r\n1,1\r\n2,2\r\n");
}

#[test]
fn test_read_and_commit() {
    let mut p = dummy_processor();
    p.process_file(source(b"foo,bar\r\n1,1\r\n2,2\r\n"), true)
        .unwrap();
    let status = p.status();
    assert_eq!(status.total, 2);
    assert_eq!(status.processed, 2);
    assert_eq!(status.saved, 2);
    assert_eq!(status.percentage, "100.0%");
    assert!(status.error_messages.is_empty());
}

#[test]
fn test_validation_error_row() {
    let mut p = dummy_processor();
    p.process_file(source(b"foo,bar\r\n1,2\r\n3,4\r\n"), true)
        .unwrap();
    let status = p.status();
    assert_eq!(status.error_messages, vec!["3 not allowed"]);
    assert_eq!(status.error_rows.len(), 1);
    assert_eq!(status.saved, 0);
    assert!(!status.can_commit);
}

#[test]
fn test_commit_error_row() {
    let mut p = dummy_processor();
    p.process_file(source(b"foo,bar\r\n1,1\r\n4,4\r\n"), true)
        .unwrap();
    let status = p.status();
    assert_eq!(status.saved, 1);
    assert_eq!(status.error_messages, vec!["4 is not allowed"]);
    assert_eq!(status.error_rows.len(), 1);
    assert_eq!(status.error_rows[0].status, RowStatus::Failure);
}

#[test]
fn test_file_size_limit() {
    let mut p = CsvProcessor::new(
        ProcessorConfig {
            max_file_size: 20,
            ..dummy_config()
        },
        DummyHandler,
    );
    p.process_file(source(b"foo,bar\r\n1,1\r\n2,2\r\n3,3\r\n"), true)
        .unwrap();
    let status = p.status();
    assert_eq!(status.total, 0);
    assert_eq!(
        status.error_messages,
        vec!["The CSV file must be under 20 bytes"]
    );
}

#[test]
fn test_open_file_source() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("batch.csv");
    std::fs::write(&path, b"foo,bar\r\n1,1\r\n").unwrap();

    let mut p = dummy_processor();
    let file = CsvSource::open(&path).unwrap();
    assert_eq!(file.filename, "batch.csv");
    assert_eq!(file.size, Some(14));
    p.process_file(file, true).unwrap();
    assert_eq!(p.status().saved, 1);
}

#[test]
fn test_column_and_row_overrides() {
    let p = dummy_processor();

    let lines: Vec<String> = p.export_lines(None, Some(vec!["foo".into()])).collect();
    assert_eq!(lines.join(""), "foo\r\n1\r\n2\r\n");

    let rows: Vec<Row> = ["a", "c"]
        .iter()
        .zip(["b", "d"])
        .map(|(foo, bar)| {
            let mut row = Row::new();
            row.insert("foo".into(), json!(foo));
            row.insert("bar".into(), json!(bar));
            row
        })
        .collect();
    let lines: Vec<String> = p.export_lines(Some(rows), None).collect();
    assert_eq!(lines.join(""), "foo,bar\r\na,b\r\nc,d\r\n");
}

#[test]
fn test_error_data_export() {
    let mut p = dummy_processor();
    p.process_file(source(b"foo,bar\r\n1,2\r\n3,4\r\n"), true)
        .unwrap();
    let lines: Vec<String> = p.export_error_lines(None).collect();
    assert_eq!(lines[0], "foo,bar,status,error\r\n");
    assert_eq!(lines[1], "1,2,Success,\r\n");
    assert_eq!(lines[2], "3,4,Failure,3 not allowed\r\n");
}

#[test]
fn test_rollback_reverses_commit() {
    let mut p = dummy_processor();
    p.process_file(source(b"foo,bar\r\n1,1\r\n2,2\r\n"), false)
        .unwrap();
    p.commit();
    assert_eq!(p.status().saved, 2);

    // The undo row for "2" was rewritten to the poison value "4", so one
    // of the two rollbacks fails.
    p.rollback();
    let status = p.status();
    assert_eq!(status.saved, 1);
    assert_eq!(status.error_messages, vec!["4 is not allowed"]);
}

#[test]
fn test_checksum_export_then_import() {
    let checksum = ChecksumConfig::new(vec!["foo".into(), "bar".into()], "insecure-secret-key");
    let columns = vec!["foo".to_string(), "bar".to_string(), "csum".to_string()];
    let config = ProcessorConfig {
        columns: columns.clone(),
        required_columns: columns,
        ..ProcessorConfig::default()
    };

    let exporter = CsvProcessor::new(
        config.clone(),
        ChecksumValidator::new(checksum.clone(), DummyHandler),
    );
    let mut exported = Vec::new();
    exporter.write_file(&mut exported, None, None).unwrap();

    let mut importer = CsvProcessor::new(config, ChecksumValidator::new(checksum, DummyHandler));
    importer
        .process_file(CsvSource::from_bytes(exported, "reimport.csv"), true)
        .unwrap();
    let status = importer.status();
    assert!(status.error_messages.is_empty());
    assert_eq!(status.saved, 2);
}

#[test]
fn test_checksum_detects_edited_column() {
    let checksum = ChecksumConfig::new(vec!["foo".into(), "bar".into()], "insecure-secret-key");
    let config = ProcessorConfig {
        columns: vec!["foo".into(), "bar".into(), "csum".into()],
        ..ProcessorConfig::default()
    };
    let mut p = CsvProcessor::new(config, ChecksumValidator::new(checksum, DummyHandler));
    p.process_file(source(b"foo,bar,csum\r\n1,edited,@cfb0\r\n"), true)
        .unwrap();
    let status = p.status();
    assert_eq!(
        status.error_messages,
        vec!["Checksum mismatch. Required columns cannot be edited: foo,bar"]
    );
    assert_eq!(status.saved, 0);
}

#[test]
fn test_snapshot_restores_status() {
    let mut p = dummy_processor();
    p.process_file(source(b"foo,bar\r\n1,2\r\n3,4\r\n"), false)
        .unwrap();
    let snapshot = p.to_snapshot(CLASS_NAME);
    let restored = CsvProcessor::from_snapshot(dummy_config(), DummyHandler, snapshot);
    assert_eq!(restored.status(), p.status());
    assert_eq!(restored.staged_len(), p.staged_len());
    assert_eq!(restored.filename(), p.filename());
}

fn dummy_registry() -> ProcessorRegistry {
    let mut registry = ProcessorRegistry::new();
    registry.register(CLASS_NAME, |snapshot, store| {
        let inner = CsvProcessor::from_snapshot(dummy_config(), DummyHandler, snapshot);
        let deferred = DeferredProcessor::new(
            inner,
            DeferredOptions::new(CLASS_NAME, UNIQUE_ID),
            store,
            Arc::new(NullTaskQueue),
            Arc::new(StaticIdentity("ziggy".to_string())),
        )?;
        Ok(Box::new(deferred) as Box<dyn ResumableCommit>)
    });
    registry
}

fn deferred_with_queue(
    store: Arc<dyn OperationStore>,
    queue: Arc<dyn csvstage::TaskQueue>,
    size_to_defer: usize,
) -> DeferredProcessor<DummyHandler> {
    DeferredProcessor::new(
        dummy_processor(),
        DeferredOptions::new(CLASS_NAME, UNIQUE_ID).size_to_defer(size_to_defer),
        store,
        queue,
        Arc::new(StaticIdentity("ziggy".to_string())),
    )
    .unwrap()
}

#[tokio::test]
async fn test_small_commit_runs_inline() {
    let memory = Arc::new(MemoryOperationStore::new());
    let store: Arc<dyn OperationStore> = memory.clone();
    let queue = Arc::new(InlineTaskQueue::new(
        Arc::clone(&store),
        Arc::new(dummy_registry()),
    ));
    let mut p = deferred_with_queue(store.clone(), queue, 1);

    p.process_file(source(b"foo,bar\r\n1,1\r\n"), true)
        .await
        .unwrap();
    let status = p.status();
    assert_eq!(status.saved, 1);
    assert!(!status.waiting);
    assert!(status.result_id.is_none());
    // Inline commit writes exactly one record.
    assert_eq!(memory.len(), 1);
    assert!(store.latest(CLASS_NAME, UNIQUE_ID).await.unwrap().is_some());
}

#[tokio::test]
async fn test_large_commit_is_deferred() {
    let memory = Arc::new(MemoryOperationStore::new());
    let store: Arc<dyn OperationStore> = memory.clone();
    let queue = Arc::new(InlineTaskQueue::new(
        Arc::clone(&store),
        Arc::new(dummy_registry()),
    ));
    let mut p = deferred_with_queue(store, queue, 1);

    p.process_file(source(b"foo,bar\r\n1,1\r\n2,2\r\n"), true)
        .await
        .unwrap();
    let status = p.status();
    assert_eq!(status.saved, 2);
    assert!(!status.waiting);
    // Pre-enqueue save, worker pre-commit save, worker final save.
    assert_eq!(memory.len(), 3);
}

#[tokio::test]
async fn test_spawned_commit_completes_on_wait() {
    let memory = Arc::new(MemoryOperationStore::new());
    let store: Arc<dyn OperationStore> = memory.clone();
    let queue = Arc::new(SpawnedTaskQueue::new(
        Arc::clone(&store),
        Arc::new(dummy_registry()),
    ));
    let mut p = deferred_with_queue(store, queue, 0);

    p.process_file(source(b"foo,bar\r\n1,1\r\n2,2\r\n"), true)
        .await
        .unwrap();
    assert!(p.status().waiting);

    let status = p.wait().await.unwrap();
    assert_eq!(status.saved, 2);
    assert!(!status.waiting);
}

#[tokio::test]
async fn test_records_carry_user() {
    let memory = Arc::new(MemoryOperationStore::new());
    let store: Arc<dyn OperationStore> = memory.clone();
    let queue = Arc::new(InlineTaskQueue::new(
        Arc::clone(&store),
        Arc::new(dummy_registry()),
    ));
    let mut p = deferred_with_queue(store.clone(), queue, 1);

    p.process_file(source(b"foo,bar\r\n1,1\r\n2,2\r\n"), true)
        .await
        .unwrap();
    let history = store.history(CLASS_NAME, UNIQUE_ID).await.unwrap();
    assert_eq!(history.len(), 3);
    for record in &history {
        assert_eq!(record.user.as_deref(), Some("ziggy"));
    }
}

#[tokio::test]
async fn test_validation_errors_are_saved() {
    let memory = Arc::new(MemoryOperationStore::new());
    let store: Arc<dyn OperationStore> = memory.clone();
    let queue = Arc::new(InlineTaskQueue::new(
        Arc::clone(&store),
        Arc::new(dummy_registry()),
    ));
    let mut p = deferred_with_queue(store.clone(), queue, 1);

    p.process_file(source(b"foo,bar\r\n3,1\r\n"), true)
        .await
        .unwrap();
    let status = p.status();
    assert_eq!(status.error_messages, vec!["3 not allowed"]);
    let error_id = status.saved_error_id.unwrap();
    let record = store.get(error_id).await.unwrap().unwrap();
    assert_eq!(record.operation.as_str(), "error");
}

#[tokio::test]
async fn test_committed_history_summaries() {
    let memory = Arc::new(MemoryOperationStore::new());
    let store: Arc<dyn OperationStore> = memory.clone();
    let queue = Arc::new(InlineTaskQueue::new(
        Arc::clone(&store),
        Arc::new(dummy_registry()),
    ));
    let mut p = deferred_with_queue(store, queue, 1);

    p.process_file(source(b"foo,bar\r\n1,1\r\n2,2\r\n"), true)
        .await
        .unwrap();
    let history = p.committed_history().await.unwrap();
    // Only the worker's final save is tagged as a commit.
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].saved_rows, 2);
    assert_eq!(history[0].user.as_deref(), Some("ziggy"));
    assert!(history[0].error_message.is_none());
}

#[tokio::test]
async fn test_load_rejects_wrong_class() {
    let memory = Arc::new(MemoryOperationStore::new());
    let store: Arc<dyn OperationStore> = memory.clone();
    let queue = Arc::new(NullTaskQueue);
    let mut p = deferred_with_queue(store.clone(), queue, 10);

    p.process_file(source(b"foo,bar\r\n1,1\r\n"), true)
        .await
        .unwrap();
    let record = store.latest(CLASS_NAME, UNIQUE_ID).await.unwrap().unwrap();

    let registry = dummy_registry();
    let err = load_processor(&store, &registry, record.id, Some("tests.Other"))
        .await
        .unwrap_err();
    assert!(matches!(err, StageError::TypeMismatch { .. }));

    assert!(load_processor(&store, &registry, record.id, Some(CLASS_NAME))
        .await
        .is_ok());
}

#[tokio::test]
async fn test_retention_purges_aged_records() {
    let memory = Arc::new(MemoryOperationStore::new());
    let store: Arc<dyn OperationStore> = memory.clone();
    store
        .create(OperationRecord {
            id: uuid::Uuid::new_v4(),
            class_name: CLASS_NAME.to_string(),
            unique_id: UNIQUE_ID.to_string(),
            operation: OperationKind::Commit,
            original_filename: "aged.csv".to_string(),
            user: None,
            created_at: chrono::Utc::now() - chrono::Duration::days(30),
            payload: Vec::new(),
        })
        .await
        .unwrap();

    let mut p = DeferredProcessor::new(
        dummy_processor(),
        DeferredOptions::new(CLASS_NAME, UNIQUE_ID)
            .size_to_defer(10)
            .retention_days(7),
        store.clone(),
        Arc::new(NullTaskQueue),
        Arc::new(StaticIdentity("ziggy".to_string())),
    )
    .unwrap();

    p.save(None, None).await.unwrap();
    p.save(None, None).await.unwrap();
    // No purge yet: the aged record plus two fresh ones.
    assert_eq!(memory.len(), 3);

    p.save(None, None).await.unwrap();
    // The third save triggers the purge; only the fresh records survive.
    assert_eq!(memory.len(), 3);
    let history = store.history(CLASS_NAME, UNIQUE_ID).await.unwrap();
    assert!(history.iter().all(|r| r.original_filename != "aged.csv"));
}

#[tokio::test]
async fn test_empty_unique_id_rejected() {
    let store: Arc<dyn OperationStore> = Arc::new(MemoryOperationStore::new());
    let err = DeferredProcessor::new(
        dummy_processor(),
        DeferredOptions::new(CLASS_NAME, ""),
        store,
        Arc::new(NullTaskQueue),
        Arc::new(StaticIdentity("ziggy".to_string())),
    )
    .map(|_| ())
    .unwrap_err();
    assert!(matches!(err, StageError::Config(_)));
}
