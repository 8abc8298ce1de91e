//! Validation/staging pipeline and commit/rollback engine
//!
//! [`CsvProcessor`] drives a file through validate → preprocess → stage,
//! then applies the staged rows through a consumer-supplied [`RowHandler`]
//! on commit. Row application failures never abort the batch; they are
//! logged, recorded against the row, and the drain continues.

use std::collections::VecDeque;
use std::io::{Read, Write};

use serde_json::{Map, Value};

use crate::codec::{self, RowReader};
use crate::error::{Result, ValidationError};
use crate::results::{percentage, ErrorLog, ProcessStatus, RowResult, RowStatus};
use crate::row::Row;
use crate::snapshot::{ProcessorSnapshot, SNAPSHOT_VERSION};

/// Default input size limit: 2 MiB
pub const DEFAULT_MAX_FILE_SIZE: u64 = 2 * 1024 * 1024;

/// What happened when a staged row was applied.
#[derive(Debug, Clone)]
pub enum CommitOutcome {
    /// The row was persisted; `undo` optionally carries an inverse row for
    /// rollback.
    Saved { undo: Option<Row> },
    /// The row was intentionally not persisted.
    Skipped,
}

/// Consumer-supplied row strategy.
///
/// `process_row` is the one method most consumers implement; the rest have
/// pass-through defaults. Validation and preprocessing may only fail with
/// [`ValidationError`]; the signatures admit nothing else. `process_row`
/// failures, by contrast, are caught per row during commit.
pub trait RowHandler: Send {
    /// Validate the fields of one row.
    fn validate_row(&self, _row: &Row) -> std::result::Result<(), ValidationError> {
        Ok(())
    }

    /// Transform a validated row before staging. Returning `Ok(None)` skips
    /// the row without error ("no action").
    fn preprocess_row(&self, row: Row) -> std::result::Result<Option<Row>, ValidationError> {
        Ok(Some(row))
    }

    /// Apply one staged row to its destination.
    fn process_row(&mut self, _row: &Row) -> anyhow::Result<CommitOutcome> {
        Ok(CommitOutcome::Skipped)
    }

    /// Adjust a row just before it is written to an export file.
    fn preprocess_export_row(&self, _row: &mut Row) {}

    /// Rows to write when exporting without an explicit row override.
    fn rows_to_export(&self) -> Vec<Row> {
        Vec::new()
    }
}

/// Typed processor configuration.
///
/// `extra` is a free-form bag for consumer state that should survive a
/// snapshot/restore round trip.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Default output column list for exports
    pub columns: Vec<String>,
    /// Columns that must be present in the input header
    pub required_columns: Vec<String>,
    /// Maximum input size in bytes; 0 disables the check
    pub max_file_size: u64,
    /// Consumer-defined fields carried through snapshots
    pub extra: Map<String, Value>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            columns: Vec::new(),
            required_columns: Vec::new(),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            extra: Map::new(),
        }
    }
}

/// An input stream with a filename and an optional size hint.
///
/// The size hint feeds the file-size check; streams without one skip it.
/// The reader is dropped (closed) when processing finishes.
pub struct CsvSource<R> {
    pub reader: R,
    pub filename: String,
    pub size: Option<u64>,
}

impl<R: Read> CsvSource<R> {
    pub fn new(reader: R, filename: impl Into<String>) -> Self {
        Self {
            reader,
            filename: filename.into(),
            size: None,
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }
}

impl CsvSource<std::io::Cursor<Vec<u8>>> {
    /// In-memory source; the size hint is the buffer length.
    pub fn from_bytes(bytes: Vec<u8>, filename: impl Into<String>) -> Self {
        let size = bytes.len() as u64;
        Self {
            reader: std::io::Cursor::new(bytes),
            filename: filename.into(),
            size: Some(size),
        }
    }
}

impl CsvSource<std::fs::File> {
    /// Open a file on disk, taking the size hint from its metadata.
    pub fn open(path: impl AsRef<std::path::Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)?;
        let size = file.metadata().map(|m| m.len()).ok();
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self {
            reader: file,
            filename,
            size,
        })
    }
}

/// Staged CSV processor.
///
/// Owns the staging and rollback queues for one logical request; not
/// reentrant and not internally locked.
pub struct CsvProcessor<H> {
    config: ProcessorConfig,
    handler: H,
    filename: String,
    input_columns: Vec<String>,
    total_rows: u64,
    processed_rows: u64,
    saved_rows: u64,
    stage: VecDeque<(u64, Row)>,
    rollback_rows: VecDeque<(u64, Row)>,
    result_data: Vec<RowResult>,
    error_messages: ErrorLog,
}

impl<H: RowHandler> CsvProcessor<H> {
    pub fn new(config: ProcessorConfig, handler: H) -> Self {
        Self {
            config,
            handler,
            filename: String::new(),
            input_columns: Vec::new(),
            total_rows: 0,
            processed_rows: 0,
            saved_rows: 0,
            stage: VecDeque::new(),
            rollback_rows: VecDeque::new(),
            result_data: Vec::new(),
            error_messages: ErrorLog::new(),
        }
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Column names decoded from the input header, in file order. Empty
    /// until a file has been read.
    pub fn input_columns(&self) -> &[String] {
        &self.input_columns
    }

    /// Number of rows currently staged for commit.
    pub fn staged_len(&self) -> usize {
        self.stage.len()
    }

    /// Record an error message. Row 0 marks a file-level error.
    pub fn add_error(&mut self, message: impl Into<String>, row: u64) {
        self.error_messages.add(message, row);
    }

    /// Errors recorded so far, keyed by message.
    pub fn error_log(&self) -> &ErrorLog {
        &self.error_messages
    }

    /// True iff there is staged data and no recorded errors.
    pub fn can_commit(&self) -> bool {
        !self.stage.is_empty() && self.error_messages.is_empty()
    }

    /// Read the file, validating and preprocessing each row.
    ///
    /// With `autocommit` the staged rows are committed immediately, but only
    /// if [`can_commit`](Self::can_commit) holds; otherwise the stage is
    /// left for a later explicit [`commit`](Self::commit).
    pub fn process_file<R: Read>(&mut self, source: CsvSource<R>, autocommit: bool) -> Result<()> {
        self.filename = source.filename.clone();
        match self.open_reader(source) {
            Ok(reader) => {
                self.input_columns = reader.headers().to_vec();
                self.preprocess_file(reader)?;
            }
            Err(e) => self.add_error(e.to_string(), 0),
        }
        if autocommit && self.can_commit() {
            self.commit();
        }
        Ok(())
    }

    /// File-level validation: size limit, header readability, required
    /// columns. Failure aborts before any data row is read.
    fn open_reader<R: Read>(
        &self,
        source: CsvSource<R>,
    ) -> std::result::Result<RowReader<R>, ValidationError> {
        if let Some(size) = source.size {
            if self.config.max_file_size > 0 && size > self.config.max_file_size {
                return Err(ValidationError::new(format!(
                    "The CSV file must be under {} bytes",
                    self.config.max_file_size
                )));
            }
        }
        let reader = RowReader::new(source.reader)?;
        for column in &self.config.required_columns {
            if !reader.headers().contains(column) {
                return Err(ValidationError::new(format!("Missing column: {column}")));
            }
        }
        Ok(reader)
    }

    /// Run the per-row state machine over every data row, building the
    /// result snapshot and the stage queue.
    pub fn preprocess_file<R: Read>(&mut self, reader: RowReader<R>) -> Result<()> {
        let mut rownum: u64 = 0;
        let mut processed: u64 = 0;
        let mut snapshot = Vec::new();
        for item in reader {
            let row = item?;
            rownum += 1;
            let outcome = self
                .handler
                .validate_row(&row)
                .and_then(|()| self.handler.preprocess_row(row.clone()));
            match outcome {
                Ok(Some(staged_row)) => {
                    self.stage.push_back((rownum, staged_row));
                    processed += 1;
                    snapshot.push(RowResult::success(row));
                }
                Ok(None) => snapshot.push(RowResult::no_action(row)),
                Err(e) => {
                    self.error_messages.add(e.to_string(), rownum);
                    snapshot.push(RowResult::failure(row, e.to_string()));
                }
            }
        }
        self.result_data = snapshot;
        self.total_rows = rownum;
        self.processed_rows = processed;
        Ok(())
    }

    /// Drain the stage queue in FIFO order, applying each row.
    ///
    /// A failing row is recorded and skipped; the remaining queue is still
    /// processed. Check [`status`](Self::status) for the outcome.
    pub fn commit(&mut self) {
        let mut saved: u64 = 0;
        while let Some((rownum, row)) = self.stage.pop_front() {
            match self.handler.process_row(&row) {
                Ok(CommitOutcome::Saved { undo }) => {
                    saved += 1;
                    if let Some(undo_row) = undo {
                        self.rollback_rows.push_back((rownum, undo_row));
                    }
                }
                Ok(CommitOutcome::Skipped) => {}
                Err(e) => {
                    tracing::error!(row = rownum, error = %e, "Failed to apply staged row");
                    self.record_row_failure(rownum, e.to_string());
                }
            }
        }
        self.saved_rows = saved;
        tracing::info!(saved, file = %self.filename, "Committed staged rows");
    }

    /// Drain the rollback queue in FIFO order, re-applying each undo row.
    ///
    /// Afterwards the saved-row counter reflects only this pass. Undo rows
    /// must not produce further rollback entries; any returned here are
    /// dropped.
    pub fn rollback(&mut self) {
        let mut saved: u64 = 0;
        while let Some((rownum, row)) = self.rollback_rows.pop_front() {
            match self.handler.process_row(&row) {
                Ok(CommitOutcome::Saved { .. }) => saved += 1,
                Ok(CommitOutcome::Skipped) => {}
                Err(e) => {
                    tracing::error!(row = rownum, error = %e, "Failed to roll back row");
                    self.record_row_failure(rownum, e.to_string());
                }
            }
        }
        self.saved_rows = saved;
        tracing::info!(saved, file = %self.filename, "Rolled back rows");
    }

    fn record_row_failure(&mut self, rownum: u64, message: String) {
        self.error_messages.add(message.clone(), rownum);
        if let Some(result) = self.result_data.get_mut((rownum as usize).saturating_sub(1)) {
            result.error = message;
            result.status = RowStatus::Failure;
        }
    }

    /// Aggregate status of the current pass. Idempotent.
    pub fn status(&self) -> ProcessStatus {
        ProcessStatus {
            total: self.total_rows,
            processed: self.processed_rows,
            saved: self.saved_rows,
            error_rows: self
                .result_data
                .iter()
                .filter(|r| !r.error.is_empty())
                .cloned()
                .collect(),
            error_messages: self.error_messages.messages(),
            percentage: percentage(self.saved_rows, self.total_rows),
            can_commit: self.can_commit(),
            result_id: None,
            saved_error_id: None,
            waiting: false,
        }
    }

    /// Lazy CSV line iterator: header first, then one line per row, each
    /// passed through the handler's export hook.
    ///
    /// `rows`/`columns` default to the handler's export rows and the
    /// configured column list.
    pub fn export_lines(
        &self,
        rows: Option<Vec<Row>>,
        columns: Option<Vec<String>>,
    ) -> impl Iterator<Item = String> + '_ {
        let columns = columns.unwrap_or_else(|| self.config.columns.clone());
        let rows = rows.unwrap_or_else(|| self.handler.rows_to_export());
        self.lines_iter(columns, rows)
    }

    /// Error-report variant of [`export_lines`](Self::export_lines): two
    /// synthetic columns, `status` and `error`, are appended to every row,
    /// and rows default to the result snapshot.
    pub fn export_error_lines(
        &self,
        columns: Option<Vec<String>>,
    ) -> impl Iterator<Item = String> + '_ {
        let mut columns = columns.unwrap_or_else(|| self.config.columns.clone());
        columns.push("status".to_string());
        columns.push("error".to_string());
        let rows = self
            .result_data
            .iter()
            .map(|r| {
                let mut fields = r.fields.clone();
                fields.insert("status".to_string(), Value::String(r.status.as_str().to_string()));
                fields.insert("error".to_string(), Value::String(r.error.clone()));
                fields
            })
            .collect();
        self.lines_iter(columns, rows)
    }

    fn lines_iter(
        &self,
        columns: Vec<String>,
        rows: Vec<Row>,
    ) -> impl Iterator<Item = String> + '_ {
        let header = codec::header_line(&columns);
        std::iter::once(header).chain(rows.into_iter().map(move |mut row| {
            self.handler.preprocess_export_row(&mut row);
            codec::encode_line(&columns, &row)
        }))
    }

    /// Write export lines to a sink.
    pub fn write_file<W: Write>(
        &self,
        sink: &mut W,
        rows: Option<Vec<Row>>,
        columns: Option<Vec<String>>,
    ) -> std::io::Result<()> {
        for line in self.export_lines(rows, columns) {
            sink.write_all(line.as_bytes())?;
        }
        Ok(())
    }

    /// Capture the full resumable state under the given type identity.
    pub fn to_snapshot(&self, class_name: impl Into<String>) -> ProcessorSnapshot {
        ProcessorSnapshot {
            version: SNAPSHOT_VERSION,
            class_name: class_name.into(),
            filename: self.filename.clone(),
            input_columns: self.input_columns.clone(),
            total_rows: self.total_rows,
            processed_rows: self.processed_rows,
            saved_rows: self.saved_rows,
            stage: self.stage.clone(),
            rollback_rows: self.rollback_rows.clone(),
            result_data: self.result_data.clone(),
            error_messages: self.error_messages.clone(),
            extra: self.config.extra.clone(),
        }
    }

    /// Rebuild a processor from a snapshot. Continuing a commit from the
    /// restored instance behaves exactly as it would have on the original.
    pub fn from_snapshot(mut config: ProcessorConfig, handler: H, snapshot: ProcessorSnapshot) -> Self {
        config.extra = snapshot.extra;
        Self {
            config,
            handler,
            filename: snapshot.filename,
            input_columns: snapshot.input_columns,
            total_rows: snapshot.total_rows,
            processed_rows: snapshot.processed_rows,
            saved_rows: snapshot.saved_rows,
            stage: snapshot.stage,
            rollback_rows: snapshot.rollback_rows,
            result_data: snapshot.result_data,
            error_messages: snapshot.error_messages,
        }
    }
}
