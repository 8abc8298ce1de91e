//! Staged CSV processing engine.
//!
//! A CSV file is decoded into rows, each row is validated and transformed,
//! valid rows are staged, and the stage is later committed (with optional
//! undo rows for rollback) or discarded. Large commits can be handed off to
//! an asynchronous worker through a durable state snapshot.
//!
//! # Overview
//!
//! - **Codec** ([`codec`]): header-first CSV decode/encode.
//! - **Pipeline** ([`processor`]): validate → preprocess → stage, plus the
//!   commit/rollback engine and per-row result tracking ([`results`]).
//! - **Checksum** ([`checksum`]): tamper-evident digests over locked columns.
//! - **Deferral** ([`defer`], [`snapshot`], [`store`]): snapshot the
//!   processor, persist it as an operation record, and resume the commit in
//!   a worker.
//!
//! # Example
//!
//! ```no_run
//! use csvstage::{CsvProcessor, CsvSource, ProcessorConfig, RowHandler};
//!
//! struct Noop;
//! impl RowHandler for Noop {}
//!
//! let config = ProcessorConfig {
//!     columns: vec!["foo".into(), "bar".into()],
//!     required_columns: vec!["foo".into()],
//!     ..ProcessorConfig::default()
//! };
//! let mut processor = CsvProcessor::new(config, Noop);
//! let source = CsvSource::from_bytes(b"foo,bar\r\n1,2\r\n".to_vec(), "import.csv");
//! processor.process_file(source, true).unwrap();
//! let status = processor.status();
//! assert_eq!(status.total, 1);
//! ```

pub mod checksum;
pub mod codec;
pub mod defer;
pub mod error;
pub mod processor;
pub mod results;
pub mod row;
pub mod snapshot;
pub mod store;

// Re-export commonly used types
pub use checksum::{row_checksum, ChecksumConfig, ChecksumValidator};
pub use defer::{
    load_processor, run_deferred_commit, CommitTask, DeferredOptions, DeferredProcessor,
    IdentityContext, InlineTaskQueue, NoIdentity, NullTaskQueue, OperationSummary,
    ProcessorRegistry, ResumableCommit, SpawnedTaskQueue, StaticIdentity, TaskHandle, TaskQueue,
};
pub use error::{Result, StageError, ValidationError};
pub use processor::{CommitOutcome, CsvProcessor, CsvSource, ProcessorConfig, RowHandler};
pub use results::{ErrorLog, ProcessStatus, RowResult, RowStatus};
pub use row::Row;
pub use snapshot::ProcessorSnapshot;
pub use store::{MemoryOperationStore, OperationKind, OperationRecord, OperationStore};
