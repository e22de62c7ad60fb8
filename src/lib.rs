//! XFlat Core Storage Engine
//!
//! An embedded document database that persists tables as XML files on local
//! disk and offers transactional reads and writes. The core consists of a
//! cached-document engine (a full table held in memory as a multi-version
//! store, durably dumped to one XML file), a sharded engine that partitions a
//! logical table into cached engines keyed by value intervals, and the
//! table-metadata manager that spins engines up and down on demand.

pub mod id;
pub mod query;
pub mod scaling;
pub mod storage;
pub mod table;
pub mod task;
pub mod txn;

// Re-export main types
pub use query::{Query, RowUpdate};
pub use scaling::{FixedWidthIntervalProvider, Interval, IntervalProvider, ShardedEngine};
pub use storage::{CachedDocumentEngine, DefaultEngineFactory, Engine, EngineDeps, EngineState};
pub use table::{TableConfig, TableMetadata, TableMetadataFactory};
pub use task::TaskPool;
pub use txn::{Isolation, Transaction, TransactionManager, TransactionOptions};

/// Storage engine error type
#[derive(Debug, thiserror::Error)]
pub enum XFlatError {
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("conflicting data in table {table}, row {row}")]
    WriteConflict { table: String, row: String },

    #[error("transaction state error: {0}")]
    TransactionState(String),

    #[error("illegal transaction state: {0}")]
    IllegalTransactionState(String),

    #[error("engine state error: {0}")]
    EngineState(String),

    #[error("conversion error: {0}")]
    Conversion(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("error parsing table document: {0}")]
    XmlParse(#[from] xmltree::ParseError),

    #[error("error writing table document: {0}")]
    XmlWrite(#[from] xmltree::Error),

    #[error("{0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, XFlatError>;

/// Milliseconds since the Unix epoch, used for activity stamps and
/// time-based transaction id allocation.
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
