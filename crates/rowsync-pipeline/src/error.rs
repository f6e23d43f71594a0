//! Error types for the collect, parse and apply stages
//!
//! Per-row problems never appear here: validation failures and parser errors
//! are converted into `ParsedRow::errors` data. Everything in this module is a
//! stage failure that aborts the running stage and is reported to the caller.

use rowsync_common::FileRef;
use thiserror::Error;

use crate::events::Stage;

/// Persistence layer errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database query failed: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A table or column name that cannot be used as an SQL identifier
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// Unique constraint violation
    #[error("{0}")]
    Conflict(String),

    /// The store refused the write
    #[error("Write rejected: {0}")]
    Rejected(String),

    #[error("Transaction already finished")]
    TransactionFinished,

    /// A persisted column holds a value the row model cannot represent
    #[error("Corrupt row: {0}")]
    CorruptRow(String),
}

impl StoreError {
    pub fn conflict(resource_type: &str, identifier: impl std::fmt::Display) -> Self {
        Self::Conflict(format!("{} '{}' already exists", resource_type, identifier))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised while reading an external row source
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Failed to read source: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed delimited source: {0}")]
    Csv(#[from] csv_async::Error),

    #[error("Source line numbers must increase: {previous} then {current}")]
    OutOfOrder { previous: i64, current: i64 },
}

/// Entity materialization errors
#[derive(Error, Debug)]
pub enum EntityError {
    #[error("Entity type '{0}' is not registered")]
    UnknownType(String),

    #[error("Cannot build '{entity_type}' from stored values: {source}")]
    Materialize {
        entity_type: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Entity '{0}' did not serialize to an attribute map")]
    NotAnObject(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Collect stage failures
#[derive(Error, Debug)]
pub enum CollectError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Parse stage failures
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Row parser initialization failed: {0}")]
    Initialization(#[source] anyhow::Error),

    #[error("Row parser rejected chunk ending at line {line}: {source}")]
    ChunkHandler {
        line: i64,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Apply stage failures
#[derive(Error, Debug)]
pub enum ApplyError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Entity(#[from] EntityError),

    /// An inserted entity could not be found again by its unique key
    #[error("Created {entity_type} '{key}' cannot be found by its unique key")]
    MissingIdentifier { entity_type: String, key: String },
}

/// A whole-stage failure as seen by the job runner
#[derive(Error, Debug)]
pub enum StageError {
    #[error("{stage} for {file} is already running")]
    AlreadyRunning { stage: Stage, file: FileRef },

    #[error("{stage} for {file} exceeded its {timeout_secs}s budget")]
    Timeout {
        stage: Stage,
        file: FileRef,
        timeout_secs: u64,
    },

    #[error(transparent)]
    Collect(#[from] CollectError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Apply(#[from] ApplyError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl StageError {
    /// Overlap refusals are not failures of the stage itself
    pub fn is_overlap(&self) -> bool {
        matches!(self, StageError::AlreadyRunning { .. })
    }
}
