//! Error types for the rrdkit round-robin database.

use thiserror::Error;

/// The main error type for all rrdkit operations.
///
/// Each variant wraps the error family of one operation so callers can match
/// on the family (`RrdError::Update(..)`) or on the precise condition inside it.
#[derive(Error, Debug)]
pub enum RrdError {
    /// Error creating an archive.
    #[error("create error: {0}")]
    Create(#[from] CreateError),

    /// Error applying an update (write path).
    #[error("update error: {0}")]
    Update(#[from] UpdateError),

    /// Error during fetch or archive selection (read path).
    #[error("query error: {0}")]
    Query(#[from] QueryError),

    /// Error parsing or resolving an RPN expression.
    #[error("expression error: {0}")]
    Expr(#[from] ExprError),

    /// Error reading or writing the archive file.
    #[error("file I/O error: {0}")]
    FileIo(#[from] FileIoError),

    /// Error reported by the rendering collaborator.
    #[error("render error: {0}")]
    Render(#[from] RenderError),
}

/// Errors that can occur when creating an archive.
#[derive(Error, Debug)]
pub enum CreateError {
    /// The creation parameters are malformed. No file was written.
    #[error("invalid archive spec: {reason}")]
    InvalidSpec {
        /// Description of what was invalid.
        reason: String,
    },

    /// An archive already exists at the path and overwrite was not requested.
    #[error("archive '{path}' already exists")]
    AlreadyExists {
        /// The colliding archive path.
        path: String,
    },
}

impl CreateError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidSpec {
            reason: reason.into(),
        }
    }
}

/// Errors that can occur while ingesting updates.
#[derive(Error, Debug)]
pub enum UpdateError {
    /// The update is not newer than the last applied update.
    #[error("illegal update at {timestamp}: last update was at {last_update} (minimum one second step)")]
    NonMonotonicUpdate {
        /// Timestamp of the rejected update.
        timestamp: u64,
        /// Last update time of the archive.
        last_update: u64,
    },

    /// A cached update was overtaken by data applied after it was cached.
    #[error("cached update at {timestamp} is stale: archive already updated to {last_update}")]
    StaleUpdate {
        /// Timestamp of the stale cached update.
        timestamp: u64,
        /// Last update time of the archive when the flush began.
        last_update: u64,
    },

    /// The number of values does not match the number of input data sources.
    #[error("expected {expected} values, got {actual}")]
    ValueCount {
        /// Number of non-COMPUTE data sources.
        expected: usize,
        /// Number of values supplied.
        actual: usize,
    },

    /// A value cannot be stored.
    #[error("invalid value {value} for data source '{data_source}': {reason}")]
    InvalidValue {
        /// The data source the value was supplied for.
        data_source: String,
        /// The rejected value.
        value: f64,
        /// Why the value was rejected.
        reason: String,
    },

    /// A template named a data source that does not exist or is computed.
    #[error("unknown input data source '{name}'")]
    UnknownDataSource {
        /// The name from the template.
        name: String,
    },
}

/// Errors that can occur during fetch operations (read path).
#[derive(Error, Debug)]
pub enum QueryError {
    /// No archive uses the requested consolidation function.
    #[error("no archive matches consolidation function {cf}")]
    NoMatchingArchive {
        /// The requested consolidation function.
        cf: String,
    },

    /// The time range is invalid (start >= end).
    #[error("invalid time range: start {start} >= end {end}")]
    InvalidTimeRange {
        /// The start time.
        start: u64,
        /// The end time.
        end: u64,
    },

    /// A data source named by a query does not exist in the archive.
    #[error("archive '{path}' has no data source '{name}'")]
    UnknownDataSource {
        /// The archive that was searched.
        path: String,
        /// The missing data source name.
        name: String,
    },
}

/// Errors raised by the RPN evaluator before any series is touched.
#[derive(Error, Debug)]
pub enum ExprError {
    /// The expression is malformed or references something undefined.
    #[error("invalid expression '{expression}': {reason}")]
    InvalidExpression {
        /// The expression text.
        expression: String,
        /// What is wrong with it.
        reason: String,
    },

    /// Definitions reference each other in a cycle.
    #[error("cyclic definition: {}", path.join(" -> "))]
    CyclicExpression {
        /// The names forming the cycle, first name repeated at the end.
        path: Vec<String>,
    },
}

impl ExprError {
    pub(crate) fn invalid(expression: &str, reason: impl Into<String>) -> Self {
        Self::InvalidExpression {
            expression: expression.to_string(),
            reason: reason.into(),
        }
    }
}

/// Errors that can occur while accessing the archive file.
#[derive(Error, Debug)]
pub enum FileIoError {
    /// Failed to open or read the archive file.
    #[error("failed to read archive '{path}': {source}")]
    ReadFailed {
        /// The archive file path.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to create or write the archive file.
    #[error("failed to write archive '{path}': {source}")]
    WriteFailed {
        /// The archive file path.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to sync the archive file to disk.
    #[error("failed to sync archive '{path}' to disk: {source}")]
    SyncFailed {
        /// The archive file path.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The archive file is corrupted or has an invalid format.
    #[error("archive '{path}' is corrupted: {reason}")]
    CorruptedArchive {
        /// The archive file path.
        path: String,
        /// Description of the corruption.
        reason: String,
    },

    /// Failed to encode the definition block.
    #[error("failed to serialize archive definitions: {0}")]
    DefinitionSerialize(#[from] serde_json::Error),
}

/// Errors reported by a [`RenderBackend`](crate::graph::RenderBackend).
#[derive(Error, Debug)]
pub enum RenderError {
    /// The backend failed to produce an image.
    #[error("render backend failed: {reason}")]
    BackendFailed {
        /// Backend-supplied description.
        reason: String,
    },

    /// A directive references a name that is not defined.
    #[error("directive references undefined name '{name}'")]
    UndefinedName {
        /// The unresolved name.
        name: String,
    },

    /// Writing the rendered image failed.
    #[error("failed to write image '{path}': {source}")]
    WriteImage {
        /// The target path.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Type alias for `Result<T, RrdError>`.
pub type Result<T> = std::result::Result<T, RrdError>;
