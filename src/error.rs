//! Error types for parcela.

use std::path::PathBuf;

/// Result type alias for parcela operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in parcela operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// I/O error during file operations.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        /// The path where the error occurred, if known.
        path: Option<PathBuf>,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Arrow error during data processing.
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// Parquet error during file operations.
    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    /// JSON error while reading or writing persisted fill, prep or generator specs.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Column not found in schema.
    #[error("Column '{name}' not found in schema")]
    ColumnNotFound {
        /// The name of the missing column.
        name: String,
    },

    /// Invalid configuration.
    #[error("Invalid configuration: {message}")]
    InvalidConfig {
        /// Description of the configuration error.
        message: String,
    },

    /// Schema mismatch between pieces or batches.
    #[error("Schema mismatch: {message}")]
    SchemaMismatch {
        /// Description of the schema mismatch.
        message: String,
    },

    /// A numeric statistic or scaler was requested on a non-numeric column.
    #[error("Column '{column}' is not numeric (type: {data_type})")]
    NotNumeric {
        /// The offending column.
        column: String,
        /// Its data type, rendered.
        data_type: String,
    },

    /// Fitting a null-fill or prep failed.
    #[error("Fitting error: {message}")]
    Fitting {
        /// Description of the fitting error.
        message: String,
    },

    /// A partition-key filter selected no piece.
    #[error("No piece paths satisfy filter criteria: {message}")]
    NoMatchingPieces {
        /// The filter conditions, rendered.
        message: String,
    },

    /// A piece could not be fetched or decoded after all retry attempts.
    #[error("Piece '{piece}' unavailable after {attempts} attempt(s): {source}")]
    PieceUnavailable {
        /// The piece path.
        piece: String,
        /// How many attempts were made.
        attempts: u32,
        /// The last underlying error.
        #[source]
        source: Box<Error>,
    },

    /// A mapper in the transform chain failed on a piece.
    #[error("Transform #{index} failed on piece '{piece}': {source}")]
    PieceTransform {
        /// The piece path.
        piece: String,
        /// Position of the failing mapper in the chain.
        index: usize,
        /// The underlying error.
        #[source]
        source: Box<Error>,
    },

    /// A generated batch array contained NaN values in debug mode.
    #[error("Batch group #{group} with shape {shape:?} contains {count} NaN value(s)")]
    NanInBatch {
        /// Column group index.
        group: usize,
        /// Shape of the offending array.
        shape: Vec<usize>,
        /// Number of NaN values.
        count: usize,
    },

    /// Backend storage error.
    #[error("Storage backend error: {message}")]
    Storage {
        /// Description of the storage error.
        message: String,
    },

    /// Transform error.
    #[error("Transform error: {message}")]
    Transform {
        /// Description of the transform error.
        message: String,
    },

    /// Parse error.
    #[error("Parse error: {message}")]
    Parse {
        /// Description of the parse error.
        message: String,
    },

    /// Data error.
    #[error("Data error: {message}")]
    Data {
        /// Description of the data error.
        message: String,
    },

    /// Empty dataset error.
    #[error("Dataset is empty")]
    EmptyDataset,
}

impl Error {
    /// Create an I/O error with a path context.
    pub fn io(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        Self::Io {
            path: Some(path.into()),
            source,
        }
    }

    /// Create a column not found error.
    pub fn column_not_found(name: impl Into<String>) -> Self {
        Self::ColumnNotFound { name: name.into() }
    }

    /// Create an invalid configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create a schema mismatch error.
    pub fn schema_mismatch(message: impl Into<String>) -> Self {
        Self::SchemaMismatch {
            message: message.into(),
        }
    }

    /// Create a not-numeric error for a column.
    pub fn not_numeric(column: impl Into<String>, data_type: impl std::fmt::Display) -> Self {
        Self::NotNumeric {
            column: column.into(),
            data_type: data_type.to_string(),
        }
    }

    /// Create a fitting error.
    pub fn fitting(message: impl Into<String>) -> Self {
        Self::Fitting {
            message: message.into(),
        }
    }

    /// Create a no-matching-pieces error.
    pub fn no_matching_pieces(message: impl Into<String>) -> Self {
        Self::NoMatchingPieces {
            message: message.into(),
        }
    }

    /// Wrap an error as a piece-unavailable failure.
    pub fn piece_unavailable(piece: impl Into<String>, attempts: u32, source: Error) -> Self {
        Self::PieceUnavailable {
            piece: piece.into(),
            attempts,
            source: Box::new(source),
        }
    }

    /// Wrap an error raised by mapper `index` while processing `piece`.
    pub fn piece_transform(piece: impl Into<String>, index: usize, source: Error) -> Self {
        Self::PieceTransform {
            piece: piece.into(),
            index,
            source: Box::new(source),
        }
    }

    /// Create a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Create a transform error.
    pub fn transform(message: impl Into<String>) -> Self {
        Self::Transform {
            message: message.into(),
        }
    }

    /// Create a parse error.
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
        }
    }

    /// Create a data error.
    pub fn data(message: impl Into<String>) -> Self {
        Self::Data {
            message: message.into(),
        }
    }

    /// Returns true if the error means a piece could not be read at all,
    /// as opposed to a transform failing on data that was read.
    pub fn is_piece_unavailable(&self) -> bool {
        matches!(self, Self::PieceUnavailable { .. })
    }

    /// Returns true for errors worth retrying when fetching or decoding a piece.
    pub(crate) fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Io { .. } | Self::Storage { .. } | Self::Parquet(_)
        )
    }
}
