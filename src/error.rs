use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Source unavailable at {path}: {reason}")]
    SourceUnavailable { path: PathBuf, reason: String },

    #[error("Table not found in source: {0}")]
    TableNotFound(String),

    #[error("Column '{column}' not found in table '{table}'")]
    ColumnNotFound { table: String, column: String },

    #[error("Entity key column '{column}' has {nulls} missing and {duplicates} duplicate values")]
    DuplicateEntityKey {
        column: String,
        nulls: usize,
        duplicates: usize,
    },

    #[error("Residual missing data in columns: {}", .columns.join(", "))]
    ResidualMissingData { columns: Vec<String> },

    #[error("Row count mismatch: expected {expected} rows, found {actual}")]
    RowCountMismatch { expected: usize, actual: usize },

    #[error("Schema drift, output is missing columns: {}", .missing.join(", "))]
    SchemaDrift { missing: Vec<String> },

    #[error("Persistence failure writing {target}: {reason}")]
    PersistenceFailure { target: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),
}

impl PipelineError {
    /// Short, stable label used for metrics and log fields
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::SourceUnavailable { .. } => "source_unavailable",
            PipelineError::TableNotFound(_) => "table_not_found",
            PipelineError::ColumnNotFound { .. } => "column_not_found",
            PipelineError::DuplicateEntityKey { .. } => "duplicate_entity_key",
            PipelineError::ResidualMissingData { .. } => "residual_missing_data",
            PipelineError::RowCountMismatch { .. } => "row_count_mismatch",
            PipelineError::SchemaDrift { .. } => "schema_drift",
            PipelineError::PersistenceFailure { .. } => "persistence_failure",
            PipelineError::Config(_) => "config",
            PipelineError::Io(_) => "io",
            PipelineError::Sqlite(_) => "sqlite",
            PipelineError::Csv(_) => "csv",
            PipelineError::Toml(_) => "toml",
        }
    }

    pub(crate) fn persistence(target: impl Into<String>, reason: impl ToString) -> Self {
        PipelineError::PersistenceFailure {
            target: target.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
