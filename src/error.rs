use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum KiraError {
    #[error("{file}:{line}: {message}")]
    Parse {
        file: String,
        line: usize,
        message: String,
    },

    #[error("failed to read {0}")]
    FileRead(PathBuf),

    #[error("data integrity error: {0}")]
    DataIntegrity(String),

    #[error("empty input: {0}")]
    EmptyInput(String),

    #[error("store already contains {0} cells; ingest into a fresh directory")]
    StoreNotEmpty(usize),

    #[error("directory is not an expression matrix store: {0}")]
    IncompatibleStore(String),

    #[error("store is locked by another process: {0}")]
    StoreLocked(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("invalid option: {0}")]
    InvalidOption(String),

    #[error("invalid pattern: {0}")]
    InvalidPattern(String),

    #[error("unknown metadata key: {0}")]
    UnknownMetadataKey(String),

    #[error("cell not found: {0}")]
    CellNotFound(String),

    #[error("gene set does not exist: {0}")]
    GeneSetNotFound(String),

    #[error("cell set does not exist: {0}")]
    CellSetNotFound(String),

    #[error("set already exists: {0}")]
    SetExists(String),

    #[error("similar pairs already exist: {0}")]
    SimilarPairsExists(String),

    #[error("similar pairs not found: {0}")]
    SimilarPairsNotFound(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl KiraError {
    pub(crate) fn parse(file: impl Into<String>, line: usize, message: impl Into<String>) -> Self {
        KiraError::Parse {
            file: file.into(),
            line,
            message: message.into(),
        }
    }
}
