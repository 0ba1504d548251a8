use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum MolidError {
    #[error("invalid InChIKey: {0}")]
    InvalidInchiKey(String),

    #[error("invalid identifier type: {0}")]
    InvalidIdType(String),

    #[error(
        "invalid search mode: {0} (expected offline-basic|offline-advanced|online-only|online-cached)"
    )]
    InvalidMode(String),

    #[error("search mode {mode} does not support identifier type {id_type}")]
    UnsupportedIdType { mode: String, id_type: String },

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse config: {0}")]
    ConfigParse(String),

    #[error("archive listing failed: {0}")]
    Listing(String),

    #[error("transfer request failed: {0}")]
    TransferHttp(String),

    #[error("transfer of {archive} returned status {status}")]
    TransferStatus { archive: String, status: u16 },

    #[error("transfer of {archive} failed after {attempts} attempts: {reason}")]
    TransferExhausted {
        archive: String,
        attempts: usize,
        reason: String,
    },

    #[error("corrupt archive {path}: {reason}")]
    CorruptArchive { path: PathBuf, reason: String },

    #[error("malformed SDF record: {0}")]
    RecordParse(String),

    #[error("store not found at {path} (required for {required_by})")]
    MissingStore { path: PathBuf, required_by: String },

    #[error("store at {0} is locked by another writer")]
    StoreLocked(PathBuf),

    #[error("store write failed: {0}")]
    StoreWrite(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("remote lookup for {identifier} failed: {reason}")]
    RemoteLookup { identifier: String, reason: String },

    #[error("structure conversion failed: {0}")]
    Conversion(String),

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl MolidError {
    /// Errors that abort a single archive while the ingestion run carries on.
    pub fn skips_archive(&self) -> bool {
        matches!(
            self,
            MolidError::TransferHttp(_)
                | MolidError::TransferStatus { .. }
                | MolidError::TransferExhausted { .. }
                | MolidError::CorruptArchive { .. }
                | MolidError::StoreWrite(_)
                | MolidError::Filesystem(_)
        )
    }
}

impl From<rusqlite::Error> for MolidError {
    fn from(err: rusqlite::Error) -> Self {
        MolidError::Store(err.to_string())
    }
}
