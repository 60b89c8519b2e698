use std::io;
use thiserror::Error;

/// Errors surfaced by the ingestion core.
///
/// Only a few of these abort a whole import run (`NoDecodableSegments`,
/// `InvalidDescriptor`, `Cancelled`). The rest are fatal to one file, one
/// channel or one session and are folded into the run's diagnostics by the
/// import pipeline.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Header parse error in {source_name}: {reason}")]
    HeaderParse { source_name: String, reason: String },

    #[error("Decode integrity error: {0}")]
    DecodeIntegrity(String),

    #[error("Persistence conflict for {key}: {reason}")]
    PersistenceConflict { key: String, reason: String },

    #[error("No decodable segments in import run")]
    NoDecodableSegments,

    #[error("Invalid channel descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Invalid EDF+ layout: {0}")]
    InvalidFormat(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Import cancelled")]
    Cancelled,
}

impl IngestError {
    pub(crate) fn header(source_name: &str, reason: impl Into<String>) -> Self {
        IngestError::HeaderParse {
            source_name: source_name.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn integrity(reason: impl Into<String>) -> Self {
        IngestError::DecodeIntegrity(reason.into())
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;
