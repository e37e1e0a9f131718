use thiserror::Error;

pub type Result<T> = std::result::Result<T, PacketError>;

#[derive(Error, Debug)]
pub enum PacketError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid vector dimension: expected {expected}, got {actual}")]
    InvalidDimension { expected: usize, actual: usize },

    #[error("Malformed docs.jsonl at line {line}: {reason}")]
    MalformedDocs { line: usize, reason: String },

    #[error("Malformed vector file {path}: {reason}")]
    MalformedVectors { path: String, reason: String },

    #[error("Malformed index file: {0}")]
    MalformedIndex(String),

    #[error("Malformed manifest: {0}")]
    MalformedManifest(String),

    #[error("{0}")]
    Other(String),
}
