use thiserror::Error;

pub type Result<T> = std::result::Result<T, BuildError>;

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("Source path does not exist or is not a directory: {0}")]
    SourceMissing(String),

    #[error("No input files with supported extensions under {0}")]
    NoInputs(String),

    #[error("Destination is already being written (found {0})")]
    DestinationBusy(String),

    #[error("Embedding server unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimMismatch { expected: usize, actual: usize },

    #[error("Embedding response contains non-finite values")]
    NonFiniteVector,

    #[error("Index write failed: {0}")]
    IndexWriteFailed(String),

    #[error("Build config error: {0}")]
    Config(String),

    #[error("Chunking failed for {path}: {source}")]
    Chunking {
        path: String,
        source: cpm_chunker::ChunkerError,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Packet(#[from] cpm_packet::PacketError),
}
