use thiserror::Error;

pub type Result<T> = std::result::Result<T, EmbedError>;

#[derive(Error, Debug)]
pub enum EmbedError {
    #[error("Embedding config error: {0}")]
    Config(String),

    #[error("Embedding request rejected (status {status}): {detail}")]
    BadRequest { status: u16, detail: String },

    #[error("Embedding upstream unavailable after {attempts} attempts: {detail}")]
    Upstream { attempts: u32, detail: String },

    #[error("Invalid embedding response: {0}")]
    InvalidResponse(String),

    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimMismatch { expected: usize, actual: usize },
}
