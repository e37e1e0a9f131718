use thiserror::Error;

pub type Result<T> = std::result::Result<T, OciError>;

#[derive(Error, Debug)]
pub enum OciError {
    #[error("Invalid OCI reference '{reference}': {reason}")]
    InvalidRef { reference: String, reason: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Registry authentication required for {0}")]
    AuthRequired(String),

    #[error("Registry rate limited: {0}")]
    RateLimited(String),

    #[error("Registry unavailable after {attempts} attempts: {detail}")]
    UpstreamUnavailable { attempts: u32, detail: String },

    #[error("Policy denied: {0}")]
    PolicyDenied(String),

    #[error("Digest mismatch for {reference}: expected {expected}, got {actual}")]
    DigestMismatch {
        reference: String,
        expected: String,
        actual: String,
    },

    #[error("Unsafe path in artifact: {0}")]
    PathUnsafe(String),

    #[error("Packet metadata missing or unparseable: {0}")]
    MetadataMissing(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Packet(#[from] cpm_packet::PacketError),
}

impl OciError {
    /// Retry classification per the failure table: only rate limiting and
    /// upstream unavailability are retryable.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited(_) | Self::UpstreamUnavailable { .. }
        )
    }
}
