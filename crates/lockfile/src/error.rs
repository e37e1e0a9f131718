use thiserror::Error;

pub type Result<T> = std::result::Result<T, LockfileError>;

#[derive(Error, Debug)]
pub enum LockfileError {
    #[error("Lockfile plan mismatch:\n{0}")]
    PlanMismatch(String),

    #[error("Frozen-lockfile violation: {0}")]
    FrozenDeterminismViolation(String),

    #[error("Lockfile not found at {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Packet(#[from] cpm_packet::PacketError),
}
