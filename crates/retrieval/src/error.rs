use thiserror::Error;

pub type Result<T> = std::result::Result<T, RetrievalError>;

#[derive(Error, Debug)]
pub enum RetrievalError {
    #[error("Invalid query input: {0}")]
    InvalidInput(String),

    #[error("Packet payload is missing {0}")]
    MissingPacket(String),

    #[error("No usable index and no way to rebuild one: {0}")]
    NoIndex(String),

    #[error(transparent)]
    Oci(#[from] cpm_oci::OciError),

    #[error(transparent)]
    Embed(#[from] cpm_embeddings::EmbedError),

    #[error(transparent)]
    Packet(#[from] cpm_packet::PacketError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
