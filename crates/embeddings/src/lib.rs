//! Embedding client used by the builder and the retrieval engine.
//!
//! The wire protocol is an external collaborator; this crate only promises
//! `embed(texts) → matrix` row-aligned to the input, with the backend either
//! the OpenAI-compatible HTTP transport or a deterministic stub.

pub mod config;
pub mod error;
pub mod http;
pub mod stub;
pub mod types;

pub use config::{redact_url, EmbedConfig, DEFAULT_BATCH_SIZE, DEFAULT_EMBED_TIMEOUT};
pub use error::{EmbedError, Result};
pub use http::HttpEmbedder;
pub use stub::{stub_embed, StubEmbedder};
pub use types::{apply_normalization, EmbedHints, EmbedMatrix, NormalizationMode, NORM_TOLERANCE};

enum Backend {
    Http(HttpEmbedder),
    Stub(StubEmbedder),
}

/// Embedding client with a swappable backend.
pub struct EmbeddingClient {
    backend: Backend,
    model: String,
    normalization: NormalizationMode,
    max_seq_length: Option<u32>,
}

impl EmbeddingClient {
    pub fn http(config: EmbedConfig) -> Result<Self> {
        let model = config.model.clone();
        let normalization = config.normalization;
        let max_seq_length = config.max_seq_length;
        Ok(Self {
            backend: Backend::Http(HttpEmbedder::new(config)?),
            model,
            normalization,
            max_seq_length,
        })
    }

    /// Deterministic offline backend (tests, `stub` embedding mode).
    #[must_use]
    pub fn stub(dimension: usize, model: impl Into<String>) -> Self {
        Self {
            backend: Backend::Stub(StubEmbedder::new(dimension)),
            model: model.into(),
            normalization: NormalizationMode::Client,
            max_seq_length: Some(1024),
        }
    }

    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    #[must_use]
    pub const fn max_seq_length(&self) -> Option<u32> {
        self.max_seq_length
    }

    #[must_use]
    pub fn mode_id(&self) -> &'static str {
        match &self.backend {
            Backend::Http(_) => "http",
            Backend::Stub(_) => "stub",
        }
    }

    /// Stub-only batch counter, for reuse assertions in tests.
    #[must_use]
    pub fn stub_batch_calls(&self) -> Option<usize> {
        match &self.backend {
            Backend::Stub(stub) => Some(stub.batch_calls()),
            Backend::Http(_) => None,
        }
    }

    pub async fn health(&self) -> bool {
        match &self.backend {
            Backend::Http(http) => http.health().await,
            Backend::Stub(_) => true,
        }
    }

    /// Embed texts and apply the configured normalization mode. The result
    /// is row-aligned to the input.
    pub async fn embed_batch(&self, texts: &[String], hints: &EmbedHints) -> Result<EmbedMatrix> {
        let mut matrix = match &self.backend {
            Backend::Http(http) => http.embed_batch(texts, hints).await?,
            Backend::Stub(stub) => stub.embed_batch(texts),
        };
        apply_normalization(&mut matrix, self.normalization);
        Ok(matrix)
    }

    pub async fn embed_one(&self, text: &str, hints: &EmbedHints) -> Result<Vec<f32>> {
        let matrix = self.embed_batch(&[text.to_string()], hints).await?;
        matrix
            .rows
            .into_iter()
            .next()
            .ok_or_else(|| EmbedError::InvalidResponse("empty embedding result".to_string()))
    }
}
