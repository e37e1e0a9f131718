//! OpenAI-compatible embeddings transport.
//!
//! Request bodies carry only `{input, model, [dimensions], [user]}`; every
//! semantic hint flows as an `X-Embedding-*` header. 4xx responses are
//! terminal; 5xx and timeouts retry with exponential backoff up to
//! `max_retries`.

use crate::config::{redact_url, EmbedConfig};
use crate::error::{EmbedError, Result};
use crate::types::{EmbedHints, EmbedMatrix};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

pub struct HttpEmbedder {
    config: EmbedConfig,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct WireResponse {
    data: Vec<WireRow>,
}

#[derive(Deserialize)]
struct WireRow {
    index: usize,
    embedding: Vec<f32>,
}

impl HttpEmbedder {
    pub fn new(config: EmbedConfig) -> Result<Self> {
        config.validate()?;
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| EmbedError::Config(format!("failed to build HTTP client: {err}")))?;
        Ok(Self { config, client })
    }

    #[must_use]
    pub const fn config(&self) -> &EmbedConfig {
        &self.config
    }

    /// Best-effort reachability probe; any 2xx counts.
    pub async fn health(&self) -> bool {
        match self.client.get(self.config.health_endpoint()).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    /// Embed a batch of texts; the returned matrix is row-aligned to the
    /// input. Caller-visible batching happens here: inputs are partitioned
    /// by `batch_size` and the partial matrices concatenated in order.
    pub async fn embed_batch(&self, texts: &[String], hints: &EmbedHints) -> Result<EmbedMatrix> {
        if texts.is_empty() {
            return EmbedMatrix::from_rows(Vec::new());
        }

        let mut rows: Vec<Vec<f32>> = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.config.batch_size) {
            let batch_rows = self.embed_one_request(batch, hints).await?;
            rows.extend(batch_rows);
        }
        EmbedMatrix::from_rows(rows)
    }

    async fn embed_one_request(
        &self,
        batch: &[String],
        hints: &EmbedHints,
    ) -> Result<Vec<Vec<f32>>> {
        let mut body = json!({ "input": batch });
        let model = hints
            .model
            .clone()
            .unwrap_or_else(|| self.config.model.clone());
        if !model.is_empty() {
            body["model"] = json!(model);
        }
        if let Some(dim) = hints.dim {
            body["dimensions"] = json!(dim);
        }

        let endpoint = self.config.endpoint();
        let attempts = self.config.max_retries.max(1);
        let mut last_detail = String::new();

        for attempt in 1..=attempts {
            log::debug!(
                "embeddings request attempt={attempt}/{attempts} endpoint={} count={}",
                redact_url(&endpoint),
                batch.len()
            );

            let mut request = self
                .client
                .post(&endpoint)
                .header("content-type", "application/json")
                .json(&body);
            if let Some(key) = &self.config.api_key {
                request = request.bearer_auth(key);
            }
            request = apply_hint_headers(request, hints, &model, self.config.max_seq_length);

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_client_error() {
                        let detail = body_snippet(response).await;
                        return Err(EmbedError::BadRequest {
                            status: status.as_u16(),
                            detail,
                        });
                    }
                    if !status.is_success() {
                        last_detail = format!("status {status}");
                    } else {
                        let wire: WireResponse = response.json().await.map_err(|err| {
                            EmbedError::InvalidResponse(format!("body decode failed: {err}"))
                        })?;
                        return rows_from_wire(wire, batch.len());
                    }
                }
                Err(err) => {
                    last_detail = if err.is_timeout() {
                        "request timed out".to_string()
                    } else {
                        scrub(&err.to_string())
                    };
                }
            }

            if attempt < attempts {
                let backoff = self.config.backoff * attempt;
                tokio::time::sleep(backoff.min(Duration::from_secs(2))).await;
            }
        }

        Err(EmbedError::Upstream {
            attempts,
            detail: last_detail,
        })
    }
}

fn apply_hint_headers(
    mut request: reqwest::RequestBuilder,
    hints: &EmbedHints,
    model: &str,
    max_seq_length: Option<u32>,
) -> reqwest::RequestBuilder {
    if let Some(dim) = hints.dim {
        request = request.header("X-Embedding-Dim", dim.to_string());
    }
    if let Some(normalize) = hints.normalize {
        request = request.header(
            "X-Embedding-Normalize",
            if normalize { "true" } else { "false" },
        );
    }
    if let Some(task) = &hints.task {
        request = request.header("X-Embedding-Task", task.clone());
    }
    if !model.is_empty() {
        request = request.header("X-Model-Hint", model.to_string());
    }
    if let Some(max_len) = max_seq_length {
        request = request.header("X-Embedding-Max-Seq-Length", max_len.to_string());
    }
    request
}

fn rows_from_wire(wire: WireResponse, expected: usize) -> Result<Vec<Vec<f32>>> {
    if wire.data.len() != expected {
        return Err(EmbedError::InvalidResponse(format!(
            "expected {expected} rows, got {}",
            wire.data.len()
        )));
    }
    let mut rows = wire.data;
    rows.sort_by_key(|row| row.index);
    for (pos, row) in rows.iter().enumerate() {
        if row.index != pos {
            return Err(EmbedError::InvalidResponse(
                "response indexes must be contiguous from 0".to_string(),
            ));
        }
    }
    Ok(rows.into_iter().map(|row| row.embedding).collect())
}

async fn body_snippet(response: reqwest::Response) -> String {
    let body = response.text().await.unwrap_or_default();
    let compact: String = body.split_whitespace().collect::<Vec<_>>().join(" ");
    scrub(&compact.chars().take(200).collect::<String>())
}

/// Drop anything that looks like a bearer credential from a message that
/// will end up in logs or errors.
fn scrub(message: &str) -> String {
    let lowered = message.to_ascii_lowercase();
    if lowered.contains("bearer") || lowered.contains("authorization") {
        return "<redacted transport error>".to_string();
    }
    message.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_rows_are_reordered_by_index() {
        let wire = WireResponse {
            data: vec![
                WireRow {
                    index: 1,
                    embedding: vec![2.0],
                },
                WireRow {
                    index: 0,
                    embedding: vec![1.0],
                },
            ],
        };
        let rows = rows_from_wire(wire, 2).unwrap();
        assert_eq!(rows, vec![vec![1.0], vec![2.0]]);
    }

    #[test]
    fn gapped_indexes_are_rejected() {
        let wire = WireResponse {
            data: vec![
                WireRow {
                    index: 0,
                    embedding: vec![1.0],
                },
                WireRow {
                    index: 2,
                    embedding: vec![2.0],
                },
            ],
        };
        assert!(rows_from_wire(wire, 2).is_err());
    }

    #[test]
    fn row_count_mismatch_is_rejected() {
        let wire = WireResponse {
            data: vec![WireRow {
                index: 0,
                embedding: vec![1.0],
            }],
        };
        assert!(rows_from_wire(wire, 2).is_err());
    }

    #[test]
    fn scrub_hides_credential_bearing_messages() {
        assert_eq!(
            scrub("error: Authorization: Bearer abc123"),
            "<redacted transport error>"
        );
        assert_eq!(scrub("connection refused"), "connection refused");
    }
}
