use crate::error::{EmbedError, Result};
use serde::{Deserialize, Serialize};

/// Semantic hints that travel as `X-Embedding-*` headers, never in the
/// request body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EmbedHints {
    pub dim: Option<u32>,
    pub normalize: Option<bool>,
    pub task: Option<String>,
    pub model: Option<String>,
}

/// Row-aligned embedding matrix: `rows.len() == n_texts`, every row has
/// length `dim`.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbedMatrix {
    pub dim: usize,
    pub rows: Vec<Vec<f32>>,
}

impl EmbedMatrix {
    pub fn from_rows(rows: Vec<Vec<f32>>) -> Result<Self> {
        let dim = rows.first().map(Vec::len).unwrap_or(0);
        for row in &rows {
            if row.len() != dim {
                return Err(EmbedError::DimMismatch {
                    expected: dim,
                    actual: row.len(),
                });
            }
        }
        Ok(Self { dim, rows })
    }

    #[must_use]
    pub fn is_finite(&self) -> bool {
        self.rows
            .iter()
            .all(|row| row.iter().all(|v| v.is_finite()))
    }
}

/// What to do with vectors coming back from the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NormalizationMode {
    /// Trust the server output as-is.
    Server,
    /// Always L2-normalize locally.
    Client,
    /// Normalize locally iff any non-zero row's norm deviates from 1.0 by
    /// more than 1e-3.
    Auto,
}

pub const NORM_TOLERANCE: f32 = 1e-3;

/// Apply the normalization mode in place. Zero rows are preserved verbatim
/// in every mode.
pub fn apply_normalization(matrix: &mut EmbedMatrix, mode: NormalizationMode) {
    let normalize_all = match mode {
        NormalizationMode::Server => false,
        NormalizationMode::Client => true,
        NormalizationMode::Auto => matrix.rows.iter().any(|row| {
            let norm = row.iter().map(|v| v * v).sum::<f32>().sqrt();
            norm != 0.0 && (norm - 1.0).abs() > NORM_TOLERANCE
        }),
    };
    if !normalize_all {
        return;
    }
    for row in &mut matrix.rows {
        cpm_packet::normalize_in_place(row);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matrix_rejects_ragged_rows() {
        assert!(EmbedMatrix::from_rows(vec![vec![1.0, 0.0], vec![1.0]]).is_err());
    }

    #[test]
    fn auto_mode_normalizes_only_when_deviant() {
        let mut already = EmbedMatrix::from_rows(vec![vec![1.0, 0.0], vec![0.0, 0.0]]).unwrap();
        apply_normalization(&mut already, NormalizationMode::Auto);
        assert_eq!(already.rows[0], vec![1.0, 0.0]);

        let mut deviant = EmbedMatrix::from_rows(vec![vec![3.0, 4.0], vec![0.0, 0.0]]).unwrap();
        apply_normalization(&mut deviant, NormalizationMode::Auto);
        let norm = deviant.rows[0].iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
        assert_eq!(deviant.rows[1], vec![0.0, 0.0], "zero rows stay verbatim");
    }

    #[test]
    fn server_mode_leaves_rows_alone() {
        let mut matrix = EmbedMatrix::from_rows(vec![vec![3.0, 4.0]]).unwrap();
        apply_normalization(&mut matrix, NormalizationMode::Server);
        assert_eq!(matrix.rows[0], vec![3.0, 4.0]);
    }

    #[test]
    fn finiteness_check_catches_nan() {
        let matrix = EmbedMatrix::from_rows(vec![vec![1.0, f32::NAN]]).unwrap();
        assert!(!matrix.is_finite());
    }
}
