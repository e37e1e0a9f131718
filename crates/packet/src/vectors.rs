//! Row-major little-endian float16 vector file (`vectors.f16.bin`).
//!
//! File length is exactly `rows * dim * 2` bytes. IEEE 754 binary16
//! conversion is done by hand; round-to-nearest-even on narrowing.

use crate::error::{PacketError, Result};
use std::io::{BufWriter, Read, Write};
use std::path::Path;

pub const VECTORS_FILE: &str = "vectors.f16.bin";

/// Convert f32 → f16 (IEEE 754 binary16) with round-to-nearest-even.
#[must_use]
pub fn f32_to_f16(value: f32) -> u16 {
    let bits = value.to_bits();
    let sign = ((bits >> 16) & 0x8000) as u16;
    let exponent = ((bits >> 23) & 0xff) as i32;
    let mantissa = bits & 0x007f_ffff;

    if exponent == 0xff {
        // Inf / NaN: keep a quiet-NaN payload bit so NaN stays NaN.
        let nan_bit = if mantissa != 0 { 0x0200 } else { 0 };
        return sign | 0x7c00 | nan_bit | ((mantissa >> 13) as u16 & 0x03ff);
    }

    let unbiased = exponent - 127;
    if unbiased > 15 {
        return sign | 0x7c00; // overflow → infinity
    }
    if unbiased >= -14 {
        // Normal range; round mantissa to 10 bits. A rounding carry into the
        // exponent field is correct (e.g. 2047.5ulp → next power of two).
        let mut half = ((unbiased + 15) as u32) << 10 | (mantissa >> 13);
        if round_up(mantissa, 13) {
            half += 1;
        }
        return sign | (half as u16);
    }
    if unbiased >= -24 {
        // Subnormal half: shift the implicit-one mantissa down into the
        // 2^-24 grid.
        let shift = (-unbiased - 1) as u32; // 14..=23
        let full = mantissa | 0x0080_0000;
        let mut mant = full >> shift;
        if round_up(full, shift) {
            mant += 1;
        }
        return sign | (mant as u16);
    }
    sign // underflow → signed zero
}

fn round_up(mantissa: u32, shift: u32) -> bool {
    let halfway = 1u32 << (shift - 1);
    let rest = mantissa & ((1u32 << shift) - 1);
    rest > halfway || (rest == halfway && (mantissa >> shift) & 1 == 1)
}

/// Convert f16 → f32.
#[must_use]
pub fn f16_to_f32(half: u16) -> f32 {
    let sign = u32::from(half & 0x8000) << 16;
    let exponent = u32::from(half >> 10) & 0x1f;
    let mantissa = u32::from(half) & 0x03ff;

    if exponent == 0 {
        if mantissa == 0 {
            return f32::from_bits(sign);
        }
        // Subnormal: renormalize.
        let mut exp = -14i32;
        let mut mant = mantissa;
        while mant & 0x0400 == 0 {
            mant <<= 1;
            exp -= 1;
        }
        mant &= 0x03ff;
        let bits = sign | (((exp + 127) as u32) << 23) | (mant << 13);
        return f32::from_bits(bits);
    }
    if exponent == 0x1f {
        let bits = sign | 0x7f80_0000 | (mantissa << 13);
        return f32::from_bits(bits);
    }
    let bits = sign | ((exponent + 112) << 23) | (mantissa << 13);
    f32::from_bits(bits)
}

/// Write a row-major f16 vector file. Every row must have length `dim`.
pub fn write_vectors_f16(path: &Path, rows: &[Vec<f32>], dim: usize) -> Result<()> {
    let file = std::fs::File::create(path)?;
    let mut writer = BufWriter::new(file);
    for row in rows {
        if row.len() != dim {
            return Err(PacketError::InvalidDimension {
                expected: dim,
                actual: row.len(),
            });
        }
        for &value in row {
            writer.write_all(&f32_to_f16(value).to_le_bytes())?;
        }
    }
    writer.flush()?;
    Ok(())
}

/// Read a row-major f16 vector file back into f32 rows. Fails when the file
/// length is not a multiple of `dim * 2`.
pub fn read_vectors_f16(path: &Path, dim: usize) -> Result<Vec<Vec<f32>>> {
    let mut file = std::fs::File::open(path)?;
    let mut raw = Vec::new();
    file.read_to_end(&mut raw)?;

    let row_bytes = dim * 2;
    if row_bytes == 0 || raw.len() % row_bytes != 0 {
        return Err(PacketError::MalformedVectors {
            path: path.display().to_string(),
            reason: format!("length {} is not a multiple of dim {dim} * 2", raw.len()),
        });
    }

    let mut rows = Vec::with_capacity(raw.len() / row_bytes);
    for row in raw.chunks_exact(row_bytes) {
        let mut out = Vec::with_capacity(dim);
        for pair in row.chunks_exact(2) {
            out.push(f16_to_f32(u16::from_le_bytes([pair[0], pair[1]])));
        }
        rows.push(out);
    }
    Ok(rows)
}

/// L2-normalize in place; zero vectors are left untouched.
pub fn normalize_in_place(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm == 0.0 {
        return;
    }
    for value in vector.iter_mut() {
        *value /= norm;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn f16_roundtrip_exact_values() {
        for value in [0.0f32, 1.0, -1.0, 0.5, 2.0, -0.25, 65504.0] {
            assert_eq!(f16_to_f32(f32_to_f16(value)), value, "value {value}");
        }
    }

    #[test]
    fn f16_negative_zero_keeps_sign() {
        let half = f32_to_f16(-0.0);
        assert_eq!(half, 0x8000);
        assert!(f16_to_f32(half).is_sign_negative());
    }

    #[test]
    fn f16_handles_specials() {
        assert!(f16_to_f32(f32_to_f16(f32::NAN)).is_nan());
        assert_eq!(f16_to_f32(f32_to_f16(f32::INFINITY)), f32::INFINITY);
        assert_eq!(f16_to_f32(f32_to_f16(1e9)), f32::INFINITY);
        // Below the smallest subnormal half, values flush to zero.
        assert_eq!(f16_to_f32(f32_to_f16(1e-9)), 0.0);
    }

    #[test]
    fn f16_precision_within_three_decimals() {
        let value = 0.333_333_34f32;
        let roundtrip = f16_to_f32(f32_to_f16(value));
        assert!((roundtrip - value).abs() < 1e-3);
    }

    #[test]
    fn file_roundtrip_and_length() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(VECTORS_FILE);
        let rows = vec![vec![1.0f32, 0.0, -0.5, 0.25], vec![0.0, 0.5, 0.5, 0.0]];
        write_vectors_f16(&path, &rows, 4).unwrap();

        let len = std::fs::metadata(&path).unwrap().len();
        assert_eq!(len, 2 * 4 * 2);

        let back = read_vectors_f16(&path, 4).unwrap();
        assert_eq!(back, rows);
    }

    #[test]
    fn read_rejects_misaligned_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(VECTORS_FILE);
        std::fs::write(&path, [0u8; 7]).unwrap();
        assert!(read_vectors_f16(&path, 4).is_err());
    }

    #[test]
    fn write_rejects_ragged_rows() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(VECTORS_FILE);
        let rows = vec![vec![1.0f32, 0.0], vec![1.0f32]];
        assert!(write_vectors_f16(&path, &rows, 2).is_err());
    }

    #[test]
    fn normalize_preserves_zero_rows() {
        let mut zero = vec![0.0f32; 4];
        normalize_in_place(&mut zero);
        assert_eq!(zero, vec![0.0f32; 4]);

        let mut row = vec![3.0f32, 4.0];
        normalize_in_place(&mut row);
        let norm = row.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }
}
