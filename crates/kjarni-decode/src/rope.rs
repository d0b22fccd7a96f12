//! Rotary Position Embeddings (RoPE)
//!
//! Keys stored in a windowed cache were rotated for the position they were
//! written at. When the window slides, the retained keys move to earlier
//! positions and have to be rotated back by the shift; the helpers here build
//! the cos/sin tables and apply a rotation to the leading `rot_dim` features
//! of a `[batch, heads, positions, head_dim]` tensor.
//!
//! Layout is "rotate half": feature `i` is paired with `i + rot_dim / 2`.

use ndarray::{s, Array1, Array2, Array4, ArrayView2};

use crate::error::{GenerationError, Result};

/// Precomputed rotary tables.
#[derive(Debug, Clone)]
pub struct RoPE {
    /// Cosine cache: [max_positions, head_dim]
    pub cos_cache: Array2<f32>,
    /// Sine cache: [max_positions, head_dim]
    pub sin_cache: Array2<f32>,
    pub head_dim: usize,
    /// Base value for the rotation frequencies (typically 10000.0)
    pub theta: f32,
}

impl RoPE {
    pub fn new(head_dim: usize, max_positions: usize, theta: f32) -> Self {
        let inv_freq = Self::inv_freq(head_dim, theta);
        let (cos_cache, sin_cache) = Self::build_cache(max_positions, &inv_freq);
        Self {
            cos_cache,
            sin_cache,
            head_dim,
            theta,
        }
    }

    fn inv_freq(head_dim: usize, theta: f32) -> Array1<f32> {
        Array1::from_iter((0..head_dim / 2).map(|i| {
            let exponent = (2 * i) as f32 / head_dim as f32;
            1.0 / theta.powf(exponent)
        }))
    }

    fn build_cache(max_positions: usize, inv_freq: &Array1<f32>) -> (Array2<f32>, Array2<f32>) {
        let half_dim = inv_freq.len();
        let head_dim = half_dim * 2;
        let mut cos_cache = Array2::<f32>::zeros((max_positions, head_dim));
        let mut sin_cache = Array2::<f32>::zeros((max_positions, head_dim));

        for pos in 0..max_positions {
            for i in 0..half_dim {
                let angle = pos as f32 * inv_freq[i];
                let (sin_val, cos_val) = angle.sin_cos();
                cos_cache[[pos, i]] = cos_val;
                sin_cache[[pos, i]] = sin_val;
                cos_cache[[pos, i + half_dim]] = cos_val;
                sin_cache[[pos, i + half_dim]] = sin_val;
            }
        }
        (cos_cache, sin_cache)
    }

    /// Rotates `x` as if its positions started at `position_offset`.
    pub fn rotate_4d(&self, x: &Array4<f32>, position_offset: usize) -> Result<Array4<f32>> {
        let seq_len = x.dim().2;
        let end = position_offset + seq_len;
        if end > self.max_positions() {
            return Err(GenerationError::MissingRotaryTables(format!(
                "positions up to {} requested, tables cover {}",
                end,
                self.max_positions()
            )));
        }
        let cos = self.cos_cache.slice(s![position_offset..end, ..]);
        let sin = self.sin_cache.slice(s![position_offset..end, ..]);
        let mut rotated = x.to_owned();
        apply_rotary_inplace(&mut rotated, cos, sin, None)?;
        Ok(rotated)
    }

    /// Borrowed view of the tables, as passed to a cache update.
    pub fn tables(&self) -> RotaryTables<'_> {
        RotaryTables {
            cos: self.cos_cache.view(),
            sin: self.sin_cache.view(),
            partial_rotation_size: None,
        }
    }

    pub fn max_positions(&self) -> usize {
        self.cos_cache.nrows()
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }
}

/// Full cos/sin tables handed to a windowed cache so it can re-rotate keys.
///
/// Both tables are `[positions, rot_dim]` and must cover at least the window.
#[derive(Debug, Clone, Copy)]
pub struct RotaryTables<'a> {
    pub cos: ArrayView2<'a, f32>,
    pub sin: ArrayView2<'a, f32>,
    /// Only the leading `partial_rotation_size` features are rotated; the
    /// rest pass through unchanged.
    pub partial_rotation_size: Option<usize>,
}

impl<'a> RotaryTables<'a> {
    pub fn new(cos: ArrayView2<'a, f32>, sin: ArrayView2<'a, f32>) -> Self {
        Self {
            cos,
            sin,
            partial_rotation_size: None,
        }
    }

    pub fn with_partial_rotation(mut self, size: usize) -> Self {
        self.partial_rotation_size = Some(size);
        self
    }

    pub fn len(&self) -> usize {
        self.cos.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.cos.nrows() == 0
    }

    /// Identifies the tables by shape and the angles of position 1, which fix
    /// `theta` and the rotated width.
    pub(crate) fn signature(&self) -> TableSignature {
        let row = 1.min(self.cos.nrows().saturating_sub(1));
        let angles = if self.cos.nrows() == 0 {
            Vec::new()
        } else {
            self.cos
                .row(row)
                .iter()
                .chain(self.sin.row(row).iter())
                .map(|v| v.to_bits())
                .collect()
        };
        TableSignature {
            dims: self.cos.dim(),
            angles,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct TableSignature {
    dims: (usize, usize),
    angles: Vec<u32>,
}

/// Builds the cos/sin pair that moves keys `shift` positions earlier.
///
/// Row `j` corresponds to a key at `num_sink + shift + j` moving to
/// `num_sink + j`, for `rows` consecutive keys.
pub fn rerotation_tables(
    cos: ArrayView2<'_, f32>,
    sin: ArrayView2<'_, f32>,
    num_sink: usize,
    shift: usize,
    rows: usize,
) -> Result<(Array2<f32>, Array2<f32>)> {
    if cos.dim() != sin.dim() {
        return Err(GenerationError::MissingRotaryTables(format!(
            "cos {:?} and sin {:?} disagree",
            cos.dim(),
            sin.dim()
        )));
    }
    let needed = num_sink + shift + rows;
    if cos.nrows() < needed {
        return Err(GenerationError::MissingRotaryTables(format!(
            "tables cover {} positions, re-rotation needs {}",
            cos.nrows(),
            needed
        )));
    }

    let original_cos = cos.slice(s![num_sink + shift..needed, ..]);
    let original_sin = sin.slice(s![num_sink + shift..needed, ..]);
    let shifted_cos = cos.slice(s![num_sink..num_sink + rows, ..]);
    let shifted_sin = sin.slice(s![num_sink..num_sink + rows, ..]);

    let rerot_cos = &original_cos * &shifted_cos + &original_sin * &shifted_sin;
    let rerot_sin = &original_cos * &shifted_sin - &original_sin * &shifted_cos;
    Ok((rerot_cos, rerot_sin))
}

/// `x = x * cos + rotate_half(x) * sin` over the leading rotated features.
///
/// `cos`/`sin` are `[positions, rot_dim]` with one row per position of `x`.
pub fn apply_rotary_inplace(
    x: &mut Array4<f32>,
    cos: ArrayView2<'_, f32>,
    sin: ArrayView2<'_, f32>,
    partial_rotation_size: Option<usize>,
) -> Result<()> {
    let (batch, num_heads, seq_len, head_dim) = x.dim();
    let rot_dim = partial_rotation_size.unwrap_or(head_dim);

    if rot_dim > head_dim || rot_dim % 2 != 0 {
        return Err(GenerationError::MissingRotaryTables(format!(
            "rotation size {} invalid for head_dim {}",
            rot_dim, head_dim
        )));
    }
    if cos.nrows() != seq_len || cos.ncols() < rot_dim || cos.dim() != sin.dim() {
        return Err(GenerationError::MissingRotaryTables(format!(
            "tables {:?} do not match {} positions x {} rotated dims",
            cos.dim(),
            seq_len,
            rot_dim
        )));
    }

    let half_dim = rot_dim / 2;
    for b in 0..batch {
        for h in 0..num_heads {
            for p in 0..seq_len {
                for i in 0..half_dim {
                    // both halves must be read before either is written
                    let x0 = x[[b, h, p, i]];
                    let x1 = x[[b, h, p, i + half_dim]];
                    x[[b, h, p, i]] = x0 * cos[[p, i]] - x1 * sin[[p, i]];
                    x[[b, h, p, i + half_dim]] = x1 * cos[[p, i + half_dim]] + x0 * sin[[p, i + half_dim]];
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array4;

    fn sample_keys(positions: usize, head_dim: usize) -> Array4<f32> {
        Array4::from_shape_fn((1, 2, positions, head_dim), |(_, h, p, d)| {
            0.1 * (h as f32 + 1.0) + 0.01 * p as f32 - 0.02 * d as f32
        })
    }

    #[test]
    fn test_tables_shape() {
        let rope = RoPE::new(8, 16, 10000.0);
        assert_eq!(rope.cos_cache.dim(), (16, 8));
        assert_eq!(rope.max_positions(), 16);
        // position 0 is the identity rotation
        assert!(rope.cos_cache.row(0).iter().all(|&c| c == 1.0));
        assert!(rope.sin_cache.row(0).iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_rotate_at_zero_is_identity() {
        let rope = RoPE::new(4, 8, 10000.0);
        let x = sample_keys(1, 4);
        let rotated = rope.rotate_4d(&x, 0).unwrap();
        assert_eq!(rotated, x);
    }

    #[test]
    fn test_rotate_past_tables_fails() {
        let rope = RoPE::new(4, 4, 10000.0);
        let x = sample_keys(2, 4);
        let err = rope.rotate_4d(&x, 3).unwrap_err();
        assert!(matches!(err, GenerationError::MissingRotaryTables(_)));
    }

    #[test]
    fn test_rerotation_moves_keys_back() {
        // A key rotated for position 5 and then re-rotated by a shift of 2 must
        // match the same raw key rotated for position 3.
        let head_dim = 8;
        let rope = RoPE::new(head_dim, 16, 10000.0);
        let raw = sample_keys(1, head_dim);

        let at_five = rope.rotate_4d(&raw, 5).unwrap();
        let at_three = rope.rotate_4d(&raw, 3).unwrap();

        // one sink token, shift 2: row j is the key at 1 + 2 + j
        let (cos, sin) =
            rerotation_tables(rope.cos_cache.view(), rope.sin_cache.view(), 1, 2, 5).unwrap();
        assert_eq!(cos.nrows(), 5);

        let row = 5 - 1 - 2;
        let mut moved = at_five.clone();
        apply_rotary_inplace(
            &mut moved,
            cos.slice(s![row..row + 1, ..]),
            sin.slice(s![row..row + 1, ..]),
            None,
        )
        .unwrap();

        for (a, b) in moved.iter().zip(at_three.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_partial_rotation_leaves_tail() {
        let rope = RoPE::new(4, 8, 10000.0);
        let mut x = sample_keys(1, 8);
        let before = x.clone();
        apply_rotary_inplace(
            &mut x,
            rope.cos_cache.slice(s![3..4, ..]),
            rope.sin_cache.slice(s![3..4, ..]),
            Some(4),
        )
        .unwrap();

        assert_eq!(x.slice(s![.., .., .., 4..]), before.slice(s![.., .., .., 4..]));
        assert_ne!(x.slice(s![.., .., .., ..4]), before.slice(s![.., .., .., ..4]));
    }

    #[test]
    fn test_short_tables_rejected() {
        let rope = RoPE::new(4, 3, 10000.0);
        let err = rerotation_tables(rope.cos_cache.view(), rope.sin_cache.view(), 1, 1, 2)
            .unwrap_err();
        assert!(matches!(err, GenerationError::MissingRotaryTables(_)));
    }
}
