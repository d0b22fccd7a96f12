//! Pre-allocated key/value cache written by explicit position.
//!
//! Buffers are allocated once at `[max_batch_size, heads, max_cache_length, head_dim]`
//! and never change shape, so a model compiled for fixed shapes sees the same
//! tensors every step. Reordering is double-buffered: rows are copied into a
//! scratch set, then the two sets are swapped.

use std::fmt;
use std::str::FromStr;

use half::{bf16, f16};
use ndarray::{s, Array4, ArrayView4};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::{check_indices, check_plain, CacheUpdateExtra, KVCache, LayerKV, PlainCache};
use crate::error::{GenerationError, Result};

/// Storage precision of a [`StaticCache`].
///
/// Values are held as `f32`, rounded through the reduced type on write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheDType {
    #[default]
    F32,
    F16,
    Bf16,
}

impl CacheDType {
    pub fn round(self, value: f32) -> f32 {
        match self {
            CacheDType::F32 => value,
            CacheDType::F16 => f16::from_f32(value).to_f32(),
            CacheDType::Bf16 => bf16::from_f32(value).to_f32(),
        }
    }

    /// True when `value` survives a round trip through this dtype unchanged.
    pub fn represents(self, value: f32) -> bool {
        let rounded = self.round(value);
        rounded.to_bits() == value.to_bits() || (rounded.is_nan() && value.is_nan())
    }

    pub fn name(self) -> &'static str {
        match self {
            CacheDType::F32 => "f32",
            CacheDType::F16 => "f16",
            CacheDType::Bf16 => "bf16",
        }
    }
}

impl fmt::Display for CacheDType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CacheDType {
    type Err = GenerationError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "f32" | "float32" => Ok(CacheDType::F32),
            "f16" | "float16" => Ok(CacheDType::F16),
            "bf16" | "bfloat16" => Ok(CacheDType::Bf16),
            other => Err(GenerationError::UnsupportedDType {
                component: "static cache",
                dtype: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StaticCache {
    layers: Vec<LayerKV>,
    /// Destination of `reorder`; allocated on first use.
    scratch: Option<Vec<LayerKV>>,
    max_batch_size: usize,
    max_cache_length: usize,
    num_heads: usize,
    head_dim: usize,
    dtype: CacheDType,
    /// Highest written position + 1 on layer 0.
    high_water: usize,
    seen_tokens: usize,
}

impl StaticCache {
    pub fn new(
        max_batch_size: usize,
        max_cache_length: usize,
        num_layers: usize,
        num_heads: usize,
        head_dim: usize,
        dtype: CacheDType,
    ) -> Result<Self> {
        if max_batch_size == 0 || max_cache_length == 0 {
            return Err(GenerationError::InvalidConfig(format!(
                "static cache needs max_batch_size > 0 and max_cache_length > 0, got {} and {}",
                max_batch_size, max_cache_length
            )));
        }
        let shape = (max_batch_size, num_heads, max_cache_length, head_dim);
        let layers = (0..num_layers)
            .map(|_| LayerKV::new(Array4::zeros(shape), Array4::zeros(shape)))
            .collect();
        Ok(Self {
            layers,
            scratch: None,
            max_batch_size,
            max_cache_length,
            num_heads,
            head_dim,
            dtype,
            high_water: 0,
            seen_tokens: 0,
        })
    }

    /// Rebuilds the buffers, writing the plain positions at `0..len`.
    ///
    /// Fails with `DtypeMismatch` if a stored value is not exactly
    /// representable in `dtype`.
    pub fn from_plain(plain: PlainCache, max_cache_length: usize, dtype: CacheDType) -> Result<Self> {
        let batch = check_plain(&plain)?.ok_or_else(|| {
            GenerationError::InvalidConfig("cannot size a static cache from an empty plain cache".to_string())
        })?;
        let (_, num_heads, positions, head_dim) = plain[0].0.dim();
        if positions > max_cache_length {
            return Err(GenerationError::CacheCapacityExceeded {
                position: positions - 1,
                capacity: max_cache_length,
            });
        }
        for (keys, values) in &plain {
            if keys.iter().chain(values.iter()).any(|&v| !dtype.represents(v)) {
                return Err(GenerationError::DtypeMismatch {
                    expected: dtype.to_string(),
                    actual: "f32".to_string(),
                });
            }
        }

        let mut cache = Self::new(batch, max_cache_length, plain.len(), num_heads, head_dim, dtype)?;
        for (layer, (keys, values)) in cache.layers.iter_mut().zip(plain.iter()) {
            if keys.dim().1 != num_heads || keys.dim().3 != head_dim {
                return Err(GenerationError::shape(
                    "plain cache",
                    (batch, num_heads, positions, head_dim),
                    keys.dim(),
                ));
            }
            layer.keys.slice_mut(s![.., .., ..positions, ..]).assign(keys);
            layer.values.slice_mut(s![.., .., ..positions, ..]).assign(values);
        }
        cache.high_water = positions;
        cache.seen_tokens = positions;
        Ok(cache)
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    pub fn max_cache_length(&self) -> usize {
        self.max_cache_length
    }

    pub fn dtype(&self) -> CacheDType {
        self.dtype
    }
}

impl KVCache for StaticCache {
    fn update(
        &mut self,
        layer_idx: usize,
        new_keys: &Array4<f32>,
        new_values: &Array4<f32>,
        extra: &CacheUpdateExtra<'_>,
    ) -> Result<(ArrayView4<'_, f32>, ArrayView4<'_, f32>)> {
        if layer_idx >= self.layers.len() {
            return Err(GenerationError::LayerOutOfRange {
                index: layer_idx,
                num_layers: self.layers.len(),
            });
        }
        if new_keys.dim() != new_values.dim() {
            return Err(GenerationError::shape(
                "static cache",
                new_keys.shape(),
                new_values.shape(),
            ));
        }
        let (batch, heads, n, head_dim) = new_keys.dim();
        if batch != self.max_batch_size {
            return Err(GenerationError::BatchMismatch {
                component: "static cache",
                expected: self.max_batch_size,
                actual: batch,
            });
        }
        if heads != self.num_heads || head_dim != self.head_dim {
            return Err(GenerationError::MisalignedCache {
                layer: layer_idx,
                reason: format!(
                    "buffers hold heads x head_dim = {}x{}, new = {}x{}",
                    self.num_heads, self.head_dim, heads, head_dim
                ),
            });
        }
        let positions = extra.cache_position.ok_or_else(|| GenerationError::MisalignedCache {
            layer: layer_idx,
            reason: "static cache update without cache_position".to_string(),
        })?;
        if positions.len() != n {
            return Err(GenerationError::shape("cache_position", n, positions.len()));
        }
        if let Some(&position) = positions.iter().find(|&&p| p >= self.max_cache_length) {
            return Err(GenerationError::CacheCapacityExceeded {
                position,
                capacity: self.max_cache_length,
            });
        }

        let dtype = self.dtype;
        let layer = &mut self.layers[layer_idx];
        for (j, &position) in positions.iter().enumerate() {
            layer
                .keys
                .slice_mut(s![.., .., position, ..])
                .zip_mut_with(&new_keys.slice(s![.., .., j, ..]), |dst, &src| *dst = dtype.round(src));
            layer
                .values
                .slice_mut(s![.., .., position, ..])
                .zip_mut_with(&new_values.slice(s![.., .., j, ..]), |dst, &src| *dst = dtype.round(src));
        }

        if layer_idx == 0 {
            if let Some(&last) = positions.iter().max() {
                self.high_water = self.high_water.max(last + 1);
            }
            self.seen_tokens += n;
        }

        let layer = &self.layers[layer_idx];
        Ok((layer.keys.view(), layer.values.view()))
    }

    fn length(&self) -> usize {
        self.high_water
    }

    fn seen(&self) -> usize {
        self.seen_tokens
    }

    fn max_length(&self) -> Option<usize> {
        Some(self.max_cache_length)
    }

    fn usable_length(&self, _new_positions: usize) -> usize {
        self.high_water
    }

    fn attention_length(&self, _new_positions: usize) -> usize {
        self.max_cache_length
    }

    fn reorder(&mut self, beam_indices: &[usize]) -> Result<()> {
        if beam_indices.len() != self.max_batch_size {
            return Err(GenerationError::BatchMismatch {
                component: "static cache reorder",
                expected: self.max_batch_size,
                actual: beam_indices.len(),
            });
        }
        check_indices(beam_indices, self.max_batch_size)?;
        if self.high_water == 0 {
            return Ok(());
        }

        let valid_len = self.high_water;
        let scratch = self.scratch.get_or_insert_with(|| self.layers.clone());

        self.layers
            .par_iter()
            .zip(scratch.par_iter_mut())
            .for_each(|(source, dest)| {
                for (dest_idx, &source_idx) in beam_indices.iter().enumerate() {
                    dest.keys
                        .slice_mut(s![dest_idx, .., ..valid_len, ..])
                        .assign(&source.keys.slice(s![source_idx, .., ..valid_len, ..]));
                    dest.values
                        .slice_mut(s![dest_idx, .., ..valid_len, ..])
                        .assign(&source.values.slice(s![source_idx, .., ..valid_len, ..]));
                }
            });

        std::mem::swap(&mut self.layers, scratch);
        Ok(())
    }

    /// The batch of a static cache is fixed, so only same-size gathers are allowed.
    fn select_batch(&mut self, indices: &[usize]) -> Result<()> {
        self.reorder(indices)
    }

    fn crop(&mut self, max_positions: usize) -> Result<()> {
        if max_positions >= self.high_water {
            return Ok(());
        }
        self.layers.par_iter_mut().for_each(|layer| {
            layer.keys.slice_mut(s![.., .., max_positions.., ..]).fill(0.0);
            layer.values.slice_mut(s![.., .., max_positions.., ..]).fill(0.0);
        });
        // stale rows past the crop would survive the next swap otherwise
        self.scratch = None;
        self.high_water = max_positions;
        self.seen_tokens = self.seen_tokens.min(max_positions);
        Ok(())
    }

    fn to_plain(&self) -> PlainCache {
        let len = self.high_water;
        self.layers
            .iter()
            .map(|l| {
                (
                    l.keys.slice(s![.., .., ..len, ..]).to_owned(),
                    l.values.slice(s![.., .., ..len, ..]).to_owned(),
                )
            })
            .collect()
    }

    fn layer(&self, layer_idx: usize) -> Option<(ArrayView4<'_, f32>, ArrayView4<'_, f32>)> {
        let len = self.high_water;
        self.layers.get(layer_idx).map(|l| {
            (
                l.keys.slice(s![.., .., ..len, ..]),
                l.values.slice(s![.., .., ..len, ..]),
            )
        })
    }

    fn num_layers(&self) -> usize {
        self.layers.len()
    }

    fn batch_size(&self) -> Option<usize> {
        Some(self.max_batch_size)
    }

    fn clear(&mut self) {
        for layer in &mut self.layers {
            layer.keys.fill(0.0);
            layer.values.fill(0.0);
        }
        self.scratch = None;
        self.high_water = 0;
        self.seen_tokens = 0;
    }
}
