//! Growing key/value cache: every written position is kept.

use ndarray::{concatenate, s, Array4, ArrayView4, Axis};
use rayon::prelude::*;

use super::{check_indices, check_plain, check_update, gather_batch, CacheUpdateExtra, KVCache, LayerKV, PlainCache};
use crate::error::{GenerationError, Result};

#[derive(Debug, Clone, Default)]
pub struct DynamicCache {
    layers: Vec<LayerKV>,
    seen_tokens: usize,
}

impl DynamicCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bit-exact rebuild from the plain representation.
    pub fn from_plain(plain: PlainCache) -> Result<Self> {
        check_plain(&plain)?;
        let seen_tokens = plain.first().map(|(k, _)| k.dim().2).unwrap_or(0);
        let layers = plain
            .into_iter()
            .map(|(keys, values)| LayerKV::new(keys, values))
            .collect();
        Ok(Self {
            layers,
            seen_tokens,
        })
    }

    pub fn layers(&self) -> &[LayerKV] {
        &self.layers
    }
}

impl KVCache for DynamicCache {
    fn update(
        &mut self,
        layer_idx: usize,
        new_keys: &Array4<f32>,
        new_values: &Array4<f32>,
        _extra: &CacheUpdateExtra<'_>,
    ) -> Result<(ArrayView4<'_, f32>, ArrayView4<'_, f32>)> {
        if layer_idx > self.layers.len() {
            return Err(GenerationError::LayerOutOfRange {
                index: layer_idx,
                num_layers: self.layers.len(),
            });
        }
        let reference_batch = self.layers.first().map(LayerKV::batch_size);
        check_update(
            layer_idx,
            self.layers.get(layer_idx),
            reference_batch,
            new_keys,
            new_values,
        )?;

        let new_len = new_keys.dim().2;
        if layer_idx == 0 {
            self.seen_tokens += new_len;
        }

        if layer_idx == self.layers.len() {
            self.layers
                .push(LayerKV::new(new_keys.to_owned(), new_values.to_owned()));
        } else {
            let layer = &mut self.layers[layer_idx];
            let keys = concatenate(Axis(2), &[layer.keys.view(), new_keys.view()])
                .map_err(|e| GenerationError::MisalignedCache {
                    layer: layer_idx,
                    reason: e.to_string(),
                })?;
            let values = concatenate(Axis(2), &[layer.values.view(), new_values.view()])
                .map_err(|e| GenerationError::MisalignedCache {
                    layer: layer_idx,
                    reason: e.to_string(),
                })?;
            layer.keys = keys;
            layer.values = values;
        }

        let layer = &self.layers[layer_idx];
        Ok((layer.keys.view(), layer.values.view()))
    }

    fn length(&self) -> usize {
        self.layers.first().map(LayerKV::len).unwrap_or(0)
    }

    fn seen(&self) -> usize {
        self.seen_tokens
    }

    fn max_length(&self) -> Option<usize> {
        None
    }

    fn usable_length(&self, _new_positions: usize) -> usize {
        self.length()
    }

    fn attention_length(&self, new_positions: usize) -> usize {
        self.length() + new_positions
    }

    fn reorder(&mut self, beam_indices: &[usize]) -> Result<()> {
        let Some(batch) = self.batch_size() else {
            return Ok(());
        };
        if beam_indices.len() != batch {
            return Err(GenerationError::BatchMismatch {
                component: "cache reorder",
                expected: batch,
                actual: beam_indices.len(),
            });
        }
        self.select_batch(beam_indices)
    }

    fn select_batch(&mut self, indices: &[usize]) -> Result<()> {
        let Some(batch) = self.batch_size() else {
            return Ok(());
        };
        check_indices(indices, batch)?;

        self.layers.par_iter_mut().for_each(|layer| {
            layer.keys = gather_batch(&layer.keys, indices);
            layer.values = gather_batch(&layer.values, indices);
        });
        Ok(())
    }

    fn crop(&mut self, max_positions: usize) -> Result<()> {
        if max_positions >= self.length() {
            return Ok(());
        }
        for layer in &mut self.layers {
            layer.keys = layer.keys.slice(s![.., .., ..max_positions, ..]).to_owned();
            layer.values = layer.values.slice(s![.., .., ..max_positions, ..]).to_owned();
        }
        self.seen_tokens = max_positions;
        Ok(())
    }

    fn to_plain(&self) -> PlainCache {
        self.layers
            .iter()
            .map(|l| (l.keys.clone(), l.values.clone()))
            .collect()
    }

    fn layer(&self, layer_idx: usize) -> Option<(ArrayView4<'_, f32>, ArrayView4<'_, f32>)> {
        self.layers
            .get(layer_idx)
            .map(|l| (l.keys.view(), l.values.view()))
    }

    fn num_layers(&self) -> usize {
        self.layers.len()
    }

    fn batch_size(&self) -> Option<usize> {
        self.layers.first().map(LayerKV::batch_size)
    }

    fn clear(&mut self) {
        self.layers.clear();
        self.seen_tokens = 0;
    }
}
