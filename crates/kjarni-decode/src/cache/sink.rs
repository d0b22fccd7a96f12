//! Windowed cache that keeps a few leading "sink" positions plus a sliding
//! window of the most recent ones.
//!
//! Every stored key sits at the position it was rotated for: new keys are
//! rotated at [`KVCache::position_offset`], and when the window slides the
//! retained keys are re-rotated back by the shift.

use std::collections::HashMap;

use log::debug;
use ndarray::{concatenate, s, Array2, Array4, ArrayView4, Axis};
use rayon::prelude::*;

use super::{check_indices, check_plain, check_update, gather_batch, CacheUpdateExtra, KVCache, LayerKV, PlainCache};
use crate::error::{GenerationError, Result};
use crate::rope::{apply_rotary_inplace, rerotation_tables, RotaryTables, TableSignature};

#[derive(Debug, Clone)]
pub struct SinkCache {
    layers: Vec<LayerKV>,
    window_length: usize,
    num_sink_tokens: usize,
    rotary: bool,
    seen_tokens: usize,
    /// Re-rotation tables keyed by source tables, shift and rows.
    rerotation_memo: HashMap<(TableSignature, usize, usize), (Array2<f32>, Array2<f32>)>,
    shifting: bool,
}

impl SinkCache {
    pub fn new(window_length: usize, num_sink_tokens: usize, rotary: bool) -> Result<Self> {
        if window_length == 0 || num_sink_tokens >= window_length {
            return Err(GenerationError::InvalidConfig(format!(
                "sink cache needs 0 <= num_sink_tokens < window_length, got {} and {}",
                num_sink_tokens, window_length
            )));
        }
        Ok(Self {
            layers: Vec::new(),
            window_length,
            num_sink_tokens,
            rotary,
            seen_tokens: 0,
            rerotation_memo: HashMap::new(),
            shifting: false,
        })
    }

    pub fn from_plain(
        plain: PlainCache,
        window_length: usize,
        num_sink_tokens: usize,
        rotary: bool,
    ) -> Result<Self> {
        let mut cache = Self::new(window_length, num_sink_tokens, rotary)?;
        check_plain(&plain)?;
        cache.seen_tokens = plain.first().map(|(k, _)| k.dim().2).unwrap_or(0);
        cache.layers = plain
            .into_iter()
            .map(|(keys, values)| LayerKV::new(keys, values))
            .collect();
        Ok(cache)
    }

    pub fn window_length(&self) -> usize {
        self.window_length
    }

    pub fn num_sink_tokens(&self) -> usize {
        self.num_sink_tokens
    }

    fn rerotation(
        &mut self,
        tables: RotaryTables<'_>,
        shift: usize,
        rows: usize,
    ) -> Result<&(Array2<f32>, Array2<f32>)> {
        let key = (tables.signature(), shift, rows);
        if !self.rerotation_memo.contains_key(&key) {
            let pair = rerotation_tables(tables.cos, tables.sin, self.num_sink_tokens, shift, rows)?;
            self.rerotation_memo.insert(key.clone(), pair);
        }
        self.rerotation_memo
            .get(&key)
            .ok_or_else(|| GenerationError::MissingRotaryTables("re-rotation memo".to_string()))
    }

    /// Builds the shifted window for one layer.
    fn slide(
        &mut self,
        layer_idx: usize,
        new_keys: &Array4<f32>,
        new_values: &Array4<f32>,
        extra: &CacheUpdateExtra<'_>,
    ) -> Result<LayerKV> {
        let w = self.window_length;
        let stored_layer = &self.layers[layer_idx];
        let stored = stored_layer.len();
        let n = new_keys.dim().2;
        let sink = self.num_sink_tokens.min(stored);

        if n > w - self.num_sink_tokens {
            if self.rotary {
                return Err(GenerationError::MisalignedCache {
                    layer: layer_idx,
                    reason: format!(
                        "{} new positions do not fit a window of {} with {} sink positions",
                        n, w, self.num_sink_tokens
                    ),
                });
            }
            let tail = n - (w - self.num_sink_tokens);
            let keys = concatenate(
                Axis(2),
                &[
                    stored_layer.keys.slice(s![.., .., ..sink, ..]),
                    new_keys.slice(s![.., .., tail.., ..]),
                ],
            );
            let values = concatenate(
                Axis(2),
                &[
                    stored_layer.values.slice(s![.., .., ..sink, ..]),
                    new_values.slice(s![.., .., tail.., ..]),
                ],
            );
            return join(layer_idx, keys, values);
        }

        let kept = w - self.num_sink_tokens - n;
        let shift = stored + n - w;
        let start = self.num_sink_tokens + shift;

        let sink_keys = stored_layer.keys.slice(s![.., .., ..sink, ..]).to_owned();
        let sink_values = stored_layer.values.slice(s![.., .., ..sink, ..]).to_owned();
        let mut middle_keys = stored_layer
            .keys
            .slice(s![.., .., start..start + kept, ..])
            .to_owned();
        let middle_values = stored_layer
            .values
            .slice(s![.., .., start..start + kept, ..])
            .to_owned();

        if self.rotary && shift > 0 && kept > 0 {
            let tables = extra.rotary.ok_or_else(|| {
                GenerationError::MissingRotaryTables(
                    "rotary sink cache shifted without cos/sin tables".to_string(),
                )
            })?;
            let partial = tables.partial_rotation_size;
            let (cos, sin) = self.rerotation(tables, shift, kept)?;
            apply_rotary_inplace(&mut middle_keys, cos.view(), sin.view(), partial)?;
        }

        let keys = concatenate(
            Axis(2),
            &[sink_keys.view(), middle_keys.view(), new_keys.view()],
        );
        let values = concatenate(
            Axis(2),
            &[sink_values.view(), middle_values.view(), new_values.view()],
        );
        join(layer_idx, keys, values)
    }
}

fn join(
    layer_idx: usize,
    keys: std::result::Result<Array4<f32>, ndarray::ShapeError>,
    values: std::result::Result<Array4<f32>, ndarray::ShapeError>,
) -> Result<LayerKV> {
    let misaligned = |e: ndarray::ShapeError| GenerationError::MisalignedCache {
        layer: layer_idx,
        reason: e.to_string(),
    };
    Ok(LayerKV::new(keys.map_err(misaligned)?, values.map_err(misaligned)?))
}

impl KVCache for SinkCache {
    fn update(
        &mut self,
        layer_idx: usize,
        new_keys: &Array4<f32>,
        new_values: &Array4<f32>,
        extra: &CacheUpdateExtra<'_>,
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

        let n = new_keys.dim().2;
        let stored = self.layers.get(layer_idx).map(LayerKV::len).unwrap_or(0);

        if layer_idx == self.layers.len() {
            self.layers
                .push(LayerKV::new(new_keys.to_owned(), new_values.to_owned()));
        } else if stored == 0 {
            self.layers[layer_idx] = LayerKV::new(new_keys.to_owned(), new_values.to_owned());
        } else if stored + n < self.window_length {
            let layer = &self.layers[layer_idx];
            let keys = concatenate(Axis(2), &[layer.keys.view(), new_keys.view()]);
            let values = concatenate(Axis(2), &[layer.values.view(), new_values.view()]);
            self.layers[layer_idx] = join(layer_idx, keys, values)?;
        } else {
            if layer_idx == 0 && !self.shifting {
                debug!(
                    "Sink cache window full (window={}, sink={}), sliding from here",
                    self.window_length, self.num_sink_tokens
                );
                self.shifting = true;
            }
            let shifted = self.slide(layer_idx, new_keys, new_values, extra)?;
            self.layers[layer_idx] = shifted;
        }

        if layer_idx == 0 {
            self.seen_tokens += n;
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
        Some(self.window_length)
    }

    fn usable_length(&self, new_positions: usize) -> usize {
        self.length()
            .min(self.window_length.saturating_sub(new_positions))
    }

    fn position_offset(&self, new_positions: usize) -> usize {
        self.usable_length(new_positions)
    }

    fn attention_length(&self, new_positions: usize) -> usize {
        let stored = self.length();
        if stored == 0 || stored + new_positions < self.window_length {
            return stored + new_positions;
        }
        let budget = self.window_length - self.num_sink_tokens;
        if new_positions > budget {
            self.num_sink_tokens.min(stored) + budget
        } else {
            self.window_length
        }
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

    fn crop(&mut self, _max_positions: usize) -> Result<()> {
        Err(GenerationError::InvalidConfig(
            "a sink cache cannot be cropped".to_string(),
        ))
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
        self.shifting = false;
    }
}
