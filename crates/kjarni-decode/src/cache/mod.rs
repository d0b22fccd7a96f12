//! Key/value cache implementations for autoregressive decoding.
//!
//! Three policies share one contract ([`KVCache`]):
//!
//! | Policy | Positions kept | `max_length` |
//! |--------|----------------|--------------|
//! | [`DynamicCache`] | every position written | unbounded |
//! | [`SinkCache`] | `S` sink positions + sliding window | `W` |
//! | [`StaticCache`] | pre-allocated buffer, written by index | `max_cache_length` |
//!
//! Tensors are `[batch, heads, positions, head_dim]`. The controller owns a
//! [`ModelCache`] for the duration of one `generate` call and hands it to the
//! model by `&mut`; there are no back-references.

mod dynamic;
mod sink;
mod static_cache;

pub use dynamic::DynamicCache;
pub use sink::SinkCache;
pub use static_cache::{CacheDType, StaticCache};

use ndarray::{Array4, ArrayView4, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{GenerationError, Result};
use crate::rope::RotaryTables;

/// Policy-agnostic interchange: one `(keys, values)` pair per layer holding
/// the currently usable window.
pub type PlainCache = Vec<(Array4<f32>, Array4<f32>)>;

/// Keys and values for one transformer layer.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerKV {
    pub keys: Array4<f32>,
    pub values: Array4<f32>,
}

impl LayerKV {
    pub fn new(keys: Array4<f32>, values: Array4<f32>) -> Self {
        Self { keys, values }
    }

    /// Positions held on the position axis.
    pub fn len(&self) -> usize {
        self.keys.dim().2
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn batch_size(&self) -> usize {
        self.keys.dim().0
    }
}

/// Variant-specific inputs to [`KVCache::update`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheUpdateExtra<'a> {
    /// Full cos/sin tables; required by a rotary [`SinkCache`] once it shifts.
    pub rotary: Option<RotaryTables<'a>>,
    /// Write positions; required by [`StaticCache`].
    pub cache_position: Option<&'a [usize]>,
}

impl<'a> CacheUpdateExtra<'a> {
    pub fn with_rotary(mut self, tables: RotaryTables<'a>) -> Self {
        self.rotary = Some(tables);
        self
    }

    pub fn with_cache_position(mut self, positions: &'a [usize]) -> Self {
        self.cache_position = Some(positions);
        self
    }
}

/// Shape of the cache a model needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheLayout {
    pub num_layers: usize,
    pub num_heads: usize,
    pub head_dim: usize,
}

/// The contract every cache policy implements.
pub trait KVCache {
    /// Stores `new_keys`/`new_values` for `layer_idx` and returns the keys and
    /// values attention should use this step.
    fn update(
        &mut self,
        layer_idx: usize,
        new_keys: &Array4<f32>,
        new_values: &Array4<f32>,
        extra: &CacheUpdateExtra<'_>,
    ) -> Result<(ArrayView4<'_, f32>, ArrayView4<'_, f32>)>;

    /// Positions usable by attention (layer 0).
    fn length(&self) -> usize;

    /// Positions ever written (layer 0). Never decreases except on `clear`/`crop`.
    fn seen(&self) -> usize;

    /// Upper bound on `length`, `None` when unbounded.
    fn max_length(&self) -> Option<usize>;

    /// Old positions still usable once `new_positions` more are written.
    fn usable_length(&self, new_positions: usize) -> usize;

    /// Position index the next written token is rotated/embedded at.
    fn position_offset(&self, new_positions: usize) -> usize {
        let _ = new_positions;
        self.seen()
    }

    /// Key/value length attention sees after `new_positions` are written.
    fn attention_length(&self, new_positions: usize) -> usize;

    /// Gathers batch rows so row `i` becomes old row `beam_indices[i]`.
    /// The batch size is unchanged.
    fn reorder(&mut self, beam_indices: &[usize]) -> Result<()>;

    /// Gathers batch rows into a batch of `indices.len()` rows.
    fn select_batch(&mut self, indices: &[usize]) -> Result<()>;

    /// Drops every position at or beyond `max_positions`.
    fn crop(&mut self, max_positions: usize) -> Result<()>;

    fn to_plain(&self) -> PlainCache;

    /// Read access to one layer's usable keys and values.
    fn layer(&self, layer_idx: usize) -> Option<(ArrayView4<'_, f32>, ArrayView4<'_, f32>)>;

    fn num_layers(&self) -> usize;

    /// `None` while nothing has been written.
    fn batch_size(&self) -> Option<usize>;

    fn clear(&mut self);
}

/// Which cache policy to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheImplementation {
    Dynamic,
    Sink,
    Static,
}

/// Fully specified cache policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CacheKind {
    Dynamic,
    Sink {
        window_length: usize,
        num_sink_tokens: usize,
        rotary: bool,
    },
    Static {
        max_batch_size: usize,
        max_cache_length: usize,
        dtype: CacheDType,
    },
}

/// A cache of any policy. Dispatch is a plain `match`.
#[derive(Debug, Clone)]
pub enum ModelCache {
    Dynamic(DynamicCache),
    Sink(SinkCache),
    Static(StaticCache),
}

macro_rules! dispatch {
    ($self:expr, $cache:ident => $body:expr) => {
        match $self {
            ModelCache::Dynamic($cache) => $body,
            ModelCache::Sink($cache) => $body,
            ModelCache::Static($cache) => $body,
        }
    };
}

impl ModelCache {
    /// Builds an empty cache of the given policy.
    pub fn new(kind: &CacheKind, layout: &CacheLayout) -> Result<Self> {
        Ok(match *kind {
            CacheKind::Dynamic => ModelCache::Dynamic(DynamicCache::new()),
            CacheKind::Sink {
                window_length,
                num_sink_tokens,
                rotary,
            } => ModelCache::Sink(SinkCache::new(window_length, num_sink_tokens, rotary)?),
            CacheKind::Static {
                max_batch_size,
                max_cache_length,
                dtype,
            } => ModelCache::Static(StaticCache::new(
                max_batch_size,
                max_cache_length,
                layout.num_layers,
                layout.num_heads,
                layout.head_dim,
                dtype,
            )?),
        })
    }

    /// Rebuilds a cache of the given policy from the plain representation.
    pub fn from_plain(plain: PlainCache, kind: &CacheKind) -> Result<Self> {
        Ok(match *kind {
            CacheKind::Dynamic => ModelCache::Dynamic(DynamicCache::from_plain(plain)?),
            CacheKind::Sink {
                window_length,
                num_sink_tokens,
                rotary,
            } => ModelCache::Sink(SinkCache::from_plain(
                plain,
                window_length,
                num_sink_tokens,
                rotary,
            )?),
            CacheKind::Static {
                max_cache_length,
                dtype,
                ..
            } => ModelCache::Static(StaticCache::from_plain(plain, max_cache_length, dtype)?),
        })
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            ModelCache::Dynamic(_) => "dynamic",
            ModelCache::Sink(_) => "sink",
            ModelCache::Static(_) => "static",
        }
    }

    pub fn is_static(&self) -> bool {
        matches!(self, ModelCache::Static(_))
    }
}

impl KVCache for ModelCache {
    fn update(
        &mut self,
        layer_idx: usize,
        new_keys: &Array4<f32>,
        new_values: &Array4<f32>,
        extra: &CacheUpdateExtra<'_>,
    ) -> Result<(ArrayView4<'_, f32>, ArrayView4<'_, f32>)> {
        dispatch!(self, c => c.update(layer_idx, new_keys, new_values, extra))
    }

    fn length(&self) -> usize {
        dispatch!(self, c => c.length())
    }

    fn seen(&self) -> usize {
        dispatch!(self, c => c.seen())
    }

    fn max_length(&self) -> Option<usize> {
        dispatch!(self, c => c.max_length())
    }

    fn usable_length(&self, new_positions: usize) -> usize {
        dispatch!(self, c => c.usable_length(new_positions))
    }

    fn position_offset(&self, new_positions: usize) -> usize {
        dispatch!(self, c => c.position_offset(new_positions))
    }

    fn attention_length(&self, new_positions: usize) -> usize {
        dispatch!(self, c => c.attention_length(new_positions))
    }

    fn reorder(&mut self, beam_indices: &[usize]) -> Result<()> {
        dispatch!(self, c => c.reorder(beam_indices))
    }

    fn select_batch(&mut self, indices: &[usize]) -> Result<()> {
        dispatch!(self, c => c.select_batch(indices))
    }

    fn crop(&mut self, max_positions: usize) -> Result<()> {
        dispatch!(self, c => c.crop(max_positions))
    }

    fn to_plain(&self) -> PlainCache {
        dispatch!(self, c => c.to_plain())
    }

    fn layer(&self, layer_idx: usize) -> Option<(ArrayView4<'_, f32>, ArrayView4<'_, f32>)> {
        dispatch!(self, c => c.layer(layer_idx))
    }

    fn num_layers(&self) -> usize {
        dispatch!(self, c => c.num_layers())
    }

    fn batch_size(&self) -> Option<usize> {
        dispatch!(self, c => c.batch_size())
    }

    fn clear(&mut self) {
        dispatch!(self, c => c.clear())
    }
}

// ---------------------------------------------------------------------------
//  Shared validation and gather helpers
// ---------------------------------------------------------------------------

/// Checks a new key/value pair against itself and against what is stored.
pub(crate) fn check_update(
    layer_idx: usize,
    stored: Option<&LayerKV>,
    reference_batch: Option<usize>,
    new_keys: &Array4<f32>,
    new_values: &Array4<f32>,
) -> Result<()> {
    if new_keys.dim() != new_values.dim() {
        return Err(GenerationError::shape(
            "cache",
            new_keys.shape(),
            new_values.shape(),
        ));
    }
    let (batch, heads, _, head_dim) = new_keys.dim();

    if let Some(expected) = stored.map(LayerKV::batch_size).or(reference_batch) {
        if expected != batch {
            return Err(GenerationError::BatchMismatch {
                component: "cache",
                expected,
                actual: batch,
            });
        }
    }
    if let Some(stored) = stored {
        let (_, stored_heads, _, stored_dim) = stored.keys.dim();
        if stored_heads != heads || stored_dim != head_dim {
            return Err(GenerationError::MisalignedCache {
                layer: layer_idx,
                reason: format!(
                    "stored heads x head_dim = {}x{}, new = {}x{}",
                    stored_heads, stored_dim, heads, head_dim
                ),
            });
        }
    }
    Ok(())
}

/// Validates gather indices against the current batch.
pub(crate) fn check_indices(indices: &[usize], batch: usize) -> Result<()> {
    if let Some(&bad) = indices.iter().find(|&&i| i >= batch) {
        return Err(GenerationError::BatchMismatch {
            component: "cache reorder",
            expected: batch,
            actual: bad,
        });
    }
    Ok(())
}

/// `arr[indices, ...]` along the batch axis.
pub(crate) fn gather_batch(arr: &Array4<f32>, indices: &[usize]) -> Array4<f32> {
    arr.select(Axis(0), indices)
}

/// Checks a plain cache for per-layer consistency and returns its batch size.
pub(crate) fn check_plain(plain: &PlainCache) -> Result<Option<usize>> {
    let mut batch = None;
    let mut positions = None;
    for (layer_idx, (keys, values)) in plain.iter().enumerate() {
        if keys.dim() != values.dim() {
            return Err(GenerationError::shape("plain cache", keys.shape(), values.shape()));
        }
        let (b, _, p, _) = keys.dim();
        match batch {
            Some(expected) if expected != b => {
                return Err(GenerationError::BatchMismatch {
                    component: "plain cache",
                    expected,
                    actual: b,
                });
            }
            _ => batch = Some(b),
        }
        match positions {
            Some(expected) if expected != p => {
                return Err(GenerationError::MisalignedCache {
                    layer: layer_idx,
                    reason: format!("{} positions, layer 0 has {}", p, expected),
                });
            }
            _ => positions = Some(p),
        }
    }
    Ok(batch)
}
