//! The model callable seen by the generation loop.
//!
//! The loop never looks inside a model. It builds a [`ModelInput`] for the
//! new tokens, hands it over together with the cache, and reads logits (and
//! optionally hidden states) back from the [`ModelOutput`]. Model forward
//! math, weight loading and tokenization live behind [`DecoderModel`].

mod adapter;

pub use adapter::{ModelAdapter, attention_mask_for_cache};

use std::collections::BTreeMap;

use anyhow::anyhow;
use ndarray::{Array2, Array3, Array4, ArrayD, ArrayView2, Axis};

use crate::cache::{CacheLayout, ModelCache};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Cpu,
    Wgpu,
}

impl Device {
    pub fn is_cpu(&self) -> bool {
        matches!(self, Device::Cpu)
    }
    pub fn is_gpu(&self) -> bool {
        matches!(self, Device::Wgpu)
    }
}

/// Tensors the loop carries along without interpreting them.
///
/// Every tensor is batch-leading; rows are gathered together with the token
/// rows when beams are expanded or reordered.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelExtras {
    pub encoder_hidden_states: Option<Array3<f32>>,
    pub encoder_attention_mask: Option<Array2<u8>>,
    pub tensors: BTreeMap<String, ArrayD<f32>>,
}

impl ModelExtras {
    pub fn is_empty(&self) -> bool {
        self.encoder_hidden_states.is_none()
            && self.encoder_attention_mask.is_none()
            && self.tensors.is_empty()
    }

    pub fn with_tensor(mut self, name: impl Into<String>, tensor: ArrayD<f32>) -> Self {
        self.tensors.insert(name.into(), tensor);
        self
    }

    /// Gathers batch rows; row `i` of the result is row `rows[i]` of `self`.
    pub fn select_rows(&self, rows: &[usize]) -> Self {
        Self {
            encoder_hidden_states: self
                .encoder_hidden_states
                .as_ref()
                .map(|t| t.select(Axis(0), rows)),
            encoder_attention_mask: self
                .encoder_attention_mask
                .as_ref()
                .map(|t| t.select(Axis(0), rows)),
            tensors: self
                .tensors
                .iter()
                .map(|(name, t)| (name.clone(), t.select(Axis(0), rows)))
                .collect(),
        }
    }

    /// Repeats every row `times` times in place (`[a, b]` -> `[a, a, b, b]`).
    pub fn repeat_interleave(&self, batch: usize, times: usize) -> Self {
        if times == 1 {
            return self.clone();
        }
        let rows: Vec<usize> = (0..batch).flat_map(|b| std::iter::repeat_n(b, times)).collect();
        self.select_rows(&rows)
    }
}

/// One forward request.
#[derive(Debug, Clone)]
pub struct ModelInput<'a> {
    /// `(batch, new_positions)` tokens not yet in the cache.
    pub input_ids: ArrayView2<'a, u32>,
    /// `(batch, attention_length)` mask aligned with the keys the cache
    /// returns after this step's update.
    pub attention_mask: Array2<u8>,
    /// `(batch, new_positions)` positions of the new tokens.
    pub position_ids: Array2<usize>,
    /// Write positions, used by a static cache.
    pub cache_position: Vec<usize>,
    pub use_cache: bool,
    pub num_logits_to_keep: Option<usize>,
    pub output_hidden_states: bool,
    pub output_attentions: bool,
    pub extras: &'a ModelExtras,
}

impl ModelInput<'_> {
    pub fn batch_size(&self) -> usize {
        self.input_ids.nrows()
    }

    pub fn new_positions(&self) -> usize {
        self.input_ids.ncols()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelOutput {
    /// `(batch, positions, vocab)`.
    pub logits: Array3<f32>,
    /// One `(batch, positions, hidden)` tensor per layer, last layer last.
    pub hidden_states: Option<Vec<Array3<f32>>>,
    pub attentions: Option<Vec<Array4<f32>>>,
}

impl ModelOutput {
    pub fn new(logits: Array3<f32>) -> Self {
        Self {
            logits,
            hidden_states: None,
            attentions: None,
        }
    }

    pub fn with_hidden_states(mut self, hidden_states: Vec<Array3<f32>>) -> Self {
        self.hidden_states = Some(hidden_states);
        self
    }

    pub fn with_attentions(mut self, attentions: Vec<Array4<f32>>) -> Self {
        self.attentions = Some(attentions);
        self
    }

    pub fn last_hidden_state(&self) -> Option<&Array3<f32>> {
        self.hidden_states.as_ref().and_then(|h| h.last())
    }
}

/// An autoregressive model as the generation loop sees it.
///
/// `forward` receives only the positions not yet cached and writes their
/// keys/values into `cache` through [`crate::cache::KVCache::update`].
pub trait DecoderModel: Send + Sync {
    fn forward(&self, input: &ModelInput<'_>, cache: &mut ModelCache) -> anyhow::Result<ModelOutput>;

    fn vocab_size(&self) -> usize;

    fn cache_layout(&self) -> CacheLayout;

    fn device(&self) -> Device {
        Device::Cpu
    }

    /// Whether the model tolerates fixed-shape caches (full-buffer keys plus a
    /// zero-padded mask).
    fn supports_static_cache(&self) -> bool {
        false
    }

    /// Whether keys are stored rotated, so a sliding window must re-rotate them.
    fn uses_rotary(&self) -> bool {
        false
    }

    fn is_encoder_decoder(&self) -> bool {
        false
    }

    /// Runs the encoder over the prompt. Only encoder-decoder models implement it.
    fn encode(&self, input_ids: ArrayView2<'_, u32>, attention_mask: ArrayView2<'_, u8>) -> anyhow::Result<Array3<f32>> {
        let _ = (input_ids, attention_mask);
        Err(anyhow!("model has no encoder"))
    }

    fn decoder_start_token_id(&self) -> Option<u32> {
        None
    }
}

type ForwardFn = dyn Fn(&ModelInput<'_>, &mut ModelCache) -> anyhow::Result<ModelOutput> + Send + Sync;

/// A closure used as a decoder-only model.
pub struct FnModel {
    forward: Box<ForwardFn>,
    vocab_size: usize,
    layout: CacheLayout,
    device: Device,
    static_cache: bool,
    rotary: bool,
}

impl FnModel {
    pub fn new<F>(vocab_size: usize, layout: CacheLayout, forward: F) -> Self
    where
        F: Fn(&ModelInput<'_>, &mut ModelCache) -> anyhow::Result<ModelOutput> + Send + Sync + 'static,
    {
        Self {
            forward: Box::new(forward),
            vocab_size,
            layout,
            device: Device::Cpu,
            static_cache: false,
            rotary: false,
        }
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn with_static_cache_support(mut self) -> Self {
        self.static_cache = true;
        self
    }

    pub fn with_rotary(mut self) -> Self {
        self.rotary = true;
        self
    }
}

impl std::fmt::Debug for FnModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnModel")
            .field("vocab_size", &self.vocab_size)
            .field("layout", &self.layout)
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

impl DecoderModel for FnModel {
    fn forward(&self, input: &ModelInput<'_>, cache: &mut ModelCache) -> anyhow::Result<ModelOutput> {
        (self.forward)(input, cache)
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn cache_layout(&self) -> CacheLayout {
        self.layout
    }

    fn device(&self) -> Device {
        self.device
    }

    fn supports_static_cache(&self) -> bool {
        self.static_cache
    }

    fn uses_rotary(&self) -> bool {
        self.rotary
    }
}

impl<M: DecoderModel + ?Sized> DecoderModel for std::sync::Arc<M> {
    fn forward(&self, input: &ModelInput<'_>, cache: &mut ModelCache) -> anyhow::Result<ModelOutput> {
        (**self).forward(input, cache)
    }
    fn vocab_size(&self) -> usize {
        (**self).vocab_size()
    }
    fn cache_layout(&self) -> CacheLayout {
        (**self).cache_layout()
    }
    fn device(&self) -> Device {
        (**self).device()
    }
    fn supports_static_cache(&self) -> bool {
        (**self).supports_static_cache()
    }
    fn uses_rotary(&self) -> bool {
        (**self).uses_rotary()
    }
    fn is_encoder_decoder(&self) -> bool {
        (**self).is_encoder_decoder()
    }
    fn encode(&self, input_ids: ArrayView2<'_, u32>, attention_mask: ArrayView2<'_, u8>) -> anyhow::Result<Array3<f32>> {
        (**self).encode(input_ids, attention_mask)
    }
    fn decoder_start_token_id(&self) -> Option<u32> {
        (**self).decoder_start_token_id()
    }
}
