use log::debug;
use ndarray::{Array2, ArrayView2, Axis, concatenate, s};

use super::{DecoderModel, Device, ModelExtras, ModelInput, ModelOutput};
use crate::cache::{KVCache, ModelCache};
use crate::error::{GenerationError, Result};

/// Prepares per-step inputs for a [`DecoderModel`] and checks what comes back.
pub struct ModelAdapter<'m, M: DecoderModel + ?Sized> {
    model: &'m M,
    vocab_size: usize,
    num_logits_to_keep: Option<usize>,
    output_hidden_states: bool,
    output_attentions: bool,
    use_cache: bool,
}

impl<'m, M: DecoderModel + ?Sized> ModelAdapter<'m, M> {
    /// Fails with `DeviceMismatch` unless the model runs where the caches live.
    pub fn new(model: &'m M) -> Result<Self> {
        let device = model.device();
        if device != Device::Cpu {
            return Err(GenerationError::DeviceMismatch(format!(
                "caches live on the CPU, model reports {:?}",
                device
            )));
        }
        Ok(Self {
            model,
            vocab_size: model.vocab_size(),
            num_logits_to_keep: None,
            output_hidden_states: false,
            output_attentions: false,
            use_cache: true,
        })
    }

    pub fn with_num_logits_to_keep(mut self, keep: Option<usize>) -> Self {
        self.num_logits_to_keep = keep;
        self
    }

    pub fn with_outputs(mut self, hidden_states: bool, attentions: bool) -> Self {
        self.output_hidden_states = hidden_states;
        self.output_attentions = attentions;
        self
    }

    pub fn with_use_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = use_cache;
        self
    }

    pub fn model(&self) -> &M {
        self.model
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    /// Runs one forward pass over `input_ids` (the positions not yet cached).
    ///
    /// `full_mask` covers every position of the sequence, the new ones
    /// included; it is cut or padded to the keys the cache will return.
    /// Positions default to `position_offset..position_offset + T`.
    pub fn call<'a>(
        &self,
        step: usize,
        input_ids: ArrayView2<'a, u32>,
        full_mask: ArrayView2<'_, u8>,
        cache: &mut ModelCache,
        position_ids: Option<Array2<usize>>,
        extras: &'a ModelExtras,
    ) -> Result<ModelOutput> {
        let (batch, new_positions) = input_ids.dim();
        if full_mask.nrows() != batch || full_mask.ncols() < new_positions {
            return Err(GenerationError::shape(
                "adapter.attention_mask",
                (batch, format!(">= {}", new_positions)),
                full_mask.shape(),
            ));
        }

        let position_ids = match position_ids {
            Some(ids) if ids.dim() != (batch, new_positions) => {
                return Err(GenerationError::shape(
                    "adapter.position_ids",
                    (batch, new_positions),
                    ids.shape(),
                ));
            }
            Some(ids) => ids,
            None => {
                let offset = cache.position_offset(new_positions);
                Array2::from_shape_fn((batch, new_positions), |(_, j)| offset + j)
            }
        };
        let seen = cache.seen();
        let cache_position: Vec<usize> = (seen..seen + new_positions).collect();
        let attention_mask = attention_mask_for_cache(cache, full_mask, new_positions);

        let input = ModelInput {
            input_ids,
            attention_mask,
            position_ids,
            cache_position,
            use_cache: self.use_cache,
            num_logits_to_keep: self.num_logits_to_keep,
            output_hidden_states: self.output_hidden_states,
            output_attentions: self.output_attentions,
            extras,
        };

        let mut output = self.model.forward(&input, cache).map_err(|err| {
            match err.downcast::<GenerationError>() {
                Ok(typed) => typed.at_step(step, "model"),
                Err(source) => GenerationError::ModelCallableFailed { step, source },
            }
        })?;

        let returned = output.logits.dim().1;
        if let Some(keep) = self.num_logits_to_keep {
            if returned > keep {
                output.logits = output.logits.slice(s![.., returned - keep.., ..]).to_owned();
            }
        }

        let expected_positions = self
            .num_logits_to_keep
            .map_or(new_positions, |keep| keep.min(new_positions));
        let expected = (batch, expected_positions, self.vocab_size);
        if output.logits.dim() != expected {
            return Err(GenerationError::shape("adapter.logits", expected, output.logits.dim()).at_step(step, "model"));
        }
        if self.output_hidden_states && output.hidden_states.is_none() {
            debug!("Step {}: hidden states requested but not returned", step);
        }
        Ok(output)
    }
}

/// Cuts or pads `full_mask` to the key length the cache will return once
/// `new_positions` more are written.
///
/// Growing caches keep the trailing columns, a sink cache keeps its sink
/// columns plus the trailing window, and a static cache sees the mask
/// zero-padded to its full buffer.
pub fn attention_mask_for_cache(cache: &ModelCache, full_mask: ArrayView2<'_, u8>, new_positions: usize) -> Array2<u8> {
    let (batch, width) = full_mask.dim();
    let target = cache.attention_length(new_positions);

    match cache {
        ModelCache::Static(_) => {
            let mut mask = Array2::zeros((batch, target));
            let copied = width.min(target);
            mask.slice_mut(s![.., ..copied])
                .assign(&full_mask.slice(s![.., ..copied]));
            mask
        }
        _ if target >= width => full_mask.to_owned(),
        ModelCache::Sink(sink) => {
            let sink_cols = sink.num_sink_tokens().min(target);
            let tail = target - sink_cols;
            concatenate(
                Axis(1),
                &[
                    full_mask.slice(s![.., ..sink_cols]),
                    full_mask.slice(s![.., width - tail..]),
                ],
            )
            .unwrap_or_else(|_| full_mask.slice(s![.., width - target..]).to_owned())
        }
        ModelCache::Dynamic(_) => full_mask.slice(s![.., width - target..]).to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheKind, CacheLayout, CacheUpdateExtra, DynamicCache, SinkCache, StaticCache, CacheDType};
    use crate::model::FnModel;
    use ndarray::{Array3, Array4, array};
    use std::sync::{Arc, Mutex};

    const LAYOUT: CacheLayout = CacheLayout {
        num_layers: 1,
        num_heads: 1,
        head_dim: 2,
    };

    /// Writes one position per new token and returns zero logits.
    fn writing_model(vocab: usize, seen: Arc<Mutex<Vec<ModelInputRecord>>>) -> FnModel {
        FnModel::new(vocab, LAYOUT, move |input, cache| {
            let (b, t) = input.input_ids.dim();
            let kv = Array4::<f32>::ones((b, 1, t, 2));
            let extra = CacheUpdateExtra::default().with_cache_position(&input.cache_position);
            cache.update(0, &kv, &kv, &extra)?;
            seen.lock().unwrap().push(ModelInputRecord {
                mask: input.attention_mask.clone(),
                positions: input.position_ids.clone(),
                cache_position: input.cache_position.clone(),
            });
            Ok(ModelOutput::new(Array3::zeros((b, t, vocab))))
        })
        .with_static_cache_support()
    }

    #[derive(Debug, Clone)]
    struct ModelInputRecord {
        mask: Array2<u8>,
        positions: Array2<usize>,
        cache_position: Vec<usize>,
    }

    #[test]
    fn test_positions_follow_the_cache() {
        let records = Arc::new(Mutex::new(Vec::new()));
        let model = writing_model(5, records.clone());
        let adapter = ModelAdapter::new(&model).unwrap();
        let mut cache = ModelCache::Dynamic(DynamicCache::new());
        let extras = ModelExtras::default();

        let prompt = array![[3u32, 4, 1]];
        adapter
            .call(0, prompt.view(), array![[1u8, 1, 1]].view(), &mut cache, None, &extras)
            .unwrap();
        adapter
            .call(1, array![[2u32]].view(), array![[1u8, 1, 1, 1]].view(), &mut cache, None, &extras)
            .unwrap();

        let records = records.lock().unwrap();
        assert_eq!(records[0].positions, array![[0, 1, 2]]);
        assert_eq!(records[1].positions, array![[3]]);
        assert_eq!(records[1].cache_position, vec![3]);
        assert_eq!(records[1].mask, array![[1, 1, 1, 1]]);
    }

    #[test]
    fn test_static_mask_is_zero_padded() {
        let records = Arc::new(Mutex::new(Vec::new()));
        let model = writing_model(5, records.clone());
        let adapter = ModelAdapter::new(&model).unwrap();
        let mut cache = ModelCache::Static(StaticCache::new(1, 6, 1, 1, 2, CacheDType::F32).unwrap());

        adapter
            .call(
                0,
                array![[3u32, 4]].view(),
                array![[0u8, 1]].view(),
                &mut cache,
                None,
                &ModelExtras::default(),
            )
            .unwrap();
        let records = records.lock().unwrap();
        assert_eq!(records[0].mask, array![[0, 1, 0, 0, 0, 0]]);
        assert_eq!(records[0].cache_position, vec![0, 1]);
    }

    #[test]
    fn test_sink_mask_keeps_sink_and_window() {
        let mut sink = SinkCache::new(4, 1, false).unwrap();
        let kv = Array4::<f32>::zeros((1, 1, 4, 2));
        sink.update(0, &kv, &kv, &CacheUpdateExtra::default()).unwrap();
        let cache = ModelCache::Sink(sink);

        let full = array![[1u8, 0, 1, 1, 0]];
        let mask = attention_mask_for_cache(&cache, full.view(), 1);
        assert_eq!(mask.ncols(), 4);
        assert_eq!(mask, array![[1, 1, 1, 0]]);
    }

    #[test]
    fn test_logits_are_narrowed() {
        let model = FnModel::new(3, LAYOUT, |input, _| {
            let (b, t) = input.input_ids.dim();
            Ok(ModelOutput::new(Array3::from_shape_fn((b, t, 3), |(_, p, _)| p as f32)))
        });
        let adapter = ModelAdapter::new(&model).unwrap().with_num_logits_to_keep(Some(1));
        let mut cache = ModelCache::new(&CacheKind::Dynamic, &LAYOUT).unwrap();
        let out = adapter
            .call(
                0,
                array![[1u32, 2, 0]].view(),
                array![[1u8, 1, 1]].view(),
                &mut cache,
                None,
                &ModelExtras::default(),
            )
            .unwrap();
        assert_eq!(out.logits.dim(), (1, 1, 3));
        assert_eq!(out.logits[[0, 0, 0]], 2.0);
    }

    #[test]
    fn test_wrong_vocab_is_shape_mismatch() {
        let model = FnModel::new(4, LAYOUT, |input, _| {
            let (b, t) = input.input_ids.dim();
            Ok(ModelOutput::new(Array3::zeros((b, t, 3))))
        });
        let adapter = ModelAdapter::new(&model).unwrap();
        let mut cache = ModelCache::Dynamic(DynamicCache::new());
        let err = adapter
            .call(
                2,
                array![[1u32]].view(),
                array![[1u8]].view(),
                &mut cache,
                None,
                &ModelExtras::default(),
            )
            .unwrap_err();
        assert!(matches!(err.root(), GenerationError::ShapeMismatch { .. }));
        assert!(matches!(err, GenerationError::AtStep { step: 2, .. }));
    }

    #[test]
    fn test_model_errors_are_wrapped() {
        let model = FnModel::new(4, LAYOUT, |_, _| Err(anyhow::anyhow!("kernel launch failed")));
        let adapter = ModelAdapter::new(&model).unwrap();
        let mut cache = ModelCache::Dynamic(DynamicCache::new());
        let err = adapter
            .call(
                5,
                array![[1u32]].view(),
                array![[1u8]].view(),
                &mut cache,
                None,
                &ModelExtras::default(),
            )
            .unwrap_err();
        match err {
            GenerationError::ModelCallableFailed { step, source } => {
                assert_eq!(step, 5);
                assert_eq!(source.to_string(), "kernel launch failed");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_typed_cache_errors_pass_through() {
        let model = FnModel::new(4, LAYOUT, |input, cache| {
            let kv = Array4::<f32>::zeros((input.batch_size(), 2, 1, 2));
            cache.update(0, &kv, &kv, &CacheUpdateExtra::default())?;
            let kv = Array4::<f32>::zeros((input.batch_size(), 3, 1, 2));
            cache.update(0, &kv, &kv, &CacheUpdateExtra::default())?;
            unreachable!()
        });
        let adapter = ModelAdapter::new(&model).unwrap();
        let mut cache = ModelCache::Dynamic(DynamicCache::new());
        let err = adapter
            .call(
                1,
                array![[1u32]].view(),
                array![[1u8]].view(),
                &mut cache,
                None,
                &ModelExtras::default(),
            )
            .unwrap_err();
        assert!(matches!(err.root(), GenerationError::MisalignedCache { .. }));
    }

    #[test]
    fn test_gpu_model_is_rejected() {
        let model = FnModel::new(4, LAYOUT, |_, _| unreachable!()).with_device(Device::Wgpu);
        assert!(matches!(
            ModelAdapter::new(&model),
            Err(GenerationError::DeviceMismatch(_))
        ));
    }
}
