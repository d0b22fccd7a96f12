// Allow this module to be used by other tests, but not compiled into the final library.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow, ensure};
use ndarray::{Array2, Array3, Array4, ArrayView2};

use crate::cache::{CacheLayout, CacheUpdateExtra, KVCache, ModelCache};
use crate::model::{DecoderModel, FnModel, ModelInput, ModelOutput};

pub const LAYOUT: CacheLayout = CacheLayout {
    num_layers: 2,
    num_heads: 1,
    head_dim: 2,
};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Logits with `peak` at `token` and zero elsewhere.
pub fn peaked(vocab: usize, token: usize, peak: f32) -> Vec<f32> {
    let mut row = vec![0.0; vocab];
    row[token] = peak;
    row
}

pub fn one_hot(vocab: usize, token: u32) -> Vec<f32> {
    peaked(vocab, token as usize, 1.0)
}

/// Writes one key/value entry per new token into every layer.
pub fn write_cache(input: &ModelInput<'_>, cache: &mut ModelCache) -> Result<()> {
    let (batch, positions) = input.input_ids.dim();
    let keys = Array4::from_shape_fn(
        (batch, LAYOUT.num_heads, positions, LAYOUT.head_dim),
        |(b, _, p, d)| input.input_ids[[b, p]] as f32 + d as f32 * 0.5,
    );
    let values = keys.mapv(|k| -k);
    let extra = CacheUpdateExtra::default().with_cache_position(&input.cache_position);
    for layer in 0..LAYOUT.num_layers {
        cache.update(layer, &keys, &values, &extra)?;
    }
    Ok(())
}

/// `(batch, positions, vocab)` logits, one `next(row, position)` call per
/// returned position; `position` is the index the predicted token will take.
pub fn logits_for<F>(input: &ModelInput<'_>, vocab: usize, next: &F) -> Array3<f32>
where
    F: Fn(usize, usize) -> Vec<f32>,
{
    let (batch, positions) = input.input_ids.dim();
    let mut logits = Array3::zeros((batch, positions, vocab));
    for b in 0..batch {
        for p in 0..positions {
            let row = next(b, input.position_ids[[b, p]] + 1);
            for (v, value) in row.into_iter().enumerate() {
                logits[[b, p, v]] = value;
            }
        }
    }
    logits
}

/// A decoder whose logits depend only on the row and the position being predicted.
pub fn scripted<F>(vocab: usize, next: F) -> FnModel
where
    F: Fn(usize, usize) -> Vec<f32> + Send + Sync + 'static,
{
    FnModel::new(vocab, LAYOUT, move |input, cache| {
        write_cache(input, cache)?;
        Ok(ModelOutput::new(logits_for(input, vocab, &next)))
    })
}

/// Like [`scripted`], but every forward also returns one-hot hidden states of the input tokens.
pub fn scripted_with_hidden<F>(vocab: usize, next: F) -> FnModel
where
    F: Fn(usize, usize) -> Vec<f32> + Send + Sync + 'static,
{
    FnModel::new(vocab, LAYOUT, move |input, cache| {
        write_cache(input, cache)?;
        let output = ModelOutput::new(logits_for(input, vocab, &next));
        if !input.output_hidden_states {
            return Ok(output);
        }
        let (batch, positions) = input.input_ids.dim();
        let hidden = Array3::from_shape_fn((batch, positions, vocab), |(b, p, h)| {
            one_hot(vocab, input.input_ids[[b, p]])[h]
        });
        Ok(output.with_hidden_states(vec![hidden]))
    })
}

/// Records the batch size of every forward call.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    batches: Arc<Mutex<Vec<usize>>>,
    calls: Arc<AtomicUsize>,
}

impl CallLog {
    pub fn record(&self, batch: usize) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut batches) = self.batches.lock() {
            batches.push(batch);
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn batches(&self) -> Vec<usize> {
        self.batches.lock().map(|b| b.clone()).unwrap_or_default()
    }
}

/// [`scripted`] plus a [`CallLog`].
pub fn logged<F>(vocab: usize, log: CallLog, next: F) -> FnModel
where
    F: Fn(usize, usize) -> Vec<f32> + Send + Sync + 'static,
{
    FnModel::new(vocab, LAYOUT, move |input, cache| {
        log.record(input.batch_size());
        write_cache(input, cache)?;
        Ok(ModelOutput::new(logits_for(input, vocab, &next)))
    })
}

/// Copies the source sentence: the decoder token at position `p` is source token `p - 1`.
pub struct CopySeq2Seq {
    pub vocab: usize,
}

impl DecoderModel for CopySeq2Seq {
    fn forward(&self, input: &ModelInput<'_>, cache: &mut ModelCache) -> Result<ModelOutput> {
        let encoded = input
            .extras
            .encoder_hidden_states
            .as_ref()
            .ok_or_else(|| anyhow!("encoder states missing"))?;
        ensure!(
            encoded.dim().0 == input.batch_size(),
            "encoder batch {} != decoder batch {}",
            encoded.dim().0,
            input.batch_size()
        );
        write_cache(input, cache)?;
        let source_len = encoded.dim().1;
        let logits = logits_for(input, self.vocab, &|row, position| {
            let source_pos = (position - 1).min(source_len - 1);
            peaked(self.vocab, encoded[[row, source_pos, 0]] as usize, 10.0)
        });
        Ok(ModelOutput::new(logits))
    }

    fn vocab_size(&self) -> usize {
        self.vocab
    }

    fn cache_layout(&self) -> CacheLayout {
        LAYOUT
    }

    fn is_encoder_decoder(&self) -> bool {
        true
    }

    fn encode(&self, input_ids: ArrayView2<'_, u32>, _attention_mask: ArrayView2<'_, u8>) -> Result<Array3<f32>> {
        let (batch, len) = input_ids.dim();
        Ok(Array3::from_shape_fn((batch, len, 1), |(b, s, _)| input_ids[[b, s]] as f32))
    }

    fn decoder_start_token_id(&self) -> Option<u32> {
        Some(0)
    }
}

pub fn prompt(rows: &[&[u32]]) -> Array2<u32> {
    let width = rows.first().map_or(0, |r| r.len());
    Array2::from_shape_fn((rows.len(), width), |(r, c)| rows[r][c])
}
