//! The generation controller.
//!
//! [`Generator::generate`] validates the configuration, picks a cache, and
//! runs the step loop of the selected [`GenerationMode`]:
//!
//! ```text
//! model call -> last-position logits -> processors -> token selection
//!   -> (beam: cache reorder) -> append tokens, extend mask -> stopping
//! ```
//!
//! The loop is synchronous; [`generate_async`] moves a whole call onto the
//! blocking pool.

mod beam;
mod contrastive;
mod output;
mod search;

pub use output::GenerationOutput;

use std::sync::Arc;
use std::time::Instant;

use log::{debug, info, warn};
use ndarray::{Array2, Array3, Array4, ArrayView2, Axis, s};
use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::beam::gather_rows;
use crate::cache::{CacheImplementation, CacheKind, KVCache, ModelCache};
use crate::common::CancellationToken;
use crate::config::{GenerationConfig, GenerationMode};
use crate::error::{GenerationError, Result};
use crate::logits::LogitsProcessorList;
use crate::model::{DecoderModel, ModelAdapter, ModelExtras, ModelOutput};
use crate::stopping::{StopReason, StoppingCriteriaList};

/// Per-call options that are not part of the model's generation config.
#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    /// Seeds every random draw. `None` seeds from the OS.
    pub seed: Option<u64>,
    pub cancellation: CancellationToken,
    /// Batch-leading tensors forwarded to every model call.
    pub extras: ModelExtras,
}

impl GenerateOptions {
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }

    pub fn with_extras(mut self, extras: ModelExtras) -> Self {
        self.extras = extras;
        self
    }
}

/// Runs generation for one model.
pub struct Generator<M: DecoderModel> {
    model: M,
}

impl<M: DecoderModel> Generator<M> {
    pub fn new(model: M) -> Self {
        Self { model }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Generates from `(batch, prompt_len)` tokens. A missing mask attends to every position.
    pub fn generate(
        &self,
        input_ids: &Array2<u32>,
        attention_mask: Option<&Array2<u8>>,
        config: &GenerationConfig,
    ) -> Result<GenerationOutput> {
        self.generate_with(input_ids, attention_mask, config, GenerateOptions::default())
    }

    pub fn generate_with(
        &self,
        input_ids: &Array2<u32>,
        attention_mask: Option<&Array2<u8>>,
        config: &GenerationConfig,
        options: GenerateOptions,
    ) -> Result<GenerationOutput> {
        let mode = config.validate()?;

        let (batch, input_len) = input_ids.dim();
        if batch == 0 || input_len == 0 {
            return Err(GenerationError::InvalidConfig(format!(
                "input_ids must be non-empty, got shape {:?}",
                input_ids.shape()
            )));
        }
        let mask = match attention_mask {
            Some(mask) if mask.dim() != (batch, input_len) => {
                return Err(GenerationError::shape("attention_mask", input_ids.shape(), mask.shape()));
            }
            Some(mask) => mask.clone(),
            None => Array2::ones((batch, input_len)),
        };

        let adapter = ModelAdapter::new(&self.model)?
            .with_num_logits_to_keep(config.num_logits_to_keep)
            .with_outputs(
                config.output_hidden_states || mode == GenerationMode::ContrastiveSearch,
                config.output_attentions,
            )
            .with_use_cache(config.use_cache);

        let eos_token_ids = config.eos_token_ids();
        let pad_token_id = match (config.pad_token_id, eos_token_ids.first()) {
            (Some(pad), _) => pad,
            (None, Some(&eos)) => {
                warn!("pad_token_id not set, padding finished rows with eos_token_id {}", eos);
                eos
            }
            (None, None) => 0,
        };

        let GenerateOptions {
            seed,
            cancellation,
            mut extras,
        } = options;

        let (decoder_ids, decoder_mask) = if self.model.is_encoder_decoder() {
            let encoder_hidden = self
                .model
                .encode(input_ids.view(), mask.view())
                .map_err(|source| GenerationError::ModelCallableFailed { step: 0, source })?;
            extras.encoder_hidden_states = Some(encoder_hidden);
            extras.encoder_attention_mask = Some(mask);
            let start = config
                .decoder_start_token_id
                .or_else(|| self.model.decoder_start_token_id())
                .or(config.bos_token_id)
                .ok_or_else(|| {
                    GenerationError::InvalidConfig(
                        "encoder-decoder generation needs decoder_start_token_id".to_string(),
                    )
                })?;
            (Array2::from_elem((batch, 1), start), Array2::ones((batch, 1)))
        } else {
            (input_ids.clone(), mask)
        };

        let prompt_len = decoder_ids.ncols();
        let max_length = config.effective_max_length(prompt_len);
        let start = Instant::now();

        if prompt_len >= max_length {
            warn!(
                "Prompt length {} already reaches max_length {}, nothing to generate",
                prompt_len, max_length
            );
            let sequences = repeat_rows(&decoder_ids, config.num_return_sequences);
            return Ok(GenerationOutput {
                sequences,
                scores: config.output_scores.then(Vec::new),
                beam_indices: None,
                sequences_scores: None,
                attentions: None,
                hidden_states: None,
                stop_reason: StopReason::MaxLength,
                complete: true,
                steps: 0,
                prompt_len,
                eos_token_ids,
                pad_token_id,
            });
        }

        let processors = LogitsProcessorList::from_config(config, prompt_len, prompt_len)?;
        let stopping = StoppingCriteriaList::from_config(config, max_length, start)?;

        let expansion = if mode.is_beam() {
            config.num_beams
        } else {
            config.num_return_sequences
        };
        let rows = batch * expansion;
        let cache_kind = select_cache_kind(config, &self.model, mode, rows, max_length)?;
        let cache = ModelCache::new(&cache_kind, &self.model.cache_layout())?;

        info!(
            "Generating ({}): batch {}, {} rows, prompt {} tokens, max_length {}, {} cache",
            mode,
            batch,
            rows,
            prompt_len,
            max_length,
            cache.kind_name()
        );

        let state = DecodeState {
            sequences: repeat_rows(&decoder_ids, expansion),
            mask: repeat_rows(&decoder_mask, expansion),
            cache,
            extras: extras.repeat_interleave(batch, expansion),
            pending: prompt_len,
        };
        let mut ctx = StepContext {
            adapter,
            config,
            mode,
            processors,
            stopping,
            cancellation,
            rng: seed.map_or_else(StdRng::from_entropy, StdRng::seed_from_u64),
            eos_token_ids,
            pad_token_id,
            max_length,
            prompt_len,
            batch,
        };

        let output = match mode {
            GenerationMode::Greedy | GenerationMode::Sample => search::run(&mut ctx, state)?,
            GenerationMode::BeamSearch | GenerationMode::BeamSample => beam::run(&mut ctx, state)?,
            GenerationMode::ContrastiveSearch => contrastive::run(&mut ctx, state)?,
        };

        let elapsed = start.elapsed().as_secs_f64();
        if output.steps > 0 && elapsed > 0.0 {
            info!(
                "Generation finished ({}) after {} steps in {:.2}ms ({:.2} steps/s)",
                output.stop_reason,
                output.steps,
                elapsed * 1000.0,
                output.steps as f64 / elapsed
            );
        }
        Ok(output)
    }
}

/// Runs [`Generator::generate_with`] on the blocking thread pool.
pub async fn generate_async<M>(
    model: Arc<M>,
    input_ids: Array2<u32>,
    attention_mask: Option<Array2<u8>>,
    config: GenerationConfig,
    options: GenerateOptions,
) -> Result<GenerationOutput>
where
    M: DecoderModel + ?Sized + 'static,
{
    tokio::task::spawn_blocking(move || {
        Generator::new(model).generate_with(&input_ids, attention_mask.as_ref(), &config, options)
    })
    .await
    .map_err(|join| {
        if join.is_cancelled() {
            GenerationError::CancellationRequested { steps: 0 }
        } else {
            GenerationError::WorkerFailed(join.to_string())
        }
    })?
}

/// Picks the cache policy: explicit choice first, then a requested sink
/// window, then a static buffer for models that accept one, else growing.
fn select_cache_kind<M: DecoderModel + ?Sized>(
    config: &GenerationConfig,
    model: &M,
    mode: GenerationMode,
    rows: usize,
    max_length: usize,
) -> Result<CacheKind> {
    let sink = config.attention_sink.map(|sink| CacheKind::Sink {
        window_length: sink.window_length,
        num_sink_tokens: sink.num_sink_tokens,
        rotary: model.uses_rotary(),
    });
    let fixed = CacheKind::Static {
        max_batch_size: rows,
        max_cache_length: max_length,
        dtype: config.cache_dtype,
    };

    match config.cache_implementation {
        Some(CacheImplementation::Dynamic) => Ok(CacheKind::Dynamic),
        Some(CacheImplementation::Sink) => sink.ok_or_else(|| {
            GenerationError::InvalidConfig("cache_implementation 'sink' needs attention_sink".to_string())
        }),
        Some(CacheImplementation::Static) if !model.supports_static_cache() => Err(GenerationError::ConflictingFlags(
            "cache_implementation 'static' requested but the model does not accept a static cache".to_string(),
        )),
        Some(CacheImplementation::Static) => Ok(fixed),
        None => Ok(match sink {
            Some(kind) => kind,
            None if model.supports_static_cache() && mode != GenerationMode::ContrastiveSearch => fixed,
            None => CacheKind::Dynamic,
        }),
    }
}

/// Repeats every row `times` times in place.
pub(crate) fn repeat_rows<T: Clone>(arr: &Array2<T>, times: usize) -> Array2<T> {
    if times == 1 {
        return arr.clone();
    }
    let rows: Vec<usize> = (0..arr.nrows())
        .flat_map(|r| std::iter::repeat_n(r, times))
        .collect();
    arr.select(Axis(0), &rows)
}

/// Logits of the last returned position, `(rows, vocab)`.
pub(crate) fn last_position_logits(logits: &Array3<f32>, step: usize) -> Result<Array2<f32>> {
    let positions = logits.dim().1;
    if positions == 0 {
        return Err(GenerationError::shape("logits", "(rows, >= 1, vocab)", logits.shape()).at_step(step, "model"));
    }
    Ok(logits.index_axis(Axis(1), positions - 1).to_owned())
}

/// Token history, mask and cache of every row.
pub(crate) struct DecodeState {
    sequences: Array2<u32>,
    mask: Array2<u8>,
    cache: ModelCache,
    extras: ModelExtras,
    /// Trailing positions not yet written to the cache.
    pending: usize,
}

impl DecodeState {
    fn rows(&self) -> usize {
        self.sequences.nrows()
    }

    fn cur_len(&self) -> usize {
        self.sequences.ncols()
    }

    /// Feeds the pending positions (or, without caching, the whole sequence).
    fn forward<M: DecoderModel + ?Sized>(&mut self, ctx: &StepContext<'_, M>, step: usize) -> Result<ModelOutput> {
        if !ctx.config.use_cache {
            self.cache.clear();
            self.pending = self.sequences.ncols();
        }
        let width = self.sequences.ncols();
        let input = self.sequences.slice(s![.., width - self.pending..]);
        let output = ctx
            .adapter
            .call(step, input, self.mask.view(), &mut self.cache, None, &self.extras)?;
        self.pending = 0;
        Ok(output)
    }

    /// Appends one token per row; the tokens are pending for the next call.
    fn append(&mut self, tokens: &[u32]) -> Result<()> {
        self.append_cached(tokens)?;
        self.pending += 1;
        Ok(())
    }

    /// Appends tokens whose keys/values are already cached.
    fn append_cached(&mut self, tokens: &[u32]) -> Result<()> {
        let column = ArrayView2::from_shape((tokens.len(), 1), tokens)
            .map_err(|_| GenerationError::shape("sequences", self.sequences.nrows(), tokens.len()))?;
        self.sequences
            .append(Axis(1), column)
            .map_err(|_| GenerationError::shape("sequences", self.sequences.nrows(), tokens.len()))?;
        let ones = Array2::<u8>::ones((self.mask.nrows(), 1));
        self.mask
            .append(Axis(1), ones.view())
            .map_err(|_| GenerationError::shape("attention_mask", self.sequences.nrows(), self.mask.nrows()))?;
        Ok(())
    }

    /// Row `i` becomes old row `rows[i]` (tokens and mask; the cache is reordered separately).
    fn gather(&mut self, rows: &[usize]) {
        self.sequences = gather_rows(self.sequences.view(), rows);
        self.mask = gather_rows(self.mask.view(), rows);
    }
}

/// Everything a step loop reads besides the per-row state.
pub(crate) struct StepContext<'a, M: DecoderModel + ?Sized> {
    adapter: ModelAdapter<'a, M>,
    config: &'a GenerationConfig,
    mode: GenerationMode,
    processors: LogitsProcessorList,
    stopping: StoppingCriteriaList,
    cancellation: CancellationToken,
    rng: StdRng,
    eos_token_ids: Vec<u32>,
    pad_token_id: u32,
    max_length: usize,
    prompt_len: usize,
    /// Input batch before beam / return-sequence expansion.
    batch: usize,
}

impl<M: DecoderModel + ?Sized> StepContext<'_, M> {
    /// Why a loop in which every row finished stopped.
    fn stop_reason(&self, sequences: &Array2<u32>) -> StopReason {
        if sequences.ncols() >= self.max_length {
            StopReason::MaxLength
        } else if self.stopping.time_exceeded() {
            StopReason::MaxTime
        } else {
            StopReason::Eos
        }
    }

    fn cancelled(&self, steps: usize) -> bool {
        if self.cancellation.is_cancelled() {
            info!("Generation cancelled after {} steps", steps);
            true
        } else {
            false
        }
    }

    fn output(&self, sequences: Array2<u32>, recorder: Recorder, stop_reason: StopReason, steps: usize) -> GenerationOutput {
        let sequences = if self.config.trim_trailing_padding && !self.mode.is_beam() {
            output::trim_trailing_padding(&sequences, self.prompt_len, &self.eos_token_ids)
        } else {
            sequences
        };
        debug!("Stopped ({}) with sequences of shape {:?}", stop_reason, sequences.shape());
        GenerationOutput {
            sequences,
            scores: recorder.scores,
            beam_indices: None,
            sequences_scores: None,
            attentions: recorder.attentions,
            hidden_states: recorder.hidden_states,
            stop_reason,
            complete: stop_reason != StopReason::Cancelled,
            steps,
            prompt_len: self.prompt_len,
            eos_token_ids: self.eos_token_ids.clone(),
            pad_token_id: self.pad_token_id,
        }
    }
}

/// Collects the optional per-step outputs the config asks for.
#[derive(Debug, Default)]
pub(crate) struct Recorder {
    scores: Option<Vec<Array2<f32>>>,
    attentions: Option<Vec<Vec<Array4<f32>>>>,
    hidden_states: Option<Vec<Vec<Array3<f32>>>>,
}

impl Recorder {
    fn new(config: &GenerationConfig) -> Self {
        Self {
            scores: config.output_scores.then(Vec::new),
            attentions: config.output_attentions.then(Vec::new),
            hidden_states: config.output_hidden_states.then(Vec::new),
        }
    }

    fn record_scores(&mut self, scores: &Array2<f32>) {
        if let Some(all) = self.scores.as_mut() {
            all.push(scores.clone());
        }
    }

    fn record_model_output(&mut self, output: &ModelOutput) {
        if let (Some(all), Some(step)) = (self.attentions.as_mut(), output.attentions.as_ref()) {
            all.push(step.clone());
        }
        if let (Some(all), Some(step)) = (self.hidden_states.as_mut(), output.hidden_states.as_ref()) {
            all.push(step.clone());
        }
    }
}
