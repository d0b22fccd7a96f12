//! Logits processors.
//!
//! A processor rewrites one step's `(batch, vocab)` scores given the token
//! history of every row. Processors are plain enum variants run in list order
//! by [`LogitsProcessorList::process`]; the order built by
//! [`LogitsProcessorList::from_config`] is:
//!
//! ```text
//! repetition_penalty -> no_repeat_ngram -> bad_words -> min_length -> min_new_tokens
//!   -> inf_nan_remove -> suppress_tokens -> begin_suppress_tokens
//!   -> forced_bos -> forced_eos -> forced_decoder_ids
//!   -> temperature -> top_k -> top_p -> typical_p -> min_p      (sampling modes only)
//!   -> logit_normalization
//! ```
//!
//! Masking writes `f32::NEG_INFINITY`. Token ids outside the vocabulary are ignored.

use log::debug;
use ndarray::{Array2, ArrayView2, ArrayViewMut1, Axis};

use crate::common::sampling::{
    apply_no_repeat_ngram_inplace, apply_repetition_penalty_inplace, log_softmax_1d,
    min_p_filtering_inplace, top_k_filtering_inplace, top_p_filtering_inplace,
    typical_filtering_inplace,
};
use crate::config::GenerationConfig;
use crate::error::{GenerationError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum LogitsProcessor {
    /// Masks EOS while the sequence is shorter than `min_length`.
    MinLength {
        min_length: usize,
        eos_token_ids: Vec<u32>,
    },
    /// Masks EOS until `min_new_tokens` tokens follow the prompt.
    MinNewTokens {
        prompt_len: usize,
        min_new_tokens: usize,
        eos_token_ids: Vec<u32>,
    },
    RepetitionPenalty {
        penalty: f32,
    },
    NoRepeatNGram {
        ngram_size: usize,
    },
    /// Bans the last token of any sequence whose prefix ends the history.
    BadWords {
        sequences: Vec<Vec<u32>>,
    },
    /// NaN becomes 0 and infinities the extreme finite values.
    InfNanRemove,
    SuppressTokens {
        token_ids: Vec<u32>,
    },
    BeginSuppressTokens {
        begin_index: usize,
        token_ids: Vec<u32>,
    },
    ForcedBos {
        begin_index: usize,
        token_id: u32,
    },
    ForcedEos {
        max_length: usize,
        eos_token_ids: Vec<u32>,
    },
    /// `(sequence length, token id)` pairs.
    ForcedDecoderIds {
        forced: Vec<(usize, u32)>,
    },
    Temperature {
        temperature: f32,
    },
    TopK {
        top_k: usize,
        min_tokens_to_keep: usize,
    },
    TopP {
        top_p: f32,
        min_tokens_to_keep: usize,
    },
    TypicalP {
        mass: f32,
        min_tokens_to_keep: usize,
    },
    MinP {
        min_p: f32,
        min_tokens_to_keep: usize,
    },
    /// Re-normalises scores to log-probabilities.
    LogitNormalization,
}

impl LogitsProcessor {
    pub fn name(&self) -> &'static str {
        match self {
            LogitsProcessor::MinLength { .. } => "min_length",
            LogitsProcessor::MinNewTokens { .. } => "min_new_tokens",
            LogitsProcessor::RepetitionPenalty { .. } => "repetition_penalty",
            LogitsProcessor::NoRepeatNGram { .. } => "no_repeat_ngram",
            LogitsProcessor::BadWords { .. } => "bad_words",
            LogitsProcessor::InfNanRemove => "inf_nan_remove",
            LogitsProcessor::SuppressTokens { .. } => "suppress_tokens",
            LogitsProcessor::BeginSuppressTokens { .. } => "begin_suppress_tokens",
            LogitsProcessor::ForcedBos { .. } => "forced_bos",
            LogitsProcessor::ForcedEos { .. } => "forced_eos",
            LogitsProcessor::ForcedDecoderIds { .. } => "forced_decoder_ids",
            LogitsProcessor::Temperature { .. } => "temperature",
            LogitsProcessor::TopK { .. } => "top_k",
            LogitsProcessor::TopP { .. } => "top_p",
            LogitsProcessor::TypicalP { .. } => "typical_p",
            LogitsProcessor::MinP { .. } => "min_p",
            LogitsProcessor::LogitNormalization => "logit_normalization",
        }
    }

    /// Warpers reshape the distribution for sampling; they are only built for sampling modes.
    pub fn is_warper(&self) -> bool {
        matches!(
            self,
            LogitsProcessor::Temperature { .. }
                | LogitsProcessor::TopK { .. }
                | LogitsProcessor::TopP { .. }
                | LogitsProcessor::TypicalP { .. }
                | LogitsProcessor::MinP { .. }
        )
    }

    /// Applies the processor to one row. `history` is the row's full token history.
    fn apply_row(&self, row_idx: usize, history: &[u32], row: &mut ArrayViewMut1<'_, f32>) -> Result<()> {
        let cur_len = history.len();
        match self {
            LogitsProcessor::MinLength {
                min_length,
                eos_token_ids,
            } => {
                if cur_len < *min_length {
                    mask(row, eos_token_ids);
                }
            }
            LogitsProcessor::MinNewTokens {
                prompt_len,
                min_new_tokens,
                eos_token_ids,
            } => {
                if cur_len.saturating_sub(*prompt_len) < *min_new_tokens {
                    mask(row, eos_token_ids);
                }
            }
            LogitsProcessor::RepetitionPenalty { penalty } => {
                apply_repetition_penalty_inplace(row, history, *penalty);
            }
            LogitsProcessor::NoRepeatNGram { ngram_size } => {
                apply_no_repeat_ngram_inplace(row, history, *ngram_size);
            }
            LogitsProcessor::BadWords { sequences } => {
                for sequence in sequences {
                    let Some((&banned, prefix)) = sequence.split_last() else {
                        continue;
                    };
                    if history.ends_with(prefix) {
                        mask(row, &[banned]);
                    }
                }
            }
            LogitsProcessor::InfNanRemove => {
                row.mapv_inplace(|x| {
                    if x.is_nan() {
                        0.0
                    } else if x == f32::INFINITY {
                        f32::MAX
                    } else if x == f32::NEG_INFINITY {
                        f32::MIN
                    } else {
                        x
                    }
                });
            }
            LogitsProcessor::SuppressTokens { token_ids } => mask(row, token_ids),
            LogitsProcessor::BeginSuppressTokens {
                begin_index,
                token_ids,
            } => {
                if cur_len == *begin_index {
                    mask(row, token_ids);
                }
            }
            LogitsProcessor::ForcedBos {
                begin_index,
                token_id,
            } => {
                if cur_len == *begin_index {
                    force(row, &[*token_id]);
                }
            }
            LogitsProcessor::ForcedEos {
                max_length,
                eos_token_ids,
            } => {
                if cur_len + 1 == *max_length {
                    force(row, eos_token_ids);
                }
            }
            LogitsProcessor::ForcedDecoderIds { forced } => {
                if let Some(&(_, token_id)) = forced.iter().find(|(index, _)| *index == cur_len) {
                    force(row, &[token_id]);
                }
            }
            LogitsProcessor::Temperature { temperature } => {
                if *temperature != 1.0 {
                    row.mapv_inplace(|x| x / temperature);
                }
            }
            LogitsProcessor::TopK {
                top_k,
                min_tokens_to_keep,
            } => top_k_filtering_inplace(row, (*top_k).max(*min_tokens_to_keep)),
            LogitsProcessor::TopP {
                top_p,
                min_tokens_to_keep,
            } => top_p_filtering_inplace(row, *top_p, *min_tokens_to_keep, row_idx)?,
            LogitsProcessor::TypicalP {
                mass,
                min_tokens_to_keep,
            } => typical_filtering_inplace(row, *mass, *min_tokens_to_keep),
            LogitsProcessor::MinP {
                min_p,
                min_tokens_to_keep,
            } => min_p_filtering_inplace(row, *min_p, *min_tokens_to_keep, row_idx)?,
            LogitsProcessor::LogitNormalization => {
                let normalised = log_softmax_1d(row);
                row.assign(&normalised);
            }
        }
        Ok(())
    }
}

fn mask(row: &mut ArrayViewMut1<'_, f32>, token_ids: &[u32]) {
    for &id in token_ids {
        if let Some(score) = row.get_mut(id as usize) {
            *score = f32::NEG_INFINITY;
        }
    }
}

/// Everything but `token_ids` is masked; the forced ids score 0.
fn force(row: &mut ArrayViewMut1<'_, f32>, token_ids: &[u32]) {
    let vocab = row.len();
    if token_ids.iter().all(|&id| id as usize >= vocab) {
        return;
    }
    row.fill(f32::NEG_INFINITY);
    for &id in token_ids {
        if let Some(score) = row.get_mut(id as usize) {
            *score = 0.0;
        }
    }
}

/// An ordered processor chain.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogitsProcessorList {
    processors: Vec<LogitsProcessor>,
}

impl LogitsProcessorList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the canonical chain for `config`.
    ///
    /// `prompt_len` is the length of the token history before the first
    /// generated token; `begin_index` is the history length at which the
    /// first generated token is chosen (the prompt length for decoder-only
    /// models, 1 for encoder-decoder models).
    pub fn from_config(config: &GenerationConfig, prompt_len: usize, begin_index: usize) -> Result<Self> {
        let mode = config.generation_mode()?;
        let eos_token_ids = config.eos_token_ids();
        let mut list = Self::new();

        if config.repetition_penalty != 1.0 {
            list.push(LogitsProcessor::RepetitionPenalty {
                penalty: config.repetition_penalty,
            });
        }
        if config.no_repeat_ngram_size > 0 {
            list.push(LogitsProcessor::NoRepeatNGram {
                ngram_size: config.no_repeat_ngram_size,
            });
        }
        if let Some(words) = &config.bad_words_ids {
            let sequences: Vec<Vec<u32>> = words
                .iter()
                .filter(|seq| !(seq.len() == 1 && eos_token_ids.contains(&seq[0])))
                .cloned()
                .collect();
            if !sequences.is_empty() {
                list.push(LogitsProcessor::BadWords { sequences });
            }
        }
        if config.min_length > 0 && !eos_token_ids.is_empty() {
            list.push(LogitsProcessor::MinLength {
                min_length: config.min_length,
                eos_token_ids: eos_token_ids.clone(),
            });
        }
        if let Some(min_new_tokens) = config.min_new_tokens.filter(|&n| n > 0) {
            if !eos_token_ids.is_empty() {
                list.push(LogitsProcessor::MinNewTokens {
                    prompt_len,
                    min_new_tokens,
                    eos_token_ids: eos_token_ids.clone(),
                });
            }
        }
        if config.remove_invalid_values {
            list.push(LogitsProcessor::InfNanRemove);
        }
        if let Some(token_ids) = config.suppress_tokens.clone().filter(|t| !t.is_empty()) {
            list.push(LogitsProcessor::SuppressTokens { token_ids });
        }
        if let Some(token_ids) = config.begin_suppress_tokens.clone().filter(|t| !t.is_empty()) {
            list.push(LogitsProcessor::BeginSuppressTokens {
                begin_index,
                token_ids,
            });
        }
        if let Some(token_id) = config.forced_bos_token_id {
            list.push(LogitsProcessor::ForcedBos {
                begin_index,
                token_id,
            });
        }
        if let Some(token_id) = config.forced_eos_token_id {
            let eos = if eos_token_ids.is_empty() {
                vec![token_id]
            } else {
                eos_token_ids.clone()
            };
            list.push(LogitsProcessor::ForcedEos {
                max_length: config.effective_max_length(prompt_len),
                eos_token_ids: eos,
            });
        }
        if let Some(forced) = config.forced_decoder_ids.clone().filter(|f| !f.is_empty()) {
            list.push(LogitsProcessor::ForcedDecoderIds { forced });
        }

        if mode.is_sampling() {
            let min_tokens_to_keep = if config.num_beams > 1 { 2 } else { 1 };
            if config.temperature != 1.0 {
                list.push(LogitsProcessor::Temperature {
                    temperature: config.temperature,
                });
            }
            if let Some(top_k) = config.top_k {
                list.push(LogitsProcessor::TopK {
                    top_k,
                    min_tokens_to_keep,
                });
            }
            if let Some(top_p) = config.top_p.filter(|&p| p < 1.0) {
                list.push(LogitsProcessor::TopP {
                    top_p,
                    min_tokens_to_keep,
                });
            }
            if let Some(mass) = config.typical_p.filter(|&p| p < 1.0) {
                list.push(LogitsProcessor::TypicalP {
                    mass,
                    min_tokens_to_keep,
                });
            }
            if let Some(min_p) = config.min_p {
                list.push(LogitsProcessor::MinP {
                    min_p,
                    min_tokens_to_keep,
                });
            }
        }

        if config.renormalize_logits {
            list.push(LogitsProcessor::LogitNormalization);
        }

        debug!("Logits processors for {}: {:?}", mode, list.names());
        Ok(list)
    }

    pub fn push(&mut self, processor: LogitsProcessor) {
        self.processors.push(processor);
    }

    /// Appends a processor after the canonical chain.
    pub fn with_processor(mut self, processor: LogitsProcessor) -> Self {
        self.processors.push(processor);
        self
    }

    /// Processor names in run order.
    pub fn names(&self) -> Vec<&'static str> {
        self.processors.iter().map(LogitsProcessor::name).collect()
    }

    pub fn processors(&self) -> &[LogitsProcessor] {
        &self.processors
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    /// Runs every processor in order over `scores` in place.
    ///
    /// `input_ids` is `(batch, cur_len)`, `scores` is `(batch, vocab)`.
    pub fn process(&self, input_ids: ArrayView2<'_, u32>, scores: &mut Array2<f32>) -> Result<()> {
        if self.processors.is_empty() {
            return Ok(());
        }
        if input_ids.nrows() != scores.nrows() {
            return Err(GenerationError::MalformedProcessorInput {
                processor: self.processors[0].name(),
                reason: format!(
                    "input_ids has {} rows, scores has {}",
                    input_ids.nrows(),
                    scores.nrows()
                ),
            });
        }

        let histories: Vec<Vec<u32>> = input_ids.outer_iter().map(|row| row.to_vec()).collect();
        for processor in &self.processors {
            for (row_idx, (mut row, history)) in scores
                .axis_iter_mut(Axis(0))
                .zip(histories.iter())
                .enumerate()
            {
                processor.apply_row(row_idx, history, &mut row)?;
            }
        }
        Ok(())
    }
}
