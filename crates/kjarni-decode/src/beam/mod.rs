//! Beam bookkeeping.
//!
//! Rows of every tensor handled here are laid out group-major: row
//! `batch_idx * num_beams + beam_id` holds beam `beam_id` of input `batch_idx`.
//!
//! Per step the generator scores `num_beams * vocab` continuations per group,
//! keeps the best `2 * num_beams` ([`select_beam_candidates`] or
//! [`sample_beam_candidates`]) and hands them to [`BeamSearchScorer::process`],
//! which moves EOS continuations into the finished pool and picks exactly
//! `num_beams` live continuations for the next step.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::Rng;

use crate::common::sampling::{sample_without_replacement, softmax, top_k_with_scores};
use crate::config::EarlyStopping;
use crate::error::{GenerationError, Result};

/// Score given to beams `1..num_beams` before the first step, so the first
/// expansion only draws from beam 0.
pub const INITIAL_BEAM_SCORE: f32 = -1e9;

/// A finished candidate sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct BeamHypothesis {
    pub tokens: Vec<u32>,
    /// Length-normalised log-probability.
    pub score: f32,
    /// Row the token at each generated position was appended to.
    pub beam_indices: Vec<i64>,
}

/// The `num_beams` best finished hypotheses of one input.
#[derive(Debug, Clone)]
pub struct BeamHypotheses {
    hypotheses: Vec<BeamHypothesis>,
    num_beams: usize,
    length_penalty: f32,
    early_stopping: EarlyStopping,
    max_length: usize,
    prompt_len: usize,
    worst_score: f32,
}

impl BeamHypotheses {
    pub fn new(
        num_beams: usize,
        length_penalty: f32,
        early_stopping: EarlyStopping,
        max_length: usize,
        prompt_len: usize,
    ) -> Self {
        Self {
            hypotheses: Vec::with_capacity(num_beams + 1),
            num_beams,
            length_penalty,
            early_stopping,
            max_length,
            prompt_len,
            worst_score: f32::INFINITY,
        }
    }

    pub fn len(&self) -> usize {
        self.hypotheses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hypotheses.is_empty()
    }

    pub fn worst_score(&self) -> f32 {
        self.worst_score
    }

    /// Best first.
    pub fn hypotheses(&self) -> &[BeamHypothesis] {
        &self.hypotheses
    }

    fn normalise(&self, sum_logprobs: f32, generated_len: usize) -> f32 {
        sum_logprobs / (generated_len.max(1) as f32).powf(self.length_penalty)
    }

    /// Offers a finished sequence; keeps it if the pool has room or it beats the worst.
    pub fn add(&mut self, tokens: Vec<u32>, sum_logprobs: f32, beam_indices: Vec<i64>, generated_len: usize) {
        let score = self.normalise(sum_logprobs, generated_len);
        if self.hypotheses.len() >= self.num_beams && score <= self.worst_score {
            return;
        }

        // stable: equal scores keep arrival order
        let at = self
            .hypotheses
            .iter()
            .position(|h| h.score < score)
            .unwrap_or(self.hypotheses.len());
        self.hypotheses.insert(
            at,
            BeamHypothesis {
                tokens,
                score,
                beam_indices,
            },
        );
        self.hypotheses.truncate(self.num_beams);
        self.worst_score = self
            .hypotheses
            .last()
            .map(|h| h.score)
            .unwrap_or(f32::INFINITY);
    }

    /// Whether no live beam can still enter the pool.
    ///
    /// `best_sum_logprobs` is the best live cumulative score and `cur_len`
    /// the current sequence length.
    pub fn is_done(&self, best_sum_logprobs: f32, cur_len: usize) -> bool {
        if self.hypotheses.len() < self.num_beams {
            return false;
        }
        let generated = match self.early_stopping {
            EarlyStopping::Immediate => return true,
            EarlyStopping::Heuristic => cur_len.saturating_sub(self.prompt_len),
            EarlyStopping::Never if self.length_penalty > 0.0 => {
                self.max_length.saturating_sub(self.prompt_len)
            }
            EarlyStopping::Never => cur_len.saturating_sub(self.prompt_len),
        };
        let highest_attainable = self.normalise(best_sum_logprobs, generated);
        self.worst_score >= highest_attainable
    }
}

/// One step's surviving beams, flat over `batch * num_beams`.
#[derive(Debug, Clone, PartialEq)]
pub struct BeamStepOutput {
    pub next_beam_scores: Array1<f32>,
    pub next_beam_tokens: Array1<u32>,
    /// Source row of each surviving beam; feed to the cache reorder.
    pub next_beam_indices: Array1<usize>,
}

/// Final ranked hypotheses, `num_beam_hyps_to_keep` rows per input.
#[derive(Debug, Clone, PartialEq)]
pub struct BeamSearchOutput {
    /// Padded with the pad id to the longest hypothesis.
    pub sequences: Array2<u32>,
    pub sequence_scores: Array1<f32>,
    /// Origin row per generated position, padded with -1.
    pub beam_indices: Array2<i64>,
}

/// Top `k` continuation candidates per group.
#[derive(Debug, Clone, PartialEq)]
pub struct BeamCandidates {
    /// `(batch, k)` cumulative scores, best first.
    pub scores: Array2<f32>,
    pub tokens: Array2<u32>,
    /// Beam (within the group) each candidate extends.
    pub beam_ids: Array2<usize>,
}

impl BeamCandidates {
    fn from_flat(batch: usize, k: usize, vocab: usize, picked: Vec<Vec<(usize, f32)>>) -> Self {
        let mut scores = Array2::from_elem((batch, k), f32::NEG_INFINITY);
        let mut tokens = Array2::zeros((batch, k));
        let mut beam_ids = Array2::zeros((batch, k));
        for (b, row) in picked.into_iter().enumerate() {
            for (j, (flat, score)) in row.into_iter().enumerate() {
                scores[[b, j]] = score;
                tokens[[b, j]] = (flat % vocab) as u32;
                beam_ids[[b, j]] = flat / vocab;
            }
        }
        Self {
            scores,
            tokens,
            beam_ids,
        }
    }
}

fn group_view(scores: ArrayView2<'_, f32>, num_beams: usize) -> Result<(usize, usize)> {
    let rows = scores.nrows();
    if num_beams == 0 || rows % num_beams != 0 {
        return Err(GenerationError::BeamCountMismatch {
            expected: num_beams,
            actual: rows,
        });
    }
    Ok((rows / num_beams, scores.ncols()))
}

/// Deterministic top-`k` over each group's `num_beams * vocab` scores.
///
/// `scores` is `(batch * num_beams, vocab)` and already holds cumulative
/// log-probabilities. Ties go to the lower flat index.
pub fn select_beam_candidates(scores: ArrayView2<'_, f32>, num_beams: usize, k: usize) -> Result<BeamCandidates> {
    let (batch, vocab) = group_view(scores, num_beams)?;
    let k = k.min(num_beams * vocab);
    let picked = (0..batch)
        .map(|b| {
            let group = scores.slice(ndarray::s![b * num_beams..(b + 1) * num_beams, ..]);
            let flat = Array1::from_iter(group.iter().copied());
            top_k_with_scores(&flat, k)
        })
        .collect();
    Ok(BeamCandidates::from_flat(batch, k, vocab, picked))
}

/// Draws `k` distinct candidates per group from the softmax of the
/// (already warped) cumulative scores, then orders them best first.
pub fn sample_beam_candidates<R: Rng + ?Sized>(
    scores: ArrayView2<'_, f32>,
    num_beams: usize,
    k: usize,
    rng: &mut R,
) -> Result<BeamCandidates> {
    let (batch, vocab) = group_view(scores, num_beams)?;
    let k = k.min(num_beams * vocab);
    let mut picked = Vec::with_capacity(batch);
    for b in 0..batch {
        let group = scores.slice(ndarray::s![b * num_beams..(b + 1) * num_beams, ..]);
        let flat = Array1::from_iter(group.iter().copied());
        let probs = softmax(&flat, b)?;
        let mut drawn: Vec<(usize, f32)> = sample_without_replacement(probs.view(), k, rng)
            .into_iter()
            .map(|idx| (idx, flat[idx]))
            .collect();
        drawn.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        picked.push(drawn);
    }
    Ok(BeamCandidates::from_flat(batch, k, vocab, picked))
}

/// Beam search state across all input groups.
#[derive(Debug, Clone)]
pub struct BeamSearchScorer {
    batch_size: usize,
    num_beams: usize,
    num_beam_hyps_to_keep: usize,
    beam_hyps: Vec<BeamHypotheses>,
    done: Vec<bool>,
    prompt_len: usize,
}

impl BeamSearchScorer {
    pub fn new(
        batch_size: usize,
        num_beams: usize,
        length_penalty: f32,
        early_stopping: EarlyStopping,
        num_beam_hyps_to_keep: usize,
        max_length: usize,
        prompt_len: usize,
    ) -> Result<Self> {
        if num_beams < 2 {
            return Err(GenerationError::InvalidConfig(format!(
                "beam search needs num_beams > 1, got {}",
                num_beams
            )));
        }
        if num_beam_hyps_to_keep == 0 || num_beam_hyps_to_keep > num_beams {
            return Err(GenerationError::InvalidConfig(format!(
                "num_beam_hyps_to_keep must be in 1..={}, got {}",
                num_beams, num_beam_hyps_to_keep
            )));
        }
        let beam_hyps = (0..batch_size)
            .map(|_| BeamHypotheses::new(num_beams, length_penalty, early_stopping, max_length, prompt_len))
            .collect();
        Ok(Self {
            batch_size,
            num_beams,
            num_beam_hyps_to_keep,
            beam_hyps,
            done: vec![false; batch_size],
            prompt_len,
        })
    }

    pub fn num_beams(&self) -> usize {
        self.num_beams
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Whether every group is finished.
    pub fn is_done(&self) -> bool {
        self.done.iter().all(|&d| d)
    }

    pub fn group_done(&self, batch_idx: usize) -> bool {
        self.done.get(batch_idx).copied().unwrap_or(true)
    }

    pub fn hypotheses(&self, batch_idx: usize) -> Option<&BeamHypotheses> {
        self.beam_hyps.get(batch_idx)
    }

    /// Initial cumulative scores: 0 for beam 0 of each group, a large negative value elsewhere.
    pub fn initial_beam_scores(&self) -> Array1<f32> {
        Array1::from_shape_fn(self.batch_size * self.num_beams, |i| {
            if i % self.num_beams == 0 { 0.0 } else { INITIAL_BEAM_SCORE }
        })
    }

    fn check_rows(&self, rows: usize) -> Result<()> {
        if rows != self.batch_size * self.num_beams {
            return Err(GenerationError::BeamCountMismatch {
                expected: self.batch_size * self.num_beams,
                actual: rows,
            });
        }
        Ok(())
    }

    /// Consumes one step's candidates.
    ///
    /// `input_ids` is the `(batch * num_beams, cur_len)` history before this
    /// step's token; `next_scores`, `next_tokens` and `next_beam_ids` are the
    /// `(batch, 2 * num_beams)` candidates; `beam_indices` is the per-row
    /// origin history.
    #[allow(clippy::too_many_arguments)]
    pub fn process(
        &mut self,
        input_ids: ArrayView2<'_, u32>,
        next_scores: ArrayView2<'_, f32>,
        next_tokens: ArrayView2<'_, u32>,
        next_beam_ids: ArrayView2<'_, usize>,
        pad_token_id: u32,
        eos_token_ids: &[u32],
        beam_indices: &[Vec<i64>],
    ) -> Result<BeamStepOutput> {
        self.check_rows(input_ids.nrows())?;
        if next_scores.nrows() != self.batch_size
            || next_scores.shape() != next_tokens.shape()
            || next_scores.shape() != next_beam_ids.shape()
        {
            return Err(GenerationError::shape(
                "beam_scorer",
                (self.batch_size, 2 * self.num_beams),
                (next_scores.shape(), next_tokens.shape(), next_beam_ids.shape()),
            ));
        }

        let cur_len = input_ids.ncols();
        let group_size = self.num_beams;
        let flat = self.batch_size * group_size;
        let mut next_beam_scores = Array1::zeros(flat);
        let mut next_beam_tokens = Array1::zeros(flat);
        let mut next_beam_indices = Array1::zeros(flat);

        for batch_idx in 0..self.batch_size {
            let base = batch_idx * group_size;
            if self.done[batch_idx] {
                for slot in base..base + group_size {
                    next_beam_scores[slot] = 0.0;
                    next_beam_tokens[slot] = pad_token_id;
                    next_beam_indices[slot] = 0;
                }
                continue;
            }

            let mut beam_idx = 0;
            let candidates = next_tokens
                .row(batch_idx)
                .into_iter()
                .zip(next_scores.row(batch_idx))
                .zip(next_beam_ids.row(batch_idx))
                .enumerate();
            for (rank, ((&token, &score), &beam_id)) in candidates {
                // masked out
                if !score.is_finite() {
                    continue;
                }
                let row = base + beam_id;
                if eos_token_ids.contains(&token) {
                    if rank >= group_size {
                        continue;
                    }
                    let mut tokens = input_ids.row(row).to_vec();
                    tokens.push(token);
                    let mut origin = beam_indices.get(row).cloned().unwrap_or_default();
                    origin.push(row as i64);
                    let generated_len = cur_len + 1 - self.prompt_len;
                    self.beam_hyps[batch_idx].add(tokens, score, origin, generated_len);
                } else {
                    let slot = base + beam_idx;
                    next_beam_scores[slot] = score;
                    next_beam_tokens[slot] = token;
                    next_beam_indices[slot] = row;
                    beam_idx += 1;
                }
                if beam_idx == group_size {
                    break;
                }
            }

            if beam_idx < group_size {
                return Err(GenerationError::EmptyBeam { batch_idx });
            }

            let best = next_scores
                .row(batch_idx)
                .fold(f32::NEG_INFINITY, |a, &b| a.max(b));
            self.done[batch_idx] = self.beam_hyps[batch_idx].is_done(best, cur_len);
        }

        Ok(BeamStepOutput {
            next_beam_scores,
            next_beam_tokens,
            next_beam_indices,
        })
    }

    /// Adds the live beams of unfinished groups and returns the best
    /// `num_beam_hyps_to_keep` hypotheses per group.
    pub fn finalize(
        mut self,
        input_ids: ArrayView2<'_, u32>,
        final_beam_scores: ArrayView1<'_, f32>,
        pad_token_id: u32,
        beam_indices: &[Vec<i64>],
    ) -> Result<BeamSearchOutput> {
        self.check_rows(input_ids.nrows())?;
        self.check_rows(final_beam_scores.len())?;

        for batch_idx in 0..self.batch_size {
            if self.done[batch_idx] {
                continue;
            }
            for beam_id in 0..self.num_beams {
                let row = batch_idx * self.num_beams + beam_id;
                let tokens = input_ids.row(row).to_vec();
                let generated_len = tokens.len().saturating_sub(self.prompt_len);
                let origin = beam_indices.get(row).cloned().unwrap_or_default();
                self.beam_hyps[batch_idx].add(tokens, final_beam_scores[row], origin, generated_len);
            }
        }

        let keep = self.num_beam_hyps_to_keep;
        let mut best: Vec<BeamHypothesis> = Vec::with_capacity(self.batch_size * keep);
        for (batch_idx, hyps) in self.beam_hyps.into_iter().enumerate() {
            if hyps.len() < keep {
                return Err(GenerationError::EmptyBeam { batch_idx });
            }
            best.extend(hyps.hypotheses.into_iter().take(keep));
        }

        let max_len = best.iter().map(|h| h.tokens.len()).max().unwrap_or(0);
        let max_generated = best.iter().map(|h| h.beam_indices.len()).max().unwrap_or(0);
        let mut sequences = Array2::from_elem((best.len(), max_len), pad_token_id);
        let mut indices = Array2::from_elem((best.len(), max_generated), -1i64);
        let mut sequence_scores = Array1::zeros(best.len());
        for (i, hyp) in best.iter().enumerate() {
            for (j, &token) in hyp.tokens.iter().enumerate() {
                sequences[[i, j]] = token;
            }
            for (j, &origin) in hyp.beam_indices.iter().enumerate() {
                indices[[i, j]] = origin;
            }
            sequence_scores[i] = hyp.score;
        }

        Ok(BeamSearchOutput {
            sequences,
            sequence_scores,
            beam_indices: indices,
        })
    }
}

/// Gathers rows of `tensor` along axis 0.
pub(crate) fn gather_rows<T: Clone>(tensor: ArrayView2<'_, T>, rows: &[usize]) -> Array2<T> {
    tensor.select(Axis(0), rows)
}
