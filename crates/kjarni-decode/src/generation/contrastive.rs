//! Contrastive search.
//!
//! Each step the `top_k` most likely tokens of every row are run through the
//! model together (the cache is expanded to `rows * top_k`). A candidate's
//! score is its probability minus `penalty_alpha` times its highest cosine
//! similarity to any earlier hidden state of the row; the winner's cache
//! row, hidden state and logits are kept, so the candidate pass doubles as
//! the next step's forward pass.

use log::debug;
use ndarray::{Array2, Array3, ArrayView1, ArrayView2, Axis, concatenate, s};

use super::{DecodeState, GenerationOutput, Recorder, StepContext, last_position_logits};
use crate::cache::KVCache;
use crate::common::{cosine_similarity, softmax, top_k_with_scores};
use crate::error::{GenerationError, Result};
use crate::model::{DecoderModel, ModelOutput};
use crate::stopping::StopReason;

pub(super) fn run<M: DecoderModel + ?Sized>(
    ctx: &mut StepContext<'_, M>,
    mut state: DecodeState,
) -> Result<GenerationOutput> {
    let rows = state.rows();
    let top_k = ctx.config.top_k.unwrap_or(1).min(ctx.adapter.vocab_size()).max(1);
    let alpha = ctx.config.penalty_alpha.unwrap_or(0.0);
    let mut unfinished = vec![true; rows];
    let mut recorder = Recorder::new(ctx.config);
    let mut steps = 0;

    if ctx.cancelled(steps) {
        return Ok(ctx.output(state.sequences, recorder, StopReason::Cancelled, steps));
    }

    let output = state.forward(ctx, steps)?;
    recorder.record_model_output(&output);
    let mut context = last_hidden(&output, steps)?;
    let mut logits = last_position_logits(&output.logits, steps)?;

    let expand: Vec<usize> = (0..rows).flat_map(|r| std::iter::repeat_n(r, top_k)).collect();
    let candidate_extras = state.extras.repeat_interleave(rows, top_k);

    let reason = loop {
        if ctx.cancelled(steps) {
            break StopReason::Cancelled;
        }

        let mut scores = logits;
        ctx.processors
            .process(state.sequences.view(), &mut scores)
            .map_err(|e| e.at_step(steps, "logits_processors"))?;
        recorder.record_scores(&scores);

        let mut candidate_tokens = Vec::with_capacity(rows * top_k);
        let mut candidate_probs = Array2::<f32>::zeros((rows, top_k));
        for (row_idx, row) in scores.outer_iter().enumerate() {
            let probs = softmax(&row, row_idx).map_err(|e| e.at_step(steps, "selection"))?;
            for (j, (token, prob)) in top_k_with_scores(&probs, top_k).into_iter().enumerate() {
                candidate_tokens.push(token as u32);
                candidate_probs[[row_idx, j]] = prob;
            }
        }

        let mut candidate_seq = state.sequences.select(Axis(0), &expand);
        let token_column = ArrayView2::from_shape((rows * top_k, 1), &candidate_tokens)
            .map_err(|_| GenerationError::shape("contrastive.candidates", rows * top_k, candidate_tokens.len()))?;
        candidate_seq
            .append(Axis(1), token_column)
            .map_err(|_| GenerationError::shape("contrastive.candidates", rows * top_k, candidate_seq.nrows()))?;
        let mut candidate_mask = state.mask.select(Axis(0), &expand);
        candidate_mask
            .append(Axis(1), Array2::<u8>::ones((rows * top_k, 1)).view())
            .map_err(|_| GenerationError::shape("contrastive.mask", rows * top_k, candidate_mask.nrows()))?;

        let input = if ctx.config.use_cache {
            state.cache.select_batch(&expand).map_err(|e| e.at_step(steps, "cache"))?;
            candidate_seq.slice(s![.., candidate_seq.ncols() - 1..])
        } else {
            state.cache.clear();
            candidate_seq.view()
        };
        let candidate_out = ctx.adapter.call(
            steps,
            input,
            candidate_mask.view(),
            &mut state.cache,
            None,
            &candidate_extras,
        )?;
        recorder.record_model_output(&candidate_out);
        let candidate_hidden = last_hidden(&candidate_out, steps)?;
        let candidate_hidden = candidate_hidden.index_axis(Axis(1), candidate_hidden.dim().1 - 1);
        let candidate_logits = last_position_logits(&candidate_out.logits, steps)?;

        let picks: Vec<usize> = (0..rows)
            .map(|row| {
                let context_row = context.index_axis(Axis(0), row);
                let best = best_candidate(
                    candidate_probs.row(row),
                    candidate_hidden.slice(s![row * top_k..(row + 1) * top_k, ..]),
                    context_row,
                    alpha,
                );
                row * top_k + best
            })
            .collect();

        state.cache.select_batch(&picks).map_err(|e| e.at_step(steps, "cache"))?;
        let tokens: Vec<u32> = picks
            .iter()
            .enumerate()
            .map(|(row, &pick)| if unfinished[row] { candidate_tokens[pick] } else { ctx.pad_token_id })
            .collect();
        state.append_cached(&tokens)?;

        let chosen_hidden = candidate_hidden.select(Axis(0), &picks).insert_axis(Axis(1));
        context = concatenate(Axis(1), &[context.view(), chosen_hidden.view()])
            .map_err(|_| GenerationError::shape("contrastive.hidden_states", context.dim(), chosen_hidden.dim()))?;
        logits = candidate_logits.select(Axis(0), &picks);
        steps += 1;

        let done = ctx.stopping.evaluate(state.sequences.view(), Some(&logits));
        for (row, finished) in unfinished.iter_mut().zip(done) {
            if finished {
                *row = false;
            }
        }
        let active = unfinished.iter().filter(|&&u| u).count();
        debug!("Step {}: length {}, {} rows active", steps, state.cur_len(), active);
        if active == 0 {
            break ctx.stop_reason(&state.sequences);
        }
    };

    Ok(ctx.output(state.sequences, recorder, reason, steps))
}

fn last_hidden(output: &ModelOutput, step: usize) -> Result<Array3<f32>> {
    output.last_hidden_state().cloned().ok_or_else(|| {
        GenerationError::InvalidConfig("contrastive search needs the model to return hidden states".to_string())
            .at_step(step, "model")
    })
}

/// Index of the candidate with the best `(1 - alpha) * p - alpha * max_sim`.
/// Ties go to the more probable candidate.
fn best_candidate(
    probs: ArrayView1<'_, f32>,
    hidden: ArrayView2<'_, f32>,
    context: ArrayView2<'_, f32>,
    alpha: f32,
) -> usize {
    let mut best = 0;
    let mut best_score = f32::NEG_INFINITY;
    for (j, candidate) in hidden.outer_iter().enumerate() {
        let max_sim = context
            .outer_iter()
            .map(|past| cosine_similarity(candidate, past))
            .fold(f32::NEG_INFINITY, f32::max);
        let max_sim = if max_sim.is_finite() { max_sim } else { 0.0 };
        let score = (1.0 - alpha) * probs[j] - alpha * max_sim;
        if score > best_score {
            best = j;
            best_score = score;
        }
    }
    best
}
