//! Beam search and beam sampling loops.

use log::debug;
use ndarray::{Array2, Axis};

use super::{DecodeState, GenerationOutput, Recorder, StepContext, last_position_logits};
use crate::beam::{BeamSearchScorer, sample_beam_candidates, select_beam_candidates};
use crate::cache::KVCache;
use crate::common::log_softmax_1d;
use crate::error::Result;
use crate::model::DecoderModel;
use crate::stopping::StopReason;

pub(super) fn run<M: DecoderModel + ?Sized>(
    ctx: &mut StepContext<'_, M>,
    mut state: DecodeState,
) -> Result<GenerationOutput> {
    let config = ctx.config;
    let num_beams = config.num_beams;
    let sampling = ctx.mode.is_sampling();
    let mut scorer = BeamSearchScorer::new(
        ctx.batch,
        num_beams,
        config.length_penalty,
        config.early_stopping,
        config.num_return_sequences,
        ctx.max_length,
        ctx.prompt_len,
    )?;
    let mut beam_scores = scorer.initial_beam_scores();
    let mut origins: Vec<Vec<i64>> = vec![Vec::new(); state.rows()];
    // enough candidates that EOS hits cannot starve a group
    let candidates_per_group = 2.max(1 + ctx.eos_token_ids.len()) * num_beams;
    let mut recorder = Recorder::new(config);
    let mut steps = 0;

    let reason = loop {
        if ctx.cancelled(steps) {
            break StopReason::Cancelled;
        }

        let output = state.forward(ctx, steps)?;
        recorder.record_model_output(&output);
        let logits = last_position_logits(&output.logits, steps)?;
        let mut scores = log_probs(&logits);
        ctx.processors
            .process(state.sequences.view(), &mut scores)
            .map_err(|e| e.at_step(steps, "logits_processors"))?;
        recorder.record_scores(&scores);
        scores += &beam_scores.view().insert_axis(Axis(1));

        let candidates = if sampling {
            sample_beam_candidates(scores.view(), num_beams, candidates_per_group, &mut ctx.rng)
        } else {
            select_beam_candidates(scores.view(), num_beams, candidates_per_group)
        }
        .map_err(|e| e.at_step(steps, "beam_selection"))?;

        let step = scorer
            .process(
                state.sequences.view(),
                candidates.scores.view(),
                candidates.tokens.view(),
                candidates.beam_ids.view(),
                ctx.pad_token_id,
                &ctx.eos_token_ids,
                &origins,
            )
            .map_err(|e| e.at_step(steps, "beam_scorer"))?;

        let sources = step.next_beam_indices.to_vec();
        origins = sources
            .iter()
            .map(|&row| {
                let mut origin = origins[row].clone();
                origin.push(row as i64);
                origin
            })
            .collect();
        state.gather(&sources);
        state.cache.reorder(&sources).map_err(|e| e.at_step(steps, "cache"))?;
        state.append(&step.next_beam_tokens.to_vec())?;
        beam_scores = step.next_beam_scores;
        steps += 1;

        debug!(
            "Step {}: length {}, best beam score {:.4}",
            steps,
            state.cur_len(),
            beam_scores.fold(f32::NEG_INFINITY, |a, &b| a.max(b))
        );

        if scorer.is_done() {
            break StopReason::BeamDone;
        }
        let done = ctx.stopping.evaluate(state.sequences.view(), None);
        if done.iter().all(|&d| d) {
            break ctx.stop_reason(&state.sequences);
        }
    };

    let finished = scorer
        .finalize(state.sequences.view(), beam_scores.view(), ctx.pad_token_id, &origins)
        .map_err(|e| e.at_step(steps, "beam_scorer"))?;

    let mut output = ctx.output(finished.sequences, recorder, reason, steps);
    output.sequences_scores = Some(finished.sequence_scores);
    output.beam_indices = Some(finished.beam_indices);
    Ok(output)
}

fn log_probs(logits: &Array2<f32>) -> Array2<f32> {
    let mut out = logits.clone();
    for mut row in out.outer_iter_mut() {
        let lp = log_softmax_1d(&row);
        row.assign(&lp);
    }
    out
}
