//! Greedy and multinomial sampling loops.

use log::debug;
use ndarray::Array2;

use super::{DecodeState, GenerationOutput, Recorder, StepContext, last_position_logits};
use crate::common::{argmax, sample_from_probs, softmax};
use crate::error::{GenerationError, Result};
use crate::model::DecoderModel;
use crate::stopping::StopReason;

pub(super) fn run<M: DecoderModel + ?Sized>(
    ctx: &mut StepContext<'_, M>,
    mut state: DecodeState,
) -> Result<GenerationOutput> {
    let sampling = ctx.mode.is_sampling();
    let mut unfinished = vec![true; state.rows()];
    let mut recorder = Recorder::new(ctx.config);
    let mut steps = 0;

    let reason = loop {
        if ctx.cancelled(steps) {
            break StopReason::Cancelled;
        }

        let output = state.forward(ctx, steps)?;
        recorder.record_model_output(&output);
        let mut scores = last_position_logits(&output.logits, steps)?;
        ctx.processors
            .process(state.sequences.view(), &mut scores)
            .map_err(|e| e.at_step(steps, "logits_processors"))?;
        recorder.record_scores(&scores);

        let tokens = select_tokens(ctx, &scores, &unfinished, sampling).map_err(|e| e.at_step(steps, "selection"))?;
        state.append(&tokens)?;
        steps += 1;

        let done = ctx.stopping.evaluate(state.sequences.view(), Some(&scores));
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

/// One token per row; finished rows receive the pad token.
fn select_tokens<M: DecoderModel + ?Sized>(
    ctx: &mut StepContext<'_, M>,
    scores: &Array2<f32>,
    unfinished: &[bool],
    sampling: bool,
) -> Result<Vec<u32>> {
    scores
        .outer_iter()
        .enumerate()
        .map(|(row_idx, row)| {
            if !unfinished[row_idx] {
                return Ok(ctx.pad_token_id);
            }
            let token = if sampling {
                let probs = softmax(&row, row_idx)?;
                sample_from_probs(probs.view(), &mut ctx.rng)
            } else {
                argmax(&row).ok_or(GenerationError::AllTokensMasked { row: row_idx })?
            };
            Ok(token as u32)
        })
        .collect()
}
