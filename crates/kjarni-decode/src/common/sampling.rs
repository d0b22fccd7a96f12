//! Row-level numeric helpers shared by the processors and the selection step.
//!
//! Every helper works on one vocabulary row and accepts both owned rows and
//! mutable views, so callers can iterate `scores.outer_iter_mut()` directly.
//! Masked entries are `f32::NEG_INFINITY`; all sorts are stable so ties go to
//! the lower token id.

use std::cmp::Ordering;

use ndarray::{Array1, ArrayBase, ArrayView1, Data, DataMut, Ix1};
use rand::Rng;

use crate::error::{GenerationError, Result};

#[inline]
fn descending(a: f32, b: f32) -> Ordering {
    b.partial_cmp(&a).unwrap_or(Ordering::Equal)
}

/// Token ids of `row` sorted by score, highest first.
pub fn sorted_indices_desc<S>(row: &ArrayBase<S, Ix1>) -> Vec<usize>
where
    S: Data<Elem = f32>,
{
    let mut indices: Vec<usize> = (0..row.len()).collect();
    indices.sort_by(|&a, &b| descending(row[a], row[b]));
    indices
}

/// Softmax in place. Fails with `AllTokensMasked` when no entry is finite.
pub fn softmax_inplace<S>(row: &mut ArrayBase<S, Ix1>, row_idx: usize) -> Result<()>
where
    S: DataMut<Elem = f32>,
{
    let max = row.fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    if max == f32::NEG_INFINITY || max.is_nan() {
        return Err(GenerationError::AllTokensMasked { row: row_idx });
    }
    row.mapv_inplace(|x| (x - max).exp());
    let sum = row.sum();
    *row /= sum;
    Ok(())
}

pub fn softmax<S>(row: &ArrayBase<S, Ix1>, row_idx: usize) -> Result<Array1<f32>>
where
    S: Data<Elem = f32>,
{
    let mut probs = row.to_owned();
    softmax_inplace(&mut probs, row_idx)?;
    Ok(probs)
}

/// Log-softmax. A fully masked row stays fully masked instead of going NaN.
pub fn log_softmax_1d<S>(row: &ArrayBase<S, Ix1>) -> Array1<f32>
where
    S: Data<Elem = f32>,
{
    let max_val = row.fold(f32::NEG_INFINITY, |acc, &x| acc.max(x));
    if max_val == f32::NEG_INFINITY {
        return Array1::from_elem(row.len(), f32::NEG_INFINITY);
    }
    let scaled = row.mapv(|x| x - max_val);
    let exp_sum = scaled.mapv(f32::exp).sum();
    scaled - exp_sum.ln()
}

/// Index of the highest score, lowest index on ties. `None` if every entry is masked.
pub fn argmax<S>(row: &ArrayBase<S, Ix1>) -> Option<usize>
where
    S: Data<Elem = f32>,
{
    let mut best: Option<(usize, f32)> = None;
    for (idx, &score) in row.iter().enumerate() {
        if score.is_nan() || score == f32::NEG_INFINITY {
            continue;
        }
        match best {
            Some((_, best_score)) if score <= best_score => {}
            _ => best = Some((idx, score)),
        }
    }
    best.map(|(idx, _)| idx)
}

/// The `k` highest `(token, score)` pairs, best first.
pub fn top_k_with_scores<S>(row: &ArrayBase<S, Ix1>, k: usize) -> Vec<(usize, f32)>
where
    S: Data<Elem = f32>,
{
    let mut indices = sorted_indices_desc(row);
    indices.truncate(k);
    indices.into_iter().map(|i| (i, row[i])).collect()
}

/// Inverse-CDF draw from a normalised distribution.
pub fn sample_from_probs<R: Rng + ?Sized>(probs: ArrayView1<'_, f32>, rng: &mut R) -> usize {
    let uniform: f32 = rng.r#gen();
    let mut cumulative = 0.0;
    let mut last_positive = 0;
    for (idx, &prob) in probs.iter().enumerate() {
        if prob <= 0.0 {
            continue;
        }
        last_positive = idx;
        cumulative += prob;
        if cumulative > uniform {
            return idx;
        }
    }
    // rounding left the cumulative sum just under the draw
    last_positive
}

/// Draws `k` distinct ids, renormalising after each draw.
///
/// Stops early when fewer than `k` ids have non-zero probability.
pub fn sample_without_replacement<R: Rng + ?Sized>(
    probs: ArrayView1<'_, f32>,
    k: usize,
    rng: &mut R,
) -> Vec<usize> {
    let mut remaining = probs.to_owned();
    let mut picked = Vec::with_capacity(k);
    while picked.len() < k {
        let mass = remaining.sum();
        if mass <= 0.0 || !mass.is_finite() {
            break;
        }
        let normalised = &remaining / mass;
        let idx = sample_from_probs(normalised.view(), rng);
        picked.push(idx);
        remaining[idx] = 0.0;
    }
    picked
}

// ---------------------------------------------------------------------------
//  Penalties
// ---------------------------------------------------------------------------

/// Divides positive / multiplies negative scores of every distinct token in `tokens`.
pub fn apply_repetition_penalty_inplace<S>(
    logits: &mut ArrayBase<S, Ix1>,
    tokens: &[u32],
    penalty: f32,
) where
    S: DataMut<Elem = f32>,
{
    if penalty == 1.0 {
        return;
    }
    let mut seen = vec![false; logits.len()];
    for &token in tokens {
        let idx = token as usize;
        if idx < logits.len() && !seen[idx] {
            seen[idx] = true;
            let score = logits[idx];
            if score < 0.0 {
                logits[idx] = score * penalty;
            } else {
                logits[idx] = score / penalty;
            }
        }
    }
}

/// Bans every token that would complete an n-gram already present in `tokens`.
pub fn apply_no_repeat_ngram_inplace<S>(
    logits: &mut ArrayBase<S, Ix1>,
    tokens: &[u32],
    ngram_size: usize,
) where
    S: DataMut<Elem = f32>,
{
    let n = ngram_size;
    if n == 0 || tokens.len() + 1 < n {
        return;
    }

    // The last n-1 tokens form the current prefix
    let current_prefix = &tokens[tokens.len() - (n - 1)..];

    for window in tokens.windows(n) {
        if &window[..n - 1] == current_prefix {
            let banned_token = window[n - 1] as usize;
            if banned_token < logits.len() {
                logits[banned_token] = f32::NEG_INFINITY;
            }
        }
    }
}

// ---------------------------------------------------------------------------
//  Warpers
// ---------------------------------------------------------------------------

pub fn top_k_filtering_inplace<S>(logits: &mut ArrayBase<S, Ix1>, k: usize)
where
    S: DataMut<Elem = f32>,
{
    if k >= logits.len() {
        return;
    }
    let indices = sorted_indices_desc(logits);
    for &idx in &indices[k..] {
        logits[idx] = f32::NEG_INFINITY;
    }
}

/// Keeps the smallest highest-first prefix whose probability mass reaches `p`,
/// never fewer than `min_tokens_to_keep`.
pub fn top_p_filtering_inplace<S>(
    logits: &mut ArrayBase<S, Ix1>,
    p: f32,
    min_tokens_to_keep: usize,
    row_idx: usize,
) -> Result<()>
where
    S: DataMut<Elem = f32>,
{
    if p >= 1.0 {
        return Ok(());
    }
    let probs = softmax(logits, row_idx)?;
    let indices = sorted_indices_desc(logits);

    let mut cumulative = 0.0;
    let mut cutoff = indices.len();
    for (rank, &idx) in indices.iter().enumerate() {
        cumulative += probs[idx];
        if cumulative >= p && rank + 1 >= min_tokens_to_keep {
            cutoff = rank + 1;
            break;
        }
    }
    for &idx in &indices[cutoff..] {
        logits[idx] = f32::NEG_INFINITY;
    }
    Ok(())
}

/// Locally typical sampling: keeps the tokens whose surprisal is closest to the
/// row entropy, up to `mass` of probability.
pub fn typical_filtering_inplace<S>(
    logits: &mut ArrayBase<S, Ix1>,
    mass: f32,
    min_tokens_to_keep: usize,
) where
    S: DataMut<Elem = f32>,
{
    if mass >= 1.0 || logits.is_empty() {
        return;
    }
    let log_probs = log_softmax_1d(logits);
    let entropy: f32 = log_probs
        .iter()
        .filter(|lp| lp.is_finite())
        .map(|&lp| -lp.exp() * lp)
        .sum();
    let shifted = log_probs.mapv(|lp| (-lp - entropy).abs());

    let mut order: Vec<usize> = (0..shifted.len()).collect();
    order.sort_by(|&a, &b| {
        shifted[a]
            .partial_cmp(&shifted[b])
            .unwrap_or(Ordering::Equal)
    });

    let mut cumulative = 0.0;
    let mut last_ind = 0;
    for &idx in &order {
        cumulative += log_probs[idx].exp();
        if cumulative < mass {
            last_ind += 1;
        } else {
            break;
        }
    }
    let last_ind = last_ind.min(order.len() - 1);
    let threshold = shifted[order[last_ind]];

    for (rank, &idx) in order.iter().enumerate() {
        if rank >= min_tokens_to_keep && shifted[idx] > threshold {
            logits[idx] = f32::NEG_INFINITY;
        }
    }
}

/// Drops tokens whose probability is below `min_p` times the top probability.
pub fn min_p_filtering_inplace<S>(
    logits: &mut ArrayBase<S, Ix1>,
    min_p: f32,
    min_tokens_to_keep: usize,
    row_idx: usize,
) -> Result<()>
where
    S: DataMut<Elem = f32>,
{
    let probs = softmax(logits, row_idx)?;
    let max_prob = probs.fold(0.0f32, |a, &b| a.max(b));
    let cutoff = max_prob * min_p;

    let indices = sorted_indices_desc(&probs);
    for &idx in indices.iter().skip(min_tokens_to_keep) {
        if probs[idx] < cutoff {
            logits[idx] = f32::NEG_INFINITY;
        }
    }
    Ok(())
}

/// Cosine similarity; zero when either vector has zero norm.
pub fn cosine_similarity(a: ArrayView1<'_, f32>, b: ArrayView1<'_, f32>) -> f32 {
    let dot = a.dot(&b);
    let norm = a.dot(&a).sqrt() * b.dot(&b).sqrt();
    if norm > 0.0 { dot / norm } else { 0.0 }
}
