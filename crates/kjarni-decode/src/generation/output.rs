use ndarray::{Array1, Array2, Array3, Array4, Axis, s};

use crate::error::{GenerationError, Result};
use crate::stopping::StopReason;

/// Result of one `generate` call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOutput {
    /// `(batch * num_return_sequences, total_length)`, prompt included.
    /// For encoder-decoder models the decoder sequence, start token included.
    pub sequences: Array2<u32>,
    /// Processed scores of every step, when `output_scores` is set.
    pub scores: Option<Vec<Array2<f32>>>,
    /// Beam modes: origin row of every generated token, padded with -1.
    pub beam_indices: Option<Array2<i64>>,
    /// Beam modes: length-normalised log-probability per returned sequence.
    pub sequences_scores: Option<Array1<f32>>,
    /// Per step, the model's attention tensors, when requested.
    pub attentions: Option<Vec<Vec<Array4<f32>>>>,
    /// Per step, the model's hidden states, when requested.
    pub hidden_states: Option<Vec<Vec<Array3<f32>>>>,
    pub stop_reason: StopReason,
    /// `false` when generation was cancelled and this is partial output.
    pub complete: bool,
    /// Model calls made after the prompt pass.
    pub steps: usize,
    pub(crate) prompt_len: usize,
    pub(crate) eos_token_ids: Vec<u32>,
    pub(crate) pad_token_id: u32,
}

impl GenerationOutput {
    pub fn num_sequences(&self) -> usize {
        self.sequences.nrows()
    }

    pub fn prompt_len(&self) -> usize {
        self.prompt_len
    }

    pub fn pad_token_id(&self) -> u32 {
        self.pad_token_id
    }

    /// Turns partial (cancelled) output into `CancellationRequested`.
    pub fn into_complete(self) -> Result<Self> {
        if self.complete {
            Ok(self)
        } else {
            Err(GenerationError::CancellationRequested { steps: self.steps })
        }
    }

    /// Generated tokens of every row (prompt excluded), cut after the first EOS.
    /// Rows without EOS lose their trailing padding.
    pub fn sequences_until_eos(&self) -> Vec<Vec<u32>> {
        self.sequences
            .outer_iter()
            .map(|row| {
                let row = row.to_vec();
                let generated = &row[self.prompt_len.min(row.len())..];
                match generated.iter().position(|t| self.eos_token_ids.contains(t)) {
                    Some(eos_at) => generated[..=eos_at].to_vec(),
                    None => {
                        let end = generated
                            .iter()
                            .rposition(|&t| t != self.pad_token_id)
                            .map_or(0, |i| i + 1);
                        generated[..end].to_vec()
                    }
                }
            })
            .collect()
    }

    /// Generated tokens of every row, prompt excluded.
    pub fn generated_tokens(&self) -> Array2<u32> {
        let start = self.prompt_len.min(self.sequences.ncols());
        self.sequences.slice(s![.., start..]).to_owned()
    }
}

/// Drops trailing columns after every row has emitted EOS.
///
/// A column is dropped only if every row finished strictly before it, so a
/// final EOS column is kept even when the pad id equals the EOS id.
pub(crate) fn trim_trailing_padding(sequences: &Array2<u32>, prompt_len: usize, eos_token_ids: &[u32]) -> Array2<u32> {
    if eos_token_ids.is_empty() || sequences.nrows() == 0 {
        return sequences.clone();
    }
    let mut end = prompt_len;
    for row in sequences.axis_iter(Axis(0)) {
        let first_eos = row
            .iter()
            .enumerate()
            .skip(prompt_len)
            .find(|(_, t)| eos_token_ids.contains(t))
            .map(|(i, _)| i);
        match first_eos {
            Some(i) => end = end.max(i + 1),
            None => return sequences.clone(),
        }
    }
    sequences.slice(s![.., ..end]).to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn output(sequences: Array2<u32>, prompt_len: usize) -> GenerationOutput {
        GenerationOutput {
            sequences,
            scores: None,
            beam_indices: None,
            sequences_scores: None,
            attentions: None,
            hidden_states: None,
            stop_reason: StopReason::Eos,
            complete: true,
            steps: 3,
            prompt_len,
            eos_token_ids: vec![0],
            pad_token_id: 9,
        }
    }

    #[test]
    fn test_sequences_until_eos() {
        let out = output(array![[5, 2, 7, 0, 9], [5, 2, 7, 7, 9], [0, 2, 3, 3, 3]], 2);
        assert_eq!(
            out.sequences_until_eos(),
            vec![vec![7, 0], vec![7, 7], vec![3, 3, 3]]
        );
        assert_eq!(out.generated_tokens().ncols(), 3);
    }

    #[test]
    fn test_into_complete() {
        let out = output(array![[1, 2]], 1);
        assert!(out.clone().into_complete().is_ok());

        let partial = GenerationOutput {
            complete: false,
            stop_reason: StopReason::Cancelled,
            ..out
        };
        assert!(matches!(
            partial.into_complete(),
            Err(GenerationError::CancellationRequested { steps: 3 })
        ));
    }

    #[test]
    fn test_trim_trailing_padding() {
        let sequences = array![[5, 0, 0, 0], [5, 7, 0, 0]];
        assert_eq!(
            trim_trailing_padding(&sequences, 1, &[0]),
            array![[5, 0, 0], [5, 7, 0]]
        );

        // a row without EOS keeps everything
        let open = array![[5, 0, 0], [5, 7, 7]];
        assert_eq!(trim_trailing_padding(&open, 1, &[0]), open);
        assert_eq!(trim_trailing_padding(&open, 1, &[]), open);
    }
}
