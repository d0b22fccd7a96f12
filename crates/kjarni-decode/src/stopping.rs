//! Stopping criteria.
//!
//! Each criterion answers "is this row finished?" after a step. The list ORs
//! its criteria per row; the generator keeps a sticky done mask across steps.

use std::fmt;
use std::time::{Duration, Instant};

use ndarray::{Array2, ArrayView2, Axis};

use crate::config::GenerationConfig;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq)]
pub enum StoppingCriterion {
    /// Every row is done once the sequence holds `max_length` tokens.
    MaxLength { max_length: usize },
    /// Every row is done once `budget` has elapsed since `start`.
    MaxTime { budget: Duration, start: Instant },
    /// A row is done when its last token is an EOS id.
    EosToken { eos_token_ids: Vec<u32> },
}

impl StoppingCriterion {
    pub fn name(&self) -> &'static str {
        match self {
            StoppingCriterion::MaxLength { .. } => "max_length",
            StoppingCriterion::MaxTime { .. } => "max_time",
            StoppingCriterion::EosToken { .. } => "eos_token",
        }
    }

    fn stop_reason(&self) -> StopReason {
        match self {
            StoppingCriterion::MaxLength { .. } => StopReason::MaxLength,
            StoppingCriterion::MaxTime { .. } => StopReason::MaxTime,
            StoppingCriterion::EosToken { .. } => StopReason::Eos,
        }
    }

    fn evaluate_into(&self, input_ids: ArrayView2<'_, u32>, done: &mut [bool]) {
        match self {
            StoppingCriterion::MaxLength { max_length } => {
                if input_ids.ncols() >= *max_length {
                    done.fill(true);
                }
            }
            StoppingCriterion::MaxTime { budget, start } => {
                if start.elapsed() > *budget {
                    done.fill(true);
                }
            }
            StoppingCriterion::EosToken { eos_token_ids } => {
                if input_ids.ncols() == 0 {
                    return;
                }
                let last = input_ids.index_axis(Axis(1), input_ids.ncols() - 1);
                for (flag, token) in done.iter_mut().zip(last.iter()) {
                    if eos_token_ids.contains(token) {
                        *flag = true;
                    }
                }
            }
        }
    }
}

/// Why a generation loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    MaxLength,
    MaxTime,
    Eos,
    /// Every beam group finished.
    BeamDone,
    Cancelled,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StopReason::MaxLength => "max_length",
            StopReason::MaxTime => "max_time",
            StopReason::Eos => "eos",
            StopReason::BeamDone => "beam_done",
            StopReason::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoppingCriteriaList {
    criteria: Vec<StoppingCriterion>,
}

impl StoppingCriteriaList {
    pub fn new() -> Self {
        Self::default()
    }

    /// `max_length` is the resolved total length limit (prompt included).
    pub fn from_config(config: &GenerationConfig, max_length: usize, start: Instant) -> Result<Self> {
        let mut list = Self::new().with_criterion(StoppingCriterion::MaxLength { max_length });
        if let Some(budget) = config.max_time_budget()? {
            list.push(StoppingCriterion::MaxTime { budget, start });
        }
        let eos_token_ids = config.eos_token_ids();
        if !eos_token_ids.is_empty() {
            list.push(StoppingCriterion::EosToken { eos_token_ids });
        }
        Ok(list)
    }

    pub fn push(&mut self, criterion: StoppingCriterion) {
        self.criteria.push(criterion);
    }

    pub fn with_criterion(mut self, criterion: StoppingCriterion) -> Self {
        self.criteria.push(criterion);
        self
    }

    pub fn criteria(&self) -> &[StoppingCriterion] {
        &self.criteria
    }

    pub fn len(&self) -> usize {
        self.criteria.len()
    }

    pub fn is_empty(&self) -> bool {
        self.criteria.is_empty()
    }

    /// Per-row done flags for the sequences so far. `scores` is the processed
    /// score tensor of the step, if any; no built-in criterion reads it.
    pub fn evaluate(&self, input_ids: ArrayView2<'_, u32>, _scores: Option<&Array2<f32>>) -> Vec<bool> {
        let mut done = vec![false; input_ids.nrows()];
        for criterion in &self.criteria {
            criterion.evaluate_into(input_ids, &mut done);
        }
        done
    }

    /// The first criterion (in list order) that finishes every row.
    pub fn stop_reason(&self, input_ids: ArrayView2<'_, u32>) -> Option<StopReason> {
        self.criteria.iter().find_map(|criterion| {
            let mut done = vec![false; input_ids.nrows()];
            criterion.evaluate_into(input_ids, &mut done);
            done.iter().all(|&d| d).then(|| criterion.stop_reason())
        })
    }

    /// Whether the wall-clock budget, if any, is spent.
    pub fn time_exceeded(&self) -> bool {
        self.criteria.iter().any(|c| match c {
            StoppingCriterion::MaxTime { budget, start } => start.elapsed() > *budget,
            _ => false,
        })
    }
}
