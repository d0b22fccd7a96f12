//! User- and runtime-provided generation parameter overrides.
//!
//! These are not a full configuration; they are layered over a model's
//! default [`GenerationConfig`] by [`resolve_generation_config`].

use serde::{Deserialize, Serialize};

use super::{EarlyStopping, GenerationConfig};

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct GenerationOverrides {
    pub temperature: Option<f32>,
    pub top_k: Option<usize>,
    pub top_p: Option<f32>,
    pub typical_p: Option<f32>,
    pub min_p: Option<f32>,
    pub penalty_alpha: Option<f32>,

    /// Penalty for repeating tokens (1.0 = no penalty).
    pub repetition_penalty: Option<f32>,
    pub no_repeat_ngram_size: Option<usize>,

    pub max_new_tokens: Option<usize>,
    pub max_length: Option<usize>,
    pub min_length: Option<usize>,

    /// `Some(false)` forces deterministic decoding, `Some(true)` forces sampling.
    pub do_sample: Option<bool>,
    pub num_beams: Option<usize>,
    pub num_return_sequences: Option<usize>,
    /// < 1 favours shorter beams, > 1 longer ones.
    pub length_penalty: Option<f32>,
    pub early_stopping: Option<EarlyStopping>,
}

impl GenerationOverrides {
    pub fn greedy() -> Self {
        Self {
            do_sample: Some(false),
            num_beams: Some(1),
            ..Default::default()
        }
    }

    pub fn creative() -> Self {
        Self {
            do_sample: Some(true),
            temperature: Some(0.9),
            top_p: Some(0.95),
            top_k: Some(50),
            ..Default::default()
        }
    }

    pub fn precise() -> Self {
        Self {
            do_sample: Some(true),
            temperature: Some(0.3),
            top_p: Some(0.9),
            repetition_penalty: Some(1.1),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Layers overrides over model defaults.
///
/// Precedence, highest first: runtime overrides, user overrides, model defaults.
/// The result is not validated; call [`GenerationConfig::validate`] on it.
pub fn resolve_generation_config(
    model_defaults: GenerationConfig,
    user: &GenerationOverrides,
    runtime: &GenerationOverrides,
) -> GenerationConfig {
    let mut config = model_defaults;

    macro_rules! layer {
        ($field:ident) => {
            if let Some(v) = runtime.$field.or(user.$field) {
                config.$field = v;
            }
        };
        ($field:ident, optional) => {
            if let Some(v) = runtime.$field.or(user.$field) {
                config.$field = Some(v);
            }
        };
    }

    layer!(do_sample);
    layer!(num_beams);
    layer!(num_return_sequences);
    layer!(length_penalty);
    layer!(early_stopping);

    layer!(temperature);
    layer!(top_k, optional);
    layer!(top_p, optional);
    layer!(typical_p, optional);
    layer!(min_p, optional);
    layer!(penalty_alpha, optional);

    layer!(repetition_penalty);
    layer!(no_repeat_ngram_size);

    layer!(max_new_tokens, optional);
    layer!(max_length);
    layer!(min_length);

    // an explicit strategy from the defaults must not fight the new flags
    if runtime.do_sample.or(user.do_sample).is_some() || runtime.num_beams.or(user.num_beams).is_some() {
        config.strategy = None;
    }
    // beam-only settings are meaningless once overrides drop to a single beam
    if config.num_beams == 1 {
        config.early_stopping = EarlyStopping::Heuristic;
    }

    config
}
