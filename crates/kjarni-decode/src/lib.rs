//! Autoregressive decoding core
//!
//! Turns a model callable into a text generator: key/value caches that grow,
//! slide or stay fixed-size, a chain of logits processors, stopping criteria,
//! beam search bookkeeping, and the step loop that ties them together for
//! greedy, sampling, beam and contrastive decoding.
//!
//! Model math, weights and tokenization are out of scope; a model is anything
//! implementing [`DecoderModel`].

pub mod beam;
pub mod cache;
pub mod common;
pub mod config;
pub mod error;
pub mod generation;
pub mod logits;
pub mod model;
pub mod rope;
pub mod stopping;

// Re-export commonly used items
pub use crate::{
    beam::{BeamHypotheses, BeamSearchOutput, BeamSearchScorer, BeamStepOutput},
    cache::{
        CacheDType, CacheImplementation, CacheKind, CacheLayout, DynamicCache, KVCache, ModelCache,
        SinkCache, StaticCache,
    },
    common::{CancellationHandle, CancellationToken},
    config::{AttentionSinkConfig, EarlyStopping, GenerationConfig, GenerationMode},
    error::{GenerationError, Result},
    generation::{GenerateOptions, GenerationOutput, Generator, generate_async},
    logits::{LogitsProcessor, LogitsProcessorList},
    model::{DecoderModel, Device, FnModel, ModelAdapter, ModelExtras, ModelInput, ModelOutput},
    stopping::{StopReason, StoppingCriteriaList, StoppingCriterion},
};

// Prelude for easy imports
pub mod prelude {
    pub use crate::cache::{KVCache, ModelCache};
    pub use crate::config::GenerationConfig;
    pub use crate::generation::{GenerateOptions, Generator};
    pub use crate::model::{DecoderModel, ModelInput, ModelOutput};
}

#[cfg(test)]
mod tests;
