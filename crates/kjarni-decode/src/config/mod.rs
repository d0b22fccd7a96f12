//! Generation configuration.
//!
//! A [`GenerationConfig`] is a frozen record: build it (from defaults, JSON or
//! [`resolve_generation_config`]), call [`GenerationConfig::validate`], and
//! hand it to the generator. Nothing in the decoding loop mutates it.

mod overrides;

pub use overrides::{resolve_generation_config, GenerationOverrides};

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};

use crate::cache::{CacheDType, CacheImplementation};
use crate::error::{GenerationError, Result};

/// Decoding algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationMode {
    Greedy,
    Sample,
    BeamSearch,
    BeamSample,
    #[serde(rename = "contrastive")]
    ContrastiveSearch,
}

impl GenerationMode {
    pub fn is_beam(self) -> bool {
        matches!(self, GenerationMode::BeamSearch | GenerationMode::BeamSample)
    }

    pub fn is_sampling(self) -> bool {
        matches!(self, GenerationMode::Sample | GenerationMode::BeamSample)
    }

    pub fn name(self) -> &'static str {
        match self {
            GenerationMode::Greedy => "greedy",
            GenerationMode::Sample => "sample",
            GenerationMode::BeamSearch => "beam_search",
            GenerationMode::BeamSample => "beam_sample",
            GenerationMode::ContrastiveSearch => "contrastive",
        }
    }
}

impl fmt::Display for GenerationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// When a beam group may stop before `max_length`.
///
/// Serialised as `false`, `true` or `"never"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EarlyStopping {
    /// `false`: stop once no active beam can beat the worst finished one,
    /// judged at the current length.
    #[default]
    Heuristic,
    /// `true`: stop as soon as `num_beams` hypotheses are finished.
    Immediate,
    /// `"never"`: like `Heuristic` but judged at the longest reachable length.
    Never,
}

impl Serialize for EarlyStopping {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            EarlyStopping::Heuristic => serializer.serialize_bool(false),
            EarlyStopping::Immediate => serializer.serialize_bool(true),
            EarlyStopping::Never => serializer.serialize_str("never"),
        }
    }
}

impl<'de> Deserialize<'de> for EarlyStopping {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct EarlyStoppingVisitor;

        impl Visitor<'_> for EarlyStoppingVisitor {
            type Value = EarlyStopping;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("true, false or \"never\"")
            }

            fn visit_bool<E: de::Error>(self, v: bool) -> std::result::Result<EarlyStopping, E> {
                Ok(if v {
                    EarlyStopping::Immediate
                } else {
                    EarlyStopping::Heuristic
                })
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<EarlyStopping, E> {
                match v {
                    "never" => Ok(EarlyStopping::Never),
                    "true" => Ok(EarlyStopping::Immediate),
                    "false" => Ok(EarlyStopping::Heuristic),
                    other => Err(E::invalid_value(de::Unexpected::Str(other), &self)),
                }
            }
        }

        deserializer.deserialize_any(EarlyStoppingVisitor)
    }
}

/// A single EOS id or a set of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EosTokenIds {
    Single(u32),
    Many(Vec<u32>),
}

impl EosTokenIds {
    pub fn to_vec(&self) -> Vec<u32> {
        match self {
            EosTokenIds::Single(id) => vec![*id],
            EosTokenIds::Many(ids) => ids.clone(),
        }
    }
}

impl From<u32> for EosTokenIds {
    fn from(id: u32) -> Self {
        EosTokenIds::Single(id)
    }
}

impl From<Vec<u32>> for EosTokenIds {
    fn from(ids: Vec<u32>) -> Self {
        EosTokenIds::Many(ids)
    }
}

/// Parameters of the windowed sink cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttentionSinkConfig {
    pub window_length: usize,
    pub num_sink_tokens: usize,
}

/// Everything that controls one `generate` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Explicit algorithm; derived from the flags below when absent.
    pub strategy: Option<GenerationMode>,
    pub do_sample: bool,

    // --- length ---
    /// Total length including the prompt.
    pub max_length: usize,
    /// Takes precedence over `max_length` when set.
    pub max_new_tokens: Option<usize>,
    pub min_length: usize,
    pub min_new_tokens: Option<usize>,
    /// Wall-clock budget in seconds.
    pub max_time: Option<f64>,

    // --- beams ---
    pub num_beams: usize,
    pub num_return_sequences: usize,
    pub length_penalty: f32,
    pub early_stopping: EarlyStopping,

    // --- sampling ---
    pub temperature: f32,
    pub top_k: Option<usize>,
    pub top_p: Option<f32>,
    pub typical_p: Option<f32>,
    pub min_p: Option<f32>,
    /// Degeneration penalty of contrastive search.
    pub penalty_alpha: Option<f32>,

    // --- penalties and constraints ---
    pub repetition_penalty: f32,
    pub no_repeat_ngram_size: usize,
    pub bad_words_ids: Option<Vec<Vec<u32>>>,
    pub suppress_tokens: Option<Vec<u32>>,
    pub begin_suppress_tokens: Option<Vec<u32>>,
    pub forced_bos_token_id: Option<u32>,
    pub forced_eos_token_id: Option<u32>,
    /// `(position, token id)` pairs. The position indexes the whole sequence,
    /// prompt included: with a 2-token prompt the first generated token is at 2.
    pub forced_decoder_ids: Option<Vec<(usize, u32)>>,
    pub remove_invalid_values: bool,
    pub renormalize_logits: bool,

    // --- special tokens ---
    pub bos_token_id: Option<u32>,
    pub eos_token_id: Option<EosTokenIds>,
    pub pad_token_id: Option<u32>,
    pub decoder_start_token_id: Option<u32>,

    // --- model call ---
    pub num_logits_to_keep: Option<usize>,
    pub use_cache: bool,
    pub cache_implementation: Option<CacheImplementation>,
    pub attention_sink: Option<AttentionSinkConfig>,
    pub cache_dtype: CacheDType,

    // --- output ---
    pub output_scores: bool,
    pub output_attentions: bool,
    pub output_hidden_states: bool,
    pub trim_trailing_padding: bool,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            strategy: None,
            do_sample: false,
            max_length: 20,
            max_new_tokens: None,
            min_length: 0,
            min_new_tokens: None,
            max_time: None,
            num_beams: 1,
            num_return_sequences: 1,
            length_penalty: 1.0,
            early_stopping: EarlyStopping::Heuristic,
            temperature: 1.0,
            top_k: None,
            top_p: None,
            typical_p: None,
            min_p: None,
            penalty_alpha: None,
            repetition_penalty: 1.0,
            no_repeat_ngram_size: 0,
            bad_words_ids: None,
            suppress_tokens: None,
            begin_suppress_tokens: None,
            forced_bos_token_id: None,
            forced_eos_token_id: None,
            forced_decoder_ids: None,
            remove_invalid_values: false,
            renormalize_logits: false,
            bos_token_id: None,
            eos_token_id: None,
            pad_token_id: None,
            decoder_start_token_id: None,
            num_logits_to_keep: None,
            use_cache: true,
            cache_implementation: None,
            attention_sink: None,
            cache_dtype: CacheDType::F32,
            output_scores: false,
            output_attentions: false,
            output_hidden_states: false,
            trim_trailing_padding: false,
        }
    }
}

impl GenerationConfig {
    /// Keys accepted in a JSON config.
    pub const KNOWN_KEYS: &'static [&'static str] = &[
        "strategy",
        "do_sample",
        "max_length",
        "max_new_tokens",
        "min_length",
        "min_new_tokens",
        "max_time",
        "num_beams",
        "num_return_sequences",
        "length_penalty",
        "early_stopping",
        "temperature",
        "top_k",
        "top_p",
        "typical_p",
        "min_p",
        "penalty_alpha",
        "repetition_penalty",
        "no_repeat_ngram_size",
        "bad_words_ids",
        "suppress_tokens",
        "begin_suppress_tokens",
        "forced_bos_token_id",
        "forced_eos_token_id",
        "forced_decoder_ids",
        "remove_invalid_values",
        "renormalize_logits",
        "bos_token_id",
        "eos_token_id",
        "pad_token_id",
        "decoder_start_token_id",
        "num_logits_to_keep",
        "use_cache",
        "cache_implementation",
        "attention_sink",
        "cache_dtype",
        "output_scores",
        "output_attentions",
        "output_hidden_states",
        "trim_trailing_padding",
    ];

    /// Parses a JSON object. Omitted keys take their defaults; unknown keys
    /// fail with `UnknownConfigKey`.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        let Some(object) = value.as_object() else {
            return Err(GenerationError::InvalidConfig(
                "generation config must be a JSON object".to_string(),
            ));
        };
        if let Some(key) = object
            .keys()
            .find(|k| !Self::KNOWN_KEYS.contains(&k.as_str()))
        {
            return Err(GenerationError::UnknownConfigKey(key.clone()));
        }
        Ok(serde_json::from_value(value)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn eos_token_ids(&self) -> Vec<u32> {
        self.eos_token_id
            .as_ref()
            .map(EosTokenIds::to_vec)
            .unwrap_or_default()
    }

    /// Total sequence length limit for a prompt of `prompt_len` tokens.
    pub fn effective_max_length(&self, prompt_len: usize) -> usize {
        match self.max_new_tokens {
            Some(n) => prompt_len + n,
            None => self.max_length,
        }
    }

    /// The algorithm this config selects.
    ///
    /// Without an explicit `strategy` the flags decide: `num_beams > 1`
    /// picks a beam mode, `do_sample` picks sampling, and `penalty_alpha`
    /// with `top_k > 1` picks contrastive search.
    pub fn generation_mode(&self) -> Result<GenerationMode> {
        let derived = if self.num_beams > 1 {
            if self.do_sample {
                GenerationMode::BeamSample
            } else {
                GenerationMode::BeamSearch
            }
        } else if self.do_sample {
            GenerationMode::Sample
        } else if self.penalty_alpha.is_some_and(|a| a > 0.0) && self.top_k.is_some_and(|k| k > 1) {
            GenerationMode::ContrastiveSearch
        } else {
            GenerationMode::Greedy
        };

        let Some(explicit) = self.strategy else {
            return Ok(derived);
        };

        let conflict = |msg: &str| {
            Err(GenerationError::ConflictingFlags(format!(
                "strategy '{}' {} (num_beams={}, do_sample={})",
                explicit, msg, self.num_beams, self.do_sample
            )))
        };
        match explicit {
            GenerationMode::Greedy | GenerationMode::Sample | GenerationMode::ContrastiveSearch
                if self.num_beams > 1 =>
            {
                conflict("needs num_beams == 1")
            }
            GenerationMode::BeamSearch | GenerationMode::BeamSample if self.num_beams < 2 => {
                conflict("needs num_beams > 1")
            }
            GenerationMode::Sample | GenerationMode::BeamSample if !self.do_sample => {
                conflict("needs do_sample == true")
            }
            GenerationMode::Greedy | GenerationMode::BeamSearch | GenerationMode::ContrastiveSearch
                if self.do_sample =>
            {
                conflict("needs do_sample == false")
            }
            GenerationMode::ContrastiveSearch
                if self.penalty_alpha.is_none() || !self.top_k.is_some_and(|k| k > 1) =>
            {
                conflict("needs penalty_alpha and top_k > 1")
            }
            mode => Ok(mode),
        }
    }

    /// `max_time` as a [`Duration`]; positive and representable, or `InvalidConfig`.
    pub fn max_time_budget(&self) -> Result<Option<Duration>> {
        let Some(seconds) = self.max_time else {
            return Ok(None);
        };
        if !(seconds > 0.0) {
            return Err(GenerationError::InvalidConfig(format!(
                "max_time must be > 0, got {}",
                seconds
            )));
        }
        Duration::try_from_secs_f64(seconds).map(Some).map_err(|e| {
            GenerationError::InvalidConfig(format!("max_time {} is out of range: {}", seconds, e))
        })
    }

    /// Rejects out-of-range values and contradictory flags.
    pub fn validate(&self) -> Result<GenerationMode> {
        let invalid = |msg: String| Err(GenerationError::InvalidConfig(msg));
        let conflicting = |msg: String| Err(GenerationError::ConflictingFlags(msg));

        if self.num_beams == 0 {
            return invalid("num_beams must be >= 1".to_string());
        }
        if self.num_beams == 1 && self.early_stopping != EarlyStopping::Heuristic {
            return conflicting(format!(
                "early_stopping={:?} has no effect with num_beams == 1",
                self.early_stopping
            ));
        }

        let mode = self.generation_mode()?;

        if !(self.temperature > 0.0 && self.temperature.is_finite()) {
            return invalid(format!("temperature must be > 0, got {}", self.temperature));
        }
        if self.top_k == Some(0) {
            return invalid("top_k must be >= 1".to_string());
        }
        for (name, value) in [
            ("top_p", self.top_p),
            ("typical_p", self.typical_p),
            ("min_p", self.min_p),
        ] {
            if let Some(v) = value {
                if !(v > 0.0 && v <= 1.0) {
                    return invalid(format!("{} must be in (0, 1], got {}", name, v));
                }
            }
        }
        if !(self.repetition_penalty > 0.0 && self.repetition_penalty.is_finite()) {
            return invalid(format!(
                "repetition_penalty must be > 0, got {}",
                self.repetition_penalty
            ));
        }
        if !self.length_penalty.is_finite() {
            return invalid("length_penalty must be finite".to_string());
        }
        if self.max_new_tokens == Some(0) {
            return invalid("max_new_tokens must be > 0".to_string());
        }
        if self.max_new_tokens.is_none() && self.max_length == 0 {
            return invalid("max_length must be > 0".to_string());
        }
        if self.max_new_tokens.is_none() && self.min_length > self.max_length {
            return invalid(format!(
                "min_length ({}) exceeds max_length ({})",
                self.min_length, self.max_length
            ));
        }
        self.max_time_budget()?;
        if self.num_logits_to_keep == Some(0) {
            return invalid("num_logits_to_keep must be >= 1".to_string());
        }

        if self.num_return_sequences == 0 {
            return invalid("num_return_sequences must be >= 1".to_string());
        }
        match mode {
            GenerationMode::BeamSearch | GenerationMode::BeamSample
                if self.num_return_sequences > self.num_beams =>
            {
                return conflicting(format!(
                    "num_return_sequences ({}) exceeds num_beams ({})",
                    self.num_return_sequences, self.num_beams
                ));
            }
            GenerationMode::Greedy | GenerationMode::ContrastiveSearch
                if self.num_return_sequences != 1 =>
            {
                return conflicting(format!(
                    "{} decoding returns exactly one sequence, got num_return_sequences={}",
                    mode, self.num_return_sequences
                ));
            }
            _ => {}
        }

        if mode == GenerationMode::ContrastiveSearch {
            if let Some(alpha) = self.penalty_alpha {
                if !(0.0..=1.0).contains(&alpha) {
                    return invalid(format!("penalty_alpha must be in [0, 1], got {}", alpha));
                }
            }
            if self.cache_implementation == Some(CacheImplementation::Static) {
                return conflicting(
                    "contrastive search expands the cache batch; a static cache cannot".to_string(),
                );
            }
        }

        if let Some(words) = &self.bad_words_ids {
            if words.iter().any(Vec::is_empty) {
                return invalid("bad_words_ids contains an empty sequence".to_string());
            }
        }

        if let Some(sink) = &self.attention_sink {
            if sink.window_length == 0 || sink.num_sink_tokens >= sink.window_length {
                return invalid(format!(
                    "attention_sink needs 0 <= num_sink_tokens < window_length, got {} and {}",
                    sink.num_sink_tokens, sink.window_length
                ));
            }
        }
        if self.cache_implementation == Some(CacheImplementation::Sink)
            && self.attention_sink.is_none()
        {
            return invalid("cache_implementation 'sink' needs attention_sink parameters".to_string());
        }

        if let (Some(forced), Some(_)) = (self.forced_eos_token_id, &self.eos_token_id) {
            if !self.eos_token_ids().contains(&forced) {
                return conflicting(format!(
                    "forced_eos_token_id {} is not one of the EOS ids {:?}",
                    forced,
                    self.eos_token_ids()
                ));
            }
        }

        Ok(mode)
    }
}
