//! Error types for the decoding core.

use thiserror::Error;

/// Errors that can occur while configuring or running generation.
///
/// Messages carry shapes and indices only, never tensor contents.
#[derive(Debug, Error)]
pub enum GenerationError {
    // --- configuration ---
    /// A configuration value is out of range.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A configuration file contained a key that is not recognised.
    #[error("Unknown generation config key: '{0}'")]
    UnknownConfigKey(String),

    /// Two configuration flags contradict each other.
    #[error("Conflicting generation flags: {0}")]
    ConflictingFlags(String),

    // --- shape / dtype / device ---
    #[error("Shape mismatch in {component}: expected {expected}, got {actual}")]
    ShapeMismatch {
        component: &'static str,
        expected: String,
        actual: String,
    },

    #[error("Dtype mismatch: expected {expected}, got {actual}")]
    DtypeMismatch { expected: String, actual: String },

    #[error("Unsupported dtype for {component}: {dtype}")]
    UnsupportedDType {
        component: &'static str,
        dtype: String,
    },

    #[error("Device mismatch: {0}")]
    DeviceMismatch(String),

    #[error("Batch mismatch in {component}: expected {expected}, got {actual}")]
    BatchMismatch {
        component: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Layer index {index} out of range (num_layers={num_layers})")]
    LayerOutOfRange { index: usize, num_layers: usize },

    // --- cache ---
    #[error("Misaligned cache update on layer {layer}: {reason}")]
    MisalignedCache { layer: usize, reason: String },

    #[error("Rotary tables missing or too short: {0}")]
    MissingRotaryTables(String),

    #[error("Cache capacity exceeded: position {position} >= max_cache_length {capacity}")]
    CacheCapacityExceeded { position: usize, capacity: usize },

    // --- processors / selection ---
    #[error("Malformed input to logits processor '{processor}': {reason}")]
    MalformedProcessorInput {
        processor: &'static str,
        reason: String,
    },

    #[error("Beam count mismatch: expected {expected} rows, got {actual}")]
    BeamCountMismatch { expected: usize, actual: usize },

    #[error("No beam candidates left for batch group {batch_idx}")]
    EmptyBeam { batch_idx: usize },

    #[error("Every token is masked for row {row}")]
    AllTokensMasked { row: usize },

    // --- termination ---
    #[error("Generation cancelled after {steps} steps")]
    CancellationRequested { steps: usize },

    // --- external ---
    #[error("Model callable failed at step {step}: {source}")]
    ModelCallableFailed {
        step: usize,
        #[source]
        source: anyhow::Error,
    },

    /// The blocking task running a generation call panicked or was aborted.
    #[error("Generation worker failed: {0}")]
    WorkerFailed(String),

    /// Wraps an error with the step index and the component that raised it.
    #[error("step {step} [{component}]: {source}")]
    AtStep {
        step: usize,
        component: &'static str,
        #[source]
        source: Box<GenerationError>,
    },

    #[error("Failed to read generation config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse generation config: {0}")]
    Json(#[from] serde_json::Error),
}

impl GenerationError {
    /// Tags the error with a step index and component.
    ///
    /// Errors that already carry a step (`AtStep`, `ModelCallableFailed`) are left as is.
    pub fn at_step(self, step: usize, component: &'static str) -> Self {
        match self {
            GenerationError::AtStep { .. } | GenerationError::ModelCallableFailed { .. } => self,
            other => GenerationError::AtStep {
                step,
                component,
                source: Box::new(other),
            },
        }
    }

    /// Returns the innermost error, looking through `AtStep` wrappers.
    pub fn root(&self) -> &GenerationError {
        match self {
            GenerationError::AtStep { source, .. } => source.root(),
            other => other,
        }
    }

    pub(crate) fn shape(
        component: &'static str,
        expected: impl std::fmt::Debug,
        actual: impl std::fmt::Debug,
    ) -> Self {
        GenerationError::ShapeMismatch {
            component,
            expected: format!("{:?}", expected),
            actual: format!("{:?}", actual),
        }
    }
}

/// Result type for decoding operations.
pub type Result<T> = std::result::Result<T, GenerationError>;
