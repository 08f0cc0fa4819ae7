/// Error taxonomy for the NEM core.
///
/// Two families, both fatal and propagated to the caller unchanged:
///   - configuration errors (unknown distribution, bad step weights)
///   - shape/contract violations (wrong rank, mismatched trailing dims)
///
/// Numerical instability is never an error here: probabilities are clamped
/// before every log or division instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NemError {
    #[error("unsupported distribution: \"{0}\"")]
    UnsupportedDistribution(String),

    #[error("unknown loss_step_weights value: \"{0}\" (expected \"all\", \"last\" or a list)")]
    UnknownStepWeights(String),

    #[error("loss_step_weights has {got} entries but nr_steps is {expected}")]
    StepWeightLength { expected: usize, got: usize },

    #[error("loss_step_weights sum to zero; the weighted mean is undefined")]
    ZeroStepWeights,

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("requires {expected}D input (T, B, K, W, H, C) but got rank {got}")]
    RankMismatch { expected: usize, got: usize },

    #[error("shape mismatch for {what}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("inner predictor does not accept action inputs")]
    ActionsUnsupported,

    #[error("config parse error: {0}")]
    Config(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, NemError>;

/// Shorthand for the common shape-mismatch case.
pub fn shape_mismatch(what: &'static str, expected: &[usize], got: &[usize]) -> NemError {
    NemError::ShapeMismatch {
        what,
        expected: expected.to_vec(),
        got: got.to_vec(),
    }
}
