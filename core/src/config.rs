/// NEM hyperparameters, threaded explicitly through constructors and calls.
///
/// Every field has a default so partial JSON documents deserialize cleanly:
///   loss_inter_weight  = 1.0
///   loss_step_weights  = "all"
///   pixel_prior.p      = 0.0
///   pixel_distribution = "bernoulli"
///   k                  = 5
///   nr_steps           = 30
///   pred_init          = 0.0

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{NemError, Result};

// ── Step weights ─────────────────────────────────────────────────────

/// Per-step weighting of the unrolled loss.
///
/// Serialized as `"all"`, `"last"` or a JSON list of floats.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "StepWeightsRepr", into = "StepWeightsRepr")]
pub enum StepWeights {
    /// Weight 1 on every step.
    All,
    /// Weight 1 on the final step only.
    Last,
    /// Caller-supplied weights, one per step.
    Explicit(Vec<f32>),
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum StepWeightsRepr {
    Named(String),
    Explicit(Vec<f32>),
}

impl TryFrom<StepWeightsRepr> for StepWeights {
    type Error = NemError;

    fn try_from(repr: StepWeightsRepr) -> Result<Self> {
        match repr {
            StepWeightsRepr::Named(name) => name.parse(),
            StepWeightsRepr::Explicit(w) => Ok(StepWeights::Explicit(w)),
        }
    }
}

impl From<StepWeights> for StepWeightsRepr {
    fn from(w: StepWeights) -> Self {
        match w {
            StepWeights::All => StepWeightsRepr::Named("all".into()),
            StepWeights::Last => StepWeightsRepr::Named("last".into()),
            StepWeights::Explicit(v) => StepWeightsRepr::Explicit(v),
        }
    }
}

impl FromStr for StepWeights {
    type Err = NemError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "all" => Ok(StepWeights::All),
            "last" => Ok(StepWeights::Last),
            other => Err(NemError::UnknownStepWeights(other.to_string())),
        }
    }
}

impl StepWeights {
    /// Expand into one weight per step.
    ///
    /// Fails when an explicit list has the wrong length or when the weights
    /// sum to zero (the aggregate is a weighted mean).
    pub fn resolve(&self, nr_steps: usize) -> Result<Vec<f32>> {
        let weights = match self {
            StepWeights::All => vec![1.0; nr_steps],
            StepWeights::Last => {
                let mut w = vec![0.0; nr_steps];
                if let Some(last) = w.last_mut() {
                    *last = 1.0;
                }
                w
            }
            StepWeights::Explicit(w) => {
                if w.len() != nr_steps {
                    return Err(NemError::StepWeightLength { expected: nr_steps, got: w.len() });
                }
                w.clone()
            }
        };
        if weights.iter().sum::<f32>() == 0.0 {
            return Err(NemError::ZeroStepWeights);
        }
        Ok(weights)
    }
}

// ── Config ───────────────────────────────────────────────────────────

/// Parameters of the pixel prior. For Bernoulli, `p` is the success probability.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PixelPrior {
    pub p: f32,
}

impl Default for PixelPrior {
    fn default() -> Self {
        PixelPrior { p: 0.0 }
    }
}

/// Full NEM configuration. Immutable for the duration of a run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NemConfig {
    /// Weight of the inter-cluster (prior divergence) loss.
    pub loss_inter_weight: f32,
    pub loss_step_weights: StepWeights,
    pub pixel_prior: PixelPrior,
    /// Name of the observation model. Only "bernoulli" is supported.
    pub pixel_distribution: String,
    /// Number of clusters.
    pub k: usize,
    /// Unroll horizon.
    pub nr_steps: usize,
    /// Constant the initial prediction is filled with.
    pub pred_init: f32,
}

impl Default for NemConfig {
    fn default() -> Self {
        NemConfig {
            loss_inter_weight: 1.0,
            loss_step_weights: StepWeights::All,
            pixel_prior: PixelPrior::default(),
            pixel_distribution: "bernoulli".to_string(),
            k: 5,
            nr_steps: 30,
            pred_init: 0.0,
        }
    }
}

impl NemConfig {
    /// Tiny configuration for fast tests.
    pub fn test_config() -> Self {
        NemConfig {
            k: 3,
            nr_steps: 5,
            ..NemConfig::default()
        }
    }

    /// Parse and validate a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        let cfg: NemConfig = serde_json::from_str(json)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.k == 0 {
            return Err(NemError::InvalidConfig("k must be >= 1".into()));
        }
        if self.nr_steps == 0 {
            return Err(NemError::InvalidConfig("nr_steps must be >= 1".into()));
        }
        if !(0.0..=1.0).contains(&self.pixel_prior.p) {
            return Err(NemError::InvalidConfig(format!(
                "pixel_prior.p must lie in [0, 1], got {}",
                self.pixel_prior.p
            )));
        }
        if !self.loss_inter_weight.is_finite() {
            return Err(NemError::InvalidConfig("loss_inter_weight must be finite".into()));
        }
        if !self.pred_init.is_finite() {
            return Err(NemError::InvalidConfig("pred_init must be finite".into()));
        }
        Ok(())
    }

    /// Per-step loss weights for `nr_steps`.
    pub fn step_weights(&self) -> Result<Vec<f32>> {
        self.loss_step_weights.resolve(self.nr_steps)
    }
}
