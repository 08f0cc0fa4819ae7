/// Gradient verification against central finite differences.
///
/// Provides:
/// - `unroll_loss`: forward-only `total_loss` for the current parameters
/// - `finite_diff_single`: (f(x+eps) - f(x-eps)) / (2*eps) for one weight
/// - `check_param_gradients`: sampled comparison of tape and FD gradients
///
/// Only meaningful for K = 1. There gamma is identically 1, so the two
/// stop-gradient points leave the true derivative unchanged and the tape
/// gradient must match finite differences. For K > 1 the tape gradient is
/// deliberately not the derivative of the loss.

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::warn;

use crate::cell::NemCell;
use crate::error::{NemError, Result};
use crate::predictor::InnerPredictor;
use crate::tape::Tape;
use crate::unroll::{compute_gradients, forward_unroll, NemBatch};

/// Gradients where both values are below this are below FD resolution.
pub const ABS_THRESHOLD: f32 = 5e-4;

/// Outcome for one parameter group.
#[derive(Clone, Debug, PartialEq)]
pub struct GradCheck {
    pub group: usize,
    pub checked: usize,
    pub passed: usize,
    pub max_rel_err: f32,
}

impl GradCheck {
    pub fn all_passed(&self) -> bool {
        self.checked == self.passed
    }
}

/// `total_loss` of one unroll, with the initial state drawn from `seed`.
pub fn unroll_loss<P: InnerPredictor>(cell: &NemCell<P>, batch: &NemBatch, seed: u64) -> Result<f32> {
    let mut tape = Tape::new();
    let params = cell.predictor.register_params(&mut tape);
    let mut rng = StdRng::seed_from_u64(seed);
    Ok(forward_unroll(cell, &mut tape, &params, batch, &mut rng)?.report.total_loss)
}

fn perturb<P: InnerPredictor>(cell: &mut NemCell<P>, group: usize, idx: usize, value: f32) {
    cell.predictor.parameters_mut()[group][idx] = value;
}

/// Central difference of `total_loss` with respect to parameter
/// `group[idx]`. The parameter is restored before returning.
pub fn finite_diff_single<P: InnerPredictor>(
    cell: &mut NemCell<P>,
    batch: &NemBatch,
    seed: u64,
    group: usize,
    idx: usize,
    eps: f32,
) -> Result<f32> {
    let orig = cell.predictor.parameters()[group][idx];

    perturb(cell, group, idx, orig + eps);
    let plus = unroll_loss(cell, batch, seed);
    perturb(cell, group, idx, orig - eps);
    let minus = unroll_loss(cell, batch, seed);
    perturb(cell, group, idx, orig);

    Ok((plus? - minus?) / (2.0 * eps))
}

/// Compare tape gradients with finite differences for up to `num_samples`
/// evenly spaced indices of every parameter group.
///
/// Uses relative error with denominator = max(|a|, |b|). Pairs where both
/// values are below `ABS_THRESHOLD` are auto-passed.
pub fn check_param_gradients<P: InnerPredictor>(
    cell: &mut NemCell<P>,
    batch: &NemBatch,
    seed: u64,
    num_samples: usize,
    eps: f32,
    tol: f32,
) -> Result<Vec<GradCheck>> {
    if cell.config().k != 1 {
        return Err(NemError::InvalidConfig(format!(
            "finite-difference check requires k = 1, got k = {}",
            cell.config().k
        )));
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let (_, grads) = compute_gradients(cell, batch, &mut rng)?;

    let mut results = Vec::with_capacity(grads.len());
    for (group, grad) in grads.iter().enumerate() {
        let n = grad.len();
        let step = if n > num_samples { n / num_samples } else { 1 };
        let mut check = GradCheck { group, checked: 0, passed: 0, max_rel_err: 0.0 };

        for idx in (0..n).step_by(step).take(num_samples) {
            let analytical = grad[idx];
            let numerical = finite_diff_single(cell, batch, seed, group, idx, eps)?;
            let denom = analytical.abs().max(numerical.abs());
            check.checked += 1;

            if denom < ABS_THRESHOLD {
                check.passed += 1;
                continue;
            }

            let rel_err = (analytical - numerical).abs() / denom;
            check.max_rel_err = check.max_rel_err.max(rel_err);
            if rel_err < tol {
                check.passed += 1;
            } else {
                warn!(group, idx, analytical, numerical, rel_err, "gradient mismatch");
            }
        }
        results.push(check);
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NemConfig;
    use crate::predictor::{RnnConfig, RnnPredictor};
    use crate::tensor::Tensor;

    #[test]
    fn test_rejects_multi_cluster() {
        let cfg = NemConfig::test_config();
        let rnn = RnnPredictor::new(RnnConfig::test_config(), 0).unwrap();
        let mut cell = NemCell::new(rnn, [4, 4, 1], &cfg).unwrap();
        let frames = Tensor::zeros(&[6, 1, 1, 4, 4, 1]);
        let batch = NemBatch::new(frames.clone(), frames);
        assert!(check_param_gradients(&mut cell, &batch, 0, 2, 1e-2, 0.1).is_err());
    }

    #[test]
    fn test_finite_diff_restores_parameter() {
        let cfg = NemConfig { k: 1, nr_steps: 2, ..NemConfig::test_config() };
        let rnn = RnnPredictor::new(RnnConfig::test_config(), 0).unwrap();
        let mut cell = NemCell::new(rnn, [4, 4, 1], &cfg).unwrap();
        let frames = Tensor::full(&[3, 1, 1, 4, 4, 1], 1.0);
        let batch = NemBatch::new(frames.clone(), frames);
        let before = cell.predictor.params.clone();
        finite_diff_single(&mut cell, &batch, 0, 0, 3, 1e-2).unwrap();
        assert_eq!(cell.predictor.params, before);
    }
}
