/// Pixel observation model.
///
/// Bernoulli is the only supported family. Every other name is a fatal
/// configuration error, raised the moment the name is resolved.
///
/// Per-element primitives (NLL, KL and their derivatives) live here so the
/// tape's reverse pass and the plain evaluation paths share one definition.

use std::str::FromStr;

use crate::config::PixelPrior;
use crate::error::{NemError, Result};
use crate::tensor::ClusterDims;

/// Clamp floor for probabilities before any log, and the E-step score floor.
pub const EPSILON: f32 = 1e-6;
/// Bounds for the ratios inside the Bernoulli KL.
pub const RATIO_MIN: f32 = 1e-6;
pub const RATIO_MAX: f32 = 1e6;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelDistribution {
    Bernoulli,
}

impl FromStr for PixelDistribution {
    type Err = NemError;

    fn from_str(name: &str) -> Result<Self> {
        match name {
            "bernoulli" => Ok(PixelDistribution::Bernoulli),
            other => Err(NemError::UnsupportedDistribution(other.to_string())),
        }
    }
}

/// Background distribution parameter, constant over every pixel.
/// Conceptually a (1, 1, 1, 1, 1) tensor.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Prior {
    pub p: f32,
}

impl PixelDistribution {
    pub fn from_name(name: &str) -> Result<Self> {
        name.parse()
    }

    pub fn prior(&self, pixel_prior: &PixelPrior) -> Prior {
        match self {
            PixelDistribution::Bernoulli => Prior { p: pixel_prior.p },
        }
    }

    /// Per-pixel likelihood of `data` under `pred`, summed over channels.
    ///
    /// pred, data: (B, K, W, H, C), data already broadcast over K.
    /// Returns (B, K, W, H, 1). `eps` is added to every score so that no
    /// cluster ever receives exactly zero responsibility.
    pub fn likelihood(&self, pred: &[f32], data: &[f32], dims: &ClusterDims, eps: f32) -> Vec<f32> {
        match self {
            PixelDistribution::Bernoulli => bernoulli_likelihood(pred, data, dims, eps),
        }
    }
}

/// Resolve `name` and build its prior in one step.
pub fn compute_prior(name: &str, pixel_prior: &PixelPrior) -> Result<Prior> {
    Ok(PixelDistribution::from_name(name)?.prior(pixel_prior))
}

fn bernoulli_likelihood(pred: &[f32], data: &[f32], dims: &ClusterDims, eps: f32) -> Vec<f32> {
    debug_assert_eq!(pred.len(), dims.pred_numel());
    debug_assert_eq!(data.len(), dims.pred_numel());
    let c = dims.channels;
    let mut scores = vec![0.0f32; dims.gamma_numel()];
    for (loc, score) in scores.iter_mut().enumerate() {
        let base = loc * c;
        let mut s = 0.0f32;
        for ch in 0..c {
            let mu = pred[base + ch];
            let x = data[base + ch];
            s += x * mu + (1.0 - x) * (1.0 - mu);
        }
        *score = s + eps;
    }
    scores
}

// ── Per-element primitives ───────────────────────────────────────────

/// Bernoulli negative log-likelihood of target `t` under `y`, with `y`
/// clamped into [EPSILON, 1 - EPSILON].
#[inline]
pub fn bernoulli_nll_f32(y: f32, t: f32) -> f32 {
    let yc = y.clamp(EPSILON, 1.0 - EPSILON);
    -(t * yc.ln() + (1.0 - t) * (1.0 - yc).ln())
}

/// d/dy of `bernoulli_nll_f32`. Zero where the clamp is active.
#[inline]
pub fn bernoulli_nll_grad_f32(y: f32, t: f32) -> f32 {
    if y < EPSILON || y > 1.0 - EPSILON {
        return 0.0;
    }
    -(t / y - (1.0 - t) / (1.0 - y))
}

#[inline]
fn clamp_ratio(x: f32) -> f32 {
    x.clamp(RATIO_MIN, RATIO_MAX)
}

#[inline]
fn in_ratio_range(x: f32) -> bool {
    (RATIO_MIN..=RATIO_MAX).contains(&x)
}

/// KL(p1 || p2) for Bernoulli parameters, with both denominators and both
/// ratios clamped into [RATIO_MIN, RATIO_MAX] before the log.
#[inline]
pub fn bernoulli_kl_f32(p1: f32, p2: f32) -> f32 {
    let on = clamp_ratio(p1 / clamp_ratio(p2));
    let off = clamp_ratio((1.0 - p1) / clamp_ratio(1.0 - p2));
    p1 * on.ln() + (1.0 - p1) * off.ln()
}

/// d/dp2 of `bernoulli_kl_f32`. Each clamp contributes zero slope when active.
#[inline]
pub fn bernoulli_kl_grad_f32(p1: f32, p2: f32) -> f32 {
    let mut g = 0.0f32;

    // p1 * ln(p1 / p2)
    if in_ratio_range(p2) {
        let r = p1 / p2;
        if in_ratio_range(r) {
            g += p1 * (-p1 / (p2 * p2)) / r;
        }
    }

    // (1 - p1) * ln((1 - p1) / (1 - p2))
    let u = 1.0 - p2;
    if in_ratio_range(u) {
        let s = (1.0 - p1) / u;
        if in_ratio_range(s) {
            g += (1.0 - p1) * ((1.0 - p1) / (u * u)) / s;
        }
    }

    g
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_distribution_is_fatal() {
        let err = PixelDistribution::from_name("gaussian").unwrap_err();
        assert!(matches!(err, NemError::UnsupportedDistribution(ref n) if n == "gaussian"));
        assert!(compute_prior("gaussian", &PixelPrior::default()).is_err());
    }

    #[test]
    fn test_prior_reads_p() {
        let prior = compute_prior("bernoulli", &PixelPrior { p: 0.25 }).unwrap();
        assert_eq!(prior.p, 0.25);
    }

    #[test]
    fn test_likelihood_sums_channels_plus_eps() {
        let dims = ClusterDims { batch: 1, k: 1, width: 1, height: 1, channels: 2 };
        let pred = vec![0.8, 0.3];
        let data = vec![1.0, 0.0];
        let s = PixelDistribution::Bernoulli.likelihood(&pred, &data, &dims, EPSILON);
        assert_eq!(s.len(), 1);
        assert!((s[0] - (0.8 + 0.7 + EPSILON)).abs() < 1e-6);
    }

    #[test]
    fn test_likelihood_strictly_positive_at_zero_match() {
        let dims = ClusterDims { batch: 1, k: 1, width: 1, height: 1, channels: 1 };
        let s = PixelDistribution::Bernoulli.likelihood(&[0.0], &[1.0], &dims, EPSILON);
        assert!(s[0] > 0.0);
    }

    #[test]
    fn test_nll_finite_at_saturation() {
        assert!(bernoulli_nll_f32(0.0, 1.0).is_finite());
        assert!(bernoulli_nll_f32(1.0, 0.0).is_finite());
        assert_eq!(bernoulli_nll_grad_f32(0.0, 1.0), 0.0);
    }

    #[test]
    fn test_kl_finite_at_saturation() {
        for &(p1, p2) in &[(0.0, 0.0), (0.0, 1.0), (1.0, 0.0), (1.0, 1.0), (0.5, 0.0)] {
            let kl = bernoulli_kl_f32(p1, p2);
            assert!(kl.is_finite(), "KL({p1}, {p2}) = {kl}");
            assert!(bernoulli_kl_grad_f32(p1, p2).is_finite());
        }
    }

    #[test]
    fn test_kl_zero_when_equal() {
        assert!(bernoulli_kl_f32(0.3, 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_kl_grad_matches_finite_difference() {
        let (p1, p2, h) = (0.2f32, 0.6f32, 1e-3f32);
        let fd = (bernoulli_kl_f32(p1, p2 + h) - bernoulli_kl_f32(p1, p2 - h)) / (2.0 * h);
        let an = bernoulli_kl_grad_f32(p1, p2);
        assert!((fd - an).abs() < 1e-2, "fd={fd} analytic={an}");
    }

    #[test]
    fn test_nll_grad_matches_finite_difference() {
        let (y, t, h) = (0.35f32, 1.0f32, 1e-3f32);
        let fd = (bernoulli_nll_f32(y + h, t) - bernoulli_nll_f32(y - h, t)) / (2.0 * h);
        let an = bernoulli_nll_grad_f32(y, t);
        assert!((fd - an).abs() < 1e-2, "fd={fd} analytic={an}");
    }
}
