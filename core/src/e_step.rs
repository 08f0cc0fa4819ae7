/// E-step: soft cluster responsibilities from per-pixel likelihoods.
///
///   gamma[b,k,p] = score[b,k,p] / Σ_j score[b,j,p]
///
/// Scores must be strictly positive; the observation model adds EPSILON to
/// guarantee it. The output is a partition of unity over K at every
/// (batch, pixel) location.

use crate::distribution::PixelDistribution;
use crate::tensor::ClusterDims;

/// Normalize (B, K, W, H, 1) scores over K.
pub fn estimate(scores: &[f32], dims: &ClusterDims) -> Vec<f32> {
    debug_assert_eq!(scores.len(), dims.gamma_numel());
    let (k, p) = (dims.k, dims.pixels());
    let mut gamma = vec![0.0f32; scores.len()];
    for b in 0..dims.batch {
        for pix in 0..p {
            let mut total = 0.0f32;
            for j in 0..k {
                total += scores[(b * k + j) * p + pix];
            }
            for j in 0..k {
                let idx = (b * k + j) * p + pix;
                gamma[idx] = scores[idx] / total;
            }
        }
    }
    gamma
}

/// Likelihood followed by normalization, for the Bernoulli family.
pub fn e_step_forward(pred: &[f32], data: &[f32], dims: &ClusterDims, eps: f32) -> Vec<f32> {
    let scores = PixelDistribution::Bernoulli.likelihood(pred, data, dims, eps);
    estimate(&scores, dims)
}

/// VJP of `e_step_forward` with respect to `pred` and `data`.
///
/// With s_k = Σ_c (x_c μ_kc + (1-x_c)(1-μ_kc)) + eps and S = Σ_k s_k:
///   d_s_k   = (d_γ_k − Σ_j d_γ_j γ_j) / S
///   d_μ_kc  = d_s_k (2 x_c − 1)
///   d_x_kc  = d_s_k (2 μ_kc − 1)
pub fn e_step_vjp(
    d_gamma: &[f32],
    pred: &[f32],
    data: &[f32],
    dims: &ClusterDims,
    eps: f32,
) -> (Vec<f32>, Vec<f32>) {
    let scores = PixelDistribution::Bernoulli.likelihood(pred, data, dims, eps);
    let (k, p, c) = (dims.k, dims.pixels(), dims.channels);
    let mut d_pred = vec![0.0f32; pred.len()];
    let mut d_data = vec![0.0f32; data.len()];
    for b in 0..dims.batch {
        for pix in 0..p {
            let mut total = 0.0f32;
            for j in 0..k {
                total += scores[(b * k + j) * p + pix];
            }
            let mut dot = 0.0f32;
            for j in 0..k {
                let idx = (b * k + j) * p + pix;
                dot += d_gamma[idx] * scores[idx] / total;
            }
            for j in 0..k {
                let loc = (b * k + j) * p + pix;
                let d_s = (d_gamma[loc] - dot) / total;
                for ch in 0..c {
                    let e = loc * c + ch;
                    d_pred[e] = d_s * (2.0 * data[e] - 1.0);
                    d_data[e] = d_s * (2.0 * pred[e] - 1.0);
                }
            }
        }
    }
    (d_pred, d_data)
}
