/// Outer loss: gamma-weighted reconstruction plus prior divergence.
///
/// Per step, with per-pixel terms intra = BCE(pred, target) and
/// inter = KL(prior || pred):
///
///   intra_loss = Σ intra · sg(γ)       / B
///   inter_loss = Σ inter · (1 - sg(γ)) / B
///   total      = intra_loss + w_inter · inter_loss
///
/// Relative variants multiply by the collision mask before summing. The
/// upper-bound variant replaces pred with max_K(pred) and drops the gamma
/// weighting entirely.

use serde::{Deserialize, Serialize};

use crate::config::NemConfig;
use crate::distribution::{PixelDistribution, Prior};
use crate::error::{shape_mismatch, Result};
use crate::tape::{BufId, Tape};
use crate::tensor;
use crate::traced::{
    traced_add, traced_bernoulli_kl, traced_bernoulli_nll, traced_broadcast, traced_max_over_k,
    traced_mul, traced_scale, traced_sum,
};

/// (total, intra, inter) for one loss variant at one step.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LossRecord {
    pub total: f32,
    pub intra: f32,
    pub inter: f32,
}

/// Tape ids of a (total, intra, inter) triple.
#[derive(Clone, Copy, Debug)]
pub struct LossIds {
    pub total: BufId,
    pub intra: BufId,
    pub inter: BufId,
}

impl LossIds {
    pub fn record(&self, tape: &Tape) -> LossRecord {
        LossRecord {
            total: tape.scalar(self.total),
            intra: tape.scalar(self.intra),
            inter: tape.scalar(self.inter),
        }
    }
}

/// Absolute and collision-relative losses for one step.
#[derive(Clone, Copy, Debug)]
pub struct OuterLoss {
    pub loss: LossIds,
    pub rel: LossIds,
}

/// Observation family, prior and inter weight, fixed for one run.
#[derive(Clone, Copy, Debug)]
pub struct LossModel {
    pub distribution: PixelDistribution,
    pub prior: Prior,
    pub inter_weight: f32,
}

/// Numpy broadcast of equal-rank shapes, or None when incompatible.
fn broadcast_shape(a: &[usize], b: &[usize]) -> Option<Vec<usize>> {
    if a.len() != b.len() {
        return None;
    }
    a.iter().zip(b.iter())
        .map(|(&x, &y)| match (x, y) {
            _ if x == y => Some(x),
            (1, y) => Some(y),
            (x, 1) => Some(x),
            _ => None,
        })
        .collect()
}

impl LossModel {
    pub fn from_config(config: &NemConfig) -> Result<Self> {
        let distribution = PixelDistribution::from_name(&config.pixel_distribution)?;
        Ok(LossModel {
            distribution,
            prior: distribution.prior(&config.pixel_prior),
            inter_weight: config.loss_inter_weight,
        })
    }

    fn expand(&self, tape: &mut Tape, what: &'static str, id: BufId, shape: &[usize]) -> Result<BufId> {
        let src = tape.buf_shape(id).to_vec();
        if !tensor::broadcast_compatible(&src, shape) {
            return Err(shape_mismatch(what, shape, &src));
        }
        Ok(traced_broadcast(tape, id, shape))
    }

    /// Per-pixel (intra, inter) terms for `pred` against `target`, same shape.
    fn pixel_terms(&self, tape: &mut Tape, pred: BufId, target: BufId) -> (BufId, BufId) {
        match self.distribution {
            PixelDistribution::Bernoulli => (
                traced_bernoulli_nll(tape, pred, target),
                traced_bernoulli_kl(tape, self.prior.p, pred),
            ),
        }
    }

    /// Σ(intra_w) / B, Σ(inter_w) / B and their weighted total.
    fn reduce(&self, tape: &mut Tape, intra_w: BufId, inter_w: BufId, batch: usize) -> LossIds {
        let inv_b = 1.0 / batch as f32;
        let intra = traced_sum(tape, intra_w);
        let intra = traced_scale(tape, intra, inv_b);
        let inter = traced_sum(tape, inter_w);
        let inter = traced_scale(tape, inter, inv_b);
        let weighted = traced_scale(tape, inter, self.inter_weight);
        let total = traced_add(tape, intra, weighted);
        LossIds { total, intra, inter }
    }

    /// Gamma-weighted step loss. `pred` is (B,K,W,H,C), `gamma` (B,K,W,H,1);
    /// `target` and `collision` must broadcast to pred's shape.
    pub fn step_loss(
        &self,
        tape: &mut Tape,
        pred: BufId,
        gamma: BufId,
        target: BufId,
        collision: BufId,
    ) -> Result<OuterLoss> {
        let shape = tape.buf_shape(pred).to_vec();
        let batch = shape[0];
        let target = self.expand(tape, "loss target", target, &shape)?;
        let collision = self.expand(tape, "collision mask", collision, &shape)?;

        let (intra, inter) = self.pixel_terms(tape, pred, target);

        // Gamma enters the outer loss only as a constant weight.
        let g = tape.detach(gamma);
        let not_g: Vec<f32> = tape.buf_data(g).iter().map(|&x| 1.0 - x).collect();
        let g_shape = tape.buf_shape(g).to_vec();
        let not_g = tape.alloc(not_g, g_shape);
        let g = self.expand(tape, "gamma", g, &shape)?;
        let not_g = traced_broadcast(tape, not_g, &shape);

        let intra_w = traced_mul(tape, intra, g);
        let inter_w = traced_mul(tape, inter, not_g);
        let loss = self.reduce(tape, intra_w, inter_w, batch);

        let r_intra_w = traced_mul(tape, intra_w, collision);
        let r_inter_w = traced_mul(tape, inter_w, collision);
        let rel = self.reduce(tape, r_intra_w, r_inter_w, batch);

        Ok(OuterLoss { loss, rel })
    }

    /// Upper-bound step loss on max_K(pred) with uniform weighting.
    pub fn step_ub_loss(
        &self,
        tape: &mut Tape,
        pred: BufId,
        target: BufId,
        collision: BufId,
    ) -> Result<OuterLoss> {
        let max_pred = traced_max_over_k(tape, pred);
        let max_shape = tape.buf_shape(max_pred).to_vec();
        let target_shape = tape.buf_shape(target).to_vec();
        let collision_shape = tape.buf_shape(collision).to_vec();
        let shape = broadcast_shape(&max_shape, &target_shape)
            .and_then(|s| broadcast_shape(&s, &collision_shape))
            .ok_or_else(|| shape_mismatch("upper-bound loss target", &max_shape, &target_shape))?;
        let batch = shape[0];

        let max_pred = traced_broadcast(tape, max_pred, &shape);
        let target = traced_broadcast(tape, target, &shape);
        let collision = traced_broadcast(tape, collision, &shape);

        let (intra, inter) = self.pixel_terms(tape, max_pred, target);
        let loss = self.reduce(tape, intra, inter, batch);

        let r_intra = traced_mul(tape, intra, collision);
        let r_inter = traced_mul(tape, inter, collision);
        let rel = self.reduce(tape, r_intra, r_inter, batch);

        Ok(OuterLoss { loss, rel })
    }
}
