/// Optimizers for the outer parameter update.
///
/// Parameters arrive as an ordered list of flat buffers (the predictor's
/// `parameters_mut()` order) with gradients in the same order. AdamW keeps
/// one moment buffer pair per parameter buffer, allocated on first use, and
/// bias-corrects by its own step count.
///
/// Source: Loshchilov & Hutter 2019 (decoupled weight decay).

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{shape_mismatch, NemError, Result};

/// One update of `params` from `grads`, matched by position.
pub trait Optimizer {
    fn step(&mut self, params: Vec<&mut [f32]>, grads: &[Vec<f32>]) -> Result<()>;
}

fn check_lengths(params: &[&mut [f32]], grads: &[Vec<f32>]) -> Result<()> {
    if params.len() != grads.len() {
        return Err(shape_mismatch("parameter/gradient count", &[params.len()], &[grads.len()]));
    }
    for (p, g) in params.iter().zip(grads.iter()) {
        if p.len() != g.len() {
            return Err(shape_mismatch("gradient length", &[p.len()], &[g.len()]));
        }
    }
    Ok(())
}

/// AdamW hyperparameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdamWConfig {
    pub lr: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
    pub weight_decay: f32,
}

impl Default for AdamWConfig {
    fn default() -> Self {
        AdamWConfig {
            lr: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
        }
    }
}

/// Moment buffers for a single parameter group (one flat array of weights).
#[derive(Clone)]
struct MomentBuf {
    m: Vec<f32>,
    v: Vec<f32>,
}

impl MomentBuf {
    fn zeros(n: usize) -> Self {
        MomentBuf { m: vec![0.0; n], v: vec![0.0; n] }
    }
}

pub struct AdamW {
    pub config: AdamWConfig,
    bufs: Vec<MomentBuf>,
    step: u32,
}

impl AdamW {
    pub fn new(config: AdamWConfig) -> Self {
        AdamW { config, bufs: Vec::new(), step: 0 }
    }

    /// Number of updates applied so far.
    pub fn step_count(&self) -> u32 {
        self.step
    }
}

impl Default for AdamW {
    fn default() -> Self {
        AdamW::new(AdamWConfig::default())
    }
}

impl Optimizer for AdamW {
    fn step(&mut self, mut params: Vec<&mut [f32]>, grads: &[Vec<f32>]) -> Result<()> {
        check_lengths(&params, grads)?;
        if self.bufs.is_empty() {
            self.bufs = params.iter().map(|p| MomentBuf::zeros(p.len())).collect();
        } else if self.bufs.len() != params.len()
            || self.bufs.iter().zip(params.iter()).any(|(b, p)| b.m.len() != p.len())
        {
            return Err(NemError::InvalidConfig(
                "optimizer state does not match parameter layout".to_string(),
            ));
        }

        self.step += 1;
        let c = &self.config;
        let bc1_inv = 1.0 / (1.0 - c.beta1.powi(self.step as i32));
        let bc2_inv = 1.0 / (1.0 - c.beta2.powi(self.step as i32));

        for ((param, grad), buf) in params.iter_mut().zip(grads.iter()).zip(self.bufs.iter_mut()) {
            for i in 0..param.len() {
                let g = grad[i];
                buf.m[i] = c.beta1 * buf.m[i] + (1.0 - c.beta1) * g;
                buf.v[i] = c.beta2 * buf.v[i] + (1.0 - c.beta2) * g * g;
                let m_hat = buf.m[i] * bc1_inv;
                let v_hat = buf.v[i] * bc2_inv;
                param[i] -= c.lr * (m_hat / (v_hat.sqrt() + c.eps) + c.weight_decay * param[i]);
            }
        }

        debug!(step = self.step, lr = c.lr, groups = params.len(), "adamw update");
        Ok(())
    }
}

/// Plain gradient descent: param -= lr * grad.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Sgd {
    pub lr: f32,
}

impl Optimizer for Sgd {
    fn step(&mut self, mut params: Vec<&mut [f32]>, grads: &[Vec<f32>]) -> Result<()> {
        check_lengths(&params, grads)?;
        for (param, grad) in params.iter_mut().zip(grads.iter()) {
            for (p, g) in param.iter_mut().zip(grad.iter()) {
                *p -= self.lr * g;
            }
        }
        debug!(lr = self.lr, groups = params.len(), "sgd update");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sgd_step() {
        let mut p = vec![1.0, 2.0];
        let mut sgd = Sgd { lr: 0.5 };
        sgd.step(vec![p.as_mut_slice()], &[vec![2.0, -2.0]]).unwrap();
        assert_eq!(p, vec![0.0, 3.0]);
    }

    #[test]
    fn test_adamw_first_step_is_lr_sized() {
        // With bias correction, the first update is lr * g / (|g| + eps).
        let mut p = vec![0.0, 0.0];
        let mut opt = AdamW::default();
        opt.step(vec![p.as_mut_slice()], &[vec![3.0, -0.5]]).unwrap();
        assert!((p[0] + 1e-3).abs() < 1e-7);
        assert!((p[1] - 1e-3).abs() < 1e-7);
        assert_eq!(opt.step_count(), 1);
    }

    #[test]
    fn test_zero_grad_no_decay_is_noop() {
        let mut p = vec![0.7];
        let mut opt = AdamW::default();
        opt.step(vec![p.as_mut_slice()], &[vec![0.0]]).unwrap();
        assert_eq!(p, vec![0.7]);
    }

    #[test]
    fn test_weight_decay_shrinks() {
        let mut p = vec![1.0];
        let mut opt = AdamW::new(AdamWConfig { weight_decay: 0.1, ..AdamWConfig::default() });
        opt.step(vec![p.as_mut_slice()], &[vec![0.0]]).unwrap();
        assert!(p[0] < 1.0);
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let mut p = vec![1.0, 2.0];
        let mut opt = AdamW::default();
        assert!(opt.step(vec![p.as_mut_slice()], &[vec![1.0]]).is_err());
        assert!(opt.step(vec![p.as_mut_slice()], &[]).is_err());
        assert_eq!(opt.step_count(), 0);
    }

    #[test]
    fn test_layout_change_rejected() {
        let mut a = vec![1.0, 2.0];
        let mut b = vec![1.0];
        let mut opt = AdamW::default();
        opt.step(vec![a.as_mut_slice()], &[vec![0.1, 0.1]]).unwrap();
        assert!(opt.step(vec![b.as_mut_slice()], &[vec![0.1]]).is_err());
    }
}
