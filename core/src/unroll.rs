/// Unroll driver: run the NEM cell for `nr_steps` steps, score each step
/// against the next target frame, and optionally take one optimizer step.
///
/// Step t consumes inputs[t] and is scored against targets[t + 1]. The four
/// aggregates (total, ub, relative, relative ub) are weighted means over
/// steps:
///
///   total = Σ_t w_t · loss_t / Σ_t w_t
///
/// The whole unroll is recorded on one fresh tape, so backward runs through
/// every step and a new tape per call is the zero-grad.

use rand::Rng;
use tracing::{debug, info};

use crate::cell::{unroll, CellState, NemCell, StepInput};
use crate::error::{shape_mismatch, NemError, Result};
use crate::loss::{LossIds, LossModel, LossRecord};
use crate::optim::Optimizer;
use crate::predictor::InnerPredictor;
use crate::tape::{BufId, Tape};
use crate::tensor::Tensor;
use crate::traced::{traced_add, traced_scale};

/// One unroll's data.
///
///   inputs:     (T, B, 1 or K, W, H, C), T >= nr_steps
///   targets:    (T, B, 1 or K, W, H, C), T >= nr_steps + 1
///   collisions: rank 6, each step broadcastable to (B, K, W, H, C)
///   actions:    (T, B, A)
#[derive(Clone, Debug)]
pub struct NemBatch {
    pub inputs: Tensor,
    pub targets: Tensor,
    pub collisions: Option<Tensor>,
    pub actions: Option<Tensor>,
}

impl NemBatch {
    pub fn new(inputs: Tensor, targets: Tensor) -> Self {
        NemBatch { inputs, targets, collisions: None, actions: None }
    }

    pub fn with_collisions(mut self, collisions: Tensor) -> Self {
        self.collisions = Some(collisions);
        self
    }

    pub fn with_actions(mut self, actions: Tensor) -> Self {
        self.actions = Some(actions);
        self
    }

    /// Check ranks and lengths; returns the batch size.
    fn validate(&self, frame: [usize; 3], nr_steps: usize) -> Result<usize> {
        let check_seq = |what: &'static str, t: &Tensor, min_len: usize| -> Result<()> {
            if t.rank() != 6 {
                return Err(NemError::RankMismatch { expected: 6, got: t.rank() });
            }
            if t.shape[3..] != frame {
                return Err(shape_mismatch(what, &frame, &t.shape[3..]));
            }
            if t.shape[0] < min_len {
                return Err(shape_mismatch(what, &[min_len], &t.shape[..1]));
            }
            Ok(())
        };
        check_seq("input frames", &self.inputs, nr_steps)?;
        check_seq("target frames", &self.targets, nr_steps + 1)?;
        let batch = self.inputs.shape[1];
        if self.targets.shape[1] != batch {
            return Err(shape_mismatch("target batch", &[batch], &self.targets.shape[1..2]));
        }

        if let Some(c) = &self.collisions {
            if c.rank() != 6 {
                return Err(NemError::RankMismatch { expected: 6, got: c.rank() });
            }
            if c.shape[0] < nr_steps {
                return Err(shape_mismatch("collision steps", &[nr_steps], &c.shape[..1]));
            }
        }
        if let Some(a) = &self.actions {
            if a.rank() != 3 || a.shape[0] < nr_steps || a.shape[1] != batch {
                return Err(shape_mismatch("actions (T, B, A)", &[nr_steps, batch, 0], &a.shape));
            }
        }
        Ok(batch)
    }
}

/// The four loss variants of one step.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StepLosses {
    pub loss: LossRecord,
    pub ub_loss: LossRecord,
    pub rel_loss: LossRecord,
    pub rel_ub_loss: LossRecord,
}

/// Scalar results of one unroll.
#[derive(Clone, Debug)]
pub struct UnrollReport {
    pub total_loss: f32,
    pub total_ub_loss: f32,
    pub r_total_loss: f32,
    pub r_total_ub_loss: f32,
    pub steps: Vec<StepLosses>,
    pub step_weights: Vec<f32>,
    /// Initial state followed by every step: nr_steps + 1 entries.
    pub gammas: Vec<Tensor>,
    pub predictions: Vec<Tensor>,
}

/// Tape ids of the four aggregates plus the evaluated report.
#[derive(Clone, Debug)]
pub struct UnrollTrace {
    pub total: BufId,
    pub total_ub: BufId,
    pub r_total: BufId,
    pub r_total_ub: BufId,
    pub report: UnrollReport,
}

fn snapshot(tape: &Tape, id: BufId) -> Tensor {
    Tensor { data: tape.buf_data(id).to_vec(), shape: tape.buf_shape(id).to_vec() }
}

/// Running Σ w·x on the tape.
fn accumulate(tape: &mut Tape, acc: Option<BufId>, x: BufId, weight: f32) -> BufId {
    let wx = traced_scale(tape, x, weight);
    match acc {
        Some(a) => traced_add(tape, a, wx),
        None => wx,
    }
}

#[derive(Default)]
struct Sums {
    total: Option<BufId>,
    total_ub: Option<BufId>,
    r_total: Option<BufId>,
    r_total_ub: Option<BufId>,
}

/// Record a full unroll on `tape` using parameters already registered as
/// `params`. Nothing is mutated outside the tape.
pub fn forward_unroll<P: InnerPredictor, R: Rng + ?Sized>(
    cell: &NemCell<P>,
    tape: &mut Tape,
    params: &P::ParamIds,
    batch: &NemBatch,
    rng: &mut R,
) -> Result<UnrollTrace> {
    let config = cell.config();
    let (k, nr_steps) = (config.k, config.nr_steps);
    let batch_size = batch.validate(cell.frame(), nr_steps)?;
    let step_weights = config.step_weights()?;
    let model = LossModel::from_config(config)?;

    let state = cell.init_state(tape, batch_size, k, rng);
    let mut gammas = vec![snapshot(tape, state.gamma)];
    let mut predictions = vec![snapshot(tape, state.prediction)];

    let mut inputs = Vec::with_capacity(nr_steps);
    for t in 0..nr_steps {
        let input = batch.inputs.index_axis0(t)?;
        let target = batch.targets.index_axis0(t + 1)?;
        let action = match &batch.actions {
            Some(a) => Some(a.index_axis0(t)?),
            None => None,
        };
        inputs.push(StepInput {
            input: tape.register_input(&input.data, input.shape),
            target: tape.register_input(&target.data, target.shape),
            action,
        });
    }

    let (outputs, _) = unroll(cell, tape, params, &inputs, state)?;

    let no_collision = tape.alloc(vec![0.0], vec![1; 5]);
    let mut sums = Sums::default();
    let mut steps = Vec::with_capacity(nr_steps);

    for (t, (out, step_in)) in outputs.iter().zip(inputs.iter()).enumerate() {
        let CellState { prediction, gamma, .. } = *out;
        let collision = match &batch.collisions {
            Some(c) => {
                let c = c.index_axis0(t)?;
                tape.register_input(&c.data, c.shape)
            }
            None => no_collision,
        };

        let nem = model.step_loss(tape, prediction, gamma, step_in.target, collision)?;
        let ub = model.step_ub_loss(tape, prediction, step_in.target, collision)?;

        let w = step_weights[t];
        sums.total = Some(accumulate(tape, sums.total, nem.loss.total, w));
        sums.total_ub = Some(accumulate(tape, sums.total_ub, ub.loss.total, w));
        sums.r_total = Some(accumulate(tape, sums.r_total, nem.rel.total, w));
        sums.r_total_ub = Some(accumulate(tape, sums.r_total_ub, ub.rel.total, w));

        let record = |ids: &LossIds| ids.record(tape);
        let losses = StepLosses {
            loss: record(&nem.loss),
            ub_loss: record(&ub.loss),
            rel_loss: record(&nem.rel),
            rel_ub_loss: record(&ub.rel),
        };
        debug!(
            step = t,
            weight = w,
            total = losses.loss.total,
            intra = losses.loss.intra,
            inter = losses.loss.inter,
            ub_total = losses.ub_loss.total,
            "nem step"
        );
        steps.push(losses);
        gammas.push(snapshot(tape, gamma));
        predictions.push(snapshot(tape, prediction));
    }

    // nr_steps >= 1 and the weights were validated non-zero.
    let inv_w = 1.0 / step_weights.iter().sum::<f32>();
    let mut mean = |acc: Option<BufId>| -> Result<BufId> {
        let acc = acc.ok_or_else(|| NemError::InvalidConfig("nr_steps must be >= 1".into()))?;
        Ok(traced_scale(tape, acc, inv_w))
    };
    let total = mean(sums.total)?;
    let total_ub = mean(sums.total_ub)?;
    let r_total = mean(sums.r_total)?;
    let r_total_ub = mean(sums.r_total_ub)?;

    let report = UnrollReport {
        total_loss: tape.scalar(total),
        total_ub_loss: tape.scalar(total_ub),
        r_total_loss: tape.scalar(r_total),
        r_total_ub_loss: tape.scalar(r_total_ub),
        steps,
        step_weights,
        gammas,
        predictions,
    };
    Ok(UnrollTrace { total, total_ub, r_total, r_total_ub, report })
}

/// Forward + backward on a fresh tape. Returns the report and the gradient
/// of `total_loss` for every predictor parameter, in `parameters()` order.
pub fn compute_gradients<P: InnerPredictor, R: Rng + ?Sized>(
    cell: &NemCell<P>,
    batch: &NemBatch,
    rng: &mut R,
) -> Result<(UnrollReport, Vec<Vec<f32>>)> {
    let mut tape = Tape::new();
    let params = cell.predictor.register_params(&mut tape);
    let trace = forward_unroll(cell, &mut tape, &params, batch, rng)?;
    tape.backward(trace.total);
    let grads = cell.predictor.param_grads(&tape, &params);
    Ok((trace.report, grads))
}

/// Run one unroll. With `train` set, backpropagate `total_loss` through the
/// whole unroll and apply one optimizer step; otherwise parameters are left
/// untouched.
pub fn static_nem_iterations<P, O, R>(
    cell: &mut NemCell<P>,
    optimizer: &mut O,
    batch: &NemBatch,
    train: bool,
    rng: &mut R,
) -> Result<UnrollReport>
where
    P: InnerPredictor,
    O: Optimizer + ?Sized,
    R: Rng + ?Sized,
{
    let report = if train {
        let (report, grads) = compute_gradients(cell, batch, rng)?;
        optimizer.step(cell.predictor.parameters_mut(), &grads)?;
        report
    } else {
        let mut tape = Tape::new();
        let params = cell.predictor.register_params(&mut tape);
        forward_unroll(cell, &mut tape, &params, batch, rng)?.report
    };

    info!(
        train,
        total_loss = report.total_loss,
        total_ub_loss = report.total_ub_loss,
        r_total_loss = report.r_total_loss,
        r_total_ub_loss = report.r_total_ub_loss,
        "nem unroll"
    );
    Ok(report)
}
