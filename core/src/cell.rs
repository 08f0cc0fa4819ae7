/// NEM cell: one EM iteration as a recurrent-cell transition.
///
/// State and output are the same triple (hidden, prediction, gamma):
///
///   delta  = input - prediction_old          (broadcast over K)
///   masked = delta * stop_grad(gamma_old)    (broadcast over C)
///   pred   = inner((B·K, M) masked, hidden)  (reshaped back to B,K,W,H,C)
///   gamma  = E-step(pred, target)
///
/// The stop-gradient on gamma_old is one of exactly two detach points in the
/// model; the other is the gamma weighting of the outer loss.

use rand::Rng;
use rand_distr::StandardNormal;

use crate::config::NemConfig;
use crate::distribution::{PixelDistribution, EPSILON};
use crate::e_step;
use crate::error::{shape_mismatch, Result};
use crate::predictor::InnerPredictor;
use crate::tape::{BufId, Tape};
use crate::tensor::{self, ClusterDims, Tensor};
use crate::traced::{traced_broadcast, traced_e_step, traced_mul, traced_reshape, traced_sub};

// ── Generic recurrent-cell convention ────────────────────────────────

/// Anything that maps `(input, state) -> (state', output)` on a tape.
pub trait RecurrentCell {
    type Params;
    type Input;
    type State: Clone;
    type Output;
    type Size;

    fn state_size(&self) -> Self::Size;
    fn output_size(&self) -> Self::Size;

    fn step(
        &self,
        tape: &mut Tape,
        params: &Self::Params,
        input: &Self::Input,
        state: &Self::State,
    ) -> Result<(Self::State, Self::Output)>;
}

/// Fold `cell` over `inputs`, returning every output and the final state.
pub fn unroll<C: RecurrentCell>(
    cell: &C,
    tape: &mut Tape,
    params: &C::Params,
    inputs: &[C::Input],
    initial_state: C::State,
) -> Result<(Vec<C::Output>, C::State)> {
    let mut state = initial_state;
    let mut outputs = Vec::with_capacity(inputs.len());
    for input in inputs {
        let (next, out) = cell.step(tape, params, input, &state)?;
        outputs.push(out);
        state = next;
    }
    Ok((outputs, state))
}

// ── NEM cell types ───────────────────────────────────────────────────

/// (hidden, prediction, gamma). Prediction is (B,K,W,H,C); gamma is
/// (B,K,W,H,1) and sums to 1 over K at every location.
#[derive(Clone, Debug)]
pub struct CellState<H> {
    pub hidden: H,
    pub prediction: BufId,
    pub gamma: BufId,
}

/// One step's external inputs. `input` drives the delta, `target` drives
/// the E-step. Both are (B, 1 or K, W, H, C). `action` is (B, A).
#[derive(Clone, Debug)]
pub struct StepInput {
    pub input: BufId,
    pub target: BufId,
    pub action: Option<Tensor>,
}

/// Size descriptor: (predictor state width, (W,H,C), (W,H,1)).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CellSize {
    pub hidden: usize,
    pub prediction: [usize; 3],
    pub gamma: [usize; 3],
}

pub struct NemCell<P: InnerPredictor> {
    pub predictor: P,
    frame: [usize; 3],
    config: NemConfig,
    distribution: PixelDistribution,
}

impl<P: InnerPredictor> NemCell<P> {
    /// Wrap `predictor` for frames of shape (W, H, C). The predictor must
    /// consume and produce M = W·H·C values per cluster.
    pub fn new(predictor: P, frame: [usize; 3], config: &NemConfig) -> Result<Self> {
        config.validate()?;
        let distribution = PixelDistribution::from_name(&config.pixel_distribution)?;
        let m: usize = frame.iter().product();
        let sizes = [predictor.input_size(), predictor.output_size()];
        if sizes != [m, m] {
            return Err(shape_mismatch("inner predictor input/output size", &[m, m], &sizes));
        }
        Ok(NemCell { predictor, frame, config: config.clone(), distribution })
    }

    pub fn frame(&self) -> [usize; 3] {
        self.frame
    }

    pub fn config(&self) -> &NemConfig {
        &self.config
    }

    pub fn dims(&self, batch: usize, k: usize) -> ClusterDims {
        let [width, height, channels] = self.frame;
        ClusterDims { batch, k, width, height, channels }
    }

    fn dims_of(&self, tape: &Tape, prediction: BufId) -> ClusterDims {
        let shape = tape.buf_shape(prediction);
        self.dims(shape[0], shape[1])
    }

    fn broadcast_frame(&self, tape: &mut Tape, what: &'static str, data: BufId, dims: &ClusterDims) -> Result<BufId> {
        let shape = tape.buf_shape(data).to_vec();
        let pred_shape = dims.pred_shape();
        if !tensor::broadcast_compatible(&shape, &pred_shape) {
            return Err(shape_mismatch(what, &dims.frame_shape(), &shape));
        }
        Ok(traced_broadcast(tape, data, &pred_shape))
    }

    /// Initial (hidden, prediction, gamma) for `batch` × `k` clusters.
    ///
    /// Gamma is |N(0,1)| renormalised over K, or exactly 1 when `k == 1`.
    pub fn init_state<R: Rng + ?Sized>(
        &self,
        tape: &mut Tape,
        batch: usize,
        k: usize,
        rng: &mut R,
    ) -> CellState<P::Hidden> {
        let dims = self.dims(batch, k);
        let hidden = self.predictor.init_hidden(tape, batch * k);
        let prediction = tape.alloc(vec![self.config.pred_init; dims.pred_numel()], dims.pred_shape());

        let gamma_data = if k == 1 {
            vec![1.0; dims.gamma_numel()]
        } else {
            let scores: Vec<f32> = (0..dims.gamma_numel())
                .map(|_| rng.sample::<f32, _>(StandardNormal).abs())
                .collect();
            e_step::estimate(&scores, &dims)
        };
        let gamma = tape.alloc(gamma_data, dims.gamma_shape());

        CellState { hidden, prediction, gamma }
    }

    /// `data - prediction`, with `data` broadcast over K.
    pub fn delta_predictions(&self, tape: &mut Tape, prediction: BufId, data: BufId) -> Result<BufId> {
        let dims = self.dims_of(tape, prediction);
        let data = self.broadcast_frame(tape, "delta input", data, &dims)?;
        Ok(traced_sub(tape, data, prediction))
    }

    /// `deltas * gamma` with gamma detached and broadcast over C.
    pub fn mask_rnn_inputs(&self, tape: &mut Tape, deltas: BufId, gamma: BufId) -> BufId {
        let gamma = tape.detach(gamma);
        let shape = tape.buf_shape(deltas).to_vec();
        let gamma = traced_broadcast(tape, gamma, &shape);
        traced_mul(tape, deltas, gamma)
    }

    /// Flatten to (B·K, M), run the inner predictor, reshape back.
    pub fn run_inner_rnn(
        &self,
        tape: &mut Tape,
        params: &P::ParamIds,
        masked_deltas: BufId,
        hidden: &P::Hidden,
    ) -> (BufId, P::Hidden) {
        let dims = self.dims_of(tape, masked_deltas);
        let flat = traced_reshape(tape, masked_deltas, dims.flat_shape());
        let (pred, h_new) = self.predictor.transition(tape, params, flat, hidden);
        (traced_reshape(tape, pred, dims.pred_shape()), h_new)
    }

    /// Per-pixel likelihood scores (B,K,W,H,1), strictly positive.
    pub fn compute_em_probabilities(&self, tape: &Tape, prediction: BufId, data: BufId) -> Result<Tensor> {
        let dims = self.dims_of(tape, prediction);
        let data_shape = tape.buf_shape(data);
        if !tensor::broadcast_compatible(data_shape, &dims.pred_shape()) {
            return Err(shape_mismatch("likelihood data", &dims.frame_shape(), data_shape));
        }
        let data = tensor::broadcast_to(tape.buf_data(data), data_shape, &dims.pred_shape());
        let scores = self.distribution.likelihood(tape.buf_data(prediction), &data, &dims, EPSILON);
        Tensor::from_vec(scores, &dims.gamma_shape())
    }

    /// New gamma from `prediction` and `target`, recorded on the tape.
    pub fn e_step(&self, tape: &mut Tape, prediction: BufId, target: BufId) -> Result<BufId> {
        let dims = self.dims_of(tape, prediction);
        let target = self.broadcast_frame(tape, "e-step target", target, &dims)?;
        Ok(match self.distribution {
            PixelDistribution::Bernoulli => traced_e_step(tape, prediction, target, dims),
        })
    }
}

impl<P: InnerPredictor> RecurrentCell for NemCell<P> {
    type Params = P::ParamIds;
    type Input = StepInput;
    type State = CellState<P::Hidden>;
    type Output = CellState<P::Hidden>;
    type Size = CellSize;

    fn state_size(&self) -> CellSize {
        let [w, h, _] = self.frame;
        CellSize { hidden: self.predictor.state_size(), prediction: self.frame, gamma: [w, h, 1] }
    }

    fn output_size(&self) -> CellSize {
        let [w, h, _] = self.frame;
        CellSize { hidden: self.predictor.output_size(), prediction: self.frame, gamma: [w, h, 1] }
    }

    fn step(
        &self,
        tape: &mut Tape,
        params: &P::ParamIds,
        input: &StepInput,
        state: &Self::State,
    ) -> Result<(Self::State, Self::Output)> {
        let mut hidden = state.hidden.clone();
        if let Some(action) = &input.action {
            let k = tape.buf_shape(state.prediction)[1];
            hidden = self.predictor.merge_action(tape, params, &hidden, action, k)?;
        }

        let deltas = self.delta_predictions(tape, state.prediction, input.input)?;
        let masked = self.mask_rnn_inputs(tape, deltas, state.gamma);
        let (prediction, hidden) = self.run_inner_rnn(tape, params, masked, &hidden);
        let gamma = self.e_step(tape, prediction, input.target)?;

        let out = CellState { hidden, prediction, gamma };
        Ok((out.clone(), out))
    }
}
