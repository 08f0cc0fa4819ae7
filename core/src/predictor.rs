/// Inner predictor: the recurrent transition wrapped by the NEM cell.
///
/// The cell only needs four things from a predictor: size descriptors, a
/// hidden-state initializer keyed by the replicated batch (B·K), and a
/// transition `(flat_input, hidden) -> (flat_prediction, hidden')` recorded
/// on the tape. Everything else about the predictor is opaque to the cell.
///
/// `RnnPredictor` is the default: a fully-connected Elman recurrence.
///
/// Layout (row-major):
///   w_in:  [input_size, hidden_size]
///   w_rec: [hidden_size, hidden_size]
///   b_h:   [hidden_size]
///   w_out: [hidden_size, input_size]
///   b_out: [input_size]
///   w_act: [action_size, hidden_size]   (empty when action_size == 0)

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{shape_mismatch, NemError, Result};
use crate::tape::{BufId, Tape};
use crate::tensor::Tensor;
use crate::traced::{
    traced_add, traced_add_bias, traced_broadcast, traced_matmul, traced_reshape,
    traced_sigmoid, traced_tanh,
};

/// Contract every inner predictor satisfies to plug into `NemCell`.
pub trait InnerPredictor {
    /// Opaque hidden state, owned by the cell for one unroll.
    type Hidden: Clone;
    /// Tape ids of the parameters registered for one forward pass.
    type ParamIds;

    /// Flattened per-cluster input width M.
    fn input_size(&self) -> usize;
    /// Flattened per-cluster prediction width; must equal `input_size` for NEM.
    fn output_size(&self) -> usize;
    /// Width of the hidden state per replicated batch row.
    fn state_size(&self) -> usize;

    /// Snapshot the current parameters onto `tape`.
    fn register_params(&self, tape: &mut Tape) -> Self::ParamIds;

    /// Hidden state for `replicated_batch` = B·K rows.
    fn init_hidden(&self, tape: &mut Tape, replicated_batch: usize) -> Self::Hidden;

    /// One recurrent update. `input` is (B·K, M); the returned prediction is
    /// (B·K, M) with values in [0, 1].
    fn transition(
        &self,
        tape: &mut Tape,
        ids: &Self::ParamIds,
        input: BufId,
        hidden: &Self::Hidden,
    ) -> (BufId, Self::Hidden);

    /// Fold an external (B, A) action into the hidden state, shared by all K
    /// copies of each batch entry.
    fn merge_action(
        &self,
        _tape: &mut Tape,
        _ids: &Self::ParamIds,
        _hidden: &Self::Hidden,
        _action: &Tensor,
        _k: usize,
    ) -> Result<Self::Hidden> {
        Err(NemError::ActionsUnsupported)
    }

    /// Gradients for every parameter, in `parameters()` order.
    fn param_grads(&self, tape: &Tape, ids: &Self::ParamIds) -> Vec<Vec<f32>>;

    fn parameters(&self) -> Vec<&[f32]>;
    fn parameters_mut(&mut self) -> Vec<&mut [f32]>;
}

// ── Elman RNN ────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RnnConfig {
    pub input_size: usize,
    pub hidden_size: usize,
    #[serde(default)]
    pub action_size: usize,
}

impl RnnConfig {
    /// Tiny predictor for a 4x4x1 frame.
    pub fn test_config() -> Self {
        RnnConfig { input_size: 16, hidden_size: 8, action_size: 0 }
    }

    pub fn validate(&self) -> Result<()> {
        if self.input_size == 0 || self.hidden_size == 0 {
            return Err(NemError::InvalidConfig(format!(
                "rnn sizes must be positive (input_size={}, hidden_size={})",
                self.input_size, self.hidden_size
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RnnParams {
    pub w_in: Vec<f32>,
    pub w_rec: Vec<f32>,
    pub b_h: Vec<f32>,
    pub w_out: Vec<f32>,
    pub b_out: Vec<f32>,
    pub w_act: Vec<f32>,
}

fn xavier(rng: &mut StdRng, fan_in: usize, fan_out: usize) -> Vec<f32> {
    let n = fan_in * fan_out;
    if n == 0 {
        return Vec::new();
    }
    let scale = (6.0 / (fan_in + fan_out) as f32).sqrt();
    (0..n).map(|_| rng.gen_range(-scale..scale)).collect()
}

impl RnnParams {
    /// Xavier-uniform weights, zero biases.
    pub fn init(cfg: &RnnConfig, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let (m, h, a) = (cfg.input_size, cfg.hidden_size, cfg.action_size);
        RnnParams {
            w_in: xavier(&mut rng, m, h),
            w_rec: xavier(&mut rng, h, h),
            b_h: vec![0.0; h],
            w_out: xavier(&mut rng, h, m),
            b_out: vec![0.0; m],
            w_act: xavier(&mut rng, a, h),
        }
    }

    pub fn num_params(&self) -> usize {
        self.w_in.len() + self.w_rec.len() + self.b_h.len()
            + self.w_out.len() + self.b_out.len() + self.w_act.len()
    }

    fn check(&self, cfg: &RnnConfig) -> Result<()> {
        let (m, h, a) = (cfg.input_size, cfg.hidden_size, cfg.action_size);
        let expected = [m * h, h * h, h, h * m, m, a * h];
        let got = [
            self.w_in.len(), self.w_rec.len(), self.b_h.len(),
            self.w_out.len(), self.b_out.len(), self.w_act.len(),
        ];
        if expected != got {
            return Err(shape_mismatch("rnn parameter lengths", &expected, &got));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RnnParamIds {
    pub w_in: BufId,
    pub w_rec: BufId,
    pub b_h: BufId,
    pub w_out: BufId,
    pub b_out: BufId,
    pub w_act: BufId,
}

#[derive(Clone, Debug)]
pub struct RnnPredictor {
    pub config: RnnConfig,
    pub params: RnnParams,
}

impl RnnPredictor {
    pub fn new(config: RnnConfig, seed: u64) -> Result<Self> {
        config.validate()?;
        let params = RnnParams::init(&config, seed);
        Ok(RnnPredictor { config, params })
    }

    /// Wrap previously trained parameters.
    pub fn from_params(config: RnnConfig, params: RnnParams) -> Result<Self> {
        config.validate()?;
        params.check(&config)?;
        Ok(RnnPredictor { config, params })
    }
}

impl InnerPredictor for RnnPredictor {
    type Hidden = BufId;
    type ParamIds = RnnParamIds;

    fn input_size(&self) -> usize {
        self.config.input_size
    }

    fn output_size(&self) -> usize {
        self.config.input_size
    }

    fn state_size(&self) -> usize {
        self.config.hidden_size
    }

    fn register_params(&self, tape: &mut Tape) -> RnnParamIds {
        let (m, h, a) = (self.config.input_size, self.config.hidden_size, self.config.action_size);
        let p = &self.params;
        RnnParamIds {
            w_in: tape.register_param(&p.w_in, vec![m, h]),
            w_rec: tape.register_param(&p.w_rec, vec![h, h]),
            b_h: tape.register_param(&p.b_h, vec![h]),
            w_out: tape.register_param(&p.w_out, vec![h, m]),
            b_out: tape.register_param(&p.b_out, vec![m]),
            w_act: tape.register_param(&p.w_act, vec![a, h]),
        }
    }

    fn init_hidden(&self, tape: &mut Tape, replicated_batch: usize) -> BufId {
        let h = self.config.hidden_size;
        tape.alloc(vec![0.0; replicated_batch * h], vec![replicated_batch, h])
    }

    fn transition(&self, tape: &mut Tape, ids: &RnnParamIds, input: BufId, hidden: &BufId) -> (BufId, BufId) {
        let (m, h) = (self.config.input_size, self.config.hidden_size);
        let rows = tape.buf_numel(input) / m;

        // h' = tanh(x W_in + h W_rec + b_h)
        let xw = traced_matmul(tape, input, ids.w_in, rows, m, h);
        let hw = traced_matmul(tape, *hidden, ids.w_rec, rows, h, h);
        let pre = traced_add(tape, xw, hw);
        let pre = traced_add_bias(tape, pre, ids.b_h);
        let h_new = traced_tanh(tape, pre);

        // y = sigmoid(h' W_out + b_out)
        let logits = traced_matmul(tape, h_new, ids.w_out, rows, h, m);
        let logits = traced_add_bias(tape, logits, ids.b_out);
        let pred = traced_sigmoid(tape, logits);
        (pred, h_new)
    }

    fn merge_action(
        &self,
        tape: &mut Tape,
        ids: &RnnParamIds,
        hidden: &BufId,
        action: &Tensor,
        k: usize,
    ) -> Result<BufId> {
        let (h, a) = (self.config.hidden_size, self.config.action_size);
        if a == 0 {
            return Err(NemError::ActionsUnsupported);
        }
        let rows = tape.buf_numel(*hidden) / h;
        let batch = rows / k;
        if action.shape != [batch, a] {
            return Err(shape_mismatch("action", &[batch, a], &action.shape));
        }
        let act = tape.register_input(&action.data, vec![batch, a]);
        let proj = traced_matmul(tape, act, ids.w_act, batch, a, h);
        let proj = traced_reshape(tape, proj, vec![batch, 1, h]);
        let proj = traced_broadcast(tape, proj, &[batch, k, h]);
        let proj = traced_reshape(tape, proj, vec![rows, h]);
        Ok(traced_add(tape, *hidden, proj))
    }

    fn param_grads(&self, tape: &Tape, ids: &RnnParamIds) -> Vec<Vec<f32>> {
        vec![
            tape.get_param_grad(ids.w_in),
            tape.get_param_grad(ids.w_rec),
            tape.get_param_grad(ids.b_h),
            tape.get_param_grad(ids.w_out),
            tape.get_param_grad(ids.b_out),
            tape.get_param_grad(ids.w_act),
        ]
    }

    fn parameters(&self) -> Vec<&[f32]> {
        let p = &self.params;
        vec![
            p.w_in.as_slice(), p.w_rec.as_slice(), p.b_h.as_slice(),
            p.w_out.as_slice(), p.b_out.as_slice(), p.w_act.as_slice(),
        ]
    }

    fn parameters_mut(&mut self) -> Vec<&mut [f32]> {
        let p = &mut self.params;
        vec![
            p.w_in.as_mut_slice(), p.w_rec.as_mut_slice(), p.b_h.as_mut_slice(),
            p.w_out.as_mut_slice(), p.b_out.as_mut_slice(), p.w_act.as_mut_slice(),
        ]
    }
}
