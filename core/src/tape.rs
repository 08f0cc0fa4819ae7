// Wengert tape: reverse-mode AD over a flat buffer arena.
//
// Forward code allocates buffers and records one op per computed buffer.
// `backward` walks the ops in reverse and applies each op's VJP. One tape
// spans a whole NEM unroll, so gradients cross step boundaries.
//
// Gradient stopping is explicit: `detach` copies a buffer into a fresh slot
// with no recorded producer, so nothing upstream of the copy receives gradient.

use crate::distribution::{bernoulli_kl_grad_f32, bernoulli_nll_grad_f32};
use crate::e_step::e_step_vjp;
use crate::tensor::{self, ClusterDims};

// ── Arena ────────────────────────────────────────────────────────────

/// Index of a buffer in the tape arena.
pub type BufId = usize;

#[derive(Clone, Debug)]
struct Slot {
    data: Vec<f32>,
    shape: Vec<usize>,
    /// Parameters are the only slots `get_param_grad` accepts.
    trainable: bool,
}

// ── Tape operations ──────────────────────────────────────────────────

/// One recorded forward operation. Every variant names its output `out`.
#[derive(Debug, Clone)]
pub enum TapeOp {
    // ── Dense ───────────────────────────────────────────────────
    /// [m, k] x [k, n] -> [m, n]
    Matmul { a: BufId, b: BufId, out: BufId, m: usize, k: usize, n: usize },
    /// out[r, c] = input[r, c] + bias[c]
    AddBias { input: BufId, bias: BufId, out: BufId, rows: usize, cols: usize },

    // ── Pointwise ───────────────────────────────────────────────
    /// out = A + B
    Add { a: BufId, b: BufId, out: BufId },
    /// out = A - B
    Sub { a: BufId, b: BufId, out: BufId },
    /// out = A ⊙ B
    Mul { a: BufId, b: BufId, out: BufId },
    /// out = scalar * A
    Scale { input: BufId, scalar: f32, out: BufId },

    // ── Nonlinearities ──────────────────────────────────────────
    /// out = sigmoid(x); backward reads `out`
    Sigmoid { input: BufId, out: BufId },
    /// out = tanh(x); backward reads `out`
    Tanh { input: BufId, out: BufId },

    // ── Shape ───────────────────────────────────────────────────
    /// Same data, new shape metadata.
    Reshape { input: BufId, out: BufId },
    /// Numpy-style expansion; backward sums over expanded axes.
    Broadcast { input: BufId, out: BufId, src_shape: Vec<usize>, dst_shape: Vec<usize> },

    // ── Reductions ──────────────────────────────────────────────
    /// out = sum(x)  (scalar)
    Sum { input: BufId, out: BufId },
    /// out[o, 0, i] = max_k x[o, k, i]; backward routes to the arg-max
    MaxOverK { input: BufId, out: BufId, argmax: Vec<usize>, outer: usize, k: usize, inner: usize },

    // ── Observation model ───────────────────────────────────────
    /// Per-element Bernoulli NLL of `pred` against constant `target`, clamped.
    BernoulliNll { pred: BufId, target: BufId, out: BufId },
    /// Per-element KL(prior || pred) for a constant Bernoulli prior.
    BernoulliKl { pred: BufId, prior: f32, out: BufId },
    /// Likelihood + normalisation over K: gamma (B,K,W,H,1) from pred and data.
    EStep { pred: BufId, data: BufId, out: BufId, dims: ClusterDims, eps: f32 },
}

impl TapeOp {
    /// The buffer this op wrote.
    fn output(&self) -> BufId {
        match self {
            TapeOp::Matmul { out, .. }
            | TapeOp::AddBias { out, .. }
            | TapeOp::Add { out, .. }
            | TapeOp::Sub { out, .. }
            | TapeOp::Mul { out, .. }
            | TapeOp::Scale { out, .. }
            | TapeOp::Sigmoid { out, .. }
            | TapeOp::Tanh { out, .. }
            | TapeOp::Reshape { out, .. }
            | TapeOp::Broadcast { out, .. }
            | TapeOp::Sum { out, .. }
            | TapeOp::MaxOverK { out, .. }
            | TapeOp::BernoulliNll { out, .. }
            | TapeOp::BernoulliKl { out, .. }
            | TapeOp::EStep { out, .. } => *out,
        }
    }
}

// ── Tape ─────────────────────────────────────────────────────────────

/// Forward ops in order plus the buffers they read and wrote. Gradients
/// live beside the arena and start empty, so a new tape per unroll is the
/// zero-grad.
#[derive(Default)]
pub struct Tape {
    ops: Vec<TapeOp>,
    slots: Vec<Slot>,
    grads: Vec<Option<Vec<f32>>>,
}

impl Tape {
    pub fn new() -> Self {
        Tape::default()
    }

    fn push_slot(&mut self, data: Vec<f32>, shape: Vec<usize>, trainable: bool) -> BufId {
        debug_assert_eq!(data.len(), shape.iter().product::<usize>(),
                         "slot data does not fill shape {:?}", shape);
        self.slots.push(Slot { data, shape, trainable });
        self.grads.push(None);
        self.slots.len() - 1
    }

    /// New non-trainable buffer.
    pub fn alloc(&mut self, data: Vec<f32>, shape: Vec<usize>) -> BufId {
        self.push_slot(data, shape, false)
    }

    /// Snapshot of a trainable tensor. Later writes to `data` do not reach
    /// the tape.
    pub fn register_param(&mut self, data: &[f32], shape: Vec<usize>) -> BufId {
        self.push_slot(data.to_vec(), shape, true)
    }

    /// Snapshot of a constant input (frames, collision masks).
    pub fn register_input(&mut self, data: &[f32], shape: Vec<usize>) -> BufId {
        self.push_slot(data.to_vec(), shape, false)
    }

    /// Stop-gradient: copy `id` into a fresh buffer with no producer op.
    /// Gradient reaching the copy goes nowhere.
    pub fn detach(&mut self, id: BufId) -> BufId {
        let Slot { data, shape, .. } = self.slots[id].clone();
        self.alloc(data, shape)
    }

    pub fn buf_data(&self, id: BufId) -> &[f32] {
        &self.slots[id].data
    }

    pub fn buf_shape(&self, id: BufId) -> &[usize] {
        &self.slots[id].shape
    }

    pub fn buf_numel(&self, id: BufId) -> usize {
        self.slots[id].data.len()
    }

    pub fn is_param(&self, id: BufId) -> bool {
        self.slots[id].trainable
    }

    /// Value of a one-element buffer.
    pub fn scalar(&self, id: BufId) -> f32 {
        debug_assert_eq!(self.buf_numel(id), 1, "buffer {} is not a scalar", id);
        self.slots[id].data[0]
    }

    pub fn num_bufs(&self) -> usize {
        self.slots.len()
    }

    pub fn num_ops(&self) -> usize {
        self.ops.len()
    }

    // ── Recording ────────────────────────────────────────────────

    pub fn record(&mut self, op: TapeOp) {
        self.ops.push(op);
    }

    /// Allocate the output buffer, then record the op that wrote it.
    pub fn record_with_output(&mut self, data: Vec<f32>, shape: Vec<usize>,
                              op_fn: impl FnOnce(BufId) -> TapeOp) -> BufId {
        let out = self.alloc(data, shape);
        self.ops.push(op_fn(out));
        out
    }

    // ── Gradients ────────────────────────────────────────────────

    /// Set the incoming gradient of `id` before `backward`.
    pub fn seed_grad(&mut self, id: BufId, grad: Vec<f32>) {
        assert_eq!(grad.len(), self.buf_numel(id),
                   "seed for buffer {} has {} values, buffer has {}", id, grad.len(), self.buf_numel(id));
        self.grads[id] = Some(grad);
    }

    fn accumulate(&mut self, id: BufId, grad: Vec<f32>) {
        assert_eq!(grad.len(), self.buf_numel(id),
                   "gradient for buffer {} has {} values, buffer has {}", id, grad.len(), self.buf_numel(id));
        match &mut self.grads[id] {
            Some(acc) => acc.iter_mut().zip(grad).for_each(|(a, g)| *a += g),
            None => self.grads[id] = Some(grad),
        }
    }

    /// Gradient of `id`, or None when nothing flowed into it.
    pub fn get_grad(&self, id: BufId) -> Option<&[f32]> {
        self.grads[id].as_deref()
    }

    /// Gradient of a parameter; zeros when nothing flowed into it.
    pub fn get_param_grad(&self, id: BufId) -> Vec<f32> {
        assert!(self.is_param(id), "buffer {} is not a parameter", id);
        self.grads[id].clone().unwrap_or_else(|| vec![0.0; self.buf_numel(id)])
    }

    /// Replay the ops last-to-first, pushing each output gradient back to
    /// the op's inputs. A scalar `loss` with no seed is seeded with 1.0.
    pub fn backward(&mut self, loss: BufId) {
        if self.grads[loss].is_none() {
            assert_eq!(self.buf_numel(loss), 1,
                       "unseeded backward needs a scalar loss, buffer {} has {} values",
                       loss, self.buf_numel(loss));
            self.grads[loss] = Some(vec![1.0]);
        }

        for idx in (0..self.ops.len()).rev() {
            let op = self.ops[idx].clone();
            if let Some(d_out) = self.grads[op.output()].clone() {
                self.vjp(&op, &d_out);
            }
        }
    }

    fn data(&self, id: BufId) -> &[f32] {
        &self.slots[id].data
    }

    fn vjp(&mut self, op: &TapeOp, d_out: &[f32]) {
        match op {
            TapeOp::Matmul { a, b, m, k, n, .. } => {
                let (m, k, n) = (*m, *k, *n);
                // dA = dY Bᵀ
                let mut b_t = vec![0.0f32; n * k];
                tensor::transpose_f32(self.data(*b), &mut b_t, k, n);
                let mut d_a = vec![0.0f32; m * k];
                tensor::matmul_f32(d_out, &b_t, &mut d_a, m, n, k);
                // dB = Aᵀ dY
                let mut a_t = vec![0.0f32; k * m];
                tensor::transpose_f32(self.data(*a), &mut a_t, m, k);
                let mut d_b = vec![0.0f32; k * n];
                tensor::matmul_f32(&a_t, d_out, &mut d_b, k, m, n);
                self.accumulate(*a, d_a);
                self.accumulate(*b, d_b);
            }
            TapeOp::AddBias { input, bias, cols, .. } => {
                let mut d_bias = vec![0.0f32; *cols];
                for row in d_out.chunks(*cols) {
                    for (db, d) in d_bias.iter_mut().zip(row) {
                        *db += d;
                    }
                }
                self.accumulate(*input, d_out.to_vec());
                self.accumulate(*bias, d_bias);
            }
            TapeOp::Add { a, b, .. } => {
                self.accumulate(*a, d_out.to_vec());
                self.accumulate(*b, d_out.to_vec());
            }
            TapeOp::Sub { a, b, .. } => {
                self.accumulate(*a, d_out.to_vec());
                self.accumulate(*b, d_out.iter().map(|d| -d).collect());
            }
            TapeOp::Mul { a, b, .. } => {
                let d_a = zip_map(d_out, self.data(*b), |d, y| d * y);
                let d_b = zip_map(d_out, self.data(*a), |d, x| d * x);
                self.accumulate(*a, d_a);
                self.accumulate(*b, d_b);
            }
            TapeOp::Scale { input, scalar, .. } => {
                let mut d_in = vec![0.0f32; d_out.len()];
                tensor::scale_f32(d_out, *scalar, &mut d_in);
                self.accumulate(*input, d_in);
            }
            TapeOp::Sigmoid { input, out } => {
                let d_in = zip_map(d_out, self.data(*out), |d, s| d * s * (1.0 - s));
                self.accumulate(*input, d_in);
            }
            TapeOp::Tanh { input, out } => {
                let d_in = zip_map(d_out, self.data(*out), |d, t| d * (1.0 - t * t));
                self.accumulate(*input, d_in);
            }
            TapeOp::Reshape { input, .. } => {
                self.accumulate(*input, d_out.to_vec());
            }
            TapeOp::Broadcast { input, src_shape, dst_shape, .. } => {
                self.accumulate(*input, tensor::unbroadcast(d_out, src_shape, dst_shape));
            }
            TapeOp::Sum { input, .. } => {
                let n = self.buf_numel(*input);
                self.accumulate(*input, vec![d_out[0]; n]);
            }
            TapeOp::MaxOverK { input, argmax, outer, k, inner, .. } => {
                let mut d_in = vec![0.0f32; outer * k * inner];
                for (slot, (&d, &j)) in d_out.iter().zip(argmax).enumerate() {
                    let (o, i) = (slot / inner, slot % inner);
                    d_in[(o * k + j) * inner + i] += d;
                }
                self.accumulate(*input, d_in);
            }
            TapeOp::BernoulliNll { pred, target, .. } => {
                let d_pred: Vec<f32> = d_out.iter()
                    .zip(self.data(*pred).iter().zip(self.data(*target)))
                    .map(|(d, (&y, &t))| d * bernoulli_nll_grad_f32(y, t))
                    .collect();
                self.accumulate(*pred, d_pred);
            }
            TapeOp::BernoulliKl { pred, prior, .. } => {
                let d_pred = zip_map(d_out, self.data(*pred), |d, q| d * bernoulli_kl_grad_f32(*prior, q));
                self.accumulate(*pred, d_pred);
            }
            TapeOp::EStep { pred, data, dims, eps, .. } => {
                let (d_pred, d_data) = e_step_vjp(d_out, self.data(*pred), self.data(*data), dims, *eps);
                self.accumulate(*pred, d_pred);
                self.accumulate(*data, d_data);
            }
        }
    }
}

fn zip_map(a: &[f32], b: &[f32], f: impl Fn(f32, f32) -> f32) -> Vec<f32> {
    a.iter().zip(b).map(|(&x, &y)| f(x, y)).collect()
}

// ── Tests ────────────────────────────────────────────────────────────
