/// Traced wrappers: tape-aware computation that records ops for backward.
///
/// Each wrapper:
///   1. Reads inputs from the tape arena
///   2. Computes the forward value
///   3. Allocates the output in the arena
///   4. Records the TapeOp
///   5. Returns the output BufId
///
/// Shape contracts are checked with debug assertions; callers validate
/// user-facing shapes before anything reaches the tape.

use crate::distribution::{bernoulli_kl_f32, bernoulli_nll_f32, EPSILON};
use crate::e_step::e_step_forward;
use crate::tape::{BufId, Tape, TapeOp};
use crate::tensor::{self, ClusterDims};

/// Matrix multiply: out = A @ B, A: [m, k], B: [k, n].
pub fn traced_matmul(tape: &mut Tape, a: BufId, b: BufId, m: usize, k: usize, n: usize) -> BufId {
    let mut out = vec![0.0f32; m * n];
    tensor::matmul_f32(tape.buf_data(a), tape.buf_data(b), &mut out, m, k, n);
    tape.record_with_output(out, vec![m, n], |out_id| {
        TapeOp::Matmul { a, b, out: out_id, m, k, n }
    })
}

/// Row-broadcast bias: out[r, c] = input[r, c] + bias[c].
pub fn traced_add_bias(tape: &mut Tape, input: BufId, bias: BufId) -> BufId {
    let shape = tape.buf_shape(input).to_vec();
    let cols = tape.buf_numel(bias);
    let rows = tape.buf_numel(input) / cols;
    debug_assert_eq!(rows * cols, tape.buf_numel(input));
    let b = tape.buf_data(bias);
    let out: Vec<f32> = tape.buf_data(input).iter().enumerate()
        .map(|(i, &x)| x + b[i % cols]).collect();
    tape.record_with_output(out, shape, |out_id| {
        TapeOp::AddBias { input, bias, out: out_id, rows, cols }
    })
}

/// Element-wise add: out = a + b.
pub fn traced_add(tape: &mut Tape, a: BufId, b: BufId) -> BufId {
    debug_assert_eq!(tape.buf_numel(a), tape.buf_numel(b));
    let mut out = vec![0.0f32; tape.buf_numel(a)];
    tensor::add_f32(tape.buf_data(a), tape.buf_data(b), &mut out);
    let shape = tape.buf_shape(a).to_vec();
    tape.record_with_output(out, shape, |out_id| TapeOp::Add { a, b, out: out_id })
}

/// Element-wise subtract: out = a - b.
pub fn traced_sub(tape: &mut Tape, a: BufId, b: BufId) -> BufId {
    debug_assert_eq!(tape.buf_numel(a), tape.buf_numel(b));
    let out: Vec<f32> = tape.buf_data(a).iter().zip(tape.buf_data(b).iter())
        .map(|(&x, &y)| x - y).collect();
    let shape = tape.buf_shape(a).to_vec();
    tape.record_with_output(out, shape, |out_id| TapeOp::Sub { a, b, out: out_id })
}

/// Element-wise multiply: out = a * b.
pub fn traced_mul(tape: &mut Tape, a: BufId, b: BufId) -> BufId {
    debug_assert_eq!(tape.buf_numel(a), tape.buf_numel(b));
    let out: Vec<f32> = tape.buf_data(a).iter().zip(tape.buf_data(b).iter())
        .map(|(&x, &y)| x * y).collect();
    let shape = tape.buf_shape(a).to_vec();
    tape.record_with_output(out, shape, |out_id| TapeOp::Mul { a, b, out: out_id })
}

/// Scale: out = scalar * input.
pub fn traced_scale(tape: &mut Tape, input: BufId, scalar: f32) -> BufId {
    let mut out = vec![0.0f32; tape.buf_numel(input)];
    tensor::scale_f32(tape.buf_data(input), scalar, &mut out);
    let shape = tape.buf_shape(input).to_vec();
    tape.record_with_output(out, shape, |out_id| TapeOp::Scale { input, scalar, out: out_id })
}

/// Element-wise sigmoid.
pub fn traced_sigmoid(tape: &mut Tape, input: BufId) -> BufId {
    let out: Vec<f32> = tape.buf_data(input).iter().map(|&x| tensor::sigmoid_f32(x)).collect();
    let shape = tape.buf_shape(input).to_vec();
    tape.record_with_output(out, shape, |out_id| TapeOp::Sigmoid { input, out: out_id })
}

/// Element-wise tanh.
pub fn traced_tanh(tape: &mut Tape, input: BufId) -> BufId {
    let out: Vec<f32> = tape.buf_data(input).iter().map(|&x| x.tanh()).collect();
    let shape = tape.buf_shape(input).to_vec();
    tape.record_with_output(out, shape, |out_id| TapeOp::Tanh { input, out: out_id })
}

/// Same data under a new shape. Element counts must agree.
pub fn traced_reshape(tape: &mut Tape, input: BufId, shape: Vec<usize>) -> BufId {
    debug_assert_eq!(shape.iter().product::<usize>(), tape.buf_numel(input));
    let out = tape.buf_data(input).to_vec();
    tape.record_with_output(out, shape, |out_id| TapeOp::Reshape { input, out: out_id })
}

/// Numpy-style expansion of `input` to `dst_shape`. Returns `input` itself
/// when the shapes already agree.
pub fn traced_broadcast(tape: &mut Tape, input: BufId, dst_shape: &[usize]) -> BufId {
    let src_shape = tape.buf_shape(input).to_vec();
    if src_shape == dst_shape {
        return input;
    }
    let out = tensor::broadcast_to(tape.buf_data(input), &src_shape, dst_shape);
    let dst_shape = dst_shape.to_vec();
    tape.record_with_output(out, dst_shape.clone(), |out_id| {
        TapeOp::Broadcast { input, out: out_id, src_shape, dst_shape }
    })
}

/// Sum of all elements, as a [1] buffer.
pub fn traced_sum(tape: &mut Tape, input: BufId) -> BufId {
    let total: f32 = tape.buf_data(input).iter().sum();
    tape.record_with_output(vec![total], vec![1], |out_id| TapeOp::Sum { input, out: out_id })
}

/// Max over the cluster axis: (B, K, ...) → (B, 1, ...).
pub fn traced_max_over_k(tape: &mut Tape, input: BufId) -> BufId {
    let shape = tape.buf_shape(input).to_vec();
    debug_assert!(shape.len() >= 2);
    let (outer, k) = (shape[0], shape[1]);
    let inner: usize = shape[2..].iter().product();
    let (out, argmax) = tensor::max_over_axis1(tape.buf_data(input), outer, k, inner);
    let mut out_shape = shape;
    out_shape[1] = 1;
    tape.record_with_output(out, out_shape, |out_id| {
        TapeOp::MaxOverK { input, out: out_id, argmax, outer, k, inner }
    })
}

/// Per-element clamped Bernoulli NLL. `pred` and `target` share a shape.
pub fn traced_bernoulli_nll(tape: &mut Tape, pred: BufId, target: BufId) -> BufId {
    debug_assert_eq!(tape.buf_numel(pred), tape.buf_numel(target));
    let out: Vec<f32> = tape.buf_data(pred).iter().zip(tape.buf_data(target).iter())
        .map(|(&y, &t)| bernoulli_nll_f32(y, t)).collect();
    let shape = tape.buf_shape(pred).to_vec();
    tape.record_with_output(out, shape, |out_id| {
        TapeOp::BernoulliNll { pred, target, out: out_id }
    })
}

/// Per-element KL(prior || pred) for a constant Bernoulli prior.
pub fn traced_bernoulli_kl(tape: &mut Tape, prior: f32, pred: BufId) -> BufId {
    let out: Vec<f32> = tape.buf_data(pred).iter().map(|&q| bernoulli_kl_f32(prior, q)).collect();
    let shape = tape.buf_shape(pred).to_vec();
    tape.record_with_output(out, shape, |out_id| {
        TapeOp::BernoulliKl { pred, prior, out: out_id }
    })
}

/// E-step: gamma (B, K, W, H, 1) from pred and data, both (B, K, W, H, C).
pub fn traced_e_step(tape: &mut Tape, pred: BufId, data: BufId, dims: ClusterDims) -> BufId {
    debug_assert_eq!(tape.buf_numel(pred), dims.pred_numel());
    debug_assert_eq!(tape.buf_numel(data), dims.pred_numel());
    let eps = EPSILON;
    let gamma = e_step_forward(tape.buf_data(pred), tape.buf_data(data), &dims, eps);
    tape.record_with_output(gamma, dims.gamma_shape(), |out_id| {
        TapeOp::EStep { pred, data, out: out_id, dims, eps }
    })
}
