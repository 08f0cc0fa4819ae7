/// Minimal tensor utilities for the NEM core.
///
/// All math is free functions on flat f32 slices with explicit dimensions.
/// Row-major layout throughout. Cluster tensors use (B, K, W, H, C); gamma
/// tensors use (B, K, W, H, 1); sequences prepend a time axis T.

use crate::error::{shape_mismatch, NemError, Result};

/// Flat f32 tensor with shape metadata.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    pub data: Vec<f32>,
    pub shape: Vec<usize>,
}

impl Tensor {
    pub fn zeros(shape: &[usize]) -> Self {
        Tensor::full(shape, 0.0)
    }

    pub fn full(shape: &[usize], value: f32) -> Self {
        let n: usize = shape.iter().product();
        Tensor {
            data: vec![value; n],
            shape: shape.to_vec(),
        }
    }

    /// Wrap existing data. Fails if `data.len()` disagrees with the shape.
    pub fn from_vec(data: Vec<f32>, shape: &[usize]) -> Result<Self> {
        let n: usize = shape.iter().product();
        if data.len() != n {
            return Err(shape_mismatch("tensor data length", &[n], &[data.len()]));
        }
        Ok(Tensor { data, shape: shape.to_vec() })
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Sub-tensor at index `t` of the leading axis (e.g. one time step).
    pub fn index_axis0(&self, t: usize) -> Result<Tensor> {
        let lead = *self.shape.first().ok_or(NemError::RankMismatch { expected: 1, got: 0 })?;
        if t >= lead {
            return Err(NemError::InvalidConfig(format!(
                "index {t} out of bounds for leading axis of length {lead}"
            )));
        }
        let inner: usize = self.shape[1..].iter().product();
        Ok(Tensor {
            data: self.data[t * inner..(t + 1) * inner].to_vec(),
            shape: self.shape[1..].to_vec(),
        })
    }
}

// ── Cluster shape bookkeeping ────────────────────────────────────────

/// Dimensions of one NEM step: batch, clusters, width, height, channels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClusterDims {
    pub batch: usize,
    pub k: usize,
    pub width: usize,
    pub height: usize,
    pub channels: usize,
}

impl ClusterDims {
    /// Flattened per-cluster element count M = W * H * C.
    pub fn per_cluster(&self) -> usize {
        self.width * self.height * self.channels
    }

    /// Spatial locations per cluster, W * H.
    pub fn pixels(&self) -> usize {
        self.width * self.height
    }

    /// (B, K, W, H, C)
    pub fn pred_shape(&self) -> Vec<usize> {
        vec![self.batch, self.k, self.width, self.height, self.channels]
    }

    /// (B, K, W, H, 1)
    pub fn gamma_shape(&self) -> Vec<usize> {
        vec![self.batch, self.k, self.width, self.height, 1]
    }

    /// (B * K, M): the layout the inner predictor sees.
    pub fn flat_shape(&self) -> Vec<usize> {
        vec![self.batch * self.k, self.per_cluster()]
    }

    /// (B, 1, W, H, C): one frame broadcastable over K.
    pub fn frame_shape(&self) -> Vec<usize> {
        vec![self.batch, 1, self.width, self.height, self.channels]
    }

    pub fn pred_numel(&self) -> usize {
        self.batch * self.k * self.per_cluster()
    }

    pub fn gamma_numel(&self) -> usize {
        self.batch * self.k * self.pixels()
    }
}

// ── Free-function math ops on flat slices ────────────────────────────

/// Matrix multiply: C[M,N] = A[M,K] @ B[K,N].  Row-major.
/// `out` must be pre-allocated with M*N elements (will be overwritten).
pub fn matmul_f32(a: &[f32], b: &[f32], out: &mut [f32], m: usize, k: usize, n: usize) {
    debug_assert_eq!(a.len(), m * k);
    debug_assert_eq!(b.len(), k * n);
    debug_assert_eq!(out.len(), m * n);

    for i in 0..m {
        for j in 0..n {
            let mut sum = 0.0f32;
            for p in 0..k {
                sum += a[i * k + p] * b[p * n + j];
            }
            out[i * n + j] = sum;
        }
    }
}

/// Transpose A[M,K] → out[K,M].
pub fn transpose_f32(a: &[f32], out: &mut [f32], m: usize, k: usize) {
    debug_assert_eq!(a.len(), m * k);
    debug_assert_eq!(out.len(), k * m);

    for i in 0..m {
        for j in 0..k {
            out[j * m + i] = a[i * k + j];
        }
    }
}

/// Element-wise add: out[i] = a[i] + b[i].
pub fn add_f32(a: &[f32], b: &[f32], out: &mut [f32]) {
    debug_assert_eq!(a.len(), b.len());
    debug_assert_eq!(a.len(), out.len());
    for i in 0..a.len() {
        out[i] = a[i] + b[i];
    }
}

/// Scale: out[i] = a[i] * scalar.
pub fn scale_f32(a: &[f32], scalar: f32, out: &mut [f32]) {
    debug_assert_eq!(a.len(), out.len());
    for i in 0..a.len() {
        out[i] = a[i] * scalar;
    }
}

/// Sigmoid: 1 / (1 + exp(-x)). Clamped to avoid overflow.
#[inline]
pub fn sigmoid_f32(x: f32) -> f32 {
    if x >= 15.0 { return 1.0; }
    if x <= -15.0 { return 0.0; }
    1.0 / (1.0 + (-x).exp())
}

// ── Broadcasting ─────────────────────────────────────────────────────
//
// Numpy-style over equal ranks: every source axis is either 1 or equal to
// the destination axis. `unbroadcast` is the adjoint (sum over the
// expanded axes) used by the reverse pass.

/// Whether `src` can be expanded to `dst`.
pub fn broadcast_compatible(src: &[usize], dst: &[usize]) -> bool {
    src.len() == dst.len() && src.iter().zip(dst.iter()).all(|(&s, &d)| s == d || s == 1)
}

fn broadcast_strides(src: &[usize]) -> Vec<usize> {
    let mut strides = vec![0usize; src.len()];
    let mut acc = 1usize;
    for ax in (0..src.len()).rev() {
        strides[ax] = if src[ax] == 1 { 0 } else { acc };
        acc *= src[ax];
    }
    strides
}

/// Visit every destination index with the matching source offset.
fn for_each_broadcast(src: &[usize], dst: &[usize], mut f: impl FnMut(usize, usize)) {
    let strides = broadcast_strides(src);
    let n: usize = dst.iter().product();
    let mut idx = vec![0usize; dst.len()];
    let mut src_off = 0usize;
    for dst_off in 0..n {
        f(dst_off, src_off);
        for ax in (0..dst.len()).rev() {
            idx[ax] += 1;
            src_off += strides[ax];
            if idx[ax] < dst[ax] {
                break;
            }
            src_off -= strides[ax] * idx[ax];
            idx[ax] = 0;
        }
    }
}

/// Expand `data` (shape `src`) to shape `dst`.
pub fn broadcast_to(data: &[f32], src: &[usize], dst: &[usize]) -> Vec<f32> {
    debug_assert!(broadcast_compatible(src, dst), "cannot broadcast {src:?} to {dst:?}");
    let mut out = vec![0.0f32; dst.iter().product()];
    for_each_broadcast(src, dst, |d, s| out[d] = data[s]);
    out
}

/// Sum-reduce `grad` (shape `dst`) back to shape `src`.
pub fn unbroadcast(grad: &[f32], src: &[usize], dst: &[usize]) -> Vec<f32> {
    debug_assert!(broadcast_compatible(src, dst), "cannot unbroadcast {dst:?} to {src:?}");
    let mut out = vec![0.0f32; src.iter().product()];
    for_each_broadcast(src, dst, |d, s| out[s] += grad[d]);
    out
}

/// Max over axis 1 of an (outer, axis_len, inner) view.
/// Returns the (outer, 1, inner) maxima and, for each, the winning axis index.
pub fn max_over_axis1(data: &[f32], outer: usize, axis_len: usize, inner: usize) -> (Vec<f32>, Vec<usize>) {
    debug_assert_eq!(data.len(), outer * axis_len * inner);
    let mut out = vec![f32::NEG_INFINITY; outer * inner];
    let mut arg = vec![0usize; outer * inner];
    for o in 0..outer {
        for a in 0..axis_len {
            for i in 0..inner {
                let v = data[(o * axis_len + a) * inner + i];
                let slot = o * inner + i;
                if v > out[slot] {
                    out[slot] = v;
                    arg[slot] = a;
                }
            }
        }
    }
    (out, arg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matmul_identity() {
        let a = vec![1.0, 2.0, 3.0, 4.0];
        let eye = vec![1.0, 0.0, 0.0, 1.0];
        let mut out = vec![0.0; 4];
        matmul_f32(&a, &eye, &mut out, 2, 2, 2);
        assert_eq!(out, a);
    }

    #[test]
    fn test_transpose() {
        let a = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]; // [2,3]
        let mut out = vec![0.0; 6];
        transpose_f32(&a, &mut out, 2, 3);
        assert_eq!(out, vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn test_broadcast_over_middle_axis() {
        // [2,1,3] → [2,2,3]
        let src = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let out = broadcast_to(&src, &[2, 1, 3], &[2, 2, 3]);
        assert_eq!(out, vec![1.0, 2.0, 3.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_broadcast_trailing_singleton() {
        // [2,1] → [2,3]
        let out = broadcast_to(&[1.0, 2.0], &[2, 1], &[2, 3]);
        assert_eq!(out, vec![1.0, 1.0, 1.0, 2.0, 2.0, 2.0]);
    }

    #[test]
    fn test_unbroadcast_sums_expanded_axes() {
        let grad = vec![1.0; 12];
        let out = unbroadcast(&grad, &[2, 1, 3], &[2, 2, 3]);
        assert_eq!(out, vec![2.0; 6]);
        let all = unbroadcast(&grad, &[1, 1, 1], &[2, 2, 3]);
        assert_eq!(all, vec![12.0]);
    }

    #[test]
    fn test_broadcast_compatible() {
        assert!(broadcast_compatible(&[2, 1, 4], &[2, 3, 4]));
        assert!(!broadcast_compatible(&[2, 2, 4], &[2, 3, 4]));
        assert!(!broadcast_compatible(&[2, 4], &[2, 3, 4]));
    }

    #[test]
    fn test_max_over_axis1() {
        // outer=1, axis=3, inner=2
        let data = vec![0.1, 0.9, 0.5, 0.2, 0.3, 0.4];
        let (m, arg) = max_over_axis1(&data, 1, 3, 2);
        assert_eq!(m, vec![0.5, 0.9]);
        assert_eq!(arg, vec![1, 0]);
    }

    #[test]
    fn test_index_axis0() {
        let t = Tensor::from_vec((0..6).map(|x| x as f32).collect(), &[3, 2]).unwrap();
        let row = t.index_axis0(1).unwrap();
        assert_eq!(row.shape, vec![2]);
        assert_eq!(row.data, vec![2.0, 3.0]);
        assert!(t.index_axis0(3).is_err());
    }

    #[test]
    fn test_from_vec_length_check() {
        assert!(Tensor::from_vec(vec![0.0; 5], &[2, 3]).is_err());
    }

    #[test]
    fn test_sigmoid_saturates() {
        assert_eq!(sigmoid_f32(20.0), 1.0);
        assert_eq!(sigmoid_f32(-20.0), 0.0);
        assert!((sigmoid_f32(0.0) - 0.5).abs() < 1e-7);
    }
}
