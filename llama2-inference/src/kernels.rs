//! Neural net blocks shared by the forward pass and the sampler.
//!
//! All functions are stateless and operate on caller-provided buffers.

use rayon::prelude::*;

/// Epsilon value for numerical stability in normalization
pub const RMS_NORM_EPS: f32 = 1e-5;

/// RMS normalization: `output[i] = weight[i] * input[i] / sqrt(mean(input²) + ε)`.
pub fn rmsnorm(output: &mut [f32], input: &[f32], weight: &[f32]) {
    debug_assert_eq!(output.len(), input.len());
    debug_assert_eq!(input.len(), weight.len());

    let scale = rms_scale(input);

    output.iter_mut().zip(input.iter()).zip(weight.iter()).for_each(|((out, &inp), &w)| {
        *out = w * (scale * inp);
    });
}

/// Same as [`rmsnorm`] but normalizes `x` in place.
pub fn rmsnorm_inplace(x: &mut [f32], weight: &[f32]) {
    debug_assert_eq!(x.len(), weight.len());

    let scale = rms_scale(x);

    x.iter_mut().zip(weight.iter()).for_each(|(val, &w)| {
        *val = w * (scale * *val);
    });
}

#[inline]
fn rms_scale(x: &[f32]) -> f32 {
    let sum_of_squares = x.iter().map(|&val| val * val).sum::<f32>();
    1.0f32 / ((sum_of_squares / x.len() as f32) + RMS_NORM_EPS).sqrt()
}

/// Applies softmax normalization to a slice in-place.
///
/// The slice must not be empty.
pub fn softmax(x: &mut [f32]) {
    debug_assert!(!x.is_empty(), "softmax over an empty slice");

    let max_val = x.iter().fold(f32::NEG_INFINITY, |acc, &val| acc.max(val));
    let sum = x
        .iter_mut()
        .map(|val| {
            *val = (*val - max_val).exp();
            *val
        })
        .sum::<f32>();
    let inv_sum = sum.recip();
    x.iter_mut().for_each(|val| *val *= inv_sum);
}

/// Matrix-vector product: `W (d, n) @ x (n,) -> xout (d,)`, `W` stored row-major.
///
/// By far the most time is spent here, output rows are computed in parallel.
pub fn matmul(xout: &mut [f32], x: &[f32], w: &[f32]) {
    let n = x.len();
    debug_assert_eq!(w.len(), xout.len() * n, "weight shape does not match ({}, {})", xout.len(), n);

    xout.par_iter_mut().enumerate().for_each(|(i, out_val)| {
        *out_val = dot(&w[i * n..(i + 1) * n], x);
    });
}

#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b.iter()).map(|(&a, &b)| a * b).sum()
}

/// SwiGLU gate: `gate[i] = silu(gate[i]) * up[i]` where `silu(v) = v * σ(v)`.
pub fn swiglu(gate: &mut [f32], up: &[f32]) {
    debug_assert_eq!(gate.len(), up.len());

    gate.iter_mut().zip(up.iter()).for_each(|(gate_val, &up_val)| {
        let silu = *gate_val * (1.0f32 + (-*gate_val).exp()).recip();
        *gate_val = silu * up_val;
    });
}

/// Residual connection: `x += delta`.
pub fn accumulate(x: &mut [f32], delta: &[f32]) {
    debug_assert_eq!(x.len(), delta.len());
    x.iter_mut().zip(delta.iter()).for_each(|(x_val, &d)| *x_val += d);
}
