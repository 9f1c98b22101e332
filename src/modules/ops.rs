//! Host-side helpers for reading small tensors back.

use burn::tensor::{backend::Backend, Int, Tensor};

/// First element of a tensor as `f32`.
pub fn scalar<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> f32 {
    tensor
        .into_data()
        .iter::<f32>()
        .next()
        .unwrap_or(f32::NAN)
}

/// All elements as a flat `f32` vector in row-major order.
pub fn to_vec<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Vec<f32> {
    tensor.into_data().iter::<f32>().collect()
}

/// All elements of an integer tensor as `i64`.
pub fn to_vec_int<B: Backend, const D: usize>(tensor: Tensor<B, D, Int>) -> Vec<i64> {
    tensor.into_data().iter::<i64>().collect()
}

/// Mean and (population) standard deviation of all elements.
pub fn mean_std<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> (f32, f32) {
    let values = to_vec(tensor);
    if values.is_empty() {
        return (f32::NAN, f32::NAN);
    }
    let n = values.len() as f64;
    let mean = values.iter().map(|&v| v as f64).sum::<f64>() / n;
    let var = values
        .iter()
        .map(|&v| (v as f64 - mean).powi(2))
        .sum::<f64>()
        / n;
    (mean as f32, var.sqrt() as f32)
}
