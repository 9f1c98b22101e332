//! Mu-law companding and one-hot expansion of quantized waveforms.

use crate::error::{Error, Result};
use crate::modules::ops::to_vec_int;
use burn::tensor::{backend::Backend, Int, Tensor, TensorData};

/// Quantize a sample in `[-1, 1]` to one of `n_quant` mu-law levels.
pub fn mu_law_encode(sample: f32, n_quant: usize) -> i64 {
    let mu = (n_quant - 1) as f32;
    let x = sample.clamp(-1.0, 1.0);
    let y = x.signum() * (1.0 + mu * x.abs()).ln() / (1.0 + mu).ln();
    let level = ((y + 1.0) / 2.0 * mu + 0.5).floor();
    level.clamp(0.0, mu) as i64
}

/// Map a mu-law level back to a sample in `[-1, 1]`.
pub fn mu_law_decode(level: i64, n_quant: usize) -> f32 {
    let mu = (n_quant - 1) as f32;
    let y = 2.0 * (level as f32) / mu - 1.0;
    y.signum() * ((1.0 + mu).powf(y.abs()) - 1.0) / mu
}

/// Expand `(B, T)` levels into a `(B, n_quant, T)` one-hot tensor.
pub fn one_hot<B: Backend>(levels: Tensor<B, 2, Int>, n_quant: usize) -> Result<Tensor<B, 3>> {
    let [batch, len] = levels.dims();
    let device = levels.device();
    let mut values = vec![0.0f32; batch * n_quant * len];
    for (i, level) in to_vec_int(levels).into_iter().enumerate() {
        if level < 0 || level as usize >= n_quant {
            return Err(Error::shape(format!(
                "quantized level {level} outside [0, {n_quant})"
            )));
        }
        let (b, t) = (i / len, i % len);
        values[b * n_quant * len + level as usize * len + t] = 1.0;
    }
    Ok(Tensor::from_data(
        TensorData::new(values, [batch, n_quant, len]),
        &device,
    ))
}

/// Decoder input preparation: quantized samples to one-hot frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreProcess {
    pub n_quant: usize,
}

impl PreProcess {
    pub fn new(n_quant: usize) -> Self {
        Self { n_quant }
    }

    pub fn forward<B: Backend>(&self, levels: Tensor<B, 2, Int>) -> Result<Tensor<B, 3>> {
        one_hot(levels, self.n_quant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::ops::to_vec;
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray<f32>;

    #[test]
    fn mu_law_endpoints_and_midpoint() {
        assert_eq!(mu_law_encode(-1.0, 256), 0);
        assert_eq!(mu_law_encode(1.0, 256), 255);
        assert_eq!(mu_law_encode(0.0, 256), 128);
        assert!((mu_law_decode(255, 256) - 1.0).abs() < 1e-5);
        assert!((mu_law_decode(0, 256) + 1.0).abs() < 1e-5);
    }

    #[test]
    fn mu_law_decode_is_close_to_inverse() {
        for &x in &[-0.8f32, -0.1, 0.02, 0.5, 0.9] {
            let back = mu_law_decode(mu_law_encode(x, 256), 256);
            assert!((back - x).abs() < 0.05 * x.abs().max(0.05), "{x} -> {back}");
        }
    }

    #[test]
    fn one_hot_places_ones() {
        let device = NdArrayDevice::default();
        let levels = Tensor::<TestBackend, 2, Int>::from_ints([[0, 2], [1, 1]], &device);
        let hot = one_hot(levels, 3).unwrap();
        assert_eq!(hot.dims(), [2, 3, 2]);
        let v = to_vec(hot);
        // batch 0: level 0 at t0, level 2 at t1
        assert_eq!(&v[0..6], &[1.0, 0.0, 0.0, 0.0, 0.0, 1.0]);
        // batch 1: level 1 at both steps
        assert_eq!(&v[6..12], &[0.0, 0.0, 1.0, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn one_hot_rejects_out_of_range() {
        let device = NdArrayDevice::default();
        let levels = Tensor::<TestBackend, 2, Int>::from_ints([[0, 3]], &device);
        assert!(one_hot(levels, 3).is_err());
    }
}
