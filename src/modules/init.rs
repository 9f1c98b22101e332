//! Seeded parameter initialization.

use burn::tensor::{backend::Backend, Tensor, TensorData};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

/// Draws parameters from a seeded generator so assembly is reproducible.
#[derive(Debug, Clone)]
pub struct ParamInit {
    rng: StdRng,
}

impl ParamInit {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Uniform in `±1/sqrt(fan_in)`, the default for convolution weights.
    pub fn uniform<B: Backend, const D: usize>(
        &mut self,
        shape: [usize; D],
        fan_in: usize,
        device: &B::Device,
    ) -> Tensor<B, D> {
        let bound = 1.0 / (fan_in.max(1) as f32).sqrt();
        self.uniform_bound(shape, bound, device)
    }

    /// Uniform in `±bound`.
    pub fn uniform_bound<B: Backend, const D: usize>(
        &mut self,
        shape: [usize; D],
        bound: f32,
        device: &B::Device,
    ) -> Tensor<B, D> {
        let len = shape.iter().product::<usize>();
        let values: Vec<f32> = (0..len)
            .map(|_| self.rng.gen_range(-bound..=bound))
            .collect();
        Tensor::from_data(TensorData::new(values, shape), device)
    }

    /// Zero-mean normal with standard deviation `std`.
    pub fn normal<B: Backend, const D: usize>(
        &mut self,
        shape: [usize; D],
        std: f32,
        device: &B::Device,
    ) -> Tensor<B, D> {
        let len = shape.iter().product::<usize>();
        let values: Vec<f32> = (0..len)
            .map(|_| std * self.rng.sample::<f32, _>(StandardNormal))
            .collect();
        Tensor::from_data(TensorData::new(values, shape), device)
    }
}
