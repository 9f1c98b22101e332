//! Gaussian bottleneck with the reparameterization trick.

use super::{BottleneckAux, BottleneckOutput};
use crate::error::Result;
use crate::modules::conv::Conv1dOp;
use crate::modules::init::ParamInit;
use crate::weights::StateDict;
use burn::tensor::{backend::Backend, Distribution, Tensor};

#[derive(Debug, Clone)]
pub struct Vae<B: Backend> {
    pub mu: Conv1dOp<B>,
    pub log_sigma: Conv1dOp<B>,
}

impl<B: Backend> Vae<B> {
    pub fn new(n_in: usize, n_out: usize, init: &mut ParamInit, device: &B::Device) -> Self {
        Self {
            mu: Conv1dOp::pointwise(n_in, n_out, init, device),
            log_sigma: Conv1dOp::pointwise(n_in, n_out, init, device),
        }
    }

    /// Sample `mu + sigma * eps` while training, return `mu` otherwise.
    pub fn forward(&self, encoding: Tensor<B, 3>, training: bool) -> BottleneckOutput<B> {
        let mu = self.mu.forward(encoding.clone());
        let log_sigma = self.log_sigma.forward(encoding);
        let code = if training {
            let eps = Tensor::random(mu.dims(), Distribution::Normal(0.0, 1.0), &mu.device());
            mu.clone() + log_sigma.clone().exp() * eps
        } else {
            mu.clone()
        };
        BottleneckOutput {
            code,
            aux: BottleneckAux::Gaussian { mu, log_sigma },
        }
    }

    pub fn export(&self, prefix: &str, dict: &mut StateDict) {
        self.mu.export(&format!("{prefix}.mu"), dict);
        self.log_sigma.export(&format!("{prefix}.log_sigma"), dict);
    }

    pub fn import(&mut self, prefix: &str, dict: &mut StateDict, device: &B::Device) -> Result<()> {
        self.mu.import(&format!("{prefix}.mu"), dict, device)?;
        self.log_sigma.import(&format!("{prefix}.log_sigma"), dict, device)
    }
}

/// KL(N(mu, sigma) || N(0, 1)) summed over channels, averaged over batch and time.
pub fn kl_divergence<B: Backend>(mu: Tensor<B, 3>, log_sigma: Tensor<B, 3>) -> Tensor<B, 1> {
    let var = log_sigma.clone().mul_scalar(2.0).exp();
    let terms = (mu.clone() * mu + var - log_sigma.mul_scalar(2.0)).sub_scalar(1.0);
    terms.sum_dim(1).mean().mul_scalar(0.5)
}
