//! Plain autoencoder bottleneck.

use super::{BottleneckAux, BottleneckOutput};
use crate::error::Result;
use crate::modules::conv::Conv1dOp;
use crate::modules::init::ParamInit;
use crate::weights::StateDict;
use burn::tensor::{backend::Backend, Tensor};

/// Pointwise projection of the encoding; the code is used as-is.
#[derive(Debug, Clone)]
pub struct Ae<B: Backend> {
    pub proj: Conv1dOp<B>,
}

impl<B: Backend> Ae<B> {
    pub fn new(n_in: usize, n_out: usize, init: &mut ParamInit, device: &B::Device) -> Self {
        Self {
            proj: Conv1dOp::pointwise(n_in, n_out, init, device),
        }
    }

    pub fn forward(&self, encoding: Tensor<B, 3>) -> BottleneckOutput<B> {
        BottleneckOutput {
            code: self.proj.forward(encoding),
            aux: BottleneckAux::None,
        }
    }

    pub fn export(&self, prefix: &str, dict: &mut StateDict) {
        self.proj.export(&format!("{prefix}.proj"), dict);
    }

    pub fn import(&mut self, prefix: &str, dict: &mut StateDict, device: &B::Device) -> Result<()> {
        self.proj.import(&format!("{prefix}.proj"), dict, device)
    }
}
