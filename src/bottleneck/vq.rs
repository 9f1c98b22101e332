//! Vector-quantized bottleneck, with an optional EMA-maintained codebook.

use super::{BottleneckAux, BottleneckOutput};
use crate::error::{Error, Result};
use crate::modules::conv::Conv1dOp;
use crate::modules::init::ParamInit;
use crate::modules::ops::to_vec_int;
use crate::weights::StateDict;
use burn::tensor::{backend::Backend, Int, Tensor, TensorData};

/// Running cluster statistics for the EMA codebook update.
#[derive(Debug, Clone)]
pub struct EmaState<B: Backend> {
    pub gamma: f32,
    /// Decayed per-code sums of assigned encodings `(n_codes, k)`.
    pub numer: Tensor<B, 2>,
    /// Decayed per-code assignment counts `(n_codes)`.
    pub denom: Tensor<B, 1>,
}

#[derive(Debug, Clone)]
pub struct VqVae<B: Backend> {
    pub proj: Conv1dOp<B>,
    /// Codebook `(n_codes, k)`.
    pub codebook: Tensor<B, 2>,
    pub ema: Option<EmaState<B>>,
}

impl<B: Backend> VqVae<B> {
    pub fn new(
        n_in: usize,
        n_out: usize,
        n_codes: usize,
        ema_gamma: Option<f32>,
        init: &mut ParamInit,
        device: &B::Device,
    ) -> Self {
        let proj = Conv1dOp::pointwise(n_in, n_out, init, device);
        let codebook = init.uniform_bound([n_codes, n_out], 1.0 / n_codes as f32, device);
        let ema = ema_gamma.map(|gamma| ema_from_codebook(&codebook, gamma));
        Self { proj, codebook, ema }
    }

    pub fn n_codes(&self) -> usize {
        self.codebook.dims()[0]
    }

    pub fn code_dim(&self) -> usize {
        self.codebook.dims()[1]
    }

    /// Pre-quantization encoding `ze`.
    pub fn pre_quantize(&self, encoding: Tensor<B, 3>) -> Tensor<B, 3> {
        self.proj.forward(encoding)
    }

    /// Nearest codebook vector per timestep of `ze (B, k, T)`.
    pub fn quantize(&self, ze: Tensor<B, 3>) -> (Tensor<B, 3>, Tensor<B, 1, Int>) {
        let [batch, k, len] = ze.dims();
        let n_codes = self.n_codes();
        let flat = ze.swap_dims(1, 2).reshape([batch * len, k]);
        let emb = self.codebook.clone();
        let emb_sq = (emb.clone() * emb.clone()).sum_dim(1).reshape([1, n_codes]);
        // |x - e|² up to the per-row constant |x|²
        let dist = emb_sq - flat.matmul(emb.clone().transpose()).mul_scalar(2.0);
        let indices = dist.argmin(1).reshape([batch * len]);
        let zq = emb
            .select(0, indices.clone())
            .reshape([batch, len, k])
            .swap_dims(1, 2);
        (zq, indices)
    }

    /// Quantize with a straight-through gradient estimator.
    pub fn forward(&self, encoding: Tensor<B, 3>) -> BottleneckOutput<B> {
        let ze = self.pre_quantize(encoding);
        let (zq, indices) = self.quantize(ze.clone());
        let code = ze.clone() + (zq.clone() - ze.clone()).detach();
        BottleneckOutput {
            code,
            aux: BottleneckAux::Quantized { ze, zq, indices },
        }
    }

    /// Replace the codebook, resetting EMA statistics to match it.
    pub fn set_codebook(&mut self, codebook: Tensor<B, 2>) -> Result<()> {
        if codebook.dims() != self.codebook.dims() {
            return Err(Error::shape(format!(
                "codebook {:?} does not match {:?}",
                codebook.dims(),
                self.codebook.dims()
            )));
        }
        if let Some(ema) = &mut self.ema {
            *ema = ema_from_codebook(&codebook, ema.gamma);
        }
        self.codebook = codebook;
        Ok(())
    }

    /// Fold the assignments of one batch into the EMA statistics and
    /// recompute the codebook. No-op without EMA.
    pub fn ema_update(&mut self, ze: Tensor<B, 3>, indices: Tensor<B, 1, Int>) {
        let Some(ema) = &mut self.ema else {
            return;
        };
        let [batch, k, len] = ze.dims();
        let n_codes = self.codebook.dims()[0];
        let device = ze.device();
        let flat = ze.detach().swap_dims(1, 2).reshape([batch * len, k]);

        let mut assign = vec![0.0f32; batch * len * n_codes];
        for (row, code) in to_vec_int(indices).into_iter().enumerate() {
            assign[row * n_codes + code as usize] = 1.0;
        }
        let assign = Tensor::<B, 2>::from_data(
            TensorData::new(assign, [batch * len, n_codes]),
            &device,
        );
        let counts = assign.clone().sum_dim(0).reshape([n_codes]);
        let sums = assign.transpose().matmul(flat);

        let keep = ema.gamma;
        let mix = 1.0 - keep;
        ema.denom = ema.denom.clone().mul_scalar(keep) + counts.mul_scalar(mix);
        ema.numer = ema.numer.clone().mul_scalar(keep) + sums.mul_scalar(mix);
        self.codebook = ema.numer.clone() / ema.denom.clone().reshape([n_codes, 1]);
    }

    pub fn export(&self, prefix: &str, dict: &mut StateDict) {
        self.proj.export(&format!("{prefix}.proj"), dict);
        dict.insert(format!("{prefix}.codebook"), &self.codebook);
        if let Some(ema) = &self.ema {
            dict.insert(format!("{prefix}.ema_numer"), &ema.numer);
            dict.insert(format!("{prefix}.ema_denom"), &ema.denom);
        }
    }

    pub fn import(&mut self, prefix: &str, dict: &mut StateDict, device: &B::Device) -> Result<()> {
        self.proj.import(&format!("{prefix}.proj"), dict, device)?;
        self.codebook = dict.take(&format!("{prefix}.codebook"), self.codebook.dims(), device)?;
        if let Some(ema) = &mut self.ema {
            ema.numer = dict.take(&format!("{prefix}.ema_numer"), ema.numer.dims(), device)?;
            ema.denom = dict.take(&format!("{prefix}.ema_denom"), ema.denom.dims(), device)?;
        }
        Ok(())
    }
}

fn ema_from_codebook<B: Backend>(codebook: &Tensor<B, 2>, gamma: f32) -> EmaState<B> {
    let n_codes = codebook.dims()[0];
    EmaState {
        gamma,
        numer: codebook.clone().mul_scalar(1.0 - gamma),
        denom: Tensor::ones([n_codes], &codebook.device()).mul_scalar(1.0 - gamma),
    }
}
