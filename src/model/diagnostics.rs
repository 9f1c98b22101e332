//! Gradient statistics, available when the model runs on an autodiff backend.

use super::{AutoEncoder, MfccInverter};
use crate::bottleneck::{cross_entropy, BottleneckOutput, Metrics};
use crate::data::VBatch;
use crate::error::{Error, Result};
use crate::modules::ops::mean_std;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::Tensor;
use tracing::debug;

/// Loss gradients with respect to model inputs and intermediate codes.
pub trait GradientStats<B: AutodiffBackend> {
    /// Reports `mel_grad_sd`, `mel_grad_mean` and, where a bottleneck exists,
    /// `bn_grad_sd`. Parameters are left untouched.
    fn gradient_stats(&self, batch: &VBatch<B>) -> Result<Metrics>;
}

fn leaf<B: AutodiffBackend>(tensor: Tensor<B, 3>) -> Tensor<B, 3> {
    tensor.detach().require_grad()
}

fn missing(what: &str) -> Error {
    Error::usage(format!("loss does not depend on {what}"))
}

impl<B: AutodiffBackend> GradientStats<B> for AutoEncoder<B> {
    fn gradient_stats(&self, batch: &VBatch<B>) -> Result<Metrics> {
        self.check_batch(batch)?;
        let wav_onehot_dec = self.preprocess().forward(batch.wav_dec_input.clone())?;
        let mut metrics = Metrics::new();

        let mels = leaf(batch.mel_enc_input.clone());
        let bottleneck = self.encode(mels.clone());
        let quant = self.decode(
            wav_onehot_dec.clone(),
            bottleneck.code.clone(),
            batch.voice_index.clone(),
            batch.jitter_index.clone(),
        )?;
        let (pred, target) = self.prediction_pair(quant, batch)?;
        let loss = self.objective().loss(pred, target, &bottleneck)?.loss;
        let grads = loss.backward();
        let mel_grad = mels.grad(&grads).ok_or_else(|| missing("the MFCC input"))?;
        let (mean, sd) = mean_std(mel_grad);
        metrics.insert("mel_grad_mean".into(), mean);
        metrics.insert("mel_grad_sd".into(), sd);

        let detached = bottleneck.detached();
        let code = leaf(detached.code.clone());
        let quant = self.decode(
            wav_onehot_dec,
            code.clone(),
            batch.voice_index.clone(),
            batch.jitter_index.clone(),
        )?;
        let (pred, target) = self.prediction_pair(quant, batch)?;
        let output = BottleneckOutput {
            code: code.clone(),
            aux: detached.aux,
        };
        let loss = self.objective().loss(pred, target, &output)?.loss;
        let grads = loss.backward();
        let bn_grad = code.grad(&grads).ok_or_else(|| missing("the bottleneck code"))?;
        metrics.insert("bn_grad_sd".into(), mean_std(bn_grad).1);

        debug!(?metrics, "autoencoder gradient stats");
        Ok(metrics)
    }
}

impl<B: AutodiffBackend> GradientStats<B> for MfccInverter<B> {
    fn gradient_stats(&self, batch: &VBatch<B>) -> Result<Metrics> {
        self.check_batch(batch)?;
        let wav_onehot_dec = self.preprocess().forward(batch.wav_dec_input.clone())?;
        let mels = leaf(batch.mel_enc_input.clone());
        let quant = self.forward(
            mels.clone(),
            wav_onehot_dec,
            batch.voice_index.clone(),
            batch.jitter_index.clone(),
        )?;
        let (pred, target) = self.prediction_pair(quant, batch)?;
        let grads = cross_entropy(pred, target)?.backward();
        let mel_grad = mels.grad(&grads).ok_or_else(|| missing("the MFCC input"))?;
        let (mean, sd) = mean_std(mel_grad);

        let mut metrics = Metrics::new();
        metrics.insert("mel_grad_mean".into(), mean);
        metrics.insert("mel_grad_sd".into(), sd);
        debug!(?metrics, "mfcc inverter gradient stats");
        Ok(metrics)
    }
}
