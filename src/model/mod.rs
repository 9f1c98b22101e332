//! Model assemblers: the MFCC autoencoder and the MFCC inverter.
//!
//! Both register their layers in a [`VcGraph`](crate::geometry::VcGraph),
//! splice the dataset's MFCC stage above it in `post_init`, and resolve a
//! [`ModelGeometry`] that sizes every batch tensor.

pub mod autoencoder;
pub mod diagnostics;
pub mod geometry;
pub mod mfcc_inverter;

use crate::bottleneck::{BottleneckOutput, Metrics};
use crate::error::{Error, Result};
use crate::weights::{self, StateDict};
use burn::tensor::{backend::Backend, Int, Tensor};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;

pub use autoencoder::{AutoEncoder, AutoEncoderState, InitArgs};
pub use diagnostics::GradientStats;
pub use geometry::{GeometryAnchors, ModelGeometry};
pub use mfcc_inverter::{InverterInitArgs, InverterState, MfccInverter};

/// Decoder logits plus the bottleneck result that conditioned them.
#[derive(Debug, Clone)]
pub struct ForwardOutput<B: Backend> {
    /// `(B, n_quant, window)` logits.
    pub quant: Tensor<B, 3>,
    pub bottleneck: BottleneckOutput<B>,
}

/// Intermediate tensors of one `run`, for inspection.
#[derive(Debug, Clone)]
pub struct Diagnostics<B: Backend> {
    /// One-hot decoder input `(B, n_quant, dec_in_len)`.
    pub wav_onehot_dec: Tensor<B, 3>,
    /// Absent for the MFCC inverter.
    pub bottleneck: Option<BottleneckOutput<B>>,
}

/// Result of running a model on one batch.
#[derive(Debug, Clone)]
pub struct RunOutput<B: Backend> {
    /// `(B, n_quant, window - 1)` logits.
    pub pred: Tensor<B, 3>,
    /// `(B, window - 1)` levels each logit column predicts.
    pub target: Tensor<B, 2, Int>,
    /// Shape `[1]`.
    pub loss: Tensor<B, 1>,
    pub metrics: Metrics,
    pub diagnostics: Diagnostics<B>,
}

/// Align logits with the next-sample targets: `quant[..., :-1]` predicts
/// `wav_out[..., 1:]` where `wav_out` is the predicted window of `wav_dec`.
pub(crate) fn prediction_pair<B: Backend>(
    quant: Tensor<B, 3>,
    wav_dec: Tensor<B, 2, Int>,
    geometry: &ModelGeometry,
) -> Result<(Tensor<B, 3>, Tensor<B, 2, Int>)> {
    let len = quant.dims()[2];
    if len < 2 || len != geometry.trim_dec_out.len() {
        return Err(Error::shape(format!(
            "decoder produced {len} steps for a window of {}",
            geometry.trim_dec_out.len()
        )));
    }
    let wav_out = geometry.trim_dec_out.apply(wav_dec, 1);
    Ok((quant.narrow(2, 0, len - 1), wav_out.narrow(1, 1, len - 1)))
}

const META_MODEL: &str = "model";
const META_INIT_ARGS: &str = "init_args";

pub(crate) fn write_checkpoint<A: Serialize>(
    path: &Path,
    model: &str,
    init_args: &A,
    dict: &StateDict,
) -> Result<()> {
    let mut metadata = HashMap::new();
    metadata.insert(META_MODEL.to_string(), model.to_string());
    metadata.insert(META_INIT_ARGS.to_string(), serde_json::to_string(init_args)?);
    weights::save_checkpoint(path, dict, metadata)
}

pub(crate) fn read_checkpoint<A: DeserializeOwned>(path: &Path, model: &str) -> Result<(A, StateDict)> {
    let (dict, metadata) = weights::load_checkpoint(path)?;
    match metadata.get(META_MODEL) {
        Some(found) if found == model => {}
        found => {
            return Err(Error::Checkpoint(format!(
                "expected a '{model}' checkpoint, found {found:?}"
            )))
        }
    }
    let init_args = metadata
        .get(META_INIT_ARGS)
        .ok_or_else(|| Error::Checkpoint("checkpoint has no init_args".to_string()))?;
    Ok((serde_json::from_str(init_args)?, dict))
}
