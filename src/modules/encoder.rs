//! MFCC encoder: a stack of valid strided convolutions.

use crate::config::EncoderConfig;
use crate::error::{Error, Result};
use crate::geometry::{Anchor, VcGraph, VcHandle, Waypoint, Waypoints};
use crate::modules::conv::{Conv1dOp, ConvConfig};
use crate::modules::init::ParamInit;
use crate::weights::StateDict;
use burn::tensor::{activation::relu, backend::Backend, Tensor};

/// Convolutional encoder from MFCC frames to a per-timestep encoding.
///
/// Each configured layer is a ReLU convolution with `n_hidden` channels; a
/// final pointwise projection maps to `n_out` channels.
#[derive(Debug, Clone)]
pub struct Encoder<B: Backend> {
    pub layers: Vec<Conv1dOp<B>>,
    pub proj: Conv1dOp<B>,
    vc: Waypoints,
}

impl<B: Backend> Encoder<B> {
    /// Build the layers and register them in `graph` below `parent`.
    pub fn new(
        n_in: usize,
        config: &EncoderConfig,
        graph: &mut VcGraph,
        parent: Option<VcHandle>,
        init: &mut ParamInit,
        device: &B::Device,
    ) -> Result<Self> {
        if config.n_hidden == 0 || config.n_out == 0 {
            return Err(Error::config("encoder channel counts must be positive"));
        }
        let mut vc = Waypoints::default();
        let mut layers = Vec::with_capacity(config.layers.len());
        let mut prev = parent;
        let mut n_chan = n_in;
        for (i, layer) in config.layers.iter().enumerate() {
            let conv = Conv1dOp::init(
                n_chan,
                config.n_hidden,
                ConvConfig::new(layer.kernel_size, layer.stride, 1),
                init,
                device,
            );
            let handle = graph.push(conv.vc_spec(format!("enc_{i}"), Anchor::Centered), prev)?;
            if i == 0 {
                vc.insert(Waypoint::Beg, handle);
            }
            prev = Some(handle);
            n_chan = config.n_hidden;
            layers.push(conv);
        }
        let proj = Conv1dOp::pointwise(n_chan, config.n_out, init, device);
        let handle = graph.push(proj.vc_spec("enc_proj", Anchor::Centered), prev)?;
        if layers.is_empty() {
            vc.insert(Waypoint::Beg, handle);
        }
        vc.insert(Waypoint::End, handle);
        Ok(Self { layers, proj, vc })
    }

    pub fn vc(&self) -> &Waypoints {
        &self.vc
    }

    /// `(B, n_mel, T)` frames to `(B, n_out, T')` encodings.
    pub fn forward(&self, mels: Tensor<B, 3>) -> Tensor<B, 3> {
        let hidden = self
            .layers
            .iter()
            .fold(mels, |x, layer| relu(layer.forward(x)));
        self.proj.forward(hidden)
    }

    pub fn export(&self, prefix: &str, dict: &mut StateDict) {
        for (i, layer) in self.layers.iter().enumerate() {
            layer.export(&format!("{prefix}.layers.{i}"), dict);
        }
        self.proj.export(&format!("{prefix}.proj"), dict);
    }

    pub fn import(&mut self, prefix: &str, dict: &mut StateDict, device: &B::Device) -> Result<()> {
        for (i, layer) in self.layers.iter_mut().enumerate() {
            layer.import(&format!("{prefix}.layers.{i}"), dict, device)?;
        }
        self.proj.import(&format!("{prefix}.proj"), dict, device)
    }
}
