//! Unpadded 1D convolution primitives whose output lengths match their
//! virtual-convolution descriptors exactly.

use crate::error::Result;
use crate::geometry::{Anchor, VcSpec};
use crate::modules::init::ParamInit;
use crate::weights::StateDict;
use burn::tensor::{
    backend::Backend,
    module::{conv1d, conv_transpose1d},
    ops::{ConvOptions, ConvTransposeOptions},
    Tensor,
};

/// Shape parameters shared by the convolution ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvConfig {
    /// Kernel size in samples.
    pub kernel_size: usize,
    /// Stride (down- or up-sampling factor).
    pub stride: usize,
    /// Dilation factor.
    pub dilation: usize,
}

impl Default for ConvConfig {
    /// A 1x1 convolution.
    fn default() -> Self {
        Self {
            kernel_size: 1,
            stride: 1,
            dilation: 1,
        }
    }
}

impl ConvConfig {
    pub fn new(kernel_size: usize, stride: usize, dilation: usize) -> Self {
        Self {
            kernel_size,
            stride,
            dilation,
        }
    }
}

/// Valid (unpadded) 1D convolution.
#[derive(Debug, Clone)]
pub struct Conv1dOp<B: Backend> {
    pub config: ConvConfig,
    /// Weight tensor `[out, in, kernel]`.
    pub weight: Tensor<B, 3>,
    /// Optional bias `[out]`.
    pub bias: Option<Tensor<B, 1>>,
}

impl<B: Backend> Conv1dOp<B> {
    pub fn new(config: ConvConfig, weight: Tensor<B, 3>, bias: Option<Tensor<B, 1>>) -> Self {
        Self {
            config,
            weight,
            bias,
        }
    }

    /// Randomly initialized convolution with bias.
    pub fn init(
        n_in: usize,
        n_out: usize,
        config: ConvConfig,
        init: &mut ParamInit,
        device: &B::Device,
    ) -> Self {
        let fan_in = n_in * config.kernel_size;
        let weight = init.uniform([n_out, n_in, config.kernel_size], fan_in, device);
        let bias = init.uniform([n_out], fan_in, device);
        Self::new(config, weight, Some(bias))
    }

    /// Pointwise projection `n_in -> n_out`.
    pub fn pointwise(n_in: usize, n_out: usize, init: &mut ParamInit, device: &B::Device) -> Self {
        Self::init(n_in, n_out, ConvConfig::default(), init, device)
    }

    /// Descriptor of this op's length transform.
    pub fn vc_spec(&self, name: impl Into<String>, anchor: Anchor) -> VcSpec {
        VcSpec::conv(
            name,
            self.config.kernel_size as i64,
            self.config.stride as i64,
            self.config.dilation as i64,
        )
        .with_anchor(anchor)
    }

    /// Input channels.
    pub fn n_in(&self) -> usize {
        self.weight.dims()[1]
    }

    /// Output channels.
    pub fn n_out(&self) -> usize {
        self.weight.dims()[0]
    }

    /// Apply the convolution to `[batch, channels, time]`.
    pub fn forward(&self, input: Tensor<B, 3>) -> Tensor<B, 3> {
        conv1d(
            input,
            self.weight.clone(),
            self.bias.clone(),
            ConvOptions::new([self.config.stride], [0], [self.config.dilation], 1),
        )
    }

    pub fn export(&self, prefix: &str, dict: &mut StateDict) {
        dict.insert(format!("{prefix}.weight"), &self.weight);
        if let Some(bias) = &self.bias {
            dict.insert(format!("{prefix}.bias"), bias);
        }
    }

    pub fn import(&mut self, prefix: &str, dict: &mut StateDict, device: &B::Device) -> Result<()> {
        self.weight = dict.take(&format!("{prefix}.weight"), self.weight.dims(), device)?;
        if let Some(bias) = &self.bias {
            let dims = bias.dims();
            self.bias = Some(dict.take(&format!("{prefix}.bias"), dims, device)?);
        }
        Ok(())
    }
}

/// Transposed convolution returning only fully-covered outputs.
///
/// For `n` inputs the raw transposed convolution yields `(n - 1) * stride +
/// kernel` samples, of which the first and last `kernel - stride` receive
/// fewer contributions. Only the `n * stride - (kernel - stride)` outputs in
/// `[kernel - stride, n * stride)` are kept.
#[derive(Debug, Clone)]
pub struct ConvTranspose1dOp<B: Backend> {
    pub config: ConvConfig,
    /// Weight tensor `[in, out, kernel]`.
    pub weight: Tensor<B, 3>,
    /// Optional bias `[out]`.
    pub bias: Option<Tensor<B, 1>>,
}

impl<B: Backend> ConvTranspose1dOp<B> {
    pub fn new(config: ConvConfig, weight: Tensor<B, 3>, bias: Option<Tensor<B, 1>>) -> Self {
        Self {
            config,
            weight,
            bias,
        }
    }

    pub fn init(
        n_in: usize,
        n_out: usize,
        config: ConvConfig,
        init: &mut ParamInit,
        device: &B::Device,
    ) -> Self {
        let fan_in = n_out * config.kernel_size;
        let weight = init.uniform([n_in, n_out, config.kernel_size], fan_in, device);
        let bias = init.uniform([n_out], fan_in, device);
        Self::new(config, weight, Some(bias))
    }

    pub fn vc_spec(&self, name: impl Into<String>, anchor: Anchor) -> VcSpec {
        VcSpec::upsample(
            name,
            self.config.kernel_size as i64,
            self.config.stride as i64,
        )
        .with_anchor(anchor)
    }

    /// Upsample `[batch, channels, time]`, discarding partially-covered edges.
    pub fn forward(&self, input: Tensor<B, 3>) -> Tensor<B, 3> {
        let n_in = input.dims()[2];
        let stride = self.config.stride;
        let edge = self.config.kernel_size.saturating_sub(stride);
        let output = conv_transpose1d(
            input,
            self.weight.clone(),
            self.bias.clone(),
            ConvTransposeOptions::new([stride], [0], [0], [1], 1),
        );
        output.narrow(2, edge, (n_in * stride).saturating_sub(edge))
    }

    pub fn export(&self, prefix: &str, dict: &mut StateDict) {
        dict.insert(format!("{prefix}.weight"), &self.weight);
        if let Some(bias) = &self.bias {
            dict.insert(format!("{prefix}.bias"), bias);
        }
    }

    pub fn import(&mut self, prefix: &str, dict: &mut StateDict, device: &B::Device) -> Result<()> {
        self.weight = dict.take(&format!("{prefix}.weight"), self.weight.dims(), device)?;
        if let Some(bias) = &self.bias {
            let dims = bias.dims();
            self.bias = Some(dict.take(&format!("{prefix}.bias"), dims, device)?);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::VcGraph;
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray<f32>;

    #[test]
    fn conv_output_length_matches_descriptor() {
        let device = NdArrayDevice::default();
        let mut init = ParamInit::new(0);
        let op = Conv1dOp::<TestBackend>::init(2, 3, ConvConfig::new(3, 2, 2), &mut init, &device);
        let mut graph = VcGraph::new();
        let h = graph.push(op.vc_spec("c", Anchor::Centered), None).unwrap();
        let input = Tensor::<TestBackend, 3>::zeros([1, 2, 17], &device);
        let out = op.forward(input);
        assert_eq!(out.dims(), [1, 3, 7]);
        assert_eq!(graph.node(h).unwrap().output_length(17).unwrap(), 7);
    }

    #[test]
    fn conv_computes_dilated_sum() {
        let device = NdArrayDevice::default();
        let weight = Tensor::<TestBackend, 3>::from_floats([[[1.0, 1.0]]], &device);
        let op = Conv1dOp::new(ConvConfig::new(2, 1, 2), weight, None);
        let input = Tensor::<TestBackend, 3>::from_floats([[[1.0, 2.0, 3.0, 4.0]]], &device);
        let out = op.forward(input).to_data();
        assert_eq!(out.as_slice::<f32>().unwrap(), &[4.0, 6.0]);
    }

    #[test]
    fn transpose_keeps_fully_covered_outputs() {
        let device = NdArrayDevice::default();
        let weight = Tensor::<TestBackend, 3>::from_floats([[[1.0, 1.0, 1.0]]], &device);
        let op = ConvTranspose1dOp::new(ConvConfig::new(3, 2, 1), weight, None);
        let input = Tensor::<TestBackend, 3>::from_floats([[[1.0, 2.0, 3.0]]], &device);
        // Raw output: [1, 1, 3, 2, 5, 3, 3]; edge = 1 so keep indices 1..6.
        let out = op.forward(input).to_data();
        assert_eq!(out.as_slice::<f32>().unwrap(), &[1.0, 3.0, 2.0, 5.0, 3.0]);

        let mut graph = VcGraph::new();
        let h = graph.push(op.vc_spec("u", Anchor::Centered), None).unwrap();
        assert_eq!(graph.node(h).unwrap().output_length(3).unwrap(), 5);
    }
}
