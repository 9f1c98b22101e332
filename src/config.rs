//! Configuration types for the autoencoder, its bottleneck and its decoder.
//!
//! Configurations are loaded from YAML files using [`load_config`].

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
/// One strided convolution of the encoder.
pub struct EncoderLayerConfig {
    /// Kernel size in input frames.
    pub kernel_size: usize,
    /// Downsampling factor.
    pub stride: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
/// MFCC encoder configuration.
pub struct EncoderConfig {
    /// Channels of every hidden convolution.
    pub n_hidden: usize,
    /// Channels of the encoding handed to the bottleneck.
    pub n_out: usize,
    /// Convolution stack, applied in order.
    pub layers: Vec<EncoderLayerConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
/// Bottleneck selection and parameters.
///
/// `type` is one of `ae`, `vae`, `vqvae` or `vqvae-ema`. It is validated when
/// the model is assembled, together with the fields that variant needs.
pub struct BottleneckConfig {
    /// Variant name.
    #[serde(rename = "type")]
    pub kind: String,
    /// Channels of the code passed to the decoder.
    pub n_out: usize,
    /// Codebook size (VQ variants).
    #[serde(default)]
    pub n_codes: Option<usize>,
    /// Commitment weight β (VQ variants).
    #[serde(default)]
    pub commitment: Option<f32>,
    /// Minimum KL charged per timestep (VAE).
    #[serde(default)]
    pub free_nats: Option<f32>,
    /// EMA decay γ (VQ-EMA).
    #[serde(default)]
    pub ema_gamma: Option<f32>,
    /// Weight of the code L2 penalty (AE).
    #[serde(default)]
    pub l2_weight: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
/// One transposed convolution of the local-conditioning upsampler.
pub struct UpsampleConfig {
    /// Kernel size in output samples.
    pub kernel_size: usize,
    /// Upsampling factor.
    pub stride: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
/// WaveNet decoder configuration.
pub struct DecoderConfig {
    /// Number of mu-law quantization levels.
    pub n_quant: usize,
    /// Residual channels.
    pub n_res: usize,
    /// Channels of the dilated (filter and gate) convolutions.
    pub n_dil: usize,
    /// Skip channels.
    pub n_skip: usize,
    /// Hidden channels of the output head.
    pub n_post: usize,
    /// Speaker embedding size.
    pub n_gc: usize,
    /// Channels of the upsampled local conditioning.
    pub n_lc_out: usize,
    /// Kernel of the convolution applied before upsampling.
    pub lc_conv_kernel_size: usize,
    /// Upsampling stack; the product of strides must undo the encoder's.
    pub upsample: Vec<UpsampleConfig>,
    /// Number of repeated dilation blocks.
    pub n_blocks: usize,
    /// Layers per block; dilation doubles per layer.
    pub n_block_layers: usize,
    /// Kernel of each dilated causal convolution.
    #[serde(default = "default_dilated_kernel_size")]
    pub kernel_size: usize,
    /// Number of speakers; filled in from the dataset at assembly.
    #[serde(default)]
    pub n_speakers: usize,
}

fn default_dilated_kernel_size() -> usize {
    2
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
/// Geometry of the dataset's MFCC extraction.
pub struct MfccConfig {
    /// Analysis window in samples.
    pub window_size: usize,
    /// Hop between frames in samples.
    pub hop_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
/// Static description of the training data.
pub struct DatasetConfig {
    /// MFCC channels per frame.
    pub n_mel_chan: usize,
    /// Number of distinct speakers.
    pub n_speakers: usize,
    /// Samples predicted per batch window.
    pub window_batch_size: usize,
    /// MFCC extraction geometry.
    pub mfcc: MfccConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
/// Settings specific to the MFCC inverter.
pub struct MfccInverterConfig {
    /// Local-conditioning channels fed to the WaveNet (MFCC channels).
    pub n_lc_in: usize,
}

/// Top-level configuration.
///
/// # Example YAML
///
/// ```yaml
/// training: true
/// seed: 7
/// encoder: { n_hidden: 32, n_out: 16, layers: [{ kernel_size: 3, stride: 1 }, { kernel_size: 4, stride: 2 }] }
/// bottleneck: { type: vqvae, n_out: 16, n_codes: 32, commitment: 0.25 }
/// decoder: { n_quant: 64, n_res: 16, ..., upsample: [{ kernel_size: 8, stride: 4 }] }
/// dataset: { n_mel_chan: 13, n_speakers: 4, window_batch_size: 64, mfcc: { window_size: 4, hop_size: 2 } }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Enables stochastic bottleneck sampling and EMA codebook updates.
    #[serde(default)]
    pub training: bool,
    /// Seed for parameter initialization and k-means.
    #[serde(default)]
    pub seed: u64,
    pub encoder: EncoderConfig,
    pub bottleneck: BottleneckConfig,
    pub decoder: DecoderConfig,
    #[serde(default)]
    pub mfcc_inverter: Option<MfccInverterConfig>,
    pub dataset: DatasetConfig,
}

/// Load a configuration from a YAML file.
///
/// # Errors
///
/// Returns an error if the file doesn't exist or contains invalid YAML.
pub fn load_config(path: impl AsRef<Path>) -> anyhow::Result<Config> {
    let path = path.as_ref();
    if !path.exists() {
        anyhow::bail!("Config file not found: {}", path.display());
    }
    let data = fs::read_to_string(path)?;
    let config: Config = serde_yaml::from_str(&data)?;
    Ok(config)
}
