//! Shared helpers: fixture configs and synthetic batches sized by a geometry.

#![allow(dead_code)]

use aewave::config::{load_config, Config};
use aewave::data::{identity_jitter, jitter_indices, VBatch};
use aewave::ModelGeometry;
use burn::tensor::backend::Backend;
use burn::tensor::{Distribution, Int, Tensor, TensorData};
use burn_ndarray::NdArray;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub type TestBackend = NdArray<f32>;

pub const FIXTURE_DIR: &str = "tests/fixtures";

/// Load a YAML config from the fixtures directory.
pub fn fixture_config(name: &str) -> Config {
    let path = format!("{FIXTURE_DIR}/{name}");
    load_config(&path).unwrap_or_else(|e| panic!("failed to load fixture {path}: {e}"))
}

/// Autoencoder fixture with the bottleneck swapped for `kind`.
pub fn autoencoder_config(kind: &str) -> Config {
    let mut config = fixture_config("autoencoder.yaml");
    config.bottleneck.kind = kind.to_string();
    config
}

/// Deterministic batch matching `geometry`.
pub fn synthetic_batch<B: Backend>(
    config: &Config,
    geometry: &ModelGeometry,
    batch: usize,
    seed: u64,
    device: &B::Device,
) -> VBatch<B> {
    let mut rng = StdRng::seed_from_u64(seed);
    let n_quant = config.decoder.n_quant as i64;
    let n_speakers = config.dataset.n_speakers as i64;

    let mels: Vec<f32> = (0..batch * config.dataset.n_mel_chan * geometry.enc_in_mel_len)
        .map(|_| rng.gen_range(-1.0..1.0))
        .collect();
    let mels = Tensor::<B, 3>::from_data(
        TensorData::new(
            mels,
            [batch, config.dataset.n_mel_chan, geometry.enc_in_mel_len],
        ),
        device,
    );
    let wav: Vec<i64> = (0..batch * geometry.enc_in_len)
        .map(|_| rng.gen_range(0..n_quant))
        .collect();
    let wav = Tensor::<B, 2, Int>::from_data(TensorData::new(wav, [batch, geometry.enc_in_len]), device);
    let voice: Vec<i64> = (0..batch).map(|_| rng.gen_range(0..n_speakers)).collect();
    let voice = Tensor::<B, 1, Int>::from_data(TensorData::new(voice, [batch]), device);
    let jitter = jitter_indices::<B>(batch, geometry.embed_len, 0.12, &mut rng, device);

    VBatch::from_windows(mels, wav, voice, jitter, geometry).expect("batch matches geometry")
}

/// Endless deterministic source of batches.
pub fn batch_source<B: Backend>(
    config: &Config,
    geometry: ModelGeometry,
    batch: usize,
    seed: u64,
    device: &B::Device,
) -> impl Iterator<Item = VBatch<B>> {
    let config = config.clone();
    let device = device.clone();
    (seed..).map(move |s| synthetic_batch(&config, &geometry, batch, s, &device))
}

/// Batch whose decoder input is constant and whose conditioning is not jittered.
pub fn quiet_batch<B: Backend>(
    config: &Config,
    geometry: &ModelGeometry,
    device: &B::Device,
) -> VBatch<B> {
    let mels = Tensor::<B, 3>::random(
        [1, config.dataset.n_mel_chan, geometry.enc_in_mel_len],
        Distribution::Normal(0.0, 1.0),
        device,
    );
    let wav = Tensor::<B, 2, Int>::zeros([1, geometry.enc_in_len], device)
        .add_scalar(config.decoder.n_quant as i64 / 2);
    let voice = Tensor::<B, 1, Int>::zeros([1], device);
    let jitter = identity_jitter::<B>(1, geometry.embed_len, device);
    VBatch::from_windows(mels, wav, voice, jitter, geometry).expect("batch matches geometry")
}
