//! Dataset description, batch layout and time jitter.

use crate::config::DatasetConfig;
use crate::error::{Error, Result};
use crate::geometry::VcSpec;
use crate::model::ModelGeometry;
use burn::tensor::{backend::Backend, Int, Tensor, TensorData};
use rand::rngs::StdRng;
use rand::Rng;

/// Static facts a model needs about its training data.
pub trait Dataset {
    fn num_speakers(&self) -> usize;
    fn num_mel_chan(&self) -> usize;
    /// Number of waveform samples predicted per batch window.
    fn window_batch_size(&self) -> usize;
    /// Descriptor of the MFCC extraction, waveform samples to frames.
    fn mfcc_vc(&self) -> VcSpec;
}

impl Dataset for DatasetConfig {
    fn num_speakers(&self) -> usize {
        self.n_speakers
    }

    fn num_mel_chan(&self) -> usize {
        self.n_mel_chan
    }

    fn window_batch_size(&self) -> usize {
        self.window_batch_size
    }

    fn mfcc_vc(&self) -> VcSpec {
        VcSpec::conv(
            "mfcc",
            self.mfcc.window_size as i64,
            self.mfcc.hop_size as i64,
            1,
        )
    }
}

/// One batch of windows, sized by a resolved [`ModelGeometry`].
#[derive(Debug, Clone)]
pub struct VBatch<B: Backend> {
    /// MFCC frames `(B, n_mel, enc_in_mel_len)`.
    pub mel_enc_input: Tensor<B, 3>,
    /// Quantized samples `(B, enc_in_len)`.
    pub wav_enc_input: Tensor<B, 2, Int>,
    /// Decoder slice of `wav_enc_input`, `(B, dec_in_len)`.
    pub wav_dec_input: Tensor<B, 2, Int>,
    /// Speaker ids `(B)`.
    pub voice_index: Tensor<B, 1, Int>,
    /// Conditioning frame gather indices `(B, embed_len)`.
    pub jitter_index: Tensor<B, 2, Int>,
}

impl<B: Backend> VBatch<B> {
    /// Assemble a batch, cutting the decoder input out of the encoder input.
    pub fn from_windows(
        mel_enc_input: Tensor<B, 3>,
        wav_enc_input: Tensor<B, 2, Int>,
        voice_index: Tensor<B, 1, Int>,
        jitter_index: Tensor<B, 2, Int>,
        geometry: &ModelGeometry,
    ) -> Result<Self> {
        let batch = wav_enc_input.dims()[0];
        expect_len("mel_enc_input", mel_enc_input.dims()[2], geometry.enc_in_mel_len)?;
        expect_len("wav_enc_input", wav_enc_input.dims()[1], geometry.enc_in_len)?;
        expect_len("jitter_index", jitter_index.dims()[1], geometry.embed_len)?;
        if mel_enc_input.dims()[0] != batch
            || voice_index.dims()[0] != batch
            || jitter_index.dims()[0] != batch
        {
            return Err(Error::shape(format!(
                "batch sizes disagree: mel {}, wav {batch}, voice {}, jitter {}",
                mel_enc_input.dims()[0],
                voice_index.dims()[0],
                jitter_index.dims()[0]
            )));
        }
        let wav_dec_input = geometry.trim_dec_in.apply(wav_enc_input.clone(), 1);
        Ok(Self {
            mel_enc_input,
            wav_enc_input,
            wav_dec_input,
            voice_index,
            jitter_index,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.wav_enc_input.dims()[0]
    }
}

pub(crate) fn expect_len(what: &str, found: usize, expected: usize) -> Result<()> {
    if found == expected {
        Ok(())
    } else {
        Err(Error::shape(format!(
            "{what} has length {found}, geometry requires {expected}"
        )))
    }
}

/// Time-jitter gather indices `(batch, len)`.
///
/// Each step is replaced by its left or right neighbor with total
/// `probability`, split evenly, and clamped at the window edges.
pub fn jitter_indices<B: Backend>(
    batch: usize,
    len: usize,
    probability: f32,
    rng: &mut StdRng,
    device: &B::Device,
) -> Tensor<B, 2, Int> {
    let last = len.saturating_sub(1) as i64;
    let mut values = Vec::with_capacity(batch * len);
    for _ in 0..batch {
        for t in 0..len as i64 {
            let r: f32 = rng.gen();
            let shifted = if r < probability / 2.0 {
                t - 1
            } else if r < probability {
                t + 1
            } else {
                t
            };
            values.push(shifted.clamp(0, last));
        }
    }
    Tensor::from_data(TensorData::new(values, [batch, len]), device)
}

/// Indices that leave the conditioning untouched.
pub fn identity_jitter<B: Backend>(batch: usize, len: usize, device: &B::Device) -> Tensor<B, 2, Int> {
    let values: Vec<i64> = (0..batch).flat_map(|_| 0..len as i64).collect();
    Tensor::from_data(TensorData::new(values, [batch, len]), device)
}
