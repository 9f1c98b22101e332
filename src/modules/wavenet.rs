//! WaveNet decoder conditioned on upsampled local features and a speaker
//! embedding.
//!
//! The local-conditioning path is `lc_conv` followed by the transposed
//! convolution upsamplers; its output is trimmed to the decoder input window
//! and then consumed by a stack of gated residual causal convolutions (GRCC).
//! Every GRCC layer shortens its input by `(kernel - 1) * dilation`, so each
//! layer reads the right-aligned tail of the conditioning and residual
//! tensors.

use crate::config::DecoderConfig;
use crate::error::{Error, Result};
use crate::geometry::{Anchor, Trim, VcGraph, VcHandle, Waypoint, Waypoints};
use crate::modules::conv::{Conv1dOp, ConvConfig, ConvTranspose1dOp};
use crate::modules::init::ParamInit;
use crate::modules::ops::{to_vec, to_vec_int};
use crate::modules::preprocess::one_hot;
use crate::perf::{self, Metric};
use crate::weights::StateDict;
use burn::tensor::{
    activation::{relu, sigmoid, softmax, tanh},
    backend::Backend,
    Int, Tensor, TensorData,
};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;

/// One gated residual causal convolution layer.
#[derive(Debug, Clone)]
pub struct GrccLayer<B: Backend> {
    pub filter: Conv1dOp<B>,
    pub gate: Conv1dOp<B>,
    pub lc_filter: Conv1dOp<B>,
    pub lc_gate: Conv1dOp<B>,
    pub gc_filter: Conv1dOp<B>,
    pub gc_gate: Conv1dOp<B>,
    pub res: Conv1dOp<B>,
    pub skip: Conv1dOp<B>,
}

/// Outputs of one [`GrccLayer`], all aligned to the layer's output window.
struct GrccStep<B: Backend> {
    residual: Tensor<B, 3>,
    lc: Tensor<B, 3>,
    skip: Tensor<B, 3>,
}

impl<B: Backend> GrccLayer<B> {
    fn init(config: &DecoderConfig, dilation: usize, init: &mut ParamInit, device: &B::Device) -> Self {
        let dilated = ConvConfig::new(config.kernel_size, 1, dilation);
        Self {
            filter: Conv1dOp::init(config.n_res, config.n_dil, dilated, init, device),
            gate: Conv1dOp::init(config.n_res, config.n_dil, dilated, init, device),
            lc_filter: Conv1dOp::pointwise(config.n_lc_out, config.n_dil, init, device),
            lc_gate: Conv1dOp::pointwise(config.n_lc_out, config.n_dil, init, device),
            gc_filter: Conv1dOp::pointwise(config.n_gc, config.n_dil, init, device),
            gc_gate: Conv1dOp::pointwise(config.n_gc, config.n_dil, init, device),
            res: Conv1dOp::pointwise(config.n_dil, config.n_res, init, device),
            skip: Conv1dOp::pointwise(config.n_dil, config.n_skip, init, device),
        }
    }

    /// `x` and `lc` share one time axis; `gc` is `(B, n_gc, 1)`.
    fn forward(&self, x: Tensor<B, 3>, lc: Tensor<B, 3>, gc: Tensor<B, 3>) -> GrccStep<B> {
        let len = x.dims()[2];
        let filt = self.filter.forward(x.clone());
        let out_len = filt.dims()[2];
        let offset = len - out_len;
        let lc = lc.narrow(2, offset, out_len);

        let filt = filt
            + self.lc_filter.forward(lc.clone())
            + self.gc_filter.forward(gc.clone()).repeat_dim(2, out_len);
        let gate = self.gate.forward(x.clone())
            + self.lc_gate.forward(lc.clone())
            + self.gc_gate.forward(gc).repeat_dim(2, out_len);
        let z = tanh(filt) * sigmoid(gate);

        GrccStep {
            residual: x.narrow(2, offset, out_len) + self.res.forward(z.clone()),
            lc,
            skip: self.skip.forward(z),
        }
    }

    fn export(&self, prefix: &str, dict: &mut StateDict) {
        self.filter.export(&format!("{prefix}.filter"), dict);
        self.gate.export(&format!("{prefix}.gate"), dict);
        self.lc_filter.export(&format!("{prefix}.lc_filter"), dict);
        self.lc_gate.export(&format!("{prefix}.lc_gate"), dict);
        self.gc_filter.export(&format!("{prefix}.gc_filter"), dict);
        self.gc_gate.export(&format!("{prefix}.gc_gate"), dict);
        self.res.export(&format!("{prefix}.res"), dict);
        self.skip.export(&format!("{prefix}.skip"), dict);
    }

    fn import(&mut self, prefix: &str, dict: &mut StateDict, device: &B::Device) -> Result<()> {
        self.filter.import(&format!("{prefix}.filter"), dict, device)?;
        self.gate.import(&format!("{prefix}.gate"), dict, device)?;
        self.lc_filter.import(&format!("{prefix}.lc_filter"), dict, device)?;
        self.lc_gate.import(&format!("{prefix}.lc_gate"), dict, device)?;
        self.gc_filter.import(&format!("{prefix}.gc_filter"), dict, device)?;
        self.gc_gate.import(&format!("{prefix}.gc_gate"), dict, device)?;
        self.res.import(&format!("{prefix}.res"), dict, device)?;
        self.skip.import(&format!("{prefix}.skip"), dict, device)
    }
}

/// WaveNet decoder.
#[derive(Debug, Clone)]
pub struct WaveNet<B: Backend> {
    pub n_quant: usize,
    pub lc_conv: Conv1dOp<B>,
    pub upsamples: Vec<ConvTranspose1dOp<B>>,
    /// Pointwise embedding of the one-hot input into residual channels.
    pub base: Conv1dOp<B>,
    /// Speaker table `(n_speakers, n_gc)`.
    pub speaker_emb: Tensor<B, 2>,
    pub layers: Vec<GrccLayer<B>>,
    pub post1: Conv1dOp<B>,
    pub post2: Conv1dOp<B>,
    /// Dilation of each GRCC layer.
    dilations: Vec<usize>,
    kernel_size: usize,
    vc: Waypoints,
}

impl<B: Backend> WaveNet<B> {
    /// Build the decoder for `n_lc_in` conditioning channels and register its
    /// chain in `graph` below `parent`.
    pub fn new(
        config: &DecoderConfig,
        n_lc_in: usize,
        graph: &mut VcGraph,
        parent: Option<VcHandle>,
        init: &mut ParamInit,
        device: &B::Device,
    ) -> Result<Self> {
        if config.n_blocks == 0 || config.n_block_layers == 0 {
            return Err(Error::config("decoder needs at least one dilated layer"));
        }
        if config.n_speakers == 0 {
            return Err(Error::config("decoder needs at least one speaker"));
        }
        if config.kernel_size < 2 {
            return Err(Error::config("dilated kernel_size must be at least 2"));
        }
        let mut vc = Waypoints::default();

        let lc_conv = Conv1dOp::init(
            n_lc_in,
            config.n_lc_out,
            ConvConfig::new(config.lc_conv_kernel_size, 1, 1),
            init,
            device,
        );
        let mut prev = graph.push(lc_conv.vc_spec("lc_conv", Anchor::Centered), parent)?;
        vc.insert(Waypoint::Beg, prev);

        let mut upsamples = Vec::with_capacity(config.upsample.len());
        for (i, up) in config.upsample.iter().enumerate() {
            let op = ConvTranspose1dOp::init(
                config.n_lc_out,
                config.n_lc_out,
                ConvConfig::new(up.kernel_size, up.stride, 1),
                init,
                device,
            );
            prev = graph.push(op.vc_spec(format!("upsample_{i}"), Anchor::Centered), Some(prev))?;
            upsamples.push(op);
        }
        vc.insert(Waypoint::LastUpsample, prev);

        let base = Conv1dOp::pointwise(config.n_quant, config.n_res, init, device);
        let speaker_emb = init.normal([config.n_speakers, config.n_gc], 1.0, device);

        let mut layers = Vec::new();
        let mut dilations = Vec::new();
        for b in 0..config.n_blocks {
            for l in 0..config.n_block_layers {
                let dilation = 1usize << l;
                let layer = GrccLayer::init(config, dilation, init, device);
                let handle = graph.push(
                    layer.filter.vc_spec(format!("grcc_{b}_{l}"), Anchor::Causal),
                    Some(prev),
                )?;
                if layers.is_empty() {
                    vc.insert(Waypoint::BegGrcc, handle);
                }
                prev = handle;
                layers.push(layer);
                dilations.push(dilation);
            }
        }
        vc.insert(Waypoint::EndGrcc, prev);
        vc.insert(Waypoint::End, prev);

        Ok(Self {
            n_quant: config.n_quant,
            lc_conv,
            upsamples,
            base,
            speaker_emb,
            post1: Conv1dOp::pointwise(config.n_skip, config.n_post, init, device),
            post2: Conv1dOp::pointwise(config.n_post, config.n_quant, init, device),
            layers,
            dilations,
            kernel_size: config.kernel_size,
            vc,
        })
    }

    pub fn vc(&self) -> &Waypoints {
        &self.vc
    }

    /// Samples of history each output depends on, including itself.
    pub fn receptive_field(&self) -> usize {
        1 + self
            .dilations
            .iter()
            .map(|d| (self.kernel_size - 1) * d)
            .sum::<usize>()
    }

    /// Jitter, convolve and upsample sparse conditioning, then trim it to the
    /// decoder input window.
    pub fn condition(
        &self,
        lc_sparse: Tensor<B, 3>,
        jitter_index: Option<Tensor<B, 2, Int>>,
        trim_ups_out: Trim,
    ) -> Tensor<B, 3> {
        let lc = match jitter_index {
            Some(index) => {
                let channels = lc_sparse.dims()[1];
                let index = index.unsqueeze_dim::<3>(1).repeat_dim(1, channels);
                lc_sparse.gather(2, index)
            }
            None => lc_sparse,
        };
        let lc = self.lc_conv.forward(lc);
        let lc = self.upsamples.iter().fold(lc, |x, up| up.forward(x));
        trim_ups_out.apply(lc, 2)
    }

    /// Speaker embeddings `(B, n_gc, 1)` for `voice_inds (B)`.
    pub fn global_condition(&self, voice_inds: Tensor<B, 1, Int>) -> Tensor<B, 3> {
        self.speaker_emb
            .clone()
            .select(0, voice_inds)
            .unsqueeze_dim::<3>(2)
    }

    /// Logits `(B, n_quant, L - receptive_field + 1)` from one-hot input and
    /// conditioning of length `L`.
    pub fn stack(&self, wav_onehot: Tensor<B, 3>, lc: Tensor<B, 3>, gc: Tensor<B, 3>) -> Tensor<B, 3> {
        let mut x = self.base.forward(wav_onehot);
        let mut lc = lc;
        let mut skips = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            let step = layer.forward(x, lc, gc.clone());
            x = step.residual;
            lc = step.lc;
            skips.push(step.skip);
        }
        let out_len = x.dims()[2];
        let skip_sum = skips
            .into_iter()
            .map(|s| {
                let len = s.dims()[2];
                s.narrow(2, len - out_len, out_len)
            })
            .reduce(|acc, s| acc + s)
            .unwrap_or_else(|| x.zeros_like());
        let hidden = relu(self.post1.forward(relu(skip_sum)));
        self.post2.forward(hidden)
    }

    /// Teacher-forced decoding of a whole window.
    pub fn forward(
        &self,
        wav_onehot: Tensor<B, 3>,
        lc_sparse: Tensor<B, 3>,
        voice_inds: Tensor<B, 1, Int>,
        jitter_index: Option<Tensor<B, 2, Int>>,
        trim_ups_out: Trim,
    ) -> Tensor<B, 3> {
        let lc = self.condition(lc_sparse, jitter_index, trim_ups_out);
        let gc = self.global_condition(voice_inds);
        self.stack(wav_onehot, lc, gc)
    }

    /// Autoregressively sample `L - receptive_field` new levels per replica.
    ///
    /// The first `receptive_field` levels of each row of `wav_dec (B, L)` seed
    /// the history. Rows of the result are ordered replica-major: row
    /// `r * B + b` is replica `r` of batch item `b`.
    pub fn sample(
        &self,
        wav_dec: Tensor<B, 2, Int>,
        lc_sparse: Tensor<B, 3>,
        voice_inds: Tensor<B, 1, Int>,
        trim_ups_out: Trim,
        n_replicas: usize,
        rng: &mut StdRng,
    ) -> Result<Tensor<B, 2, Int>> {
        let _span = perf::span(Metric::WavenetSample);
        let [batch, len] = wav_dec.dims();
        let receptive = self.receptive_field();
        if len <= receptive || n_replicas == 0 {
            return Err(Error::shape(format!(
                "cannot sample from a window of {len} with receptive field {receptive} and {n_replicas} replicas"
            )));
        }
        let device = wav_dec.device();
        let rows = batch * n_replicas;
        let lc = self
            .condition(lc_sparse, None, trim_ups_out)
            .repeat_dim(0, n_replicas);
        let gc = self.global_condition(voice_inds.repeat_dim(0, n_replicas));

        let seed = to_vec_int(wav_dec.repeat_dim(0, n_replicas));
        let mut history: Vec<Vec<i64>> = seed
            .chunks(len)
            .map(|row| row[..receptive].to_vec())
            .collect();

        for step in 0..(len - receptive) {
            let window: Vec<i64> = history
                .iter()
                .flat_map(|row| row[step..step + receptive].iter().copied())
                .collect();
            let window = Tensor::<B, 2, Int>::from_data(
                TensorData::new(window, [rows, receptive]),
                &device,
            );
            let logits = self.stack(
                one_hot(window, self.n_quant)?,
                lc.clone().narrow(2, step, receptive),
                gc.clone(),
            );
            let probs = to_vec(softmax(logits, 1));
            for (row, dist) in history.iter_mut().zip(probs.chunks(self.n_quant)) {
                row.push(sample_categorical(dist, rng)?);
            }
        }
        perf::add_count(Metric::SampledSteps, ((len - receptive) * rows) as u64);

        let generated: Vec<i64> = history
            .into_iter()
            .flat_map(|row| row.into_iter().skip(receptive))
            .collect();
        Ok(Tensor::from_data(
            TensorData::new(generated, [rows, len - receptive]),
            &device,
        ))
    }

    pub fn export(&self, prefix: &str, dict: &mut StateDict) {
        self.lc_conv.export(&format!("{prefix}.lc_conv"), dict);
        for (i, up) in self.upsamples.iter().enumerate() {
            up.export(&format!("{prefix}.upsample.{i}"), dict);
        }
        self.base.export(&format!("{prefix}.base"), dict);
        dict.insert(format!("{prefix}.speaker_emb"), &self.speaker_emb);
        for (i, layer) in self.layers.iter().enumerate() {
            layer.export(&format!("{prefix}.grcc.{i}"), dict);
        }
        self.post1.export(&format!("{prefix}.post1"), dict);
        self.post2.export(&format!("{prefix}.post2"), dict);
    }

    pub fn import(&mut self, prefix: &str, dict: &mut StateDict, device: &B::Device) -> Result<()> {
        self.lc_conv.import(&format!("{prefix}.lc_conv"), dict, device)?;
        for (i, up) in self.upsamples.iter_mut().enumerate() {
            up.import(&format!("{prefix}.upsample.{i}"), dict, device)?;
        }
        self.base.import(&format!("{prefix}.base"), dict, device)?;
        self.speaker_emb = dict.take(
            &format!("{prefix}.speaker_emb"),
            self.speaker_emb.dims(),
            device,
        )?;
        for (i, layer) in self.layers.iter_mut().enumerate() {
            layer.import(&format!("{prefix}.grcc.{i}"), dict, device)?;
        }
        self.post1.import(&format!("{prefix}.post1"), dict, device)?;
        self.post2.import(&format!("{prefix}.post2"), dict, device)
    }
}

/// Draw one level from an unnormalized distribution.
///
/// NaN, negative or all-zero weights are rejected rather than sampled.
fn sample_categorical(probs: &[f32], rng: &mut StdRng) -> Result<i64> {
    let dist = WeightedIndex::new(probs.iter().copied())
        .map_err(|e| Error::shape(format!("cannot sample from {probs:?}: {e}")))?;
    Ok(dist.sample(rng) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpsampleConfig;
    use crate::geometry::{input_range, output_range, unit_window};
    use burn_ndarray::{NdArray, NdArrayDevice};
    use rand::SeedableRng;

    type TestBackend = NdArray<f32>;

    fn config() -> DecoderConfig {
        DecoderConfig {
            n_quant: 8,
            n_res: 4,
            n_dil: 4,
            n_skip: 4,
            n_post: 4,
            n_gc: 2,
            n_lc_out: 3,
            lc_conv_kernel_size: 3,
            upsample: vec![UpsampleConfig {
                kernel_size: 4,
                stride: 2,
            }],
            n_blocks: 1,
            n_block_layers: 3,
            kernel_size: 2,
            n_speakers: 2,
        }
    }

    #[test]
    fn receptive_field_counts_dilations() {
        let device = NdArrayDevice::default();
        let mut graph = VcGraph::new();
        let net = WaveNet::<TestBackend>::new(&config(), 5, &mut graph, None, &mut ParamInit::new(0), &device)
            .unwrap();
        assert_eq!(net.receptive_field(), 1 + 1 + 2 + 4);
        assert_eq!(graph.len(), 1 + 1 + 3);
    }

    #[test]
    fn forward_lengths_agree_with_geometry() {
        let device = NdArrayDevice::default();
        let mut graph = VcGraph::new();
        let net = WaveNet::<TestBackend>::new(&config(), 5, &mut graph, None, &mut ParamInit::new(0), &device)
            .unwrap();
        let vc = net.vc();
        let (beg, last_up, beg_grcc, end) = (
            vc.get(Waypoint::Beg).unwrap(),
            vc.get(Waypoint::LastUpsample).unwrap(),
            vc.get(Waypoint::BegGrcc).unwrap(),
            vc.get(Waypoint::End).unwrap(),
        );
        let window = unit_window(6).unwrap();
        let di = input_range(&graph, beg_grcc, end, &window).unwrap();
        let li = input_range(&graph, beg, end, &window).unwrap();
        let uo = output_range(&graph, beg, last_up, &li).unwrap();
        let trim = Trim::between(&uo, &di).unwrap();
        assert_eq!(di.sub_length(), 6 + 7);

        let lc = Tensor::<TestBackend, 3>::zeros([2, 5, li.sub_length() as usize], &device);
        let wav = Tensor::<TestBackend, 3>::zeros([2, 8, di.sub_length() as usize], &device);
        let voice = Tensor::<TestBackend, 1, Int>::from_ints([0, 1], &device);
        let out = net.forward(wav, lc, voice, None, trim);
        assert_eq!(out.dims(), [2, 8, 6]);
    }

    #[test]
    fn sampling_is_seeded_and_in_range() {
        let device = NdArrayDevice::default();
        let mut graph = VcGraph::new();
        let net = WaveNet::<TestBackend>::new(&config(), 5, &mut graph, None, &mut ParamInit::new(0), &device)
            .unwrap();
        let vc = net.vc();
        let (beg, last_up, beg_grcc, end) = (
            vc.get(Waypoint::Beg).unwrap(),
            vc.get(Waypoint::LastUpsample).unwrap(),
            vc.get(Waypoint::BegGrcc).unwrap(),
            vc.get(Waypoint::End).unwrap(),
        );
        let window = unit_window(4).unwrap();
        let di = input_range(&graph, beg_grcc, end, &window).unwrap();
        let li = input_range(&graph, beg, end, &window).unwrap();
        let uo = output_range(&graph, beg, last_up, &li).unwrap();
        let trim = Trim::between(&uo, &di).unwrap();
        let dec_len = di.sub_length() as usize;

        let run = |seed: u64| {
            let lc = Tensor::<TestBackend, 3>::ones([1, 5, li.sub_length() as usize], &device);
            let wav = Tensor::<TestBackend, 2, Int>::zeros([1, dec_len], &device);
            let voice = Tensor::<TestBackend, 1, Int>::from_ints([1], &device);
            let mut rng = StdRng::seed_from_u64(seed);
            to_vec_int(net.sample(wav, lc, voice, trim, 2, &mut rng).unwrap())
        };
        let a = run(9);
        assert_eq!(a.len(), 2 * 3);
        assert!(a.iter().all(|&q| (0..8).contains(&q)));
        assert_eq!(a, run(9));
    }

    #[test]
    fn categorical_respects_point_mass() {
        let mut rng = StdRng::seed_from_u64(0);
        for _ in 0..10 {
            assert_eq!(sample_categorical(&[0.0, 0.0, 1.0], &mut rng).unwrap(), 2);
        }
    }

    #[test]
    fn categorical_rejects_degenerate_weights() {
        let mut rng = StdRng::seed_from_u64(0);
        for probs in [[f32::NAN; 3], [0.0; 3], [0.5, -0.1, 0.6]] {
            let err = sample_categorical(&probs, &mut rng).unwrap_err();
            assert!(matches!(err, Error::Shape(_)), "{probs:?}: {err}");
        }
    }

    #[test]
    fn sampling_stops_on_non_finite_logits() {
        let device = NdArrayDevice::default();
        let mut graph = VcGraph::new();
        let mut net = WaveNet::<TestBackend>::new(&config(), 5, &mut graph, None, &mut ParamInit::new(0), &device)
            .unwrap();
        net.post2.bias = Some(Tensor::full([8], f32::NAN, &device));
        let vc = net.vc();
        let (beg, last_up, beg_grcc, end) = (
            vc.get(Waypoint::Beg).unwrap(),
            vc.get(Waypoint::LastUpsample).unwrap(),
            vc.get(Waypoint::BegGrcc).unwrap(),
            vc.get(Waypoint::End).unwrap(),
        );
        let window = unit_window(2).unwrap();
        let di = input_range(&graph, beg_grcc, end, &window).unwrap();
        let li = input_range(&graph, beg, end, &window).unwrap();
        let uo = output_range(&graph, beg, last_up, &li).unwrap();
        let trim = Trim::between(&uo, &di).unwrap();

        let lc = Tensor::<TestBackend, 3>::ones([1, 5, li.sub_length() as usize], &device);
        let wav = Tensor::<TestBackend, 2, Int>::zeros([1, di.sub_length() as usize], &device);
        let voice = Tensor::<TestBackend, 1, Int>::from_ints([0], &device);
        let mut rng = StdRng::seed_from_u64(1);
        let result = net.sample(wav, lc, voice, trim, 1, &mut rng);
        assert!(matches!(result, Err(Error::Shape(_))));
    }
}
