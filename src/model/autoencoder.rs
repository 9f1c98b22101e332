//! MFCC encoder, bottleneck and WaveNet decoder assembled into one model.

use super::{
    prediction_pair, read_checkpoint, write_checkpoint, Diagnostics, ForwardOutput, RunOutput,
};
use crate::bottleneck::kmeans::{kmeans, KmeansOptions};
use crate::bottleneck::{
    Bottleneck, BottleneckAux, BottleneckKind, BottleneckOutput, LossOutput, Objective,
};
use crate::config::{BottleneckConfig, Config, DecoderConfig, EncoderConfig};
use crate::data::{expect_len, Dataset, VBatch};
use crate::error::{Error, Result};
use crate::geometry::{VcGraph, VcHandle, Waypoint};
use crate::model::geometry::{GeometryAnchors, ModelGeometry};
use crate::modules::encoder::Encoder;
use crate::modules::init::ParamInit;
use crate::modules::ops::to_vec;
use crate::modules::preprocess::PreProcess;
use crate::modules::wavenet::WaveNet;
use crate::perf::{self, Metric};
use crate::weights::StateDict;
use burn::tensor::{backend::Backend, Int, Tensor, TensorData};
use ndarray::{Array2, ArrayView1};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

const CHECKPOINT_KIND: &str = "autoencoder";

/// Everything needed to rebuild an [`AutoEncoder`] with identical parameter
/// shapes and initialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitArgs {
    pub encoder: EncoderConfig,
    pub bottleneck: BottleneckConfig,
    /// Decoder configuration with `n_speakers` taken from the dataset.
    pub decoder: DecoderConfig,
    pub n_mel_chan: usize,
    pub training: bool,
    pub seed: u64,
}

/// Persisted form of an [`AutoEncoder`]: its construction arguments only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoEncoderState {
    pub init_args: InitArgs,
}

/// WaveNet autoencoder conditioned on MFCC encodings.
#[derive(Debug, Clone)]
pub struct AutoEncoder<B: Backend> {
    init_args: InitArgs,
    kind: BottleneckKind,
    objective: Objective,
    graph: VcGraph,
    pub encoder: Encoder<B>,
    pub bottleneck: Bottleneck<B>,
    pub decoder: WaveNet<B>,
    preprocess: PreProcess,
    mfcc: Option<VcHandle>,
    geometry: Option<ModelGeometry>,
    device: B::Device,
}

impl<B: Backend> AutoEncoder<B> {
    /// Capture construction arguments from `config` and `dataset`, then build.
    pub fn new(config: &Config, dataset: &impl Dataset, device: &B::Device) -> Result<Self> {
        let mut decoder = config.decoder.clone();
        decoder.n_speakers = dataset.num_speakers();
        let init_args = InitArgs {
            encoder: config.encoder.clone(),
            bottleneck: config.bottleneck.clone(),
            decoder,
            n_mel_chan: dataset.num_mel_chan(),
            training: config.training,
            seed: config.seed,
        };
        Self::from_init_args(init_args, device)
    }

    /// Build every component and link their geometry chains.
    pub fn from_init_args(init_args: InitArgs, device: &B::Device) -> Result<Self> {
        let _span = perf::span(Metric::ModelAssemble);
        let kind = BottleneckKind::from_config(&init_args.bottleneck)?;
        let mut init = ParamInit::new(init_args.seed);
        let mut graph = VcGraph::new();

        let encoder = Encoder::new(
            init_args.n_mel_chan,
            &init_args.encoder,
            &mut graph,
            None,
            &mut init,
            device,
        )?;
        let bottleneck = Bottleneck::new(&kind, init_args.encoder.n_out, &mut init, device);
        let end_enc = encoder.vc().get(Waypoint::End)?;
        let decoder = WaveNet::new(
            &init_args.decoder,
            kind.n_out(),
            &mut graph,
            Some(end_enc),
            &mut init,
            device,
        )?;
        info!(
            bottleneck = kind.name(),
            nodes = graph.len(),
            seed = init_args.seed,
            "assembled autoencoder"
        );

        Ok(Self {
            objective: kind.objective(),
            kind,
            graph,
            encoder,
            bottleneck,
            preprocess: PreProcess::new(init_args.decoder.n_quant),
            decoder,
            mfcc: None,
            geometry: None,
            device: device.clone(),
            init_args,
        })
    }

    /// Attach the dataset's MFCC stage above the encoder and resolve geometry
    /// for its window size.
    pub fn post_init(&mut self, dataset: &impl Dataset) -> Result<ModelGeometry> {
        if self.mfcc.is_some() {
            return Err(Error::usage("post_init has already attached an MFCC stage"));
        }
        let beg = self.encoder.vc().get(Waypoint::Beg)?;
        let mfcc = self.graph.push(dataset.mfcc_vc(), None)?;
        self.graph.set_parent(beg, mfcc)?;
        self.mfcc = Some(mfcc);
        let geometry = self.init_geometry(dataset.window_batch_size())?;
        self.print_geometry()?;
        Ok(geometry)
    }

    fn anchors(&self) -> Result<GeometryAnchors> {
        let mfcc = self
            .mfcc
            .ok_or_else(|| Error::usage("geometry needs post_init to attach an MFCC stage"))?;
        let dec = self.decoder.vc();
        Ok(GeometryAnchors {
            mfcc,
            end_enc: self.encoder.vc().get(Waypoint::End)?,
            last_upsample: dec.get(Waypoint::LastUpsample)?,
            beg_grcc: dec.get(Waypoint::BegGrcc)?,
            end_grcc: dec.get(Waypoint::EndGrcc)?,
        })
    }

    /// Resolve batch lengths and trims for `window` predicted samples.
    pub fn init_geometry(&mut self, window: usize) -> Result<ModelGeometry> {
        let _span = perf::span(Metric::ModelInitGeometry);
        let geometry = ModelGeometry::resolve(&self.graph, &self.anchors()?, window)?;
        info!(
            window,
            enc_in_len = geometry.enc_in_len,
            dec_in_len = geometry.dec_in_len,
            embed_len = geometry.embed_len,
            "resolved autoencoder geometry"
        );
        self.geometry = Some(geometry);
        Ok(geometry)
    }

    pub fn geometry(&self) -> Result<&ModelGeometry> {
        self.geometry
            .as_ref()
            .ok_or_else(|| Error::usage("geometry has not been resolved; call post_init first"))
    }

    pub fn graph(&self) -> &VcGraph {
        &self.graph
    }

    pub fn init_args(&self) -> &InitArgs {
        &self.init_args
    }

    pub fn kind(&self) -> &BottleneckKind {
        &self.kind
    }

    pub fn objective(&self) -> Objective {
        self.objective
    }

    pub fn preprocess(&self) -> &PreProcess {
        &self.preprocess
    }

    /// One line per chain node from the root, then the resolved geometry.
    pub fn print_geometry(&self) -> Result<String> {
        let start = match self.mfcc {
            Some(mfcc) => mfcc,
            None => self.encoder.vc().get(Waypoint::Beg)?,
        };
        let root = self.graph.root(start)?;
        let mut lines: Vec<String> = self
            .graph
            .chain_from(root)
            .map(|(_, node)| node.to_string())
            .collect();
        lines.extend(self.geometry.as_ref().map(ToString::to_string));
        let out = lines.join("\n") + "\n";
        info!("geometry\n{out}");
        Ok(out)
    }

    pub fn state(&self) -> AutoEncoderState {
        AutoEncoderState {
            init_args: self.init_args.clone(),
        }
    }

    /// Rebuild from persisted state; geometry must be re-resolved with
    /// [`AutoEncoder::post_init`].
    pub fn from_state(state: AutoEncoderState, device: &B::Device) -> Result<Self> {
        Self::from_init_args(state.init_args, device)
    }

    /// Encoder followed by the bottleneck.
    pub fn encode(&self, mels: Tensor<B, 3>) -> BottleneckOutput<B> {
        let encoding = {
            let _span = perf::span(Metric::EncoderForward);
            self.encoder.forward(mels)
        };
        let _span = perf::span(Metric::BottleneckForward);
        self.bottleneck.forward(encoding, self.init_args.training)
    }

    /// Decoder logits for the resolved window given a bottleneck code.
    pub fn decode(
        &self,
        wav_onehot_dec: Tensor<B, 3>,
        code: Tensor<B, 3>,
        voice_inds: Tensor<B, 1, Int>,
        jitter_index: Tensor<B, 2, Int>,
    ) -> Result<Tensor<B, 3>> {
        let trim = self.geometry()?.trim_ups_out;
        let _span = perf::span(Metric::DecoderForward);
        Ok(self
            .decoder
            .forward(wav_onehot_dec, code, voice_inds, Some(jitter_index), trim))
    }

    pub fn forward(
        &self,
        mels: Tensor<B, 3>,
        wav_onehot_dec: Tensor<B, 3>,
        voice_inds: Tensor<B, 1, Int>,
        jitter_index: Tensor<B, 2, Int>,
    ) -> Result<ForwardOutput<B>> {
        self.geometry()?;
        let bottleneck = self.encode(mels);
        let quant = self.decode(wav_onehot_dec, bottleneck.code.clone(), voice_inds, jitter_index)?;
        Ok(ForwardOutput { quant, bottleneck })
    }

    /// Check a batch against the resolved geometry.
    pub fn check_batch(&self, batch: &VBatch<B>) -> Result<ModelGeometry> {
        let geometry = *self.geometry()?;
        expect_len("mel_enc_input", batch.mel_enc_input.dims()[2], geometry.enc_in_mel_len)?;
        expect_len("wav_dec_input", batch.wav_dec_input.dims()[1], geometry.dec_in_len)?;
        expect_len("jitter_index", batch.jitter_index.dims()[1], geometry.embed_len)?;
        expect_len(
            "mel channels",
            batch.mel_enc_input.dims()[1],
            self.init_args.n_mel_chan,
        )?;
        Ok(geometry)
    }

    /// `quant[..., :-1]` and the levels it predicts.
    pub fn prediction_pair(
        &self,
        quant: Tensor<B, 3>,
        batch: &VBatch<B>,
    ) -> Result<(Tensor<B, 3>, Tensor<B, 2, Int>)> {
        prediction_pair(quant, batch.wav_dec_input.clone(), self.geometry()?)
    }

    /// Forward one batch and score it. Updates the EMA codebook when
    /// training a `vqvae-ema` bottleneck.
    pub fn run(&mut self, batch: &VBatch<B>) -> Result<RunOutput<B>> {
        let _span = perf::span(Metric::ModelRun);
        self.check_batch(batch)?;
        let wav_onehot_dec = self.preprocess.forward(batch.wav_dec_input.clone())?;
        let out = self.forward(
            batch.mel_enc_input.clone(),
            wav_onehot_dec.clone(),
            batch.voice_index.clone(),
            batch.jitter_index.clone(),
        )?;
        let (pred, target) = self.prediction_pair(out.quant, batch)?;
        let LossOutput { loss, metrics } =
            self.objective
                .loss(pred.clone(), target.clone(), &out.bottleneck)?;

        if self.init_args.training {
            if let (Some(vq), BottleneckAux::Quantized { ze, indices, .. }) =
                (self.bottleneck.as_vq_mut(), &out.bottleneck.aux)
            {
                vq.ema_update(ze.clone(), indices.clone());
            }
        }
        perf::add_count(Metric::BatchesRun, 1);

        Ok(RunOutput {
            pred,
            target,
            loss,
            metrics,
            diagnostics: Diagnostics {
                wav_onehot_dec,
                bottleneck: Some(out.bottleneck),
            },
        })
    }

    /// Replace the VQ codebook with k-means centroids of `n_samples`
    /// pre-quantization encodings drawn from `source`.
    pub fn init_codebook<I>(&mut self, source: &mut I, n_samples: usize) -> Result<()>
    where
        I: Iterator<Item = VBatch<B>>,
    {
        let _span = perf::span(Metric::CodebookInit);
        let vq = self.bottleneck.as_vq().ok_or_else(|| {
            Error::usage(format!(
                "init_codebook only applies to VQ bottlenecks, not '{}'",
                self.kind.name()
            ))
        })?;
        let (n_codes, k) = (vq.n_codes(), vq.code_dim());
        if n_samples < n_codes {
            return Err(Error::usage(format!(
                "need at least {n_codes} samples to initialize {n_codes} codes, got {n_samples}"
            )));
        }

        let mut samples = Array2::<f32>::zeros((n_samples, k));
        let mut filled = 0;
        while filled < n_samples {
            let batch = source.next().ok_or(Error::DataExhausted {
                got: filled,
                wanted: n_samples,
            })?;
            let ze = vq.pre_quantize(self.encoder.forward(batch.mel_enc_input));
            let [b, _, t] = ze.dims();
            let rows = to_vec(ze.swap_dims(1, 2).reshape([b * t, k]));
            let take = (n_samples - filled).min(b * t);
            for (i, row) in rows.chunks(k).take(take).enumerate() {
                samples.row_mut(filled + i).assign(&ArrayView1::from(row));
            }
            filled += take;
            debug!(filled, n_samples, "collected codebook samples");
        }
        perf::add_count(Metric::CodebookSamples, n_samples as u64);

        let mut rng = StdRng::seed_from_u64(self.init_args.seed);
        let result = kmeans(samples.view(), n_codes, &KmeansOptions::default(), &mut rng)?;
        debug!(
            distortion = result.distortion,
            iterations = result.iterations,
            "codebook k-means finished"
        );
        let values: Vec<f32> = result.centroids.iter().copied().collect();
        let codebook = Tensor::from_data(TensorData::new(values, [n_codes, k]), &self.device);
        match self.bottleneck.as_vq_mut() {
            Some(vq) => vq.set_codebook(codebook),
            None => Err(Error::usage("bottleneck changed during codebook init")),
        }
    }

    /// All parameters under `encoder.`, `bottleneck.` and `decoder.`.
    pub fn state_dict(&self) -> StateDict {
        let mut dict = StateDict::new();
        self.encoder.export("encoder", &mut dict);
        self.bottleneck.export("bottleneck", &mut dict);
        self.decoder.export("decoder", &mut dict);
        dict
    }

    /// Load parameters, requiring every one to be present and used.
    pub fn load_state_dict(&mut self, mut dict: StateDict) -> Result<()> {
        self.encoder.import("encoder", &mut dict, &self.device)?;
        self.bottleneck.import("bottleneck", &mut dict, &self.device)?;
        self.decoder.import("decoder", &mut dict, &self.device)?;
        dict.ensure_consumed()
    }

    /// SHA-256 digest of every parameter.
    pub fn checksum(&self) -> String {
        self.state_dict().checksum()
    }

    pub fn save_checkpoint(&self, path: impl AsRef<Path>) -> Result<()> {
        let _span = perf::span(Metric::CheckpointSave);
        write_checkpoint(path.as_ref(), CHECKPOINT_KIND, &self.init_args, &self.state_dict())
    }

    /// Rebuild from a checkpoint; geometry must be re-resolved with
    /// [`AutoEncoder::post_init`].
    pub fn load_checkpoint(path: impl AsRef<Path>, device: &B::Device) -> Result<Self> {
        let _span = perf::span(Metric::CheckpointLoad);
        let (init_args, dict) = read_checkpoint::<InitArgs>(path.as_ref(), CHECKPOINT_KIND)?;
        let mut model = Self::from_init_args(init_args, device)?;
        model.load_state_dict(dict)?;
        Ok(model)
    }
}
