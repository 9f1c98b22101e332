//! WaveNet conditioned directly on MFCC frames, inverting the MFCC transform.

use super::{prediction_pair, read_checkpoint, write_checkpoint, Diagnostics, RunOutput};
use crate::bottleneck::{cross_entropy, Metrics};
use crate::config::{Config, DecoderConfig};
use crate::data::{expect_len, Dataset, VBatch};
use crate::error::{Error, Result};
use crate::geometry::{VcGraph, VcHandle, Waypoint};
use crate::model::geometry::{GeometryAnchors, ModelGeometry};
use crate::modules::init::ParamInit;
use crate::modules::ops::scalar;
use crate::modules::preprocess::PreProcess;
use crate::modules::wavenet::WaveNet;
use crate::perf::{self, Metric};
use crate::weights::StateDict;
use burn::tensor::{backend::Backend, Int, Tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

const CHECKPOINT_KIND: &str = "mfcc_inverter";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InverterInitArgs {
    /// Decoder configuration with `n_speakers` taken from the dataset.
    pub decoder: DecoderConfig,
    /// MFCC channels used as local conditioning.
    pub n_lc_in: usize,
    pub seed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InverterState {
    pub init_args: InverterInitArgs,
}

/// Autoregressive WaveNet generating waveforms from MFCCs.
#[derive(Debug, Clone)]
pub struct MfccInverter<B: Backend> {
    init_args: InverterInitArgs,
    graph: VcGraph,
    pub wavenet: WaveNet<B>,
    preprocess: PreProcess,
    mfcc: Option<VcHandle>,
    geometry: Option<ModelGeometry>,
    device: B::Device,
}

impl<B: Backend> MfccInverter<B> {
    /// Build from the `decoder` and `mfcc_inverter` sections of `config`.
    pub fn new(config: &Config, dataset: &impl Dataset, device: &B::Device) -> Result<Self> {
        let inverter = config
            .mfcc_inverter
            .as_ref()
            .ok_or_else(|| Error::config("missing mfcc_inverter section"))?;
        if inverter.n_lc_in != dataset.num_mel_chan() {
            return Err(Error::config(format!(
                "mfcc_inverter.n_lc_in {} does not match the dataset's {} MFCC channels",
                inverter.n_lc_in,
                dataset.num_mel_chan()
            )));
        }
        let mut decoder = config.decoder.clone();
        decoder.n_speakers = dataset.num_speakers();
        Self::from_init_args(
            InverterInitArgs {
                decoder,
                n_lc_in: inverter.n_lc_in,
                seed: config.seed,
            },
            device,
        )
    }

    pub fn from_init_args(init_args: InverterInitArgs, device: &B::Device) -> Result<Self> {
        let _span = perf::span(Metric::ModelAssemble);
        let mut graph = VcGraph::new();
        let mut init = ParamInit::new(init_args.seed);
        let wavenet = WaveNet::new(
            &init_args.decoder,
            init_args.n_lc_in,
            &mut graph,
            None,
            &mut init,
            device,
        )?;
        info!(nodes = graph.len(), "assembled mfcc inverter");
        Ok(Self {
            preprocess: PreProcess::new(init_args.decoder.n_quant),
            init_args,
            graph,
            wavenet,
            mfcc: None,
            geometry: None,
            device: device.clone(),
        })
    }

    /// Attach the dataset's MFCC stage above the decoder and resolve geometry.
    pub fn post_init(&mut self, dataset: &impl Dataset) -> Result<ModelGeometry> {
        if self.mfcc.is_some() {
            return Err(Error::usage("post_init has already attached an MFCC stage"));
        }
        let beg = self.wavenet.vc().get(Waypoint::Beg)?;
        let mfcc = self.graph.push(dataset.mfcc_vc(), None)?;
        self.graph.set_parent(beg, mfcc)?;
        self.mfcc = Some(mfcc);
        let geometry = self.init_geometry(dataset.window_batch_size())?;
        self.print_geometry()?;
        Ok(geometry)
    }

    pub fn init_geometry(&mut self, window: usize) -> Result<ModelGeometry> {
        let _span = perf::span(Metric::ModelInitGeometry);
        let mfcc = self
            .mfcc
            .ok_or_else(|| Error::usage("geometry needs post_init to attach an MFCC stage"))?;
        let vc = self.wavenet.vc();
        let anchors = GeometryAnchors {
            mfcc,
            end_enc: mfcc,
            last_upsample: vc.get(Waypoint::LastUpsample)?,
            beg_grcc: vc.get(Waypoint::BegGrcc)?,
            end_grcc: vc.get(Waypoint::EndGrcc)?,
        };
        let geometry = ModelGeometry::resolve_inputs(&self.graph, &anchors, window)?;
        info!(
            window,
            enc_in_len = geometry.enc_in_len,
            dec_in_len = geometry.dec_in_len,
            "resolved mfcc inverter geometry"
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

    pub fn init_args(&self) -> &InverterInitArgs {
        &self.init_args
    }

    pub fn preprocess(&self) -> &PreProcess {
        &self.preprocess
    }

    pub fn print_geometry(&self) -> Result<String> {
        let start = match self.mfcc {
            Some(mfcc) => mfcc,
            None => self.wavenet.vc().get(Waypoint::Beg)?,
        };
        let mut lines: Vec<String> = self
            .graph
            .chain_from(self.graph.root(start)?)
            .map(|(_, node)| node.to_string())
            .collect();
        lines.extend(self.geometry.as_ref().map(ToString::to_string));
        let out = lines.join("\n") + "\n";
        info!("geometry\n{out}");
        Ok(out)
    }

    pub fn state(&self) -> InverterState {
        InverterState {
            init_args: self.init_args.clone(),
        }
    }

    pub fn from_state(state: InverterState, device: &B::Device) -> Result<Self> {
        Self::from_init_args(state.init_args, device)
    }

    pub fn forward(
        &self,
        mels: Tensor<B, 3>,
        wav_onehot_dec: Tensor<B, 3>,
        voice_inds: Tensor<B, 1, Int>,
        jitter_index: Tensor<B, 2, Int>,
    ) -> Result<Tensor<B, 3>> {
        let trim = self.geometry()?.trim_ups_out;
        let _span = perf::span(Metric::DecoderForward);
        Ok(self
            .wavenet
            .forward(wav_onehot_dec, mels, voice_inds, Some(jitter_index), trim))
    }

    pub fn check_batch(&self, batch: &VBatch<B>) -> Result<ModelGeometry> {
        let geometry = *self.geometry()?;
        expect_len("mel_enc_input", batch.mel_enc_input.dims()[2], geometry.enc_in_mel_len)?;
        expect_len("wav_dec_input", batch.wav_dec_input.dims()[1], geometry.dec_in_len)?;
        expect_len("jitter_index", batch.jitter_index.dims()[1], geometry.embed_len)?;
        expect_len("mel channels", batch.mel_enc_input.dims()[1], self.init_args.n_lc_in)?;
        Ok(geometry)
    }

    pub fn prediction_pair(
        &self,
        quant: Tensor<B, 3>,
        batch: &VBatch<B>,
    ) -> Result<(Tensor<B, 3>, Tensor<B, 2, Int>)> {
        prediction_pair(quant, batch.wav_dec_input.clone(), self.geometry()?)
    }

    /// Forward one batch and score it with the reconstruction loss.
    pub fn run(&self, batch: &VBatch<B>) -> Result<RunOutput<B>> {
        let _span = perf::span(Metric::ModelRun);
        self.check_batch(batch)?;
        let wav_onehot_dec = self.preprocess.forward(batch.wav_dec_input.clone())?;
        let quant = self.forward(
            batch.mel_enc_input.clone(),
            wav_onehot_dec.clone(),
            batch.voice_index.clone(),
            batch.jitter_index.clone(),
        )?;
        let (pred, target) = self.prediction_pair(quant, batch)?;
        let loss = cross_entropy(pred.clone(), target.clone())?;
        let mut metrics = Metrics::new();
        metrics.insert("rec".into(), scalar(loss.clone()));
        metrics.insert("loss".into(), scalar(loss.clone()));
        perf::add_count(Metric::BatchesRun, 1);
        Ok(RunOutput {
            pred,
            target,
            loss,
            metrics,
            diagnostics: Diagnostics {
                wav_onehot_dec,
                bottleneck: None,
            },
        })
    }

    /// Sample `window - 1` levels per replica, seeded from the start of each
    /// decoder input. Rows are replica-major (`r * B + b`).
    pub fn infer(&self, batch: &VBatch<B>, n_replicas: usize) -> Result<Tensor<B, 2, Int>> {
        let geometry = self.check_batch(batch)?;
        let mut rng = StdRng::seed_from_u64(self.init_args.seed);
        self.wavenet.sample(
            batch.wav_dec_input.clone(),
            batch.mel_enc_input.clone(),
            batch.voice_index.clone(),
            geometry.trim_ups_out,
            n_replicas,
            &mut rng,
        )
    }

    pub fn state_dict(&self) -> StateDict {
        let mut dict = StateDict::new();
        self.wavenet.export("wavenet", &mut dict);
        dict
    }

    pub fn load_state_dict(&mut self, mut dict: StateDict) -> Result<()> {
        self.wavenet.import("wavenet", &mut dict, &self.device)?;
        dict.ensure_consumed()
    }

    pub fn checksum(&self) -> String {
        self.state_dict().checksum()
    }

    pub fn save_checkpoint(&self, path: impl AsRef<Path>) -> Result<()> {
        let _span = perf::span(Metric::CheckpointSave);
        write_checkpoint(path.as_ref(), CHECKPOINT_KIND, &self.init_args, &self.state_dict())
    }

    pub fn load_checkpoint(path: impl AsRef<Path>, device: &B::Device) -> Result<Self> {
        let _span = perf::span(Metric::CheckpointLoad);
        let (init_args, dict) =
            read_checkpoint::<InverterInitArgs>(path.as_ref(), CHECKPOINT_KIND)?;
        let mut model = Self::from_init_args(init_args, device)?;
        model.load_state_dict(dict)?;
        Ok(model)
    }
}
