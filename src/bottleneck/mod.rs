//! Bottlenecks between encoder and decoder, and their training objectives.
//!
//! The variant is chosen by the configuration's `type` string:
//!
//! | `type`      | bottleneck   | objective                                  |
//! |-------------|--------------|--------------------------------------------|
//! | `ae`        | projection   | rec + l2_weight * mean(code²)              |
//! | `vae`       | Gaussian     | rec + max(KL, free_nats)                   |
//! | `vqvae`     | codebook     | rec + vq + β commit                        |
//! | `vqvae-ema` | EMA codebook | rec + β commit                             |

pub mod ae;
pub mod kmeans;
pub mod vae;
pub mod vq;

use crate::config::BottleneckConfig;
use crate::error::{Error, Result};
use crate::modules::init::ParamInit;
use crate::modules::ops::{scalar, to_vec_int};
use crate::weights::StateDict;
use burn::tensor::{activation::log_softmax, backend::Backend, Int, Tensor};
use std::collections::BTreeMap;

pub use ae::Ae;
pub use vae::Vae;
pub use vq::VqVae;

/// Named scalar side outputs of a loss computation.
pub type Metrics = BTreeMap<String, f32>;

const DEFAULT_L2_WEIGHT: f32 = 0.001;
const DEFAULT_COMMITMENT: f32 = 0.25;
const DEFAULT_EMA_GAMMA: f32 = 0.99;

/// Validated bottleneck selection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BottleneckKind {
    Ae {
        n_out: usize,
        l2_weight: f32,
    },
    Vae {
        n_out: usize,
        free_nats: f32,
    },
    VqVae {
        n_out: usize,
        n_codes: usize,
        commitment: f32,
    },
    VqVaeEma {
        n_out: usize,
        n_codes: usize,
        commitment: f32,
        ema_gamma: f32,
    },
}

impl BottleneckKind {
    pub fn from_config(config: &BottleneckConfig) -> Result<Self> {
        let n_out = config.n_out;
        if n_out == 0 {
            return Err(Error::config("bottleneck n_out must be positive"));
        }
        let n_codes = || match config.n_codes {
            Some(n) if n > 0 => Ok(n),
            _ => Err(Error::config(format!(
                "bottleneck '{}' requires a positive n_codes",
                config.kind
            ))),
        };
        let commitment = config.commitment.unwrap_or(DEFAULT_COMMITMENT);
        match config.kind.as_str() {
            "ae" => Ok(Self::Ae {
                n_out,
                l2_weight: config.l2_weight.unwrap_or(DEFAULT_L2_WEIGHT),
            }),
            "vae" => Ok(Self::Vae {
                n_out,
                free_nats: config.free_nats.unwrap_or(0.0),
            }),
            "vqvae" => Ok(Self::VqVae {
                n_out,
                n_codes: n_codes()?,
                commitment,
            }),
            "vqvae-ema" => {
                let ema_gamma = config.ema_gamma.unwrap_or(DEFAULT_EMA_GAMMA);
                if !(0.0..1.0).contains(&ema_gamma) {
                    return Err(Error::config(format!(
                        "ema_gamma must lie in [0, 1), got {ema_gamma}"
                    )));
                }
                Ok(Self::VqVaeEma {
                    n_out,
                    n_codes: n_codes()?,
                    commitment,
                    ema_gamma,
                })
            }
            other => Err(Error::config(format!("unknown bottleneck type '{other}'"))),
        }
    }

    /// The configuration string of this variant.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ae { .. } => "ae",
            Self::Vae { .. } => "vae",
            Self::VqVae { .. } => "vqvae",
            Self::VqVaeEma { .. } => "vqvae-ema",
        }
    }

    pub fn n_out(&self) -> usize {
        match *self {
            Self::Ae { n_out, .. }
            | Self::Vae { n_out, .. }
            | Self::VqVae { n_out, .. }
            | Self::VqVaeEma { n_out, .. } => n_out,
        }
    }

    pub fn is_vq(&self) -> bool {
        matches!(self, Self::VqVae { .. } | Self::VqVaeEma { .. })
    }

    pub fn objective(&self) -> Objective {
        match *self {
            Self::Ae { l2_weight, .. } => Objective::Ae { l2_weight },
            Self::Vae { free_nats, .. } => Objective::Sgvb { free_nats },
            Self::VqVae { commitment, .. } => Objective::Vq { commitment },
            Self::VqVaeEma { commitment, .. } => Objective::VqEma { commitment },
        }
    }
}

/// Variant-specific tensors the objective needs besides the code.
#[derive(Debug, Clone)]
pub enum BottleneckAux<B: Backend> {
    None,
    Gaussian {
        mu: Tensor<B, 3>,
        log_sigma: Tensor<B, 3>,
    },
    Quantized {
        /// Pre-quantization encoding `(B, k, T)`.
        ze: Tensor<B, 3>,
        /// Nearest codebook vectors `(B, k, T)`.
        zq: Tensor<B, 3>,
        /// Selected code per timestep, `(B * T)` in batch-major order.
        indices: Tensor<B, 1, Int>,
    },
}

/// Bottleneck result handed to the decoder and the objective.
#[derive(Debug, Clone)]
pub struct BottleneckOutput<B: Backend> {
    /// Conditioning for the decoder `(B, n_out, T)`.
    pub code: Tensor<B, 3>,
    pub aux: BottleneckAux<B>,
}

impl<B: Backend> BottleneckOutput<B> {
    /// Copy with every float tensor cut from the autodiff graph.
    pub fn detached(&self) -> Self {
        let aux = match &self.aux {
            BottleneckAux::None => BottleneckAux::None,
            BottleneckAux::Gaussian { mu, log_sigma } => BottleneckAux::Gaussian {
                mu: mu.clone().detach(),
                log_sigma: log_sigma.clone().detach(),
            },
            BottleneckAux::Quantized { ze, zq, indices } => BottleneckAux::Quantized {
                ze: ze.clone().detach(),
                zq: zq.clone().detach(),
                indices: indices.clone(),
            },
        };
        Self {
            code: self.code.clone().detach(),
            aux,
        }
    }
}

/// Bottleneck module.
#[derive(Debug, Clone)]
pub enum Bottleneck<B: Backend> {
    Ae(Ae<B>),
    Vae(Vae<B>),
    Vq(VqVae<B>),
}

impl<B: Backend> Bottleneck<B> {
    pub fn new(kind: &BottleneckKind, n_in: usize, init: &mut ParamInit, device: &B::Device) -> Self {
        match *kind {
            BottleneckKind::Ae { n_out, .. } => Self::Ae(Ae::new(n_in, n_out, init, device)),
            BottleneckKind::Vae { n_out, .. } => Self::Vae(Vae::new(n_in, n_out, init, device)),
            BottleneckKind::VqVae { n_out, n_codes, .. } => {
                Self::Vq(VqVae::new(n_in, n_out, n_codes, None, init, device))
            }
            BottleneckKind::VqVaeEma {
                n_out,
                n_codes,
                ema_gamma,
                ..
            } => Self::Vq(VqVae::new(n_in, n_out, n_codes, Some(ema_gamma), init, device)),
        }
    }

    /// `training` enables stochastic sampling in the VAE.
    pub fn forward(&self, encoding: Tensor<B, 3>, training: bool) -> BottleneckOutput<B> {
        match self {
            Self::Ae(ae) => ae.forward(encoding),
            Self::Vae(vae) => vae.forward(encoding, training),
            Self::Vq(vq) => vq.forward(encoding),
        }
    }

    pub fn as_vq(&self) -> Option<&VqVae<B>> {
        match self {
            Self::Vq(vq) => Some(vq),
            _ => None,
        }
    }

    pub fn as_vq_mut(&mut self) -> Option<&mut VqVae<B>> {
        match self {
            Self::Vq(vq) => Some(vq),
            _ => None,
        }
    }

    pub fn export(&self, prefix: &str, dict: &mut StateDict) {
        match self {
            Self::Ae(ae) => ae.export(prefix, dict),
            Self::Vae(vae) => vae.export(prefix, dict),
            Self::Vq(vq) => vq.export(prefix, dict),
        }
    }

    pub fn import(&mut self, prefix: &str, dict: &mut StateDict, device: &B::Device) -> Result<()> {
        match self {
            Self::Ae(ae) => ae.import(prefix, dict, device),
            Self::Vae(vae) => vae.import(prefix, dict, device),
            Self::Vq(vq) => vq.import(prefix, dict, device),
        }
    }
}

/// Scalar loss plus named metrics.
#[derive(Debug, Clone)]
pub struct LossOutput<B: Backend> {
    /// Shape `[1]`.
    pub loss: Tensor<B, 1>,
    pub metrics: Metrics,
}

/// Training objective paired with a bottleneck variant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Objective {
    Ae { l2_weight: f32 },
    /// Stochastic gradient variational bound with a free-nats floor.
    Sgvb { free_nats: f32 },
    Vq { commitment: f32 },
    VqEma { commitment: f32 },
}

impl Objective {
    /// Loss of `pred (B, Q, T)` logits against `target (B, T)` levels.
    pub fn loss<B: Backend>(
        &self,
        pred: Tensor<B, 3>,
        target: Tensor<B, 2, Int>,
        bottleneck: &BottleneckOutput<B>,
    ) -> Result<LossOutput<B>> {
        let rec = cross_entropy(pred, target)?;
        let mut metrics = Metrics::new();
        metrics.insert("rec".into(), scalar(rec.clone()));

        let loss = match (self, &bottleneck.aux) {
            (Self::Ae { l2_weight }, _) => {
                let l2 = mean_square(bottleneck.code.clone());
                metrics.insert("l2".into(), scalar(l2.clone()));
                rec + l2.mul_scalar(*l2_weight)
            }
            (Self::Sgvb { free_nats }, BottleneckAux::Gaussian { mu, log_sigma }) => {
                let kl = vae::kl_divergence(mu.clone(), log_sigma.clone());
                metrics.insert("kl".into(), scalar(kl.clone()));
                rec + kl.clamp_min(*free_nats)
            }
            (Self::Vq { commitment }, BottleneckAux::Quantized { ze, zq, indices }) => {
                let vq = mean_square(ze.clone().detach() - zq.clone());
                let commit = mean_square(ze.clone() - zq.clone().detach());
                metrics.insert("vq".into(), scalar(vq.clone()));
                metrics.insert("commit".into(), scalar(commit.clone()));
                metrics.insert("perplexity".into(), perplexity(indices.clone()));
                rec + vq + commit.mul_scalar(*commitment)
            }
            (Self::VqEma { commitment }, BottleneckAux::Quantized { ze, zq, indices }) => {
                let commit = mean_square(ze.clone() - zq.clone().detach());
                metrics.insert("commit".into(), scalar(commit.clone()));
                metrics.insert("perplexity".into(), perplexity(indices.clone()));
                rec + commit.mul_scalar(*commitment)
            }
            (objective, _) => {
                return Err(Error::usage(format!(
                    "{objective:?} does not match the bottleneck output it was given"
                )))
            }
        };
        metrics.insert("loss".into(), scalar(loss.clone()));
        Ok(LossOutput { loss, metrics })
    }
}

/// Mean cross entropy of `pred (B, Q, T)` logits against `target (B, T)`.
pub fn cross_entropy<B: Backend>(pred: Tensor<B, 3>, target: Tensor<B, 2, Int>) -> Result<Tensor<B, 1>> {
    let [batch, _, len] = pred.dims();
    if target.dims() != [batch, len] {
        return Err(Error::shape(format!(
            "target {:?} does not match prediction {:?}",
            target.dims(),
            pred.dims()
        )));
    }
    let log_probs = log_softmax(pred, 1);
    let picked = log_probs.gather(1, target.unsqueeze_dim::<3>(1));
    Ok(picked.mean().neg())
}

fn mean_square<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, 1> {
    (x.clone() * x).mean()
}

/// `exp` of the entropy of the code usage histogram.
fn perplexity<B: Backend>(indices: Tensor<B, 1, Int>) -> f32 {
    let indices = to_vec_int(indices);
    if indices.is_empty() {
        return 0.0;
    }
    let mut counts: BTreeMap<i64, usize> = BTreeMap::new();
    for i in &indices {
        *counts.entry(*i).or_default() += 1;
    }
    let n = indices.len() as f32;
    let entropy: f32 = counts
        .values()
        .map(|&c| {
            let p = c as f32 / n;
            -p * p.ln()
        })
        .sum();
    entropy.exp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray<f32>;

    fn bn_config(kind: &str) -> BottleneckConfig {
        BottleneckConfig {
            kind: kind.to_string(),
            n_out: 4,
            n_codes: Some(8),
            commitment: None,
            free_nats: None,
            ema_gamma: None,
            l2_weight: None,
        }
    }

    #[test]
    fn parses_known_kinds_with_defaults() {
        let ae = BottleneckKind::from_config(&bn_config("ae")).unwrap();
        assert_eq!(ae, BottleneckKind::Ae { n_out: 4, l2_weight: 0.001 });
        let ema = BottleneckKind::from_config(&bn_config("vqvae-ema")).unwrap();
        assert_eq!(ema.name(), "vqvae-ema");
        assert!(ema.is_vq());
        assert_eq!(ema.objective(), Objective::VqEma { commitment: 0.25 });
    }

    #[test]
    fn unknown_kind_is_a_config_error() {
        let err = BottleneckKind::from_config(&bn_config("gumbel")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn vq_without_codebook_size_is_a_config_error() {
        let mut config = bn_config("vqvae");
        config.n_codes = None;
        assert!(matches!(
            BottleneckKind::from_config(&config),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn cross_entropy_of_uniform_logits_is_log_q() {
        let device = NdArrayDevice::default();
        let pred = Tensor::<TestBackend, 3>::zeros([2, 4, 3], &device);
        let target = Tensor::<TestBackend, 2, Int>::from_ints([[0, 1, 2], [3, 3, 0]], &device);
        let ce = scalar(cross_entropy(pred, target).unwrap());
        assert!((ce - 4.0_f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn cross_entropy_rejects_mismatched_target() {
        let device = NdArrayDevice::default();
        let pred = Tensor::<TestBackend, 3>::zeros([1, 4, 3], &device);
        let target = Tensor::<TestBackend, 2, Int>::zeros([1, 2], &device);
        assert!(matches!(cross_entropy(pred, target), Err(Error::Shape(_))));
    }

    #[test]
    fn perplexity_of_uniform_usage_is_code_count() {
        let device = NdArrayDevice::default();
        let idx = Tensor::<TestBackend, 1, Int>::from_ints([0, 1, 2, 3], &device);
        assert!((perplexity(idx) - 4.0).abs() < 1e-4);
    }

    #[test]
    fn objective_rejects_foreign_aux() {
        let device = NdArrayDevice::default();
        let out = BottleneckOutput {
            code: Tensor::<TestBackend, 3>::zeros([1, 2, 3], &device),
            aux: BottleneckAux::None,
        };
        let pred = Tensor::<TestBackend, 3>::zeros([1, 4, 3], &device);
        let target = Tensor::<TestBackend, 2, Int>::zeros([1, 3], &device);
        let err = Objective::Sgvb { free_nats: 1.0 }
            .loss(pred, target, &out)
            .unwrap_err();
        assert!(matches!(err, Error::Usage(_)));
    }
}
