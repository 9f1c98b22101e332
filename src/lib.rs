//! # aewave - WaveNet autoencoders for raw audio
//!
//! An MFCC encoder, a choice of bottleneck (`ae`, `vae`, `vqvae`,
//! `vqvae-ema`) and a conditioned WaveNet decoder, plus an MFCC inverter
//! that conditions the WaveNet on MFCC frames directly.
//!
//! ## Geometry
//!
//! Every convolution registers a descriptor in a [`geometry::VcGraph`].
//! Once the dataset's MFCC stage is spliced on top, the resolver walks the
//! chain backward from the requested output window and forward again to
//! find exactly how many waveform samples, MFCC frames and conditioning
//! steps a batch needs, and which slices line them up.
//!
//! ```no_run
//! use aewave::{load_config, AutoEncoder};
//! use burn_ndarray::{NdArray, NdArrayDevice};
//!
//! let config = load_config("autoencoder.yaml").unwrap();
//! let device = NdArrayDevice::default();
//! let mut model = AutoEncoder::<NdArray<f32>>::new(&config, &config.dataset, &device).unwrap();
//! let geometry = model.post_init(&config.dataset).unwrap();
//! println!("{geometry}");
//! ```

pub mod bottleneck;
pub mod config;
pub mod data;
pub mod error;
pub mod geometry;
pub mod model;
pub mod modules;
pub mod perf;
pub mod weights;

pub use bottleneck::{BottleneckKind, Metrics};
pub use config::{load_config, Config};
pub use data::{Dataset, VBatch};
pub use error::{Error, GeometryError, Result};
pub use model::{AutoEncoder, GradientStats, MfccInverter, ModelGeometry, RunOutput};
