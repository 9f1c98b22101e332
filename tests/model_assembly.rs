mod common;

use aewave::bottleneck::kmeans::{kmeans, KmeansOptions};
use aewave::bottleneck::BottleneckKind;
use aewave::modules::ops::{to_vec, to_vec_int};
use aewave::{AutoEncoder, Error, GradientStats, MfccInverter};
use burn_autodiff::Autodiff;
use burn_ndarray::NdArrayDevice;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;
use common::{
    autoencoder_config, batch_source, fixture_config, quiet_batch, synthetic_batch, TestBackend,
};

type GradBackend = Autodiff<TestBackend>;

fn autoencoder(kind: &str) -> (aewave::Config, AutoEncoder<TestBackend>) {
    let device = NdArrayDevice::default();
    let config = autoencoder_config(kind);
    let mut model = AutoEncoder::new(&config, &config.dataset, &device).unwrap();
    model.post_init(&config.dataset).unwrap();
    (config, model)
}

#[test]
fn unknown_bottleneck_is_a_config_error() {
    let device = NdArrayDevice::default();
    let config = autoencoder_config("gumbel");
    let err = AutoEncoder::<TestBackend>::new(&config, &config.dataset, &device).unwrap_err();
    assert!(matches!(err, Error::Config(_)), "{err}");
}

#[test]
fn decoder_speakers_come_from_the_dataset() {
    let (config, model) = autoencoder("ae");
    assert_eq!(config.decoder.n_speakers, 0);
    assert_eq!(model.init_args().decoder.n_speakers, config.dataset.n_speakers);
    assert_eq!(model.init_args().n_mel_chan, config.dataset.n_mel_chan);
}

#[test]
fn run_produces_window_shaped_predictions() {
    let device = NdArrayDevice::default();
    for kind in ["ae", "vae", "vqvae", "vqvae-ema"] {
        let (config, mut model) = autoencoder(kind);
        let geometry = *model.geometry().unwrap();
        let batch = synthetic_batch::<TestBackend>(&config, &geometry, 2, 3, &device);
        let out = model.run(&batch).unwrap();

        assert_eq!(out.pred.dims(), [2, config.decoder.n_quant, geometry.window - 1]);
        assert_eq!(out.target.dims(), [2, geometry.window - 1]);
        assert_eq!(
            out.diagnostics.wav_onehot_dec.dims(),
            [2, config.decoder.n_quant, geometry.dec_in_len]
        );
        let loss = out.metrics["loss"];
        assert!(loss.is_finite(), "{kind}: loss {loss}");
        assert!(out.metrics["rec"] > 0.0, "{kind}");
        assert!(out.diagnostics.bottleneck.is_some());
    }
}

#[test]
fn run_reports_bottleneck_specific_metrics() {
    let device = NdArrayDevice::default();
    let expected = [
        ("ae", vec!["l2"]),
        ("vae", vec!["kl"]),
        ("vqvae", vec!["vq", "commit", "perplexity"]),
        ("vqvae-ema", vec!["commit", "perplexity"]),
    ];
    for (kind, keys) in expected {
        let (config, mut model) = autoencoder(kind);
        let geometry = *model.geometry().unwrap();
        let batch = synthetic_batch::<TestBackend>(&config, &geometry, 1, 0, &device);
        let metrics = model.run(&batch).unwrap().metrics;
        for key in keys {
            assert!(metrics.contains_key(key), "{kind} is missing {key}: {metrics:?}");
        }
    }
}

#[test]
fn run_rejects_batches_for_another_window() {
    let device = NdArrayDevice::default();
    let (config, mut model) = autoencoder("ae");
    let geometry = *model.geometry().unwrap();
    let batch = synthetic_batch::<TestBackend>(&config, &geometry, 1, 0, &device);
    model.init_geometry(geometry.window + 2).unwrap();
    assert!(matches!(model.run(&batch), Err(Error::Shape(_))));
}

#[test]
fn prediction_targets_are_the_next_samples() {
    let device = NdArrayDevice::default();
    let (config, mut model) = autoencoder("ae");
    let geometry = *model.geometry().unwrap();
    let batch = synthetic_batch::<TestBackend>(&config, &geometry, 1, 8, &device);
    let out = model.run(&batch).unwrap();
    let dec = to_vec_int(batch.wav_dec_input.clone());
    let target = to_vec_int(out.target);
    let start = geometry.trim_dec_out.start + 1;
    assert_eq!(target, dec[start..start + geometry.window - 1].to_vec());
}

#[test]
fn ema_training_moves_the_codebook() {
    let device = NdArrayDevice::default();
    let mut config = autoencoder_config("vqvae-ema");
    config.training = true;
    let mut model = AutoEncoder::<TestBackend>::new(&config, &config.dataset, &device).unwrap();
    model.post_init(&config.dataset).unwrap();
    let geometry = *model.geometry().unwrap();
    let before = model.checksum();
    let batch = synthetic_batch::<TestBackend>(&config, &geometry, 2, 1, &device);
    model.run(&batch).unwrap();
    assert_ne!(model.checksum(), before);
}

#[test]
fn init_codebook_rejects_continuous_bottlenecks() {
    let device = NdArrayDevice::default();
    for kind in ["ae", "vae"] {
        let (config, mut model) = autoencoder(kind);
        let geometry = *model.geometry().unwrap();
        let mut source = batch_source::<TestBackend>(&config, geometry, 1, 0, &device);
        let err = model.init_codebook(&mut source, 64).unwrap_err();
        assert!(matches!(err, Error::Usage(_)), "{kind}: {err}");
    }
}

#[test]
fn init_codebook_needs_enough_samples() {
    let device = NdArrayDevice::default();
    let (config, mut model) = autoencoder("vqvae");
    let geometry = *model.geometry().unwrap();

    let mut source = batch_source::<TestBackend>(&config, geometry, 1, 0, &device);
    assert!(matches!(
        model.init_codebook(&mut source, 2),
        Err(Error::Usage(_))
    ));

    let mut short = batch_source::<TestBackend>(&config, geometry, 1, 0, &device).take(1);
    match model.init_codebook(&mut short, 10_000) {
        Err(Error::DataExhausted { got, wanted }) => {
            assert_eq!(wanted, 10_000);
            assert!(got > 0 && got < wanted);
        }
        other => panic!("expected DataExhausted, got {other:?}"),
    }
}

#[test]
fn init_codebook_is_deterministic() {
    let device = NdArrayDevice::default();
    let codebook = |kind: &str| {
        let (config, mut model) = autoencoder(kind);
        let geometry = *model.geometry().unwrap();
        let mut source = batch_source::<TestBackend>(&config, geometry, 2, 40, &device);
        model.init_codebook(&mut source, 48).unwrap();
        let vq = model.bottleneck.as_vq().unwrap();
        let n_codes = match model.kind() {
            BottleneckKind::VqVae { n_codes, .. } | BottleneckKind::VqVaeEma { n_codes, .. } => {
                *n_codes
            }
            other => panic!("not a VQ kind: {other:?}"),
        };
        assert_eq!(vq.codebook.dims(), [n_codes, config.bottleneck.n_out]);
        to_vec(vq.codebook.clone())
    };
    let first = codebook("vqvae");
    assert!(first.iter().all(|v| v.is_finite()));
    assert_eq!(first, codebook("vqvae"));
    // the EMA variant starts from the same k-means centroids
    assert_eq!(first, codebook("vqvae-ema"));
}

#[test]
fn init_codebook_is_kmeans_of_the_sampled_encodings() {
    let device = NdArrayDevice::default();
    let n_samples = 30;
    for kind in ["vqvae", "vqvae-ema"] {
        let (config, mut model) = autoencoder(kind);
        let geometry = *model.geometry().unwrap();
        let mut source = batch_source::<TestBackend>(&config, geometry, 2, 7, &device);
        model.init_codebook(&mut source, n_samples).unwrap();

        let vq = model.bottleneck.as_vq().unwrap();
        let k = vq.code_dim();
        let mut rows = Vec::new();
        for batch in batch_source::<TestBackend>(&config, geometry, 2, 7, &device) {
            let ze = vq.pre_quantize(model.encoder.forward(batch.mel_enc_input));
            let [b, _, t] = ze.dims();
            rows.extend(to_vec(ze.swap_dims(1, 2).reshape([b * t, k])));
            if rows.len() >= n_samples * k {
                break;
            }
        }
        rows.truncate(n_samples * k);
        let samples = Array2::from_shape_vec((n_samples, k), rows).unwrap();
        let mut rng = StdRng::seed_from_u64(config.seed);
        let expected = kmeans(samples.view(), vq.n_codes(), &KmeansOptions::default(), &mut rng)
            .unwrap()
            .centroids;

        let codebook = to_vec(vq.codebook.clone());
        let expected: Vec<f32> = expected.iter().copied().collect();
        assert_eq!(codebook, expected, "{kind}");

        if let Some(ema) = &vq.ema {
            let keep = 1.0 - ema.gamma;
            for (n, c) in to_vec(ema.numer.clone()).iter().zip(&codebook) {
                assert!((n - c * keep).abs() < 1e-6, "{kind}: numer {n} vs {c}");
            }
            assert!(to_vec(ema.denom.clone()).iter().all(|d| (d - keep).abs() < 1e-6));
        } else {
            assert_eq!(kind, "vqvae");
        }
    }
}

#[test]
fn checkpoint_round_trip_preserves_parameters() {
    let device = NdArrayDevice::default();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ae.safetensors");
    let (config, mut model) = autoencoder("vqvae-ema");
    let geometry = *model.geometry().unwrap();
    let mut source = batch_source::<TestBackend>(&config, geometry, 2, 0, &device);
    model.init_codebook(&mut source, 24).unwrap();
    model.save_checkpoint(&path).unwrap();

    let mut loaded = AutoEncoder::<TestBackend>::load_checkpoint(&path, &device).unwrap();
    assert_eq!(loaded.checksum(), model.checksum());
    assert_eq!(loaded.state(), model.state());
    assert_eq!(loaded.post_init(&config.dataset).unwrap(), geometry);

    assert!(matches!(
        MfccInverter::<TestBackend>::load_checkpoint(&path, &device),
        Err(Error::Checkpoint(_))
    ));
}

#[test]
fn state_rebuilds_identical_parameters() {
    let device = NdArrayDevice::default();
    let (_, model) = autoencoder("vae");
    let rebuilt = AutoEncoder::<TestBackend>::from_state(model.state(), &device).unwrap();
    assert_eq!(rebuilt.checksum(), model.checksum());
}

#[test]
fn gradient_stats_cover_mels_and_code() {
    let device = NdArrayDevice::default();
    let config = autoencoder_config("vqvae");
    let mut model = AutoEncoder::<GradBackend>::new(&config, &config.dataset, &device).unwrap();
    model.post_init(&config.dataset).unwrap();
    let geometry = *model.geometry().unwrap();
    let batch = synthetic_batch::<GradBackend>(&config, &geometry, 2, 5, &device);

    let stats = model.gradient_stats(&batch).unwrap();
    for key in ["mel_grad_sd", "mel_grad_mean", "bn_grad_sd"] {
        assert!(stats[key].is_finite(), "{key}: {stats:?}");
    }
    assert!(stats["bn_grad_sd"] > 0.0);
}

fn inverter() -> (aewave::Config, MfccInverter<TestBackend>) {
    let device = NdArrayDevice::default();
    let config = fixture_config("inverter.yaml");
    let mut model = MfccInverter::new(&config, &config.dataset, &device).unwrap();
    model.post_init(&config.dataset).unwrap();
    (config, model)
}

#[test]
fn inverter_requires_its_config_section() {
    let device = NdArrayDevice::default();
    let mut config = fixture_config("inverter.yaml");
    config.mfcc_inverter = None;
    assert!(matches!(
        MfccInverter::<TestBackend>::new(&config, &config.dataset, &device),
        Err(Error::Config(_))
    ));
}

#[test]
fn inverter_run_scores_reconstruction_only() {
    let device = NdArrayDevice::default();
    let (config, model) = inverter();
    let geometry = *model.geometry().unwrap();
    let batch = synthetic_batch::<TestBackend>(&config, &geometry, 3, 2, &device);
    let out = model.run(&batch).unwrap();
    assert_eq!(out.pred.dims(), [3, config.decoder.n_quant, geometry.window - 1]);
    assert_eq!(out.metrics.len(), 2);
    assert_eq!(out.metrics["loss"], out.metrics["rec"]);
    assert!(out.diagnostics.bottleneck.is_none());
}

#[test]
fn inverter_infer_samples_each_replica() {
    let device = NdArrayDevice::default();
    let (config, model) = inverter();
    let geometry = *model.geometry().unwrap();
    let batch = quiet_batch::<TestBackend>(&config, &geometry, &device);

    let samples = model.infer(&batch, 3).unwrap();
    assert_eq!(samples.dims(), [3, geometry.window - 1]);
    let values = to_vec_int(samples.clone());
    assert!(values.iter().all(|q| (0..config.decoder.n_quant as i64).contains(q)));
    assert_eq!(values, to_vec_int(model.infer(&batch, 3).unwrap()));
}

#[test]
fn inverter_checkpoint_and_gradients() {
    let device = NdArrayDevice::default();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("inv.safetensors");
    let (config, model) = inverter();
    model.save_checkpoint(&path).unwrap();
    let loaded = MfccInverter::<TestBackend>::load_checkpoint(&path, &device).unwrap();
    assert_eq!(loaded.checksum(), model.checksum());

    let mut grad_model =
        MfccInverter::<GradBackend>::new(&config, &config.dataset, &device).unwrap();
    grad_model.post_init(&config.dataset).unwrap();
    let geometry = *grad_model.geometry().unwrap();
    let batch = synthetic_batch::<GradBackend>(&config, &geometry, 1, 4, &device);
    let stats = grad_model.gradient_stats(&batch).unwrap();
    assert!(stats["mel_grad_sd"].is_finite());
    assert!(!stats.contains_key("bn_grad_sd"));
}
