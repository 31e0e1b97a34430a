//! Training driver
//!
//! A strict nested loop: a fixed number of epochs, each pulling a fresh
//! exhaustive partition from the batch source. Every batch is shuffled
//! jointly, run forward through the frozen encoder and the decoder, scored
//! and used for exactly one optimizer update. Any failure ends the run.

use std::path::Path;
use std::time::Instant;

use burn::{
    module::Module,
    optim::{GradientsParams, Optimizer},
    record::CompactRecorder,
    tensor::{backend::AutodiffBackend, ElementConversion},
};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::objective::{build_objective, Objective, ObjectiveConfig};
use crate::dataset::{BatchSource, SegmentationBatch, SegmentationBatcher};
use crate::encoder::{check_retention, Encoder};
use crate::model::{FcnDecoder, FcnDecoderConfig, TrainingConfig};
use crate::utils::error::{FcnError, Result};
use crate::utils::TrainingLogger;

/// Runtime scalars fed to every update
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepParams {
    pub learning_rate: f64,
    /// Dropout keep-probability for the encoder
    pub retention: f64,
}

impl Default for StepParams {
    fn default() -> Self {
        Self {
            learning_rate: 0.001,
            retention: 0.5,
        }
    }
}

/// Loss terms of one update, read back before the parameters change
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepOutput {
    pub loss: f64,
    pub cross_entropy: f64,
    pub regularization: f64,
}

/// ChaCha stream used for dropout masks, apart from the shuffle stream of the same seed
const DROPOUT_STREAM: u64 = 1;

fn dropout_rng(seed: u64) -> ChaCha8Rng {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    rng.set_stream(DROPOUT_STREAM);
    rng
}

/// Decoder, objective and optimizer state of one training run
pub struct SegmentationModel<B: AutodiffBackend, O> {
    decoder: FcnDecoder<B>,
    objective: Objective,
    optimizer: O,
    dropout_rng: ChaCha8Rng,
}

impl<B, O> SegmentationModel<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<FcnDecoder<B>, B>,
{
    pub fn new(decoder: FcnDecoder<B>, objective: Objective, optimizer: O) -> Result<Self> {
        if decoder.num_classes() != objective.num_classes() {
            return Err(FcnError::ClassCountMismatch {
                context: "model assembly",
                expected: objective.num_classes(),
                found: decoder.num_classes(),
            });
        }
        Ok(Self {
            decoder,
            objective,
            optimizer,
            dropout_rng: dropout_rng(0),
        })
    }

    /// Restart the dropout mask sequence from `seed`
    pub fn reseed(&mut self, seed: u64) {
        self.dropout_rng = dropout_rng(seed);
    }

    pub fn decoder(&self) -> &FcnDecoder<B> {
        &self.decoder
    }

    pub fn objective(&self) -> &Objective {
        &self.objective
    }

    pub fn num_classes(&self) -> usize {
        self.objective.num_classes()
    }

    /// One forward/backward pass and one optimizer update.
    pub fn step<E>(&mut self, encoder: &E, batch: SegmentationBatch<B>, params: StepParams) -> Result<StepOutput>
    where
        E: Encoder<B> + ?Sized,
    {
        check_retention(params.retention)?;
        if !(params.learning_rate > 0.0 && params.learning_rate.is_finite()) {
            return Err(FcnError::Config(format!(
                "learning rate must be positive, got {}",
                params.learning_rate
            )));
        }

        // The encoder is frozen: no gradient flows into it
        let features = encoder
            .encode(batch.images, params.retention, &mut self.dropout_rng)?
            .detach();
        let scores = self.decoder.forward(features)?;
        let output = self.objective.evaluate(&self.decoder, scores, batch.labels)?;

        let loss: f64 = output.loss.clone().into_scalar().elem();
        if !loss.is_finite() {
            return Err(FcnError::Training(format!("loss is not finite: {}", loss)));
        }
        let cross_entropy: f64 = output.cross_entropy.into_scalar().elem();
        let regularization: f64 = output.regularization.into_scalar().elem();

        let grads = output.loss.backward();
        let grads = GradientsParams::from_grads(grads, &self.decoder);
        self.decoder = self
            .optimizer
            .step(params.learning_rate, self.decoder.clone(), grads);

        Ok(StepOutput {
            loss,
            cross_entropy,
            regularization,
        })
    }

    /// Save the decoder weights with `CompactRecorder`
    pub fn save_decoder(&self, path: &Path) -> Result<()> {
        let recorder = CompactRecorder::new();
        self.decoder
            .clone()
            .save_file(path.to_path_buf(), &recorder)
            .map_err(|e| FcnError::Model(format!("Failed to save decoder: {:?}", e)))?;
        info!("Saved decoder to {:?}", path);
        Ok(())
    }
}

/// Assemble decoder weights, objective and Adam state for one run.
pub fn build_model<B: AutodiffBackend>(
    decoder_config: &FcnDecoderConfig,
    objective_config: &ObjectiveConfig,
    device: &B::Device,
) -> Result<SegmentationModel<B, impl Optimizer<FcnDecoder<B>, B>>> {
    let decoder = decoder_config.init::<B>(device)?;
    let (objective, optimizer) = build_objective::<B>(objective_config)?;
    SegmentationModel::new(decoder, objective, optimizer)
}

/// Diagnostics of one epoch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochReport {
    pub epoch: usize,
    /// Sum of the per-batch losses
    pub loss_sum: f64,
    pub batches: usize,
    pub samples: usize,
    /// `loss_sum` normalised by the configured `LossReport`
    pub reported_loss: f64,
}

/// Result of a full training run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSummary {
    pub epochs: Vec<EpochReport>,
    pub total_batches: usize,
    pub elapsed_secs: f64,
}

impl TrainingSummary {
    pub fn final_loss(&self) -> Option<f64> {
        self.epochs.last().map(|e| e.reported_loss)
    }
}

/// Run `config.epochs` passes over `source`, updating `model` once per batch.
pub fn train<B, O, E, S>(
    model: &mut SegmentationModel<B, O>,
    encoder: &E,
    source: &mut S,
    config: &TrainingConfig,
    device: &B::Device,
) -> Result<TrainingSummary>
where
    B: AutodiffBackend,
    O: Optimizer<FcnDecoder<B>, B>,
    E: Encoder<B> + ?Sized,
    S: BatchSource + ?Sized,
{
    config.validate()?;
    if model.num_classes() != config.num_classes {
        return Err(FcnError::ClassCountMismatch {
            context: "training configuration",
            expected: config.num_classes,
            found: model.num_classes(),
        });
    }
    if source.is_empty() {
        return Err(FcnError::Dataset("batch source has no samples".to_string()));
    }

    let batcher = SegmentationBatcher::new(config.num_classes, config.image_shape);
    let params = StepParams {
        learning_rate: config.learning_rate,
        retention: config.retention,
    };
    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    model.reseed(config.seed);
    let mut logger = TrainingLogger::new(config.epochs);
    let start = Instant::now();

    info!(
        "Training on {} samples: {} epochs, batch size {}, lr {}, retention {}",
        source.len(),
        config.epochs,
        config.batch_size,
        config.learning_rate,
        config.retention
    );

    let mut epochs = Vec::with_capacity(config.epochs);
    let mut total_batches = 0;

    for epoch in 0..config.epochs {
        logger.start_epoch(epoch);

        let mut loss_sum = 0.0f64;
        let mut batches = 0usize;
        let mut samples = 0usize;

        for items in source.batches(config.batch_size)? {
            let mut items = items?;
            // Same permutation for images and labels: they travel together
            items.shuffle(&mut rng);

            let batch = batcher.try_batch::<B>(items, device)?;
            let size = batch.len();
            let output = model.step(encoder, batch, params)?;

            logger.batch(batches, output.loss, size);
            loss_sum += output.loss;
            batches += 1;
            samples += size;
        }

        let reported_loss = config
            .loss_report
            .reduce(loss_sum, batches, config.batch_size);
        logger.end_epoch(reported_loss, batches);

        total_batches += batches;
        epochs.push(EpochReport {
            epoch,
            loss_sum,
            batches,
            samples,
            reported_loss,
        });
    }

    let summary = TrainingSummary {
        epochs,
        total_batches,
        elapsed_secs: start.elapsed().as_secs_f64(),
    };
    logger.log_complete(summary.final_loss());
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{synthetic_road_items, BatchIter, InMemorySource, SegmentationItem};
    use crate::encoder::{ConvBackbone, ConvBackboneConfig};
    use crate::model::LossReport;
    use burn::backend::Autodiff;
    use burn_ndarray::NdArray;

    type TestBackend = Autodiff<NdArray>;

    fn backbone(device: &<TestBackend as burn::tensor::backend::Backend>::Device) -> ConvBackbone<TestBackend> {
        ConvBackboneConfig::new()
            .with_base_filters(2)
            .with_head_channels(8)
            .init::<TestBackend>(device)
            .unwrap()
    }

    fn decoder_config(encoder: &ConvBackbone<TestBackend>, num_classes: usize) -> FcnDecoderConfig {
        FcnDecoderConfig::new(num_classes, encoder.channels())
    }

    fn batch(shape: (usize, usize), count: usize, seed: u64) -> SegmentationBatch<TestBackend> {
        let items = synthetic_road_items(count, shape, seed).unwrap();
        SegmentationBatcher::new(2, shape)
            .try_batch::<TestBackend>(items, &Default::default())
            .unwrap()
    }

    fn exact() -> StepParams {
        StepParams {
            learning_rate: 0.001,
            retention: 1.0,
        }
    }

    /// Counts how often an epoch is requested
    struct CountingSource {
        inner: InMemorySource,
        calls: usize,
    }

    impl BatchSource for CountingSource {
        fn len(&self) -> usize {
            self.inner.len()
        }

        fn batches(&mut self, batch_size: usize) -> Result<BatchIter<'_>> {
            self.calls += 1;
            self.inner.batches(batch_size)
        }
    }

    #[test]
    fn test_step_is_deterministic_from_identical_parameters() {
        let device = Default::default();
        let encoder = backbone(&device);
        let decoder = decoder_config(&encoder, 2).init::<TestBackend>(&device).unwrap();

        let run = |decoder: FcnDecoder<TestBackend>, seed: u64| {
            let (objective, optimizer) = build_objective::<TestBackend>(&ObjectiveConfig::new(2)).unwrap();
            let mut model = SegmentationModel::new(decoder, objective, optimizer).unwrap();
            model.reseed(seed);
            let params = StepParams::default();
            let first = model.step(&encoder, batch((32, 64), 2, 3), params).unwrap();
            let second = model.step(&encoder, batch((32, 64), 2, 3), params).unwrap();
            (first.loss, second.loss)
        };

        let a = run(decoder.clone(), 7);
        let b = run(decoder.clone(), 7);
        assert_eq!(a.0.to_bits(), b.0.to_bits());
        assert_eq!(a.1.to_bits(), b.1.to_bits());
        assert_ne!(a.0, a.1);

        // Another seed draws other dropout masks
        let c = run(decoder, 8);
        assert_ne!(a.0.to_bits(), c.0.to_bits());
    }

    #[test]
    fn test_training_with_dropout_is_reproducible() {
        let device = Default::default();
        let encoder = backbone(&device);
        let decoder = decoder_config(&encoder, 2).init::<TestBackend>(&device).unwrap();
        let config = TrainingConfig {
            epochs: 2,
            batch_size: 2,
            image_shape: (32, 64),
            retention: 0.5,
            seed: 13,
            ..TrainingConfig::default()
        };

        let run = || {
            let (objective, optimizer) = build_objective::<TestBackend>(&ObjectiveConfig::new(2)).unwrap();
            let mut model = SegmentationModel::new(decoder.clone(), objective, optimizer).unwrap();
            let mut source = InMemorySource::new(synthetic_road_items(4, (32, 64), 5).unwrap(), 3);
            let summary = train(&mut model, &encoder, &mut source, &config, &device).unwrap();
            summary
                .epochs
                .iter()
                .map(|e| e.loss_sum.to_bits())
                .collect::<Vec<_>>()
        };

        assert_eq!(run(), run());
    }

    #[test]
    fn test_disabling_regularization_lowers_loss() {
        let device = Default::default();
        let encoder = backbone(&device);
        let decoder = decoder_config(&encoder, 2).init::<TestBackend>(&device).unwrap();

        let loss_with = |regularize: bool| {
            let config = ObjectiveConfig::new(2).with_regularize(regularize);
            let (objective, optimizer) = build_objective::<TestBackend>(&config).unwrap();
            let mut model = SegmentationModel::new(decoder.clone(), objective, optimizer).unwrap();
            model.step(&encoder, batch((32, 64), 2, 9), exact()).unwrap()
        };

        let regularized = loss_with(true);
        let plain = loss_with(false);
        assert!(plain.loss < regularized.loss);
        assert_eq!(plain.regularization, 0.0);
        assert!(regularized.regularization > 0.0);
        assert!((plain.cross_entropy - regularized.cross_entropy).abs() < 1e-6);
    }

    #[test]
    fn test_step_updates_decoder_only() {
        let device = Default::default();
        let encoder = backbone(&device);
        let mut model = build_model::<TestBackend>(
            &decoder_config(&encoder, 2),
            &ObjectiveConfig::new(2),
            &device,
        )
        .unwrap();

        let before = model.decoder().score8.weight.val().into_data();
        let encoder_before = encoder.fc7.weight.val().into_data();
        model.step(&encoder, batch((32, 64), 2, 1), StepParams::default()).unwrap();

        assert_ne!(model.decoder().score8.weight.val().into_data(), before);
        assert_eq!(encoder.fc7.weight.val().into_data(), encoder_before);
    }

    #[test]
    fn test_model_rejects_class_mismatch() {
        let device = Default::default();
        let encoder = backbone(&device);
        let decoder = decoder_config(&encoder, 3).init::<TestBackend>(&device).unwrap();
        let (objective, optimizer) = build_objective::<TestBackend>(&ObjectiveConfig::new(2)).unwrap();

        assert!(matches!(
            SegmentationModel::new(decoder, objective, optimizer),
            Err(FcnError::ClassCountMismatch { .. })
        ));
    }

    #[test]
    fn test_end_to_end_two_epochs() {
        let device = Default::default();
        let encoder = backbone(&device);
        let config = TrainingConfig {
            epochs: 2,
            batch_size: 4,
            num_classes: 2,
            image_shape: (160, 576),
            ..TrainingConfig::default()
        };
        let mut model = build_model::<TestBackend>(
            &decoder_config(&encoder, config.num_classes),
            &ObjectiveConfig::new(config.num_classes),
            &device,
        )
        .unwrap();
        let mut source = CountingSource {
            inner: InMemorySource::new(synthetic_road_items(8, config.image_shape, 11).unwrap(), 5),
            calls: 0,
        };

        let summary = train(&mut model, &encoder, &mut source, &config, &device).unwrap();

        assert_eq!(source.calls, 2);
        assert_eq!(summary.epochs.len(), 2);
        assert_eq!(summary.total_batches, 4);
        for report in &summary.epochs {
            assert_eq!(report.batches, 2);
            assert_eq!(report.samples, 8);
            assert!(report.reported_loss.is_finite());
            assert!(report.reported_loss >= 0.0);
            assert!((report.reported_loss - report.loss_sum / 2.0).abs() < 1e-12);
        }
    }

    #[test]
    fn test_per_batch_size_report() {
        let device = Default::default();
        let encoder = backbone(&device);
        let config = TrainingConfig {
            epochs: 1,
            batch_size: 2,
            image_shape: (32, 64),
            loss_report: LossReport::PerBatchSize,
            ..TrainingConfig::default()
        };
        let mut model =
            build_model::<TestBackend>(&decoder_config(&encoder, 2), &ObjectiveConfig::new(2), &device).unwrap();
        let mut source = InMemorySource::new(synthetic_road_items(6, (32, 64), 2).unwrap(), 0);

        let summary = train(&mut model, &encoder, &mut source, &config, &device).unwrap();
        let report = &summary.epochs[0];
        assert_eq!(report.batches, 3);
        assert!((report.reported_loss - report.loss_sum / 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_malformed_batch_aborts_training() {
        let device = Default::default();
        let encoder = backbone(&device);
        let config = TrainingConfig {
            epochs: 3,
            batch_size: 2,
            image_shape: (32, 64),
            ..TrainingConfig::default()
        };
        let mut model =
            build_model::<TestBackend>(&decoder_config(&encoder, 2), &ObjectiveConfig::new(2), &device).unwrap();

        let mut items = synthetic_road_items(3, (32, 64), 4).unwrap();
        let pixels = 32 * 64;
        items.push(SegmentationItem::new(vec![0.0; 3 * pixels], vec![2; pixels], 32, 64, "bad").unwrap());
        let mut source = CountingSource {
            inner: InMemorySource::new(items, 1),
            calls: 0,
        };

        let err = train(&mut model, &encoder, &mut source, &config, &device).unwrap_err();
        assert!(matches!(err, FcnError::ClassCountMismatch { .. }));
        assert_eq!(source.calls, 1);
    }

    #[test]
    fn test_train_rejects_mismatched_config() {
        let device = Default::default();
        let encoder = backbone(&device);
        let mut model =
            build_model::<TestBackend>(&decoder_config(&encoder, 2), &ObjectiveConfig::new(2), &device).unwrap();
        let config = TrainingConfig {
            num_classes: 3,
            image_shape: (32, 64),
            ..TrainingConfig::default()
        };
        let mut source = InMemorySource::new(synthetic_road_items(2, (32, 64), 0).unwrap(), 0);

        assert!(train(&mut model, &encoder, &mut source, &config, &device).is_err());
    }

    #[test]
    fn test_save_decoder() {
        let device = Default::default();
        let encoder = backbone(&device);
        let model =
            build_model::<TestBackend>(&decoder_config(&encoder, 2), &ObjectiveConfig::new(2), &device).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("decoder");

        model.save_decoder(&path).unwrap();
        assert!(dir.path().join("decoder.mpk").exists());
    }
}
