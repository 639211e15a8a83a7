use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use candle_core::{
    utils::{cuda_is_available, metal_is_available},
    Device,
};
use model::{
    Adversary, AdversaryConfig, AttributeAdversary, Backbone, BackboneConfig, ExpressionBackbone,
};
use tracing::{debug, info, warn};

use crate::{
    checkpoint::{self, CheckpointDescriptor, CheckpointKind, SaveRequest, WeightReport},
    config::TrainingConfig,
    data::{
        BatchOptions, BatchProvider, DatasetIndex, ImageBatch, SampleLoader,
        Split, TransformPipeline,
    },
    logging::{LoggingSettings, RunLogger},
    loss::{CrossEntropyLoss, LossMetrics, LossOutput},
    metrics::{EpochAccumulator, EpochReport, PhaseMetrics},
    optimizer::{GradientScaler, OptimizerConfig, ParameterGroups, StepOutcome, TrainerOptimizer},
    scheduler::{ExponentialDecay, LRScheduler},
    TrainingError,
};

/// Mutable state threaded through the epoch loop.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingSession {
    /// Last completed epoch; epochs are numbered from 1.
    pub epoch: usize,
    pub best_accuracy: f64,
    pub history: Vec<EpochReport>,
    pub latest_checkpoint: Option<PathBuf>,
    pub best_checkpoint: Option<PathBuf>,
}

impl TrainingSession {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub best_accuracy: f64,
    pub epochs: Vec<EpochReport>,
    pub latest_checkpoint: Option<PathBuf>,
    pub best_checkpoint: Option<PathBuf>,
    pub stopped_early: bool,
}

/// Trains the adversary on frozen backbone features.
pub struct Trainer {
    config: TrainingConfig,
    device: Device,
    train_batches: BatchProvider,
    val_batches: BatchProvider,
    backbone: ExpressionBackbone,
    adversary: AttributeAdversary,
    groups: ParameterGroups,
    optimizer: TrainerOptimizer,
    scheduler: Box<dyn LRScheduler>,
    loss: CrossEntropyLoss,
    gradient_scaler: GradientScaler,
    logger: RunLogger,
}

impl Trainer {
    pub fn new(config: TrainingConfig) -> Result<Self, TrainingError> {
        let device = select_device(config.runtime.seed);
        Self::with_device(config, device)
    }

    pub fn with_device(config: TrainingConfig, device: Device) -> Result<Self, TrainingError> {
        config.validate()?;
        let data = &config.data;

        let train_index = DatasetIndex::load(&data.root, Split::Train, data.attribute)?;
        let val_index = DatasetIndex::load(&data.root, Split::Test, data.attribute)?;
        if train_index.is_empty() {
            return Err(TrainingError::initialization(format!(
                "no training records found under {}",
                data.root.display()
            )));
        }
        info!(
            attribute = %data.attribute,
            train = train_index.len(),
            validation = val_index.len(),
            "dataset indexed"
        );

        let train_loader = SampleLoader::new(
            Arc::new(train_index),
            TransformPipeline::train(data.image_size, data.image_size),
        )?;
        let val_loader = SampleLoader::new(
            Arc::new(val_index),
            TransformPipeline::eval(data.image_size, data.image_size),
        )?;

        let train_batches = BatchProvider::new(
            train_loader,
            BatchOptions {
                batch_size: data.batch_size,
                shuffle: true,
                num_workers: data.num_workers,
                prefetch_factor: data.prefetch_factor,
                seed: config.runtime.seed,
            },
            device.clone(),
        )?;
        let val_batches = BatchProvider::new(
            val_loader,
            BatchOptions {
                batch_size: data.val_batch_size,
                shuffle: false,
                num_workers: data.num_workers,
                prefetch_factor: data.prefetch_factor,
                seed: config.runtime.seed,
            },
            device.clone(),
        )?;

        let backbone_config = BackboneConfig {
            stem_channels: config.model.stem_channels,
            feature_channels: config.model.feature_channels,
            head_channels: config.model.head_channels,
            ..BackboneConfig::new(device.clone())
        };
        let adversary_config =
            AdversaryConfig::for_backbone(&backbone_config, data.attribute.num_classes());
        let backbone = ExpressionBackbone::new(backbone_config).map_err(to_initialization_error)?;
        let adversary =
            AttributeAdversary::new(adversary_config).map_err(to_initialization_error)?;

        if let Some(path) = config.runtime.checkpoint.init_from.as_ref() {
            let weights = checkpoint::resolve_backbone_weights(path)?;
            let report = restore_backbone(&backbone, &weights, &device)?;
            info!(
                path = %weights.display(),
                loaded = report.loaded.len(),
                missing = report.missing.len(),
                unexpected = report.unexpected.len(),
                "backbone initialised from checkpoint"
            );
        }

        let groups = ParameterGroups::new(backbone.parameters(), adversary.parameters());
        debug!(
            frozen = groups.frozen.len(),
            trainable = groups.trainable.len(),
            "parameter groups built"
        );

        let optimizer = TrainerOptimizer::new(
            groups.trainable.clone(),
            OptimizerConfig::from(&config.optimizer),
        )?;
        let scheduler: Box<dyn LRScheduler> = Box::new(ExponentialDecay::from_training_config(
            &config.scheduler,
            optimizer.learning_rate(),
        )?);
        let gradient_scaler = GradientScaler::new(config.runtime.precision);
        let logger = RunLogger::new(LoggingSettings::from_config(&config.runtime.logging))?;

        info!(
            optimizer = ?config.optimizer.algorithm,
            learning_rate = optimizer.learning_rate(),
            precision = ?config.runtime.precision,
            loss_scaling = gradient_scaler.is_enabled(),
            "trainer ready"
        );

        Ok(Self {
            config,
            device,
            train_batches,
            val_batches,
            backbone,
            adversary,
            groups,
            optimizer,
            scheduler,
            loss: CrossEntropyLoss::new(),
            gradient_scaler,
            logger,
        })
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn backbone(&self) -> &ExpressionBackbone {
        &self.backbone
    }

    pub fn adversary(&self) -> &AttributeAdversary {
        &self.adversary
    }

    pub fn parameter_groups(&self) -> &ParameterGroups {
        &self.groups
    }

    pub fn optimizer(&self) -> &TrainerOptimizer {
        &self.optimizer
    }

    pub fn train_batches(&self) -> &BatchProvider {
        &self.train_batches
    }

    pub fn val_batches(&self) -> &BatchProvider {
        &self.val_batches
    }

    pub fn run(&mut self) -> Result<RunSummary, TrainingError> {
        self.run_with_shutdown(|| false)
    }

    /// Runs a fresh session, or continues the one named by
    /// `runtime.checkpoint.resume_from`. `should_stop` is polled between epochs.
    pub fn run_with_shutdown<F>(&mut self, should_stop: F) -> Result<RunSummary, TrainingError>
    where
        F: FnMut() -> bool,
    {
        let session = match self.config.runtime.checkpoint.resume_from.clone() {
            Some(directory) => self.resume_from(&directory)?,
            None => TrainingSession::new(),
        };
        self.run_session(session, should_stop)
    }

    pub fn run_session<F>(
        &mut self,
        mut session: TrainingSession,
        mut should_stop: F,
    ) -> Result<RunSummary, TrainingError>
    where
        F: FnMut() -> bool,
    {
        info!(
            device = ?self.device,
            epochs = self.config.runtime.epochs,
            start_epoch = session.epoch + 1,
            "starting training"
        );

        let mut stopped_early = false;
        while session.epoch < self.config.runtime.epochs {
            if should_stop() {
                warn!(epoch = session.epoch, "shutdown requested; stopping after completed epoch");
                stopped_early = true;
                break;
            }
            self.run_epoch(&mut session)?;
        }

        self.logger.flush();
        info!(best_accuracy = session.best_accuracy, "training finished");

        Ok(RunSummary {
            best_accuracy: session.best_accuracy,
            epochs: session.history,
            latest_checkpoint: session.latest_checkpoint,
            best_checkpoint: session.best_checkpoint,
            stopped_early,
        })
    }

    /// One train/validate cycle followed by the checkpoint policy.
    pub fn run_epoch(&mut self, session: &mut TrainingSession) -> Result<EpochReport, TrainingError> {
        let epoch = session.epoch + 1;
        let learning_rate = self.optimizer.learning_rate();

        let (train, skipped_steps) = self.train_epoch(epoch)?;
        self.logger.log_train(epoch, learning_rate, &train);
        if skipped_steps > 0 {
            warn!(
                epoch,
                skipped_steps,
                loss_scale = self.gradient_scaler.loss_scale(),
                "optimizer steps skipped on gradient overflow"
            );
        }

        let next_lr = self.scheduler.step();
        self.optimizer.set_learning_rate(next_lr);

        let validation = self.validate_epoch(epoch)?;
        self.logger.log_validation(epoch, &validation);
        let val_accuracy = validation.rounded_accuracy();

        // Unreachable while accuracy is a fraction in [0, 1].
        if val_accuracy > 1.0 && val_accuracy > session.best_accuracy {
            let descriptor =
                self.save(CheckpointKind::Best, epoch, val_accuracy, val_accuracy, None)?;
            self.logger.log_checkpoint(&descriptor.directory);
            session.best_checkpoint = Some(descriptor.directory);
            session.best_accuracy = val_accuracy;
        }

        let improved = val_accuracy > session.best_accuracy;
        if improved {
            session.best_accuracy = val_accuracy;
        }

        let report = EpochReport {
            epoch,
            learning_rate,
            train,
            validation,
            val_accuracy,
            best_accuracy: session.best_accuracy,
            improved,
            skipped_steps,
        };
        if improved {
            self.logger.log_best(&report);
        }

        let latest = self.save(
            CheckpointKind::Latest,
            epoch,
            val_accuracy,
            session.best_accuracy,
            self.config.runtime.checkpoint.max_keep_latest,
        )?;
        self.logger.log_checkpoint(&latest.directory);
        session.latest_checkpoint = Some(latest.directory);

        session.epoch = epoch;
        session.history.push(report.clone());
        Ok(report)
    }

    /// Returns the epoch metrics and the number of steps skipped on overflow.
    pub fn train_epoch(&mut self, epoch: usize) -> Result<(PhaseMetrics, usize), TrainingError> {
        let mut accumulator = EpochAccumulator::new();
        let mut skipped = 0;

        for batch in self.train_batches.epoch(epoch) {
            let batch = batch?;
            let (metrics, outcome) = self.train_step(&batch)?;
            accumulator.record(&metrics);
            if outcome == StepOutcome::SkippedOverflow {
                skipped += 1;
            }
        }

        Ok((accumulator.finish(self.train_batches.len()), skipped))
    }

    /// Forward through both networks, backward through the scaled loss and an
    /// optimizer step on the adversary only.
    pub fn train_step(
        &mut self,
        batch: &ImageBatch,
    ) -> Result<(LossMetrics, StepOutcome), TrainingError> {
        let backbone_out = self
            .backbone
            .forward_t(&batch.images, true)
            .map_err(to_runtime_error)?;
        let adversary_out = self
            .adversary
            .forward_t(&backbone_out.features, true)
            .map_err(to_runtime_error)?;

        let LossOutput { loss, metrics } =
            self.loss.compute(&adversary_out.logits, &batch.sensitive_labels)?;

        // A fresh gradient store per batch; nothing carries over between steps.
        let mut grads = self.gradient_scaler.backward(&loss)?;
        let outcome = self.gradient_scaler.step(&mut self.optimizer, &mut grads)?;
        Ok((metrics, outcome))
    }

    pub fn validate_epoch(&mut self, epoch: usize) -> Result<PhaseMetrics, TrainingError> {
        let mut accumulator = EpochAccumulator::new();

        for batch in self.val_batches.epoch(epoch) {
            accumulator.record(&self.evaluate_batch(&batch?)?);
        }

        Ok(accumulator.finish(self.val_batches.len()))
    }

    /// Validation forward pass without building a graph. Only the backbone
    /// switches to eval mode; the adversary keeps normalising with batch
    /// statistics and updating its running buffers, as during training.
    pub fn evaluate_batch(&self, batch: &ImageBatch) -> Result<LossMetrics, TrainingError> {
        let backbone_out = self
            .backbone
            .forward(&batch.images)
            .map_err(to_runtime_error)?;
        let features = backbone_out.features.detach();
        let logits = self
            .adversary
            .forward_t(&features, true)
            .map_err(to_runtime_error)?
            .logits
            .detach();
        Ok(self.loss.compute(&logits, &batch.sensitive_labels)?.metrics)
    }

    /// Restores every component from a checkpoint directory and returns the
    /// session to continue from.
    pub fn resume_from(&mut self, directory: &Path) -> Result<TrainingSession, TrainingError> {
        let outcome = checkpoint::load_checkpoint(directory)?;
        if outcome.manifest.attribute != self.config.data.attribute {
            return Err(TrainingError::configuration(format!(
                "checkpoint was trained for attribute '{}', run is configured for '{}'",
                outcome.manifest.attribute, self.config.data.attribute
            )));
        }

        restore_backbone(&self.backbone, &outcome.backbone_weights_path, &self.device)?;
        checkpoint::apply_weights(
            &self.adversary.variables(),
            AttributeAdversary::PREFIX,
            &outcome.adversary_weights_path,
            &self.device,
        )?;
        self.optimizer.load_state(outcome.optimizer_state)?;
        self.scheduler.load_state(outcome.scheduler_state)?;
        self.optimizer.set_learning_rate(self.scheduler.learning_rate());
        self.gradient_scaler.load_state(outcome.scaler_state)?;

        info!(
            path = %directory.display(),
            epoch = outcome.manifest.epoch,
            best_accuracy = outcome.manifest.best_accuracy,
            "resumed from checkpoint"
        );

        Ok(TrainingSession {
            epoch: outcome.manifest.epoch,
            best_accuracy: outcome.manifest.best_accuracy,
            history: Vec::new(),
            latest_checkpoint: Some(directory.to_path_buf()),
            best_checkpoint: None,
        })
    }

    fn save(
        &self,
        kind: CheckpointKind,
        epoch: usize,
        val_accuracy: f64,
        best_accuracy: f64,
        max_keep: Option<usize>,
    ) -> Result<CheckpointDescriptor, TrainingError> {
        checkpoint::save_checkpoint(SaveRequest {
            base_dir: &self.config.runtime.checkpoint.directory,
            kind,
            attribute: self.config.data.attribute,
            epoch,
            val_accuracy,
            best_accuracy,
            backbone: &self.backbone,
            adversary: &self.adversary,
            optimizer: &self.optimizer,
            scheduler: self.scheduler.as_ref(),
            scaler: &self.gradient_scaler,
            max_keep,
        })
    }
}

/// Non-strict backbone restore; see [`checkpoint::apply_weights`].
pub fn restore_backbone(
    backbone: &ExpressionBackbone,
    weights: &Path,
    device: &Device,
) -> Result<WeightReport, TrainingError> {
    checkpoint::apply_weights(
        &backbone.variables(),
        ExpressionBackbone::PREFIX,
        weights,
        device,
    )
}

/// Prefers Metal, then CUDA, falling back to the CPU.
pub fn select_device(seed: u64) -> Device {
    let cuda_available = cuda_is_available();
    let metal_available = metal_is_available();
    debug!(cuda_available, metal_available, "device detection");

    let device = if metal_available {
        Device::new_metal(0).unwrap_or_else(|err| {
            warn!(error = %err, "failed to initialise Metal device; using CPU");
            Device::Cpu
        })
    } else if cuda_available {
        Device::cuda_if_available(0).unwrap_or_else(|err| {
            warn!(error = %err, "CUDA reported available but initialisation failed; using CPU");
            Device::Cpu
        })
    } else {
        info!("no GPU backend available; using CPU");
        Device::Cpu
    };

    if let Err(err) = device.set_seed(seed) {
        debug!(error = %err, "device RNG not seeded");
    }
    device
}

fn to_initialization_error(err: candle_core::Error) -> TrainingError {
    TrainingError::initialization(err.to_string())
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
