use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use clap::Parser;
use tracing::info;
use training::{Attribute, OptimizerType, Precision, Trainer, TrainingConfig, TrainingError};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Err(err) = run() {
        eprintln!("training failed: {}", err);
        std::process::exit(1);
    }
}

/// Trains a sensitive-attribute adversary on RAF-DB expression features.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Optional TOML/JSON config; flags below override its values.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Raf-DB dataset path [default: ./datasets/raf-basic/]
    #[arg(long, value_name = "DIR")]
    raf_path: Option<PathBuf>,

    /// Backbone weights: a checkpoint directory or a .safetensors file.
    #[arg(short, long, value_name = "PATH")]
    checkpoint: Option<PathBuf>,

    /// Continue a run from a checkpoint directory.
    #[arg(long, value_name = "DIR", conflicts_with = "checkpoint")]
    resume: Option<PathBuf>,

    /// Batch size [default: 256]
    #[arg(long)]
    batch_size: Option<usize>,

    /// Batch size for validation [default: 64]
    #[arg(long)]
    val_batch_size: Option<usize>,

    /// adam or sgd [default: adam]
    #[arg(long, value_parser = parse_optimizer)]
    optimizer: Option<OptimizerType>,

    /// Initial learning rate [default: 0.01 for sgd, 0.001 for adam]
    #[arg(long)]
    lr: Option<f64>,

    /// Momentum for sgd [default: 0.9]
    #[arg(long)]
    momentum: Option<f64>,

    /// Number of data loading workers [default: 4]
    #[arg(long)]
    workers: Option<usize>,

    /// Total training epochs [default: 70]
    #[arg(long)]
    epochs: Option<usize>,

    /// age, gender or emotion [default: emotion]
    #[arg(long, value_parser = parse_attribute)]
    attribute: Option<Attribute>,

    /// Write TensorBoard scalars to this directory.
    #[arg(long, value_name = "DIR")]
    tensorboard: Option<PathBuf>,

    /// Checkpoint directory [default: models/RAF-DB]
    #[arg(long, value_name = "DIR")]
    output_dir: Option<PathBuf>,

    /// Square input resolution [default: 224]
    #[arg(long)]
    image_size: Option<usize>,

    /// Seed for shuffling and augmentation [default: 42]
    #[arg(long)]
    seed: Option<u64>,

    /// fp32 or mixed [default: mixed]
    #[arg(long, value_parser = parse_precision)]
    precision: Option<Precision>,

    /// Keep only the newest N per-epoch checkpoints.
    #[arg(long, value_name = "N")]
    max_keep_latest: Option<usize>,
}

fn parse_optimizer(value: &str) -> Result<OptimizerType, String> {
    value.parse().map_err(|err: TrainingError| err.to_string())
}

fn parse_attribute(value: &str) -> Result<Attribute, String> {
    value.parse().map_err(|err: TrainingError| err.to_string())
}

fn parse_precision(value: &str) -> Result<Precision, String> {
    value.parse().map_err(|err: TrainingError| err.to_string())
}

impl Args {
    fn into_config(self) -> Result<TrainingConfig, TrainingError> {
        let mut config = match self.config.as_ref() {
            Some(path) => TrainingConfig::from_path(path)?,
            None => TrainingConfig::default(),
        };

        if let Some(root) = self.raf_path {
            config.data.root = root;
        }
        if let Some(attribute) = self.attribute {
            config.data.attribute = attribute;
        }
        if let Some(batch_size) = self.batch_size {
            config.data.batch_size = batch_size;
        }
        if let Some(val_batch_size) = self.val_batch_size {
            config.data.val_batch_size = val_batch_size;
        }
        if let Some(workers) = self.workers {
            config.data.num_workers = workers;
        }
        if let Some(image_size) = self.image_size {
            config.data.image_size = image_size;
        }
        if let Some(algorithm) = self.optimizer {
            config.optimizer.algorithm = algorithm;
        }
        if let Some(lr) = self.lr {
            config.optimizer.learning_rate = Some(lr);
        }
        if let Some(momentum) = self.momentum {
            config.optimizer.momentum = momentum;
        }
        if let Some(epochs) = self.epochs {
            config.runtime.epochs = epochs;
        }
        if let Some(seed) = self.seed {
            config.runtime.seed = seed;
        }
        if let Some(precision) = self.precision {
            config.runtime.precision = precision;
        }
        if let Some(directory) = self.output_dir {
            config.runtime.checkpoint.directory = directory;
        }
        if let Some(path) = self.checkpoint {
            config.runtime.checkpoint.init_from = Some(path);
        }
        if let Some(path) = self.resume {
            config.runtime.checkpoint.resume_from = Some(path);
        }
        if let Some(limit) = self.max_keep_latest {
            config.runtime.checkpoint.max_keep_latest = Some(limit);
        }
        if let Some(dir) = self.tensorboard {
            config.runtime.logging.tensorboard = Some(dir);
        }

        config.validate()?;
        Ok(config)
    }
}

fn run() -> Result<(), TrainingError> {
    let config = Args::parse().into_config()?;
    let mut trainer = Trainer::new(config)?;

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let handler_flag = shutdown_flag.clone();
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::Relaxed);
    })
    .map_err(|err| TrainingError::runtime(format!("failed to install signal handler: {err}")))?;

    let summary = trainer.run_with_shutdown(|| shutdown_flag.load(Ordering::Relaxed))?;
    info!(
        best_accuracy = summary.best_accuracy,
        epochs = summary.epochs.len(),
        stopped_early = summary.stopped_early,
        latest_checkpoint = ?summary.latest_checkpoint,
        "run complete"
    );

    Ok(())
}
