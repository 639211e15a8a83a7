pub mod checkpoint;
pub mod config;
pub mod data;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod optimizer;
pub mod scheduler;
pub mod trainer;

pub use config::{Attribute, OptimizerType, Precision, TrainingConfig, TrainingError};
pub use data::{BatchProvider, DatasetIndex, EpochBatches, ImageBatch, Split};
pub use loss::{CrossEntropyLoss, LossMetrics, LossOutput};
pub use metrics::{EpochReport, PhaseMetrics};
pub use optimizer::{
    GradientScaler, OptimizerConfig, OptimizerState, ParameterGroups, StepOutcome,
    TrainerOptimizer,
};
pub use scheduler::{ExponentialDecay, LRScheduler};
pub use trainer::{RunSummary, Trainer, TrainingSession};
