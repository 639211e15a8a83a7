//! RAF-DB input pipeline: manifest indexing, per-sample loading and batching.

pub mod index;
pub mod loader;
pub mod sample;
pub mod transform;

use crate::TrainingError;

pub use index::{DatasetIndex, SampleRecord, Split};
pub use loader::{BatchOptions, BatchProvider, EpochBatches, ImageBatch};
pub use sample::{Augmentation, Sample, SampleLoader};
pub use transform::{ImageTensor, RandomErasing, TransformPipeline, TransformStep};

/// Result alias for data pipeline fallible operations.
pub type Result<T> = std::result::Result<T, TrainingError>;
