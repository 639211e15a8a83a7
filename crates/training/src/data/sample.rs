use std::sync::Arc;

use image::RgbImage;
use rand::{rngs::StdRng, Rng};
use rand_distr::{Distribution, Normal};

use crate::config::TrainingError;

use super::{
    index::DatasetIndex,
    transform::{ImageTensor, TransformPipeline},
    Result,
};

/// Variance of the additive noise augmentation on the 0..255 scale.
pub const NOISE_VARIANCE: f64 = 30.0;

/// One transformed sample ready for collation.
#[derive(Debug, Clone)]
pub struct Sample {
    pub image: ImageTensor,
    pub emotion_label: u32,
    pub index: usize,
    pub sensitive_label: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Augmentation {
    HorizontalFlip,
    GaussianNoise,
}

impl Augmentation {
    pub const ALL: [Augmentation; 2] = [Augmentation::HorizontalFlip, Augmentation::GaussianNoise];

    pub fn apply(self, image: &mut RgbImage, rng: &mut StdRng) {
        match self {
            Augmentation::HorizontalFlip => image::imageops::flip_horizontal_in_place(image),
            Augmentation::GaussianNoise => add_gaussian_noise(image, NOISE_VARIANCE, rng),
        }
    }
}

/// Loads, augments and transforms indexed samples.
#[derive(Debug, Clone)]
pub struct SampleLoader {
    index: Arc<DatasetIndex>,
    transform: TransformPipeline,
    augment: bool,
}

impl SampleLoader {
    /// Augmentation is enabled for the training split only. Fails if any
    /// indexed image is missing.
    pub fn new(index: Arc<DatasetIndex>, transform: TransformPipeline) -> Result<Self> {
        index.verify_files()?;
        let augment = index.split().is_train();
        Ok(Self {
            index,
            transform,
            augment,
        })
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn index(&self) -> &DatasetIndex {
        &self.index
    }

    pub fn augments(&self) -> bool {
        self.augment
    }

    pub fn load(&self, index: usize, rng: &mut StdRng) -> Result<Sample> {
        let record = self.index.get(index).ok_or_else(|| {
            TrainingError::runtime(format!(
                "sample index {} out of range for {} records",
                index,
                self.index.len()
            ))
        })?;

        let mut image = image::open(&record.image_path)
            .map_err(|err| TrainingError::image(&record.image_path, err.to_string()))?
            .to_rgb8();

        if self.augment && rng.gen_bool(0.5) {
            let choice = Augmentation::ALL[rng.gen_range(0..Augmentation::ALL.len())];
            choice.apply(&mut image, rng);
        }

        let image = self.transform.apply(image, rng)?;

        Ok(Sample {
            image,
            emotion_label: record.emotion_label,
            index,
            sensitive_label: record.sensitive_label,
        })
    }
}

pub fn add_gaussian_noise(image: &mut RgbImage, variance: f64, rng: &mut StdRng) {
    let Ok(noise) = Normal::new(0.0, variance.sqrt()) else {
        return;
    };
    for value in image.iter_mut() {
        let noisy = *value as f64 + noise.sample(rng);
        *value = noisy.round().clamp(0.0, 255.0) as u8;
    }
}
