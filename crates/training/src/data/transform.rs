use image::{imageops::FilterType, RgbImage};
use rand::{rngs::StdRng, Rng};

use crate::config::TrainingError;

use super::Result;

pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Channel-major `(3, height, width)` float image.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor {
    pub height: usize,
    pub width: usize,
    pub data: Vec<f32>,
}

impl ImageTensor {
    pub const CHANNELS: usize = 3;

    pub fn shape(&self) -> (usize, usize, usize) {
        (Self::CHANNELS, self.height, self.width)
    }

    fn plane_len(&self) -> usize {
        self.height * self.width
    }
}

/// Randomly zeroes one rectangle of the normalized image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RandomErasing {
    pub probability: f64,
    pub scale: (f64, f64),
    pub ratio: (f64, f64),
    pub attempts: usize,
    pub value: f32,
}

impl Default for RandomErasing {
    fn default() -> Self {
        Self {
            probability: 0.5,
            scale: (0.02, 0.1),
            ratio: (0.3, 3.3),
            attempts: 10,
            value: 0.0,
        }
    }
}

impl RandomErasing {
    /// Returns the `(top, left, height, width)` region that was erased, if any.
    pub fn apply(
        &self,
        tensor: &mut ImageTensor,
        rng: &mut StdRng,
    ) -> Option<(usize, usize, usize, usize)> {
        if rng.gen::<f64>() >= self.probability {
            return None;
        }

        let area = tensor.plane_len() as f64;
        let log_ratio = (self.ratio.0.ln(), self.ratio.1.ln());

        for _ in 0..self.attempts {
            let erase_area = area * rng.gen_range(self.scale.0..=self.scale.1);
            let aspect = rng.gen_range(log_ratio.0..=log_ratio.1).exp();
            let h = (erase_area * aspect).sqrt().round() as usize;
            let w = (erase_area / aspect).sqrt().round() as usize;
            if h == 0 || w == 0 || h >= tensor.height || w >= tensor.width {
                continue;
            }

            let top = rng.gen_range(0..=tensor.height - h);
            let left = rng.gen_range(0..=tensor.width - w);
            let plane = tensor.plane_len();
            for channel in 0..ImageTensor::CHANNELS {
                for row in top..top + h {
                    let start = channel * plane + row * tensor.width + left;
                    tensor.data[start..start + w].fill(self.value);
                }
            }
            return Some((top, left, h, w));
        }

        None
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransformStep {
    /// Bilinear resize to `height x width`.
    Resize { height: usize, width: usize },
    /// HWC bytes to CHW floats in `[0, 1]`.
    ToTensor,
    Normalize { mean: [f32; 3], std: [f32; 3] },
    RandomErasing(RandomErasing),
}

impl TransformStep {
    pub fn is_random(&self) -> bool {
        matches!(self, TransformStep::RandomErasing(_))
    }
}

enum Stage {
    Image(RgbImage),
    Tensor(ImageTensor),
}

/// Ordered image transforms applied by the sample loader.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformPipeline {
    steps: Vec<TransformStep>,
}

impl TransformPipeline {
    pub fn new(steps: Vec<TransformStep>) -> Self {
        Self { steps }
    }

    pub fn train(height: usize, width: usize) -> Self {
        let mut pipeline = Self::eval(height, width);
        pipeline
            .steps
            .push(TransformStep::RandomErasing(RandomErasing::default()));
        pipeline
    }

    pub fn eval(height: usize, width: usize) -> Self {
        Self::new(vec![
            TransformStep::Resize { height, width },
            TransformStep::ToTensor,
            TransformStep::Normalize {
                mean: IMAGENET_MEAN,
                std: IMAGENET_STD,
            },
        ])
    }

    pub fn steps(&self) -> &[TransformStep] {
        &self.steps
    }

    pub fn is_deterministic(&self) -> bool {
        !self.steps.iter().any(TransformStep::is_random)
    }

    pub fn apply(&self, image: RgbImage, rng: &mut StdRng) -> Result<ImageTensor> {
        let mut stage = Stage::Image(image);

        for step in &self.steps {
            stage = match (step, stage) {
                (TransformStep::Resize { height, width }, Stage::Image(image)) => {
                    if image.height() as usize == *height && image.width() as usize == *width {
                        Stage::Image(image)
                    } else {
                        Stage::Image(image::imageops::resize(
                            &image,
                            *width as u32,
                            *height as u32,
                            FilterType::Triangle,
                        ))
                    }
                }
                (TransformStep::ToTensor, Stage::Image(image)) => Stage::Tensor(to_tensor(&image)),
                (TransformStep::Normalize { mean, std }, Stage::Tensor(mut tensor)) => {
                    normalize(&mut tensor, mean, std);
                    Stage::Tensor(tensor)
                }
                (TransformStep::RandomErasing(erasing), Stage::Tensor(mut tensor)) => {
                    erasing.apply(&mut tensor, rng);
                    Stage::Tensor(tensor)
                }
                (step, _) => {
                    return Err(TrainingError::configuration(format!(
                        "transform step {:?} applied to the wrong input kind",
                        step
                    )));
                }
            };
        }

        match stage {
            Stage::Tensor(tensor) => Ok(tensor),
            Stage::Image(_) => Err(TrainingError::configuration(
                "transform pipeline must end with a tensor conversion",
            )),
        }
    }
}

fn to_tensor(image: &RgbImage) -> ImageTensor {
    let (width, height) = (image.width() as usize, image.height() as usize);
    let plane = width * height;
    let mut data = vec![0f32; ImageTensor::CHANNELS * plane];
    for (offset, pixel) in image.pixels().enumerate() {
        for channel in 0..ImageTensor::CHANNELS {
            data[channel * plane + offset] = pixel[channel] as f32 / 255.0;
        }
    }
    ImageTensor {
        height,
        width,
        data,
    }
}

fn normalize(tensor: &mut ImageTensor, mean: &[f32; 3], std: &[f32; 3]) {
    let plane = tensor.plane_len();
    for (channel, values) in tensor.data.chunks_mut(plane).enumerate() {
        for value in values {
            *value = (*value - mean[channel]) / std[channel];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use rand::SeedableRng;

    fn solid(width: u32, height: u32, rgb: [u8; 3]) -> RgbImage {
        RgbImage::from_pixel(width, height, Rgb(rgb))
    }

    #[test]
    fn eval_pipeline_resizes_and_normalizes() {
        let pipeline = TransformPipeline::eval(8, 6);
        let mut rng = StdRng::seed_from_u64(0);
        let tensor = pipeline.apply(solid(20, 10, [255, 0, 128]), &mut rng).unwrap();

        assert_eq!(tensor.shape(), (3, 8, 6));
        let plane = 8 * 6;
        let red = (1.0 - IMAGENET_MEAN[0]) / IMAGENET_STD[0];
        let green = (0.0 - IMAGENET_MEAN[1]) / IMAGENET_STD[1];
        assert!((tensor.data[0] - red).abs() < 1e-2);
        assert!((tensor.data[plane] - green).abs() < 1e-2);
        assert!(pipeline.is_deterministic());
    }

    #[test]
    fn train_pipeline_ends_with_random_erasing() {
        let pipeline = TransformPipeline::train(4, 4);
        assert!(!pipeline.is_deterministic());
        assert!(matches!(
            pipeline.steps().last(),
            Some(TransformStep::RandomErasing(_))
        ));
    }

    #[test]
    fn erasing_zeroes_a_bounded_rectangle() {
        let erasing = RandomErasing {
            probability: 1.0,
            ..RandomErasing::default()
        };
        let mut rng = StdRng::seed_from_u64(3);
        let mut tensor = ImageTensor {
            height: 32,
            width: 32,
            data: vec![1.0; 3 * 32 * 32],
        };

        let (_, _, h, w) = erasing.apply(&mut tensor, &mut rng).expect("region erased");
        let zeros = tensor.data.iter().filter(|v| **v == 0.0).count();
        assert_eq!(zeros, 3 * h * w);
        let fraction = (h * w) as f64 / (32.0 * 32.0);
        assert!(fraction > 0.005 && fraction < 0.15, "fraction {}", fraction);
    }

    #[test]
    fn misordered_steps_are_rejected() {
        let pipeline = TransformPipeline::new(vec![TransformStep::Normalize {
            mean: IMAGENET_MEAN,
            std: IMAGENET_STD,
        }]);
        let mut rng = StdRng::seed_from_u64(0);
        assert!(matches!(
            pipeline.apply(solid(2, 2, [0, 0, 0]), &mut rng),
            Err(TrainingError::Configuration(_))
        ));
    }
}
