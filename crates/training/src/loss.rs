use candle_core::{DType, Tensor, D};
use candle_nn::ops;

use crate::TrainingError;

/// Mean cross entropy over a `(batch, classes)` logit matrix.
#[derive(Debug, Clone, Default)]
pub struct CrossEntropyLoss;

impl CrossEntropyLoss {
    pub fn new() -> Self {
        Self
    }

    /// `targets` holds one class index per row of `logits`.
    pub fn compute(&self, logits: &Tensor, targets: &Tensor) -> Result<LossOutput, TrainingError> {
        let (batch, classes) = match logits.dims() {
            [batch, classes] => (*batch, *classes),
            dims => {
                return Err(TrainingError::runtime(format!(
                    "cross entropy expects (batch, classes) logits, got {:?}",
                    dims
                )))
            }
        };
        if batch == 0 || classes == 0 {
            return Err(TrainingError::runtime(
                "cross entropy received an empty logit matrix",
            ));
        }
        if targets.dims() != [batch] {
            return Err(TrainingError::runtime(format!(
                "targets shaped {:?} do not match {} logit rows",
                targets.dims(),
                batch
            )));
        }

        let targets = targets.to_device(logits.device()).map_err(to_runtime_error)?;
        let targets = match targets.dtype() {
            DType::U32 => targets,
            DType::I64 | DType::U8 => targets.to_dtype(DType::U32).map_err(to_runtime_error)?,
            dtype => {
                return Err(TrainingError::runtime(format!(
                    "unsupported target dtype {:?} for cross entropy",
                    dtype
                )))
            }
        };

        let logits_f32 = logits.to_dtype(DType::F32).map_err(to_runtime_error)?;
        let log_probs = ops::log_softmax(&logits_f32, D::Minus1).map_err(to_runtime_error)?;
        let nll = log_probs
            .gather(&targets.unsqueeze(1).map_err(to_runtime_error)?, 1)
            .map_err(to_runtime_error)?
            .squeeze(1)
            .map_err(to_runtime_error)?
            .neg()
            .map_err(to_runtime_error)?;
        let loss = nll.mean_all().map_err(to_runtime_error)?;
        let average_loss = loss.to_vec0::<f32>().map_err(to_runtime_error)?;

        let correct = logits_f32
            .argmax(D::Minus1)
            .map_err(to_runtime_error)?
            .eq(&targets)
            .map_err(to_runtime_error)?
            .to_dtype(DType::F32)
            .map_err(to_runtime_error)?
            .sum_all()
            .map_err(to_runtime_error)?
            .to_vec0::<f32>()
            .map_err(to_runtime_error)?
            .round() as usize;

        Ok(LossOutput {
            loss,
            metrics: LossMetrics {
                average_loss,
                batch_size: batch,
                correct,
            },
        })
    }
}

#[derive(Debug, Clone)]
pub struct LossOutput {
    pub loss: Tensor,
    pub metrics: LossMetrics,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossMetrics {
    average_loss: f32,
    batch_size: usize,
    correct: usize,
}

impl LossMetrics {
    pub fn average_loss(&self) -> f32 {
        self.average_loss
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Rows whose argmax equals the target.
    pub fn correct(&self) -> usize {
        self.correct
    }

    pub fn accuracy(&self) -> f32 {
        if self.batch_size == 0 {
            0.0
        } else {
            self.correct as f32 / self.batch_size as f32
        }
    }
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn matches_hand_computed_cross_entropy() {
        let device = Device::Cpu;
        let logits = Tensor::new(&[[2.0f32, 0.0], [0.0, 1.0]], &device).unwrap();
        let targets = Tensor::new(&[0u32, 0], &device).unwrap();

        let output = CrossEntropyLoss::new().compute(&logits, &targets).unwrap();
        let first = -(2f32.exp() / (2f32.exp() + 1.0)).ln();
        let second = (1.0 + 1f32.exp()).ln();
        let expected = (first + second) / 2.0;

        assert!((output.metrics.average_loss() - expected).abs() < 1e-5);
        assert_eq!(output.metrics.batch_size(), 2);
        assert_eq!(output.metrics.correct(), 1);
        assert!((output.metrics.accuracy() - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn rejects_mismatched_targets() {
        let device = Device::Cpu;
        let logits = Tensor::zeros((3, 2), DType::F32, &device).unwrap();
        let targets = Tensor::new(&[0u32, 1], &device).unwrap();
        assert!(CrossEntropyLoss::new().compute(&logits, &targets).is_err());
    }
}
