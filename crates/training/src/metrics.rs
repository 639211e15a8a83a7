use serde::{Deserialize, Serialize};

use crate::loss::LossMetrics;

/// Running sums for one pass over a split.
#[derive(Debug, Clone, Default)]
pub struct EpochAccumulator {
    loss_sum: f64,
    batches: usize,
    correct: usize,
    samples: usize,
}

impl EpochAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, metrics: &LossMetrics) {
        self.loss_sum += metrics.average_loss() as f64;
        self.batches += 1;
        self.correct += metrics.correct();
        self.samples += metrics.batch_size();
    }

    pub fn batches(&self) -> usize {
        self.batches
    }

    /// Mean of per-batch losses and `correct / dataset_len`.
    pub fn finish(&self, dataset_len: usize) -> PhaseMetrics {
        let loss = if self.batches == 0 {
            0.0
        } else {
            self.loss_sum / self.batches as f64
        };
        let accuracy = if dataset_len == 0 {
            0.0
        } else {
            self.correct as f64 / dataset_len as f64
        };
        PhaseMetrics {
            loss,
            accuracy,
            correct: self.correct,
            samples: self.samples,
            batches: self.batches,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhaseMetrics {
    pub loss: f64,
    pub accuracy: f64,
    pub correct: usize,
    pub samples: usize,
    pub batches: usize,
}

impl PhaseMetrics {
    /// Accuracy rounded to four decimals, the precision used for comparison and logging.
    pub fn rounded_accuracy(&self) -> f64 {
        round4(self.accuracy)
    }
}

/// Everything observed during one train/validate cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochReport {
    pub epoch: usize,
    /// Learning rate the training pass ran with.
    pub learning_rate: f64,
    pub train: PhaseMetrics,
    pub validation: PhaseMetrics,
    /// Rounded validation accuracy.
    pub val_accuracy: f64,
    pub best_accuracy: f64,
    pub improved: bool,
    pub skipped_steps: usize,
}

pub fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loss::CrossEntropyLoss;
    use candle_core::{Device, Tensor};

    #[test]
    fn averages_batches_and_divides_by_dataset_size() {
        let device = Device::Cpu;
        let loss = CrossEntropyLoss::new();
        let mut accumulator = EpochAccumulator::new();

        let logits = Tensor::new(&[[5.0f32, 0.0], [0.0, 5.0]], &device).unwrap();
        let first = loss
            .compute(&logits, &Tensor::new(&[0u32, 0], &device).unwrap())
            .unwrap();
        accumulator.record(&first.metrics);
        let logits = Tensor::new(&[[0.0f32, 5.0]], &device).unwrap();
        let last = loss
            .compute(&logits, &Tensor::new(&[1u32], &device).unwrap())
            .unwrap();
        accumulator.record(&last.metrics);

        let phase = accumulator.finish(3);
        assert_eq!(phase.correct, 2);
        assert_eq!(phase.samples, 3);
        assert_eq!(phase.batches, 2);
        assert!((phase.accuracy - 2.0 / 3.0).abs() < 1e-12);
        let expected = (first.metrics.average_loss() as f64
            + last.metrics.average_loss() as f64)
            / 2.0;
        assert!((phase.loss - expected).abs() < 1e-9);
        assert_eq!(phase.rounded_accuracy(), 0.6667);
    }

    #[test]
    fn empty_accumulator_reports_zero() {
        let phase = EpochAccumulator::new().finish(0);
        assert_eq!(phase.loss, 0.0);
        assert_eq!(phase.accuracy, 0.0);
    }
}
