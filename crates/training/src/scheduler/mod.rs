use serde::{Deserialize, Serialize};

use crate::{config, TrainingError};

pub trait LRScheduler: Send {
    /// Advances one epoch and returns the new learning rate.
    fn step(&mut self) -> f64;
    fn learning_rate(&self) -> f64;
    fn state(&self) -> SchedulerState;
    fn load_state(&mut self, state: SchedulerState) -> Result<(), TrainingError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    pub base_lr: f64,
    pub gamma: f64,
    pub last_epoch: usize,
}

/// `lr = base_lr * gamma^epoch`.
#[derive(Debug, Clone)]
pub struct ExponentialDecay {
    base_lr: f64,
    gamma: f64,
    last_epoch: usize,
}

impl ExponentialDecay {
    pub fn new(base_lr: f64, gamma: f64) -> Result<Self, TrainingError> {
        if !(base_lr > 0.0 && base_lr.is_finite()) {
            return Err(TrainingError::initialization(
                "scheduler base learning rate must be positive",
            ));
        }
        if !(gamma > 0.0 && gamma <= 1.0) {
            return Err(TrainingError::initialization(
                "scheduler gamma must be in (0, 1]",
            ));
        }
        Ok(Self {
            base_lr,
            gamma,
            last_epoch: 0,
        })
    }

    pub fn from_training_config(
        cfg: &config::SchedulerConfig,
        base_lr: f64,
    ) -> Result<Self, TrainingError> {
        Self::new(base_lr, cfg.gamma)
    }

    pub fn last_epoch(&self) -> usize {
        self.last_epoch
    }

    fn compute_lr(&self, epoch: usize) -> f64 {
        self.base_lr * self.gamma.powi(epoch as i32)
    }
}

impl LRScheduler for ExponentialDecay {
    fn step(&mut self) -> f64 {
        self.last_epoch += 1;
        self.learning_rate()
    }

    fn learning_rate(&self) -> f64 {
        self.compute_lr(self.last_epoch)
    }

    fn state(&self) -> SchedulerState {
        SchedulerState {
            base_lr: self.base_lr,
            gamma: self.gamma,
            last_epoch: self.last_epoch,
        }
    }

    fn load_state(&mut self, state: SchedulerState) -> Result<(), TrainingError> {
        let restored = Self::new(state.base_lr, state.gamma)?;
        *self = Self {
            last_epoch: state.last_epoch,
            ..restored
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decays_geometrically() {
        let mut scheduler = ExponentialDecay::new(0.01, 0.9).unwrap();
        assert_eq!(scheduler.learning_rate(), 0.01);

        let mut last = 0.0;
        for k in 1..=5 {
            last = scheduler.step();
            let expected = 0.01 * 0.9f64.powi(k);
            assert!((last - expected).abs() < 1e-12);
        }
        assert_eq!(scheduler.last_epoch(), 5);
        assert_eq!(last, scheduler.learning_rate());
    }

    #[test]
    fn rejects_invalid_gamma() {
        assert!(ExponentialDecay::new(0.01, 0.0).is_err());
        assert!(ExponentialDecay::new(0.01, 1.1).is_err());
        assert!(ExponentialDecay::new(0.0, 0.9).is_err());
    }

    #[test]
    fn state_resumes_the_schedule() {
        let mut scheduler = ExponentialDecay::new(1e-3, 0.9).unwrap();
        scheduler.step();
        scheduler.step();

        let mut resumed = ExponentialDecay::new(5.0, 0.5).unwrap();
        resumed.load_state(scheduler.state()).unwrap();
        assert_eq!(resumed.step(), scheduler.step());
    }
}
