use candle_core::{backprop::GradStore, DType, Tensor};
use serde::{Deserialize, Serialize};

use crate::{config::Precision, TrainingError};

use super::{to_runtime_error, TrainerOptimizer};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossScaleConfig {
    pub initial_scale: f32,
    pub growth_factor: f32,
    pub backoff_factor: f32,
    pub growth_interval: usize,
    pub min_scale: f32,
    pub max_scale: f32,
}

impl Default for LossScaleConfig {
    fn default() -> Self {
        Self {
            initial_scale: 2f32.powi(16),
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
            min_scale: 1.0,
            max_scale: 2f32.powi(24),
        }
    }
}

/// Whether an optimizer step was applied for the current batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Applied,
    SkippedOverflow,
}

/// Dynamic loss scaling wrapped around `backward` and `optimizer.step`.
#[derive(Debug, Clone)]
pub struct GradientScaler {
    state: ScalerState,
}

#[derive(Debug, Clone)]
enum ScalerState {
    Disabled,
    Enabled(EnabledState),
}

#[derive(Debug, Clone)]
struct EnabledState {
    loss_scale: f32,
    stable_steps: usize,
    config: LossScaleConfig,
}

/// Serializable scaler snapshot stored next to the optimizer state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradientScalerState {
    pub enabled: bool,
    pub loss_scale: f32,
    pub stable_steps: usize,
    pub config: Option<LossScaleConfig>,
}

impl GradientScaler {
    pub fn new(precision: Precision) -> Self {
        Self::with_config(LossScaleConfig::default(), precision)
    }

    pub fn with_config(config: LossScaleConfig, precision: Precision) -> Self {
        if precision == Precision::Fp32 {
            return Self {
                state: ScalerState::Disabled,
            };
        }

        let cfg = sanitize_config(config);
        Self {
            state: ScalerState::Enabled(EnabledState {
                loss_scale: cfg.initial_scale,
                stable_steps: 0,
                config: cfg,
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self.state, ScalerState::Enabled(_))
    }

    pub fn loss_scale(&self) -> f32 {
        match &self.state {
            ScalerState::Disabled => 1.0,
            ScalerState::Enabled(state) => state.loss_scale,
        }
    }

    pub fn scale(&self, tensor: &Tensor) -> Result<Tensor, TrainingError> {
        match &self.state {
            ScalerState::Disabled => Ok(tensor.clone()),
            ScalerState::Enabled(state) => tensor
                .affine(state.loss_scale as f64, 0.0)
                .map_err(to_runtime_error),
        }
    }

    pub fn unscale(&self, tensor: &Tensor) -> Result<Tensor, TrainingError> {
        match &self.state {
            ScalerState::Disabled => Ok(tensor.clone()),
            ScalerState::Enabled(state) => {
                let scale = 1.0 / state.loss_scale;
                tensor.affine(scale as f64, 0.0).map_err(to_runtime_error)
            }
        }
    }

    /// Backward pass through the scaled loss.
    pub fn backward(&self, loss: &Tensor) -> Result<GradStore, TrainingError> {
        self.scale(loss)?.backward().map_err(to_runtime_error)
    }

    /// Unscales the optimizer's gradients in place, then steps unless any of
    /// them is non-finite. The loss scale is updated either way.
    pub fn step(
        &mut self,
        optimizer: &mut TrainerOptimizer,
        grads: &mut GradStore,
    ) -> Result<StepOutcome, TrainingError> {
        if !self.is_enabled() {
            optimizer.step(grads)?;
            return Ok(StepOutcome::Applied);
        }

        let mut found_inf = false;
        for var in optimizer.variables() {
            let Some(grad) = grads.get(var.as_tensor()) else {
                continue;
            };
            let unscaled = self.unscale(grad)?;
            if !found_inf && contains_non_finite(&unscaled)? {
                found_inf = true;
            }
            grads.insert(var.as_tensor(), unscaled);
        }

        self.update(found_inf);
        if found_inf {
            optimizer.zero_grad(grads);
            return Ok(StepOutcome::SkippedOverflow);
        }

        optimizer.step(grads)?;
        Ok(StepOutcome::Applied)
    }

    pub fn has_overflow<I>(&self, tensors: I) -> Result<bool, TrainingError>
    where
        I: IntoIterator,
        I::Item: AsRef<Tensor>,
    {
        match &self.state {
            ScalerState::Disabled => Ok(false),
            ScalerState::Enabled(_) => {
                for tensor in tensors {
                    if contains_non_finite(tensor.as_ref())? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }

    pub fn update(&mut self, found_inf: bool) {
        if let ScalerState::Enabled(state) = &mut self.state {
            if found_inf {
                state.loss_scale =
                    (state.loss_scale * state.config.backoff_factor).max(state.config.min_scale);
                state.stable_steps = 0;
            } else {
                state.stable_steps += 1;
                if state.stable_steps >= state.config.growth_interval {
                    state.loss_scale =
                        (state.loss_scale * state.config.growth_factor).min(state.config.max_scale);
                    state.stable_steps = 0;
                }
            }
        }
    }

    pub fn state(&self) -> GradientScalerState {
        match &self.state {
            ScalerState::Disabled => GradientScalerState {
                enabled: false,
                loss_scale: 1.0,
                stable_steps: 0,
                config: None,
            },
            ScalerState::Enabled(state) => GradientScalerState {
                enabled: true,
                loss_scale: state.loss_scale,
                stable_steps: state.stable_steps,
                config: Some(state.config.clone()),
            },
        }
    }

    /// Restores the dynamic scale. A disabled scaler ignores saved state.
    pub fn load_state(&mut self, saved: GradientScalerState) -> Result<(), TrainingError> {
        match &mut self.state {
            ScalerState::Disabled => Ok(()),
            ScalerState::Enabled(state) => {
                if !saved.enabled {
                    return Ok(());
                }
                if !saved.loss_scale.is_finite() || saved.loss_scale <= 0.0 {
                    return Err(TrainingError::runtime(format!(
                        "invalid saved loss scale {}",
                        saved.loss_scale
                    )));
                }
                if let Some(config) = saved.config {
                    state.config = sanitize_config(config);
                }
                state.loss_scale = saved
                    .loss_scale
                    .clamp(state.config.min_scale, state.config.max_scale);
                state.stable_steps = saved.stable_steps;
                Ok(())
            }
        }
    }
}

fn contains_non_finite(tensor: &Tensor) -> Result<bool, TrainingError> {
    if tensor.elem_count() == 0 {
        return Ok(false);
    }
    let sum = tensor
        .to_dtype(DType::F32)
        .map_err(to_runtime_error)?
        .sqr()
        .map_err(to_runtime_error)?
        .sum_all()
        .map_err(to_runtime_error)?
        .to_vec0::<f32>()
        .map_err(to_runtime_error)?;
    Ok(!sum.is_finite())
}

fn sanitize_config(mut config: LossScaleConfig) -> LossScaleConfig {
    if config.growth_factor < 1.0 {
        config.growth_factor = 1.0;
    }
    if !(0.0..1.0).contains(&config.backoff_factor) {
        config.backoff_factor = 0.5;
    }
    if config.growth_interval == 0 {
        config.growth_interval = 1;
    }
    if config.min_scale <= 0.0 {
        config.min_scale = 1.0;
    }
    if config.max_scale < config.min_scale {
        config.max_scale = config.min_scale;
    }
    config.initial_scale = config
        .initial_scale
        .clamp(config.min_scale, config.max_scale);
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::{OptimizerConfig, SgdConfig};
    use candle_core::{Device, Tensor, Var};

    fn tensor_from(data: &[f32]) -> Tensor {
        Tensor::from_slice(data, (data.len(),), &Device::Cpu).unwrap()
    }

    fn sgd(var: &Var) -> TrainerOptimizer {
        TrainerOptimizer::new(
            vec![("w".into(), var.clone())],
            OptimizerConfig::Sgd(SgdConfig {
                learning_rate: 0.5,
                momentum: 0.0,
                weight_decay: 0.0,
            }),
        )
        .unwrap()
    }

    #[test]
    fn clean_steps_grow_the_scale_until_the_cap() {
        let w = Var::from_tensor(&tensor_from(&[1.0])).unwrap();
        let mut optimizer = sgd(&w);
        let mut scaler = GradientScaler::with_config(
            LossScaleConfig {
                initial_scale: 512.0,
                growth_interval: 2,
                max_scale: 1024.0,
                ..LossScaleConfig::default()
            },
            Precision::Mixed,
        );

        let mut scales = Vec::new();
        for _ in 0..4 {
            let loss = w.as_tensor().affine(3.0, 0.0).unwrap().sum_all().unwrap();
            let mut grads = scaler.backward(&loss).unwrap();
            assert_eq!(
                scaler.step(&mut optimizer, &mut grads).unwrap(),
                StepOutcome::Applied
            );
            scales.push(scaler.loss_scale());
        }

        assert_eq!(scales, vec![512.0, 1024.0, 1024.0, 1024.0]);
        assert_eq!(scaler.state().stable_steps, 0);
        // Every step saw the unscaled gradient of 3.
        let value = w.as_tensor().to_vec1::<f32>().unwrap()[0];
        assert!((value + 5.0).abs() < 1e-5, "value {}", value);
    }

    #[test]
    fn backoff_is_floored_at_min_scale_and_resets_the_streak() {
        let mut scaler = GradientScaler::with_config(
            LossScaleConfig {
                initial_scale: 8.0,
                backoff_factor: 0.25,
                min_scale: 1.5,
                growth_interval: 3,
                ..LossScaleConfig::default()
            },
            Precision::Mixed,
        );

        scaler.update(false);
        scaler.update(false);
        assert_eq!(scaler.state().stable_steps, 2);

        scaler.update(true);
        assert_eq!(scaler.loss_scale(), 2.0);
        assert_eq!(scaler.state().stable_steps, 0);

        scaler.update(true);
        assert_eq!(scaler.loss_scale(), 1.5);
    }

    #[test]
    fn overflow_check_flags_nan_only_when_scaling() {
        let mixed = GradientScaler::new(Precision::Mixed);
        let fp32 = GradientScaler::new(Precision::Fp32);
        let clean = [tensor_from(&[0.25, -7.0]), tensor_from(&[1e30])];
        let poisoned = [tensor_from(&[1.0]), tensor_from(&[2.0, f32::NAN])];

        assert!(!mixed.has_overflow(&clean).unwrap());
        assert!(mixed.has_overflow(&poisoned).unwrap());
        assert!(!fp32.has_overflow(&poisoned).unwrap());
    }

    #[test]
    fn fp32_step_applies_raw_gradients_and_saves_no_scale() {
        let w = Var::from_tensor(&tensor_from(&[1.0])).unwrap();
        let mut optimizer = sgd(&w);
        let mut scaler = GradientScaler::new(Precision::Fp32);

        let loss = w.as_tensor().affine(3.0, 0.0).unwrap().sum_all().unwrap();
        let mut grads = scaler.backward(&loss).unwrap();
        let grad = grads.get(w.as_tensor()).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(grad, vec![3.0]);

        let outcome = scaler.step(&mut optimizer, &mut grads).unwrap();
        assert_eq!(outcome, StepOutcome::Applied);
        assert_eq!(w.as_tensor().to_vec1::<f32>().unwrap(), vec![-0.5]);

        let state = scaler.state();
        assert!(!state.enabled);
        assert_eq!(state.loss_scale, 1.0);
        assert_eq!(state.config, None);
    }

    #[test]
    fn scaled_step_matches_unscaled_update() {
        let w = Var::from_tensor(&tensor_from(&[1.0])).unwrap();
        let mut optimizer = sgd(&w);
        let mut scaler = GradientScaler::with_config(
            LossScaleConfig {
                initial_scale: 1024.0,
                ..LossScaleConfig::default()
            },
            Precision::Mixed,
        );

        let loss = w.as_tensor().affine(3.0, 0.0).unwrap().sum_all().unwrap();
        let mut grads = scaler.backward(&loss).unwrap();
        let outcome = scaler.step(&mut optimizer, &mut grads).unwrap();

        assert_eq!(outcome, StepOutcome::Applied);
        let value = w.as_tensor().to_vec1::<f32>().unwrap()[0];
        assert!((value + 0.5).abs() < 1e-5, "value {}", value);
    }

    #[test]
    fn overflow_skips_the_step_and_backs_off() {
        let w = Var::from_tensor(&tensor_from(&[1.0])).unwrap();
        let mut optimizer = sgd(&w);
        let mut scaler = GradientScaler::with_config(
            LossScaleConfig {
                initial_scale: 1024.0,
                ..LossScaleConfig::default()
            },
            Precision::Mixed,
        );

        let loss = w
            .as_tensor()
            .affine(f32::MAX as f64, 0.0)
            .unwrap()
            .sum_all()
            .unwrap();
        let mut grads = scaler.backward(&loss).unwrap();
        let outcome = scaler.step(&mut optimizer, &mut grads).unwrap();

        assert_eq!(outcome, StepOutcome::SkippedOverflow);
        assert_eq!(w.as_tensor().to_vec1::<f32>().unwrap(), vec![1.0]);
        assert_eq!(scaler.loss_scale(), 512.0);
    }

    #[test]
    fn state_restores_the_dynamic_scale() {
        let mut scaler = GradientScaler::new(Precision::Mixed);
        scaler.update(true);
        let saved = scaler.state();

        let mut fresh = GradientScaler::new(Precision::Mixed);
        fresh.load_state(saved.clone()).unwrap();
        assert_eq!(fresh.state(), saved);

        let mut disabled = GradientScaler::new(Precision::Fp32);
        disabled.load_state(saved).unwrap();
        assert_eq!(disabled.loss_scale(), 1.0);
    }
}
