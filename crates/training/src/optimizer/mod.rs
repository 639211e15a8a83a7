use std::collections::HashMap;

pub mod scaler;

pub use scaler::{GradientScaler, GradientScalerState, LossScaleConfig, StepOutcome};

use candle_core::{backprop::GradStore, DType, Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::{config, TrainingError};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OptimizerConfig {
    Adam(AdamConfig),
    Sgd(SgdConfig),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SgdConfig {
    pub learning_rate: f64,
    pub momentum: f64,
    pub weight_decay: f64,
}

impl From<&config::OptimizerConfig> for OptimizerConfig {
    fn from(value: &config::OptimizerConfig) -> Self {
        let learning_rate = value.effective_learning_rate();
        match value.algorithm {
            config::OptimizerType::Adam => OptimizerConfig::Adam(AdamConfig {
                learning_rate,
                beta1: value.beta1,
                beta2: value.beta2,
                epsilon: value.epsilon,
                weight_decay: config::WEIGHT_DECAY,
            }),
            config::OptimizerType::Sgd => OptimizerConfig::Sgd(SgdConfig {
                learning_rate,
                momentum: value.momentum,
                weight_decay: config::WEIGHT_DECAY,
            }),
        }
    }
}

impl OptimizerConfig {
    pub fn kind(&self) -> config::OptimizerType {
        match self {
            OptimizerConfig::Adam(_) => config::OptimizerType::Adam,
            OptimizerConfig::Sgd(_) => config::OptimizerType::Sgd,
        }
    }
}

/// Frozen and trainable variables, split once when the trainer is built.
#[derive(Debug, Clone)]
pub struct ParameterGroups {
    pub frozen: Vec<(String, Var)>,
    pub trainable: Vec<(String, Var)>,
}

impl ParameterGroups {
    pub fn new(frozen: Vec<(String, Var)>, trainable: Vec<(String, Var)>) -> Self {
        Self { frozen, trainable }
    }

    /// Host copies of every frozen tensor, keyed by name.
    pub fn frozen_snapshot(&self) -> Result<HashMap<String, Vec<f32>>, TrainingError> {
        self.frozen
            .iter()
            .map(|(name, var)| Ok((name.clone(), flatten(var.as_tensor())?)))
            .collect()
    }
}

/// Updates only the parameters it was built with.
#[derive(Debug)]
pub struct TrainerOptimizer {
    config: OptimizerConfig,
    params: Vec<ParameterSlot>,
    step: usize,
}

#[derive(Debug)]
struct ParameterSlot {
    name: String,
    param: Var,
    state: SlotState,
}

#[derive(Debug)]
enum SlotState {
    Adam {
        exp_avg: Tensor,
        exp_avg_sq: Tensor,
    },
    Sgd {
        momentum_buffer: Option<Tensor>,
    },
}

impl TrainerOptimizer {
    pub fn new(
        named_parameters: Vec<(String, Var)>,
        config: OptimizerConfig,
    ) -> Result<Self, TrainingError> {
        if named_parameters.is_empty() {
            return Err(TrainingError::initialization(
                "optimizer requires at least one parameter",
            ));
        }

        let mut params = Vec::with_capacity(named_parameters.len());
        for (name, var) in named_parameters {
            let tensor = var.as_tensor();
            if tensor.dtype() != DType::F32 {
                return Err(TrainingError::initialization(format!(
                    "optimizer expects f32 parameters, '{}' is {:?}",
                    name,
                    tensor.dtype()
                )));
            }

            let state = match config {
                OptimizerConfig::Adam(_) => SlotState::Adam {
                    exp_avg: tensor.zeros_like().map_err(to_runtime_error)?,
                    exp_avg_sq: tensor.zeros_like().map_err(to_runtime_error)?,
                },
                OptimizerConfig::Sgd(_) => SlotState::Sgd {
                    momentum_buffer: None,
                },
            };

            params.push(ParameterSlot {
                name,
                param: var,
                state,
            });
        }

        Ok(Self {
            config,
            params,
            step: 0,
        })
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    pub fn step_count(&self) -> usize {
        self.step
    }

    pub fn parameter_names(&self) -> impl Iterator<Item = &str> {
        self.params.iter().map(|slot| slot.name.as_str())
    }

    pub fn variables(&self) -> impl Iterator<Item = &Var> {
        self.params.iter().map(|slot| &slot.param)
    }

    pub fn learning_rate(&self) -> f64 {
        match self.config {
            OptimizerConfig::Adam(cfg) => cfg.learning_rate,
            OptimizerConfig::Sgd(cfg) => cfg.learning_rate,
        }
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        match &mut self.config {
            OptimizerConfig::Adam(cfg) => cfg.learning_rate = lr,
            OptimizerConfig::Sgd(cfg) => cfg.learning_rate = lr,
        }
    }

    /// Applies one update from `grads`. Parameters without a gradient are left
    /// untouched; gradients of variables outside this optimizer are ignored.
    pub fn step(&mut self, grads: &mut GradStore) -> Result<(), TrainingError> {
        self.step += 1;
        let step = self.step;
        let config = self.config;

        for slot in &mut self.params {
            let Some(grad) = grads.remove(slot.param.as_tensor()) else {
                continue;
            };
            let param = slot.param.as_tensor().detach();
            let grad = grad.to_dtype(DType::F32).map_err(to_runtime_error)?;

            let next = match (config, &mut slot.state) {
                (OptimizerConfig::Adam(cfg), SlotState::Adam { exp_avg, exp_avg_sq }) => {
                    let grad = with_weight_decay(&grad, &param, cfg.weight_decay)?;
                    *exp_avg = ((exp_avg.affine(cfg.beta1, 0.0).map_err(to_runtime_error)?)
                        + grad.affine(1.0 - cfg.beta1, 0.0).map_err(to_runtime_error)?)
                    .map_err(to_runtime_error)?;
                    *exp_avg_sq = ((exp_avg_sq.affine(cfg.beta2, 0.0).map_err(to_runtime_error)?)
                        + grad
                            .sqr()
                            .map_err(to_runtime_error)?
                            .affine(1.0 - cfg.beta2, 0.0)
                            .map_err(to_runtime_error)?)
                    .map_err(to_runtime_error)?;

                    let bias_correction1 = 1.0 - cfg.beta1.powi(step as i32);
                    let bias_correction2 = 1.0 - cfg.beta2.powi(step as i32);
                    let denom = exp_avg_sq
                        .sqrt()
                        .map_err(to_runtime_error)?
                        .affine(1.0 / bias_correction2.sqrt(), cfg.epsilon)
                        .map_err(to_runtime_error)?;
                    let update = exp_avg
                        .div(&denom)
                        .map_err(to_runtime_error)?
                        .affine(cfg.learning_rate / bias_correction1, 0.0)
                        .map_err(to_runtime_error)?;
                    param.sub(&update).map_err(to_runtime_error)?
                }
                (OptimizerConfig::Sgd(cfg), SlotState::Sgd { momentum_buffer }) => {
                    let grad = with_weight_decay(&grad, &param, cfg.weight_decay)?;
                    let direction = if cfg.momentum != 0.0 {
                        let buffer = match momentum_buffer.take() {
                            Some(buffer) => (buffer.affine(cfg.momentum, 0.0).map_err(to_runtime_error)?
                                + &grad)
                                .map_err(to_runtime_error)?,
                            None => grad,
                        };
                        *momentum_buffer = Some(buffer.clone());
                        buffer
                    } else {
                        grad
                    };
                    let update = direction
                        .affine(cfg.learning_rate, 0.0)
                        .map_err(to_runtime_error)?;
                    param.sub(&update).map_err(to_runtime_error)?
                }
                _ => {
                    return Err(TrainingError::runtime(format!(
                        "optimizer state for '{}' does not match the configured algorithm",
                        slot.name
                    )))
                }
            };

            slot.param.set(&next).map_err(to_runtime_error)?;
        }

        Ok(())
    }

    pub fn zero_grad(&self, grads: &mut GradStore) {
        for slot in &self.params {
            let _ = grads.remove(slot.param.as_tensor());
        }
    }

    pub fn state(&self) -> Result<OptimizerState, TrainingError> {
        let mut parameters = Vec::with_capacity(self.params.len());
        for slot in &self.params {
            let shape = slot.param.as_tensor().dims().to_vec();
            let (exp_avg, exp_avg_sq, momentum_buffer) = match &slot.state {
                SlotState::Adam {
                    exp_avg,
                    exp_avg_sq,
                } => (Some(flatten(exp_avg)?), Some(flatten(exp_avg_sq)?), None),
                SlotState::Sgd { momentum_buffer } => (
                    None,
                    None,
                    momentum_buffer.as_ref().map(flatten).transpose()?,
                ),
            };
            parameters.push(ParameterState {
                name: slot.name.clone(),
                shape,
                exp_avg,
                exp_avg_sq,
                momentum_buffer,
            });
        }

        Ok(OptimizerState {
            algorithm: self.config.kind(),
            learning_rate: self.learning_rate(),
            step: self.step,
            parameters,
        })
    }

    pub fn load_state(&mut self, state: OptimizerState) -> Result<(), TrainingError> {
        if state.algorithm != self.config.kind() {
            return Err(TrainingError::runtime(format!(
                "optimizer state was saved for {:?}, not {:?}",
                state.algorithm,
                self.config.kind()
            )));
        }

        let mut by_name: HashMap<_, _> = state
            .parameters
            .into_iter()
            .map(|param| (param.name.clone(), param))
            .collect();

        for slot in &mut self.params {
            let saved = by_name.remove(&slot.name).ok_or_else(|| {
                TrainingError::runtime(format!("optimizer state missing parameter '{}'", slot.name))
            })?;
            let tensor = slot.param.as_tensor();
            if tensor.dims() != saved.shape.as_slice() {
                return Err(TrainingError::runtime(format!(
                    "optimizer state shape mismatch for '{}'",
                    slot.name
                )));
            }

            slot.state = match &slot.state {
                SlotState::Adam { .. } => {
                    let (Some(exp_avg), Some(exp_avg_sq)) = (saved.exp_avg, saved.exp_avg_sq)
                    else {
                        return Err(TrainingError::runtime(format!(
                            "optimizer state missing Adam moments for '{}'",
                            slot.name
                        )));
                    };
                    SlotState::Adam {
                        exp_avg: restore(exp_avg, tensor, &slot.name)?,
                        exp_avg_sq: restore(exp_avg_sq, tensor, &slot.name)?,
                    }
                }
                SlotState::Sgd { .. } => SlotState::Sgd {
                    momentum_buffer: saved
                        .momentum_buffer
                        .map(|values| restore(values, tensor, &slot.name))
                        .transpose()?,
                },
            };
        }

        if !by_name.is_empty() {
            return Err(TrainingError::runtime(
                "optimizer state has extra parameters not present in the model",
            ));
        }

        self.step = state.step;
        self.set_learning_rate(state.learning_rate);
        Ok(())
    }
}

/// L2 penalty folded into the gradient.
fn with_weight_decay(grad: &Tensor, param: &Tensor, weight_decay: f64) -> Result<Tensor, TrainingError> {
    if weight_decay == 0.0 {
        return Ok(grad.clone());
    }
    (grad + param.affine(weight_decay, 0.0).map_err(to_runtime_error)?).map_err(to_runtime_error)
}

fn flatten(tensor: &Tensor) -> Result<Vec<f32>, TrainingError> {
    tensor
        .flatten_all()
        .map_err(to_runtime_error)?
        .to_dtype(DType::F32)
        .map_err(to_runtime_error)?
        .to_vec1::<f32>()
        .map_err(to_runtime_error)
}

fn restore(values: Vec<f32>, like: &Tensor, name: &str) -> Result<Tensor, TrainingError> {
    if values.len() != like.elem_count() {
        return Err(TrainingError::runtime(format!(
            "optimizer state size mismatch for '{}'",
            name
        )));
    }
    Tensor::from_vec(values, like.dims(), like.device()).map_err(to_runtime_error)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    pub algorithm: config::OptimizerType,
    pub learning_rate: f64,
    pub step: usize,
    pub parameters: Vec<ParameterState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterState {
    pub name: String,
    pub shape: Vec<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp_avg: Option<Vec<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp_avg_sq: Option<Vec<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub momentum_buffer: Option<Vec<f32>>,
}

pub(crate) fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
