use candle_core::{backprop::GradStore, Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::TrainError;

const ADAM_BETA1: f64 = 0.9;
const ADAM_BETA2: f64 = 0.999;
const ADAM_EPS: f64 = 1e-8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    #[default]
    Adam,
    /// Momentum SGD, selectable via config.
    Sgd,
}

/// First-order optimizer over the model's named parameters.
///
/// Gradient zeroing is inherent: every backward pass produces a fresh
/// `GradStore`, so state cannot leak across batches.
pub struct Optimizer {
    kind: OptimizerKind,
    lr: f64,
    momentum: f64,
    step: usize,
    slots: Vec<Slot>,
}

struct Slot {
    name: String,
    param: Var,
    /// Adam first moment, or the SGD velocity buffer.
    first_moment: Tensor,
    /// Adam second moment; absent for SGD.
    second_moment: Option<Tensor>,
}

impl Optimizer {
    pub fn new(
        named_parameters: Vec<(String, Var)>,
        kind: OptimizerKind,
        lr: f64,
        momentum: f64,
    ) -> Result<Self, TrainError> {
        if named_parameters.is_empty() {
            return Err(TrainError::initialization(
                "optimizer requires at least one parameter",
            ));
        }
        if lr <= 0.0 {
            return Err(TrainError::initialization(
                "optimizer requires a learning rate > 0",
            ));
        }

        let mut slots = Vec::with_capacity(named_parameters.len());
        for (name, var) in named_parameters {
            let tensor = var.as_tensor();
            if !tensor.dtype().is_float() {
                return Err(TrainError::initialization(format!(
                    "optimizer received non-floating parameter '{name}'"
                )));
            }
            let first_moment = tensor.zeros_like().map_err(to_runtime_error)?;
            let second_moment = match kind {
                OptimizerKind::Adam => Some(tensor.zeros_like().map_err(to_runtime_error)?),
                OptimizerKind::Sgd => None,
            };
            slots.push(Slot {
                name,
                param: var,
                first_moment,
                second_moment,
            });
        }

        Ok(Self {
            kind,
            lr,
            momentum,
            step: 0,
            slots,
        })
    }

    pub fn kind(&self) -> OptimizerKind {
        self.kind
    }

    pub fn learning_rate(&self) -> f64 {
        self.lr
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }

    pub fn step_count(&self) -> usize {
        self.step
    }

    /// Applies one update; parameters without a gradient are skipped.
    pub fn step(&mut self, grads: &GradStore) -> Result<(), TrainError> {
        self.step += 1;
        match self.kind {
            OptimizerKind::Adam => self.step_adam(grads),
            OptimizerKind::Sgd => self.step_sgd(grads),
        }
    }

    fn step_adam(&mut self, grads: &GradStore) -> Result<(), TrainError> {
        let lr = self.lr;
        let bias_correction1 = 1.0 - ADAM_BETA1.powi(self.step as i32);
        let bias_correction2 = 1.0 - ADAM_BETA2.powi(self.step as i32);

        for slot in &mut self.slots {
            let Some(grad) = grads.get(slot.param.as_tensor()) else {
                continue;
            };

            let prev_m = slot
                .first_moment
                .affine(ADAM_BETA1, 0.0)
                .map_err(to_runtime_error)?;
            let grad_term = grad.affine(1.0 - ADAM_BETA1, 0.0).map_err(to_runtime_error)?;
            let new_m = prev_m.add(&grad_term).map_err(to_runtime_error)?;

            let prev_v = slot
                .second_moment
                .as_ref()
                .ok_or_else(|| {
                    TrainError::runtime(format!(
                        "adam slot '{}' is missing its second moment",
                        slot.name
                    ))
                })?
                .affine(ADAM_BETA2, 0.0)
                .map_err(to_runtime_error)?;
            let grad_sq_term = grad
                .sqr()
                .map_err(to_runtime_error)?
                .affine(1.0 - ADAM_BETA2, 0.0)
                .map_err(to_runtime_error)?;
            let new_v = prev_v.add(&grad_sq_term).map_err(to_runtime_error)?;

            let m_hat = new_m
                .affine(1.0 / bias_correction1, 0.0)
                .map_err(to_runtime_error)?;
            let v_hat = new_v
                .affine(1.0 / bias_correction2, 0.0)
                .map_err(to_runtime_error)?;
            let denom = v_hat
                .sqrt()
                .map_err(to_runtime_error)?
                .affine(1.0, ADAM_EPS)
                .map_err(to_runtime_error)?;
            let update = m_hat
                .div(&denom)
                .map_err(to_runtime_error)?
                .affine(lr, 0.0)
                .map_err(to_runtime_error)?;

            let next = slot
                .param
                .as_tensor()
                .sub(&update)
                .map_err(to_runtime_error)?;
            slot.param.set(&next).map_err(to_runtime_error)?;

            slot.first_moment = new_m;
            slot.second_moment = Some(new_v);
        }

        Ok(())
    }

    fn step_sgd(&mut self, grads: &GradStore) -> Result<(), TrainError> {
        let lr = self.lr;
        let momentum = self.momentum;

        for slot in &mut self.slots {
            let Some(grad) = grads.get(slot.param.as_tensor()) else {
                continue;
            };

            let velocity = slot
                .first_moment
                .affine(momentum, 0.0)
                .map_err(to_runtime_error)?
                .add(grad)
                .map_err(to_runtime_error)?;
            let update = velocity.affine(lr, 0.0).map_err(to_runtime_error)?;
            let next = slot
                .param
                .as_tensor()
                .sub(&update)
                .map_err(to_runtime_error)?;
            slot.param.set(&next).map_err(to_runtime_error)?;

            slot.first_moment = velocity;
        }

        Ok(())
    }

    /// Serializable snapshot, persisted into every checkpoint.
    pub fn state(&self) -> Result<OptimizerState, TrainError> {
        let mut parameters = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            let shape = slot.param.as_tensor().dims().to_vec();
            let expected = numel(&shape);
            let first_moment = flatten_to_vec(&slot.first_moment, expected)?;
            let second_moment = match &slot.second_moment {
                Some(tensor) => Some(flatten_to_vec(tensor, expected)?),
                None => None,
            };
            parameters.push(MomentState {
                name: slot.name.clone(),
                shape,
                first_moment,
                second_moment,
            });
        }

        Ok(OptimizerState {
            algorithm: self.kind,
            step: self.step,
            learning_rate: self.lr,
            momentum: self.momentum,
            parameters,
        })
    }

    pub fn load_state(&mut self, state: OptimizerState) -> Result<(), TrainError> {
        if state.algorithm != self.kind {
            return Err(TrainError::runtime(format!(
                "checkpoint optimizer algorithm {:?} does not match configured {:?}",
                state.algorithm, self.kind
            )));
        }

        let mut by_name: std::collections::HashMap<String, MomentState> = state
            .parameters
            .into_iter()
            .map(|param| (param.name.clone(), param))
            .collect();

        for slot in &mut self.slots {
            let state = by_name.remove(&slot.name).ok_or_else(|| {
                TrainError::runtime(format!("optimizer state missing parameter '{}'", slot.name))
            })?;

            let dims = slot.param.as_tensor().dims();
            if dims != state.shape.as_slice() {
                return Err(TrainError::runtime(format!(
                    "optimizer state shape mismatch for '{}'",
                    slot.name
                )));
            }
            let expected = numel(&state.shape);
            if state.first_moment.len() != expected
                || state
                    .second_moment
                    .as_ref()
                    .is_some_and(|m| m.len() != expected)
            {
                return Err(TrainError::runtime(format!(
                    "optimizer state size mismatch for '{}'",
                    slot.name
                )));
            }

            let device = slot.param.as_tensor().device();
            slot.first_moment = Tensor::from_vec(state.first_moment, state.shape.clone(), device)
                .map_err(to_runtime_error)?;
            slot.second_moment = match (self.kind, state.second_moment) {
                (OptimizerKind::Adam, Some(values)) => Some(
                    Tensor::from_vec(values, state.shape.clone(), device)
                        .map_err(to_runtime_error)?,
                ),
                (OptimizerKind::Sgd, None) => None,
                _ => {
                    return Err(TrainError::runtime(format!(
                        "optimizer state moments for '{}' do not match the algorithm",
                        slot.name
                    )))
                }
            };
        }

        if !by_name.is_empty() {
            return Err(TrainError::runtime(
                "optimizer state has extra parameters not present in the model",
            ));
        }

        self.step = state.step;
        self.lr = state.learning_rate;
        self.momentum = state.momentum;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerState {
    pub algorithm: OptimizerKind,
    pub step: usize,
    pub learning_rate: f64,
    pub momentum: f64,
    pub parameters: Vec<MomentState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MomentState {
    pub name: String,
    pub shape: Vec<usize>,
    pub first_moment: Vec<f32>,
    pub second_moment: Option<Vec<f32>>,
}

fn flatten_to_vec(tensor: &Tensor, expected: usize) -> Result<Vec<f32>, TrainError> {
    let flat = tensor
        .flatten_all()
        .map_err(to_runtime_error)?
        .to_vec1::<f32>()
        .map_err(to_runtime_error)?;
    if flat.len() != expected {
        return Err(TrainError::runtime(
            "unexpected element count during optimizer state serialization",
        ));
    }
    Ok(flat)
}

fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}

fn to_runtime_error(err: candle_core::Error) -> TrainError {
    TrainError::runtime(err.to_string())
}
