use candle_core::{DType, Tensor, D};
use candle_nn::ops;

use crate::TrainError;

/// Cross entropy over `[batch, classes]` logits and `[batch]` integer labels.
#[derive(Debug, Clone, Default)]
pub struct CrossEntropyLoss;

impl CrossEntropyLoss {
    pub fn new() -> Self {
        Self
    }

    pub fn compute(&self, logits: &Tensor, targets: &Tensor) -> Result<LossOutput, TrainError> {
        let dims = logits.dims();
        if dims.len() != 2 {
            return Err(TrainError::runtime(
                "cross entropy expects [batch, classes] logits",
            ));
        }
        let batch = dims[0];
        if targets.dims() != [batch] {
            return Err(TrainError::runtime(
                "target tensor must match the logits batch dimension",
            ));
        }
        if batch == 0 {
            return Err(TrainError::runtime(
                "no examples available for loss computation",
            ));
        }

        let targets = match targets.dtype() {
            DType::U32 => targets.clone(),
            DType::I64 | DType::U8 => targets.to_dtype(DType::U32).map_err(to_runtime_error)?,
            dtype => {
                return Err(TrainError::runtime(format!(
                    "unsupported target dtype {dtype:?} for cross entropy"
                )))
            }
        };

        let log_probs = ops::log_softmax(logits, D::Minus1).map_err(to_runtime_error)?;
        let indices = targets.unsqueeze(1).map_err(to_runtime_error)?;
        let nll = log_probs
            .gather(&indices, 1)
            .map_err(to_runtime_error)?
            .neg()
            .map_err(to_runtime_error)?
            .squeeze(1)
            .map_err(to_runtime_error)?;

        let loss = nll.mean_all().map_err(to_runtime_error)?;
        let value = loss.to_vec0::<f32>().map_err(to_runtime_error)?;

        Ok(LossOutput { loss, value })
    }
}

#[derive(Debug, Clone)]
pub struct LossOutput {
    /// Scalar loss tensor, the root of the backward pass.
    pub loss: Tensor,
    pub value: f32,
}

fn to_runtime_error(err: candle_core::Error) -> TrainError {
    TrainError::runtime(err.to_string())
}
