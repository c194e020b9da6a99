use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    /// Constant learning rate for the whole run.
    #[default]
    None,
    /// Reduce the learning rate when validation loss stops improving.
    Plateau,
}

/// Epoch-level learning-rate strategy driven by validation loss.
///
/// `observe` is called once per epoch with the validation mean loss and
/// returns the new learning rate when the strategy decides to change it.
pub trait LrStrategy: Send {
    fn observe(&mut self, val_loss: f64) -> Option<f64>;
}

/// Multiplies the learning rate by `factor` after `patience` consecutive
/// epochs without a validation-loss improvement, never going below `min_lr`.
pub struct ReduceOnPlateau {
    factor: f64,
    patience: usize,
    min_lr: f64,
    current_lr: f64,
    best: Option<f64>,
    bad_epochs: usize,
}

impl ReduceOnPlateau {
    pub fn new(initial_lr: f64, factor: f64, patience: usize, min_lr: f64) -> Self {
        Self {
            factor,
            patience,
            min_lr,
            current_lr: initial_lr,
            best: None,
            bad_epochs: 0,
        }
    }

    pub fn current_lr(&self) -> f64 {
        self.current_lr
    }
}

impl LrStrategy for ReduceOnPlateau {
    fn observe(&mut self, val_loss: f64) -> Option<f64> {
        match self.best {
            Some(best) if val_loss >= best => {
                self.bad_epochs += 1;
            }
            _ => {
                self.best = Some(val_loss);
                self.bad_epochs = 0;
                return None;
            }
        }

        if self.bad_epochs < self.patience {
            return None;
        }
        self.bad_epochs = 0;

        let reduced = (self.current_lr * self.factor).max(self.min_lr);
        if reduced < self.current_lr {
            self.current_lr = reduced;
            Some(reduced)
        } else {
            None
        }
    }
}
