/// Running state for one train or validation pass: accumulated loss plus
/// order-preserving predicted and ground-truth label collections. Discarded
/// after reducing to a [`PassSummary`].
#[derive(Debug, Default)]
pub struct PassMetrics {
    loss_sum: f64,
    batches: usize,
    predicted: Vec<u32>,
    truth: Vec<u32>,
}

impl PassMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, loss: f32, predicted: &[u32], truth: &[u32]) {
        self.loss_sum += loss as f64;
        self.batches += 1;
        self.predicted.extend_from_slice(predicted);
        self.truth.extend_from_slice(truth);
    }

    pub fn batches(&self) -> usize {
        self.batches
    }

    /// Mean loss over batches and top-1 accuracy over examples. `None` when
    /// the pass produced no batches.
    pub fn finalize(self) -> Option<PassSummary> {
        if self.batches == 0 {
            return None;
        }
        let mean_loss = self.loss_sum / self.batches as f64;
        let examples = self.truth.len();
        let matches = self
            .predicted
            .iter()
            .zip(self.truth.iter())
            .filter(|(p, t)| p == t)
            .count();
        let accuracy = if examples == 0 {
            0.0
        } else {
            matches as f64 / examples as f64
        };
        Some(PassSummary {
            mean_loss,
            accuracy,
            examples,
        })
    }
}

/// Reduced metrics for one full pass over a loader.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PassSummary {
    pub mean_loss: f64,
    pub accuracy: f64,
    pub examples: usize,
}
