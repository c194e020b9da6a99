//! Supervised training loop for a 1-D ECG waveform classifier.
//!
//! A run is described by a single JSON configuration file. [`Trainer`] owns
//! the model, optimizer, data loaders and logging, and [`Trainer::run`]
//! drives the epoch loop: one shuffled training pass, a checkpoint, one
//! ordered validation pass, then scalar summaries for TensorBoard.

pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod optimizer;
pub mod scheduler;
pub mod trainer;

pub use checkpoint::{CheckpointFile, ResumePoint, CHECKPOINT_VERSION};
pub use config::{TrainConfig, TrainError};
pub use dataset::{Batch, EcgDataLoader, EcgDataset, LabelMapping};
pub use logging::ScalarLogger;
pub use loss::{CrossEntropyLoss, LossOutput};
pub use metrics::{PassMetrics, PassSummary};
pub use model::{EcgNet, EcgNetConfig};
pub use optimizer::{Optimizer, OptimizerKind, OptimizerState};
pub use scheduler::{LrStrategy, ReduceOnPlateau, SchedulerKind};
pub use trainer::{ExperimentDirs, Trainer};
