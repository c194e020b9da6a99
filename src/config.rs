use candle_core::Device;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

use crate::{optimizer::OptimizerKind, scheduler::SchedulerKind};

/// Flat run configuration, loaded once from a JSON file at startup and
/// immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    pub exp_name: String,
    pub exp_dir: PathBuf,
    pub device: String,
    pub lr: f64,
    pub epochs: usize,
    pub batch_size: usize,
    pub num_workers: usize,
    pub train_json: PathBuf,
    pub val_json: PathBuf,
    pub mapping_json: PathBuf,
    /// Checkpoint to resume from. Absent or null means a fresh run.
    #[serde(default)]
    pub model_path: Option<PathBuf>,

    // Model hyperparameters, passed through to the network untouched.
    #[serde(default = "default_signal_len")]
    pub signal_len: usize,
    #[serde(default = "default_base_channels")]
    pub base_channels: usize,
    #[serde(default = "default_num_blocks")]
    pub num_blocks: usize,
    #[serde(default = "default_dropout")]
    pub dropout: f32,
    /// Derived from the label mapping when absent.
    #[serde(default)]
    pub num_classes: Option<usize>,

    #[serde(default)]
    pub optimizer: OptimizerKind,
    /// Only read by the momentum-SGD path.
    #[serde(default = "default_momentum")]
    pub momentum: f64,

    #[serde(default)]
    pub scheduler: SchedulerKind,
    #[serde(default = "default_scheduler_factor")]
    pub scheduler_factor: f64,
    #[serde(default = "default_scheduler_patience")]
    pub scheduler_patience: usize,
    #[serde(default)]
    pub min_lr: f64,

    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_log_every")]
    pub log_every: usize,
}

impl TrainConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainError> {
        let contents = fs::read_to_string(path.as_ref())?;
        let config: TrainConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), TrainError> {
        let mut errors = Vec::new();

        if self.exp_name.is_empty() {
            errors.push("exp_name must not be empty".to_string());
        }
        if self.lr <= 0.0 {
            errors.push("lr must be greater than 0".to_string());
        }
        if self.epochs == 0 {
            errors.push("epochs must be greater than 0".to_string());
        }
        if self.batch_size == 0 {
            errors.push("batch_size must be greater than 0".to_string());
        }
        if self.log_every == 0 {
            errors.push("log_every must be greater than 0".to_string());
        }
        if !(0.0..1.0).contains(&self.dropout) {
            errors.push("dropout must be in [0, 1)".to_string());
        }
        if self.base_channels == 0 {
            errors.push("base_channels must be greater than 0".to_string());
        }
        // The stem plus each block halves the temporal dimension.
        if self.signal_len >> (self.num_blocks + 1) == 0 {
            errors.push(format!(
                "signal_len {} is too short for {} downsampling stages",
                self.signal_len,
                self.num_blocks + 1
            ));
        }
        if !(0.0..1.0).contains(&self.momentum) {
            errors.push("momentum must be in [0, 1)".to_string());
        }
        if !(0.0 < self.scheduler_factor && self.scheduler_factor < 1.0) {
            errors.push("scheduler_factor must be in (0, 1)".to_string());
        }
        if self.min_lr < 0.0 {
            errors.push("min_lr must be >= 0".to_string());
        }
        if let Some(num_classes) = self.num_classes {
            if num_classes == 0 {
                errors.push("num_classes must be greater than 0".to_string());
            }
        }

        if !errors.is_empty() {
            return Err(TrainError::validation(errors));
        }

        Ok(())
    }

    /// Maps the configured device identifier onto a tensor backend device.
    /// Accepted forms: `cpu`, `cuda`, `cuda:N`, `metal`, `metal:N`.
    pub fn resolve_device(&self) -> Result<Device, TrainError> {
        let (name, ordinal) = match self.device.split_once(':') {
            Some((name, idx)) => {
                let ordinal: usize = idx.parse().map_err(|_| {
                    TrainError::initialization(format!(
                        "invalid device ordinal in '{}'",
                        self.device
                    ))
                })?;
                (name, ordinal)
            }
            None => (self.device.as_str(), 0),
        };

        match name {
            "cpu" => Ok(Device::Cpu),
            "cuda" => Device::new_cuda(ordinal).map_err(|err| {
                TrainError::initialization(format!(
                    "cuda device '{}' is not usable: {err}",
                    self.device
                ))
            }),
            "metal" => Device::new_metal(ordinal).map_err(|err| {
                TrainError::initialization(format!(
                    "metal device '{}' is not usable: {err}",
                    self.device
                ))
            }),
            other => Err(TrainError::initialization(format!(
                "unsupported device identifier '{other}'"
            ))),
        }
    }

    /// Hash of the serialized configuration, stored inside each checkpoint so
    /// a resume against a different configuration can be reported. Fields
    /// that legitimately change across a resume (`model_path`, `epochs`) are
    /// excluded, otherwise every resume would report a mismatch.
    pub fn fingerprint(&self) -> Result<String, TrainError> {
        let mut hashed = self.clone();
        hashed.model_path = None;
        hashed.epochs = 0;
        let json = serde_json::to_vec(&hashed)
            .map_err(|err| TrainError::runtime(format!("failed to hash config: {err}")))?;
        Ok(hex::encode(Sha256::digest(json)))
    }
}

fn default_signal_len() -> usize {
    2560
}

fn default_base_channels() -> usize {
    16
}

fn default_num_blocks() -> usize {
    4
}

fn default_dropout() -> f32 {
    0.1
}

fn default_momentum() -> f64 {
    0.9
}

fn default_scheduler_factor() -> f64 {
    0.1
}

fn default_scheduler_patience() -> usize {
    10
}

fn default_seed() -> u64 {
    42
}

fn default_log_every() -> usize {
    100
}

#[derive(Debug)]
pub enum TrainError {
    Io(std::io::Error),
    ConfigFormat(String),
    Validation(Vec<String>),
    Initialization(String),
    Runtime(String),
}

impl TrainError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }
}

impl fmt::Display for TrainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainError::Io(err) => write!(f, "i/o failure: {err}"),
            TrainError::ConfigFormat(err) => write!(f, "failed to parse config: {err}"),
            TrainError::Validation(messages) => {
                write!(f, "invalid configuration: {}", messages.join("; "))
            }
            TrainError::Initialization(msg) => {
                write!(f, "trainer initialization failed: {msg}")
            }
            TrainError::Runtime(msg) => write!(f, "training failed: {msg}"),
        }
    }
}

impl std::error::Error for TrainError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TrainError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TrainError {
    fn from(value: std::io::Error) -> Self {
        TrainError::Io(value)
    }
}

impl From<serde_json::Error> for TrainError {
    fn from(value: serde_json::Error) -> Self {
        TrainError::ConfigFormat(value.to_string())
    }
}
