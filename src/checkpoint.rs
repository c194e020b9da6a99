use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::model::EcgNet;
use crate::optimizer::{Optimizer, OptimizerState};
use crate::TrainError;

pub const CHECKPOINT_VERSION: u32 = 1;

/// On-disk checkpoint, one JSON file per completed epoch.
#[derive(Debug, Serialize, Deserialize)]
pub struct CheckpointFile {
    pub version: u32,
    pub created_unix_timestamp: u64,
    pub config_sha256: String,
    /// The epoch whose training pass produced these weights.
    pub epoch: usize,
    pub total_iter: usize,
    pub model: Vec<ParameterState>,
    pub optimizer: OptimizerState,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ParameterState {
    pub name: String,
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

/// Where a restored run picks up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumePoint {
    /// First epoch a resumed run should execute.
    pub training_epoch: usize,
    pub total_iter: usize,
}

/// `{epoch:08}.ckpt` inside the checkpoint directory.
pub fn checkpoint_path(dir: &Path, epoch: usize) -> PathBuf {
    dir.join(format!("{epoch:08}.ckpt"))
}

pub fn save(
    dir: &Path,
    model: &EcgNet,
    optimizer: &Optimizer,
    epoch: usize,
    total_iter: usize,
    config_sha256: &str,
) -> Result<PathBuf, TrainError> {
    let mut parameters = Vec::new();
    for (name, var) in model.parameters() {
        let tensor = var.as_tensor();
        let shape = tensor.dims().to_vec();
        let values = tensor
            .flatten_all()
            .and_then(|flat| flat.to_vec1::<f32>())
            .map_err(|err| TrainError::runtime(err.to_string()))?;
        parameters.push(ParameterState {
            name,
            shape,
            values,
        });
    }

    let created_unix_timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0);

    let file = CheckpointFile {
        version: CHECKPOINT_VERSION,
        created_unix_timestamp,
        config_sha256: config_sha256.to_string(),
        epoch,
        total_iter,
        model: parameters,
        optimizer: optimizer.state()?,
    };

    let path = checkpoint_path(dir, epoch);
    write_json(&path, &file)?;
    Ok(path)
}

pub fn load(path: &Path) -> Result<CheckpointFile, TrainError> {
    let file: CheckpointFile = read_json(path)?;
    if file.version != CHECKPOINT_VERSION {
        return Err(TrainError::runtime(format!(
            "unsupported checkpoint version {} in {}",
            file.version,
            path.display()
        )));
    }
    Ok(file)
}

/// Restores model weights and optimizer state from a loaded checkpoint.
///
/// The checkpointed epoch is the one that produced the weights, so the
/// resumed run starts at the epoch after it.
pub fn apply(
    file: CheckpointFile,
    model: &EcgNet,
    optimizer: &mut Optimizer,
) -> Result<ResumePoint, TrainError> {
    let mut by_name: HashMap<String, ParameterState> = file
        .model
        .into_iter()
        .map(|param| (param.name.clone(), param))
        .collect();

    for (name, var) in model.parameters() {
        let state = by_name.remove(&name).ok_or_else(|| {
            TrainError::runtime(format!("checkpoint is missing parameter '{name}'"))
        })?;
        let dims = var.as_tensor().dims();
        if dims != state.shape.as_slice() {
            return Err(TrainError::runtime(format!(
                "checkpoint shape mismatch for '{name}': stored {:?}, model expects {dims:?}",
                state.shape
            )));
        }
        let expected: usize = state.shape.iter().product();
        if state.values.len() != expected {
            return Err(TrainError::runtime(format!(
                "checkpoint value count mismatch for '{name}'"
            )));
        }
        let device = var.as_tensor().device().clone();
        let tensor = Tensor::from_vec(state.values, state.shape, &device)
            .map_err(|err| TrainError::runtime(err.to_string()))?;
        var.set(&tensor)
            .map_err(|err| TrainError::runtime(err.to_string()))?;
    }

    if !by_name.is_empty() {
        let extra: Vec<String> = by_name.into_keys().collect();
        return Err(TrainError::runtime(format!(
            "checkpoint has parameters the model does not: {}",
            extra.join(", ")
        )));
    }

    optimizer.load_state(file.optimizer)?;

    Ok(ResumePoint {
        training_epoch: file.epoch + 1,
        total_iter: file.total_iter,
    })
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), TrainError> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, value)?;
    Ok(())
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, TrainError> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let value = serde_json::from_reader(reader)?;
    Ok(value)
}
