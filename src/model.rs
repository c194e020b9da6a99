use candle_core::{DType, Device, Result as CandleResult, Tensor, Var, D};
use candle_nn::{
    conv1d, linear, Conv1d, Conv1dConfig, Dropout, Linear, Module, VarBuilder, VarMap,
};

use crate::TrainError;

#[derive(Debug, Clone)]
pub struct EcgNetConfig {
    pub signal_len: usize,
    pub num_classes: usize,
    pub base_channels: usize,
    pub num_blocks: usize,
    pub dropout: f32,
    pub device: Device,
}

/// 1-D convolutional waveform classifier.
///
/// A strided stem and `num_blocks` strided conv stages each halve the
/// temporal dimension while doubling channels; global mean pooling over time
/// feeds a linear head producing `[batch, num_classes]` class scores.
pub struct EcgNet {
    varmap: VarMap,
    stem: Conv1d,
    blocks: Vec<Conv1d>,
    head: Linear,
    dropout: Dropout,
}

impl EcgNet {
    pub fn new(config: &EcgNetConfig) -> Result<Self, TrainError> {
        if config.num_classes == 0 {
            return Err(TrainError::initialization(
                "model requires at least one output class",
            ));
        }
        if config.base_channels == 0 {
            return Err(TrainError::initialization(
                "base_channels must be greater than zero",
            ));
        }
        if config.signal_len >> (config.num_blocks + 1) == 0 {
            return Err(TrainError::initialization(format!(
                "signal_len {} is too short for {} downsampling stages",
                config.signal_len,
                config.num_blocks + 1
            )));
        }
        if !(0.0..1.0).contains(&config.dropout) {
            return Err(TrainError::initialization("dropout must be in [0, 1)"));
        }

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &config.device);

        let stem = conv1d(
            1,
            config.base_channels,
            7,
            Conv1dConfig {
                padding: 3,
                stride: 2,
                ..Default::default()
            },
            vb.pp("stem"),
        )
        .map_err(to_init_error)?;

        let mut blocks = Vec::with_capacity(config.num_blocks);
        let mut channels = config.base_channels;
        for index in 0..config.num_blocks {
            let block = conv1d(
                channels,
                channels * 2,
                5,
                Conv1dConfig {
                    padding: 2,
                    stride: 2,
                    ..Default::default()
                },
                vb.pp(format!("block{index}")),
            )
            .map_err(to_init_error)?;
            blocks.push(block);
            channels *= 2;
        }

        let head = linear(channels, config.num_classes, vb.pp("head")).map_err(to_init_error)?;

        Ok(Self {
            varmap,
            stem,
            blocks,
            head,
            dropout: Dropout::new(config.dropout),
        })
    }

    /// `train` gates dropout; the validation pass runs with it inert.
    pub fn forward(&self, xs: &Tensor, train: bool) -> CandleResult<Tensor> {
        let mut xs = self.stem.forward(xs)?.relu()?;
        for block in &self.blocks {
            xs = block.forward(&xs)?.relu()?;
            xs = self.dropout.forward(&xs, train)?;
        }
        let pooled = xs.mean(D::Minus1)?;
        self.head.forward(&pooled)
    }

    /// Name-sorted trainable parameters; the contract the optimizer and
    /// checkpoint modules consume.
    pub fn parameters(&self) -> Vec<(String, Var)> {
        let data = self.varmap.data().lock().unwrap();
        let mut pairs: Vec<(String, Var)> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        pairs
    }
}

fn to_init_error(err: candle_core::Error) -> TrainError {
    TrainError::initialization(format!("failed to build model: {err}"))
}
