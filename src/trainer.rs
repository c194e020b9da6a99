use std::{
    fs,
    path::{Path, PathBuf},
};

use candle_core::D;
use indicatif::ProgressBar;

use crate::{
    checkpoint,
    config::TrainConfig,
    dataset::{EcgDataLoader, EcgDataset, LabelMapping},
    logging::ScalarLogger,
    loss::CrossEntropyLoss,
    metrics::{PassMetrics, PassSummary},
    model::{EcgNet, EcgNetConfig},
    optimizer::Optimizer,
    scheduler::{LrStrategy, ReduceOnPlateau, SchedulerKind},
    TrainError,
};

const FLUSH_EVERY_SCALARS: usize = 16;

/// Filesystem layout of one experiment: TensorBoard events under
/// `<exp_dir>/<exp_name>/logs`, checkpoints under
/// `<exp_dir>/<exp_name>/checkpoints`.
pub struct ExperimentDirs {
    pub log_dir: PathBuf,
    pub checkpoint_dir: PathBuf,
}

impl ExperimentDirs {
    pub fn create(exp_dir: &Path, exp_name: &str) -> Result<Self, TrainError> {
        let root = exp_dir.join(exp_name);
        let log_dir = root.join("logs");
        let checkpoint_dir = root.join("checkpoints");
        for dir in [&log_dir, &checkpoint_dir] {
            fs::create_dir_all(dir).map_err(|err| {
                TrainError::initialization(format!(
                    "failed to create experiment directory {}: {err}",
                    dir.display()
                ))
            })?;
        }
        Ok(Self {
            log_dir,
            checkpoint_dir,
        })
    }
}

/// Owns the full training state and drives the epoch loop: train pass,
/// checkpoint, validation pass, scalar logging.
pub struct Trainer {
    config: TrainConfig,
    config_sha: String,
    device: candle_core::Device,
    dirs: ExperimentDirs,
    logger: ScalarLogger,
    model: EcgNet,
    criterion: CrossEntropyLoss,
    optimizer: Optimizer,
    scheduler: Option<Box<dyn LrStrategy>>,
    train_loader: EcgDataLoader,
    val_loader: EcgDataLoader,
    training_epoch: usize,
    total_iter: usize,
}

impl Trainer {
    pub fn new(config: TrainConfig) -> Result<Self, TrainError> {
        config.validate()?;
        let config_sha = config.fingerprint()?;
        let device = config.resolve_device()?;
        let dirs = ExperimentDirs::create(&config.exp_dir, &config.exp_name)?;
        let logger = ScalarLogger::create(&dirs.log_dir, FLUSH_EVERY_SCALARS)?;

        let mapping = LabelMapping::from_path(&config.mapping_json)?;
        let num_classes = config.num_classes.unwrap_or_else(|| mapping.num_classes());

        let model = EcgNet::new(&EcgNetConfig {
            signal_len: config.signal_len,
            num_classes,
            base_channels: config.base_channels,
            num_blocks: config.num_blocks,
            dropout: config.dropout,
            device: device.clone(),
        })?;
        let criterion = CrossEntropyLoss::new();
        let mut optimizer = Optimizer::new(
            model.parameters(),
            config.optimizer,
            config.lr,
            config.momentum,
        )?;
        let scheduler: Option<Box<dyn LrStrategy>> = match config.scheduler {
            SchedulerKind::None => None,
            SchedulerKind::Plateau => Some(Box::new(ReduceOnPlateau::new(
                config.lr,
                config.scheduler_factor,
                config.scheduler_patience,
                config.min_lr,
            ))),
        };

        let train_dataset = EcgDataset::from_manifest(&config.train_json, &mapping, config.signal_len)?;
        let val_dataset = EcgDataset::from_manifest(&config.val_json, &mapping, config.signal_len)?;
        let train_loader = EcgDataLoader::new(
            train_dataset,
            config.batch_size,
            config.num_workers,
            true,
            config.seed,
        )?;
        let val_loader = EcgDataLoader::new(
            val_dataset,
            config.batch_size,
            config.num_workers,
            false,
            config.seed,
        )?;

        let mut training_epoch = 0;
        let mut total_iter = 0;
        if let Some(path) = &config.model_path {
            let file = checkpoint::load(path)?;
            if file.config_sha256 != config_sha {
                eprintln!(
                    "warning: resuming {} with a configuration that differs from the one it was trained with",
                    path.display()
                );
            }
            let resume = checkpoint::apply(file, &model, &mut optimizer)?;
            training_epoch = resume.training_epoch;
            total_iter = resume.total_iter;
            println!(
                "Resumed from {} at epoch {} (iter {})",
                path.display(),
                training_epoch,
                total_iter
            );
        }

        Ok(Self {
            config,
            config_sha,
            device,
            dirs,
            logger,
            model,
            criterion,
            optimizer,
            scheduler,
            train_loader,
            val_loader,
            training_epoch,
            total_iter,
        })
    }

    pub fn training_epoch(&self) -> usize {
        self.training_epoch
    }

    pub fn total_iter(&self) -> usize {
        self.total_iter
    }

    pub fn checkpoint_dir(&self) -> &Path {
        &self.dirs.checkpoint_dir
    }

    pub fn log_dir(&self) -> &Path {
        &self.dirs.log_dir
    }

    /// One shuffled pass over the training set with parameter updates.
    pub fn train_epoch(&mut self) -> Result<PassSummary, TrainError> {
        let num_batches = self.train_loader.num_batches();
        let mut pass = self.train_loader.start_pass(self.training_epoch)?;
        let mut metrics = PassMetrics::new();

        while let Some(batch) = pass.next_batch()? {
            let signals = batch
                .signals
                .to_device(&self.device)
                .map_err(candle_err)?;
            let labels = batch.labels.to_device(&self.device).map_err(candle_err)?;

            let logits = self.model.forward(&signals, true).map_err(candle_err)?;
            let loss = self.criterion.compute(&logits, &labels)?;
            let grads = loss.loss.backward().map_err(candle_err)?;
            self.optimizer.step(&grads)?;

            let predicted = predicted_ids(&logits)?;
            metrics.update(loss.value, &predicted, &batch.label_ids);

            let batch_index = metrics.batches();
            if batch_index % self.config.log_every == 0 {
                println!(
                    "\tIter [{}/{}] Loss: {:.4}",
                    batch_index, num_batches, loss.value
                );
            }
            self.logger
                .log_scalar("train/loss_iter", self.total_iter, loss.value as f64)?;
            self.total_iter += 1;
        }

        metrics
            .finalize()
            .ok_or_else(|| TrainError::runtime("training pass produced no batches"))
    }

    /// One ordered pass over the validation set. No gradients are computed;
    /// the forward graph is dropped with each batch.
    pub fn validate(&mut self) -> Result<PassSummary, TrainError> {
        let bar = ProgressBar::new(self.val_loader.num_batches() as u64);
        let mut pass = self.val_loader.start_pass(self.training_epoch)?;
        let mut metrics = PassMetrics::new();

        while let Some(batch) = pass.next_batch()? {
            let signals = batch
                .signals
                .to_device(&self.device)
                .map_err(candle_err)?;
            let labels = batch.labels.to_device(&self.device).map_err(candle_err)?;

            let logits = self.model.forward(&signals, false).map_err(candle_err)?;
            let loss = self.criterion.compute(&logits, &labels)?;
            let predicted = predicted_ids(&logits)?;
            metrics.update(loss.value, &predicted, &batch.label_ids);
            bar.inc(1);
        }
        bar.finish_and_clear();

        metrics
            .finalize()
            .ok_or_else(|| TrainError::runtime("validation pass produced no batches"))
    }

    /// Runs the remaining epochs: train, checkpoint, validate, log. A resumed
    /// trainer continues from the epoch after its checkpoint.
    pub fn run(&mut self) -> Result<(), TrainError> {
        for epoch in self.training_epoch..self.config.epochs {
            println!("Epoch - {}", epoch + 1);

            let train_summary = self.train_epoch()?;
            checkpoint::save(
                &self.dirs.checkpoint_dir,
                &self.model,
                &self.optimizer,
                epoch,
                self.total_iter,
                &self.config_sha,
            )?;
            let val_summary = self.validate()?;

            println!("Train Loss: {:.4}", train_summary.mean_loss);
            println!("Train Acc:  {:.4}", train_summary.accuracy);
            println!("Val Loss:   {:.4}", val_summary.mean_loss);
            println!("Val Acc:    {:.4}", val_summary.accuracy);

            self.logger
                .log_scalar("train/loss", epoch, train_summary.mean_loss)?;
            self.logger
                .log_scalar("train/accuracy", epoch, train_summary.accuracy)?;
            self.logger
                .log_scalar("val/loss", epoch, val_summary.mean_loss)?;
            self.logger
                .log_scalar("val/accuracy", epoch, val_summary.accuracy)?;

            if let Some(scheduler) = self.scheduler.as_mut() {
                if let Some(lr) = scheduler.observe(val_summary.mean_loss) {
                    self.optimizer.set_learning_rate(lr);
                    println!("Learning rate reduced to {lr:e}");
                }
            }

            self.training_epoch = epoch + 1;
        }

        self.logger.flush()
    }
}

fn predicted_ids(logits: &candle_core::Tensor) -> Result<Vec<u32>, TrainError> {
    logits
        .argmax(D::Minus1)
        .and_then(|ids| ids.to_vec1::<u32>())
        .map_err(candle_err)
}

fn candle_err(err: candle_core::Error) -> TrainError {
    TrainError::runtime(err.to_string())
}
