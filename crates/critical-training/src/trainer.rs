//! The epoch/batch training loop.
//!
//! Every epoch runs the registered callbacks, trains over the training loader
//! with SGD, validates on the inner (non-autodiff) backend, logs epoch
//! aggregates, optionally checkpoints, and steps the learning-rate schedule.

use std::path::PathBuf;

use burn::{
    data::dataloader::batcher::Batcher,
    module::AutodiffModule,
    optim::{GradientsParams, Optimizer},
    tensor::backend::AutodiffBackend,
};
use critical_core::{
    EpochSummary, Error, MetricLogger, Result, RunningMean, Settings, TrainingMetrics,
};
use critical_dataset::{BatchLoader, CifarBatcher};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::callback::{EpochContext, TrainingCallback};
use crate::checkpoint::{CheckpointManager, CheckpointMetadata};
use crate::classifier::{sgd_config, CifarClassifier};
use crate::lr_schedule::LearningRateScheduler;

/// Configuration for the trainer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerConfig {
    pub max_epochs: usize,
    /// First epoch to run; non-zero when resuming
    pub start_epoch: usize,
    /// Optimizer steps already taken before `start_epoch`
    pub start_step: usize,
    pub learning_rate: f64,
    pub lr_decay: f64,
    pub momentum: f64,
    pub weight_decay: f64,
    pub show_progress: bool,
}

impl From<&Settings> for TrainerConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            max_epochs: settings.max_epochs(),
            start_epoch: 0,
            start_step: 0,
            learning_rate: settings.lr,
            lr_decay: settings.lr_decay(),
            momentum: settings.momentum,
            weight_decay: settings.weight_decay,
            show_progress: !settings.no_progress,
        }
    }
}

/// Outcome of [`Trainer::fit`].
pub struct FitReport<B: AutodiffBackend> {
    pub model: CifarClassifier<B>,
    pub history: TrainingMetrics,
    /// `(epoch, notice)` for every notice a callback emitted
    pub notices: Vec<(usize, String)>,
    pub global_step: usize,
    pub best_checkpoint: Option<PathBuf>,
}

pub struct Trainer<B: AutodiffBackend> {
    config: TrainerConfig,
    device: B::Device,
    logger: MetricLogger,
    callbacks: Vec<Box<dyn TrainingCallback>>,
    checkpoints: Option<CheckpointManager>,
}

impl<B: AutodiffBackend> Trainer<B> {
    pub fn new(config: TrainerConfig, device: B::Device, logger: MetricLogger) -> Self {
        Self {
            config,
            device,
            logger,
            callbacks: Vec::new(),
            checkpoints: None,
        }
    }

    pub fn with_callback(mut self, callback: impl TrainingCallback + 'static) -> Self {
        self.callbacks.push(Box::new(callback));
        self
    }

    /// Enables top-k checkpointing after every validation pass.
    pub fn with_checkpointing(mut self, manager: CheckpointManager) -> Self {
        self.checkpoints = Some(manager);
        self
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn fit(
        &mut self,
        mut model: CifarClassifier<B>,
        train: &BatchLoader,
        val: &BatchLoader,
    ) -> Result<FitReport<B>> {
        if train.is_empty() {
            return Err(Error::Training("the training set is empty".into()));
        }
        let config = self.config.clone();
        let mut optimizer =
            sgd_config(config.momentum, config.weight_decay).init::<B, CifarClassifier<B>>();
        let mut scheduler =
            LearningRateScheduler::per_epoch_decay(config.learning_rate, config.lr_decay)
                .starting_at(config.start_epoch);
        let train_batcher = CifarBatcher::<B>::new();
        let val_batcher = CifarBatcher::<B::InnerBackend>::new();

        let mut history = TrainingMetrics::new();
        let mut notices = Vec::new();
        let mut global_step = config.start_step;

        info!(
            "Training epochs {}..{} ({} train / {} val batches per epoch)",
            config.start_epoch,
            config.max_epochs,
            train.num_batches(),
            val.num_batches()
        );

        for epoch in config.start_epoch..config.max_epochs {
            let ctx = EpochContext {
                epoch,
                max_epochs: config.max_epochs,
                global_step,
            };
            for callback in &mut self.callbacks {
                if let Some(notice) = callback.on_train_epoch_start(&ctx)? {
                    info!("[{}] {notice}", callback.name());
                    notices.push((epoch, notice));
                }
            }

            let lr = scheduler.get_lr();
            let progress = self.progress_bar(epoch, train.num_batches() + val.num_batches());

            let mut train_loss = RunningMean::default();
            let mut train_acc = RunningMean::default();
            for items in train.epoch(epoch)? {
                let batch = train_batcher.batch(items?, &self.device);
                self.logger.set_position(epoch, global_step);

                let output = model.training_step(batch, &mut self.logger)?;
                let grads = output.loss.backward();
                let grads = GradientsParams::from_grads(grads, &model);
                model = optimizer.step(lr, model, grads);
                global_step += 1;

                let step = output.summary;
                train_loss.update(step.loss, step.batch_size);
                train_acc.update(step.accuracy, step.batch_size);
                progress.set_message(format!("train_acc={:.3}", step.accuracy));
                progress.inc(1);
            }

            let valid_model = model.valid();
            let mut val_loss = RunningMean::default();
            let mut val_acc = RunningMean::default();
            self.logger.set_position(epoch, global_step);
            for items in val.epoch(epoch)? {
                let batch = val_batcher.batch(items?, &self.device);
                let step = valid_model.validation_step(batch, &mut self.logger)?;
                val_loss.update(step.loss, step.batch_size);
                val_acc.update(step.accuracy, step.batch_size);
                progress.set_message(format!(
                    "val_loss={:.3} val_acc={:.3}",
                    val_loss.mean(),
                    val_acc.mean()
                ));
                progress.inc(1);
            }
            progress.finish_and_clear();

            let summary = EpochSummary {
                epoch,
                train_loss: train_loss.mean(),
                train_accuracy: train_acc.mean(),
                val_loss: val_loss.mean(),
                val_accuracy: val_acc.mean(),
                learning_rate: lr,
            };
            self.log_epoch(&summary)?;
            history.add_epoch(&summary);

            if let Some(manager) = &mut self.checkpoints {
                let metadata = CheckpointMetadata::new(
                    epoch,
                    global_step,
                    summary.val_accuracy,
                    summary.val_loss,
                    lr,
                );
                manager.save::<B, _>(&model, &metadata)?;
            }

            scheduler.step();
            self.logger.flush()?;
        }

        let best_checkpoint = self
            .checkpoints
            .as_ref()
            .and_then(|m| m.best().map(|best| m.weights_path(&best.stem)));

        Ok(FitReport {
            model,
            history,
            notices,
            global_step,
            best_checkpoint,
        })
    }

    fn log_epoch(&mut self, summary: &EpochSummary) -> Result<()> {
        self.logger.log("train_loss_epoch", summary.train_loss)?;
        self.logger.log("train_acc_epoch", summary.train_accuracy)?;
        self.logger.log("val_loss_epoch", summary.val_loss)?;
        self.logger.log("val_acc_epoch", summary.val_accuracy)?;
        self.logger.log("lr", summary.learning_rate)?;

        if !summary.train_loss.is_finite() {
            warn!(
                "Epoch {}: training loss is {}; continuing",
                summary.epoch, summary.train_loss
            );
        }
        info!(
            "Epoch {:>3}/{}: train_loss={:.4} train_acc={:.4} val_loss={:.4} val_acc={:.4} lr={:.5}",
            summary.epoch + 1,
            self.config.max_epochs,
            summary.train_loss,
            summary.train_accuracy,
            summary.val_loss,
            summary.val_accuracy,
            summary.learning_rate
        );
        Ok(())
    }

    fn progress_bar(&self, epoch: usize, len: usize) -> ProgressBar {
        if !self.config.show_progress {
            return ProgressBar::hidden();
        }
        let style = ProgressStyle::with_template(
            "{prefix} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
        ProgressBar::new(len as u64)
            .with_style(style)
            .with_prefix(format!("Epoch {}", epoch + 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(args: &[&str]) -> Settings {
        critical_core::load_config(std::iter::once("critical-train").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn test_trainer_config_from_settings() {
        let config = TrainerConfig::from(&settings(&[
            "--deficit_epoch",
            "20",
            "--epochs_after_deficit",
            "5",
            "--no_progress",
        ]));
        assert_eq!(config.max_epochs, 25);
        assert_eq!(config.start_epoch, 0);
        assert_eq!(config.lr_decay, critical_core::EPOCH_LR_DECAY);
        assert_eq!(config.learning_rate, 0.1);
        assert!(!config.show_progress);
    }

    #[test]
    fn test_fit_rejects_empty_training_set() {
        use burn::backend::{Autodiff, NdArray};
        use critical_dataset::{eval_pipeline, CifarDataset, LoaderConfig};
        use std::sync::Arc;

        type TestBackend = Autodiff<NdArray>;

        let empty = Arc::new(CifarDataset::new(Vec::new(), eval_pipeline()));
        let loader = BatchLoader::new(empty, LoaderConfig::new(2, false, 0, 0)).unwrap();
        let device = Default::default();
        let model = CifarClassifier::new(
            crate::model::ResNetConfig::new()
                .with_base_width(4)
                .init::<TestBackend>(&device)
                .unwrap(),
        );

        let mut config = TrainerConfig::from(&settings(&["--no_progress"]));
        config.max_epochs = 1;
        let mut trainer = Trainer::<TestBackend>::new(config, device, MetricLogger::new());
        let result = trainer.fit(model, &loader, &loader);
        assert!(matches!(result, Err(Error::Training(_))));
    }

    #[test]
    fn test_trainer_config_with_gamma() {
        let config = TrainerConfig::from(&settings(&["--schedule_uses_gamma", "--gamma", "0.5"]));
        assert_eq!(config.lr_decay, 0.5);
    }
}
