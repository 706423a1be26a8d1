//! Classifier wrapper with per-batch step logic.

use burn::{
    module::Module,
    nn::loss::CrossEntropyLossConfig,
    optim::{decay::WeightDecayConfig, momentum::MomentumConfig, SgdConfig},
    tensor::{backend::Backend, ElementConversion, Tensor},
};
use critical_core::{MetricLogger, Result};
use critical_dataset::CifarBatch;

use crate::model::ResNet;

/// Loss and accuracy of one batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepSummary {
    pub loss: f64,
    pub accuracy: f64,
    pub batch_size: usize,
}

/// Result of a training step: the loss to differentiate plus its summary.
pub struct StepOutput<B: Backend> {
    pub loss: Tensor<B, 1>,
    pub summary: StepSummary,
}

#[derive(Module, Debug)]
pub struct CifarClassifier<B: Backend> {
    pub model: ResNet<B>,
}

impl<B: Backend> CifarClassifier<B> {
    pub fn new(model: ResNet<B>) -> Self {
        Self { model }
    }

    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.model.forward(images)
    }

    fn evaluate_batch(&self, batch: CifarBatch<B>) -> (Tensor<B, 1>, StepSummary) {
        let batch_size = batch.len();
        let logits = self.forward(batch.images);
        let loss = CrossEntropyLossConfig::new()
            .init(&logits.device())
            .forward(logits.clone(), batch.targets.clone());

        let correct: i64 = logits
            .argmax(1)
            .squeeze::<1>(1)
            .equal(batch.targets)
            .int()
            .sum()
            .into_scalar()
            .elem();
        let loss_value: f64 = loss.clone().into_scalar().elem();

        let summary = StepSummary {
            loss: loss_value,
            accuracy: correct as f64 / batch_size.max(1) as f64,
            batch_size,
        };
        (loss, summary)
    }

    /// Forward pass, cross-entropy and top-1 accuracy; logs `train_loss` and
    /// `train_acc`. The caller differentiates the returned loss.
    pub fn training_step(
        &self,
        batch: CifarBatch<B>,
        logger: &mut MetricLogger,
    ) -> Result<StepOutput<B>> {
        let (loss, summary) = self.evaluate_batch(batch);
        logger.log("train_loss", summary.loss)?;
        logger.log("train_acc", summary.accuracy)?;
        Ok(StepOutput { loss, summary })
    }

    /// Same computation as training; logs `val_loss` and `val_acc`.
    pub fn validation_step(
        &self,
        batch: CifarBatch<B>,
        logger: &mut MetricLogger,
    ) -> Result<StepSummary> {
        let (_, summary) = self.evaluate_batch(batch);
        logger.log("val_loss", summary.loss)?;
        logger.log("val_acc", summary.accuracy)?;
        Ok(summary)
    }
}

/// SGD with classical momentum (no dampening, no Nesterov) and L2 weight
/// decay.
pub fn sgd_config(momentum: f64, weight_decay: f64) -> SgdConfig {
    SgdConfig::new()
        .with_momentum(momentum_config(momentum))
        .with_weight_decay(weight_decay_config(weight_decay))
}

fn momentum_config(momentum: f64) -> Option<MomentumConfig> {
    (momentum > 0.0).then(|| {
        MomentumConfig::new()
            .with_momentum(momentum)
            .with_dampening(0.0)
            .with_nesterov(false)
    })
}

fn weight_decay_config(weight_decay: f64) -> Option<WeightDecayConfig> {
    (weight_decay > 0.0).then(|| WeightDecayConfig::new(weight_decay as f32))
}
