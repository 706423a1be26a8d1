//! Scheduled removal of the blur deficit from the training pipeline.

use critical_core::{Result, TriggerMode};
use critical_dataset::{PipelineHandle, TransformKind};
use tracing::debug;

use crate::callback::{EpochContext, TrainingCallback};

/// Swaps the training dataset's pipeline for one without the blur-resample
/// step once the deficit epoch is reached.
///
/// In [`TriggerMode::Exact`] the swap happens when the epoch equals the
/// threshold, so a run resumed past the threshold keeps the blur. In
/// [`TriggerMode::AtOrAfter`] it happens at the first epoch at or past the
/// threshold, and never again.
pub struct DeficitRemoval {
    threshold: usize,
    mode: TriggerMode,
    pipeline: PipelineHandle,
    fired_at: Option<usize>,
}

impl DeficitRemoval {
    pub fn new(threshold: usize, mode: TriggerMode, pipeline: PipelineHandle) -> Self {
        Self {
            threshold,
            mode,
            pipeline,
            fired_at: None,
        }
    }

    /// Epoch at which the blur was last removed, if it has been.
    pub fn fired_at(&self) -> Option<usize> {
        self.fired_at
    }

    fn should_fire(&self, epoch: usize) -> bool {
        match self.mode {
            TriggerMode::Exact => epoch == self.threshold,
            TriggerMode::AtOrAfter => epoch >= self.threshold && self.fired_at.is_none(),
        }
    }

    fn notice(&self, epoch: usize) -> String {
        if epoch == self.threshold {
            format!("Removed blur-resample transform at epoch {}.", self.threshold)
        } else {
            format!(
                "Removed blur-resample transform at epoch {epoch} (deficit epoch {}).",
                self.threshold
            )
        }
    }
}

impl TrainingCallback for DeficitRemoval {
    fn name(&self) -> &str {
        "deficit-removal"
    }

    fn on_train_epoch_start(&mut self, ctx: &EpochContext) -> Result<Option<String>> {
        if !self.should_fire(ctx.epoch) {
            return Ok(None);
        }

        let current = self.pipeline.snapshot();
        let cleared = current.without(TransformKind::BlurResample);
        debug!("Training pipeline {current} -> {cleared}");
        self.pipeline.replace(cleared);
        self.fired_at = Some(ctx.epoch);

        Ok(Some(self.notice(ctx.epoch)))
    }
}
