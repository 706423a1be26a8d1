//! Hooks the training driver invokes at fixed points of the loop.

use critical_core::Result;

/// Where the driver is when a hook runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochContext {
    /// Zero-based index of the epoch about to start
    pub epoch: usize,
    pub max_epochs: usize,
    /// Optimizer steps taken so far
    pub global_step: usize,
}

pub trait TrainingCallback: Send {
    fn name(&self) -> &str;

    /// Runs before the first batch of every training epoch. A returned notice
    /// is logged by the driver and kept in the fit report.
    fn on_train_epoch_start(&mut self, ctx: &EpochContext) -> Result<Option<String>>;
}
