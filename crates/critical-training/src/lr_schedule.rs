//! Epoch-based learning-rate schedules.

use serde::{Deserialize, Serialize};

/// StepLR: multiplies the learning rate by `gamma` every `step_size` epochs.
/// Call [`step`](Self::step) once at the end of every epoch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningRateScheduler {
    step_size: usize,
    gamma: f64,
    base_lr: f64,
    current_lr: f64,
    current_epoch: usize,
}

impl LearningRateScheduler {
    pub fn step_lr(base_lr: f64, step_size: usize, gamma: f64) -> Self {
        Self {
            step_size,
            gamma,
            base_lr,
            current_lr: base_lr,
            current_epoch: 0,
        }
    }

    /// Per-epoch decay: StepLR with `step_size = 1`.
    pub fn per_epoch_decay(base_lr: f64, decay: f64) -> Self {
        Self::step_lr(base_lr, 1, decay)
    }

    /// Fast-forwards to the state after `epochs` calls to `step`, for
    /// resumed runs.
    pub fn starting_at(mut self, epochs: usize) -> Self {
        for _ in 0..epochs {
            self.step();
        }
        self
    }

    pub fn get_lr(&self) -> f64 {
        self.current_lr
    }

    pub fn base_lr(&self) -> f64 {
        self.base_lr
    }

    pub fn current_epoch(&self) -> usize {
        self.current_epoch
    }

    pub fn step(&mut self) {
        self.current_epoch += 1;
        if self.step_size > 0 && self.current_epoch % self.step_size == 0 {
            self.current_lr *= self.gamma;
        }
    }
}
