//! Model, training module and training driver for critical-period
//! experiments on CIFAR-10.
//!
//! A [`Trainer`] runs a [`CifarClassifier`] over [`BatchLoader`]s, calling
//! [`TrainingCallback`]s at the start of each epoch. [`DeficitRemoval`] is the
//! callback that drops the blur step from the training pipeline at the deficit
//! epoch.
//!
//! [`BatchLoader`]: critical_dataset::BatchLoader

pub mod callback;
pub mod checkpoint;
pub mod classifier;
pub mod deficit;
pub mod lr_schedule;
pub mod model;
pub mod trainer;

pub use callback::{EpochContext, TrainingCallback};
pub use checkpoint::{load_checkpoint, CheckpointManager, CheckpointMetadata};
pub use classifier::{sgd_config, CifarClassifier, StepOutput, StepSummary};
pub use deficit::DeficitRemoval;
pub use lr_schedule::LearningRateScheduler;
pub use model::{small_image_resnet18, ResNet, ResNetConfig};
pub use trainer::{FitReport, Trainer, TrainerConfig};
