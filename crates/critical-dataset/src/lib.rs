//! CIFAR-10 data for critical-period training.
//!
//! Raw images are read from the binary distribution ([`cifar10`]), wrapped in
//! a [`CifarDataset`] that applies a [`TransformPipeline`] on every access, and
//! served in batches by a [`BatchLoader`]. The training pipeline's blur step
//! can be removed mid-run by swapping the dataset's [`PipelineHandle`].

pub mod batcher;
pub mod cifar10;
pub mod dataset;
pub mod loader;
pub mod pipeline;
pub mod statistics;
pub mod transform;

pub use batcher::{CifarBatch, CifarBatcher};
pub use cifar10::{LabeledImage, Split, CLASS_NAMES, NUM_CLASSES};
pub use dataset::{CifarDataset, CifarItem};
pub use loader::{BatchLoader, EpochBatches, LoaderConfig};
pub use pipeline::{
    eval_pipeline, train_pipeline, PipelineHandle, TransformPipeline, CIFAR10_MEAN, CIFAR10_STD,
};
pub use statistics::DatasetStatistics;
pub use transform::{resize_bilinear, ImageTensor, Transform, TransformKind};
