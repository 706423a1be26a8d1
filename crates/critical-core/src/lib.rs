//! Core types and utilities for critical-period training.
//!
//! Settings and their command-line parser, the shared error type, logging
//! setup, accelerator selection and the metric sinks used by the trainer.

pub mod backend;
pub mod cli;
pub mod config;
pub mod error;
pub mod metrics;

pub use backend::{resolve_precision, select_device, Device, FloatWidth};
pub use cli::setup_cli_logging;
pub use config::{load_config, Precision, Settings, TriggerMode, EPOCH_LR_DECAY};
pub use error::{Error, Result};
pub use metrics::{
    CsvSink, EpochSummary, MemorySink, MetricLogger, MetricRecord, MetricSink, RunningMean,
    TrackingSink, TrainingMetrics,
};
