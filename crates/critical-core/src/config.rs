//! Run configuration.
//!
//! [`Settings`] is parsed once from the command line by [`load_config`] and
//! then passed by reference to every component that needs it.

use std::ffi::OsString;
use std::fmt;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Per-epoch multiplicative learning-rate decay applied by the schedule.
///
/// The `--gamma` flag does not feed this value unless
/// `--schedule_uses_gamma` is given.
pub const EPOCH_LR_DECAY: f64 = 0.97;

/// Numeric precision requested for training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum Precision {
    /// 64-bit floats
    #[value(name = "64", alias = "64-true")]
    #[serde(rename = "64")]
    Double,
    /// 32-bit floats
    #[value(name = "32", alias = "32-true")]
    #[serde(rename = "32")]
    Single,
    /// 16-bit floats, mixed with 32-bit accumulation
    #[value(name = "16", alias = "16-mixed")]
    #[serde(rename = "16")]
    Half,
    /// bfloat16, mixed with 32-bit accumulation
    #[value(name = "bf16", alias = "bf16-mixed")]
    #[serde(rename = "bf16")]
    BFloat16,
}

impl Precision {
    /// Whether the request asks for a 16-bit float format.
    pub fn is_half(self) -> bool {
        matches!(self, Precision::Half | Precision::BFloat16)
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Precision::Double => "64",
            Precision::Single => "32",
            Precision::Half => "16",
            Precision::BFloat16 => "bf16",
        };
        f.write_str(name)
    }
}

/// When the deficit-removal hook is allowed to fire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TriggerMode {
    /// Fire only when the epoch equals the threshold.
    #[default]
    Exact,
    /// Fire at the first epoch at or past the threshold, once.
    AtOrAfter,
}

impl fmt::Display for TriggerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerMode::Exact => f.write_str("exact"),
            TriggerMode::AtOrAfter => f.write_str("at-or-after"),
        }
    }
}

/// CIFAR-10 classification with an early blur deficit.
#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
#[command(name = "critical-train", version, about)]
pub struct Settings {
    /// Batch size for training and validation
    #[arg(long = "batch_size", default_value_t = 128)]
    pub batch_size: usize,

    /// Learning rate
    #[arg(long = "lr", default_value_t = 0.1)]
    pub lr: f64,

    /// SGD momentum
    #[arg(long = "momentum", default_value_t = 0.9)]
    pub momentum: f64,

    /// Weight decay
    #[arg(long = "weight_decay", default_value_t = 5e-4)]
    pub weight_decay: f64,

    /// Number of epochs to train after the deficit is removed
    #[arg(long = "epochs_after_deficit", default_value_t = 160)]
    pub epochs_after_deficit: usize,

    /// LR scheduler gamma (ignored unless --schedule_uses_gamma)
    #[arg(long = "gamma", default_value_t = 0.1)]
    pub gamma: f64,

    /// Decay the learning rate by --gamma instead of 0.97
    #[arg(long = "schedule_uses_gamma")]
    pub schedule_uses_gamma: bool,

    /// Experiment-tracking project name
    #[arg(long = "project", default_value = "CriticalPeriodCifar10")]
    pub project: String,

    /// Experiment-tracking run name, also the CSV logger name
    #[arg(long = "run_name", default_value = "baseline")]
    pub run_name: String,

    /// Directory for CSV logs
    #[arg(long = "log_dir", default_value = "logs/")]
    pub log_dir: PathBuf,

    /// Directory for model checkpoints
    #[arg(long = "checkpoint_dir", default_value = "checkpoints/")]
    pub checkpoint_dir: PathBuf,

    /// Save the top-3 checkpoints by validation accuracy
    #[arg(long = "enable_checkpointing")]
    pub enable_checkpointing: bool,

    /// Resume from a checkpoint written with --enable_checkpointing
    #[arg(long = "resume_from")]
    pub resume_from: Option<PathBuf>,

    /// Number of data-loading worker threads
    #[arg(long = "num_workers", default_value_t = 8)]
    pub num_workers: usize,

    /// Training precision
    #[arg(long = "precision", value_enum, default_value_t = Precision::Half)]
    pub precision: Precision,

    /// Epoch at which the blur transform is removed
    #[arg(long = "deficit_epoch", default_value_t = 0)]
    pub deficit_epoch: usize,

    /// How the deficit epoch is matched against the current epoch
    #[arg(long = "deficit_trigger", value_enum, default_value_t = TriggerMode::Exact)]
    pub deficit_trigger: TriggerMode,

    /// Root directory of the CIFAR-10 download
    #[arg(long = "data_dir", default_value = "./data")]
    pub data_dir: PathBuf,

    /// Fail instead of downloading when the dataset is missing
    #[arg(long = "no_download")]
    pub no_download: bool,

    /// Random seed (drawn at random when omitted)
    #[arg(long = "seed")]
    pub seed: Option<u64>,

    /// Disable the progress bar
    #[arg(long = "no_progress")]
    #[serde(skip)]
    pub no_progress: bool,

    /// Verbose output
    #[arg(short, long)]
    #[serde(skip)]
    pub verbose: bool,
}

/// Parses and validates settings from an argument vector.
///
/// The first element is the program name, as with `std::env::args_os()`.
/// Parse failures come back as [`clap::Error`] so the caller can print the
/// usage message and exit; semantic failures are reported the same way.
pub fn load_config<I, T>(argv: I) -> std::result::Result<Settings, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let settings = Settings::try_parse_from(argv)?;
    settings.validate().map_err(|e| {
        clap::Error::raw(clap::error::ErrorKind::ValueValidation, format!("{e}\n"))
    })?;
    Ok(settings)
}

impl Settings {
    /// Checks values clap cannot reject on type alone.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be greater than 0".into()));
        }
        if self.max_epochs() == 0 {
            return Err(Error::Config(
                "deficit_epoch + epochs_after_deficit must be greater than 0".into(),
            ));
        }
        if !(self.lr > 0.0 && self.lr.is_finite()) {
            return Err(Error::Config(format!("lr must be finite and positive, got {}", self.lr)));
        }
        if !(0.0..1.0).contains(&self.momentum) {
            return Err(Error::Config(format!(
                "momentum must be in [0, 1), got {}",
                self.momentum
            )));
        }
        if !(self.weight_decay >= 0.0 && self.weight_decay.is_finite()) {
            return Err(Error::Config(format!(
                "weight_decay must be finite and non-negative, got {}",
                self.weight_decay
            )));
        }
        if self.schedule_uses_gamma && !(self.gamma > 0.0 && self.gamma.is_finite()) {
            return Err(Error::Config(format!("gamma must be positive, got {}", self.gamma)));
        }
        Ok(())
    }

    /// Total number of epochs in the run.
    pub fn max_epochs(&self) -> usize {
        self.deficit_epoch + self.epochs_after_deficit
    }

    /// Decay factor the learning-rate schedule applies after every epoch.
    pub fn lr_decay(&self) -> f64 {
        if self.schedule_uses_gamma {
            self.gamma
        } else {
            EPOCH_LR_DECAY
        }
    }

    /// Returns `(gamma, applied)` when `--gamma` was set to something the
    /// schedule will not use.
    pub fn gamma_discrepancy(&self) -> Option<(f64, f64)> {
        let applied = self.lr_decay();
        if (self.gamma - applied).abs() > f64::EPSILON {
            Some((self.gamma, applied))
        } else {
            None
        }
    }

    /// Serializes the settings as TOML, for saving next to the run's logs.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
