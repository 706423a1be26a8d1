//! Critical-period training on CIFAR-10.
//!
//! Trains a small-image ResNet-18 with blurred inputs until the deficit epoch,
//! then removes the blur and keeps training on sharp images.

mod backend;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use burn::tensor::backend::AutodiffBackend;
use colored::Colorize;
use critical_core::{
    load_config, resolve_precision, select_device, setup_cli_logging, CsvSink, Device,
    FloatWidth, MetricLogger, Settings, TrackingSink, TriggerMode,
};
use critical_dataset::{
    cifar10, eval_pipeline, train_pipeline, BatchLoader, CifarDataset, DatasetStatistics,
    LabeledImage, LoaderConfig, Split, CIFAR10_MEAN, CIFAR10_STD, CLASS_NAMES,
};
use critical_training::{
    load_checkpoint, small_image_resnet18, CheckpointManager, CifarClassifier, DeficitRemoval,
    FitReport, Trainer, TrainerConfig,
};
use tracing::{info, warn};

/// Number of best checkpoints kept on disk.
const SAVE_TOP_K: usize = 3;

/// Largest accepted gap between measured and configured channel statistics.
const NORMALIZATION_TOLERANCE: f64 = 0.01;

fn main() -> Result<()> {
    let settings = load_config(std::env::args_os()).unwrap_or_else(|e| e.exit());
    setup_cli_logging(settings.verbose)?;

    info!("Critical-period training: run '{}'", settings.run_name);
    if let Some((gamma, applied)) = settings.gamma_discrepancy() {
        warn!(
            "--gamma {gamma} is not used by the schedule; the learning rate decays by {applied} \
             per epoch (pass --schedule_uses_gamma to apply --gamma)"
        );
    }

    let seed = settings.seed.unwrap_or_else(rand::random);
    info!("Seed: {seed}");

    let (train_images, test_images) = prepare_data(&settings)?;

    let device = select_device(cfg!(feature = "wgpu"));
    let width = resolve_precision(settings.precision, device);
    info!("Device: {device}, precision {} ({width})", settings.precision);

    let report: RunSummary = match (device, width) {
        (Device::Cpu, FloatWidth::F32) => {
            run::<backend::CpuF32>(&settings, seed, Default::default(), train_images, test_images)?
                .into()
        }
        (Device::Cpu, FloatWidth::F64) => {
            run::<backend::CpuF64>(&settings, seed, Default::default(), train_images, test_images)?
                .into()
        }
        #[cfg(feature = "wgpu")]
        (Device::Gpu(index), _) => run::<backend::Gpu>(
            &settings,
            seed,
            backend::gpu_device(index),
            train_images,
            test_images,
        )?
        .into(),
        #[cfg(not(feature = "wgpu"))]
        (Device::Gpu(_), _) => bail!("GPU selected but no GPU backend was compiled in"),
    };

    print_summary(&settings, &report);
    Ok(())
}

/// Backend-independent outcome of a run.
struct RunSummary {
    epochs_run: usize,
    best_val_acc: Option<f64>,
    best_epoch: Option<usize>,
    final_val_acc: Option<f64>,
    notices: Vec<(usize, String)>,
    best_checkpoint: Option<PathBuf>,
    metrics_dir: PathBuf,
}

/// Downloads the dataset if needed and loads both splits.
fn prepare_data(settings: &Settings) -> Result<(Vec<LabeledImage>, Vec<LabeledImage>)> {
    let data_dir = &settings.data_dir;
    if !cifar10::is_available(data_dir) {
        if settings.no_download {
            bail!(
                "CIFAR-10 not found under {} and --no_download is set",
                cifar10::batches_dir(data_dir).display()
            );
        }
        cifar10::download(data_dir).context("Failed to download CIFAR-10")?;
    }

    let train = cifar10::load_split(data_dir, Split::Train)
        .context("Failed to load the CIFAR-10 training split")?;
    let test = cifar10::load_split(data_dir, Split::Test)
        .context("Failed to load the CIFAR-10 test split")?;
    info!("Loaded {} training / {} test images", train.len(), test.len());
    log_statistics(&DatasetStatistics::compute(&train));

    Ok((train, test))
}

fn log_statistics(stats: &DatasetStatistics) {
    info!(
        "Training set mean {:.4?}, std {:.4?}",
        stats.channel_mean, stats.channel_std
    );
    let drift = stats
        .channel_mean
        .iter()
        .zip(CIFAR10_MEAN)
        .chain(stats.channel_std.iter().zip(CIFAR10_STD))
        .any(|(measured, expected)| (measured - expected as f64).abs() > NORMALIZATION_TOLERANCE);
    if drift {
        warn!(
            "Normalization constants (mean {CIFAR10_MEAN:?}, std {CIFAR10_STD:?}) do not match \
             the training set"
        );
    }
    if !stats.is_class_balanced() {
        for (name, count) in CLASS_NAMES.iter().zip(stats.class_counts) {
            warn!("  {name}: {count} images");
        }
    }
}

fn run<B: AutodiffBackend>(
    settings: &Settings,
    seed: u64,
    device: B::Device,
    train_images: Vec<LabeledImage>,
    test_images: Vec<LabeledImage>,
) -> Result<(FitReport<B>, PathBuf)> {
    let train_ds = Arc::new(CifarDataset::new(train_images, train_pipeline()));
    let val_ds = Arc::new(CifarDataset::new(test_images, eval_pipeline()));
    info!("Training pipeline: {}", train_ds.pipeline().snapshot());

    let train_loader = BatchLoader::new(
        Arc::clone(&train_ds),
        LoaderConfig::new(settings.batch_size, true, settings.num_workers, seed),
    )?;
    let val_loader = BatchLoader::new(
        val_ds,
        LoaderConfig::new(settings.batch_size, false, settings.num_workers, seed),
    )?;

    let mut config = TrainerConfig::from(settings);
    let mut model = CifarClassifier::new(small_image_resnet18::<B>(&device)?);
    if let Some(path) = &settings.resume_from {
        let (resumed, metadata) = load_checkpoint::<B, _>(model, path, &device)
            .with_context(|| format!("Failed to resume from {}", path.display()))?;
        model = resumed;
        config.start_epoch = metadata.epoch + 1;
        config.start_step = metadata.global_step;
        warn_if_deficit_skipped(settings, config.start_epoch);
    }

    let csv = CsvSink::create(&settings.log_dir, &settings.run_name)
        .context("Failed to create the CSV metrics directory")?;
    let metrics_dir = csv.log_dir().to_path_buf();
    let tracking = TrackingSink::create(&settings.log_dir, &settings.project, &settings.run_name)
        .context("Failed to open the tracking log")?;
    let mut logger = MetricLogger::new().with_sink(csv).with_sink(tracking);
    info!("Metric sinks: {}", logger.sink_names().join(", "));
    logger.log_hyperparams(&settings.to_toml()?)?;

    let deficit = DeficitRemoval::new(
        settings.deficit_epoch,
        settings.deficit_trigger,
        train_ds.pipeline().clone(),
    );
    let mut trainer = Trainer::<B>::new(config, device, logger).with_callback(deficit);
    if settings.enable_checkpointing {
        let manager = CheckpointManager::new(settings.checkpoint_dir.clone(), SAVE_TOP_K)
            .context("Failed to create the checkpoint directory")?;
        trainer = trainer.with_checkpointing(manager);
    }

    let report = trainer.fit(model, &train_loader, &val_loader)?;
    Ok((report, metrics_dir))
}

/// An exact trigger never fires once the run starts past the deficit epoch.
fn warn_if_deficit_skipped(settings: &Settings, start_epoch: usize) {
    if settings.deficit_trigger == TriggerMode::Exact && start_epoch > settings.deficit_epoch {
        warn!(
            "Resuming at epoch {start_epoch}, past deficit epoch {}: the blur step stays in the \
             training pipeline (use --deficit_trigger at-or-after to remove it)",
            settings.deficit_epoch
        );
    }
}

impl<B: AutodiffBackend> From<(FitReport<B>, PathBuf)> for RunSummary {
    fn from((report, metrics_dir): (FitReport<B>, PathBuf)) -> Self {
        Self {
            epochs_run: report.history.num_epochs(),
            best_val_acc: report.history.best_val_accuracy(),
            best_epoch: report.history.best_epoch(),
            final_val_acc: report.history.val_accuracy.last().copied(),
            notices: report.notices,
            best_checkpoint: report.best_checkpoint,
            metrics_dir,
        }
    }
}

fn print_summary(settings: &Settings, summary: &RunSummary) {
    println!();
    println!("{}", "Training Summary:".green().bold());
    println!("  Epochs run:      {}", summary.epochs_run);
    match summary.notices.first() {
        Some((epoch, notice)) => println!("  Deficit removed: epoch {epoch} ({notice})"),
        None => println!(
            "  Deficit removed: {}",
            "never (blur active for the whole run)".yellow()
        ),
    }
    if let Some(acc) = summary.final_val_acc {
        println!("  Final val_acc:   {acc:.4}");
    }
    if let (Some(acc), Some(epoch)) = (summary.best_val_acc, summary.best_epoch) {
        println!("  Best val_acc:    {} (epoch {epoch})", format!("{acc:.4}").cyan());
    }
    println!("  Metrics:         {}", summary.metrics_dir.display());
    if settings.enable_checkpointing {
        match &summary.best_checkpoint {
            Some(path) => println!("  Best checkpoint: {}", path.display()),
            None => println!("  Best checkpoint: {}", "none saved".yellow()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(args: &[&str]) -> Settings {
        load_config(std::iter::once("critical-train").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_missing_data_without_download_fails() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().to_str().unwrap();
        let settings = settings(&["--data_dir", data_dir, "--no_download"]);

        let err = prepare_data(&settings).unwrap_err();
        assert!(err.to_string().contains("--no_download"));
    }
}
