//! Metric records and the sinks they are written to.
//!
//! The training module logs scalar metrics through a [`MetricLogger`], which
//! stamps each value with the current epoch and optimizer step and fans it out
//! to every registered [`MetricSink`].

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{Error, Result};

/// One logged scalar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub name: String,
    pub value: f64,
    /// Number of optimizer steps taken when the value was logged.
    pub step: usize,
    pub epoch: usize,
}

/// Destination for metric records.
pub trait MetricSink: Send {
    /// Short name used in log messages.
    fn name(&self) -> &str;

    /// Records the run's hyperparameters, serialized as TOML.
    fn log_hyperparams(&mut self, _hparams_toml: &str) -> Result<()> {
        Ok(())
    }

    fn log_metric(&mut self, record: &MetricRecord) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Writes records to `<save_dir>/<name>/version_<n>/metrics.csv`.
///
/// Each run gets the next free `version_<n>` directory, so repeated runs with
/// the same name never overwrite each other.
pub struct CsvSink {
    log_dir: PathBuf,
    writer: BufWriter<File>,
}

impl CsvSink {
    pub const METRICS_FILE: &'static str = "metrics.csv";
    pub const HPARAMS_FILE: &'static str = "hparams.toml";

    pub fn create(save_dir: impl AsRef<Path>, name: &str) -> Result<Self> {
        let root = save_dir.as_ref().join(name);
        fs::create_dir_all(&root)?;
        let log_dir = root.join(format!("version_{}", next_version(&root)?));
        fs::create_dir_all(&log_dir)?;

        let mut writer = BufWriter::new(File::create(log_dir.join(Self::METRICS_FILE))?);
        writeln!(writer, "epoch,step,metric,value")?;

        info!("CSV metrics: {}", log_dir.display());
        Ok(Self { log_dir, writer })
    }

    /// The `version_<n>` directory of this run.
    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }
}

fn next_version(root: &Path) -> Result<usize> {
    let mut next = 0;
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let version = name
            .to_str()
            .and_then(|n| n.strip_prefix("version_"))
            .and_then(|v| v.parse::<usize>().ok());
        if let Some(v) = version {
            next = next.max(v + 1);
        }
    }
    Ok(next)
}

impl MetricSink for CsvSink {
    fn name(&self) -> &str {
        "csv"
    }

    fn log_hyperparams(&mut self, hparams_toml: &str) -> Result<()> {
        fs::write(self.log_dir.join(Self::HPARAMS_FILE), hparams_toml)?;
        Ok(())
    }

    fn log_metric(&mut self, record: &MetricRecord) -> Result<()> {
        if record.name.contains(',') {
            return Err(Error::Logging(format!(
                "metric name {:?} cannot contain a comma",
                record.name
            )));
        }
        writeln!(
            self.writer,
            "{},{},{},{}",
            record.epoch, record.step, record.name, record.value
        )?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Experiment-tracking sink keyed by project and run name.
///
/// Appends one JSON object per line to
/// `<save_dir>/<project>/<run>/tracking.jsonl`, so a resumed run keeps
/// extending the same history.
pub struct TrackingSink {
    project: String,
    run: String,
    path: PathBuf,
    writer: BufWriter<File>,
}

/// One line of `tracking.jsonl`.
#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum TrackingEvent<'a> {
    Hyperparams {
        project: &'a str,
        run: &'a str,
        hparams: toml::Table,
    },
    Metric {
        project: &'a str,
        run: &'a str,
        #[serde(flatten)]
        record: &'a MetricRecord,
    },
}

impl TrackingSink {
    pub const EVENTS_FILE: &'static str = "tracking.jsonl";

    pub fn create(save_dir: impl AsRef<Path>, project: &str, run: &str) -> Result<Self> {
        let dir = save_dir.as_ref().join(project).join(run);
        fs::create_dir_all(&dir)?;
        let path = dir.join(Self::EVENTS_FILE);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        info!("Tracking {project}/{run}: {}", path.display());
        Ok(Self {
            project: project.to_string(),
            run: run.to_string(),
            path,
            writer: BufWriter::new(file),
        })
    }

    /// The `tracking.jsonl` file of this run.
    pub fn path(&self) -> &Path {
        &self.path
    }

}

fn write_event(writer: &mut impl Write, event: &TrackingEvent<'_>) -> Result<()> {
    serde_json::to_writer(&mut *writer, event)?;
    writeln!(writer)?;
    Ok(())
}

impl MetricSink for TrackingSink {
    fn name(&self) -> &str {
        "tracking"
    }

    fn log_hyperparams(&mut self, hparams_toml: &str) -> Result<()> {
        let hparams: toml::Table = toml::from_str(hparams_toml)?;
        let event = TrackingEvent::Hyperparams {
            project: &self.project,
            run: &self.run,
            hparams,
        };
        write_event(&mut self.writer, &event)?;
        self.writer.flush()?;
        Ok(())
    }

    fn log_metric(&mut self, record: &MetricRecord) -> Result<()> {
        let event = TrackingEvent::Metric {
            project: &self.project,
            run: &self.run,
            record,
        };
        write_event(&mut self.writer, &event)
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Keeps records in memory; clones share the same buffer.
#[derive(Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<MetricRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything logged so far.
    pub fn records(&self) -> Vec<MetricRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of records logged under `name`.
    pub fn count(&self, name: &str) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.name == name)
            .count()
    }
}

impl MetricSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    fn log_metric(&mut self, record: &MetricRecord) -> Result<()> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        Ok(())
    }
}

/// Fans metrics out to sinks, stamping them with the current position.
#[derive(Default)]
pub struct MetricLogger {
    sinks: Vec<Box<dyn MetricSink>>,
    epoch: usize,
    step: usize,
}

impl MetricLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: impl MetricSink + 'static) -> Self {
        self.add_sink(sink);
        self
    }

    pub fn add_sink(&mut self, sink: impl MetricSink + 'static) {
        self.sinks.push(Box::new(sink));
    }

    pub fn sink_names(&self) -> Vec<&str> {
        self.sinks.iter().map(|s| s.name()).collect()
    }

    /// Sets the epoch and optimizer step stamped on subsequent records.
    pub fn set_position(&mut self, epoch: usize, step: usize) {
        self.epoch = epoch;
        self.step = step;
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn step(&self) -> usize {
        self.step
    }

    pub fn log(&mut self, name: &str, value: f64) -> Result<()> {
        let record = MetricRecord {
            name: name.to_string(),
            value,
            step: self.step,
            epoch: self.epoch,
        };
        for sink in &mut self.sinks {
            sink.log_metric(&record)?;
        }
        Ok(())
    }

    pub fn log_hyperparams(&mut self, hparams_toml: &str) -> Result<()> {
        for sink in &mut self.sinks {
            sink.log_hyperparams(hparams_toml)?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        for sink in &mut self.sinks {
            sink.flush()?;
        }
        Ok(())
    }
}

/// Sample-weighted running mean, for aggregating per-batch values over an
/// epoch when the last batch is smaller than the rest.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunningMean {
    sum: f64,
    count: usize,
}

impl RunningMean {
    pub fn update(&mut self, value: f64, weight: usize) {
        self.sum += value * weight as f64;
        self.count += weight;
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

/// Per-epoch history of a training run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingMetrics {
    pub train_loss: Vec<f64>,
    pub val_loss: Vec<f64>,
    pub train_accuracy: Vec<f64>,
    pub val_accuracy: Vec<f64>,
    pub learning_rate: Vec<f64>,
    pub epochs: Vec<usize>,
}

/// Aggregated values of a single epoch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochSummary {
    pub epoch: usize,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
    pub learning_rate: f64,
}

impl TrainingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_epoch(&mut self, summary: &EpochSummary) {
        self.epochs.push(summary.epoch);
        self.train_loss.push(summary.train_loss);
        self.val_loss.push(summary.val_loss);
        self.train_accuracy.push(summary.train_accuracy);
        self.val_accuracy.push(summary.val_accuracy);
        self.learning_rate.push(summary.learning_rate);
    }

    pub fn num_epochs(&self) -> usize {
        self.epochs.len()
    }

    /// Gets the best validation accuracy
    pub fn best_val_accuracy(&self) -> Option<f64> {
        self.val_accuracy.iter().copied().max_by(f64::total_cmp)
    }

    /// Gets the epoch with best validation accuracy
    pub fn best_epoch(&self) -> Option<usize> {
        self.val_accuracy
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.total_cmp(b))
            .map(|(idx, _)| self.epochs[idx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn summary(epoch: usize, val_accuracy: f64) -> EpochSummary {
        EpochSummary {
            epoch,
            train_loss: 1.0,
            train_accuracy: 0.5,
            val_loss: 1.1,
            val_accuracy,
            learning_rate: 0.1,
        }
    }

    #[test]
    fn test_training_metrics() {
        let mut metrics = TrainingMetrics::new();
        metrics.add_epoch(&summary(0, 0.75));
        metrics.add_epoch(&summary(1, 0.81));
        metrics.add_epoch(&summary(2, 0.80));

        assert_eq!(metrics.num_epochs(), 3);
        assert_eq!(metrics.best_val_accuracy(), Some(0.81));
        assert_eq!(metrics.best_epoch(), Some(1));
    }

    #[test]
    fn test_running_mean_weights_by_samples() {
        let mut mean = RunningMean::default();
        mean.update(1.0, 2);
        mean.update(4.0, 1);
        assert!((mean.mean() - 2.0).abs() < 1e-12);
        assert_eq!(mean.count(), 3);
        assert_eq!(RunningMean::default().mean(), 0.0);
    }

    #[test]
    fn test_logger_stamps_position() {
        let memory = MemorySink::new();
        let mut logger = MetricLogger::new().with_sink(memory.clone());

        logger.set_position(3, 120);
        logger.log("train_loss", 0.5).unwrap();

        let records = memory.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].epoch, 3);
        assert_eq!(records[0].step, 120);
        assert_eq!(memory.count("train_loss"), 1);
        assert_eq!(memory.count("val_loss"), 0);
    }

    #[test]
    fn test_csv_sink_versions_and_rows() {
        let dir = tempdir().unwrap();

        let mut first = CsvSink::create(dir.path(), "baseline").unwrap();
        first
            .log_metric(&MetricRecord {
                name: "val_acc".into(),
                value: 0.25,
                step: 4,
                epoch: 1,
            })
            .unwrap();
        first.log_hyperparams("lr = 0.1\n").unwrap();
        first.flush().unwrap();

        let second = CsvSink::create(dir.path(), "baseline").unwrap();
        assert!(first.log_dir().ends_with("baseline/version_0"));
        assert!(second.log_dir().ends_with("baseline/version_1"));

        let csv = fs::read_to_string(first.log_dir().join(CsvSink::METRICS_FILE)).unwrap();
        assert_eq!(csv, "epoch,step,metric,value\n1,4,val_acc,0.25\n");
        let hparams = fs::read_to_string(first.log_dir().join(CsvSink::HPARAMS_FILE)).unwrap();
        assert_eq!(hparams, "lr = 0.1\n");
    }

    #[test]
    fn test_tracking_sink_writes_json_lines() {
        let dir = tempdir().unwrap();
        let mut logger = MetricLogger::new();
        let sink = TrackingSink::create(dir.path(), "CriticalPeriodCifar10", "blur20").unwrap();
        let path = sink.path().to_path_buf();
        assert!(path.ends_with("CriticalPeriodCifar10/blur20/tracking.jsonl"));
        logger.add_sink(sink);

        logger.log_hyperparams("lr = 0.1\nrun_name = \"blur20\"\n").unwrap();
        logger.set_position(2, 40);
        logger.log("val_acc", 0.5).unwrap();
        logger.flush().unwrap();

        let lines: Vec<serde_json::Value> = fs::read_to_string(&path)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);

        assert_eq!(lines[0]["kind"], "hyperparams");
        assert_eq!(lines[0]["project"], "CriticalPeriodCifar10");
        assert_eq!(lines[0]["hparams"]["lr"], 0.1);

        assert_eq!(lines[1]["kind"], "metric");
        assert_eq!(lines[1]["run"], "blur20");
        assert_eq!(lines[1]["name"], "val_acc");
        assert_eq!(lines[1]["value"], 0.5);
        assert_eq!(lines[1]["step"], 40);
        assert_eq!(lines[1]["epoch"], 2);
    }

    #[test]
    fn test_tracking_sink_appends_across_runs() {
        let dir = tempdir().unwrap();
        let record = MetricRecord {
            name: "train_loss".into(),
            value: 1.5,
            step: 0,
            epoch: 0,
        };
        for _ in 0..2 {
            let mut sink = TrackingSink::create(dir.path(), "p", "r").unwrap();
            sink.log_metric(&record).unwrap();
            sink.flush().unwrap();
        }
        let path = dir.path().join("p/r").join(TrackingSink::EVENTS_FILE);
        assert_eq!(fs::read_to_string(path).unwrap().lines().count(), 2);
    }

    #[test]
    fn test_logger_lists_sinks() {
        let logger = MetricLogger::new()
            .with_sink(MemorySink::new())
            .with_sink(MemorySink::new());
        assert_eq!(logger.sink_names(), vec!["memory", "memory"]);
    }

    #[test]
    fn test_csv_sink_rejects_commas() {
        let dir = tempdir().unwrap();
        let mut sink = CsvSink::create(dir.path(), "run").unwrap();
        let record = MetricRecord {
            name: "a,b".into(),
            value: 1.0,
            step: 0,
            epoch: 0,
        };
        assert!(sink.log_metric(&record).is_err());
    }
}
