//! Top-k model checkpointing by validation accuracy.
//!
//! Each checkpoint is a pair of files sharing a stem such as
//! `cifar10-epoch=07-val_acc=0.81`: `<stem>.mpk` holds the weights and
//! `<stem>.json` the [`CheckpointMetadata`].

use std::fs;
use std::path::{Path, PathBuf};

use burn::{
    module::Module,
    record::CompactRecorder,
    tensor::backend::Backend,
};
use critical_core::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

const WEIGHTS_EXT: &str = "mpk";
const METADATA_EXT: &str = "json";
const STEM_PREFIX: &str = "cifar10-epoch=";

/// Training state stored next to the weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// Last completed epoch
    pub epoch: usize,
    pub global_step: usize,
    pub val_acc: f64,
    pub val_loss: f64,
    pub learning_rate: f64,
    pub timestamp: String,
}

impl CheckpointMetadata {
    pub fn new(
        epoch: usize,
        global_step: usize,
        val_acc: f64,
        val_loss: f64,
        learning_rate: f64,
    ) -> Self {
        Self {
            epoch,
            global_step,
            val_acc,
            val_loss,
            learning_rate,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path).map_err(|e| {
            Error::Checkpoint(format!("cannot read metadata {}: {e}", path.display()))
        })?;
        Ok(serde_json::from_str(&json)?)
    }
}

/// A checkpoint currently kept on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct SavedCheckpoint {
    pub stem: String,
    pub epoch: usize,
    pub val_acc: f64,
}

/// Keeps the `save_top_k` checkpoints with the highest validation accuracy.
pub struct CheckpointManager {
    checkpoint_dir: PathBuf,
    save_top_k: usize,
    /// Sorted by descending `val_acc`
    saved: Vec<SavedCheckpoint>,
}

impl CheckpointManager {
    /// Opens `checkpoint_dir`, picking up the checkpoints an earlier run left
    /// there so they keep competing for the top `save_top_k` slots.
    pub fn new(checkpoint_dir: impl Into<PathBuf>, save_top_k: usize) -> Result<Self> {
        let checkpoint_dir = checkpoint_dir.into();
        fs::create_dir_all(&checkpoint_dir)?;
        let mut manager = Self {
            checkpoint_dir,
            save_top_k,
            saved: Vec::new(),
        };
        manager.saved = manager.scan()?;
        if !manager.saved.is_empty() {
            info!(
                "Found {} existing checkpoints in {}",
                manager.saved.len(),
                manager.checkpoint_dir.display()
            );
        }
        Ok(manager)
    }

    /// Checkpoints in the directory with both weights and metadata present,
    /// best first.
    fn scan(&self) -> Result<Vec<SavedCheckpoint>> {
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.checkpoint_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(METADATA_EXT) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if !stem.starts_with(STEM_PREFIX) || !self.weights_path(stem).is_file() {
                continue;
            }
            match CheckpointMetadata::load(&path) {
                Ok(metadata) => found.push(SavedCheckpoint {
                    stem: stem.to_string(),
                    epoch: metadata.epoch,
                    val_acc: metadata.val_acc,
                }),
                Err(e) => warn!("Ignoring checkpoint {stem}: {e}"),
            }
        }
        found.sort_by(|a, b| b.val_acc.total_cmp(&a.val_acc));
        Ok(found)
    }

    pub fn stem(epoch: usize, val_acc: f64) -> String {
        format!("{STEM_PREFIX}{epoch:02}-val_acc={val_acc:.2}")
    }

    /// Path of the weights file for `stem`.
    pub fn weights_path(&self, stem: &str) -> PathBuf {
        self.checkpoint_dir.join(format!("{stem}.{WEIGHTS_EXT}"))
    }

    fn metadata_path(&self, stem: &str) -> PathBuf {
        self.checkpoint_dir.join(format!("{stem}.{METADATA_EXT}"))
    }

    /// Checkpoints on disk, best first.
    pub fn saved(&self) -> &[SavedCheckpoint] {
        &self.saved
    }

    pub fn best(&self) -> Option<&SavedCheckpoint> {
        self.saved.first()
    }

    fn qualifies(&self, val_acc: f64) -> bool {
        if self.save_top_k == 0 || val_acc.is_nan() {
            return false;
        }
        self.saved.len() < self.save_top_k
            || self.saved.last().is_some_and(|worst| val_acc > worst.val_acc)
    }

    /// Saves `model` if it ranks among the best `save_top_k`, evicting the
    /// worst kept checkpoint when full. Returns the weights path when saved.
    pub fn save<B: Backend, M: Module<B>>(
        &mut self,
        model: &M,
        metadata: &CheckpointMetadata,
    ) -> Result<Option<PathBuf>> {
        if !self.qualifies(metadata.val_acc) {
            debug!(
                "val_acc {:.4} at epoch {} is not in the top {}",
                metadata.val_acc, metadata.epoch, self.save_top_k
            );
            return Ok(None);
        }

        let stem = Self::stem(metadata.epoch, metadata.val_acc);
        let weights = self.weights_path(&stem);
        model
            .clone()
            .save_file(weights.clone(), &CompactRecorder::new())
            .map_err(|e| Error::Checkpoint(format!("failed to save {}: {e}", weights.display())))?;
        metadata.save(&self.metadata_path(&stem))?;
        info!("Checkpoint saved to {}", weights.display());

        self.saved.retain(|s| s.stem != stem);
        let position = self
            .saved
            .iter()
            .position(|s| metadata.val_acc > s.val_acc)
            .unwrap_or(self.saved.len());
        self.saved.insert(
            position,
            SavedCheckpoint {
                stem,
                epoch: metadata.epoch,
                val_acc: metadata.val_acc,
            },
        );

        while self.saved.len() > self.save_top_k {
            if let Some(evicted) = self.saved.pop() {
                self.remove_files(&evicted.stem)?;
            }
        }
        Ok(Some(weights))
    }

    fn remove_files(&self, stem: &str) -> Result<()> {
        for path in [self.weights_path(stem), self.metadata_path(stem)] {
            if path.exists() {
                fs::remove_file(&path)?;
            }
        }
        debug!("Removed checkpoint {stem}");
        Ok(())
    }
}

/// Loads weights written by [`CheckpointManager::save`] into `model`.
///
/// `weights` is the `.mpk` path; the metadata is read from the `.json` file
/// next to it.
pub fn load_checkpoint<B: Backend, M: Module<B>>(
    model: M,
    weights: &Path,
    device: &B::Device,
) -> Result<(M, CheckpointMetadata)> {
    if weights.extension().and_then(|e| e.to_str()) != Some(WEIGHTS_EXT) {
        return Err(Error::Checkpoint(format!(
            "expected a .{WEIGHTS_EXT} weights file, got {}",
            weights.display()
        )));
    }
    let metadata = CheckpointMetadata::load(&weights.with_extension(METADATA_EXT))?;
    let model = model
        .load_file(weights.to_path_buf(), &CompactRecorder::new(), device)
        .map_err(|e| Error::Checkpoint(format!("failed to load {}: {e}", weights.display())))?;
    info!(
        "Resumed from {} (epoch {}, val_acc {:.4})",
        weights.display(),
        metadata.epoch,
        metadata.val_acc
    );
    Ok((model, metadata))
}
