//! Batch iteration over a [`CifarDataset`].
//!
//! Samples are transformed on a rayon pool of `num_workers` threads while a
//! producer thread keeps up to `prefetch_batches` finished batches queued for
//! the training loop. Each epoch iteration reads the dataset's pipeline once,
//! when it starts, and uses that snapshot for every batch of the epoch.

use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use critical_core::{Error, Result};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use rayon::ThreadPool;
use tracing::debug;

use crate::dataset::{CifarDataset, CifarItem};
use crate::pipeline::TransformPipeline;

/// Batch loader settings.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub batch_size: usize,
    /// Visit samples in a fresh random order every epoch.
    pub shuffle: bool,
    /// Transform worker threads; 0 transforms on the consuming thread.
    pub num_workers: usize,
    pub prefetch_batches: usize,
    pub seed: u64,
}

impl LoaderConfig {
    pub fn new(batch_size: usize, shuffle: bool, num_workers: usize, seed: u64) -> Self {
        Self {
            batch_size,
            shuffle,
            num_workers,
            prefetch_batches: 2,
            seed,
        }
    }
}

pub struct BatchLoader {
    dataset: Arc<CifarDataset>,
    config: LoaderConfig,
    pool: Option<Arc<ThreadPool>>,
}

impl BatchLoader {
    pub fn new(dataset: Arc<CifarDataset>, config: LoaderConfig) -> Result<Self> {
        if config.batch_size == 0 {
            return Err(Error::Config("batch_size must be greater than 0".into()));
        }
        let pool = if config.num_workers > 0 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(config.num_workers)
                .thread_name(|i| format!("loader-{i}"))
                .build()
                .map_err(|e| Error::Dataset(format!("failed to start loader workers: {e}")))?;
            Some(Arc::new(pool))
        } else {
            None
        };
        Ok(Self {
            dataset,
            config,
            pool,
        })
    }

    pub fn dataset(&self) -> &Arc<CifarDataset> {
        &self.dataset
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Number of samples per epoch.
    pub fn len(&self) -> usize {
        self.dataset.images().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Batches per epoch; the last one may be partial.
    pub fn num_batches(&self) -> usize {
        self.len().div_ceil(self.config.batch_size)
    }

    /// Iterates over one epoch's batches.
    pub fn epoch(&self, epoch: usize) -> Result<EpochBatches> {
        let pipeline = self.dataset.pipeline().snapshot();
        let batches = batch_indices(self.len(), &self.config, epoch);
        let job = EpochJob {
            dataset: Arc::clone(&self.dataset),
            pipeline,
            seed: self.config.seed,
            epoch,
        };
        debug!(
            "Epoch {epoch}: {} batches with pipeline {}",
            batches.len(),
            job.pipeline
        );

        let Some(pool) = &self.pool else {
            return Ok(EpochBatches {
                inner: Inner::Inline {
                    job,
                    batches: batches.into_iter(),
                },
            });
        };

        let pool = Arc::clone(pool);
        let (tx, rx) = mpsc::sync_channel(self.config.prefetch_batches.max(1));
        let handle = thread::Builder::new()
            .name(format!("prefetch-epoch-{epoch}"))
            .spawn(move || {
                for indices in batches {
                    let batch = pool.install(|| {
                        indices
                            .par_iter()
                            .map(|&index| job.load(index))
                            .collect::<Result<Vec<_>>>()
                    });
                    let failed = batch.is_err();
                    if tx.send(batch).is_err() || failed {
                        break;
                    }
                }
            })?;

        Ok(EpochBatches {
            inner: Inner::Prefetch {
                rx: Some(rx),
                handle: Some(handle),
            },
        })
    }
}

/// Sample indices of each batch of `epoch`, in visiting order.
fn batch_indices(len: usize, config: &LoaderConfig, epoch: usize) -> Vec<Vec<usize>> {
    let mut order: Vec<usize> = (0..len).collect();
    if config.shuffle {
        let mut rng = ChaCha8Rng::seed_from_u64(mix(config.seed, epoch as u64, u64::MAX));
        order.shuffle(&mut rng);
    }
    order
        .chunks(config.batch_size)
        .map(|chunk| chunk.to_vec())
        .collect()
}

fn mix(seed: u64, epoch: u64, index: u64) -> u64 {
    seed ^ epoch.wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ index.wrapping_mul(0xC2B2_AE3D_27D4_EB4F)
}

/// Everything a worker needs to produce samples for one epoch.
struct EpochJob {
    dataset: Arc<CifarDataset>,
    pipeline: Arc<TransformPipeline>,
    seed: u64,
    epoch: usize,
}

impl EpochJob {
    fn load(&self, index: usize) -> Result<CifarItem> {
        let mut rng = ChaCha8Rng::seed_from_u64(mix(self.seed, self.epoch as u64, index as u64));
        self.dataset.transform_with(index, &self.pipeline, &mut rng)
    }
}

enum Inner {
    Inline {
        job: EpochJob,
        batches: std::vec::IntoIter<Vec<usize>>,
    },
    Prefetch {
        rx: Option<Receiver<Result<Vec<CifarItem>>>>,
        handle: Option<JoinHandle<()>>,
    },
}

/// The batches of a single epoch. Dropping it early stops the producer.
pub struct EpochBatches {
    inner: Inner,
}

#[cfg(test)]
impl EpochBatches {
    /// The pipeline this epoch's samples go through, when loading inline.
    fn inline_job(&self) -> Option<&EpochJob> {
        match &self.inner {
            Inner::Inline { job, .. } => Some(job),
            Inner::Prefetch { .. } => None,
        }
    }
}

impl Iterator for EpochBatches {
    type Item = Result<Vec<CifarItem>>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.inner {
            Inner::Inline { job, batches } => {
                let indices = batches.next()?;
                Some(indices.iter().map(|&index| job.load(index)).collect())
            }
            Inner::Prefetch { rx, .. } => rx.as_ref()?.recv().ok(),
        }
    }
}

impl Drop for EpochBatches {
    fn drop(&mut self) {
        if let Inner::Prefetch { rx, handle } = &mut self.inner {
            // Disconnect first so a producer blocked on a full channel wakes up.
            drop(rx.take());
            if let Some(handle) = handle.take() {
                if handle.join().is_err() {
                    tracing::error!("prefetch thread panicked");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cifar10::LabeledImage;
    use crate::pipeline::{eval_pipeline, train_pipeline};
    use crate::transform::TransformKind;
    use image::{Rgb, RgbImage};

    fn dataset(n: usize) -> Arc<CifarDataset> {
        let images = (0..n)
            .map(|i| LabeledImage {
                image: RgbImage::from_pixel(32, 32, Rgb([i as u8 * 20, 0, 0])),
                label: i % 10,
            })
            .collect();
        Arc::new(CifarDataset::new(images, eval_pipeline()))
    }

    fn labels(loader: &BatchLoader, epoch: usize) -> Vec<Vec<usize>> {
        loader
            .epoch(epoch)
            .unwrap()
            .map(|batch| batch.unwrap().iter().map(|item| item.label).collect())
            .collect()
    }

    #[test]
    fn test_fixed_order_with_partial_last_batch() {
        for workers in [0, 2] {
            let loader =
                BatchLoader::new(dataset(5), LoaderConfig::new(2, false, workers, 0)).unwrap();
            assert_eq!(loader.num_batches(), 3);
            assert_eq!(labels(&loader, 0), vec![vec![0, 1], vec![2, 3], vec![4]]);
        }
    }

    #[test]
    fn test_shuffle_is_a_permutation_and_varies_by_epoch() {
        let loader = BatchLoader::new(dataset(10), LoaderConfig::new(3, true, 2, 7)).unwrap();
        let first: Vec<usize> = labels(&loader, 0).concat();
        let second: Vec<usize> = labels(&loader, 1).concat();

        let mut sorted = first.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..10).collect::<Vec<_>>());
        assert_ne!(first, second);
        assert_eq!(first, labels(&loader, 0).concat());
    }

    #[test]
    fn test_workers_do_not_change_results() {
        let data = dataset(6);
        data.pipeline().replace(train_pipeline());
        let inline = BatchLoader::new(Arc::clone(&data), LoaderConfig::new(4, true, 0, 3)).unwrap();
        let pooled = BatchLoader::new(data, LoaderConfig::new(4, true, 3, 3)).unwrap();

        let images = |loader: &BatchLoader| -> Vec<Vec<f32>> {
            loader
                .epoch(2)
                .unwrap()
                .flat_map(|batch| batch.unwrap())
                .map(|item| item.image)
                .collect()
        };
        assert_eq!(images(&inline), images(&pooled));
    }

    #[test]
    fn test_epoch_keeps_pipeline_snapshot() {
        let data = dataset(4);
        data.pipeline().replace(train_pipeline());
        let loader =
            BatchLoader::new(Arc::clone(&data), LoaderConfig::new(2, false, 0, 0)).unwrap();

        let batches = loader.epoch(0).unwrap();
        data.pipeline()
            .replace(train_pipeline().without(TransformKind::BlurResample));
        let job = batches.inline_job().unwrap();
        assert!(job.pipeline.contains(TransformKind::BlurResample));

        let next = loader.epoch(1).unwrap();
        assert!(!next.inline_job().unwrap().pipeline.contains(TransformKind::BlurResample));
    }

    #[test]
    fn test_early_drop_stops_producer() {
        let loader = BatchLoader::new(dataset(10), LoaderConfig::new(1, false, 2, 0)).unwrap();
        let mut batches = loader.epoch(0).unwrap();
        assert!(batches.next().is_some());
        drop(batches);
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        assert!(BatchLoader::new(dataset(1), LoaderConfig::new(0, false, 0, 0)).is_err());
    }
}
