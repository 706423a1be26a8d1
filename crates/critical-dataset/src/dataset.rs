//! CIFAR-10 dataset adapter with a swappable transform pipeline.

use std::sync::Arc;

use burn::data::dataset::Dataset;
use critical_core::{Error, Result};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cifar10::LabeledImage;
use crate::pipeline::{PipelineHandle, TransformPipeline};

/// A transformed sample ready for batching.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CifarItem {
    /// Image data as flattened CHW float array [3 * 32 * 32]
    pub image: Vec<f32>,
    pub label: usize,
}

/// Raw labeled images plus the pipeline applied on every access.
#[derive(Clone)]
pub struct CifarDataset {
    images: Arc<Vec<LabeledImage>>,
    pipeline: PipelineHandle,
}

impl std::fmt::Debug for CifarDataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CifarDataset")
            .field("len", &self.images.len())
            .field("pipeline", &self.pipeline.snapshot().to_string())
            .finish()
    }
}

impl CifarDataset {
    pub fn new(images: Vec<LabeledImage>, pipeline: TransformPipeline) -> Self {
        Self {
            images: Arc::new(images),
            pipeline: PipelineHandle::new(pipeline),
        }
    }

    /// Handle to the live pipeline; clones of it can swap the pipeline.
    pub fn pipeline(&self) -> &PipelineHandle {
        &self.pipeline
    }

    pub fn raw(&self, index: usize) -> Option<&LabeledImage> {
        self.images.get(index)
    }

    pub fn images(&self) -> &[LabeledImage] {
        &self.images
    }

    /// Runs `pipeline` on the raw image at `index`.
    pub fn transform_with<R: Rng + ?Sized>(
        &self,
        index: usize,
        pipeline: &TransformPipeline,
        rng: &mut R,
    ) -> Result<CifarItem> {
        let raw = self.images.get(index).ok_or_else(|| {
            Error::Dataset(format!(
                "index {index} out of bounds for dataset of {}",
                self.images.len()
            ))
        })?;
        let tensor = pipeline.apply(&raw.image, rng)?;
        Ok(CifarItem {
            image: tensor.into_data(),
            label: raw.label,
        })
    }
}

impl Dataset<CifarItem> for CifarDataset {
    /// Applies the current pipeline with fresh randomness. The batch loader
    /// goes through [`CifarDataset::transform_with`] instead, to pin one
    /// pipeline per epoch and seed each sample.
    fn get(&self, index: usize) -> Option<CifarItem> {
        let pipeline = self.pipeline.snapshot();
        let mut rng = ChaCha8Rng::seed_from_u64(rand::random());
        match self.transform_with(index, &pipeline, &mut rng) {
            Ok(item) => Some(item),
            Err(e) => {
                if index < self.images.len() {
                    warn!("Failed to transform sample {index}: {e}");
                }
                None
            }
        }
    }

    fn len(&self) -> usize {
        self.images.len()
    }
}
