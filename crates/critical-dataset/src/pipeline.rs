//! Composed transform pipelines and the swappable handle datasets read them
//! through.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use critical_core::{Error, Result};
use image::RgbImage;
use rand::Rng;

use crate::cifar10::{IMAGE_SIZE, NUM_CHANNELS};
use crate::transform::{ImageTensor, Sample, Transform, TransformKind};

/// Per-channel CIFAR-10 mean used for normalization.
pub const CIFAR10_MEAN: [f32; 3] = [0.4914, 0.4822, 0.4465];
/// Per-channel CIFAR-10 standard deviation used for normalization.
pub const CIFAR10_STD: [f32; 3] = [0.247, 0.243, 0.261];

/// Resolution the blur step downsamples to.
pub const BLUR_RESOLUTION: usize = 8;
/// Largest translation, in pixels, along either axis.
pub const MAX_TRANSLATE: u32 = 4;

/// An ordered, immutable sequence of transforms.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformPipeline {
    steps: Vec<Transform>,
}

impl TransformPipeline {
    pub fn new(steps: Vec<Transform>) -> Self {
        Self { steps }
    }

    pub fn steps(&self) -> &[Transform] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn contains(&self, kind: TransformKind) -> bool {
        self.steps.iter().any(|t| t.kind() == kind)
    }

    /// A new pipeline with every step of `kind` dropped and the remaining
    /// steps in their original order.
    pub fn without(&self, kind: TransformKind) -> Self {
        Self {
            steps: self
                .steps
                .iter()
                .filter(|t| t.kind() != kind)
                .cloned()
                .collect(),
        }
    }

    /// Runs every step on a copy of `image` and checks the result is a
    /// 3×32×32 tensor.
    pub fn apply<R: Rng + ?Sized>(&self, image: &RgbImage, rng: &mut R) -> Result<ImageTensor> {
        let mut sample = Sample::Image(image.clone());
        for step in &self.steps {
            sample = step.apply(sample, rng)?;
        }

        let expected = [NUM_CHANNELS, IMAGE_SIZE as usize, IMAGE_SIZE as usize];
        match sample {
            Sample::Tensor(t) if t.shape() == expected => Ok(t),
            Sample::Tensor(t) => Err(Error::Transform(format!(
                "pipeline produced shape {:?}, expected {expected:?}",
                t.shape()
            ))),
            Sample::Image(_) => Err(Error::Transform(
                "pipeline has no ToTensor step".to_string(),
            )),
        }
    }
}

impl fmt::Display for TransformPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, step) in self.steps.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{step}")?;
        }
        write!(f, "]")
    }
}

fn normalize() -> Transform {
    Transform::Normalize {
        mean: CIFAR10_MEAN,
        std: CIFAR10_STD,
    }
}

/// Flip, translate, to-tensor, 8×8 blur, normalize.
pub fn train_pipeline() -> TransformPipeline {
    TransformPipeline::new(vec![
        Transform::HorizontalFlip { p: 0.5 },
        Transform::RandomTranslate {
            max_dx: MAX_TRANSLATE,
            max_dy: MAX_TRANSLATE,
        },
        Transform::ToTensor,
        Transform::BlurResample {
            low_height: BLUR_RESOLUTION,
            low_width: BLUR_RESOLUTION,
        },
        normalize(),
    ])
}

/// To-tensor and normalize only.
pub fn eval_pipeline() -> TransformPipeline {
    TransformPipeline::new(vec![Transform::ToTensor, normalize()])
}

/// Shared reference to the pipeline a dataset currently applies.
///
/// Readers take an `Arc` snapshot and keep using it even if the handle is
/// swapped afterwards; a swap installs a whole new pipeline and never edits
/// one in place. Clones share the same slot.
#[derive(Debug, Clone)]
pub struct PipelineHandle {
    slot: Arc<RwLock<Arc<TransformPipeline>>>,
    generation: Arc<AtomicU64>,
}

impl PipelineHandle {
    pub fn new(pipeline: TransformPipeline) -> Self {
        Self {
            slot: Arc::new(RwLock::new(Arc::new(pipeline))),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn snapshot(&self) -> Arc<TransformPipeline> {
        Arc::clone(&self.slot.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Installs `pipeline` and returns the one it replaced.
    pub fn replace(&self, pipeline: TransformPipeline) -> Arc<TransformPipeline> {
        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        let previous = std::mem::replace(&mut *slot, Arc::new(pipeline));
        self.generation.fetch_add(1, Ordering::AcqRel);
        previous
    }

    /// Number of times the pipeline has been replaced.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn checkerboard() -> RgbImage {
        RgbImage::from_fn(32, 32, |x, y| {
            if (x + y) % 2 == 0 {
                Rgb([250, 240, 230])
            } else {
                Rgb([10, 20, 30])
            }
        })
    }

    #[test]
    fn test_train_pipeline_order() {
        let kinds: Vec<_> = train_pipeline().steps().iter().map(|t| t.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                TransformKind::HorizontalFlip,
                TransformKind::RandomTranslate,
                TransformKind::ToTensor,
                TransformKind::BlurResample,
                TransformKind::Normalize,
            ]
        );
    }

    #[test]
    fn test_without_blur_preserves_order() {
        let train = train_pipeline();
        let clear = train.without(TransformKind::BlurResample);
        assert!(train.contains(TransformKind::BlurResample));
        assert!(!clear.contains(TransformKind::BlurResample));
        assert_eq!(clear.len(), 4);

        let expected: Vec<_> = train
            .steps()
            .iter()
            .filter(|t| t.kind() != TransformKind::BlurResample)
            .cloned()
            .collect();
        assert_eq!(clear.steps(), expected.as_slice());
    }

    #[test]
    fn test_pipelines_produce_cifar_shape() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let image = checkerboard();
        for pipeline in [
            train_pipeline(),
            eval_pipeline(),
            train_pipeline().without(TransformKind::BlurResample),
        ] {
            for _ in 0..4 {
                let out = pipeline.apply(&image, &mut rng).unwrap();
                assert_eq!(out.shape(), [3, 32, 32]);
            }
        }
    }

    #[test]
    fn test_train_output_differs_from_eval() {
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let image = checkerboard();
        let train = train_pipeline().apply(&image, &mut rng).unwrap();
        let eval = eval_pipeline().apply(&image, &mut rng).unwrap();
        let max_diff = train
            .data()
            .iter()
            .zip(eval.data())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0f32, f32::max);
        assert!(max_diff > 1.0, "blurred output too close to eval output");
    }

    #[test]
    fn test_pipeline_without_to_tensor_fails() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let pipeline = TransformPipeline::new(vec![Transform::HorizontalFlip { p: 0.5 }]);
        assert!(pipeline.apply(&checkerboard(), &mut rng).is_err());
    }

    #[test]
    fn test_handle_swap_keeps_snapshots() {
        let handle = PipelineHandle::new(train_pipeline());
        let before = handle.snapshot();
        let reader = handle.clone();

        let old = handle.replace(before.without(TransformKind::BlurResample));
        assert_eq!(*old, *before);
        assert_eq!(handle.generation(), 1);
        assert!(before.contains(TransformKind::BlurResample));
        assert!(!reader.snapshot().contains(TransformKind::BlurResample));
        assert_eq!(reader.generation(), 1);
    }

    #[test]
    fn test_display() {
        assert!(eval_pipeline().to_string().starts_with("[ToTensor, Normalize("));
        assert!(train_pipeline().to_string().contains("BlurResample(8x8)"));
    }
}
