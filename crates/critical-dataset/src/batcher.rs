//! Stacks transformed items into burn tensors.

use std::marker::PhantomData;

use burn::data::dataloader::batcher::Batcher;
use burn::prelude::*;

use crate::cifar10::{IMAGE_SIZE, NUM_CHANNELS};
use crate::dataset::CifarItem;

/// A batch of images `[N, 3, 32, 32]` and their labels `[N]`.
#[derive(Clone, Debug)]
pub struct CifarBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
}

impl<B: Backend> CifarBatch<B> {
    pub fn len(&self) -> usize {
        self.targets.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Items arrive already normalized by the dataset pipeline, so batching is a
/// pure reshape.
#[derive(Clone, Debug, Default)]
pub struct CifarBatcher<B: Backend> {
    _backend: PhantomData<B>,
}

impl<B: Backend> CifarBatcher<B> {
    pub fn new() -> Self {
        Self {
            _backend: PhantomData,
        }
    }
}

impl<B: Backend> Batcher<B, CifarItem, CifarBatch<B>> for CifarBatcher<B> {
    fn batch(&self, items: Vec<CifarItem>, device: &B::Device) -> CifarBatch<B> {
        let batch_size = items.len();
        let side = IMAGE_SIZE as usize;

        let targets_data: Vec<i64> = items.iter().map(|item| item.label as i64).collect();
        let images_data: Vec<f32> = items.into_iter().flat_map(|item| item.image).collect();

        let images = Tensor::<B, 4>::from_floats(
            TensorData::new(images_data, [batch_size, NUM_CHANNELS, side, side]),
            device,
        );
        let targets =
            Tensor::<B, 1, Int>::from_data(TensorData::new(targets_data, [batch_size]), device);

        CifarBatch { images, targets }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_batch_shapes() {
        let device = Default::default();
        let items = (0..3)
            .map(|i| CifarItem {
                image: vec![i as f32; 3 * 32 * 32],
                label: i,
            })
            .collect();

        let batch: CifarBatch<TestBackend> = CifarBatcher::new().batch(items, &device);
        assert_eq!(batch.images.dims(), [3, 3, 32, 32]);
        assert_eq!(batch.len(), 3);

        let targets = batch.targets.into_data().to_vec::<i64>().unwrap();
        assert_eq!(targets, vec![0, 1, 2]);
    }
}
