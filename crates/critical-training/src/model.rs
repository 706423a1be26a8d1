//! ResNet-18 for CIFAR-sized inputs.
//!
//! The standard network downsamples its input by 4 before the first residual
//! stage (a 7×7 stride-2 stem plus a stride-2 max-pool). On 32×32 images that
//! leaves 8×8 feature maps, so [`small_image_resnet18`] swaps the stem for a
//! 3×3 stride-1 convolution and drops the max-pool.

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, Linear, LinearConfig, PaddingConfig2d, Relu,
    },
    tensor::{backend::Backend, Tensor},
};
use critical_core::Error;

/// Residual network hyperparameters.
#[derive(Config, Debug)]
pub struct ResNetConfig {
    /// Number of output logits
    #[config(default = "10")]
    pub num_classes: usize,
    /// Channels of the first stage; later stages double it
    #[config(default = "64")]
    pub base_width: usize,
    /// Basic blocks in each of the four stages
    #[config(default = "[2, 2, 2, 2]")]
    pub blocks_per_stage: [usize; 4],
    /// 3×3 stride-1 stem without max-pool instead of the 7×7 stride-2 stem
    #[config(default = "true")]
    pub small_input: bool,
}

impl ResNetConfig {
    pub fn validate(&self) -> critical_core::Result<()> {
        if self.num_classes == 0 || self.base_width == 0 {
            return Err(Error::Model(
                "num_classes and base_width must be non-zero".into(),
            ));
        }
        if self.blocks_per_stage.contains(&0) {
            return Err(Error::Model("every stage needs at least one block".into()));
        }
        Ok(())
    }

    /// Width of the pooled feature vector fed to the classifier.
    pub fn feature_width(&self) -> usize {
        self.base_width * 8
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> critical_core::Result<ResNet<B>> {
        self.validate()?;

        let width = self.base_width;
        let (stem, maxpool) = if self.small_input {
            let conv = Conv2dConfig::new([3, width], [3, 3])
                .with_stride([1, 1])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .with_bias(false)
                .init(device);
            (conv, None)
        } else {
            let conv = Conv2dConfig::new([3, width], [7, 7])
                .with_stride([2, 2])
                .with_padding(PaddingConfig2d::Explicit(3, 3))
                .with_bias(false)
                .init(device);
            let pool = MaxPool2dConfig::new([3, 3])
                .with_strides([2, 2])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init();
            (conv, Some(pool))
        };

        let mut blocks = Vec::new();
        let mut in_channels = width;
        for (stage, &count) in self.blocks_per_stage.iter().enumerate() {
            let out_channels = width << stage;
            for i in 0..count {
                let stride = if stage > 0 && i == 0 { 2 } else { 1 };
                blocks.push(BasicBlock::new(in_channels, out_channels, stride, device));
                in_channels = out_channels;
            }
        }

        Ok(ResNet {
            stem,
            stem_bn: BatchNormConfig::new(width).init(device),
            maxpool,
            blocks,
            avgpool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            fc: LinearConfig::new(in_channels, self.num_classes).init(device),
            activation: Relu::new(),
        })
    }
}

/// ResNet-18 as used for CIFAR-10: 10 classes, 3×3 stem, no max-pool, no
/// pretrained weights.
pub fn small_image_resnet18<B: Backend>(device: &B::Device) -> critical_core::Result<ResNet<B>> {
    ResNetConfig::new().init(device)
}

/// Two 3×3 convolutions with an identity (or 1×1 projection) shortcut.
#[derive(Module, Debug)]
pub struct BasicBlock<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B, 2>,
    conv2: Conv2d<B>,
    bn2: BatchNorm<B, 2>,
    downsample: Option<Downsample<B>>,
    activation: Relu,
}

/// Projection shortcut for blocks that change resolution or width.
#[derive(Module, Debug)]
pub struct Downsample<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B, 2>,
}

impl<B: Backend> BasicBlock<B> {
    fn new(in_channels: usize, out_channels: usize, stride: usize, device: &B::Device) -> Self {
        let conv1 = Conv2dConfig::new([in_channels, out_channels], [3, 3])
            .with_stride([stride, stride])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .with_bias(false)
            .init(device);
        let conv2 = Conv2dConfig::new([out_channels, out_channels], [3, 3])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .with_bias(false)
            .init(device);

        let downsample = (stride != 1 || in_channels != out_channels).then(|| Downsample {
            conv: Conv2dConfig::new([in_channels, out_channels], [1, 1])
                .with_stride([stride, stride])
                .with_bias(false)
                .init(device),
            bn: BatchNormConfig::new(out_channels).init(device),
        });

        Self {
            conv1,
            bn1: BatchNormConfig::new(out_channels).init(device),
            conv2,
            bn2: BatchNormConfig::new(out_channels).init(device),
            downsample,
            activation: Relu::new(),
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = match &self.downsample {
            Some(ds) => ds.bn.forward(ds.conv.forward(input.clone())),
            None => input.clone(),
        };

        let x = self.conv1.forward(input);
        let x = self.bn1.forward(x);
        let x = self.activation.forward(x);
        let x = self.conv2.forward(x);
        let x = self.bn2.forward(x);

        self.activation.forward(x + identity)
    }
}

/// Residual convolutional classifier.
#[derive(Module, Debug)]
pub struct ResNet<B: Backend> {
    stem: Conv2d<B>,
    stem_bn: BatchNorm<B, 2>,
    maxpool: Option<MaxPool2d>,
    blocks: Vec<BasicBlock<B>>,
    avgpool: AdaptiveAvgPool2d,
    pub fc: Linear<B>,
    activation: Relu,
}

impl<B: Backend> ResNet<B> {
    /// `[N, 3, H, W]` images to `[N, num_classes]` logits.
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.stem.forward(input);
        let x = self.stem_bn.forward(x);
        let mut x = self.activation.forward(x);
        if let Some(pool) = &self.maxpool {
            x = pool.forward(x);
        }

        for block in &self.blocks {
            x = block.forward(x);
        }

        let x = self.avgpool.forward(x);
        let [batch, channels, _, _] = x.dims();
        self.fc.forward(x.reshape([batch, channels]))
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn has_maxpool(&self) -> bool {
        self.maxpool.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_small_image_resnet18_output_shape() {
        let device = Default::default();
        let model = small_image_resnet18::<TestBackend>(&device).unwrap();
        assert_eq!(model.num_blocks(), 8);
        assert!(!model.has_maxpool());

        let input = Tensor::<TestBackend, 4>::zeros([1, 3, 32, 32], &device);
        assert_eq!(model.forward(input).dims(), [1, 10]);
    }

    #[test]
    fn test_head_maps_512_features_to_10_logits() {
        let config = ResNetConfig::new();
        assert_eq!(config.feature_width(), 512);

        let device = Default::default();
        let model = config.init::<TestBackend>(&device).unwrap();
        assert_eq!(model.fc.weight.dims(), [512, 10]);
    }

    #[test]
    fn test_imagenet_stem_downsamples() {
        let device = Default::default();
        let model = ResNetConfig::new()
            .with_base_width(4)
            .with_small_input(false)
            .init::<TestBackend>(&device)
            .unwrap();
        assert!(model.has_maxpool());

        let input = Tensor::<TestBackend, 4>::zeros([2, 3, 64, 64], &device);
        assert_eq!(model.forward(input).dims(), [2, 10]);
    }

    #[test]
    fn test_narrow_model_batch() {
        let device = Default::default();
        let model = ResNetConfig::new()
            .with_base_width(8)
            .init::<TestBackend>(&device)
            .unwrap();
        let input = Tensor::<TestBackend, 4>::ones([3, 3, 32, 32], &device);
        assert_eq!(model.forward(input).dims(), [3, 10]);
    }

    #[test]
    fn test_invalid_config() {
        let device = Default::default();
        let config = ResNetConfig::new().with_blocks_per_stage([2, 0, 2, 2]);
        assert!(config.init::<TestBackend>(&device).is_err());
    }
}
