//! Dataset statistics computation.

use crate::cifar10::{LabeledImage, NUM_CLASSES};

/// Summary of a labeled image collection.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetStatistics {
    pub num_samples: usize,
    pub class_counts: [usize; NUM_CLASSES],
    /// Per-channel mean of pixel values scaled to [0, 1].
    pub channel_mean: [f64; 3],
    /// Per-channel population standard deviation, same scale.
    pub channel_std: [f64; 3],
}

impl DatasetStatistics {
    pub fn compute(images: &[LabeledImage]) -> Self {
        let mut class_counts = [0usize; NUM_CLASSES];
        let mut sum = [0f64; 3];
        let mut sum_sq = [0f64; 3];
        let mut pixels = 0usize;

        for sample in images {
            if let Some(count) = class_counts.get_mut(sample.label) {
                *count += 1;
            }
            for pixel in sample.image.pixels() {
                for c in 0..3 {
                    let v = pixel[c] as f64 / 255.0;
                    sum[c] += v;
                    sum_sq[c] += v * v;
                }
            }
            pixels += (sample.image.width() * sample.image.height()) as usize;
        }

        let mut channel_mean = [0f64; 3];
        let mut channel_std = [0f64; 3];
        if pixels > 0 {
            let n = pixels as f64;
            for c in 0..3 {
                channel_mean[c] = sum[c] / n;
                channel_std[c] = (sum_sq[c] / n - channel_mean[c].powi(2)).max(0.0).sqrt();
            }
        }

        Self {
            num_samples: images.len(),
            class_counts,
            channel_mean,
            channel_std,
        }
    }

    /// Whether every class has the same number of samples.
    pub fn is_class_balanced(&self) -> bool {
        self.class_counts.windows(2).all(|w| w[0] == w[1])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn test_channel_stats() {
        let images = vec![
            LabeledImage {
                image: RgbImage::from_pixel(2, 2, Rgb([0, 255, 51])),
                label: 0,
            },
            LabeledImage {
                image: RgbImage::from_pixel(2, 2, Rgb([255, 255, 51])),
                label: 1,
            },
        ];
        let stats = DatasetStatistics::compute(&images);

        assert_eq!(stats.num_samples, 2);
        assert_eq!(stats.class_counts[0], 1);
        assert_eq!(stats.class_counts[1], 1);
        assert!(!stats.is_class_balanced());
        assert!((stats.channel_mean[0] - 0.5).abs() < 1e-9);
        assert!((stats.channel_std[0] - 0.5).abs() < 1e-9);
        assert!((stats.channel_mean[1] - 1.0).abs() < 1e-9);
        assert!(stats.channel_std[1].abs() < 1e-6);
        assert!((stats.channel_mean[2] - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_empty() {
        let stats = DatasetStatistics::compute(&[]);
        assert_eq!(stats.num_samples, 0);
        assert_eq!(stats.channel_mean, [0.0; 3]);
        assert!(stats.is_class_balanced());
    }
}
