//! Per-sample image transforms.
//!
//! A sample starts as a raw [`RgbImage`] and becomes a CHW float
//! [`ImageTensor`] at the [`Transform::ToTensor`] step. Geometric
//! augmentations work on either form; the blur and normalization steps need
//! the tensor form.

use std::fmt;

use critical_core::{Error, Result};
use image::{imageops, Rgb, RgbImage};
use rand::Rng;

/// A float image in channel-major (CHW) layout.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor {
    channels: usize,
    height: usize,
    width: usize,
    data: Vec<f32>,
}

impl ImageTensor {
    pub fn new(channels: usize, height: usize, width: usize, data: Vec<f32>) -> Result<Self> {
        if channels * height * width != data.len() {
            return Err(Error::Transform(format!(
                "{} values do not fill a {channels}x{height}x{width} tensor",
                data.len()
            )));
        }
        Ok(Self {
            channels,
            height,
            width,
            data,
        })
    }

    /// Converts u8 pixels to floats in [0, 1].
    pub fn from_rgb(image: &RgbImage) -> Self {
        let (width, height) = (image.width() as usize, image.height() as usize);
        let mut data = vec![0.0f32; 3 * height * width];
        for (x, y, pixel) in image.enumerate_pixels() {
            let offset = y as usize * width + x as usize;
            for c in 0..3 {
                data[c * height * width + offset] = pixel[c] as f32 / 255.0;
            }
        }
        Self {
            channels: 3,
            height,
            width,
            data,
        }
    }

    /// `[channels, height, width]`
    pub fn shape(&self) -> [usize; 3] {
        [self.channels, self.height, self.width]
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    pub fn get(&self, c: usize, y: usize, x: usize) -> f32 {
        self.data[(c * self.height + y) * self.width + x]
    }

    /// Smallest and largest value, ignoring NaNs.
    pub fn min_max(&self) -> (f32, f32) {
        self.data
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            })
    }
}

/// Interpolates between `a` and `b`, never leaving the interval they span.
fn lerp(a: f32, b: f32, t: f32) -> f32 {
    let v = a + (b - a) * t;
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    if v < lo {
        lo
    } else if v > hi {
        hi
    } else {
        v
    }
}

/// Source taps for output index `dst` when resizing `in_len` to `out_len`
/// with half-pixel centers (`align_corners = false`).
fn source_taps(dst: usize, in_len: usize, out_len: usize) -> (usize, usize, f32) {
    let scale = in_len as f32 / out_len as f32;
    let src = ((dst as f32 + 0.5) * scale - 0.5).max(0.0);
    let i0 = (src.floor() as usize).min(in_len - 1);
    let i1 = (i0 + 1).min(in_len - 1);
    (i0, i1, src - i0 as f32)
}

/// Bilinear resize of every channel to `out_h × out_w`.
///
/// Sample positions follow the half-pixel convention, so resizing to the same
/// size is the identity and every output value lies between the input's
/// minimum and maximum.
pub fn resize_bilinear(input: &ImageTensor, out_h: usize, out_w: usize) -> ImageTensor {
    let [channels, in_h, in_w] = input.shape();
    let rows: Vec<_> = (0..out_h).map(|y| source_taps(y, in_h, out_h)).collect();
    let cols: Vec<_> = (0..out_w).map(|x| source_taps(x, in_w, out_w)).collect();

    let mut data = Vec::with_capacity(channels * out_h * out_w);
    for c in 0..channels {
        for &(y0, y1, ty) in &rows {
            for &(x0, x1, tx) in &cols {
                let top = lerp(input.get(c, y0, x0), input.get(c, y0, x1), tx);
                let bottom = lerp(input.get(c, y1, x0), input.get(c, y1, x1), tx);
                data.push(lerp(top, bottom, ty));
            }
        }
    }

    ImageTensor {
        channels,
        height: out_h,
        width: out_w,
        data,
    }
}

/// A value flowing through a transform pipeline.
#[derive(Debug, Clone)]
pub enum Sample {
    Image(RgbImage),
    Tensor(ImageTensor),
}

impl Sample {
    fn form(&self) -> &'static str {
        match self {
            Sample::Image(_) => "image",
            Sample::Tensor(_) => "tensor",
        }
    }
}

/// Discriminant of a [`Transform`], used to filter pipelines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransformKind {
    HorizontalFlip,
    RandomTranslate,
    ToTensor,
    BlurResample,
    Normalize,
}

/// One step of a transform pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum Transform {
    /// Mirror left-right with probability `p`.
    HorizontalFlip { p: f64 },
    /// Shift by a whole number of pixels drawn from `[-max, max]` per axis,
    /// filling vacated pixels with zero.
    RandomTranslate { max_dx: u32, max_dy: u32 },
    /// u8 image to float tensor in [0, 1].
    ToTensor,
    /// Resize down to `low_height × low_width` and back to the input size.
    BlurResample { low_height: usize, low_width: usize },
    /// `(x - mean[c]) / std[c]`
    Normalize { mean: [f32; 3], std: [f32; 3] },
}

impl Transform {
    pub fn kind(&self) -> TransformKind {
        match self {
            Transform::HorizontalFlip { .. } => TransformKind::HorizontalFlip,
            Transform::RandomTranslate { .. } => TransformKind::RandomTranslate,
            Transform::ToTensor => TransformKind::ToTensor,
            Transform::BlurResample { .. } => TransformKind::BlurResample,
            Transform::Normalize { .. } => TransformKind::Normalize,
        }
    }

    pub fn apply<R: Rng + ?Sized>(&self, sample: Sample, rng: &mut R) -> Result<Sample> {
        match (self, sample) {
            (Transform::HorizontalFlip { p }, sample) => {
                if !rng.gen_bool(p.clamp(0.0, 1.0)) {
                    return Ok(sample);
                }
                Ok(match sample {
                    Sample::Image(img) => Sample::Image(imageops::flip_horizontal(&img)),
                    Sample::Tensor(t) => Sample::Tensor(flip_tensor(&t)),
                })
            }
            (Transform::RandomTranslate { max_dx, max_dy }, sample) => {
                let dx = random_shift(*max_dx, rng);
                let dy = random_shift(*max_dy, rng);
                if dx == 0 && dy == 0 {
                    return Ok(sample);
                }
                Ok(match sample {
                    Sample::Image(img) => Sample::Image(translate_image(&img, dx, dy)),
                    Sample::Tensor(t) => Sample::Tensor(translate_tensor(&t, dx, dy)),
                })
            }
            (Transform::ToTensor, Sample::Image(img)) => {
                Ok(Sample::Tensor(ImageTensor::from_rgb(&img)))
            }
            (
                Transform::BlurResample {
                    low_height,
                    low_width,
                },
                Sample::Tensor(t),
            ) => {
                if *low_height == 0 || *low_width == 0 {
                    return Err(Error::Transform("blur resolution must be non-zero".into()));
                }
                let [_, h, w] = t.shape();
                let low = resize_bilinear(&t, *low_height, *low_width);
                Ok(Sample::Tensor(resize_bilinear(&low, h, w)))
            }
            (Transform::Normalize { mean, std }, Sample::Tensor(mut t)) => {
                if t.channels != 3 {
                    return Err(Error::Transform(format!(
                        "normalize expects 3 channels, got {}",
                        t.channels
                    )));
                }
                let plane = t.height * t.width;
                for (c, chunk) in t.data.chunks_mut(plane).enumerate() {
                    for v in chunk {
                        *v = (*v - mean[c]) / std[c];
                    }
                }
                Ok(Sample::Tensor(t))
            }
            (transform, sample) => Err(Error::Transform(format!(
                "{transform} cannot be applied to a {} sample",
                sample.form()
            ))),
        }
    }
}

impl fmt::Display for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transform::HorizontalFlip { p } => write!(f, "HorizontalFlip(p={p})"),
            Transform::RandomTranslate { max_dx, max_dy } => {
                write!(f, "RandomTranslate(max_dx={max_dx}, max_dy={max_dy})")
            }
            Transform::ToTensor => write!(f, "ToTensor"),
            Transform::BlurResample {
                low_height,
                low_width,
            } => write!(f, "BlurResample({low_height}x{low_width})"),
            Transform::Normalize { mean, std } => {
                write!(f, "Normalize(mean={mean:?}, std={std:?})")
            }
        }
    }
}

/// Uniform in `[-max, max]`, rounded to the nearest pixel.
fn random_shift<R: Rng + ?Sized>(max: u32, rng: &mut R) -> i64 {
    if max == 0 {
        return 0;
    }
    let max = max as f64;
    rng.gen_range(-max..=max).round() as i64
}

fn flip_tensor(t: &ImageTensor) -> ImageTensor {
    let mut out = t.clone();
    for row in out.data.chunks_mut(t.width) {
        row.reverse();
    }
    out
}

fn translate_image(img: &RgbImage, dx: i64, dy: i64) -> RgbImage {
    let (w, h) = (img.width() as i64, img.height() as i64);
    RgbImage::from_fn(img.width(), img.height(), |x, y| {
        let (sx, sy) = (x as i64 - dx, y as i64 - dy);
        if (0..w).contains(&sx) && (0..h).contains(&sy) {
            *img.get_pixel(sx as u32, sy as u32)
        } else {
            Rgb([0, 0, 0])
        }
    })
}

fn translate_tensor(t: &ImageTensor, dx: i64, dy: i64) -> ImageTensor {
    let (w, h) = (t.width as i64, t.height as i64);
    let mut data = vec![0.0f32; t.data.len()];
    for c in 0..t.channels {
        for y in 0..h {
            let sy = y - dy;
            if !(0..h).contains(&sy) {
                continue;
            }
            for x in 0..w {
                let sx = x - dx;
                if (0..w).contains(&sx) {
                    data[(c * t.height + y as usize) * t.width + x as usize] =
                        t.get(c, sy as usize, sx as usize);
                }
            }
        }
    }
    ImageTensor { data, ..*t }
}
