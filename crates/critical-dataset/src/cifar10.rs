//! CIFAR-10 binary format: download, extraction and parsing.
//!
//! Each record is one label byte followed by 3072 pixel bytes: the 1024 red
//! values of the 32×32 image in row-major order, then green, then blue.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use critical_core::{Error, Result};
use image::{Rgb, RgbImage};
use tracing::info;

pub const IMAGE_SIZE: u32 = 32;
pub const NUM_CHANNELS: usize = 3;
pub const NUM_CLASSES: usize = 10;
const PLANE: usize = (IMAGE_SIZE * IMAGE_SIZE) as usize;
const RECORD_LEN: usize = 1 + NUM_CHANNELS * PLANE;

pub const DOWNLOAD_URL: &str = "https://www.cs.toronto.edu/~kriz/cifar-10-binary.tar.gz";
const ARCHIVE_NAME: &str = "cifar-10-binary.tar.gz";
const EXTRACTED_DIR: &str = "cifar-10-batches-bin";
const TRAIN_FILES: [&str; 5] = [
    "data_batch_1.bin",
    "data_batch_2.bin",
    "data_batch_3.bin",
    "data_batch_4.bin",
    "data_batch_5.bin",
];
const TEST_FILE: &str = "test_batch.bin";

/// CIFAR-10 class names, indexed by label.
pub const CLASS_NAMES: [&str; NUM_CLASSES] = [
    "airplane",
    "automobile",
    "bird",
    "cat",
    "deer",
    "dog",
    "frog",
    "horse",
    "ship",
    "truck",
];

/// Which half of the dataset to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    /// 50,000 images
    Train,
    /// 10,000 images
    Test,
}

/// A raw image with its class label.
#[derive(Debug, Clone)]
pub struct LabeledImage {
    pub image: RgbImage,
    pub label: usize,
}

impl LabeledImage {
    pub fn class_name(&self) -> &'static str {
        CLASS_NAMES.get(self.label).copied().unwrap_or("unknown")
    }
}

/// Directory holding the extracted `.bin` files under `data_dir`.
pub fn batches_dir(data_dir: impl AsRef<Path>) -> PathBuf {
    data_dir.as_ref().join(EXTRACTED_DIR)
}

/// Whether every split file is already on disk.
pub fn is_available(data_dir: impl AsRef<Path>) -> bool {
    let dir = batches_dir(data_dir);
    TRAIN_FILES
        .iter()
        .chain(std::iter::once(&TEST_FILE))
        .all(|f| dir.join(f).is_file())
}

/// Downloads and extracts the dataset unless it is already present.
pub fn download(data_dir: impl AsRef<Path>) -> Result<()> {
    let data_dir = data_dir.as_ref();
    if is_available(data_dir) {
        info!("CIFAR-10 found in {}", batches_dir(data_dir).display());
        return Ok(());
    }
    fs::create_dir_all(data_dir)?;

    let archive_path = data_dir.join(ARCHIVE_NAME);
    if archive_path.exists() {
        info!("CIFAR-10 archive already downloaded, skipping download");
    } else {
        info!("Downloading CIFAR-10 from {DOWNLOAD_URL}");
        let response = reqwest::blocking::get(DOWNLOAD_URL)
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::Download(format!("failed to download {DOWNLOAD_URL}: {e}")))?;
        let bytes = response
            .bytes()
            .map_err(|e| Error::Download(format!("failed to read response: {e}")))?;

        // An interrupted download must never leave a file at `archive_path`.
        let partial = archive_path.with_extension("part");
        File::create(&partial)?.write_all(&bytes)?;
        fs::rename(&partial, &archive_path)?;
        info!("Downloaded {} MB", bytes.len() / (1024 * 1024));
    }

    info!("Extracting {}", archive_path.display());
    extract_tar_gz(&archive_path, data_dir)?;

    if !is_available(data_dir) {
        return Err(Error::Download(format!(
            "archive {} did not contain the expected batch files",
            archive_path.display()
        )));
    }
    Ok(())
}

fn extract_tar_gz(tar_gz_path: &Path, output_dir: &Path) -> Result<()> {
    let tar_gz = File::open(tar_gz_path)?;
    let decompressor = flate2::read::GzDecoder::new(tar_gz);
    let mut archive = tar::Archive::new(decompressor);
    archive
        .unpack(output_dir)
        .map_err(|e| Error::Download(format!("failed to extract {}: {e}", tar_gz_path.display())))
}

/// Loads one split from the extracted batch files.
pub fn load_split(data_dir: impl AsRef<Path>, split: Split) -> Result<Vec<LabeledImage>> {
    let dir = batches_dir(data_dir);
    let files: &[&str] = match split {
        Split::Train => &TRAIN_FILES,
        Split::Test => &[TEST_FILE],
    };

    let mut images = Vec::new();
    for file in files {
        images.extend(load_batch_file(&dir.join(file))?);
    }
    info!("Loaded {} {:?} images", images.len(), split);
    Ok(images)
}

fn load_batch_file(path: &Path) -> Result<Vec<LabeledImage>> {
    let mut bytes = Vec::new();
    File::open(path)
        .map_err(|e| Error::Dataset(format!("cannot open {}: {e}", path.display())))?
        .read_to_end(&mut bytes)?;
    parse_records(&bytes).map_err(|e| match e {
        Error::Dataset(msg) => Error::Dataset(format!("{}: {msg}", path.display())),
        other => other,
    })
}

/// Parses a buffer of concatenated CIFAR-10 records.
pub fn parse_records(bytes: &[u8]) -> Result<Vec<LabeledImage>> {
    if bytes.len() % RECORD_LEN != 0 {
        return Err(Error::Dataset(format!(
            "length {} is not a multiple of the {RECORD_LEN}-byte record size",
            bytes.len()
        )));
    }

    bytes
        .chunks_exact(RECORD_LEN)
        .map(|record| {
            let label = record[0] as usize;
            if label >= NUM_CLASSES {
                return Err(Error::Dataset(format!("label {label} out of range")));
            }
            let (red, rest) = record[1..].split_at(PLANE);
            let (green, blue) = rest.split_at(PLANE);
            let image = RgbImage::from_fn(IMAGE_SIZE, IMAGE_SIZE, |x, y| {
                let i = (y * IMAGE_SIZE + x) as usize;
                Rgb([red[i], green[i], blue[i]])
            });
            Ok(LabeledImage { image, label })
        })
        .collect()
}
