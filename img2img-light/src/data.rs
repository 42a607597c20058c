//! Aligned paired-image dataset.
//!
//! Every file holds an image pair side by side: `A` on the left half and `B`
//! on the right half. Both halves go through the same resize, crop and flip
//! so that pixels stay aligned.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use candle::{Device, Tensor};
use image::imageops::FilterType;
use image::DynamicImage;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::options::Options;
use crate::trainer::{BatchSource, EpochIter};

const IMG_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp"];

/// Which half of a pair is the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Direction {
    #[default]
    AtoB,
    BtoA,
}

impl Direction {
    /// Orders an `(a, b)` pair as `(input, target)`.
    pub fn order<T>(&self, a: T, b: T) -> (T, T) {
        match self {
            Direction::AtoB => (a, b),
            Direction::BtoA => (b, a),
        }
    }
}

impl FromStr for Direction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "AtoB" => Ok(Direction::AtoB),
            "BtoA" => Ok(Direction::BtoA),
            _ => Err(Error::Config(format!("direction must be AtoB or BtoA, got {s}"))),
        }
    }
}

/// Geometric preprocessing applied when loading a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Preprocess {
    /// Resize to `load_size`, then take a random `crop_size` crop.
    #[default]
    ResizeAndCrop,
    /// Resize to `load_size`.
    Resize,
    /// Random `crop_size` crop of the original image.
    Crop,
    /// Keep the image, only rounding its sides to a multiple of 4.
    None,
}

impl FromStr for Preprocess {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "resize_and_crop" => Ok(Preprocess::ResizeAndCrop),
            "resize" => Ok(Preprocess::Resize),
            "crop" => Ok(Preprocess::Crop),
            "none" => Ok(Preprocess::None),
            _ => Err(Error::Config(format!("unknown preprocess mode {s}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DatasetOptions {
    pub load_size: u32,
    pub crop_size: u32,
    pub preprocess: Preprocess,
    pub no_flip: bool,
    /// Channels of the `A` half.
    pub a_channels: usize,
    /// Channels of the `B` half.
    pub b_channels: usize,
    pub max_dataset_size: Option<usize>,
}

impl DatasetOptions {
    pub fn from_options(options: &Options) -> Self {
        let (a_channels, b_channels) = options
            .direction
            .order(options.input_nc, options.output_nc);
        Self {
            load_size: options.load_size as u32,
            crop_size: options.crop_size as u32,
            preprocess: options.preprocess,
            no_flip: options.no_flip,
            a_channels,
            b_channels,
            max_dataset_size: options.max_dataset_size,
        }
    }
}

/// One aligned pair as `(C, H, W)` tensors in `[-1, 1]`.
#[derive(Debug, Clone)]
pub struct AlignedSample {
    pub a: Tensor,
    pub b: Tensor,
    pub path: PathBuf,
}

/// A stack of aligned pairs, `(N, C, H, W)`.
#[derive(Debug, Clone)]
pub struct PairedBatch {
    pub a: Tensor,
    pub b: Tensor,
    pub a_paths: Vec<PathBuf>,
    pub b_paths: Vec<PathBuf>,
}

impl PairedBatch {
    pub fn new(a: Tensor, b: Tensor) -> Self {
        Self {
            a,
            b,
            a_paths: Vec::new(),
            b_paths: Vec::new(),
        }
    }

    pub fn from_samples(samples: &[AlignedSample]) -> candle::Result<Self> {
        let a: Vec<&Tensor> = samples.iter().map(|s| &s.a).collect();
        let b: Vec<&Tensor> = samples.iter().map(|s| &s.b).collect();
        let paths: Vec<PathBuf> = samples.iter().map(|s| s.path.clone()).collect();
        Ok(Self {
            a: Tensor::stack(&a, 0)?,
            b: Tensor::stack(&b, 0)?,
            a_paths: paths.clone(),
            b_paths: paths,
        })
    }

    pub fn len(&self) -> usize {
        self.a.dims().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Random parameters shared by both halves of a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TransformParams {
    crop_x: u32,
    crop_y: u32,
    flip: bool,
}

pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMG_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Paired images stored as one side-by-side file each.
#[derive(Debug, Clone)]
pub struct AlignedDataset {
    paths: Vec<PathBuf>,
    options: DatasetOptions,
    device: Device,
}

impl AlignedDataset {
    /// Lists the image files directly under `dir`, sorted by name.
    pub fn open(dir: impl AsRef<Path>, options: DatasetOptions, device: Device) -> Result<Self> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(Error::Dataset(format!(
                "{} is not a valid directory",
                dir.display()
            )));
        }
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_file() && is_image_file(&path) {
                paths.push(path);
            }
        }
        paths.sort();
        if let Some(max) = options.max_dataset_size {
            paths.truncate(max);
        }
        if paths.is_empty() {
            return Err(Error::Dataset(format!(
                "found 0 images in {}",
                dir.display()
            )));
        }
        tracing::info!(dir = %dir.display(), images = paths.len(), "opened aligned dataset");
        Ok(Self {
            paths,
            options,
            device,
        })
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    /// Loads pair `index` with fresh random transform parameters.
    pub fn get(&self, index: usize, rng: &mut impl Rng) -> Result<AlignedSample> {
        let path = self.paths.get(index).ok_or_else(|| {
            Error::Dataset(format!("index {index} out of range for {} images", self.len()))
        })?;
        let ab = image::open(path)?;
        let (w, h) = (ab.width(), ab.height());
        if w < 2 {
            return Err(Error::Dataset(format!(
                "{} is too narrow to hold an image pair",
                path.display()
            )));
        }
        let half = w / 2;
        let a = ab.crop_imm(0, 0, half, h);
        let b = ab.crop_imm(half, 0, half, h);

        let params = self.transform_params(half, h, rng)?;
        let a = self.transform(&a, params);
        let b = self.transform(&b, params);
        Ok(AlignedSample {
            a: image_to_tensor(&a, self.options.a_channels, &self.device)?,
            b: image_to_tensor(&b, self.options.b_channels, &self.device)?,
            path: path.clone(),
        })
    }

    fn transform_params(&self, w: u32, h: u32, rng: &mut impl Rng) -> Result<TransformParams> {
        let opts = &self.options;
        let (w, h) = match opts.preprocess {
            Preprocess::ResizeAndCrop => (opts.load_size, opts.load_size),
            _ => (w, h),
        };
        let (crop_x, crop_y) = match opts.preprocess {
            Preprocess::ResizeAndCrop | Preprocess::Crop => {
                if w < opts.crop_size || h < opts.crop_size {
                    return Err(Error::Dataset(format!(
                        "image of {w}x{h} is smaller than crop_size {}",
                        opts.crop_size
                    )));
                }
                (
                    rng.random_range(0..=w - opts.crop_size),
                    rng.random_range(0..=h - opts.crop_size),
                )
            }
            Preprocess::Resize | Preprocess::None => (0, 0),
        };
        let flip = !opts.no_flip && rng.random_bool(0.5);
        Ok(TransformParams {
            crop_x,
            crop_y,
            flip,
        })
    }

    fn transform(&self, img: &DynamicImage, params: TransformParams) -> DynamicImage {
        let opts = &self.options;
        let img = match opts.preprocess {
            Preprocess::ResizeAndCrop => img
                .resize_exact(opts.load_size, opts.load_size, FilterType::CatmullRom)
                .crop_imm(params.crop_x, params.crop_y, opts.crop_size, opts.crop_size),
            Preprocess::Resize => {
                img.resize_exact(opts.load_size, opts.load_size, FilterType::CatmullRom)
            }
            Preprocess::Crop => {
                img.crop_imm(params.crop_x, params.crop_y, opts.crop_size, opts.crop_size)
            }
            Preprocess::None => {
                let (w, h) = (round_to_multiple(img.width(), 4), round_to_multiple(img.height(), 4));
                if (w, h) == (img.width(), img.height()) {
                    img.clone()
                } else {
                    img.resize_exact(w, h, FilterType::CatmullRom)
                }
            }
        };
        if params.flip {
            img.fliph()
        } else {
            img
        }
    }
}

fn round_to_multiple(value: u32, base: u32) -> u32 {
    (((value as f32) / base as f32).round() as u32).max(1) * base
}

/// Converts an image to a `(C, H, W)` f32 tensor scaled to `[-1, 1]`.
pub fn image_to_tensor(img: &DynamicImage, channels: usize, device: &Device) -> Result<Tensor> {
    let (w, h) = (img.width() as usize, img.height() as usize);
    let raw = match channels {
        1 => img.to_luma8().into_raw(),
        3 => img.to_rgb8().into_raw(),
        _ => {
            return Err(Error::Config(format!(
                "images must have 1 or 3 channels, got {channels}"
            )))
        }
    };
    let data: Vec<f32> = raw.into_iter().map(|v| v as f32 / 127.5 - 1.0).collect();
    let tensor = Tensor::from_vec(data, (h, w, channels), device)?.permute((2, 0, 1))?;
    Ok(tensor.contiguous()?)
}

/// Batches an [`AlignedDataset`], re-drawing random crops and flips and
/// reshuffling every epoch.
pub struct AlignedLoader {
    dataset: AlignedDataset,
    batch_size: usize,
    shuffle: bool,
    rng: StdRng,
}

impl AlignedLoader {
    pub fn new(dataset: AlignedDataset, batch_size: usize, shuffle: bool, seed: u64) -> Self {
        Self {
            dataset,
            batch_size: batch_size.max(1),
            shuffle,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn from_options(dataset: AlignedDataset, options: &Options) -> Self {
        Self::new(
            dataset,
            options.batch_size,
            !options.serial_batches,
            options.seed,
        )
    }

    pub fn dataset(&self) -> &AlignedDataset {
        &self.dataset
    }

    /// Number of batches in one epoch; the last batch may be smaller.
    pub fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    /// Starts a new epoch. Images are decoded one batch at a time as the
    /// iterator advances.
    pub fn batches(&mut self) -> EpochBatches<'_> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.shuffle {
            order.shuffle(&mut self.rng);
        }
        EpochBatches {
            dataset: &self.dataset,
            rng: &mut self.rng,
            order,
            pos: 0,
            batch_size: self.batch_size,
        }
    }

    /// Decodes a whole epoch at once.
    pub fn load_epoch(&mut self) -> Result<Vec<PairedBatch>> {
        self.batches().collect()
    }
}

/// One epoch of an [`AlignedLoader`].
pub struct EpochBatches<'a> {
    dataset: &'a AlignedDataset,
    rng: &'a mut StdRng,
    order: Vec<usize>,
    pos: usize,
    batch_size: usize,
}

impl Iterator for EpochBatches<'_> {
    type Item = Result<PairedBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.order.len() {
            return None;
        }
        let end = (self.pos + self.batch_size).min(self.order.len());
        let (dataset, rng) = (self.dataset, &mut *self.rng);
        let samples = self.order[self.pos..end]
            .iter()
            .map(|&index| dataset.get(index, rng))
            .collect::<Result<Vec<_>>>();
        self.pos = end;
        Some(samples.and_then(|samples| Ok(PairedBatch::from_samples(&samples)?)))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = (self.order.len() - self.pos).div_ceil(self.batch_size);
        (n, Some(n))
    }
}

impl ExactSizeIterator for EpochBatches<'_> {}

impl BatchSource for AlignedLoader {
    type Batch = PairedBatch;

    fn epoch_batches(&mut self, epoch: usize) -> candle::Result<EpochIter<'_, PairedBatch>> {
        tracing::debug!(epoch, batches = self.num_batches(), "streaming aligned batches");
        Ok(Box::new(self.batches().map(|batch| batch.map_err(Error::into_candle))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    /// Writes a 2w x h pair whose left half is red and right half is blue.
    fn write_pair(dir: &Path, name: &str, w: u32, h: u32) -> PathBuf {
        let mut img = RgbImage::new(2 * w, h);
        for (x, _, pixel) in img.enumerate_pixels_mut() {
            *pixel = if x < w { Rgb([255, 0, 0]) } else { Rgb([0, 0, 255]) };
        }
        let path = dir.join(name);
        img.save(&path).unwrap();
        path
    }

    fn options(preprocess: Preprocess) -> DatasetOptions {
        DatasetOptions {
            load_size: 36,
            crop_size: 32,
            preprocess,
            no_flip: false,
            a_channels: 3,
            b_channels: 3,
            max_dataset_size: None,
        }
    }

    #[test]
    fn splits_pairs_into_halves() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        write_pair(dir.path(), "0001.png", 40, 40);
        let dataset = AlignedDataset::open(dir.path(), options(Preprocess::ResizeAndCrop), Device::Cpu)?;
        let mut rng = StdRng::seed_from_u64(3);
        let sample = dataset.get(0, &mut rng)?;

        assert_eq!(sample.a.dims(), &[3, 32, 32]);
        assert_eq!(sample.b.dims(), &[3, 32, 32]);
        // Red channel of A is at the top of the range, blue channel of B too.
        let a_red = sample.a.get(0)?.mean_all()?.to_scalar::<f32>()?;
        let b_blue = sample.b.get(2)?.mean_all()?.to_scalar::<f32>()?;
        let b_red = sample.b.get(0)?.mean_all()?.to_scalar::<f32>()?;
        assert!(a_red > 0.9);
        assert!(b_blue > 0.9);
        assert!(b_red < -0.9);
        Ok(())
    }

    #[test]
    fn grayscale_channels() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        write_pair(dir.path(), "pair.png", 32, 32);
        let opts = DatasetOptions {
            a_channels: 1,
            ..options(Preprocess::Resize)
        };
        let dataset = AlignedDataset::open(dir.path(), opts, Device::Cpu)?;
        let sample = dataset.get(0, &mut StdRng::seed_from_u64(0))?;
        assert_eq!(sample.a.dims(), &[1, 36, 36]);
        assert_eq!(sample.b.dims(), &[3, 36, 36]);
        Ok(())
    }

    #[test]
    fn skips_non_images_and_caps_size() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        write_pair(dir.path(), "b.png", 32, 32);
        write_pair(dir.path(), "a.png", 32, 32);
        std::fs::write(dir.path().join("notes.txt"), "not an image")?;
        let dataset = AlignedDataset::open(dir.path(), options(Preprocess::Crop), Device::Cpu)?;
        assert_eq!(dataset.len(), 2);
        assert!(dataset.paths()[0].ends_with("a.png"));

        let capped = DatasetOptions {
            max_dataset_size: Some(1),
            ..options(Preprocess::Crop)
        };
        let dataset = AlignedDataset::open(dir.path(), capped, Device::Cpu)?;
        assert_eq!(dataset.len(), 1);
        Ok(())
    }

    #[test]
    fn empty_directory_is_an_error() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let err = AlignedDataset::open(dir.path(), options(Preprocess::Crop), Device::Cpu).unwrap_err();
        assert!(matches!(err, Error::Dataset(_)));
        Ok(())
    }

    #[test]
    fn crop_larger_than_image_is_an_error() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        write_pair(dir.path(), "small.png", 16, 16);
        let dataset = AlignedDataset::open(dir.path(), options(Preprocess::Crop), Device::Cpu)?;
        assert!(dataset.get(0, &mut StdRng::seed_from_u64(0)).is_err());
        Ok(())
    }

    #[test]
    fn loader_batches_every_epoch() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        for i in 0..5 {
            write_pair(dir.path(), &format!("{i}.png"), 32, 32);
        }
        let dataset = AlignedDataset::open(dir.path(), options(Preprocess::ResizeAndCrop), Device::Cpu)?;
        let mut loader = AlignedLoader::new(dataset, 2, true, 7);
        assert_eq!(loader.num_batches(), 3);
        let batches = loader.epoch_batches(0)?.collect::<candle::Result<Vec<_>>>()?;
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].a.dims(), &[2, 3, 32, 32]);
        assert_eq!(batches[2].len(), 1);
        assert_eq!(batches[0].a_paths, batches[0].b_paths);
        Ok(())
    }

    #[test]
    fn loader_decodes_one_batch_at_a_time() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let paths: Vec<PathBuf> = (0..3)
            .map(|i| write_pair(dir.path(), &format!("{i}.png"), 32, 32))
            .collect();
        let dataset = AlignedDataset::open(dir.path(), options(Preprocess::Resize), Device::Cpu)?;
        let mut loader = AlignedLoader::new(dataset, 1, false, 0);

        let mut batches = loader.batches();
        assert_eq!(batches.len(), 3);
        let first = batches.next().expect("first batch")?;
        assert_eq!(first.a_paths, vec![paths[0].clone()]);
        // Files behind later batches are only read when reached.
        std::fs::remove_file(&paths[1])?;
        assert!(batches.next().expect("second batch").is_err());
        assert!(batches.next().expect("third batch").is_ok());
        assert!(batches.next().is_none());
        Ok(())
    }

    #[test]
    fn direction_orders_pairs() {
        assert_eq!(Direction::AtoB.order(1, 3), (1, 3));
        assert_eq!(Direction::BtoA.order(1, 3), (3, 1));
        assert_eq!("BtoA".parse::<Direction>().unwrap(), Direction::BtoA);
        assert!("AB".parse::<Direction>().is_err());
    }

    #[test]
    fn rounds_to_multiple_of_four() {
        assert_eq!(round_to_multiple(255, 4), 256);
        assert_eq!(round_to_multiple(1, 4), 4);
        assert_eq!(round_to_multiple(64, 4), 64);
    }
}
