//! KITTI road dataset loader
//!
//! Expects the training split of the KITTI road benchmark:
//!
//! ```text
//! root/
//! ├── image_2/
//! │   ├── um_000000.png
//! │   └── ...
//! └── gt_image_2/
//!     ├── um_road_000000.png
//!     ├── um_lane_000000.png   (ignored)
//!     └── ...
//! ```
//!
//! Ground-truth pixels that are pure red are background, every other colour
//! is road. Images are decoded lazily, one batch at a time.

use std::path::{Path, PathBuf};

use image::imageops::FilterType;
use image::{ImageReader, RgbImage};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info};
use walkdir::WalkDir;

use super::batcher::SegmentationItem;
use super::source::{epoch_partition, BatchIter, BatchSource};
use crate::utils::error::{FcnError, Result, ResultExt};

/// Background and road
pub const NUM_ROAD_CLASSES: usize = 2;

/// Ground-truth colour of background pixels
pub const BACKGROUND_COLOR: [u8; 3] = [255, 0, 0];

const IMAGE_DIR: &str = "image_2";
const LABEL_DIR: &str = "gt_image_2";

/// An image and its road label on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoadSample {
    pub image: PathBuf,
    pub label: PathBuf,
}

/// KITTI road training set
#[derive(Debug)]
pub struct RoadDataset {
    /// Root directory of the split
    pub root_dir: PathBuf,
    /// Paired samples, sorted by label file name
    pub samples: Vec<RoadSample>,
    /// Target size (height, width)
    pub image_shape: (usize, usize),
    rng: ChaCha8Rng,
}

impl RoadDataset {
    /// Scan `root_dir` for image/label pairs
    pub fn open(root_dir: &Path, image_shape: (usize, usize), seed: u64) -> Result<Self> {
        let image_dir = root_dir.join(IMAGE_DIR);
        let label_dir = root_dir.join(LABEL_DIR);
        for dir in [&image_dir, &label_dir] {
            if !dir.is_dir() {
                return Err(FcnError::PathNotFound(dir.clone()));
            }
        }

        let mut samples = Vec::new();
        for entry in WalkDir::new(&label_dir)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
        {
            let entry = entry.with_context(|| format!("Failed to scan {:?}", label_dir))?;
            let name = entry.file_name().to_string_lossy();
            if !name.ends_with(".png") || !name.contains("_road_") {
                continue;
            }

            let image = image_dir.join(name.replacen("_road_", "_", 1));
            if !image.is_file() {
                return Err(FcnError::Dataset(format!(
                    "label {:?} has no matching image {:?}",
                    entry.path(),
                    image
                )));
            }
            samples.push(RoadSample {
                image,
                label: entry.path().to_path_buf(),
            });
        }

        if samples.is_empty() {
            return Err(FcnError::Dataset(format!("no road labels found in {:?}", label_dir)));
        }

        info!("Found {} road samples in {:?}", samples.len(), root_dir);

        Ok(Self {
            root_dir: root_dir.to_path_buf(),
            samples,
            image_shape,
            rng: ChaCha8Rng::seed_from_u64(seed),
        })
    }

    /// Decode, resize and convert one sample
    pub fn load_item(&self, sample: &RoadSample) -> Result<SegmentationItem> {
        load_sample(sample, self.image_shape)
    }
}

impl BatchSource for RoadDataset {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn batches(&mut self, batch_size: usize) -> Result<BatchIter<'_>> {
        let partition = epoch_partition(self.samples.len(), batch_size, &mut self.rng)?;
        let samples = &self.samples;
        let shape = self.image_shape;
        Ok(Box::new(partition.into_iter().map(move |indices| {
            indices
                .iter()
                .map(|&i| load_sample(&samples[i], shape))
                .collect::<Result<Vec<_>>>()
        })))
    }
}

fn load_sample(sample: &RoadSample, (height, width): (usize, usize)) -> Result<SegmentationItem> {
    debug!("Loading {:?}", sample.image);
    let image = read_rgb(&sample.image, height, width, FilterType::Triangle)?;
    let label = read_rgb(&sample.label, height, width, FilterType::Nearest)?;

    let pixels = height * width;
    let mut data = vec![0.0f32; 3 * pixels];
    let mut mask = vec![0u8; pixels];

    // Convert to CHW format and normalize to [0, 1]
    for y in 0..height {
        for x in 0..width {
            let p = y * width + x;
            let pixel = image.get_pixel(x as u32, y as u32);
            data[p] = pixel[0] as f32 / 255.0;
            data[pixels + p] = pixel[1] as f32 / 255.0;
            data[2 * pixels + p] = pixel[2] as f32 / 255.0;

            mask[p] = mask_class(label.get_pixel(x as u32, y as u32).0);
        }
    }

    SegmentationItem::new(data, mask, height, width, sample.image.to_string_lossy())
}

/// Class index of a ground-truth colour
pub fn mask_class(rgb: [u8; 3]) -> u8 {
    if rgb == BACKGROUND_COLOR {
        0
    } else {
        1
    }
}

fn read_rgb(path: &Path, height: usize, width: usize, filter: FilterType) -> Result<RgbImage> {
    let img = ImageReader::open(path)
        .map_err(|e| FcnError::ImageLoad(path.to_path_buf(), e.to_string()))?
        .decode()
        .map_err(|e| FcnError::ImageLoad(path.to_path_buf(), e.to_string()))?;
    Ok(img.resize_exact(width as u32, height as u32, filter).to_rgb8())
}
