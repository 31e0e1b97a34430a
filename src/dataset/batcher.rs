//! Burn Batcher integration for segmentation samples
//!
//! Items stay on the host as flat `f32` images and per-pixel class indices
//! until the batcher turns a group of them into a channels-first image
//! tensor and a one-hot label tensor.

use burn::data::dataloader::batcher::Batcher;
use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::encoder::INPUT_CHANNELS;
use crate::utils::error::{FcnError, Result};

/// A single labelled image
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SegmentationItem {
    /// Image data as flattened CHW float array [3 * H * W], values in [0, 1]
    pub image: Vec<f32>,
    /// Class index per pixel, row-major [H * W]
    pub mask: Vec<u8>,
    /// Image height
    pub height: usize,
    /// Image width
    pub width: usize,
    /// Source path (for debugging/logging)
    pub path: String,
}

impl SegmentationItem {
    /// Create an item, checking buffer lengths against `height x width`
    pub fn new(
        image: Vec<f32>,
        mask: Vec<u8>,
        height: usize,
        width: usize,
        path: impl Into<String>,
    ) -> Result<Self> {
        let path = path.into();
        let pixels = height * width;
        if pixels == 0 {
            return Err(FcnError::Dataset(format!("{}: empty image", path)));
        }
        if image.len() != INPUT_CHANNELS * pixels {
            return Err(FcnError::Dataset(format!(
                "{}: image buffer has {} values, expected {}",
                path,
                image.len(),
                INPUT_CHANNELS * pixels
            )));
        }
        if mask.len() != pixels {
            return Err(FcnError::Dataset(format!(
                "{}: mask has {} values, expected {}",
                path,
                mask.len(),
                pixels
            )));
        }
        Ok(Self {
            image,
            mask,
            height,
            width,
            path,
        })
    }

    /// Fraction of pixels labelled with `class`
    pub fn class_fraction(&self, class: u8) -> f64 {
        let hits = self.mask.iter().filter(|&&c| c == class).count();
        hits as f64 / self.mask.len() as f64
    }
}

/// A batch of images and one-hot labels
#[derive(Clone, Debug)]
pub struct SegmentationBatch<B: Backend> {
    /// Batch of images with shape [batch_size, 3, height, width]
    pub images: Tensor<B, 4>,
    /// One-hot labels with shape [batch_size, num_classes, height, width]
    pub labels: Tensor<B, 4>,
}

impl<B: Backend> SegmentationBatch<B> {
    pub fn len(&self) -> usize {
        self.images.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Batcher for segmentation training batches
#[derive(Clone, Debug)]
pub struct SegmentationBatcher {
    num_classes: usize,
    height: usize,
    width: usize,
}

impl SegmentationBatcher {
    /// Create a batcher for `num_classes` labels at `(height, width)`
    pub fn new(num_classes: usize, image_shape: (usize, usize)) -> Self {
        Self {
            num_classes,
            height: image_shape.0,
            width: image_shape.1,
        }
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Reject items the batcher cannot represent. Must pass before `batch`.
    pub fn check(&self, items: &[SegmentationItem]) -> Result<()> {
        if items.is_empty() {
            return Err(FcnError::Dataset("batch source yielded an empty batch".to_string()));
        }
        for item in items {
            if item.height != self.height || item.width != self.width {
                return Err(FcnError::ShapeMismatch {
                    stage: "batch item",
                    expected: vec![self.height, self.width],
                    found: vec![item.height, item.width],
                });
            }
            let pixels = self.height * self.width;
            if item.image.len() != INPUT_CHANNELS * pixels || item.mask.len() != pixels {
                return Err(FcnError::Dataset(format!("{}: corrupt buffers", item.path)));
            }
            if let Some(&class) = item.mask.iter().find(|&&c| c as usize >= self.num_classes) {
                return Err(FcnError::ClassCountMismatch {
                    context: "label mask",
                    expected: self.num_classes,
                    found: class as usize + 1,
                });
            }
        }
        Ok(())
    }

    /// `check` followed by `batch`
    pub fn try_batch<B: Backend>(
        &self,
        items: Vec<SegmentationItem>,
        device: &B::Device,
    ) -> Result<SegmentationBatch<B>> {
        self.check(&items)?;
        Ok(Batcher::<B, SegmentationItem, SegmentationBatch<B>>::batch(self, items, device))
    }
}

/// Expects items that passed [`SegmentationBatcher::check`]. Mask values
/// outside `0..num_classes` leave their pixel without a hot class.
impl<B: Backend> Batcher<B, SegmentationItem, SegmentationBatch<B>> for SegmentationBatcher {
    fn batch(&self, items: Vec<SegmentationItem>, device: &B::Device) -> SegmentationBatch<B> {
        let batch_size = items.len();
        let (height, width) = (self.height, self.width);
        let pixels = height * width;
        let k = self.num_classes;

        // Flatten all images into a single vector
        let images_data: Vec<f32> = items.iter().flat_map(|item| item.image.iter().copied()).collect();

        let images = Tensor::<B, 4>::from_floats(
            TensorData::new(images_data, [batch_size, INPUT_CHANNELS, height, width]),
            device,
        );

        // One-hot encode along the class axis
        let mut labels_data = vec![0.0f32; batch_size * k * pixels];
        for (i, item) in items.iter().enumerate() {
            for (p, &class) in item.mask.iter().take(pixels).enumerate() {
                let class = class as usize;
                if class < k {
                    labels_data[(i * k + class) * pixels + p] = 1.0;
                }
            }
        }
        let labels = Tensor::<B, 4>::from_floats(
            TensorData::new(labels_data, [batch_size, k, height, width]),
            device,
        );

        SegmentationBatch { images, labels }
    }
}
