//! Batch sources
//!
//! A [`BatchSource`] hands the training driver one epoch of minibatches per
//! call: every sample exactly once, in a fresh order each time, produced
//! lazily.

use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use super::batcher::SegmentationItem;
use crate::utils::error::{FcnError, Result};

/// One epoch worth of minibatches
pub type BatchIter<'a> = Box<dyn Iterator<Item = Result<Vec<SegmentationItem>>> + 'a>;

/// Produces an exhaustive, reshuffled partition of the training set per call.
pub trait BatchSource {
    /// Number of samples in one full pass
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start a new epoch. The last batch may be smaller than `batch_size`.
    fn batches(&mut self, batch_size: usize) -> Result<BatchIter<'_>>;
}

/// Shuffle `0..len` and split it into `batch_size` chunks.
pub(crate) fn epoch_partition(len: usize, batch_size: usize, rng: &mut ChaCha8Rng) -> Result<Vec<Vec<usize>>> {
    if batch_size == 0 {
        return Err(FcnError::Config("batch_size must be greater than 0".to_string()));
    }
    let mut order: Vec<usize> = (0..len).collect();
    order.shuffle(rng);
    Ok(order.chunks(batch_size).map(|chunk| chunk.to_vec()).collect())
}

/// Samples held in memory
#[derive(Debug, Clone)]
pub struct InMemorySource {
    items: Vec<SegmentationItem>,
    rng: ChaCha8Rng,
}

impl InMemorySource {
    pub fn new(items: Vec<SegmentationItem>, seed: u64) -> Self {
        Self {
            items,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    pub fn items(&self) -> &[SegmentationItem] {
        &self.items
    }
}

impl BatchSource for InMemorySource {
    fn len(&self) -> usize {
        self.items.len()
    }

    fn batches(&mut self, batch_size: usize) -> Result<BatchIter<'_>> {
        let partition = epoch_partition(self.items.len(), batch_size, &mut self.rng)?;
        let items = &self.items;
        Ok(Box::new(partition.into_iter().map(move |indices| {
            Ok(indices.iter().map(|&i| items[i].clone()).collect())
        })))
    }
}

/// In-memory source over [`synthetic_road_items`]
#[derive(Debug, Clone)]
pub struct SyntheticRoadSource {
    inner: InMemorySource,
}

impl SyntheticRoadSource {
    pub fn new(count: usize, image_shape: (usize, usize), seed: u64) -> Result<Self> {
        let items = synthetic_road_items(count, image_shape, seed)?;
        Ok(Self {
            inner: InMemorySource::new(items, seed.wrapping_add(1)),
        })
    }
}

impl BatchSource for SyntheticRoadSource {
    fn len(&self) -> usize {
        self.inner.len()
    }

    fn batches(&mut self, batch_size: usize) -> Result<BatchIter<'_>> {
        self.inner.batches(batch_size)
    }
}

/// Generate road-like scenes: a grey trapezoid (class 1) widening towards
/// the bottom edge over a noisy green/blue background (class 0).
pub fn synthetic_road_items(count: usize, image_shape: (usize, usize), seed: u64) -> Result<Vec<SegmentationItem>> {
    let (height, width) = image_shape;
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let pixels = height * width;

    (0..count)
        .map(|n| {
            let horizon = height as f32 * rng.gen_range(0.35..0.6);
            let centre = width as f32 * rng.gen_range(0.3..0.7);
            let spread = rng.gen_range(0.6..1.4);

            let mut image = vec![0.0f32; 3 * pixels];
            let mut mask = vec![0u8; pixels];
            for y in 0..height {
                for x in 0..width {
                    let p = y * width + x;
                    let depth = y as f32 - horizon;
                    let road = depth > 0.0 && (x as f32 - centre).abs() < depth * spread;
                    let noise: f32 = rng.gen_range(-0.05..0.05);
                    let rgb = if road {
                        mask[p] = 1;
                        [0.45, 0.45, 0.47]
                    } else if depth <= 0.0 {
                        [0.45, 0.6, 0.85]
                    } else {
                        [0.2, 0.5, 0.2]
                    };
                    for (c, value) in rgb.iter().enumerate() {
                        image[c * pixels + p] = (value + noise).clamp(0.0, 1.0);
                    }
                }
            }
            SegmentationItem::new(image, mask, height, width, format!("synthetic_{:04}", n))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn source(count: usize) -> InMemorySource {
        InMemorySource::new(synthetic_road_items(count, (32, 64), 7).unwrap(), 42)
    }

    fn epoch_paths(source: &mut InMemorySource, batch_size: usize) -> Vec<Vec<String>> {
        source
            .batches(batch_size)
            .unwrap()
            .map(|batch| batch.unwrap().into_iter().map(|item| item.path).collect())
            .collect()
    }

    #[test]
    fn test_epoch_is_exhaustive_without_repeats() {
        let mut src = source(10);
        let batches = epoch_paths(&mut src, 4);

        assert_eq!(batches.iter().map(Vec::len).collect::<Vec<_>>(), vec![4, 4, 2]);
        let unique: HashSet<_> = batches.iter().flatten().collect();
        assert_eq!(unique.len(), 10);
    }

    #[test]
    fn test_each_call_restarts_and_reshuffles() {
        let mut src = source(12);
        let first: Vec<String> = epoch_paths(&mut src, 3).into_iter().flatten().collect();
        let second: Vec<String> = epoch_paths(&mut src, 3).into_iter().flatten().collect();

        assert_eq!(first.len(), 12);
        assert_eq!(second.len(), 12);
        assert_ne!(first, second);

        let mut a = first.clone();
        let mut b = second.clone();
        a.sort();
        b.sort();
        assert_eq!(a, b);
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let mut src = source(2);
        assert!(src.batches(0).is_err());
    }

    #[test]
    fn test_synthetic_items_have_both_classes() {
        let items = synthetic_road_items(3, (64, 96), 1).unwrap();
        assert_eq!(items.len(), 3);
        for item in &items {
            let road = item.class_fraction(1);
            assert!(road > 0.0 && road < 1.0);
            assert!(item.image.iter().all(|v| (0.0..=1.0).contains(v)));
        }
    }

    #[test]
    fn test_synthetic_source_len() {
        let mut src = SyntheticRoadSource::new(5, (32, 32), 3).unwrap();
        assert_eq!(src.len(), 5);
        assert!(!src.is_empty());
        assert_eq!(src.batches(2).unwrap().count(), 3);
    }

    #[test]
    fn test_synthetic_items_are_seeded() {
        let a = synthetic_road_items(2, (32, 32), 5).unwrap();
        let b = synthetic_road_items(2, (32, 32), 5).unwrap();
        assert_eq!(a[1].mask, b[1].mask);
        assert_eq!(a[1].image, b[1].image);
    }
}
