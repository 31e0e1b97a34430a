//! Dataset module for road segmentation data
//!
//! This module provides functionality for:
//! - Turning labelled images into channels-first image and one-hot label tensors
//! - Epoch-wise batch sources (in-memory, synthetic, KITTI road on disk)
//!
//! ## Epoch Contract
//!
//! Every call to [`BatchSource::batches`] starts a new pass over the data:
//! each sample appears exactly once, in a fresh random order, and the last
//! batch may be short.

pub mod batcher;
pub mod road;
pub mod source;

// Re-export main types for convenience
pub use batcher::{SegmentationBatch, SegmentationBatcher, SegmentationItem};
pub use road::{RoadDataset, RoadSample, NUM_ROAD_CLASSES};
pub use source::{synthetic_road_items, BatchIter, BatchSource, InMemorySource, SyntheticRoadSource};
