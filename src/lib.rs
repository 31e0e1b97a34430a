//! # Road FCN
//!
//! Fully convolutional road segmentation built with the Burn framework.
//! A frozen convolutional backbone exposes feature maps at strides 8, 16 and
//! 32; a skip-connected transposed-convolution decoder turns them into a
//! full-resolution per-class score map that is trained with per-pixel
//! softmax cross-entropy and an L2 weight penalty.
//!
//! ## Modules
//!
//! - `encoder`: The encoder capability and the frozen backbone
//! - `model`: FCN decoder and run configuration
//! - `training`: Objective, model context and training loop
//! - `dataset`: Batching, batch sources and the KITTI road loader
//! - `preflight`: Framework and accelerator checks
//! - `utils`: Errors, logging and helper functions
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use road_fcn::backend::{default_device, TrainingBackend};
//! use road_fcn::dataset::SyntheticRoadSource;
//! use road_fcn::encoder::Encoder;
//! use road_fcn::model::{FcnDecoderConfig, TrainingConfig};
//! use road_fcn::training::{build_model, train, ObjectiveConfig};
//!
//! let device = default_device();
//! let config = TrainingConfig::debug();
//! let encoder = config.backbone.to_config().init::<TrainingBackend>(&device)?;
//! let decoder_config = FcnDecoderConfig::new(config.num_classes, encoder.channels());
//! let mut model = build_model(&decoder_config, &ObjectiveConfig::new(config.num_classes), &device)?;
//! let mut source = SyntheticRoadSource::new(16, config.image_shape, config.seed)?;
//! let summary = train(&mut model, &encoder, &mut source, &config, &device)?;
//! ```

pub mod backend;
pub mod dataset;
pub mod encoder;
pub mod model;
pub mod preflight;
pub mod training;
pub mod utils;

// Re-export commonly used items for convenience
pub use dataset::{
    BatchSource, InMemorySource, RoadDataset, SegmentationBatch, SegmentationBatcher,
    SegmentationItem, SyntheticRoadSource,
};
pub use encoder::{ConvBackbone, ConvBackboneConfig, Encoder, FeatureMaps};
pub use model::{FcnDecoder, FcnDecoderConfig, LossReport, TrainingConfig};
pub use preflight::{run_preflight, PreflightReport};
pub use training::{build_model, train, ObjectiveConfig, SegmentationModel, TrainingSummary};
pub use utils::error::{FcnError, Result};

/// Background and road
pub const NUM_CLASSES: usize = 2;

/// Default input size (height, width) for KITTI road images
pub const IMAGE_SHAPE: (usize, usize) = (160, 576);

/// Version of the library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
