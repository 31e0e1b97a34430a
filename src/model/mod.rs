//! Model module for the segmentation network using the Burn framework
//!
//! This module provides:
//! - The skip-connected FCN decoder
//! - Run configuration and its validation
//!
//! ## Architecture
//!
//! A frozen backbone (see [`crate::encoder`]) produces feature maps at
//! strides 8, 16 and 32. The decoder projects each to `num_classes`
//! channels, upsamples the coarse path with learned transposed
//! convolutions and adds the finer projections on the way up.

pub mod config;
pub mod decoder;

// Re-export main types for convenience
pub use config::{BackboneSettings, LossReport, TrainingConfig};
pub use decoder::{DecoderPlan, FcnDecoder, FcnDecoderConfig};
