//! Encoder adapter
//!
//! The decoder only needs three feature maps taken at strides 8, 16 and 32
//! of the input resolution. [`Encoder`] is the typed capability exposing
//! them; [`ConvBackbone`] is the concrete frozen feature extractor used by
//! the CLI and the tests.

pub mod backbone;

use burn::tensor::{backend::Backend, Tensor};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::utils::error::{ensure_same_shape, FcnError, Result};

pub use backbone::{ConvBackbone, ConvBackboneConfig};

/// Total downsampling of the coarsest tap
pub const ENCODER_STRIDE: usize = 32;

/// Number of input image channels (RGB)
pub const INPUT_CHANNELS: usize = 3;

/// Channel depth of each encoder tap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncoderChannels {
    pub stride8: usize,
    pub stride16: usize,
    pub stride32: usize,
}

/// The three intermediate outputs of the encoder, channels-first.
#[derive(Debug, Clone)]
pub struct FeatureMaps<B: Backend> {
    /// `[B, C8, H/8, W/8]`
    pub stride8: Tensor<B, 4>,
    /// `[B, C16, H/16, W/16]`
    pub stride16: Tensor<B, 4>,
    /// `[B, C32, H/32, W/32]`
    pub stride32: Tensor<B, 4>,
}

impl<B: Backend> FeatureMaps<B> {
    /// Verify every tap against the input it was computed from.
    pub fn check(&self, input_dims: [usize; 4], channels: EncoderChannels) -> Result<()> {
        let [batch, _, height, width] = input_dims;
        let taps = [
            ("encoder stride-8 tap", &self.stride8, channels.stride8, 8),
            ("encoder stride-16 tap", &self.stride16, channels.stride16, 16),
            ("encoder stride-32 tap", &self.stride32, channels.stride32, 32),
        ];
        for (stage, tensor, depth, stride) in taps {
            let expected = [batch, depth, height.div_ceil(stride), width.div_ceil(stride)];
            ensure_same_shape(stage, &expected, &tensor.dims())?;
        }
        Ok(())
    }

    /// Cut the taps out of the autodiff graph; the encoder is never trained.
    pub fn detach(self) -> Self {
        Self {
            stride8: self.stride8.detach(),
            stride16: self.stride16.detach(),
            stride32: self.stride32.detach(),
        }
    }
}

/// A frozen feature extractor exposing stride-8/16/32 taps.
pub trait Encoder<B: Backend> {
    /// Channel depth of each tap
    fn channels(&self) -> EncoderChannels;

    /// Run the encoder on `[B, 3, H, W]` images with the given dropout retention.
    ///
    /// Dropout masks are drawn from `rng`, so equal seeds give equal taps.
    fn encode(&self, images: Tensor<B, 4>, retention: f64, rng: &mut ChaCha8Rng) -> Result<FeatureMaps<B>>;
}

/// Retention must be a keep-probability in (0, 1].
pub fn check_retention(retention: f64) -> Result<()> {
    if !(retention > 0.0 && retention <= 1.0) {
        return Err(FcnError::Config(format!(
            "retention probability must be in (0, 1], got {}",
            retention
        )));
    }
    Ok(())
}

/// Input images must be RGB and a multiple of the encoder stride on both axes.
pub fn check_input_dims(dims: [usize; 4]) -> Result<()> {
    let [batch, channels, height, width] = dims;
    if batch == 0 {
        return Err(FcnError::Training("empty image batch".to_string()));
    }
    if channels != INPUT_CHANNELS {
        return Err(FcnError::ShapeMismatch {
            stage: "encoder input",
            expected: vec![batch, INPUT_CHANNELS, height, width],
            found: dims.to_vec(),
        });
    }
    if height == 0 || width == 0 || height % ENCODER_STRIDE != 0 || width % ENCODER_STRIDE != 0 {
        return Err(FcnError::Config(format!(
            "input {}x{} is not a positive multiple of {}",
            height, width, ENCODER_STRIDE
        )));
    }
    Ok(())
}
