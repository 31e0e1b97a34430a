//! Skip-connected transposed-convolution decoder (FCN-8s style)
//!
//! Converts the stride-8/16/32 encoder taps into a full-resolution class
//! score map:
//!
//! ```text
//! stride32 -> 1x1 -> up x2 -+
//! stride16 -> 1x1 ----------+-> add -> up x2 -+
//! stride8  -> 1x1 ----------------------------+-> add -> up x8 -> [B, K, H, W]
//! ```
//!
//! All six weights are bias-free and contribute to the L2 penalty of the
//! training objective.

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig},
        Initializer,
    },
    tensor::{backend::Backend, Tensor},
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::encoder::{EncoderChannels, FeatureMaps, ENCODER_STRIDE};
use crate::utils::error::{self, ensure_same_shape, FcnError};
use crate::utils::format_shape;

/// Configuration for [`FcnDecoder`]
#[derive(Config, Debug)]
pub struct FcnDecoderConfig {
    /// Number of output classes
    pub num_classes: usize,

    /// Channel depth of the encoder taps
    pub encoder_channels: EncoderChannels,

    /// Transposed-convolution kernel per stage (coarse to fine)
    #[config(default = "[4, 4, 16]")]
    pub kernels: [usize; 3],

    /// Transposed-convolution stride per stage (coarse to fine)
    #[config(default = "[2, 2, 8]")]
    pub strides: [usize; 3],
}

/// Static spatial sizes of every decoder stage for one input resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecoderPlan {
    pub stride32: [usize; 2],
    pub fused16: [usize; 2],
    pub fused8: [usize; 2],
    pub output: [usize; 2],
}

impl FcnDecoderConfig {
    /// Cumulative upsampling of the three stages
    pub fn upsample_factor(&self) -> usize {
        self.strides.iter().product()
    }

    /// Check the configuration without allocating weights.
    pub fn validate(&self) -> error::Result<()> {
        if self.num_classes == 0 {
            return Err(FcnError::Config("num_classes must be greater than 0".to_string()));
        }
        let c = self.encoder_channels;
        if c.stride8 == 0 || c.stride16 == 0 || c.stride32 == 0 {
            return Err(FcnError::Config(
                "encoder channel counts must be positive".to_string(),
            ));
        }
        for (&kernel, &stride) in self.kernels.iter().zip(self.strides.iter()) {
            same_transpose_padding(kernel, stride)?;
        }
        if self.upsample_factor() != ENCODER_STRIDE {
            return Err(FcnError::Config(format!(
                "decoder upsamples by {} but the encoder downsamples by {}",
                self.upsample_factor(),
                ENCODER_STRIDE
            )));
        }
        Ok(())
    }

    /// Compute every stage's spatial size for a `height x width` input and
    /// reject any fusion or output that would not line up.
    pub fn plan(&self, height: usize, width: usize) -> error::Result<DecoderPlan> {
        if height == 0 || width == 0 || height % ENCODER_STRIDE != 0 || width % ENCODER_STRIDE != 0 {
            return Err(FcnError::Config(format!(
                "input {}x{} is not a positive multiple of {}",
                height, width, ENCODER_STRIDE
            )));
        }
        let at = |stride: usize| [height / stride, width / stride];

        let stride32 = at(32);
        let fused16 = self.upsample(0, stride32)?;
        ensure_same_shape("stride-16 fusion", &at(16), &fused16)?;

        let fused8 = self.upsample(1, fused16)?;
        ensure_same_shape("stride-8 fusion", &at(8), &fused8)?;

        let output = self.upsample(2, fused8)?;
        ensure_same_shape("score map", &[height, width], &output)?;

        Ok(DecoderPlan {
            stride32,
            fused16,
            fused8,
            output,
        })
    }

    fn upsample(&self, stage: usize, size: [usize; 2]) -> error::Result<[usize; 2]> {
        let (kernel, stride) = (self.kernels[stage], self.strides[stage]);
        let (pad, pad_out) = same_transpose_padding(kernel, stride)?;
        Ok(size.map(|n| transposed_output_size(n, kernel, stride, pad, pad_out)))
    }

    /// Allocate the decoder weights
    pub fn init<B: Backend>(&self, device: &B::Device) -> error::Result<FcnDecoder<B>> {
        self.validate()?;
        let k = self.num_classes;
        let c = self.encoder_channels;

        let decoder = FcnDecoder {
            score32: score_projection(c.stride32, k, device),
            up32: self.upsampler(0, device)?,
            score16: score_projection(c.stride16, k, device),
            up16: self.upsampler(1, device)?,
            score8: score_projection(c.stride8, k, device),
            up8: self.upsampler(2, device)?,
            num_classes: k,
            stride8_channels: c.stride8,
            stride16_channels: c.stride16,
            stride32_channels: c.stride32,
        };
        debug!(
            "Decoder initialised: {} classes, {} parameters",
            k,
            decoder.num_params()
        );
        Ok(decoder)
    }

    fn upsampler<B: Backend>(&self, stage: usize, device: &B::Device) -> error::Result<ConvTranspose2d<B>> {
        let (kernel, stride) = (self.kernels[stage], self.strides[stage]);
        let (pad, pad_out) = same_transpose_padding(kernel, stride)?;
        let k = self.num_classes;

        let mut conv = ConvTranspose2dConfig::new([k, k], [kernel, kernel])
            .with_stride([stride, stride])
            .with_padding([pad, pad])
            .with_padding_out([pad_out, pad_out])
            .with_bias(false)
            .init(device);

        // burn passes no fan-out for transposed convs, Xavier needs both
        let fan = k * kernel * kernel;
        conv.weight = Initializer::XavierUniform { gain: 1.0 }.init_with(
            [k, k, kernel, kernel],
            Some(fan),
            Some(fan),
            device,
        );
        Ok(conv)
    }
}

fn score_projection<B: Backend>(in_channels: usize, num_classes: usize, device: &B::Device) -> Conv2d<B> {
    Conv2dConfig::new([in_channels, num_classes], [1, 1])
        .with_bias(false)
        .with_initializer(Initializer::XavierUniform { gain: 1.0 })
        .init(device)
}

/// Padding giving a transposed convolution an output of exactly `n * stride`.
///
/// Returns `(padding, padding_out)`; odd total padding puts the extra row on
/// the trailing edge through `padding_out`.
pub fn same_transpose_padding(kernel: usize, stride: usize) -> error::Result<(usize, usize)> {
    if stride == 0 || kernel < stride {
        return Err(FcnError::Config(format!(
            "transposed conv kernel {} must be >= stride {} > 0",
            kernel, stride
        )));
    }
    let total = kernel - stride;
    let pad = total.div_ceil(2);
    let pad_out = 2 * pad - total;
    if pad_out >= stride {
        return Err(FcnError::Config(format!(
            "kernel {} / stride {} cannot be padded to 'same'",
            kernel, stride
        )));
    }
    Ok((pad, pad_out))
}

/// Spatial output size of a transposed convolution
pub fn transposed_output_size(n: usize, kernel: usize, stride: usize, pad: usize, pad_out: usize) -> usize {
    (n.saturating_sub(1)) * stride + kernel + pad_out - 2 * pad
}

/// Skip-connected decoder producing per-pixel class scores
#[derive(Module, Debug)]
pub struct FcnDecoder<B: Backend> {
    pub score32: Conv2d<B>,
    pub up32: ConvTranspose2d<B>,
    pub score16: Conv2d<B>,
    pub up16: ConvTranspose2d<B>,
    pub score8: Conv2d<B>,
    pub up8: ConvTranspose2d<B>,
    num_classes: usize,
    stride8_channels: usize,
    stride16_channels: usize,
    stride32_channels: usize,
}

impl<B: Backend> FcnDecoder<B> {
    /// Decode the encoder taps into a `[B, K, H, W]` score map.
    pub fn forward(&self, features: FeatureMaps<B>) -> error::Result<Tensor<B, 4>> {
        self.check_depths(&features)?;

        // Stage A: stride 32 -> 16
        let coarse = self.score32.forward(features.stride32);
        let up = self.up32.forward(coarse);

        // Stage B: fuse stride-16 skip, 16 -> 8
        let skip16 = self.score16.forward(features.stride16);
        let fused16 = fuse("stride-16 fusion", up, skip16)?;
        let up = self.up16.forward(fused16);

        // Stage C: fuse stride-8 skip, 8 -> 1
        let skip8 = self.score8.forward(features.stride8);
        let fused8 = fuse("stride-8 fusion", up, skip8)?;
        let scores = self.up8.forward(fused8);

        debug!("Decoder output: {}", format_shape(&scores.dims()));
        Ok(scores)
    }

    fn check_depths(&self, features: &FeatureMaps<B>) -> error::Result<()> {
        let taps = [
            ("stride-8 projection input", &features.stride8, self.stride8_channels),
            ("stride-16 projection input", &features.stride16, self.stride16_channels),
            ("stride-32 projection input", &features.stride32, self.stride32_channels),
        ];
        for (stage, tensor, depth) in taps {
            let found = tensor.dims()[1];
            if found != depth {
                return Err(FcnError::ShapeMismatch {
                    stage,
                    expected: vec![depth],
                    found: vec![found],
                });
            }
        }
        Ok(())
    }

    /// Sum of squared entries over all six weights
    pub fn squared_weight_norm(&self) -> Tensor<B, 1> {
        let squared = |w: Tensor<B, 4>| (w.clone() * w).sum();

        [
            self.up32.weight.val(),
            self.score16.weight.val(),
            self.up16.weight.val(),
            self.score8.weight.val(),
            self.up8.weight.val(),
        ]
        .into_iter()
        .fold(squared(self.score32.weight.val()), |acc, w| acc + squared(w))
    }

    /// Get the number of output classes
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }
}

/// Element-wise addition of two stage outputs with an exact shape check.
fn fuse<B: Backend>(stage: &'static str, upsampled: Tensor<B, 4>, skip: Tensor<B, 4>) -> error::Result<Tensor<B, 4>> {
    ensure_same_shape(stage, &skip.dims(), &upsampled.dims())?;
    Ok(upsampled + skip)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::ElementConversion;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    const CHANNELS: EncoderChannels = EncoderChannels {
        stride8: 8,
        stride16: 16,
        stride32: 32,
    };

    fn features(batch: usize, height: usize, width: usize) -> FeatureMaps<TestBackend> {
        let device = Default::default();
        let tap = |c: usize, s: usize| {
            Tensor::<TestBackend, 4>::random(
                [batch, c, height / s, width / s],
                burn::tensor::Distribution::Normal(0.0, 1.0),
                &device,
            )
        };
        FeatureMaps {
            stride8: tap(CHANNELS.stride8, 8),
            stride16: tap(CHANNELS.stride16, 16),
            stride32: tap(CHANNELS.stride32, 32),
        }
    }

    #[test]
    fn test_output_matches_input_resolution() {
        let device = Default::default();
        for num_classes in [1, 2, 3] {
            let decoder = FcnDecoderConfig::new(num_classes, CHANNELS)
                .init::<TestBackend>(&device)
                .unwrap();
            let scores = decoder.forward(features(2, 64, 96)).unwrap();
            assert_eq!(scores.dims(), [2, num_classes, 64, 96]);
        }
    }

    #[test]
    fn test_kitti_resolution_plan() {
        let plan = FcnDecoderConfig::new(2, CHANNELS).plan(160, 576).unwrap();
        assert_eq!(plan.stride32, [5, 18]);
        assert_eq!(plan.fused16, [10, 36]);
        assert_eq!(plan.fused8, [20, 72]);
        assert_eq!(plan.output, [160, 576]);
    }

    #[test]
    fn test_cumulative_upsampling_is_32() {
        let config = FcnDecoderConfig::new(2, CHANNELS);
        assert_eq!(config.upsample_factor(), 32);
        assert_eq!(config.upsample_factor(), ENCODER_STRIDE);
    }

    #[test]
    fn test_same_padding_doubles_and_octuples() {
        assert_eq!(same_transpose_padding(4, 2).unwrap(), (1, 0));
        assert_eq!(same_transpose_padding(16, 8).unwrap(), (4, 0));
        assert_eq!(same_transpose_padding(3, 2).unwrap(), (1, 1));
        assert_eq!(transposed_output_size(5, 4, 2, 1, 0), 10);
        assert_eq!(transposed_output_size(20, 16, 8, 4, 0), 160);
        assert_eq!(transposed_output_size(5, 3, 2, 1, 1), 10);
        assert!(same_transpose_padding(2, 4).is_err());
        assert!(same_transpose_padding(2, 1).is_err());
    }

    #[test]
    fn test_wrong_strides_rejected_at_assembly() {
        let device = Default::default();
        let config = FcnDecoderConfig::new(2, CHANNELS).with_strides([2, 2, 4]).with_kernels([4, 4, 8]);
        assert!(matches!(
            config.plan(160, 576),
            Err(FcnError::ShapeMismatch { stage: "score map", .. })
        ));
        assert!(config.init::<TestBackend>(&device).is_err());

        let config = FcnDecoderConfig::new(2, CHANNELS).with_strides([4, 2, 4]).with_kernels([8, 4, 8]);
        assert!(matches!(
            config.plan(160, 576),
            Err(FcnError::ShapeMismatch { stage: "stride-16 fusion", .. })
        ));
    }

    #[test]
    fn test_zero_classes_rejected() {
        let device = Default::default();
        assert!(FcnDecoderConfig::new(0, CHANNELS).init::<TestBackend>(&device).is_err());
    }

    #[test]
    fn test_fusion_does_not_broadcast() {
        let device = Default::default();
        let decoder = FcnDecoderConfig::new(2, CHANNELS).init::<TestBackend>(&device).unwrap();
        let mut maps = features(2, 64, 96);
        // A single-row stride-16 map would silently broadcast without the check.
        maps.stride16 = Tensor::zeros([2, CHANNELS.stride16, 1, 6], &device);

        let err = decoder.forward(maps).unwrap_err();
        assert!(matches!(err, FcnError::ShapeMismatch { stage: "stride-16 fusion", .. }));
    }

    #[test]
    fn test_wrong_tap_depth_rejected() {
        let device = Default::default();
        let decoder = FcnDecoderConfig::new(2, CHANNELS).init::<TestBackend>(&device).unwrap();
        let mut maps = features(1, 32, 32);
        maps.stride8 = Tensor::zeros([1, 3, 4, 4], &device);

        assert!(matches!(
            decoder.forward(maps),
            Err(FcnError::ShapeMismatch { stage: "stride-8 projection input", .. })
        ));
    }

    #[test]
    fn test_six_bias_free_weights() {
        let device = Default::default();
        let k = 2;
        let decoder = FcnDecoderConfig::new(k, CHANNELS).init::<TestBackend>(&device).unwrap();

        assert!(decoder.score32.bias.is_none());
        assert!(decoder.up32.bias.is_none());
        assert!(decoder.score16.bias.is_none());
        assert!(decoder.up16.bias.is_none());
        assert!(decoder.score8.bias.is_none());
        assert!(decoder.up8.bias.is_none());

        let projections = k * (CHANNELS.stride8 + CHANNELS.stride16 + CHANNELS.stride32);
        let upsamplers = k * k * (4 * 4 + 4 * 4 + 16 * 16);
        assert_eq!(decoder.num_params(), projections + upsamplers);
    }

    #[test]
    fn test_default_config_initialises() {
        let device = Default::default();
        let decoder = FcnDecoderConfig::new(2, CHANNELS).init::<TestBackend>(&device);
        assert!(decoder.is_ok());

        let decoder = decoder.unwrap();
        assert_eq!(decoder.up32.weight.dims(), [2, 2, 4, 4]);
        assert_eq!(decoder.up16.weight.dims(), [2, 2, 4, 4]);
        assert_eq!(decoder.up8.weight.dims(), [2, 2, 16, 16]);

        // Xavier bound for fan_in = fan_out = 2 * 16 * 16
        let bound = (6.0f32 / (2.0 * 512.0)).sqrt();
        let max: f32 = decoder.up8.weight.val().abs().max().into_scalar().elem();
        assert!(max > 0.0);
        assert!(max <= bound + 1e-6);
    }

    #[test]
    fn test_squared_weight_norm_positive() {
        let device = Default::default();
        let decoder = FcnDecoderConfig::new(2, CHANNELS).init::<TestBackend>(&device).unwrap();
        let norm: f32 = decoder.squared_weight_norm().into_scalar().elem();
        assert!(norm > 0.0);
        assert!(norm.is_finite());
    }
}
