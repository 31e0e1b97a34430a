//! VGG-style convolutional backbone
//!
//! Five conv/pool blocks halve the resolution each time, followed by two
//! 1x1 "fully convolutional" layers with dropout. Taps are taken after
//! block 3 (stride 8), block 4 (stride 16) and the last 1x1 layer
//! (stride 32). The backbone is frozen once built.

use std::path::Path;

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        PaddingConfig2d, Relu,
    },
    record::CompactRecorder,
    tensor::{backend::Backend, Tensor, TensorData},
};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use tracing::info;

use super::{check_input_dims, check_retention, Encoder, EncoderChannels, FeatureMaps};
use crate::utils::error::{self, FcnError};

/// Configuration for the backbone
#[derive(Config, Debug)]
pub struct ConvBackboneConfig {
    /// Number of input channels (3 for RGB)
    #[config(default = "3")]
    pub in_channels: usize,

    /// Filters of the first block; doubled at every block up to block 4
    #[config(default = "16")]
    pub base_filters: usize,

    /// Width of the two 1x1 layers producing the stride-32 tap
    #[config(default = "128")]
    pub head_channels: usize,
}

impl ConvBackboneConfig {
    /// Channel depth of each tap for this configuration
    pub fn channels(&self) -> EncoderChannels {
        EncoderChannels {
            stride8: self.base_filters * 4,
            stride16: self.base_filters * 8,
            stride32: self.head_channels,
        }
    }

    /// Build a frozen backbone
    pub fn init<B: Backend>(&self, device: &B::Device) -> error::Result<ConvBackbone<B>> {
        if self.in_channels == 0 || self.base_filters == 0 || self.head_channels == 0 {
            return Err(FcnError::Config(
                "backbone channel counts must be positive".to_string(),
            ));
        }
        let base = self.base_filters;
        let channels = self.channels();

        let backbone = ConvBackbone {
            block1: ConvBlock::new(self.in_channels, base, device), // /2
            block2: ConvBlock::new(base, base * 2, device),         // /4
            block3: ConvBlock::new(base * 2, base * 4, device),     // /8
            block4: ConvBlock::new(base * 4, base * 8, device),     // /16
            block5: ConvBlock::new(base * 8, base * 8, device),     // /32
            fc6: Conv2dConfig::new([base * 8, self.head_channels], [1, 1]).init(device),
            fc7: Conv2dConfig::new([self.head_channels, self.head_channels], [1, 1]).init(device),
            stride8_channels: channels.stride8,
            stride16_channels: channels.stride16,
            stride32_channels: channels.stride32,
        };

        Ok(backbone.no_grad())
    }
}

/// A block with Conv2d, ReLU and a 2x2 MaxPool
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    pub conv: Conv2d<B>,
    pub relu: Relu,
    pub pool: MaxPool2d,
}

impl<B: Backend> ConvBlock<B> {
    /// Create a new convolutional block
    pub fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        let conv = Conv2dConfig::new([in_channels, out_channels], [3, 3])
            .with_padding(PaddingConfig2d::Same)
            .init(device);

        Self {
            conv,
            relu: Relu::new(),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
        }
    }

    /// Forward pass through the block
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.relu.forward(x);
        self.pool.forward(x)
    }
}

/// Frozen feature extractor
#[derive(Module, Debug)]
pub struct ConvBackbone<B: Backend> {
    pub block1: ConvBlock<B>,
    pub block2: ConvBlock<B>,
    pub block3: ConvBlock<B>,
    pub block4: ConvBlock<B>,
    pub block5: ConvBlock<B>,
    pub fc6: Conv2d<B>,
    pub fc7: Conv2d<B>,
    stride8_channels: usize,
    stride16_channels: usize,
    stride32_channels: usize,
}

impl<B: Backend> ConvBackbone<B> {
    /// Replace the random initialisation with weights stored by `CompactRecorder`.
    pub fn load_pretrained(self, path: &Path, device: &B::Device) -> error::Result<Self> {
        if !path.exists() {
            return Err(FcnError::PathNotFound(path.to_path_buf()));
        }
        info!("Loading pretrained backbone from {:?}", path);
        let recorder = CompactRecorder::new();
        let loaded = self
            .load_file(path.to_path_buf(), &recorder, device)
            .map_err(|e| FcnError::Model(format!("Failed to load backbone weights: {:?}", e)))?;
        Ok(loaded.no_grad())
    }
}

impl<B: Backend> Encoder<B> for ConvBackbone<B> {
    fn channels(&self) -> EncoderChannels {
        EncoderChannels {
            stride8: self.stride8_channels,
            stride16: self.stride16_channels,
            stride32: self.stride32_channels,
        }
    }

    fn encode(
        &self,
        images: Tensor<B, 4>,
        retention: f64,
        rng: &mut ChaCha8Rng,
    ) -> error::Result<FeatureMaps<B>> {
        check_retention(retention)?;
        let input_dims = images.dims();
        check_input_dims(input_dims)?;

        let x = self.block1.forward(images);
        let x = self.block2.forward(x);
        let stride8 = self.block3.forward(x);
        let stride16 = self.block4.forward(stride8.clone());
        let x = self.block5.forward(stride16.clone());

        let x = Relu::new().forward(self.fc6.forward(x));
        let x = retain(x, retention, rng);
        let x = Relu::new().forward(self.fc7.forward(x));
        let stride32 = retain(x, retention, rng);

        let features = FeatureMaps {
            stride8,
            stride16,
            stride32,
        };
        features.check(input_dims, self.channels())?;
        Ok(features)
    }
}

/// Inverted dropout with keep-probability `retention`
fn retain<B: Backend>(x: Tensor<B, 4>, retention: f64, rng: &mut ChaCha8Rng) -> Tensor<B, 4> {
    if retention >= 1.0 {
        return x;
    }
    let dims = x.dims();
    let scale = (1.0 / retention) as f32;
    let mask: Vec<f32> = (0..dims.iter().product::<usize>())
        .map(|_| if rng.gen_bool(retention) { scale } else { 0.0 })
        .collect();
    let mask = Tensor::<B, 4>::from_floats(TensorData::new(mask, dims), &x.device());
    x.mul(mask)
}
