//! Training Configuration Module
//!
//! Run-level settings: dataset geometry, optimisation hyperparameters,
//! backbone size and output locations. Model hyperparameters live next to
//! the modules they configure (`FcnDecoderConfig`, `ConvBackboneConfig`).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::encoder::{ConvBackboneConfig, ENCODER_STRIDE};
use crate::utils::error::{FcnError, Result};

/// How the per-epoch diagnostic normalises the accumulated batch losses
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LossReport {
    /// Sum of batch losses divided by the number of batches
    #[default]
    MeanPerBatch,
    /// Sum of batch losses divided by the batch size (historical diagnostic)
    PerBatchSize,
}

impl LossReport {
    /// Normalise an epoch's accumulated loss
    pub fn reduce(self, loss_sum: f64, batches: usize, batch_size: usize) -> f64 {
        let denominator = match self {
            LossReport::MeanPerBatch => batches,
            LossReport::PerBatchSize => batch_size,
        };
        if denominator == 0 {
            0.0
        } else {
            loss_sum / denominator as f64
        }
    }
}

/// Backbone settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackboneSettings {
    /// Filters of the first conv block
    pub base_filters: usize,
    /// Width of the stride-32 head
    pub head_channels: usize,
    /// Optional pretrained weights (burn CompactRecorder file)
    pub weights: Option<PathBuf>,
}

impl Default for BackboneSettings {
    fn default() -> Self {
        Self {
            base_filters: 16,
            head_channels: 128,
            weights: None,
        }
    }
}

impl BackboneSettings {
    pub fn to_config(&self) -> ConvBackboneConfig {
        ConvBackboneConfig::new()
            .with_base_filters(self.base_filters)
            .with_head_channels(self.head_channels)
    }
}

/// Training configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrainingConfig {
    /// Number of training epochs
    pub epochs: usize,

    /// Batch size for training
    pub batch_size: usize,

    /// Learning rate fed to every update
    pub learning_rate: f64,

    /// Dropout keep-probability fed to the encoder during training
    pub retention: f64,

    /// Number of segmentation classes
    pub num_classes: usize,

    /// Input image size as (height, width)
    pub image_shape: (usize, usize),

    /// Add the L2 weight penalty to the loss
    pub regularize: bool,

    /// Epoch loss normalisation
    pub loss_report: LossReport,

    /// Random seed for batch shuffling and dropout masks
    pub seed: u64,

    /// Dataset root
    pub data_dir: PathBuf,

    /// Output directory for run artifacts
    pub runs_dir: PathBuf,

    /// Backbone size and weights
    pub backbone: BackboneSettings,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 20,
            batch_size: 4,
            learning_rate: 0.001,
            retention: 0.5,
            num_classes: crate::NUM_CLASSES,
            image_shape: crate::IMAGE_SHAPE,
            regularize: true,
            loss_report: LossReport::MeanPerBatch,
            seed: 42,
            data_dir: PathBuf::from("./data"),
            runs_dir: PathBuf::from("./runs"),
            backbone: BackboneSettings::default(),
        }
    }
}

impl TrainingConfig {
    /// Small, fast settings for debugging
    pub fn debug() -> Self {
        Self {
            epochs: 2,
            batch_size: 2,
            image_shape: (64, 192),
            backbone: BackboneSettings {
                base_filters: 4,
                head_channels: 16,
                weights: None,
            },
            ..Default::default()
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 {
            return Err(FcnError::Config("epochs must be greater than 0".to_string()));
        }

        if self.batch_size == 0 {
            return Err(FcnError::Config("batch_size must be greater than 0".to_string()));
        }

        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            return Err(FcnError::Config("learning_rate must be positive".to_string()));
        }

        if !(self.retention > 0.0 && self.retention <= 1.0) {
            return Err(FcnError::Config("retention must be in range (0.0, 1.0]".to_string()));
        }

        if self.num_classes == 0 {
            return Err(FcnError::Config("num_classes must be greater than 0".to_string()));
        }

        let (height, width) = self.image_shape;
        if height == 0 || width == 0 || height % ENCODER_STRIDE != 0 || width % ENCODER_STRIDE != 0 {
            return Err(FcnError::Config(format!(
                "image_shape must be a positive multiple of {} on both axes, got {}x{}",
                ENCODER_STRIDE, height, width
            )));
        }

        if self.backbone.base_filters == 0 || self.backbone.head_channels == 0 {
            return Err(FcnError::Config("backbone widths must be positive".to_string()));
        }

        Ok(())
    }

    /// Save configuration to a JSON file
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Load configuration from a TOML file; missing keys keep their defaults
    pub fn load_toml(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            FcnError::Config(format!("Failed to read config {}: {e}", path.display()))
        })?;
        Ok(toml::from_str(&content)?)
    }

    /// Load JSON or TOML based on the file extension
    pub fn from_file(path: &Path) -> Result<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::load_toml(path),
            Some("json") => Self::load(path),
            _ => Err(FcnError::Config(format!(
                "unsupported config format: {}",
                path.display()
            ))),
        }
    }
}
