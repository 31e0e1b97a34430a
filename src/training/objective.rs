//! Training objective
//!
//! Flattens the `[B, K, H, W]` score map into one classification instance
//! per pixel, averages the softmax cross-entropy over all of them and adds
//! the L2 penalty of every decoder weight.

use burn::{
    config::Config,
    optim::{AdamConfig, Optimizer},
    tensor::{activation::log_softmax, backend::AutodiffBackend, backend::Backend, Tensor},
};

use crate::model::FcnDecoder;
use crate::utils::error::{self, ensure_same_shape, FcnError};

/// Coefficient of the L2 weight penalty
pub const L2_SCALE: f64 = 1e-3;

/// Adam epsilon
pub const ADAM_EPSILON: f32 = 1e-8;

/// Configuration for [`Objective`]
#[derive(Config, Debug)]
pub struct ObjectiveConfig {
    /// Number of classes on the score and label class axis
    pub num_classes: usize,

    /// Add the L2 weight penalty to the loss
    #[config(default = true)]
    pub regularize: bool,
}

/// Per-pixel softmax cross-entropy plus weight penalty
#[derive(Debug, Clone)]
pub struct Objective {
    num_classes: usize,
    regularize: bool,
}

/// Every term of one objective evaluation
#[derive(Debug, Clone)]
pub struct ObjectiveOutput<B: Backend> {
    /// `[B*H*W, K]`
    pub logits: Tensor<B, 2>,
    /// Mean cross-entropy over all pixels, `[1]`
    pub cross_entropy: Tensor<B, 1>,
    /// Weight penalty, `[1]`
    pub regularization: Tensor<B, 1>,
    /// `cross_entropy + regularization`, `[1]`
    pub loss: Tensor<B, 1>,
}

impl Objective {
    pub fn new(config: &ObjectiveConfig) -> error::Result<Self> {
        if config.num_classes == 0 {
            return Err(FcnError::Config("num_classes must be greater than 0".to_string()));
        }
        Ok(Self {
            num_classes: config.num_classes,
            regularize: config.regularize,
        })
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn regularize(&self) -> bool {
        self.regularize
    }

    /// `[B, K, H, W]` to `[B*H*W, K]`, rows ordered by (batch, row, column).
    pub fn flatten<B: Backend>(&self, map: Tensor<B, 4>, context: &'static str) -> error::Result<Tensor<B, 2>> {
        let [batch, classes, height, width] = map.dims();
        if classes != self.num_classes {
            return Err(FcnError::ClassCountMismatch {
                context,
                expected: self.num_classes,
                found: classes,
            });
        }
        Ok(map
            .permute([0, 2, 3, 1])
            .reshape([batch * height * width, classes]))
    }

    /// L2 penalty of the decoder weights, zero when regularization is off
    pub fn penalty<B: Backend>(&self, decoder: &FcnDecoder<B>) -> Tensor<B, 1> {
        let norm = decoder.squared_weight_norm();
        if self.regularize {
            norm.mul_scalar(L2_SCALE / 2.0)
        } else {
            Tensor::zeros([1], &norm.device())
        }
    }

    /// Score a decoder output against one-hot labels of the same shape.
    pub fn evaluate<B: Backend>(
        &self,
        decoder: &FcnDecoder<B>,
        scores: Tensor<B, 4>,
        labels: Tensor<B, 4>,
    ) -> error::Result<ObjectiveOutput<B>> {
        if decoder.num_classes() != self.num_classes {
            return Err(FcnError::ClassCountMismatch {
                context: "decoder output",
                expected: self.num_classes,
                found: decoder.num_classes(),
            });
        }
        let score_dims = scores.dims();
        let label_dims = labels.dims();

        let logits = self.flatten(scores, "class score map")?;
        let targets = self.flatten(labels, "label map")?;
        ensure_same_shape("label map", &score_dims, &label_dims)?;

        let cross_entropy = (targets * log_softmax(logits.clone(), 1))
            .sum_dim(1)
            .mean()
            .neg();
        let regularization = self.penalty(decoder);
        let loss = cross_entropy.clone() + regularization.clone();

        Ok(ObjectiveOutput {
            logits,
            cross_entropy,
            regularization,
            loss,
        })
    }
}

/// Build the objective and its Adam optimizer (default moments, learning rate per step).
pub fn build_objective<B: AutodiffBackend>(
    config: &ObjectiveConfig,
) -> error::Result<(Objective, impl Optimizer<FcnDecoder<B>, B>)> {
    let objective = Objective::new(config)?;
    let optimizer = AdamConfig::new()
        .with_beta_1(0.9)
        .with_beta_2(0.999)
        .with_epsilon(ADAM_EPSILON)
        .init();
    Ok((objective, optimizer))
}
