//! Training module for the FCN decoder
//!
//! This module provides:
//! - The per-pixel cross-entropy objective with L2 weight penalty
//! - The model context owning decoder weights and optimizer state
//! - The epoch/batch training loop
//!
//! ## Update Rule
//!
//! Each batch runs once through the frozen encoder (dropout active at the
//! configured retention) and the decoder. The mean cross-entropy over all
//! pixels plus `1e-3 * sum(w^2) / 2` over the six decoder weights is
//! minimised with Adam at a learning rate supplied per step.

pub mod objective;
pub mod trainer;

// Re-export main types for convenience
pub use objective::{build_objective, Objective, ObjectiveConfig, ObjectiveOutput, L2_SCALE};
pub use trainer::{
    build_model, train, EpochReport, SegmentationModel, StepOutput, StepParams, TrainingSummary,
};

// Re-export TrainingConfig from model::config where it's defined
pub use crate::model::config::TrainingConfig;
