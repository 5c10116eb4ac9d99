//! Training-target construction.
//!
//! Nothing here computes losses or gradients; the output is handed straight
//! to the sequence model's training forward pass.

pub mod policy;
pub mod targets;

pub use policy::{LevelDistribution, MaskingRatio, TrainingPolicy, TrainingRegime};
pub use targets::{build_targets, TrainingBatch};
