//! routenet training - model builders, datasets and the training loop
//!
//! This crate assembles routing networks from the layers of `routenet-core`
//! and `routenet-rl`, serves multi-task batches, and trains models epoch by
//! epoch with separate routing and module optimizers.

// Clippy pedantic allows - these are intentional design choices
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::float_cmp)]

pub mod dataset;
pub mod models;
pub mod trainer;

pub use dataset::{Batch, DatasetSplit, InMemoryMtl, MultiTaskDataset, SyntheticConfig, SyntheticMtl};
pub use models::{
    trunk_output_width, ModelConfig, ModelKind, PerTaskNetwork, RoutedAllFc, RoutedNetwork,
    SelectionReport,
};
pub use trainer::{EpochReport, LearningRateStep, PhaseStats, RunReport, Trainer, TrainingConfig};
