//! routenet core - tensors, plain layers, optimisation and shared errors
//!
//! This crate provides the building blocks the routing layers in
//! `routenet-rl` are composed from. Gradients are computed by explicit
//! backward passes, one per layer.

// Clippy pedantic allows - these are intentional design choices
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::many_single_char_names)]

pub mod conv;
pub mod error;
pub mod layers;
pub mod ops;
pub mod optim;
pub mod param;

pub use conv::{BatchNorm2d, Conv2d, MaxPool2d, SimpleConvBlock};
pub use error::{Result, RoutingError};
pub use layers::{Flatten, Layer, LayerStack, Linear, LinearWithRelu, Relu};
pub use optim::{GradClipper, Sgd};
pub use param::Param;
