//! routenet RL - routing layers trained with reinforcement signals
//!
//! This crate provides the initialization, decision, selection and loss
//! layers of a routing network, the decision algorithms that train the
//! routing policy, the reward functions, and the `Sequential` container
//! that threads the routing triplet through them.

// Clippy pedantic allows - these are intentional design choices
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::float_cmp)]
#![allow(clippy::similar_names)]
#![allow(clippy::module_name_repetitions)]

pub mod algorithm;
pub mod decision;
pub mod initialization;
pub mod layer;
pub mod loss;
pub mod meta;
pub mod reward;
pub mod selection;
pub mod sequential;

pub use algorithm::{AlgorithmKind, PolicyAlgorithm};
pub use decision::{Decision, DecisionMaker, PerTaskAssignment, PolicyStorage};
pub use initialization::Initialization;
pub use layer::{ParamGroup, RoutingLayer, RoutingLayerKind, SelectionLog};
pub use loss::{BatchLoss, RoutingLoss};
pub use meta::{Actions, DecisionId, DecisionRecord, RoutingMeta, SampleMeta, Transition};
pub use reward::{CollaborationReward, CorrectClassifiedReward, FinalReward, NegLossReward, PerActionReward};
pub use selection::Selection;
pub use sequential::{Sequential, SequentialLayer};
