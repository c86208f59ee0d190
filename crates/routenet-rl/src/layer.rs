//! The routing-layer contract shared by decisions and selections

use std::collections::BTreeMap;

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

use routenet_core::{Param, Result};

use crate::meta::{Actions, RoutingMeta};

/// Which side of a (decision, selection) pair a routing layer is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingLayerKind {
    Decision,
    Selection,
}

/// Parameter partition used to give the policy its own optimiser
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamGroup {
    All,
    /// Decision (policy) parameters
    Routing,
    /// Selection modules and plain layers
    Module,
}

impl ParamGroup {
    /// Whether parameters of a layer of `kind` belong to this group
    pub fn includes(&self, kind: Option<RoutingLayerKind>) -> bool {
        match self {
            ParamGroup::All => true,
            ParamGroup::Routing => kind == Some(RoutingLayerKind::Decision),
            ParamGroup::Module => kind != Some(RoutingLayerKind::Decision),
        }
    }
}

/// Module usage recorded by a selection while logging was on
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionLog {
    /// module index -> number of samples routed to it
    pub counts: BTreeMap<usize, usize>,
}

impl SelectionLog {
    pub fn modules_used(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

/// A layer that consumes and produces the routing triplet `(y, meta, actions)`.
pub trait RoutingLayer: Send {
    fn name(&self) -> &str;

    fn kind(&self) -> RoutingLayerKind;

    fn forward(
        &mut self,
        y: &ArrayD<f32>,
        meta: &mut RoutingMeta,
        actions: &[usize],
    ) -> Result<(ArrayD<f32>, Actions)>;

    /// Backward for the tensor path; decisions also apply the policy
    /// gradients prepared by `routing_loss` here.
    fn backward(&mut self, grad: &ArrayD<f32>) -> Result<ArrayD<f32>>;

    /// Routing loss of this layer for a batch whose returns are assigned.
    fn routing_loss(&mut self, _meta: &RoutingMeta) -> Result<f32> {
        Ok(0.0)
    }

    fn visit_params(&mut self, _f: &mut dyn FnMut(&mut Param)) {}

    fn set_training(&mut self, _training: bool) {}

    fn start_logging_selections(&mut self) {}

    fn stop_logging_and_get_selections(&mut self) -> Option<SelectionLog> {
        None
    }
}
