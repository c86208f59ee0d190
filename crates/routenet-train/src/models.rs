//! Model builders: a convolutional trunk followed by routed fully-connected banks
//!
//! Four reference architectures are provided:
//! - `per_task_all_fc`: every fc layer is a selection indexed by task
//! - `per_task_1_fc`: shared fc layers, only the output layer is per task
//! - `routed_all_fc`: learned task assignment plus one learned decision per fc layer
//! - `per_decision_single_agent`: one single-agent decision per fc layer, no
//!   task information

use std::fmt;
use std::str::FromStr;

use ndarray::{ArrayD, ArrayView2};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

use routenet_core::{
    BatchNorm2d, Flatten, Layer, LayerStack, Linear, LinearWithRelu, Param, Result, RoutingError,
    SimpleConvBlock,
};
use routenet_rl::{
    AlgorithmKind, BatchLoss, CollaborationReward, CorrectClassifiedReward, Decision, DecisionMaker,
    FinalReward, Initialization, NegLossReward, ParamGroup, PerTaskAssignment, PolicyStorage,
    RoutingLayer, RoutingLoss, RoutingMeta, Selection, Sequential, SequentialLayer,
};

/// Channels of every trunk convolution
const TRUNK_CHANNELS: usize = 32;
/// Width of the hidden fc layers
const HIDDEN: usize = 48;
/// Share of the collaboration bonus in the per-action reward
const COLLABORATION_RATIO: f32 = 0.3;

/// Module usage of every selection layer that saw samples while logging
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionReport {
    pub modules_used: Vec<usize>,
}

impl fmt::Display for SelectionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let used: Vec<String> = self.modules_used.iter().map(ToString::to_string).collect();
        write!(f, "{}", used.join(", "))
    }
}

/// A complete routing network: trunk, routed part and loss.
pub trait RoutedNetwork: Send {
    fn name(&self) -> &str;

    /// `x` is `[N, C, H, W]`; `tasks` holds one task label per sample.
    fn forward(&mut self, x: &ArrayD<f32>, tasks: &[usize]) -> Result<(ArrayD<f32>, RoutingMeta)>;

    /// Returns `(module_loss, decision_loss, batch)`; writes returns into `meta`
    /// and prepares the policy gradients applied by the next `backward`.
    fn loss(
        &mut self,
        prediction: &ArrayD<f32>,
        targets: ArrayView2<f32>,
        meta: &mut RoutingMeta,
    ) -> Result<(f32, f32, BatchLoss)>;

    /// Backpropagate module and decision losses into parameter gradients.
    fn backward(&mut self, loss: &BatchLoss) -> Result<()>;

    /// `Routing` and `Module` fail with `MissingParameterSplit` on models
    /// that do not partition their parameters.
    fn visit_parameters(&mut self, group: ParamGroup, f: &mut dyn FnMut(&mut Param)) -> Result<()>;

    fn set_training(&mut self, training: bool);

    fn start_logging_selections(&mut self);

    fn stop_logging_selections_and_report(&mut self) -> SelectionReport;

    /// Scalar parameter count over `ParamGroup::All`
    fn num_parameters(&mut self) -> Result<usize> {
        let mut n = 0;
        self.visit_parameters(ParamGroup::All, &mut |p| n += p.len())?;
        Ok(n)
    }
}

/// Which architecture to build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelKind {
    PerTaskAllFc,
    PerTask1Fc,
    RoutedAllFc,
    PerDecisionSingleAgent,
}

impl ModelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::PerTaskAllFc => "per-task-all-fc",
            ModelKind::PerTask1Fc => "per-task-1-fc",
            ModelKind::RoutedAllFc => "routed-all-fc",
            ModelKind::PerDecisionSingleAgent => "per-decision-single-agent",
        }
    }

    /// Modules indexed by task label, one per task
    pub fn routes_by_task(&self) -> bool {
        matches!(self, ModelKind::PerTaskAllFc | ModelKind::PerTask1Fc)
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelKind {
    type Err = RoutingError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "per-task-all-fc" => Ok(ModelKind::PerTaskAllFc),
            "per-task-1-fc" => Ok(ModelKind::PerTask1Fc),
            "routed-all-fc" => Ok(ModelKind::RoutedAllFc),
            "per-decision-single-agent" => Ok(ModelKind::PerDecisionSingleAgent),
            other => Err(RoutingError::Config(format!("Unknown model: {other}"))),
        }
    }
}

/// Model construction parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_kind")]
    pub kind: ModelKind,

    /// Decision algorithm of the learned routing models
    #[serde(default = "default_decision")]
    pub decision: AlgorithmKind,

    /// Hyper-parameters handed to the decision algorithm
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub decision_params: serde_json::Value,

    #[serde(default = "default_storage")]
    pub storage: PolicyStorage,

    #[serde(default = "default_in_channels")]
    pub in_channels: usize,

    /// Flattened width of the trunk output
    #[serde(default = "default_convnet_out_size")]
    pub convnet_out_size: usize,

    /// Number of output classes
    #[serde(default = "default_out_dim")]
    pub out_dim: usize,

    #[serde(default = "default_num_modules")]
    pub num_modules: usize,

    #[serde(default = "default_num_agents")]
    pub num_agents: usize,
}

fn default_kind() -> ModelKind {
    ModelKind::RoutedAllFc
}
fn default_decision() -> AlgorithmKind {
    AlgorithmKind::Wpl
}
fn default_storage() -> PolicyStorage {
    PolicyStorage::Approx
}
fn default_in_channels() -> usize {
    1
}
fn default_convnet_out_size() -> usize {
    TRUNK_CHANNELS
}
fn default_out_dim() -> usize {
    2
}
fn default_num_modules() -> usize {
    4
}
fn default_num_agents() -> usize {
    4
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            kind: default_kind(),
            decision: default_decision(),
            decision_params: serde_json::Value::Null,
            storage: default_storage(),
            in_channels: default_in_channels(),
            convnet_out_size: default_convnet_out_size(),
            out_dim: default_out_dim(),
            num_modules: default_num_modules(),
            num_agents: default_num_agents(),
        }
    }
}

impl ModelConfig {
    pub fn decision_maker(&self) -> DecisionMaker {
        DecisionMaker::new(self.decision).with_params(self.decision_params.clone())
    }

    pub fn build<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Box<dyn RoutedNetwork>> {
        if self.num_modules == 0 || self.num_agents == 0 || self.out_dim == 0 {
            return Err(RoutingError::Config(
                "num_modules, num_agents and out_dim must be positive".to_string(),
            ));
        }
        let model: Box<dyn RoutedNetwork> = match self.kind {
            ModelKind::PerTaskAllFc => Box::new(PerTaskNetwork::all_fc(self, rng)),
            ModelKind::PerTask1Fc => Box::new(PerTaskNetwork::last_fc(self, rng)),
            ModelKind::RoutedAllFc => Box::new(RoutedAllFc::new(&self.decision_maker(), self, rng)?),
            ModelKind::PerDecisionSingleAgent => {
                Box::new(PerDecisionSingleAgent::new(&self.decision_maker(), self, rng)?)
            }
        };
        Ok(model)
    }
}

/// Flattened trunk output for square `image_size` inputs; each conv block
/// halves the side.
pub fn trunk_output_width(image_size: usize) -> usize {
    let side = image_size >> 4;
    TRUNK_CHANNELS * side * side
}

/// 4 conv blocks, batch norm and flatten.
fn conv_trunk<R: Rng + ?Sized>(in_channels: usize, rng: &mut R) -> Vec<Box<dyn Layer>> {
    vec![
        Box::new(SimpleConvBlock::new(in_channels, TRUNK_CHANNELS, 3, rng)),
        Box::new(SimpleConvBlock::new(TRUNK_CHANNELS, TRUNK_CHANNELS, 3, rng)),
        Box::new(SimpleConvBlock::new(TRUNK_CHANNELS, TRUNK_CHANNELS, 3, rng)),
        Box::new(SimpleConvBlock::new(TRUNK_CHANNELS, TRUNK_CHANNELS, 3, rng)),
        Box::new(BatchNorm2d::new(TRUNK_CHANNELS)),
        Box::new(Flatten::new()),
    ]
}

/// One module per `num_modules` produced by `make`.
fn bank<R: Rng + ?Sized>(
    num_modules: usize,
    rng: &mut R,
    mut make: impl FnMut(&mut R) -> Box<dyn Layer>,
) -> Selection {
    Selection::new((0..num_modules).map(|_| make(rng)).collect())
}

/// A decision with `num_agents` agents followed by the selection it routes into.
fn routed_stage<R: Rng + ?Sized>(
    maker: &DecisionMaker,
    config: &ModelConfig,
    num_agents: usize,
    in_width: usize,
    rng: &mut R,
    make: impl FnMut(&mut R) -> Box<dyn Layer>,
) -> Result<(Decision, Selection)> {
    let n = config.num_modules;
    let decision = maker.build(
        n,
        in_width,
        num_agents,
        config.storage,
        Some(Box::new(CollaborationReward::new(COLLABORATION_RATIO, n))),
        rng,
    )?;
    Ok((decision, bank(n, rng, make)))
}

/// The three routed fc stages shared by the learned routing models.
fn fc_stages<R: Rng + ?Sized>(
    maker: &DecisionMaker,
    config: &ModelConfig,
    num_agents: usize,
    rng: &mut R,
) -> Result<Vec<(Decision, Selection)>> {
    let (conv, out) = (config.convnet_out_size, config.out_dim);
    Ok(vec![
        routed_stage(maker, config, num_agents, conv, rng, |r| {
            Box::new(LinearWithRelu::new(conv, HIDDEN, r)) as Box<dyn Layer>
        })?,
        routed_stage(maker, config, num_agents, HIDDEN, rng, |r| {
            Box::new(LinearWithRelu::new(HIDDEN, HIDDEN, r)) as Box<dyn Layer>
        })?,
        routed_stage(maker, config, num_agents, HIDDEN, rng, |r| {
            Box::new(Linear::new(HIDDEN, out, r)) as Box<dyn Layer>
        })?,
    ])
}

fn report(name: &str, logs: impl IntoIterator<Item = routenet_rl::SelectionLog>) -> SelectionReport {
    let report = SelectionReport {
        modules_used: logs
            .into_iter()
            .filter(|log| !log.is_empty())
            .map(|log| log.modules_used())
            .collect(),
    };
    info!(model = name, "Modules used: {}", report);
    report
}

/// Task-indexed model: modules are chosen by task label, nothing is learned
/// about routing.
pub struct PerTaskNetwork {
    name: &'static str,
    trunk: LayerStack,
    routed: Sequential,
    loss: RoutingLoss,
}

impl PerTaskNetwork {
    /// Every fc layer is a per-task selection; MSE with negative-loss reward.
    pub fn all_fc<R: Rng + ?Sized>(config: &ModelConfig, rng: &mut R) -> Self {
        let trunk = LayerStack::new("trunk", conv_trunk(config.in_channels, rng));
        let (conv, out, n) = (config.convnet_out_size, config.out_dim, config.num_modules);
        let routed = Sequential::new(vec![
            SequentialLayer::routing(PerTaskAssignment::new()),
            SequentialLayer::routing(bank(n, rng, |r| {
                Box::new(LinearWithRelu::new(conv, HIDDEN, r)) as Box<dyn Layer>
            })),
            SequentialLayer::routing(bank(n, rng, |r| {
                Box::new(LinearWithRelu::new(HIDDEN, HIDDEN, r)) as Box<dyn Layer>
            })),
            SequentialLayer::routing(bank(n, rng, |r| {
                Box::new(Linear::new(HIDDEN, out, r)) as Box<dyn Layer>
            })),
        ]);
        info!(model = "per-task-all-fc", modules = n, "Per task exclusive: all fc");
        Self::assemble("per-task-all-fc", trunk, routed, Box::new(NegLossReward))
    }

    /// Shared hidden fc layers, per-task output layer; MSE with
    /// correct-classification reward.
    pub fn last_fc<R: Rng + ?Sized>(config: &ModelConfig, rng: &mut R) -> Self {
        let mut trunk = LayerStack::new("trunk", conv_trunk(config.in_channels, rng));
        trunk.push(Box::new(LinearWithRelu::new(config.convnet_out_size, HIDDEN, rng)));
        trunk.push(Box::new(LinearWithRelu::new(HIDDEN, HIDDEN, rng)));
        let out = config.out_dim;
        let routed = Sequential::new(vec![
            SequentialLayer::routing(PerTaskAssignment::new()),
            SequentialLayer::routing(bank(config.num_modules, rng, |r| {
                Box::new(Linear::new(HIDDEN, out, r)) as Box<dyn Layer>
            })),
        ]);
        info!(model = "per-task-1-fc", modules = config.num_modules, "Per task exclusive: last fc");
        Self::assemble("per-task-1-fc", trunk, routed, Box::new(CorrectClassifiedReward))
    }

    fn assemble(
        name: &'static str,
        trunk: LayerStack,
        routed: Sequential,
        reward: Box<dyn FinalReward>,
    ) -> Self {
        Self {
            name,
            trunk,
            routed,
            loss: RoutingLoss::new(reward, 1.0),
        }
    }
}

impl RoutedNetwork for PerTaskNetwork {
    fn name(&self) -> &str {
        self.name
    }

    fn forward(&mut self, x: &ArrayD<f32>, tasks: &[usize]) -> Result<(ArrayD<f32>, RoutingMeta)> {
        let y = self.trunk.forward(x)?;
        self.routed.forward(&y, tasks)
    }

    fn loss(
        &mut self,
        prediction: &ArrayD<f32>,
        targets: ArrayView2<f32>,
        meta: &mut RoutingMeta,
    ) -> Result<(f32, f32, BatchLoss)> {
        let batch = self.loss.compute(prediction, targets, meta)?;
        let decision_loss = self.routed.routing_loss(meta)?;
        Ok((batch.module_loss, decision_loss, batch))
    }

    fn backward(&mut self, loss: &BatchLoss) -> Result<()> {
        let g = self.routed.backward(&loss.output_grad)?;
        self.trunk.backward(&g)?;
        Ok(())
    }

    fn visit_parameters(&mut self, group: ParamGroup, f: &mut dyn FnMut(&mut Param)) -> Result<()> {
        if group != ParamGroup::All {
            return Err(RoutingError::MissingParameterSplit(self.name.to_string()));
        }
        self.trunk.visit_params(f);
        self.routed.visit_params(ParamGroup::All, f);
        Ok(())
    }

    fn set_training(&mut self, training: bool) {
        self.trunk.set_training(training);
        self.routed.set_training(training);
    }

    fn start_logging_selections(&mut self) {
        self.routed.start_logging_selections();
    }

    fn stop_logging_selections_and_report(&mut self) -> SelectionReport {
        report(self.name, self.routed.stop_logging_selections())
    }
}

/// Routing network with a learned task assignment and one learned decision
/// per fc layer.
///
/// Every stage decision is multi-agent; the agent of a sample is the action
/// of the task-assignment decision, not the previous stage's choice, so the
/// layers are wired explicitly instead of through `Sequential`.
pub struct RoutedAllFc {
    trunk: LayerStack,
    initialization: Initialization,
    task_assignment: Decision,
    stages: Vec<(Decision, Selection)>,
    loss: RoutingLoss,
}

impl RoutedAllFc {
    pub fn new<R: Rng + ?Sized>(maker: &DecisionMaker, config: &ModelConfig, rng: &mut R) -> Result<Self> {
        let conv = config.convnet_out_size;
        let (n, agents) = (config.num_modules, config.num_agents);
        let trunk = LayerStack::new("trunk", conv_trunk(config.in_channels, rng));

        let task_assignment = maker.build(
            agents,
            conv,
            1,
            config.storage,
            Some(Box::new(CollaborationReward::new(COLLABORATION_RATIO, agents))),
            rng,
        )?;

        let stages = fc_stages(maker, config, agents, rng)?;

        info!(
            model = "routed-all-fc",
            decision = %maker.algorithm,
            modules = n,
            agents,
            "Routing network: all fc"
        );
        Ok(Self {
            trunk,
            initialization: Initialization::new(),
            task_assignment,
            stages,
            loss: RoutingLoss::new(Box::new(NegLossReward), 1.0),
        })
    }

    /// Policy parameters of every decision
    pub fn routing_parameters(&mut self, f: &mut dyn FnMut(&mut Param)) {
        self.task_assignment.visit_params(f);
        for (decision, _) in &mut self.stages {
            decision.visit_params(f);
        }
    }

    /// Selection modules and the trunk
    pub fn module_parameters(&mut self, f: &mut dyn FnMut(&mut Param)) {
        for (_, selection) in &mut self.stages {
            selection.visit_params(f);
        }
        self.trunk.visit_params(f);
    }

    fn decisions(&mut self) -> impl Iterator<Item = &mut Decision> {
        std::iter::once(&mut self.task_assignment).chain(self.stages.iter_mut().map(|(d, _)| d))
    }
}

impl RoutedNetwork for RoutedAllFc {
    fn name(&self) -> &str {
        "routed-all-fc"
    }

    fn forward(&mut self, x: &ArrayD<f32>, tasks: &[usize]) -> Result<(ArrayD<f32>, RoutingMeta)> {
        let y = self.trunk.forward(x)?;
        let (y, mut meta, actions) = self.initialization.forward(&y, tasks)?;
        let (mut y, task_actions) = self.task_assignment.forward(&y, &mut meta, &actions)?;
        for (decision, selection) in &mut self.stages {
            let (routed, routing_actions) = decision.forward(&y, &mut meta, &task_actions)?;
            y = selection.forward(&routed, &mut meta, &routing_actions)?.0;
        }
        Ok((y, meta))
    }

    fn loss(
        &mut self,
        prediction: &ArrayD<f32>,
        targets: ArrayView2<f32>,
        meta: &mut RoutingMeta,
    ) -> Result<(f32, f32, BatchLoss)> {
        let batch = self.loss.compute(prediction, targets, meta)?;
        let mut decision_loss = 0.0;
        for decision in self.decisions() {
            decision_loss += decision.routing_loss(meta)?;
        }
        Ok((batch.module_loss, decision_loss, batch))
    }

    fn backward(&mut self, loss: &BatchLoss) -> Result<()> {
        let mut g = loss.output_grad.clone();
        for (decision, selection) in self.stages.iter_mut().rev() {
            g = selection.backward(&g)?;
            g = decision.backward(&g)?;
        }
        g = self.task_assignment.backward(&g)?;
        self.trunk.backward(&g)?;
        Ok(())
    }

    fn visit_parameters(&mut self, group: ParamGroup, f: &mut dyn FnMut(&mut Param)) -> Result<()> {
        match group {
            ParamGroup::All => {
                self.routing_parameters(f);
                self.module_parameters(f);
            }
            ParamGroup::Routing => self.routing_parameters(f),
            ParamGroup::Module => self.module_parameters(f),
        }
        Ok(())
    }

    fn set_training(&mut self, training: bool) {
        self.trunk.set_training(training);
        for decision in self.decisions() {
            decision.set_training(training);
        }
        for (_, selection) in &mut self.stages {
            selection.set_training(training);
        }
    }

    fn start_logging_selections(&mut self) {
        for (_, selection) in &mut self.stages {
            selection.start_logging_selections();
        }
    }

    fn stop_logging_selections_and_report(&mut self) -> SelectionReport {
        let logs: Vec<_> = self
            .stages
            .iter_mut()
            .filter_map(|(_, selection)| selection.stop_logging_and_get_selections())
            .collect();
        report("routed-all-fc", logs)
    }
}

/// Routing network without task information: every fc layer has its own
/// single-agent decision, so routing depends on the trunk features alone.
pub struct PerDecisionSingleAgent {
    trunk: LayerStack,
    routed: Sequential,
    loss: RoutingLoss,
}

impl PerDecisionSingleAgent {
    pub fn new<R: Rng + ?Sized>(maker: &DecisionMaker, config: &ModelConfig, rng: &mut R) -> Result<Self> {
        let trunk = LayerStack::new("trunk", conv_trunk(config.in_channels, rng));
        let mut layers = Vec::new();
        for (decision, selection) in fc_stages(maker, config, 1, rng)? {
            layers.push(SequentialLayer::routing(decision));
            layers.push(SequentialLayer::routing(selection));
        }
        info!(
            model = "per-decision-single-agent",
            decision = %maker.algorithm,
            modules = config.num_modules,
            "Routing network: single agent per decision"
        );
        Ok(Self {
            trunk,
            routed: Sequential::new(layers),
            loss: RoutingLoss::new(Box::new(NegLossReward), 1.0),
        })
    }
}

impl RoutedNetwork for PerDecisionSingleAgent {
    fn name(&self) -> &str {
        "per-decision-single-agent"
    }

    fn forward(&mut self, x: &ArrayD<f32>, tasks: &[usize]) -> Result<(ArrayD<f32>, RoutingMeta)> {
        let y = self.trunk.forward(x)?;
        self.routed.forward(&y, tasks)
    }

    fn loss(
        &mut self,
        prediction: &ArrayD<f32>,
        targets: ArrayView2<f32>,
        meta: &mut RoutingMeta,
    ) -> Result<(f32, f32, BatchLoss)> {
        let batch = self.loss.compute(prediction, targets, meta)?;
        let decision_loss = self.routed.routing_loss(meta)?;
        Ok((batch.module_loss, decision_loss, batch))
    }

    fn backward(&mut self, loss: &BatchLoss) -> Result<()> {
        let g = self.routed.backward(&loss.output_grad)?;
        self.trunk.backward(&g)?;
        Ok(())
    }

    fn visit_parameters(&mut self, group: ParamGroup, f: &mut dyn FnMut(&mut Param)) -> Result<()> {
        self.routed.visit_params(group, f);
        if group != ParamGroup::Routing {
            self.trunk.visit_params(f);
        }
        Ok(())
    }

    fn set_training(&mut self, training: bool) {
        self.trunk.set_training(training);
        self.routed.set_training(training);
    }

    fn start_logging_selections(&mut self) {
        self.routed.start_logging_selections();
    }

    fn stop_logging_selections_and_report(&mut self) -> SelectionReport {
        report("per-decision-single-agent", self.routed.stop_logging_selections())
    }
}
