//! Decision layers: per-sample action choice by a learned multi-agent policy

use ndarray::{Array1, ArrayD, ArrayView1, Ix1, Ix2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use routenet_core::ops::as_matrix;
use routenet_core::param::fan_in_bound;
use routenet_core::{Param, Result, RoutingError};

use crate::algorithm::{AlgorithmKind, PolicyAlgorithm};
use crate::layer::{RoutingLayer, RoutingLayerKind};
use crate::meta::{Actions, DecisionId, DecisionRecord, RoutingMeta};
use crate::reward::PerActionReward;

/// How each agent's policy is stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyStorage {
    /// Linear function of the state, one per agent
    Approx,
    /// One learnable preference row per agent, independent of the state
    Tabular,
}

impl std::str::FromStr for PolicyStorage {
    type Err = RoutingError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "approx" => Ok(PolicyStorage::Approx),
            "tabular" => Ok(PolicyStorage::Tabular),
            other => Err(RoutingError::Config(format!("Unknown policy storage: {other}"))),
        }
    }
}

enum PolicyHead {
    Approx(Vec<(Param, Param)>),
    Tabular(Vec<Param>),
}

impl PolicyHead {
    fn new<R: Rng + ?Sized>(
        storage: PolicyStorage,
        num_agents: usize,
        in_width: usize,
        out_width: usize,
        rng: &mut R,
    ) -> Self {
        match storage {
            PolicyStorage::Approx => {
                let bound = fan_in_bound(in_width);
                PolicyHead::Approx(
                    (0..num_agents)
                        .map(|_| {
                            (
                                Param::uniform(&[out_width, in_width], bound, rng),
                                Param::uniform(&[out_width], bound, rng),
                            )
                        })
                        .collect(),
                )
            }
            PolicyStorage::Tabular => {
                PolicyHead::Tabular((0..num_agents).map(|_| Param::zeros(&[out_width])).collect())
            }
        }
    }

    fn output(&self, agent: usize, state: ArrayView1<f32>) -> Result<Array1<f32>> {
        match self {
            PolicyHead::Approx(heads) => {
                let (w, b) = &heads[agent];
                let w = w.value.view().into_dimensionality::<Ix2>()?;
                let b = b.value.view().into_dimensionality::<Ix1>()?;
                Ok(w.dot(&state) + b)
            }
            PolicyHead::Tabular(rows) => Ok(rows[agent].value.view().into_dimensionality::<Ix1>()?.to_owned()),
        }
    }

    fn accumulate(&mut self, agent: usize, state: &Array1<f32>, grad: &Array1<f32>) -> Result<()> {
        match self {
            PolicyHead::Approx(heads) => {
                let (w, b) = &mut heads[agent];
                let outer = grad
                    .view()
                    .insert_axis(ndarray::Axis(1))
                    .dot(&state.view().insert_axis(ndarray::Axis(0)));
                w.grad += &outer.into_dyn();
                b.grad += &grad.view().into_dyn();
            }
            PolicyHead::Tabular(rows) => {
                rows[agent].grad += &grad.view().into_dyn();
            }
        }
        Ok(())
    }

    fn visit(&mut self, f: &mut dyn FnMut(&mut Param)) {
        match self {
            PolicyHead::Approx(heads) => {
                for (w, b) in heads {
                    f(w);
                    f(b);
                }
            }
            PolicyHead::Tabular(rows) => {
                for row in rows {
                    f(row);
                }
            }
        }
    }
}

/// A routing decision layer.
///
/// `y` passes through unchanged; the incoming actions select the agent for
/// each sample and the returned actions are the chosen module indices. The
/// state fed to the policy is detached, so routing gradients only reach the
/// policy parameters.
pub struct Decision {
    id: DecisionId,
    name: String,
    num_choices: usize,
    in_width: usize,
    num_agents: usize,
    head: PolicyHead,
    algorithm: Box<dyn PolicyAlgorithm>,
    additional_reward: Option<Box<dyn PerActionReward>>,
    training: bool,
    rng: StdRng,
    pending: Vec<(usize, Array1<f32>, Array1<f32>)>,
}

impl Decision {
    pub fn new<R: Rng + ?Sized>(
        algorithm: Box<dyn PolicyAlgorithm>,
        num_choices: usize,
        in_width: usize,
        num_agents: usize,
        storage: PolicyStorage,
        additional_reward: Option<Box<dyn PerActionReward>>,
        rng: &mut R,
    ) -> Self {
        let num_agents = num_agents.max(1);
        let out_width = algorithm.output_width(num_choices);
        let head = PolicyHead::new(storage, num_agents, in_width, out_width, rng);
        let name = format!("decision[{}]", algorithm.name());
        Self {
            id: DecisionId::new(),
            name,
            num_choices,
            in_width,
            num_agents,
            head,
            algorithm,
            additional_reward,
            training: true,
            rng: StdRng::seed_from_u64(rng.gen()),
            pending: Vec::new(),
        }
    }

    pub fn id(&self) -> DecisionId {
        self.id
    }

    pub fn num_choices(&self) -> usize {
        self.num_choices
    }

    pub fn num_agents(&self) -> usize {
        self.num_agents
    }

    pub fn algorithm(&self) -> &dyn PolicyAlgorithm {
        self.algorithm.as_ref()
    }

    pub fn algorithm_mut(&mut self) -> &mut dyn PolicyAlgorithm {
        self.algorithm.as_mut()
    }

    fn agent_for(&self, incoming: usize) -> Result<usize> {
        if self.num_agents == 1 {
            return Ok(0);
        }
        if incoming >= self.num_agents {
            return Err(RoutingError::InvalidAction {
                action: incoming,
                choices: self.num_agents,
            });
        }
        Ok(incoming)
    }
}

impl RoutingLayer for Decision {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> RoutingLayerKind {
        RoutingLayerKind::Decision
    }

    fn forward(
        &mut self,
        y: &ArrayD<f32>,
        meta: &mut RoutingMeta,
        actions: &[usize],
    ) -> Result<(ArrayD<f32>, Actions)> {
        let states = as_matrix(y, &self.name)?;
        if states.ncols() != self.in_width {
            return Err(RoutingError::shape("decision state width", self.in_width, states.ncols()));
        }
        if actions.len() != states.nrows() || meta.len() != states.nrows() {
            return Err(RoutingError::shape(
                "decision batch",
                states.nrows(),
                (actions.len(), meta.len()),
            ));
        }

        let mut chosen = Vec::with_capacity(states.nrows());
        for (i, state) in states.outer_iter().enumerate() {
            let agent = self.agent_for(actions[i])?;
            let output = self.head.output(agent, state)?;
            let action = self
                .algorithm
                .select(output.view(), self.num_choices, self.training, &mut self.rng);
            let reward = self
                .additional_reward
                .as_mut()
                .map_or(0.0, |r| r.reward(agent, action));
            meta.push(
                i,
                DecisionRecord {
                    decision: self.id,
                    agent,
                    state: state.to_owned(),
                    policy_output: output,
                    choices: self.num_choices,
                    action,
                    reward,
                    cum_return: 0.0,
                },
            );
            chosen.push(action);
        }
        Ok((y.clone(), chosen))
    }

    fn backward(&mut self, grad: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        for (agent, state, g) in std::mem::take(&mut self.pending) {
            self.head.accumulate(agent, &state, &g)?;
        }
        Ok(grad.clone())
    }

    fn routing_loss(&mut self, meta: &RoutingMeta) -> Result<f32> {
        self.pending.clear();
        let transitions = meta.transitions_for(self.id);
        if transitions.is_empty() {
            return Ok(0.0);
        }
        let n = transitions.len() as f32;
        let mut total = 0.0;
        for t in &transitions {
            let (loss, grad) = self.algorithm.loss(t);
            total += loss;
            self.pending.push((t.record.agent, t.record.state.clone(), grad / n));
        }
        debug!(decision = %self.name, transitions = transitions.len(), "routing loss computed");
        Ok(total / n)
    }

    fn visit_params(&mut self, f: &mut dyn FnMut(&mut Param)) {
        self.head.visit(f);
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }
}

/// Fixed assignment: the action for each sample is its task label.
#[derive(Debug, Clone, Default)]
pub struct PerTaskAssignment;

impl PerTaskAssignment {
    pub fn new() -> Self {
        Self
    }
}

impl RoutingLayer for PerTaskAssignment {
    fn name(&self) -> &str {
        "per_task_assignment"
    }

    fn kind(&self) -> RoutingLayerKind {
        RoutingLayerKind::Decision
    }

    fn forward(
        &mut self,
        y: &ArrayD<f32>,
        meta: &mut RoutingMeta,
        _actions: &[usize],
    ) -> Result<(ArrayD<f32>, Actions)> {
        Ok((y.clone(), meta.tasks()))
    }

    fn backward(&mut self, grad: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        Ok(grad.clone())
    }
}

/// Constructor for decision layers: an algorithm plus its hyper-parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionMaker {
    pub algorithm: AlgorithmKind,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl DecisionMaker {
    pub fn new(algorithm: AlgorithmKind) -> Self {
        Self {
            algorithm,
            params: serde_json::Value::Null,
        }
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    pub fn build<R: Rng + ?Sized>(
        &self,
        num_choices: usize,
        in_width: usize,
        num_agents: usize,
        storage: PolicyStorage,
        additional_reward: Option<Box<dyn PerActionReward>>,
        rng: &mut R,
    ) -> Result<Decision> {
        let mut algorithm = self.algorithm.build();
        if !self.params.is_null() {
            algorithm.set_params(&self.params)?;
        }
        Ok(Decision::new(
            algorithm,
            num_choices,
            in_width,
            num_agents,
            storage,
            additional_reward,
            rng,
        ))
    }
}
