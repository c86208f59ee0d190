//! Decision algorithms: how a policy row turns into an action, and how a
//! transition turns into a loss and a gradient on that row

use ndarray::{s, Array1, ArrayView1};
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

use routenet_core::ops::{argmax, log_softmax_row, softmax_row};
use routenet_core::{Result, RoutingError};

use crate::meta::Transition;

/// Trait for routing decision algorithms
pub trait PolicyAlgorithm: Send + Sync {
    /// Algorithm name
    fn name(&self) -> &str;

    /// Width of the policy row for `choices` actions
    fn output_width(&self, choices: usize) -> usize {
        choices
    }

    /// Pick an action from a policy row
    fn select(&self, output: ArrayView1<f32>, choices: usize, training: bool, rng: &mut StdRng) -> usize;

    /// Loss of one transition and its gradient w.r.t. the stored policy row
    fn loss(&self, transition: &Transition<'_>) -> (f32, Array1<f32>);

    /// Get algorithm parameters as JSON
    fn get_params(&self) -> serde_json::Value {
        serde_json::json!({})
    }

    /// Set algorithm parameters from JSON
    fn set_params(&mut self, _params: &serde_json::Value) -> Result<()> {
        Ok(())
    }
}

/// Known decision algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlgorithmKind {
    Reinforce,
    EgreedyReinforce,
    QLearning,
    Sarsa,
    ActorCritic,
    Wpl,
    AdvantageLearning,
    Aac,
    EgreedyAac,
}

impl AlgorithmKind {
    pub const ALL: [AlgorithmKind; 9] = [
        AlgorithmKind::Reinforce,
        AlgorithmKind::EgreedyReinforce,
        AlgorithmKind::QLearning,
        AlgorithmKind::Sarsa,
        AlgorithmKind::ActorCritic,
        AlgorithmKind::Wpl,
        AlgorithmKind::AdvantageLearning,
        AlgorithmKind::Aac,
        AlgorithmKind::EgreedyAac,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AlgorithmKind::Reinforce => "reinforce",
            AlgorithmKind::EgreedyReinforce => "egreedy_reinforce",
            AlgorithmKind::QLearning => "q_learning",
            AlgorithmKind::Sarsa => "sarsa",
            AlgorithmKind::ActorCritic => "actor_critic",
            AlgorithmKind::Wpl => "wpl",
            AlgorithmKind::AdvantageLearning => "advantage_learning",
            AlgorithmKind::Aac => "aac",
            AlgorithmKind::EgreedyAac => "egreedy_aac",
        }
    }

    /// Build the algorithm with its default hyper-parameters
    pub fn build(&self) -> Box<dyn PolicyAlgorithm> {
        match self {
            AlgorithmKind::Reinforce => Box::new(Reinforce::default()),
            AlgorithmKind::EgreedyReinforce => Box::new(EGreedyReinforce::default()),
            AlgorithmKind::QLearning => Box::new(QLearning::default()),
            AlgorithmKind::Sarsa => Box::new(Sarsa::default()),
            AlgorithmKind::ActorCritic => Box::new(ActorCritic::default()),
            AlgorithmKind::Wpl => Box::new(Wpl::default()),
            AlgorithmKind::AdvantageLearning => Box::new(AdvantageLearning::default()),
            AlgorithmKind::Aac => Box::new(Aac::default()),
            AlgorithmKind::EgreedyAac => Box::new(EGreedyAac::default()),
        }
    }
}

impl std::fmt::Display for AlgorithmKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AlgorithmKind {
    type Err = RoutingError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        AlgorithmKind::ALL
            .into_iter()
            .find(|k| k.as_str() == normalized)
            .ok_or_else(|| RoutingError::Config(format!("Unknown decision algorithm: {s}")))
    }
}

fn sample_categorical(probs: &Array1<f32>, rng: &mut StdRng) -> usize {
    let u: f32 = rng.gen();
    let mut acc = 0.0;
    for (i, p) in probs.iter().enumerate() {
        acc += p;
        if u < acc {
            return i;
        }
    }
    probs.len().saturating_sub(1)
}

fn epsilon_greedy(scores: ArrayView1<f32>, epsilon: f64, rng: &mut StdRng) -> usize {
    if rng.gen::<f64>() < epsilon {
        rng.gen_range(0..scores.len().max(1))
    } else {
        argmax(scores)
    }
}

/// Softmax sampling with epsilon-uniform exploration; greedy outside training.
fn egreedy_sample(logits: ArrayView1<f32>, epsilon: f64, training: bool, rng: &mut StdRng) -> usize {
    if !training {
        return argmax(logits);
    }
    if rng.gen::<f64>() < epsilon {
        rng.gen_range(0..logits.len().max(1))
    } else {
        sample_categorical(&softmax_row(logits), rng)
    }
}

/// Gradient of `-weight * log pi(action)` w.r.t. the logits: `-weight * (onehot - pi)`
fn policy_gradient(logits: ArrayView1<f32>, action: usize, weight: f32) -> (f32, Array1<f32>) {
    let probs = softmax_row(logits);
    let log_probs = log_softmax_row(logits);
    let mut grad = probs * weight;
    grad[action] -= weight;
    (-weight * log_probs[action], grad)
}

fn read_f64(params: &serde_json::Value, key: &str, target: &mut f64) {
    if let Some(v) = params[key].as_f64() {
        *target = v;
    }
}

/// REINFORCE: `-G log pi(a|s)`
#[derive(Debug, Clone, Default)]
pub struct Reinforce;

impl PolicyAlgorithm for Reinforce {
    fn name(&self) -> &str {
        "reinforce"
    }

    fn select(&self, output: ArrayView1<f32>, choices: usize, training: bool, rng: &mut StdRng) -> usize {
        let logits = output.slice(s![..choices]);
        if training {
            sample_categorical(&softmax_row(logits), rng)
        } else {
            argmax(logits)
        }
    }

    fn loss(&self, t: &Transition<'_>) -> (f32, Array1<f32>) {
        let r = t.record;
        policy_gradient(r.policy_output.view(), r.action, r.cum_return)
    }
}

/// REINFORCE with epsilon-uniform exploration during training
#[derive(Debug, Clone)]
pub struct EGreedyReinforce {
    pub epsilon: f64,
}

impl Default for EGreedyReinforce {
    fn default() -> Self {
        Self { epsilon: 0.1 }
    }
}

impl PolicyAlgorithm for EGreedyReinforce {
    fn name(&self) -> &str {
        "egreedy_reinforce"
    }

    fn select(&self, output: ArrayView1<f32>, choices: usize, training: bool, rng: &mut StdRng) -> usize {
        let logits = output.slice(s![..choices]);
        egreedy_sample(logits, self.epsilon, training, rng)
    }

    fn loss(&self, t: &Transition<'_>) -> (f32, Array1<f32>) {
        let r = t.record;
        policy_gradient(r.policy_output.view(), r.action, r.cum_return)
    }

    fn get_params(&self) -> serde_json::Value {
        serde_json::json!({ "epsilon": self.epsilon })
    }

    fn set_params(&mut self, params: &serde_json::Value) -> Result<()> {
        read_f64(params, "epsilon", &mut self.epsilon);
        Ok(())
    }
}

/// Q-learning over the policy row as Q-values
#[derive(Debug, Clone)]
pub struct QLearning {
    pub epsilon: f64,
    pub discount_factor: f64,
}

impl Default for QLearning {
    fn default() -> Self {
        Self {
            epsilon: 0.1,
            discount_factor: 1.0,
        }
    }
}

/// `0.5 (Q(s,a) - target)^2`, gradient only on the taken action
fn td_loss(t: &Transition<'_>, target: f32) -> (f32, Array1<f32>) {
    let r = t.record;
    let q = r.policy_output[r.action];
    let delta = q - target;
    let mut grad = Array1::zeros(r.policy_output.len());
    grad[r.action] = delta;
    (0.5 * delta * delta, grad)
}

impl PolicyAlgorithm for QLearning {
    fn name(&self) -> &str {
        "q_learning"
    }

    fn select(&self, output: ArrayView1<f32>, choices: usize, training: bool, rng: &mut StdRng) -> usize {
        let q = output.slice(s![..choices]);
        if training {
            epsilon_greedy(q, self.epsilon, rng)
        } else {
            argmax(q)
        }
    }

    fn loss(&self, t: &Transition<'_>) -> (f32, Array1<f32>) {
        let target = match t.next {
            Some(next) => {
                let max_next = next
                    .policy_output
                    .slice(s![..next.choices])
                    .iter()
                    .copied()
                    .fold(f32::NEG_INFINITY, f32::max);
                t.record.reward + self.discount_factor as f32 * max_next
            }
            None => t.record.reward,
        };
        td_loss(t, target)
    }

    fn get_params(&self) -> serde_json::Value {
        serde_json::json!({
            "epsilon": self.epsilon,
            "discount_factor": self.discount_factor
        })
    }

    fn set_params(&mut self, params: &serde_json::Value) -> Result<()> {
        read_f64(params, "epsilon", &mut self.epsilon);
        read_f64(params, "discount_factor", &mut self.discount_factor);
        Ok(())
    }
}

/// SARSA: bootstraps from the action actually taken next
#[derive(Debug, Clone)]
pub struct Sarsa {
    pub epsilon: f64,
    pub discount_factor: f64,
}

impl Default for Sarsa {
    fn default() -> Self {
        Self {
            epsilon: 0.1,
            discount_factor: 1.0,
        }
    }
}

impl PolicyAlgorithm for Sarsa {
    fn name(&self) -> &str {
        "sarsa"
    }

    fn select(&self, output: ArrayView1<f32>, choices: usize, training: bool, rng: &mut StdRng) -> usize {
        let q = output.slice(s![..choices]);
        if training {
            epsilon_greedy(q, self.epsilon, rng)
        } else {
            argmax(q)
        }
    }

    fn loss(&self, t: &Transition<'_>) -> (f32, Array1<f32>) {
        let target = match t.next {
            Some(next) => t.record.reward + self.discount_factor as f32 * next.policy_output[next.action],
            None => t.record.reward,
        };
        td_loss(t, target)
    }

    fn get_params(&self) -> serde_json::Value {
        serde_json::json!({
            "epsilon": self.epsilon,
            "discount_factor": self.discount_factor
        })
    }

    fn set_params(&mut self, params: &serde_json::Value) -> Result<()> {
        read_f64(params, "epsilon", &mut self.epsilon);
        read_f64(params, "discount_factor", &mut self.discount_factor);
        Ok(())
    }
}

/// Advantage learning: Q-learning whose target is lowered by `alpha` times
/// the action gap `max_b Q(s,b) - Q(s,a)`, widening the gap to the greedy
/// action.
#[derive(Debug, Clone)]
pub struct AdvantageLearning {
    pub epsilon: f64,
    pub discount_factor: f64,
    pub alpha: f64,
}

impl Default for AdvantageLearning {
    fn default() -> Self {
        Self {
            epsilon: 0.1,
            discount_factor: 1.0,
            alpha: 0.3,
        }
    }
}

impl PolicyAlgorithm for AdvantageLearning {
    fn name(&self) -> &str {
        "advantage_learning"
    }

    fn select(&self, output: ArrayView1<f32>, choices: usize, training: bool, rng: &mut StdRng) -> usize {
        let q = output.slice(s![..choices]);
        if training {
            epsilon_greedy(q, self.epsilon, rng)
        } else {
            argmax(q)
        }
    }

    fn loss(&self, t: &Transition<'_>) -> (f32, Array1<f32>) {
        let r = t.record;
        let q = r.policy_output.slice(s![..r.choices]);
        let max_q = q.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let bootstrap = t.next.map_or(0.0, |next| {
            next.policy_output
                .slice(s![..next.choices])
                .iter()
                .copied()
                .fold(f32::NEG_INFINITY, f32::max)
        });
        let gap = max_q - q[r.action];
        let target = r.reward + self.discount_factor as f32 * bootstrap - self.alpha as f32 * gap;
        td_loss(t, target)
    }

    fn get_params(&self) -> serde_json::Value {
        serde_json::json!({
            "epsilon": self.epsilon,
            "discount_factor": self.discount_factor,
            "alpha": self.alpha
        })
    }

    fn set_params(&mut self, params: &serde_json::Value) -> Result<()> {
        read_f64(params, "epsilon", &mut self.epsilon);
        read_f64(params, "discount_factor", &mut self.discount_factor);
        read_f64(params, "alpha", &mut self.alpha);
        Ok(())
    }
}

/// Advantage actor-critic: logits plus one value output
#[derive(Debug, Clone)]
pub struct ActorCritic {
    pub value_weight: f64,
}

impl Default for ActorCritic {
    fn default() -> Self {
        Self { value_weight: 0.5 }
    }
}

/// Actor-critic style loss; `scale` maps (advantage, pi(a)) to the policy weight.
fn advantage_loss(
    t: &Transition<'_>,
    value_weight: f32,
    scale: impl Fn(f32, f32) -> f32,
) -> (f32, Array1<f32>) {
    let r = t.record;
    let choices = r.choices;
    let logits = r.policy_output.slice(s![..choices]);
    let value = r.policy_output[choices];
    let advantage = r.cum_return - value;
    let pi_a = softmax_row(logits)[r.action];

    let (policy_loss, policy_grad) = policy_gradient(logits, r.action, scale(advantage, pi_a));
    let value_err = value - r.cum_return;

    let mut grad = Array1::zeros(choices + 1);
    grad.slice_mut(s![..choices]).assign(&policy_grad);
    grad[choices] = value_weight * value_err;
    (policy_loss + 0.5 * value_weight * value_err * value_err, grad)
}

impl PolicyAlgorithm for ActorCritic {
    fn name(&self) -> &str {
        "actor_critic"
    }

    fn output_width(&self, choices: usize) -> usize {
        choices + 1
    }

    fn select(&self, output: ArrayView1<f32>, choices: usize, training: bool, rng: &mut StdRng) -> usize {
        Reinforce.select(output, choices, training, rng)
    }

    fn loss(&self, t: &Transition<'_>) -> (f32, Array1<f32>) {
        advantage_loss(t, self.value_weight as f32, |advantage, _| advantage)
    }

    fn get_params(&self) -> serde_json::Value {
        serde_json::json!({ "value_weight": self.value_weight })
    }

    fn set_params(&mut self, params: &serde_json::Value) -> Result<()> {
        read_f64(params, "value_weight", &mut self.value_weight);
        Ok(())
    }
}

/// Weighted policy learner: the advantage is damped by `1 - pi(a)` when
/// positive and by `pi(a)` when negative.
#[derive(Debug, Clone)]
pub struct Wpl {
    pub value_weight: f64,
}

impl Default for Wpl {
    fn default() -> Self {
        Self { value_weight: 0.5 }
    }
}

impl PolicyAlgorithm for Wpl {
    fn name(&self) -> &str {
        "wpl"
    }

    fn output_width(&self, choices: usize) -> usize {
        choices + 1
    }

    fn select(&self, output: ArrayView1<f32>, choices: usize, training: bool, rng: &mut StdRng) -> usize {
        Reinforce.select(output, choices, training, rng)
    }

    fn loss(&self, t: &Transition<'_>) -> (f32, Array1<f32>) {
        advantage_loss(t, self.value_weight as f32, |advantage, pi_a| {
            if advantage > 0.0 {
                advantage * (1.0 - pi_a)
            } else {
                advantage * pi_a
            }
        })
    }

    fn get_params(&self) -> serde_json::Value {
        serde_json::json!({ "value_weight": self.value_weight })
    }

    fn set_params(&mut self, params: &serde_json::Value) -> Result<()> {
        read_f64(params, "value_weight", &mut self.value_weight);
        Ok(())
    }
}

/// Policy row of `Aac`: `choices` logits followed by `choices` Q-values.
/// The advantage `Q(s,a) - sum_b pi(b) Q(s,b)` (detached) drives the policy;
/// `Q(s,a)` regresses onto the return.
fn action_value_loss(t: &Transition<'_>, value_weight: f32) -> (f32, Array1<f32>) {
    let r = t.record;
    let choices = r.choices;
    let logits = r.policy_output.slice(s![..choices]);
    let q = r.policy_output.slice(s![choices..2 * choices]);
    let baseline = softmax_row(logits).dot(&q);
    let advantage = q[r.action] - baseline;

    let (policy_loss, policy_grad) = policy_gradient(logits, r.action, advantage);
    let q_err = q[r.action] - r.cum_return;

    let mut grad = Array1::zeros(2 * choices);
    grad.slice_mut(s![..choices]).assign(&policy_grad);
    grad[choices + r.action] = value_weight * q_err;
    (policy_loss + 0.5 * value_weight * q_err * q_err, grad)
}

/// Advantage actor-critic with a per-action critic
#[derive(Debug, Clone)]
pub struct Aac {
    pub value_weight: f64,
}

impl Default for Aac {
    fn default() -> Self {
        Self { value_weight: 0.5 }
    }
}

impl PolicyAlgorithm for Aac {
    fn name(&self) -> &str {
        "aac"
    }

    fn output_width(&self, choices: usize) -> usize {
        2 * choices
    }

    fn select(&self, output: ArrayView1<f32>, choices: usize, training: bool, rng: &mut StdRng) -> usize {
        Reinforce.select(output, choices, training, rng)
    }

    fn loss(&self, t: &Transition<'_>) -> (f32, Array1<f32>) {
        action_value_loss(t, self.value_weight as f32)
    }

    fn get_params(&self) -> serde_json::Value {
        serde_json::json!({ "value_weight": self.value_weight })
    }

    fn set_params(&mut self, params: &serde_json::Value) -> Result<()> {
        read_f64(params, "value_weight", &mut self.value_weight);
        Ok(())
    }
}

/// `Aac` with epsilon-uniform exploration during training
#[derive(Debug, Clone)]
pub struct EGreedyAac {
    pub epsilon: f64,
    pub value_weight: f64,
}

impl Default for EGreedyAac {
    fn default() -> Self {
        Self {
            epsilon: 0.1,
            value_weight: 0.5,
        }
    }
}

impl PolicyAlgorithm for EGreedyAac {
    fn name(&self) -> &str {
        "egreedy_aac"
    }

    fn output_width(&self, choices: usize) -> usize {
        2 * choices
    }

    fn select(&self, output: ArrayView1<f32>, choices: usize, training: bool, rng: &mut StdRng) -> usize {
        egreedy_sample(output.slice(s![..choices]), self.epsilon, training, rng)
    }

    fn loss(&self, t: &Transition<'_>) -> (f32, Array1<f32>) {
        action_value_loss(t, self.value_weight as f32)
    }

    fn get_params(&self) -> serde_json::Value {
        serde_json::json!({
            "epsilon": self.epsilon,
            "value_weight": self.value_weight
        })
    }

    fn set_params(&mut self, params: &serde_json::Value) -> Result<()> {
        read_f64(params, "epsilon", &mut self.epsilon);
        read_f64(params, "value_weight", &mut self.value_weight);
        Ok(())
    }
}
