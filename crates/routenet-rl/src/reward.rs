//! Reward functions: final (per sample, at loss time) and per-action (at decision time)

use std::collections::VecDeque;

use ndarray::{Array1, ArrayView2, Axis};

use routenet_core::ops::{argmax, mse_per_sample};
use routenet_core::Result;

/// Reward for each sample once the network's prediction is known.
pub trait FinalReward: Send + Sync {
    fn name(&self) -> &str;

    fn rewards(&self, prediction: ArrayView2<f32>, targets: ArrayView2<f32>) -> Result<Array1<f32>>;
}

/// Reward = minus the sample's squared error.
#[derive(Debug, Clone, Copy, Default)]
pub struct NegLossReward;

impl FinalReward for NegLossReward {
    fn name(&self) -> &str {
        "neg_loss"
    }

    fn rewards(&self, prediction: ArrayView2<f32>, targets: ArrayView2<f32>) -> Result<Array1<f32>> {
        Ok(-mse_per_sample(prediction, targets)?)
    }
}

/// +1 for a correct argmax prediction, -1 otherwise.
#[derive(Debug, Clone, Copy, Default)]
pub struct CorrectClassifiedReward;

impl FinalReward for CorrectClassifiedReward {
    fn name(&self) -> &str {
        "correct_classified"
    }

    fn rewards(&self, prediction: ArrayView2<f32>, targets: ArrayView2<f32>) -> Result<Array1<f32>> {
        if prediction.shape() != targets.shape() {
            return Err(routenet_core::RoutingError::shape(
                "correct_classified",
                targets.shape(),
                prediction.shape(),
            ));
        }
        Ok(prediction
            .axis_iter(Axis(0))
            .zip(targets.axis_iter(Axis(0)))
            .map(|(p, t)| if argmax(p) == argmax(t) { 1.0 } else { -1.0 })
            .collect())
    }
}

/// Reward attached to an individual decision when it is taken.
pub trait PerActionReward: Send + Sync {
    fn name(&self) -> &str;

    fn reward(&mut self, agent: usize, action: usize) -> f32;
}

/// Rewards actions in proportion to how often they were chosen recently,
/// pushing agents towards sharing modules.
#[derive(Debug, Clone)]
pub struct CollaborationReward {
    reward_ratio: f32,
    num_actions: usize,
    history_len: usize,
    history: VecDeque<usize>,
    counts: Vec<usize>,
}

impl CollaborationReward {
    pub fn new(reward_ratio: f32, num_actions: usize) -> Self {
        Self::with_history(reward_ratio, num_actions, 256)
    }

    pub fn with_history(reward_ratio: f32, num_actions: usize, history_len: usize) -> Self {
        Self {
            reward_ratio,
            num_actions,
            history_len: history_len.max(1),
            history: VecDeque::with_capacity(history_len),
            counts: vec![0; num_actions],
        }
    }

    pub fn reward_ratio(&self) -> f32 {
        self.reward_ratio
    }

    /// Fraction of the history taken up by `action`
    pub fn frequency(&self, action: usize) -> f32 {
        if self.history.is_empty() {
            return 0.0;
        }
        self.counts.get(action).copied().unwrap_or(0) as f32 / self.history.len() as f32
    }

    fn record(&mut self, action: usize) {
        if action >= self.num_actions {
            return;
        }
        if self.history.len() >= self.history_len {
            if let Some(old) = self.history.pop_front() {
                self.counts[old] -= 1;
            }
        }
        self.history.push_back(action);
        self.counts[action] += 1;
    }
}

impl PerActionReward for CollaborationReward {
    fn name(&self) -> &str {
        "collaboration"
    }

    fn reward(&mut self, _agent: usize, action: usize) -> f32 {
        let reward = self.reward_ratio * self.frequency(action);
        self.record(action);
        reward
    }
}
