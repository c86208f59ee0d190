//! Routing metadata threaded through every routing layer

use ndarray::Array1;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Per-sample action trace: one module (or agent) index per sample.
pub type Actions = Vec<usize>;

/// Identifier of one decision layer instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DecisionId(pub Uuid);

impl DecisionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DecisionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DecisionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One decision taken for one sample.
#[derive(Debug, Clone)]
pub struct DecisionRecord {
    pub decision: DecisionId,
    /// Agent (policy) inside the decision layer that acted
    pub agent: usize,
    /// Detached state row the policy saw
    pub state: Array1<f32>,
    /// Detached policy output row (logits, Q-values, or logits + value)
    pub policy_output: Array1<f32>,
    /// Number of choices; `policy_output[..choices]` scores the actions
    pub choices: usize,
    pub action: usize,
    /// Immediate reward; per-action reward at forward time, plus the final
    /// reward on the last record once the loss has run
    pub reward: f32,
    /// Discounted return from this record to the end of the trajectory
    pub cum_return: f32,
}

/// Everything known about one sample's path through the network.
#[derive(Debug, Clone, Default)]
pub struct SampleMeta {
    pub task: usize,
    pub trajectory: Vec<DecisionRecord>,
    /// Final reward assigned by the loss
    pub final_reward: Option<f32>,
}

impl SampleMeta {
    pub fn new(task: usize) -> Self {
        Self {
            task,
            trajectory: Vec::new(),
            final_reward: None,
        }
    }
}

/// A decision record together with the record that followed it.
#[derive(Debug, Clone, Copy)]
pub struct Transition<'a> {
    pub sample: usize,
    pub record: &'a DecisionRecord,
    pub next: Option<&'a DecisionRecord>,
}

impl Transition<'_> {
    pub fn is_terminal(&self) -> bool {
        self.next.is_none()
    }
}

/// Metadata accumulator for a batch; owned by the forward pass.
#[derive(Debug, Clone, Default)]
pub struct RoutingMeta {
    samples: Vec<SampleMeta>,
}

impl RoutingMeta {
    pub fn new(tasks: &[usize]) -> Self {
        Self {
            samples: tasks.iter().map(|&t| SampleMeta::new(t)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[SampleMeta] {
        &self.samples
    }

    pub fn sample(&self, index: usize) -> Option<&SampleMeta> {
        self.samples.get(index)
    }

    pub fn tasks(&self) -> Vec<usize> {
        self.samples.iter().map(|s| s.task).collect()
    }

    /// Append a decision record to one sample's trajectory.
    pub fn push(&mut self, sample: usize, record: DecisionRecord) {
        if let Some(meta) = self.samples.get_mut(sample) {
            meta.trajectory.push(record);
        }
    }

    /// Total number of decision records in the batch
    pub fn num_records(&self) -> usize {
        self.samples.iter().map(|s| s.trajectory.len()).sum()
    }

    /// All transitions produced by one decision layer, in sample order.
    pub fn transitions_for(&self, decision: DecisionId) -> Vec<Transition<'_>> {
        let mut out = Vec::new();
        for (i, sample) in self.samples.iter().enumerate() {
            for (pos, record) in sample.trajectory.iter().enumerate() {
                if record.decision == decision {
                    out.push(Transition {
                        sample: i,
                        record,
                        next: sample.trajectory.get(pos + 1),
                    });
                }
            }
        }
        out
    }

    /// Add each sample's final reward to its last record and fill in the
    /// discounted returns `G_t = r_t + discounting * G_{t+1}`.
    pub fn assign_returns(&mut self, final_rewards: &[f32], discounting: f32) {
        for (sample, &final_reward) in self.samples.iter_mut().zip(final_rewards) {
            sample.final_reward = Some(final_reward);
            if let Some(last) = sample.trajectory.last_mut() {
                last.reward += final_reward;
            }
            let mut running = 0.0;
            for record in sample.trajectory.iter_mut().rev() {
                running = record.reward + discounting * running;
                record.cum_return = running;
            }
        }
    }
}
