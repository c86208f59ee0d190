//! Supervised loss plus per-sample rewards for the routing policy

use ndarray::{Array1, ArrayD, ArrayView2, Axis};

use routenet_core::ops::{argmax, as_matrix, mse_loss};
use routenet_core::{Result, RoutingError};

use crate::meta::RoutingMeta;
use crate::reward::FinalReward;

/// Output of the loss layer for one batch
#[derive(Debug, Clone)]
pub struct BatchLoss {
    /// Mean squared error against the one-hot targets
    pub module_loss: f32,
    /// Gradient of `module_loss` w.r.t. the prediction
    pub output_grad: ArrayD<f32>,
    /// Final reward per sample
    pub rewards: Array1<f32>,
    /// Whether the argmax prediction matched the target, per sample
    pub correct: Vec<bool>,
}

impl BatchLoss {
    pub fn num_correct(&self) -> usize {
        self.correct.iter().filter(|&&c| c).count()
    }
}

/// MSE against one-hot targets, plus routing rewards and returns.
pub struct RoutingLoss {
    final_reward: Box<dyn FinalReward>,
    discounting: f32,
}

impl RoutingLoss {
    pub fn new(final_reward: Box<dyn FinalReward>, discounting: f32) -> Self {
        Self {
            final_reward,
            discounting,
        }
    }

    pub fn reward_name(&self) -> &str {
        self.final_reward.name()
    }

    /// Compute the module loss and write rewards/returns into `meta`.
    pub fn compute(&self, prediction: &ArrayD<f32>, targets: ArrayView2<f32>, meta: &mut RoutingMeta) -> Result<BatchLoss> {
        let pred = as_matrix(prediction, "loss prediction")?;
        if meta.len() != pred.nrows() {
            return Err(RoutingError::shape("loss routing meta", pred.nrows(), meta.len()));
        }
        let (module_loss, grad) = mse_loss(pred, targets)?;
        let rewards = self.final_reward.rewards(pred, targets)?;
        let correct = pred
            .axis_iter(Axis(0))
            .zip(targets.axis_iter(Axis(0)))
            .map(|(p, t)| argmax(p) == argmax(t))
            .collect();

        meta.assign_returns(&rewards.to_vec(), self.discounting);

        Ok(BatchLoss {
            module_loss,
            output_grad: grad.into_dyn(),
            rewards,
            correct,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{DecisionId, DecisionRecord};
    use crate::reward::{CorrectClassifiedReward, NegLossReward};
    use ndarray::array;

    #[test]
    fn test_loss_assigns_final_reward_to_last_record() {
        let d = DecisionId::new();
        let mut meta = RoutingMeta::new(&[0, 0]);
        for sample in 0..2 {
            meta.push(
                sample,
                DecisionRecord {
                    decision: d,
                    agent: 0,
                    state: Array1::zeros(1),
                    policy_output: Array1::zeros(2),
                    choices: 2,
                    action: 0,
                    reward: 0.0,
                    cum_return: 0.0,
                },
            );
        }
        let loss = RoutingLoss::new(Box::new(CorrectClassifiedReward), 1.0);
        let pred = array![[0.9, 0.1], [0.9, 0.1]].into_dyn();
        let targets = array![[1.0, 0.0], [0.0, 1.0]];
        let out = loss.compute(&pred, targets.view(), &mut meta).unwrap();

        assert_eq!(out.num_correct(), 1);
        assert_eq!(out.correct, vec![true, false]);
        assert_eq!(meta.samples()[0].trajectory[0].cum_return, 1.0);
        assert_eq!(meta.samples()[1].trajectory[0].cum_return, -1.0);
    }

    #[test]
    fn test_module_loss_and_gradient_shape() {
        let loss = RoutingLoss::new(Box::new(NegLossReward), 1.0);
        assert_eq!(loss.reward_name(), "neg_loss");
        let mut meta = RoutingMeta::new(&[0]);
        let pred = array![[1.0, 1.0]].into_dyn();
        let targets = array![[1.0, 0.0]];
        let out = loss.compute(&pred, targets.view(), &mut meta).unwrap();
        assert!((out.module_loss - 0.5).abs() < 1e-6);
        assert_eq!(out.output_grad.shape(), &[1, 2]);
        assert!((out.rewards[0] + 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_shape_mismatch_is_an_error() {
        let loss = RoutingLoss::new(Box::new(NegLossReward), 1.0);
        let mut meta = RoutingMeta::new(&[0]);
        let pred = array![[1.0, 1.0, 0.0]].into_dyn();
        let targets = array![[1.0, 0.0]];
        assert!(loss.compute(&pred, targets.view(), &mut meta).is_err());
    }

    #[test]
    fn test_meta_batch_mismatch_is_an_error() {
        let loss = RoutingLoss::new(Box::new(NegLossReward), 1.0);
        let mut meta = RoutingMeta::new(&[0, 1, 0]);
        let pred = array![[1.0, 0.0], [0.0, 1.0]].into_dyn();
        let targets = array![[1.0, 0.0], [0.0, 1.0]];
        let err = loss.compute(&pred, targets.view(), &mut meta).unwrap_err();
        assert!(matches!(err, RoutingError::Shape(_)));
        assert!(meta.samples().iter().all(|s| s.final_reward.is_none()));
    }
}
