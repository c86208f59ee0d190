//! End-to-end training tests
//!
//! These tests build the reference models and train them on a small
//! synthetic multi-task problem.

#![allow(clippy::float_cmp)]

use rand::rngs::StdRng;
use rand::SeedableRng;

use routenet_rl::{AlgorithmKind, ParamGroup};
use routenet_train::{
    LearningRateStep, ModelConfig, ModelKind, SyntheticConfig, SyntheticMtl, Trainer, TrainingConfig,
};

fn dataset(seed: u64) -> routenet_train::InMemoryMtl {
    let config = SyntheticConfig {
        num_tasks: 2,
        num_classes: 2,
        channels: 1,
        image_size: 16,
        train_per_task: 8,
        test_per_task: 4,
        noise: 0.3,
    };
    SyntheticMtl::generate(&config, 8, seed).expect("dataset")
}

fn model_config(kind: ModelKind, decision: AlgorithmKind) -> ModelConfig {
    ModelConfig {
        kind,
        decision,
        in_channels: 1,
        convnet_out_size: 32,
        out_dim: 2,
        num_modules: 2,
        num_agents: 2,
        ..ModelConfig::default()
    }
}

fn training(epochs: usize, lr: f64) -> TrainingConfig {
    TrainingConfig {
        epochs,
        learning_rates: vec![LearningRateStep { epoch: 0, lr }],
        ..TrainingConfig::default()
    }
}

/// A per-task model fits the training data better over time
#[test]
fn test_per_task_model_training_lowers_loss() {
    let mut rng = StdRng::seed_from_u64(1);
    let mut model = model_config(ModelKind::PerTaskAllFc, AlgorithmKind::Reinforce)
        .build(&mut rng)
        .expect("model");
    let mut data = dataset(2);
    let mut trainer = Trainer::new(training(6, 0.1)).expect("trainer");

    let reports = trainer.run(model.as_mut(), &mut data).expect("run");

    assert_eq!(reports.len(), 6);
    assert!(reports[5].train.model_loss < reports[0].train.model_loss);
    // Per-task models cannot split their parameters
    assert_eq!(trainer.optimizer_groups(), vec![(ParamGroup::All, 0.1)]);
}

/// The routed model trains with two optimizers and logs module usage
#[test]
fn test_routed_model_runs_with_split_optimizers() {
    for decision in [AlgorithmKind::Reinforce, AlgorithmKind::Wpl] {
        let mut rng = StdRng::seed_from_u64(3);
        let mut model = model_config(ModelKind::RoutedAllFc, decision)
            .build(&mut rng)
            .expect("model");
        let mut data = dataset(4);
        let mut trainer = Trainer::new(training(2, 0.05)).expect("trainer");

        let report = trainer.run_with_report(model.as_mut(), &mut data).expect("run");

        assert_eq!(report.model, "routed-all-fc");
        assert_eq!(report.epochs.len(), 2);
        let groups = trainer.optimizer_groups();
        assert_eq!(groups[0].0, ParamGroup::Routing);
        assert_eq!(groups[1], (ParamGroup::Module, 0.05));
        for epoch in &report.epochs {
            assert_eq!(epoch.train.samples, 16);
            assert_eq!(epoch.test.samples, 8);
            assert!(epoch.train.model_loss.is_finite());
            assert!(epoch.train.routing_loss.is_finite());
            assert!((0.0..=1.0).contains(&epoch.test.accuracy));
            assert!(!epoch.modules_used.is_empty() && epoch.modules_used.len() <= 3);
            assert!(epoch.modules_used.iter().all(|&m| (1..=2).contains(&m)));
        }
    }
}

/// Routing from features alone also trains with split optimizers
#[test]
fn test_single_agent_model_runs_with_split_optimizers() {
    for decision in [AlgorithmKind::Aac, AlgorithmKind::AdvantageLearning] {
        let mut rng = StdRng::seed_from_u64(7);
        let mut model = model_config(ModelKind::PerDecisionSingleAgent, decision)
            .build(&mut rng)
            .expect("model");
        let mut data = dataset(8);
        let mut trainer = Trainer::new(training(2, 0.05)).expect("trainer");

        let reports = trainer.run(model.as_mut(), &mut data).expect("run");

        assert_eq!(trainer.optimizer_groups()[1], (ParamGroup::Module, 0.05));
        for epoch in &reports {
            assert_eq!(epoch.train.samples, 16);
            assert!(epoch.train.model_loss.is_finite());
            assert!(epoch.train.routing_loss.is_finite());
            assert_eq!(epoch.modules_used.len(), 3);
        }
    }
}

/// The single-optimizer model with shared layers trains too
#[test]
fn test_per_task_last_fc_trains() {
    let mut rng = StdRng::seed_from_u64(5);
    let mut model = model_config(ModelKind::PerTask1Fc, AlgorithmKind::Reinforce)
        .build(&mut rng)
        .expect("model");
    let mut data = dataset(6);
    let mut trainer = Trainer::new(training(2, 0.05)).expect("trainer");
    let reports = trainer.run(model.as_mut(), &mut data).expect("run");
    assert_eq!(reports[1].epoch, 2);
    // test routing loss is zero: per-task assignment has no policy
    assert_eq!(reports[1].test.routing_loss, 0.0);
}
