//! Train a routing network on a synthetic multi-task problem

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::info;

use routenet_rl::AlgorithmKind;
use routenet_train::{trunk_output_width, ModelKind, RunReport, SyntheticMtl, Trainer};

use crate::config::Config;

#[derive(Args, Debug, Default)]
pub struct TrainArgs {
    /// Config file to read instead of the default locations
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Model architecture (per-task-all-fc, per-task-1-fc, routed-all-fc,
    /// per-decision-single-agent)
    #[arg(short, long)]
    pub model: Option<ModelKind>,

    /// Decision algorithm of routed models (reinforce, egreedy-reinforce,
    /// q-learning, sarsa, actor-critic, wpl, advantage-learning, aac,
    /// egreedy-aac)
    #[arg(short, long)]
    pub decision: Option<AlgorithmKind>,

    /// Number of epochs
    #[arg(short, long)]
    pub epochs: Option<usize>,

    /// Seed for data generation and initialisation
    #[arg(short, long)]
    pub seed: Option<u64>,

    /// Write the JSON run report to this file
    #[arg(short, long)]
    pub report: Option<PathBuf>,
}

impl TrainArgs {
    /// Command line flags take precedence over file and environment.
    fn apply(&self, config: &mut Config) {
        if let Some(model) = self.model {
            config.model.kind = model;
        }
        if let Some(decision) = self.decision {
            config.model.decision = decision;
        }
        if let Some(epochs) = self.epochs {
            config.training.epochs = epochs;
        }
        if let Some(seed) = self.seed {
            config.training.seed = seed;
        }
    }
}

pub fn run(args: &TrainArgs) -> Result<()> {
    let (mut config, _) = Config::load(args.config.as_deref())?;
    args.apply(&mut config);
    let report = train(&config)?;

    if let Some(path) = &args.report {
        report
            .write_json(path)
            .with_context(|| format!("Failed to write report to {}", path.display()))?;
        println!("Report written to {}", path.display());
    }
    if let Some(last) = report.epochs.last() {
        println!(
            "Finished {} epochs of {}: test accuracy {}, test model loss {}",
            report.epochs.len(),
            report.model,
            last.test.accuracy,
            last.test.model_loss
        );
    }
    Ok(())
}

/// Build dataset and model from `config` and train.
pub fn train(config: &Config) -> Result<RunReport> {
    let seed = config.training.seed;
    let mut dataset = SyntheticMtl::generate(&config.data, config.training.batch_size, seed)
        .context("Failed to generate dataset")?;

    let mut model_config = config.model.clone();
    model_config.out_dim = config.data.num_classes;
    model_config.in_channels = config.data.channels;
    model_config.convnet_out_size = trunk_output_width(config.data.image_size);
    if model_config.kind.routes_by_task() {
        // one module per task
        model_config.num_modules = config.data.num_tasks;
    }
    if model_config.convnet_out_size == 0 {
        anyhow::bail!(
            "Images of size {} vanish in the convolutional trunk (need at least 16)",
            config.data.image_size
        );
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let mut model = model_config.build(&mut rng).context("Failed to build model")?;
    info!(
        "Built {} with {} decision, {} modules, {} agents",
        model.name(),
        model_config.decision,
        model_config.num_modules,
        model_config.num_agents
    );

    let mut trainer = Trainer::new(config.training.clone())?;
    let report = trainer.run_with_report(model.as_mut(), &mut dataset)?;
    info!(run_id = %report.run_id, "Training finished");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use routenet_train::{LearningRateStep, SyntheticConfig};

    fn small_config(kind: ModelKind) -> Config {
        let mut config = Config::default();
        config.training.epochs = 1;
        config.training.batch_size = 4;
        config.training.learning_rates = vec![LearningRateStep { epoch: 0, lr: 0.01 }];
        config.model.kind = kind;
        config.model.num_modules = 2;
        config.model.num_agents = 2;
        config.data = SyntheticConfig {
            num_tasks: 2,
            num_classes: 3,
            channels: 1,
            image_size: 16,
            train_per_task: 4,
            test_per_task: 2,
            noise: 0.2,
        };
        config
    }

    #[test]
    fn test_flags_override_config() {
        let args = TrainArgs {
            model: Some(ModelKind::PerTaskAllFc),
            decision: Some(AlgorithmKind::Sarsa),
            epochs: Some(9),
            seed: Some(1),
            ..TrainArgs::default()
        };
        let mut config = Config::default();
        args.apply(&mut config);
        assert_eq!(config.model.kind, ModelKind::PerTaskAllFc);
        assert_eq!(config.model.decision, AlgorithmKind::Sarsa);
        assert_eq!(config.training.epochs, 9);
        assert_eq!(config.training.seed, 1);
    }

    #[test]
    fn test_train_routed_model_end_to_end() {
        let report = train(&small_config(ModelKind::RoutedAllFc)).unwrap();
        assert_eq!(report.model, "routed-all-fc");
        assert_eq!(report.epochs.len(), 1);
        assert_eq!(report.epochs[0].train.samples, 8);
    }

    #[test]
    fn test_single_agent_model_keeps_module_count() {
        let mut config = small_config(ModelKind::PerDecisionSingleAgent);
        config.model.decision = AlgorithmKind::AdvantageLearning;
        config.model.num_modules = 3;
        let report = train(&config).unwrap();
        assert_eq!(report.model, "per-decision-single-agent");
        let used = &report.epochs[0].modules_used;
        assert_eq!(used.len(), 3);
        assert!(used.iter().all(|&n| (1..=3).contains(&n)));
    }

    #[test]
    fn test_report_file_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        let report = train(&small_config(ModelKind::PerTask1Fc)).unwrap();
        report.write_json(&path).unwrap();
        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["model"], "per-task-1-fc");
        assert_eq!(json["epochs"][0]["epoch"], 1);
    }
}
