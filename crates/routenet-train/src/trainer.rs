//! Epoch/batch training loop
//!
//! Each epoch runs a train phase (forward, module + decision loss, backward,
//! gradient clipping, one SGD step per optimizer) followed by a test phase
//! with selection logging, and reports per-sample averages of both.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use routenet_core::ops::one_hot;
use routenet_core::{GradClipper, Result, RoutingError, Sgd};
use routenet_rl::{BatchLoss, ParamGroup};

use crate::dataset::{Batch, MultiTaskDataset};
use crate::models::RoutedNetwork;

/// Learning rate that takes effect at the start of `epoch`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LearningRateStep {
    pub epoch: usize,
    pub lr: f64,
}

/// Training loop configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default = "default_epochs")]
    pub epochs: usize,

    /// Learning-rate schedule; must contain epoch 0
    #[serde(default = "default_learning_rates")]
    pub learning_rates: Vec<LearningRateStep>,

    /// Routing optimizer lr = ratio * module lr
    #[serde(default = "default_routing_lr_ratio")]
    pub routing_lr_ratio: f64,

    /// Max global L2 norm of the gradients
    #[serde(default = "default_clip_norm")]
    pub clip_norm: f64,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_epochs() -> usize {
    50
}
fn default_learning_rates() -> Vec<LearningRateStep> {
    vec![
        LearningRateStep { epoch: 0, lr: 3e-3 },
        LearningRateStep { epoch: 5, lr: 1e-3 },
        LearningRateStep { epoch: 10, lr: 3e-4 },
    ]
}
fn default_routing_lr_ratio() -> f64 {
    0.3
}
fn default_clip_norm() -> f64 {
    40.0
}
fn default_batch_size() -> usize {
    10
}
fn default_seed() -> u64 {
    42
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: default_epochs(),
            learning_rates: default_learning_rates(),
            routing_lr_ratio: default_routing_lr_ratio(),
            clip_norm: default_clip_norm(),
            batch_size: default_batch_size(),
            seed: default_seed(),
        }
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.lr_at(0).is_none() {
            return Err(RoutingError::Config(
                "learning-rate schedule needs an entry for epoch 0".to_string(),
            ));
        }
        if self.learning_rates.iter().any(|s| s.lr <= 0.0) {
            return Err(RoutingError::Config("learning rates must be positive".to_string()));
        }
        if self.clip_norm <= 0.0 {
            return Err(RoutingError::Config("clip_norm must be positive".to_string()));
        }
        if self.batch_size == 0 {
            return Err(RoutingError::Config("batch_size must be positive".to_string()));
        }
        Ok(())
    }

    /// Learning rate scheduled exactly at `epoch`, if any
    pub fn lr_at(&self, epoch: usize) -> Option<f64> {
        self.learning_rates
            .iter()
            .rev()
            .find(|s| s.epoch == epoch)
            .map(|s| s.lr)
    }
}

/// Per-sample averages of one phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseStats {
    pub samples: usize,
    pub model_loss: f64,
    pub routing_loss: f64,
    pub accuracy: f64,
}

#[derive(Debug, Default)]
struct PhaseTotals {
    samples: usize,
    model_loss: f64,
    routing_loss: f64,
    correct: usize,
}

impl PhaseTotals {
    fn add(&mut self, batch: usize, model_loss: f32, routing_loss: f32, correct: usize) {
        self.samples += batch;
        self.model_loss += f64::from(model_loss) * batch as f64;
        self.routing_loss += f64::from(routing_loss) * batch as f64;
        self.correct += correct;
    }

    fn finish(&self) -> PhaseStats {
        if self.samples == 0 {
            return PhaseStats::default();
        }
        let n = self.samples as f64;
        PhaseStats {
            samples: self.samples,
            model_loss: round3(self.model_loss / n),
            routing_loss: round3(self.routing_loss / n),
            accuracy: round3(self.correct as f64 / n),
        }
    }
}

fn round3(x: f64) -> f64 {
    (x * 1000.0).round() / 1000.0
}

/// Result of one epoch; `epoch` counts from 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochReport {
    pub epoch: usize,
    pub train: PhaseStats,
    pub test: PhaseStats,
    pub modules_used: Vec<usize>,
}

/// A whole training run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub model: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub epochs: Vec<EpochReport>,
}

impl RunReport {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct GroupOptimizer {
    group: ParamGroup,
    sgd: Sgd,
}

/// Drives a model over a dataset according to a `TrainingConfig`.
///
/// Optimizers are (re)built at every epoch of the schedule and kept in
/// between.
pub struct Trainer {
    config: TrainingConfig,
    optimizers: Vec<GroupOptimizer>,
}

impl Trainer {
    pub fn new(config: TrainingConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            optimizers: Vec::new(),
        })
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Parameter group and learning rate of every active optimizer
    pub fn optimizer_groups(&self) -> Vec<(ParamGroup, f32)> {
        self.optimizers.iter().map(|o| (o.group, o.sgd.lr())).collect()
    }

    /// Separate routing and module optimizers when the model has the split,
    /// one optimizer over everything otherwise.
    fn configure_optimizers(&mut self, model: &mut dyn RoutedNetwork, lr: f64) -> Result<()> {
        self.optimizers = match model.visit_parameters(ParamGroup::Routing, &mut |_| {}) {
            Ok(()) => vec![
                GroupOptimizer {
                    group: ParamGroup::Routing,
                    sgd: Sgd::new((self.config.routing_lr_ratio * lr) as f32),
                },
                GroupOptimizer {
                    group: ParamGroup::Module,
                    sgd: Sgd::new(lr as f32),
                },
            ],
            Err(RoutingError::MissingParameterSplit(name)) => {
                warn!("Model {} has no routing/module split, using a single optimizer", name);
                vec![GroupOptimizer {
                    group: ParamGroup::All,
                    sgd: Sgd::new(lr as f32),
                }]
            }
            Err(e) => return Err(e),
        };
        debug!(optimizers = ?self.optimizer_groups(), "optimizers configured");
        Ok(())
    }

    /// Train for `config.epochs` epochs, returning one report per epoch.
    pub fn run(
        &mut self,
        model: &mut dyn RoutedNetwork,
        dataset: &mut dyn MultiTaskDataset,
    ) -> Result<Vec<EpochReport>> {
        let parameters = model.num_parameters()?;
        info!(
            "Starting training of {} ({} parameters, {} tasks) for {} epochs",
            model.name(),
            parameters,
            dataset.num_tasks(),
            self.config.epochs
        );
        (0..self.config.epochs)
            .map(|epoch| self.run_epoch(epoch, model, dataset))
            .collect()
    }

    /// `run` wrapped in a timestamped report.
    pub fn run_with_report(
        &mut self,
        model: &mut dyn RoutedNetwork,
        dataset: &mut dyn MultiTaskDataset,
    ) -> Result<RunReport> {
        let started_at = Utc::now();
        let epochs = self.run(model, dataset)?;
        Ok(RunReport {
            run_id: Uuid::new_v4(),
            model: model.name().to_string(),
            started_at,
            finished_at: Utc::now(),
            epochs,
        })
    }

    /// One train phase and one test phase; `epoch` counts from 0.
    pub fn run_epoch(
        &mut self,
        epoch: usize,
        model: &mut dyn RoutedNetwork,
        dataset: &mut dyn MultiTaskDataset,
    ) -> Result<EpochReport> {
        if let Some(lr) = self.config.lr_at(epoch) {
            self.configure_optimizers(model, lr)?;
        }
        if self.optimizers.is_empty() {
            return Err(RoutingError::Internal(format!(
                "no optimizer configured at epoch {epoch}"
            )));
        }

        let train = self.train_phase(model, dataset)?;
        let (test, selections) = test_phase(model, dataset)?;

        info!(
            "Epoch {} finished after {} train and {} test samples",
            epoch + 1,
            train.samples,
            test.samples
        );
        info!(
            "    Training averages: Model loss: {}, Routing loss: {}, Accuracy: {}",
            train.model_loss, train.routing_loss, train.accuracy
        );
        info!(
            "    Testing averages:  Model loss: {}, Routing loss: {}, Accuracy: {}",
            test.model_loss, test.routing_loss, test.accuracy
        );

        Ok(EpochReport {
            epoch: epoch + 1,
            train,
            test,
            modules_used: selections,
        })
    }

    fn train_phase(
        &self,
        model: &mut dyn RoutedNetwork,
        dataset: &mut dyn MultiTaskDataset,
    ) -> Result<PhaseStats> {
        dataset.enter_train_mode();
        model.set_training(true);
        let mut totals = PhaseTotals::default();

        while let Some(batch) = dataset.get_batch() {
            let (module_loss, decision_loss, loss) = compute_batch(model, &batch)?;
            model.backward(&loss)?;

            let mut clipper = GradClipper::new(self.config.clip_norm as f32);
            model.visit_parameters(ParamGroup::All, &mut |p| clipper.observe(p))?;
            model.visit_parameters(ParamGroup::All, &mut |p| clipper.apply(p))?;
            for opt in &self.optimizers {
                model.visit_parameters(opt.group, &mut |p| opt.sgd.step(p))?;
            }
            model.visit_parameters(ParamGroup::All, &mut |p| p.zero_grad())?;

            debug!(
                samples = batch.len(),
                module_loss,
                decision_loss,
                grad_norm = clipper.total_norm(),
                "train batch"
            );
            totals.add(batch.len(), module_loss, decision_loss, loss.num_correct());
        }
        Ok(totals.finish())
    }
}

fn test_phase(
    model: &mut dyn RoutedNetwork,
    dataset: &mut dyn MultiTaskDataset,
) -> Result<(PhaseStats, Vec<usize>)> {
    dataset.enter_test_mode();
    model.set_training(false);
    model.start_logging_selections();
    let mut totals = PhaseTotals::default();

    while let Some(batch) = dataset.get_batch() {
        let (module_loss, decision_loss, loss) = compute_batch(model, &batch)?;
        totals.add(batch.len(), module_loss, decision_loss, loss.num_correct());
    }
    let report = model.stop_logging_selections_and_report();
    Ok((totals.finish(), report.modules_used))
}

/// Forward and loss of one batch against one-hot targets.
fn compute_batch(model: &mut dyn RoutedNetwork, batch: &Batch) -> Result<(f32, f32, BatchLoss)> {
    let (y, mut meta) = model.forward(&batch.samples, &batch.tasks)?;
    let width = y.shape().get(1).copied().unwrap_or(0);
    let targets = one_hot(&batch.labels, width)?;
    model.loss(&y, targets.view(), &mut meta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{SyntheticConfig, SyntheticMtl};
    use crate::models::SelectionReport;
    use ndarray::{ArrayD, ArrayView2};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use routenet_core::{Flatten, Layer, Linear, Param};
    use routenet_rl::{NegLossReward, RoutingLoss, RoutingMeta};

    /// Flatten + linear; `split` controls whether it exposes parameter groups,
    /// `broken` makes every parameter visit fail.
    struct LinearClassifier {
        flatten: Flatten,
        linear: Linear,
        loss: RoutingLoss,
        split: bool,
        broken: bool,
    }

    impl LinearClassifier {
        fn new(in_features: usize, classes: usize, split: bool) -> Self {
            let mut rng = StdRng::seed_from_u64(9);
            Self {
                flatten: Flatten::new(),
                linear: Linear::new(in_features, classes, &mut rng),
                loss: RoutingLoss::new(Box::new(NegLossReward), 1.0),
                split,
                broken: false,
            }
        }
    }

    impl RoutedNetwork for LinearClassifier {
        fn name(&self) -> &str {
            "linear-classifier"
        }

        fn forward(&mut self, x: &ArrayD<f32>, tasks: &[usize]) -> Result<(ArrayD<f32>, RoutingMeta)> {
            let y = self.linear.forward(&self.flatten.forward(x)?)?;
            Ok((y, RoutingMeta::new(tasks)))
        }

        fn loss(
            &mut self,
            prediction: &ArrayD<f32>,
            targets: ArrayView2<f32>,
            meta: &mut RoutingMeta,
        ) -> Result<(f32, f32, BatchLoss)> {
            let batch = self.loss.compute(prediction, targets, meta)?;
            Ok((batch.module_loss, 0.0, batch))
        }

        fn backward(&mut self, loss: &BatchLoss) -> Result<()> {
            let g = self.linear.backward(&loss.output_grad)?;
            self.flatten.backward(&g)?;
            Ok(())
        }

        fn visit_parameters(&mut self, group: ParamGroup, f: &mut dyn FnMut(&mut Param)) -> Result<()> {
            if self.broken {
                return Err(RoutingError::Config("parameters unavailable".to_string()));
            }
            match (group, self.split) {
                (ParamGroup::Routing, true) => {}
                (ParamGroup::All, _) | (ParamGroup::Module, true) => self.linear.visit_params(f),
                _ => return Err(RoutingError::MissingParameterSplit("linear-classifier".to_string())),
            }
            Ok(())
        }

        fn set_training(&mut self, _training: bool) {}

        fn start_logging_selections(&mut self) {}

        fn stop_logging_selections_and_report(&mut self) -> SelectionReport {
            SelectionReport::default()
        }
    }

    fn tiny_data() -> crate::dataset::InMemoryMtl {
        let config = SyntheticConfig {
            num_tasks: 2,
            num_classes: 2,
            channels: 1,
            image_size: 4,
            train_per_task: 16,
            test_per_task: 4,
            noise: 0.2,
        };
        SyntheticMtl::generate(&config, 8, 5).unwrap()
    }

    fn schedule(steps: &[(usize, f64)]) -> Vec<LearningRateStep> {
        steps
            .iter()
            .map(|&(epoch, lr)| LearningRateStep { epoch, lr })
            .collect()
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = TrainingConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.lr_at(5), Some(1e-3));
        assert_eq!(config.lr_at(6), None);
        assert_eq!(config.clip_norm, 40.0);
    }

    #[test]
    fn test_schedule_without_epoch_zero_rejected() {
        let config = TrainingConfig {
            learning_rates: schedule(&[(1, 0.1)]),
            ..TrainingConfig::default()
        };
        assert!(matches!(Trainer::new(config), Err(RoutingError::Config(_))));
    }

    #[test]
    fn test_fallback_to_single_optimizer() {
        let mut trainer = Trainer::new(TrainingConfig::default()).unwrap();
        let mut model = LinearClassifier::new(16, 2, false);
        trainer.configure_optimizers(&mut model, 0.1).unwrap();
        assert_eq!(trainer.optimizer_groups(), vec![(ParamGroup::All, 0.1)]);
    }

    #[test]
    fn test_split_gets_routing_ratio() {
        let mut trainer = Trainer::new(TrainingConfig::default()).unwrap();
        let mut model = LinearClassifier::new(16, 2, true);
        trainer.configure_optimizers(&mut model, 1.0).unwrap();
        assert_eq!(
            trainer.optimizer_groups(),
            vec![(ParamGroup::Routing, 0.3), (ParamGroup::Module, 1.0)]
        );
    }

    #[test]
    fn test_optimizers_persist_between_schedule_points() {
        let config = TrainingConfig {
            epochs: 2,
            learning_rates: schedule(&[(0, 0.05), (3, 0.01)]),
            ..TrainingConfig::default()
        };
        let mut trainer = Trainer::new(config).unwrap();
        let mut model = LinearClassifier::new(16, 2, false);
        let mut data = tiny_data();
        trainer.run(&mut model, &mut data).unwrap();
        assert_eq!(trainer.optimizer_groups(), vec![(ParamGroup::All, 0.05)]);
    }

    #[test]
    fn test_training_lowers_loss() {
        let config = TrainingConfig {
            epochs: 8,
            learning_rates: schedule(&[(0, 0.05)]),
            ..TrainingConfig::default()
        };
        let mut trainer = Trainer::new(config).unwrap();
        let mut model = LinearClassifier::new(16, 2, false);
        let mut data = tiny_data();
        let reports = trainer.run(&mut model, &mut data).unwrap();

        assert_eq!(reports.len(), 8);
        assert_eq!(reports[0].epoch, 1);
        assert_eq!(reports[0].train.samples, 32);
        assert_eq!(reports[0].test.samples, 8);
        assert!(reports[7].train.model_loss < reports[0].train.model_loss);
    }

    #[test]
    fn test_phase_totals_weight_by_batch_size() {
        let mut totals = PhaseTotals::default();
        totals.add(2, 1.0, 0.5, 2);
        totals.add(1, 4.0, 0.5, 0);
        let stats = totals.finish();
        assert_eq!(stats.samples, 3);
        assert_eq!(stats.model_loss, 2.0);
        assert_eq!(stats.routing_loss, 0.5);
        assert_eq!(stats.accuracy, 0.667);
    }

    #[test]
    fn test_empty_phase_has_zero_averages() {
        assert_eq!(PhaseTotals::default().finish(), PhaseStats::default());
    }

    #[test]
    fn test_run_report_written_as_json() {
        let config = TrainingConfig {
            epochs: 1,
            learning_rates: schedule(&[(0, 0.1)]),
            ..TrainingConfig::default()
        };
        let mut trainer = Trainer::new(config).unwrap();
        let mut model = LinearClassifier::new(16, 2, true);
        let mut data = tiny_data();
        let report = trainer.run_with_report(&mut model, &mut data).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        report.write_json(&path).unwrap();
        let parsed: RunReport = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed.run_id, report.run_id);
        assert_eq!(parsed.model, "linear-classifier");
        assert_eq!(parsed.epochs.len(), 1);
        assert!(parsed.finished_at >= parsed.started_at);
    }

    #[test]
    fn test_parameter_visit_failure_stops_run() {
        let mut trainer = Trainer::new(TrainingConfig::default()).unwrap();
        let mut model = LinearClassifier::new(16, 2, false);
        model.broken = true;
        assert!(model.num_parameters().is_err());

        let mut data = tiny_data();
        let err = trainer.run(&mut model, &mut data).unwrap_err();
        assert!(matches!(err, RoutingError::Config(_)));
    }
}
