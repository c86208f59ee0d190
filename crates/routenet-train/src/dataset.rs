//! Multi-task datasets
//!
//! A dataset hands out batches of `(samples, labels, tasks)` for the current
//! phase until it runs out; the end of an epoch is `None`, after which the
//! next call starts the phase over.

use ndarray::{ArrayD, Axis, IxDyn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use routenet_core::{Result, RoutingError};

/// One batch; the batch dimension of `samples` comes first.
#[derive(Debug, Clone)]
pub struct Batch {
    pub samples: ArrayD<f32>,
    pub labels: Vec<usize>,
    pub tasks: Vec<usize>,
}

impl Batch {
    pub fn new(samples: ArrayD<f32>, labels: Vec<usize>, tasks: Vec<usize>) -> Result<Self> {
        let n = samples.shape().first().copied().unwrap_or(0);
        if labels.len() != n || tasks.len() != n {
            return Err(RoutingError::shape(
                "batch labels/tasks",
                (n, n),
                (labels.len(), tasks.len()),
            ));
        }
        Ok(Self {
            samples,
            labels,
            tasks,
        })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Collaborator contract of the training loop
pub trait MultiTaskDataset: Send {
    fn enter_train_mode(&mut self);

    fn enter_test_mode(&mut self);

    /// Next batch of the current phase; `None` at the end of the epoch.
    fn get_batch(&mut self) -> Option<Batch>;

    fn num_tasks(&self) -> usize;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Train,
    Test,
}

/// All samples of one phase
#[derive(Debug, Clone)]
pub struct DatasetSplit {
    samples: ArrayD<f32>,
    labels: Vec<usize>,
    tasks: Vec<usize>,
}

impl DatasetSplit {
    pub fn new(samples: ArrayD<f32>, labels: Vec<usize>, tasks: Vec<usize>) -> Result<Self> {
        let batch = Batch::new(samples, labels, tasks)?;
        Ok(Self {
            samples: batch.samples,
            labels: batch.labels,
            tasks: batch.tasks,
        })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    fn gather(&self, indices: &[usize]) -> Batch {
        Batch {
            samples: self.samples.select(Axis(0), indices),
            labels: indices.iter().map(|&i| self.labels[i]).collect(),
            tasks: indices.iter().map(|&i| self.tasks[i]).collect(),
        }
    }
}

/// In-memory train/test splits served in fixed-size batches.
pub struct InMemoryMtl {
    train: DatasetSplit,
    test: DatasetSplit,
    batch_size: usize,
    shuffle: bool,
    num_tasks: usize,
    phase: Phase,
    order: Vec<usize>,
    cursor: usize,
    rng: StdRng,
}

impl InMemoryMtl {
    pub fn new(train: DatasetSplit, test: DatasetSplit, batch_size: usize, seed: u64) -> Result<Self> {
        if batch_size == 0 {
            return Err(RoutingError::Dataset("batch size must be positive".to_string()));
        }
        let (train_shape, test_shape) = (train.samples.shape().get(1..), test.samples.shape().get(1..));
        if train_shape != test_shape {
            return Err(RoutingError::shape("test sample shape", train_shape, test_shape));
        }
        let num_tasks = train
            .tasks
            .iter()
            .chain(&test.tasks)
            .max()
            .map_or(0, |&t| t + 1);
        let mut dataset = Self {
            train,
            test,
            batch_size,
            shuffle: true,
            num_tasks,
            phase: Phase::Train,
            order: Vec::new(),
            cursor: 0,
            rng: StdRng::seed_from_u64(seed),
        };
        dataset.rewind();
        Ok(dataset)
    }

    /// Shuffle training samples at the start of each epoch (default on).
    pub fn with_shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self.rewind();
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn train_len(&self) -> usize {
        self.train.len()
    }

    pub fn test_len(&self) -> usize {
        self.test.len()
    }

    fn split(&self) -> &DatasetSplit {
        match self.phase {
            Phase::Train => &self.train,
            Phase::Test => &self.test,
        }
    }

    fn rewind(&mut self) {
        self.order = (0..self.split().len()).collect();
        if self.shuffle && self.phase == Phase::Train {
            self.order.shuffle(&mut self.rng);
        }
        self.cursor = 0;
    }
}

impl MultiTaskDataset for InMemoryMtl {
    fn enter_train_mode(&mut self) {
        self.phase = Phase::Train;
        self.rewind();
    }

    fn enter_test_mode(&mut self) {
        self.phase = Phase::Test;
        self.rewind();
    }

    fn get_batch(&mut self) -> Option<Batch> {
        if self.cursor >= self.order.len() {
            debug!(phase = ?self.phase, "end of epoch");
            self.rewind();
            return None;
        }
        let end = (self.cursor + self.batch_size).min(self.order.len());
        let batch = self.split().gather(&self.order[self.cursor..end]);
        self.cursor = end;
        Some(batch)
    }

    fn num_tasks(&self) -> usize {
        self.num_tasks
    }
}

/// Shape of a generated multi-task problem
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntheticConfig {
    #[serde(default = "default_num_tasks")]
    pub num_tasks: usize,

    #[serde(default = "default_num_classes")]
    pub num_classes: usize,

    #[serde(default = "default_channels")]
    pub channels: usize,

    /// Height and width of the square images
    #[serde(default = "default_image_size")]
    pub image_size: usize,

    #[serde(default = "default_train_per_task")]
    pub train_per_task: usize,

    #[serde(default = "default_test_per_task")]
    pub test_per_task: usize,

    /// Amplitude of the uniform noise added to every pixel
    #[serde(default = "default_noise")]
    pub noise: f64,
}

fn default_num_tasks() -> usize {
    4
}
fn default_num_classes() -> usize {
    2
}
fn default_channels() -> usize {
    1
}
fn default_image_size() -> usize {
    16
}
fn default_train_per_task() -> usize {
    64
}
fn default_test_per_task() -> usize {
    16
}
fn default_noise() -> f64 {
    0.5
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            num_tasks: default_num_tasks(),
            num_classes: default_num_classes(),
            channels: default_channels(),
            image_size: default_image_size(),
            train_per_task: default_train_per_task(),
            test_per_task: default_test_per_task(),
            noise: default_noise(),
        }
    }
}

/// Generated multi-task image classification.
///
/// Every `(task, class)` pair owns a random prototype image; a sample is its
/// prototype plus uniform noise. Tasks share nothing, so a per-task or
/// well-routed model can separate them.
pub struct SyntheticMtl;

impl SyntheticMtl {
    pub fn generate(config: &SyntheticConfig, batch_size: usize, seed: u64) -> Result<InMemoryMtl> {
        if config.num_tasks == 0 || config.num_classes == 0 || config.image_size == 0 {
            return Err(RoutingError::Dataset(
                "synthetic dataset needs tasks, classes and a non-empty image".to_string(),
            ));
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let (c, s) = (config.channels, config.image_size);
        let prototypes: Vec<Vec<ArrayD<f32>>> = (0..config.num_tasks)
            .map(|_| {
                (0..config.num_classes)
                    .map(|_| ArrayD::from_shape_fn(IxDyn(&[c, s, s]), |_| rng.gen_range(-1.0..1.0)))
                    .collect()
            })
            .collect();

        let mut split = |per_task: usize| -> Result<DatasetSplit> {
            let n = per_task * config.num_tasks;
            let mut samples = ArrayD::zeros(IxDyn(&[n, c, s, s]));
            let mut labels = Vec::with_capacity(n);
            let mut tasks = Vec::with_capacity(n);
            for i in 0..n {
                let task = i % config.num_tasks;
                let label = rng.gen_range(0..config.num_classes);
                let noise = config.noise;
                let sample = prototypes[task][label]
                    .mapv(|v| v + (noise * rng.gen_range(-1.0..1.0)) as f32);
                samples.index_axis_mut(Axis(0), i).assign(&sample);
                labels.push(label);
                tasks.push(task);
            }
            DatasetSplit::new(samples, labels, tasks)
        };
        let train = split(config.train_per_task)?;
        let test = split(config.test_per_task)?;

        info!(
            tasks = config.num_tasks,
            classes = config.num_classes,
            train = train.len(),
            test = test.len(),
            "Generated synthetic multi-task dataset"
        );
        InMemoryMtl::new(train, test, batch_size, seed)
    }
}
