//! Sequential routing container
//!
//! Threads the `(y, meta, actions)` triplet through a mixed list of plain
//! and routing layers, starting from an implicit `Initialization`. Actions
//! have to be consumed by the very next routing layer, so delayed or fan-out
//! ("dispatched") routing cannot be expressed with this container.

use std::any::Any;

use ndarray::ArrayD;

use routenet_core::{Layer, Param, Result, RoutingError};

use crate::initialization::Initialization;
use crate::layer::{ParamGroup, RoutingLayer, SelectionLog};
use crate::meta::RoutingMeta;

/// One entry of a `Sequential`
pub enum SequentialLayer {
    /// Sees only the tensor; metadata and actions pass around it
    Plain(Box<dyn Layer>),
    /// Sees the whole triplet
    Routing(Box<dyn RoutingLayer>),
}

impl SequentialLayer {
    pub fn plain(layer: impl Layer + 'static) -> Self {
        SequentialLayer::Plain(Box::new(layer))
    }

    pub fn routing(layer: impl RoutingLayer + 'static) -> Self {
        SequentialLayer::Routing(Box::new(layer))
    }

    /// Classify a type-erased layer.
    ///
    /// Accepts `Box<dyn Layer>`, `Box<dyn RoutingLayer>` or an existing
    /// `SequentialLayer`; anything else is `UnsupportedLayer`.
    pub fn from_any(layer: Box<dyn Any + Send>) -> Result<Self> {
        let layer = match layer.downcast::<SequentialLayer>() {
            Ok(l) => return Ok(*l),
            Err(other) => other,
        };
        let layer = match layer.downcast::<Box<dyn RoutingLayer>>() {
            Ok(l) => return Ok(SequentialLayer::Routing(*l)),
            Err(other) => other,
        };
        match layer.downcast::<Box<dyn Layer>>() {
            Ok(l) => Ok(SequentialLayer::Plain(*l)),
            Err(_) => Err(RoutingError::UnsupportedLayer(
                "Sequential accepts only plain layers or routing layers".to_string(),
            )),
        }
    }

    fn name(&self) -> &str {
        match self {
            SequentialLayer::Plain(l) => l.name(),
            SequentialLayer::Routing(l) => l.name(),
        }
    }
}

/// Routing-aware sequential container
pub struct Sequential {
    initialization: Initialization,
    layers: Vec<SequentialLayer>,
}

impl Sequential {
    pub fn new(layers: Vec<SequentialLayer>) -> Self {
        Self {
            initialization: Initialization::new(),
            layers,
        }
    }

    /// Build from type-erased layers, rejecting anything that is neither form.
    pub fn from_any(layers: Vec<Box<dyn Any + Send>>) -> Result<Self> {
        let layers = layers
            .into_iter()
            .map(SequentialLayer::from_any)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(layers))
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn layer_names(&self) -> Vec<&str> {
        self.layers.iter().map(SequentialLayer::name).collect()
    }

    /// `x` has the batch dimension first; `tasks` holds one label per sample
    /// (or is empty).
    pub fn forward(&mut self, x: &ArrayD<f32>, tasks: &[usize]) -> Result<(ArrayD<f32>, RoutingMeta)> {
        let (mut y, mut meta, mut actions) = self.initialization.forward(x, tasks)?;
        for layer in &mut self.layers {
            match layer {
                SequentialLayer::Routing(l) => {
                    let (next_y, next_actions) = l.forward(&y, &mut meta, &actions)?;
                    y = next_y;
                    actions = next_actions;
                }
                SequentialLayer::Plain(l) => {
                    y = l.forward(&y)?;
                }
            }
        }
        Ok((y, meta))
    }

    pub fn backward(&mut self, grad: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let mut g = grad.clone();
        for layer in self.layers.iter_mut().rev() {
            g = match layer {
                SequentialLayer::Routing(l) => l.backward(&g)?,
                SequentialLayer::Plain(l) => l.backward(&g)?,
            };
        }
        Ok(g)
    }

    /// Sum of the routing losses of every decision in the container.
    pub fn routing_loss(&mut self, meta: &RoutingMeta) -> Result<f32> {
        let mut total = 0.0;
        for layer in &mut self.layers {
            if let SequentialLayer::Routing(l) = layer {
                total += l.routing_loss(meta)?;
            }
        }
        Ok(total)
    }

    pub fn visit_params(&mut self, group: ParamGroup, f: &mut dyn FnMut(&mut Param)) {
        for layer in &mut self.layers {
            match layer {
                SequentialLayer::Routing(l) => {
                    if group.includes(Some(l.kind())) {
                        l.visit_params(f);
                    }
                }
                SequentialLayer::Plain(l) => {
                    if group.includes(None) {
                        l.visit_params(f);
                    }
                }
            }
        }
    }

    pub fn set_training(&mut self, training: bool) {
        for layer in &mut self.layers {
            match layer {
                SequentialLayer::Routing(l) => l.set_training(training),
                SequentialLayer::Plain(l) => l.set_training(training),
            }
        }
    }

    pub fn start_logging_selections(&mut self) {
        for layer in &mut self.layers {
            if let SequentialLayer::Routing(l) = layer {
                l.start_logging_selections();
            }
        }
    }

    /// One log per selection layer, in order.
    pub fn stop_logging_selections(&mut self) -> Vec<SelectionLog> {
        self.layers
            .iter_mut()
            .filter_map(|layer| match layer {
                SequentialLayer::Routing(l) => l.stop_logging_and_get_selections(),
                SequentialLayer::Plain(_) => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::Reinforce;
    use crate::decision::{Decision, PerTaskAssignment, PolicyStorage};
    use crate::selection::Selection;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use routenet_core::{Linear, Relu};

    struct Scale(f32);

    impl Layer for Scale {
        fn name(&self) -> &str {
            "scale"
        }

        fn forward(&mut self, x: &ArrayD<f32>) -> Result<ArrayD<f32>> {
            Ok(x * self.0)
        }

        fn backward(&mut self, grad: &ArrayD<f32>) -> Result<ArrayD<f32>> {
            Ok(grad * self.0)
        }
    }

    fn per_task(num_tasks: usize) -> Sequential {
        let modules: Vec<Box<dyn Layer>> = (0..num_tasks)
            .map(|t| Box::new(Scale(t as f32 + 1.0)) as Box<dyn Layer>)
            .collect();
        Sequential::new(vec![
            SequentialLayer::routing(PerTaskAssignment::new()),
            SequentialLayer::routing(Selection::new(modules)),
            SequentialLayer::plain(Relu::new()),
        ])
    }

    #[test]
    fn test_forward_routes_by_task() {
        let mut seq = per_task(3);
        let x = array![[1.0], [1.0], [-1.0]].into_dyn();
        let (y, meta) = seq.forward(&x, &[0, 2, 1]).unwrap();
        assert_eq!(y, array![[1.0], [3.0], [0.0]].into_dyn());
        assert_eq!(meta.tasks(), vec![0, 2, 1]);
    }

    #[test]
    fn test_plain_layer_keeps_decision_actions() {
        let mut rng = StdRng::seed_from_u64(9);
        let mut decision = Decision::new(
            Box::new(Reinforce),
            2,
            1,
            2,
            PolicyStorage::Tabular,
            None,
            &mut rng,
        );
        // agent 0 prefers module 1, agent 1 prefers module 0
        let rows = [array![0.0, 5.0], array![5.0, 0.0]];
        let mut k = 0;
        decision.visit_params(&mut |p| {
            p.value.assign(&rows[k].view().into_dyn());
            k += 1;
        });

        let mut seq = Sequential::new(vec![
            SequentialLayer::routing(decision),
            SequentialLayer::plain(Scale(2.0)),
            SequentialLayer::routing(Selection::new(vec![
                Box::new(Scale(10.0)),
                Box::new(Scale(100.0)),
            ])),
        ]);
        seq.set_training(false);

        let x = array![[1.0], [1.0], [1.0]].into_dyn();
        let (y, meta) = seq.forward(&x, &[0, 1, 0]).unwrap();
        assert_eq!(y, array![[200.0], [20.0], [200.0]].into_dyn());
        let chosen: Vec<usize> = meta.samples().iter().map(|s| s.trajectory[0].action).collect();
        assert_eq!(chosen, vec![1, 0, 1]);
    }

    #[test]
    fn test_backward_runs_in_reverse() {
        let mut seq = per_task(2);
        let x = array![[1.0], [1.0]].into_dyn();
        seq.forward(&x, &[0, 1]).unwrap();
        let g = seq.backward(&array![[1.0], [1.0]].into_dyn()).unwrap();
        assert_eq!(g, array![[1.0], [2.0]].into_dyn());
    }

    #[test]
    fn test_from_any_rejects_unknown_layers() {
        let layers: Vec<Box<dyn Any + Send>> = vec![Box::new(42_u32)];
        let err = Sequential::from_any(layers).err().unwrap();
        assert!(matches!(err, RoutingError::UnsupportedLayer(_)));
    }

    #[test]
    fn test_from_any_accepts_both_forms() {
        let plain: Box<dyn Layer> = Box::new(Relu::new());
        let routing: Box<dyn RoutingLayer> = Box::new(PerTaskAssignment::new());
        let layers: Vec<Box<dyn Any + Send>> = vec![Box::new(routing), Box::new(plain)];
        let seq = Sequential::from_any(layers).unwrap();
        assert_eq!(seq.layer_names(), vec!["per_task_assignment", "relu"]);
    }

    #[test]
    fn test_param_groups_partition_parameters() {
        let mut rng = StdRng::seed_from_u64(4);
        let mut seq = Sequential::new(vec![
            SequentialLayer::routing(PerTaskAssignment::new()),
            SequentialLayer::routing(Selection::new(vec![
                Box::new(Linear::new(2, 2, &mut rng)),
                Box::new(Linear::new(2, 2, &mut rng)),
            ])),
            SequentialLayer::plain(Linear::new(2, 1, &mut rng)),
        ]);
        let mut all = 0;
        seq.visit_params(ParamGroup::All, &mut |p| all += p.len());
        let mut module = 0;
        seq.visit_params(ParamGroup::Module, &mut |p| module += p.len());
        let mut routing = 0;
        seq.visit_params(ParamGroup::Routing, &mut |p| routing += p.len());
        assert_eq!(all, 2 * (4 + 2) + 3);
        assert_eq!(module, all);
        assert_eq!(routing, 0);
    }

    #[test]
    fn test_selection_logs_collected() {
        let mut seq = per_task(3);
        seq.start_logging_selections();
        let x = array![[1.0], [1.0]].into_dyn();
        seq.forward(&x, &[0, 2]).unwrap();
        let logs = seq.stop_logging_selections();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].modules_used(), 2);
    }
}
