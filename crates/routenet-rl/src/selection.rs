//! Selection layers: apply, per sample, the module chosen by the preceding decision

use std::collections::BTreeMap;

use ndarray::{ArrayD, Axis, IxDyn};

use routenet_core::{Layer, Param, Result, RoutingError};

use crate::layer::{RoutingLayer, RoutingLayerKind, SelectionLog};
use crate::meta::{Actions, RoutingMeta};

/// A bank of parallel modules; sample `i` goes through module `actions[i]`.
pub struct Selection {
    modules: Vec<Box<dyn Layer>>,
    /// (module, sample indices) per module used in the last forward
    groups: Vec<(usize, Vec<usize>)>,
    input_shape: Vec<usize>,
    logging: bool,
    log: SelectionLog,
}

impl Selection {
    pub fn new(modules: Vec<Box<dyn Layer>>) -> Self {
        Self {
            modules,
            groups: Vec::new(),
            input_shape: Vec::new(),
            logging: false,
            log: SelectionLog::default(),
        }
    }

    pub fn num_modules(&self) -> usize {
        self.modules.len()
    }

    fn group_by_action(&self, actions: &[usize]) -> Result<Vec<(usize, Vec<usize>)>> {
        let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (i, &a) in actions.iter().enumerate() {
            if a >= self.modules.len() {
                return Err(RoutingError::InvalidAction {
                    action: a,
                    choices: self.modules.len(),
                });
            }
            groups.entry(a).or_default().push(i);
        }
        Ok(groups.into_iter().collect())
    }
}

/// Write `rows` of `src` into `dst` at the given batch positions.
fn scatter_rows(dst: &mut ArrayD<f32>, rows: &[usize], src: &ArrayD<f32>) {
    for (k, &i) in rows.iter().enumerate() {
        dst.index_axis_mut(Axis(0), i).assign(&src.index_axis(Axis(0), k));
    }
}

impl RoutingLayer for Selection {
    fn name(&self) -> &str {
        "selection"
    }

    fn kind(&self) -> RoutingLayerKind {
        RoutingLayerKind::Selection
    }

    fn forward(
        &mut self,
        y: &ArrayD<f32>,
        _meta: &mut RoutingMeta,
        actions: &[usize],
    ) -> Result<(ArrayD<f32>, Actions)> {
        let batch = y.shape().first().copied().unwrap_or(0);
        if actions.len() != batch {
            return Err(RoutingError::shape("selection actions", batch, actions.len()));
        }
        let groups = self.group_by_action(actions)?;

        let mut output: Option<ArrayD<f32>> = None;
        for (module, rows) in &groups {
            let sub = y.select(Axis(0), rows);
            let out = self.modules[*module].forward(&sub)?;
            let out_rows = output.get_or_insert_with(|| {
                let mut shape = out.shape().to_vec();
                shape[0] = batch;
                ArrayD::zeros(IxDyn(&shape))
            });
            if out_rows.shape()[1..] != out.shape()[1..] {
                return Err(RoutingError::shape(
                    "selection module output",
                    &out_rows.shape()[1..],
                    &out.shape()[1..],
                ));
            }
            scatter_rows(out_rows, rows, &out);
            if self.logging {
                *self.log.counts.entry(*module).or_default() += rows.len();
            }
        }

        let output = match (output, self.modules.first_mut()) {
            (Some(out), _) => out,
            // empty batch: module 0 still fixes the output width
            (None, Some(module)) => module.forward(y)?,
            (None, None) => y.clone(),
        };

        self.input_shape = y.shape().to_vec();
        self.groups = groups;
        Ok((output, actions.to_vec()))
    }

    fn backward(&mut self, grad: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let mut dx = ArrayD::zeros(IxDyn(&self.input_shape));
        for (module, rows) in &self.groups {
            let sub = grad.select(Axis(0), rows);
            let dsub = self.modules[*module].backward(&sub)?;
            scatter_rows(&mut dx, rows, &dsub);
        }
        Ok(dx)
    }

    fn visit_params(&mut self, f: &mut dyn FnMut(&mut Param)) {
        for module in &mut self.modules {
            module.visit_params(f);
        }
    }

    fn set_training(&mut self, training: bool) {
        for module in &mut self.modules {
            module.set_training(training);
        }
    }

    fn start_logging_selections(&mut self) {
        self.logging = true;
        self.log = SelectionLog::default();
    }

    fn stop_logging_and_get_selections(&mut self) -> Option<SelectionLog> {
        self.logging = false;
        Some(std::mem::take(&mut self.log))
    }
}
