//! Plain (non-routing) layers with hand-written backward passes
//!
//! Every layer caches what its backward pass needs during `forward`, so a
//! `backward` call always refers to the most recent `forward`.

use ndarray::{Array2, ArrayD, Axis, Ix2};
use rand::Rng;

use crate::error::{Result, RoutingError};
use crate::ops::as_matrix;
use crate::param::{fan_in_bound, Param};

/// A differentiable transformation of a batch tensor.
pub trait Layer: Send {
    /// Layer name used in logs and errors
    fn name(&self) -> &str;

    /// Forward pass; caches state for the following `backward`.
    fn forward(&mut self, x: &ArrayD<f32>) -> Result<ArrayD<f32>>;

    /// Accumulate parameter gradients and return the gradient w.r.t. the input.
    fn backward(&mut self, grad: &ArrayD<f32>) -> Result<ArrayD<f32>>;

    /// Visit every learnable parameter.
    fn visit_params(&mut self, _f: &mut dyn FnMut(&mut Param)) {}

    /// Switch between training and evaluation behaviour.
    fn set_training(&mut self, _training: bool) {}

    /// Number of scalar parameters
    fn num_parameters(&mut self) -> usize {
        let mut n = 0;
        self.visit_params(&mut |p| n += p.len());
        n
    }
}

fn not_run(name: &str) -> RoutingError {
    RoutingError::Internal(format!("{name}: backward called before forward"))
}

/// Fully connected layer `y = x W^T + b`.
pub struct Linear {
    weight: Param,
    bias: Param,
    in_features: usize,
    out_features: usize,
    cached_input: Option<Array2<f32>>,
}

impl Linear {
    pub fn new<R: Rng + ?Sized>(in_features: usize, out_features: usize, rng: &mut R) -> Self {
        let bound = fan_in_bound(in_features);
        Self {
            weight: Param::uniform(&[out_features, in_features], bound, rng),
            bias: Param::uniform(&[out_features], bound, rng),
            in_features,
            out_features,
            cached_input: None,
        }
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    pub fn weight(&self) -> &Param {
        &self.weight
    }

    pub fn bias(&self) -> &Param {
        &self.bias
    }

    fn weight_matrix(&self) -> Result<ndarray::ArrayView2<'_, f32>> {
        Ok(self.weight.value.view().into_dimensionality::<Ix2>()?)
    }
}

impl Layer for Linear {
    fn name(&self) -> &str {
        "linear"
    }

    fn forward(&mut self, x: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let x = as_matrix(x, "linear")?;
        if x.ncols() != self.in_features {
            return Err(RoutingError::shape("linear input", self.in_features, x.ncols()));
        }
        let w = self.weight_matrix()?;
        let b = self.bias.value.view().into_dimensionality::<ndarray::Ix1>()?;
        let y = x.dot(&w.t()) + &b;
        self.cached_input = Some(x.to_owned());
        Ok(y.into_dyn())
    }

    fn backward(&mut self, grad: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let input = self.cached_input.as_ref().ok_or_else(|| not_run("linear"))?;
        let g = as_matrix(grad, "linear grad")?;
        if g.nrows() != input.nrows() || g.ncols() != self.out_features {
            return Err(RoutingError::shape(
                "linear grad",
                (input.nrows(), self.out_features),
                g.dim(),
            ));
        }
        let dw = g.t().dot(input);
        self.weight.grad += &dw.into_dyn();
        self.bias.grad += &g.sum_axis(Axis(0)).into_dyn();
        let dx = g.dot(&self.weight_matrix()?);
        Ok(dx.into_dyn())
    }

    fn visit_params(&mut self, f: &mut dyn FnMut(&mut Param)) {
        f(&mut self.weight);
        f(&mut self.bias);
    }
}

/// Elementwise `max(x, 0)`.
#[derive(Default)]
pub struct Relu {
    mask: Option<ArrayD<f32>>,
}

impl Relu {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Layer for Relu {
    fn name(&self) -> &str {
        "relu"
    }

    fn forward(&mut self, x: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        self.mask = Some(x.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 }));
        Ok(x.mapv(|v| v.max(0.0)))
    }

    fn backward(&mut self, grad: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let mask = self.mask.as_ref().ok_or_else(|| not_run("relu"))?;
        if mask.shape() != grad.shape() {
            return Err(RoutingError::shape("relu grad", mask.shape(), grad.shape()));
        }
        Ok(grad * mask)
    }
}

/// Linear layer followed by a ReLU.
pub struct LinearWithRelu {
    linear: Linear,
    relu: Relu,
}

impl LinearWithRelu {
    pub fn new<R: Rng + ?Sized>(in_features: usize, out_features: usize, rng: &mut R) -> Self {
        Self {
            linear: Linear::new(in_features, out_features, rng),
            relu: Relu::new(),
        }
    }
}

impl Layer for LinearWithRelu {
    fn name(&self) -> &str {
        "linear_relu"
    }

    fn forward(&mut self, x: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let y = self.linear.forward(x)?;
        self.relu.forward(&y)
    }

    fn backward(&mut self, grad: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let g = self.relu.backward(grad)?;
        self.linear.backward(&g)
    }

    fn visit_params(&mut self, f: &mut dyn FnMut(&mut Param)) {
        self.linear.visit_params(f);
    }
}

/// Collapse every non-batch dimension.
#[derive(Default)]
pub struct Flatten {
    input_shape: Option<Vec<usize>>,
}

impl Flatten {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Layer for Flatten {
    fn name(&self) -> &str {
        "flatten"
    }

    fn forward(&mut self, x: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let batch = x.shape().first().copied().unwrap_or(0);
        let features = if batch == 0 { 0 } else { x.len() / batch };
        self.input_shape = Some(x.shape().to_vec());
        let flat = x
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order((batch, features))?;
        Ok(flat.into_dyn())
    }

    fn backward(&mut self, grad: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let shape = self.input_shape.clone().ok_or_else(|| not_run("flatten"))?;
        Ok(grad
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order(ndarray::IxDyn(&shape))?)
    }
}

/// Plain sequential container.
pub struct LayerStack {
    name: String,
    layers: Vec<Box<dyn Layer>>,
}

impl LayerStack {
    pub fn new(name: impl Into<String>, layers: Vec<Box<dyn Layer>>) -> Self {
        Self {
            name: name.into(),
            layers,
        }
    }

    pub fn push(&mut self, layer: Box<dyn Layer>) {
        self.layers.push(layer);
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl Layer for LayerStack {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&mut self, x: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let mut y = x.clone();
        for layer in &mut self.layers {
            y = layer.forward(&y)?;
        }
        Ok(y)
    }

    fn backward(&mut self, grad: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let mut g = grad.clone();
        for layer in self.layers.iter_mut().rev() {
            g = layer.backward(&g)?;
        }
        Ok(g)
    }

    fn visit_params(&mut self, f: &mut dyn FnMut(&mut Param)) {
        for layer in &mut self.layers {
            layer.visit_params(f);
        }
    }

    fn set_training(&mut self, training: bool) {
        for layer in &mut self.layers {
            layer.set_training(training);
        }
    }
}
