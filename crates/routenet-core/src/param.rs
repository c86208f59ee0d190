//! Learnable parameters with accumulated gradients

use ndarray::{ArrayD, IxDyn};
use rand::Rng;

/// A learnable tensor and the gradient accumulated for it since the last
/// `zero_grad`.
#[derive(Debug, Clone)]
pub struct Param {
    pub value: ArrayD<f32>,
    pub grad: ArrayD<f32>,
}

impl Param {
    pub fn new(value: ArrayD<f32>) -> Self {
        let grad = ArrayD::zeros(value.raw_dim());
        Self { value, grad }
    }

    pub fn zeros(shape: &[usize]) -> Self {
        Self::new(ArrayD::zeros(IxDyn(shape)))
    }

    pub fn filled(shape: &[usize], value: f32) -> Self {
        Self::new(ArrayD::from_elem(IxDyn(shape), value))
    }

    /// Uniform init in `[-bound, bound]`
    pub fn uniform<R: Rng + ?Sized>(shape: &[usize], bound: f32, rng: &mut R) -> Self {
        let value = ArrayD::from_shape_fn(IxDyn(shape), |_| rng.gen_range(-bound..=bound));
        Self::new(value)
    }

    pub fn zero_grad(&mut self) {
        self.grad.fill(0.0);
    }

    pub fn grad_norm_sq(&self) -> f32 {
        self.grad.iter().map(|g| g * g).sum()
    }

    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    pub fn shape(&self) -> &[usize] {
        self.value.shape()
    }
}

/// Bound used by PyTorch's default linear/conv init.
pub fn fan_in_bound(fan_in: usize) -> f32 {
    if fan_in == 0 {
        0.0
    } else {
        1.0 / (fan_in as f32).sqrt()
    }
}
