//! Plain SGD and global gradient-norm clipping

use serde::{Deserialize, Serialize};

use crate::param::Param;

/// Stochastic gradient descent without momentum.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sgd {
    lr: f32,
}

impl Sgd {
    pub fn new(lr: f32) -> Self {
        Self { lr }
    }

    pub fn lr(&self) -> f32 {
        self.lr
    }

    pub fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }

    /// `value -= lr * grad`
    pub fn step(&self, param: &mut Param) {
        let lr = self.lr;
        param
            .value
            .zip_mut_with(&param.grad, |v, g| *v -= lr * g);
    }
}

/// Accumulates the squared norm of every gradient it is shown, then rescales.
///
/// Usage is two passes over the same parameters: `observe` each one, then
/// `apply` each one.
#[derive(Debug, Clone, Copy)]
pub struct GradClipper {
    max_norm: f32,
    norm_sq: f32,
}

impl GradClipper {
    pub fn new(max_norm: f32) -> Self {
        Self {
            max_norm,
            norm_sq: 0.0,
        }
    }

    pub fn observe(&mut self, param: &Param) {
        self.norm_sq += param.grad_norm_sq();
    }

    /// Total L2 norm seen so far
    pub fn total_norm(&self) -> f32 {
        self.norm_sq.sqrt()
    }

    /// Scale factor applied by `apply` (1.0 when no clipping is needed)
    pub fn scale(&self) -> f32 {
        let norm = self.total_norm();
        if norm > self.max_norm {
            self.max_norm / (norm + 1e-6)
        } else {
            1.0
        }
    }

    pub fn apply(&self, param: &mut Param) {
        let scale = self.scale();
        if scale < 1.0 {
            param.grad.mapv_inplace(|g| g * scale);
        }
    }
}
