//! Entry point of the routing triplet

use ndarray::ArrayD;

use routenet_core::{Result, RoutingError};

use crate::meta::{Actions, RoutingMeta};

/// Creates the `(y, meta, actions)` triplet for a batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct Initialization;

impl Initialization {
    pub fn new() -> Self {
        Self
    }

    /// One empty trajectory per sample; the initial actions are the task
    /// labels, or all zeros when no tasks are given.
    pub fn forward(&self, y: &ArrayD<f32>, tasks: &[usize]) -> Result<(ArrayD<f32>, RoutingMeta, Actions)> {
        let batch = y.shape().first().copied().unwrap_or(0);
        let tasks = if tasks.is_empty() {
            vec![0; batch]
        } else if tasks.len() == batch {
            tasks.to_vec()
        } else {
            return Err(RoutingError::shape("initialization tasks", batch, tasks.len()));
        };
        let meta = RoutingMeta::new(&tasks);
        Ok((y.clone(), meta, tasks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;

    #[test]
    fn test_initialization_uses_tasks() {
        let y = ArrayD::<f32>::zeros(IxDyn(&[3, 2]));
        let (out, meta, actions) = Initialization::new().forward(&y, &[1, 0, 2]).unwrap();
        assert_eq!(out.shape(), &[3, 2]);
        assert_eq!(actions, vec![1, 0, 2]);
        assert_eq!(meta.tasks(), vec![1, 0, 2]);
    }

    #[test]
    fn test_initialization_without_tasks() {
        let y = ArrayD::<f32>::zeros(IxDyn(&[2, 2]));
        let (_, meta, actions) = Initialization::new().forward(&y, &[]).unwrap();
        assert_eq!(actions, vec![0, 0]);
        assert_eq!(meta.len(), 2);
    }

    #[test]
    fn test_initialization_task_count_mismatch() {
        let y = ArrayD::<f32>::zeros(IxDyn(&[2, 2]));
        assert!(Initialization::new().forward(&y, &[1]).is_err());
    }
}
