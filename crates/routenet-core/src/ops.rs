//! Numeric helpers shared by layers, decisions and losses

use ndarray::{Array1, Array2, ArrayD, ArrayView1, ArrayView2, Axis, Ix2};

use crate::error::{Result, RoutingError};

/// View a batch tensor as `[batch, features]`.
pub fn as_matrix<'a>(x: &'a ArrayD<f32>, context: &str) -> Result<ArrayView2<'a, f32>> {
    x.view()
        .into_dimensionality::<Ix2>()
        .map_err(|_| RoutingError::shape(context, "[batch, features]", x.shape()))
}

/// Numerically stable softmax of one row.
pub fn softmax_row(row: ArrayView1<f32>) -> Array1<f32> {
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exp = row.mapv(|v| (v - max).exp());
    let sum = exp.sum();
    exp / sum
}

pub fn log_softmax_row(row: ArrayView1<f32>) -> Array1<f32> {
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let log_sum = row.iter().map(|v| (v - max).exp()).sum::<f32>().ln() + max;
    row.mapv(|v| v - log_sum)
}

/// Index of the largest element (first one on ties, 0 for an empty row).
pub fn argmax(row: ArrayView1<f32>) -> usize {
    row.iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(best_i, best_v), (i, &v)| {
            if v > best_v {
                (i, v)
            } else {
                (best_i, best_v)
            }
        })
        .0
}

pub fn one_hot(labels: &[usize], width: usize) -> Result<Array2<f32>> {
    let mut oh = Array2::zeros((labels.len(), width));
    for (i, &label) in labels.iter().enumerate() {
        if label >= width {
            return Err(RoutingError::InvalidAction {
                action: label,
                choices: width,
            });
        }
        oh[[i, label]] = 1.0;
    }
    Ok(oh)
}

/// Mean squared error over all elements, with its gradient w.r.t. `pred`.
pub fn mse_loss(pred: ArrayView2<f32>, target: ArrayView2<f32>) -> Result<(f32, Array2<f32>)> {
    if pred.shape() != target.shape() {
        return Err(RoutingError::shape("mse_loss", target.shape(), pred.shape()));
    }
    let n = pred.len().max(1) as f32;
    let diff = &pred - &target;
    let loss = diff.iter().map(|d| d * d).sum::<f32>() / n;
    Ok((loss, diff * (2.0 / n)))
}

/// Per-sample mean squared error (one value per row).
pub fn mse_per_sample(pred: ArrayView2<f32>, target: ArrayView2<f32>) -> Result<Array1<f32>> {
    if pred.shape() != target.shape() {
        return Err(RoutingError::shape("mse_per_sample", target.shape(), pred.shape()));
    }
    let diff = &pred - &target;
    Ok(diff.mapv(|d| d * d).mean_axis(Axis(1)).unwrap_or_else(|| Array1::zeros(pred.nrows())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, IxDyn};

    #[test]
    fn test_softmax_sums_to_one() {
        let p = softmax_row(array![1.0, 2.0, 3.0].view());
        assert!((p.sum() - 1.0).abs() < 1e-6);
        assert!(p[2] > p[1] && p[1] > p[0]);
    }

    #[test]
    fn test_log_softmax_matches_softmax() {
        let row = array![0.5, -1.0, 2.0];
        let p = softmax_row(row.view());
        let lp = log_softmax_row(row.view());
        for i in 0..3 {
            assert!((lp[i].exp() - p[i]).abs() < 1e-6);
        }
    }

    #[test]
    fn test_softmax_large_values() {
        let p = softmax_row(array![1000.0, 1000.0].view());
        assert!((p[0] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_argmax() {
        assert_eq!(argmax(array![0.1, 0.7, 0.2].view()), 1);
        assert_eq!(argmax(array![0.5, 0.5].view()), 0);
    }

    #[test]
    fn test_one_hot() {
        let oh = one_hot(&[2, 0], 3).unwrap();
        assert_eq!(oh, array![[0.0, 0.0, 1.0], [1.0, 0.0, 0.0]]);
        assert!(one_hot(&[3], 3).is_err());
    }

    #[test]
    fn test_mse_loss_and_grad() {
        let pred = array![[1.0, 0.0], [0.0, 0.0]];
        let target = array![[0.0, 0.0], [0.0, 0.0]];
        let (loss, grad) = mse_loss(pred.view(), target.view()).unwrap();
        assert_eq!(loss, 0.25);
        assert_eq!(grad[[0, 0]], 0.5);
        assert_eq!(grad[[1, 1]], 0.0);
    }

    #[test]
    fn test_mse_per_sample() {
        let pred = array![[1.0, 1.0], [0.0, 2.0]];
        let target = array![[1.0, 1.0], [0.0, 0.0]];
        let per = mse_per_sample(pred.view(), target.view()).unwrap();
        assert_eq!(per, array![0.0, 2.0]);
    }

    #[test]
    fn test_as_matrix_rejects_images() {
        let x = ArrayD::<f32>::zeros(IxDyn(&[2, 1, 3, 3]));
        assert!(as_matrix(&x, "test").is_err());
    }
}
