//! Loss function(s)

use ndarray::Array2;

use crate::{
    backprop_fns::BackpropFunc,
    tensor::{Tensor, TensorError},
};

/// Squared error between two batches, averaged over every entry and halved
pub struct SquareLoss;

impl SquareLoss {
    pub fn call(y_pred: &Tensor, y_true: &Tensor) -> Result<Tensor, TensorError> {
        if y_pred.shape() != y_true.shape() {
            return Err(TensorError::ShapeMismatch {
                op: "square_loss",
                left: y_pred.shape(),
                right: y_true.shape(),
            });
        }
        let loss = {
            let diff = &*y_pred.data_ref() - &*y_true.data_ref();
            diff.mapv(|v| v * v).mean().ok_or(TensorError::EmptyShape)? / 2.0
        };
        Ok(Tensor::new_derived(
            Array2::from_elem((1, 1), loss),
            BackpropFunc::SquareLoss,
            &[y_pred, y_true],
        ))
    }
}

/// Softmax cross-entropy between logits and a batch of label distributions (usually one-hot rows)
pub struct SoftmaxLoss;

impl SoftmaxLoss {
    pub fn call(logits: &Tensor, labels: &Tensor) -> Result<Tensor, TensorError> {
        if logits.shape() != labels.shape() {
            return Err(TensorError::ShapeMismatch {
                op: "softmax_loss",
                left: logits.shape(),
                right: labels.shape(),
            });
        }
        let loss = {
            let labels = labels.data_ref();
            if labels.is_empty() {
                return Err(TensorError::EmptyShape);
            }
            let valid = labels.iter().all(|&v| v >= 0.0)
                && labels.rows().into_iter().all(|row| (row.sum() - 1.0).abs() < 1e-5);
            if !valid {
                return Err(TensorError::InvalidLabels);
            }
            let log_probs = log_softmax(&logits.data_ref());
            -(&*labels * &log_probs).sum() / labels.nrows() as f32
        };
        Ok(Tensor::new_derived(
            Array2::from_elem((1, 1), loss),
            BackpropFunc::SoftmaxLoss,
            &[logits, labels],
        ))
    }
}

/// Row-wise log of the softmax, shifted by the row maximum to stay finite for large logits
pub fn log_softmax(logits: &Array2<f32>) -> Array2<f32> {
    let mut out = logits.clone();
    for mut row in out.rows_mut() {
        let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        let ln_sum = row.mapv(|v| (v - max).exp()).sum().ln();
        row.mapv_inplace(|v| (v - max) - ln_sum);
    }
    out
}
